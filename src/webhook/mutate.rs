//! Pod mutation
//!
//! Two patches are applied to pods that use HwameiStor volumes:
//!
//! - the pod is handed to the HwameiStor scheduler when any of its PVCs
//!   comes from a StorageClass whose provisioner ends with `hwameistor.io`;
//! - a data-loader init container is prepended when any PVC is bound to a
//!   PV annotated as an acceleration dataset.
//!
//! Mutating an already-mutated pod yields no patch.

use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, PersistentVolumeClaim,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::controller::store::ObjectStore;
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

pub const DEFAULT_SCHEDULER_NAME: &str = "hwameistor-scheduler";
pub const PROVISIONER_SUFFIX: &str = "hwameistor.io";
pub const DATASET_ANNOTATION: &str = "hwameistor.io/acceleration-dataset";
pub const DATALOADER_CONTAINER: &str = "hwameistor-dataloader";
pub const DATALOADER_IMAGE_ENV: &str = "DATALOADER_IMAGE";

/// What happens when a referenced object cannot be resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Skip the volume
    #[default]
    Ignore,
    /// Reject the pod
    Fail,
}

#[derive(Debug, Clone)]
pub struct MutateConfig {
    pub scheduler_name: String,
    pub failure_policy: FailurePolicy,
    pub dataloader_image: String,
}

impl Default for MutateConfig {
    fn default() -> Self {
        Self {
            scheduler_name: DEFAULT_SCHEDULER_NAME.to_string(),
            failure_policy: FailurePolicy::Ignore,
            dataloader_image: std::env::var(DATALOADER_IMAGE_ENV).unwrap_or_default(),
        }
    }
}

/// Which patches a pod needs, derived from its volumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VolumeUsage {
    hwameistor: bool,
    dataset: bool,
}

pub struct PodMutator {
    store: Arc<dyn ObjectStore>,
    config: MutateConfig,
}

impl PodMutator {
    pub fn new(store: Arc<dyn ObjectStore>, config: MutateConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MutateConfig {
        &self.config
    }

    fn unresolved(&self, what: String) -> Result<()> {
        match self.config.failure_policy {
            FailurePolicy::Ignore => {
                debug!("Skipping volume: {}", what);
                Ok(())
            }
            FailurePolicy::Fail => Err(Error::Admission(what)),
        }
    }

    async fn inspect_claim(&self, pvc: &PersistentVolumeClaim, usage: &mut VolumeUsage) -> Result<()> {
        let spec = pvc.spec.as_ref();
        if let Some(sc_name) = spec.and_then(|s| s.storage_class_name.as_deref()) {
            match self.store.get_storage_class(sc_name).await? {
                Some(sc) if sc.provisioner.ends_with(PROVISIONER_SUFFIX) => usage.hwameistor = true,
                Some(_) => {}
                None => self.unresolved(format!("storageclass {} not found", sc_name))?,
            }
        }
        if let Some(pv_name) = spec.and_then(|s| s.volume_name.as_deref()) {
            match self.store.get_pv(pv_name).await? {
                Some(pv) => {
                    if pv.annotations().get(DATASET_ANNOTATION).map(String::as_str) == Some("true") {
                        usage.dataset = true;
                    }
                }
                None => self.unresolved(format!("persistentvolume {} not found", pv_name))?,
            }
        }
        Ok(())
    }

    async fn usage(&self, pod: &Pod, namespace: &str) -> Result<VolumeUsage> {
        let mut usage = VolumeUsage::default();
        let volumes = pod.spec.iter().flat_map(|s| s.volumes.iter().flatten());
        for volume in volumes {
            let Some(claim) = volume.persistent_volume_claim.as_ref() else {
                continue;
            };
            match self.store.get_pvc(namespace, &claim.claim_name).await? {
                Some(pvc) => self.inspect_claim(&pvc, &mut usage).await?,
                None => self.unresolved(format!(
                    "persistentvolumeclaim {}/{} not found",
                    namespace, claim.claim_name
                ))?,
            }
        }
        Ok(usage)
    }

    fn dataloader(&self) -> Container {
        let field_env = |name: &str, path: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: path.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        Container {
            name: DATALOADER_CONTAINER.to_string(),
            image: Some(self.config.dataloader_image.clone()),
            env: Some(vec![
                field_env("NAMESPACE", "metadata.namespace"),
                field_env("MY_NODENAME", "spec.nodeName"),
            ]),
            ..Default::default()
        }
    }

    /// JSON patch operations for `pod`; empty when nothing changes
    pub async fn patch(&self, pod: &Pod, namespace: &str) -> Result<Vec<PatchOperation>> {
        let usage = self.usage(pod, namespace).await?;
        let Some(spec) = pod.spec.as_ref() else {
            return Ok(vec![]);
        };
        let mut ops = Vec::new();

        if usage.hwameistor {
            let value = serde_json::Value::String(self.config.scheduler_name.clone());
            match spec.scheduler_name.as_deref() {
                None | Some("") => ops.push(PatchOperation::Add(AddOperation {
                    path: "/spec/schedulerName".into(),
                    value,
                })),
                Some(name) if name != self.config.scheduler_name => {
                    ops.push(PatchOperation::Replace(ReplaceOperation {
                        path: "/spec/schedulerName".into(),
                        value,
                    }))
                }
                Some(_) => {}
            }
        }

        if usage.dataset {
            let present = spec
                .init_containers
                .iter()
                .flatten()
                .any(|c| c.name == DATALOADER_CONTAINER);
            if !present {
                let container = serde_json::to_value(self.dataloader())?;
                let op = match spec.init_containers {
                    None => AddOperation {
                        path: "/spec/initContainers".into(),
                        value: serde_json::Value::Array(vec![container]),
                    },
                    Some(_) => AddOperation {
                        path: "/spec/initContainers/0".into(),
                        value: container,
                    },
                };
                ops.push(PatchOperation::Add(op));
            }
        }
        Ok(ops)
    }

    /// Answer one AdmissionReview
    pub async fn review(&self, review: AdmissionReview<Pod>) -> AdmissionReview<DynamicObject> {
        let request: AdmissionRequest<Pod> = match review.try_into() {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid admission review: {}", e);
                return AdmissionResponse::invalid(e.to_string()).into_review();
            }
        };
        let response = AdmissionResponse::from(&request);
        let Some(pod) = request.object.as_ref() else {
            return response.into_review();
        };
        let namespace = request
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .unwrap_or_default();
        let name = pod.metadata.name.clone().or_else(|| pod.metadata.generate_name.clone());

        match self.patch(pod, &namespace).await {
            Ok(ops) if ops.is_empty() => response.into_review(),
            Ok(ops) => {
                info!("Mutating pod {}/{}: {} patch ops", namespace, name.unwrap_or_default(), ops.len());
                match response.clone().with_patch(json_patch::Patch(ops)) {
                    Ok(patched) => patched.into_review(),
                    Err(e) => response.deny(e.to_string()).into_review(),
                }
            }
            Err(e) => {
                warn!("Rejecting pod {}/{}: {}", namespace, name.unwrap_or_default(), e);
                response.deny(e.to_string()).into_review()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::memory::MemoryStore;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        PersistentVolume, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
        Volume,
    };
    use k8s_openapi::api::storage::v1::StorageClass;
    use kube::api::ObjectMeta;

    fn pod(claims: &[&str], scheduler: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                scheduler_name: scheduler.map(String::from),
                volumes: Some(
                    claims
                        .iter()
                        .map(|c| Volume {
                            name: c.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: c.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.storage_classes.put(StorageClass {
            metadata: ObjectMeta {
                name: Some("hwameistor-storage-lvm-hdd".into()),
                ..Default::default()
            },
            provisioner: "lvm.hwameistor.io".into(),
            ..Default::default()
        });
        store.storage_classes.put(StorageClass {
            metadata: ObjectMeta {
                name: Some("standard".into()),
                ..Default::default()
            },
            provisioner: "kubernetes.io/no-provisioner".into(),
            ..Default::default()
        });
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv-dataset".into());
        pv.annotations_mut().insert(DATASET_ANNOTATION.into(), "true".into());
        store.pvs.put(pv);

        for (name, sc, pv) in [
            ("data", "hwameistor-storage-lvm-hdd", None),
            ("plain", "standard", None),
            ("dataset", "standard", Some("pv-dataset")),
        ] {
            store.put_pvc(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(name.into()),
                    namespace: Some("default".into()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    storage_class_name: Some(sc.into()),
                    volume_name: pv.map(String::from),
                    ..Default::default()
                }),
                status: None,
            });
        }
        store
    }

    fn mutator(store: Arc<MemoryStore>, policy: FailurePolicy) -> PodMutator {
        PodMutator::new(
            store,
            MutateConfig {
                scheduler_name: DEFAULT_SCHEDULER_NAME.into(),
                failure_policy: policy,
                dataloader_image: "hwameistor/dataloader:v1".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_scheduler_patch() {
        let m = mutator(store(), FailurePolicy::Ignore);

        let ops = m.patch(&pod(&["data"], None), "default").await.unwrap();
        assert_matches!(&ops[..], [PatchOperation::Add(op)] if op.path == "/spec/schedulerName");

        let ops = m.patch(&pod(&["data"], Some("default-scheduler")), "default").await.unwrap();
        assert_matches!(&ops[..], [PatchOperation::Replace(_)]);

        let ops = m
            .patch(&pod(&["data"], Some(DEFAULT_SCHEDULER_NAME)), "default")
            .await
            .unwrap();
        assert!(ops.is_empty());

        let ops = m.patch(&pod(&["plain"], None), "default").await.unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn test_dataloader_patch() {
        let m = mutator(store(), FailurePolicy::Ignore);

        let ops = m.patch(&pod(&["dataset"], None), "default").await.unwrap();
        assert_matches!(&ops[..], [PatchOperation::Add(op)] if op.path == "/spec/initContainers");

        let mut with_init = pod(&["dataset"], None);
        with_init.spec.as_mut().unwrap().init_containers = Some(vec![Container {
            name: "setup".into(),
            ..Default::default()
        }]);
        let ops = m.patch(&with_init, "default").await.unwrap();
        assert_matches!(&ops[..], [PatchOperation::Add(op)] if op.path == "/spec/initContainers/0");

        let mut mutated = with_init.clone();
        mutated
            .spec
            .as_mut()
            .unwrap()
            .init_containers
            .as_mut()
            .unwrap()
            .insert(0, m.dataloader());
        assert!(m.patch(&mutated, "default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_policy() {
        let lenient = mutator(store(), FailurePolicy::Ignore);
        assert!(lenient.patch(&pod(&["missing"], None), "default").await.unwrap().is_empty());

        let strict = mutator(store(), FailurePolicy::Fail);
        assert_matches!(
            strict.patch(&pod(&["missing"], None), "default").await,
            Err(Error::Admission(_))
        );
    }

    fn admission_review(pod: &Pod) -> AdmissionReview<Pod> {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "3c1d",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {},
                "object": pod,
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_review_carries_json_patch() {
        let m = mutator(store(), FailurePolicy::Ignore);
        let answer = m.review(admission_review(&pod(&["data"], None))).await;
        let response = answer.response.unwrap();
        assert_eq!(response.uid, "3c1d");
        assert!(response.allowed);
        let patch: serde_json::Value = serde_json::from_slice(&response.patch.unwrap()).unwrap();
        assert_eq!(patch[0]["path"], "/spec/schedulerName");
        assert_eq!(patch[0]["value"], DEFAULT_SCHEDULER_NAME);

        let answer = m.review(admission_review(&pod(&["plain"], None))).await;
        assert!(answer.response.unwrap().patch.is_none());
    }
}
