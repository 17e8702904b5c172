//! Volume evictor
//!
//! Moves volumes off nodes that were cordoned. For each volume with a
//! replica on such a node a `LocalVolumeMigrate` named `evictor-<volume>`
//! is created and protected by a finalizer until the migration completes.
//! Runs on the elected leader.

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::store::ObjectStore;
use crate::crd::{LocalVolumeMigrate, LocalVolumeMigrateSpec, OperationState};
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

pub const EVICTION_LABEL: &str = "hwameistor.io/eviction";
pub const EVICTION_DISABLED: &str = "disable";
pub const EVICTION_FINALIZER: &str = "hwameistor.io/eviction-protect";
pub const UNSCHEDULABLE_TAINT: &str = "node.kubernetes.io/unschedulable";
pub const MIGRATE_NAME_PREFIX: &str = "evictor-";

const NODE_KEY_PREFIX: &str = "node/";
const MIGRATE_KEY_PREFIX: &str = "migrate/";
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub fn migrate_name(volume: &str) -> String {
    format!("{}{}", MIGRATE_NAME_PREFIX, volume)
}

/// Whether a Kubernetes node asks for its volumes to be moved
pub fn needs_eviction(node: &Node) -> bool {
    if node.labels().get(EVICTION_LABEL).map(String::as_str) == Some(EVICTION_DISABLED) {
        return false;
    }
    let Some(spec) = node.spec.as_ref() else {
        return false;
    };
    if spec.unschedulable.unwrap_or(false) {
        return true;
    }
    spec.taints
        .iter()
        .flatten()
        .any(|t| t.key == UNSCHEDULABLE_TAINT && t.effect == "NoSchedule")
}

/// Eviction progress of one node, per volume
#[derive(Debug, Clone, Default)]
pub struct NodeEviction {
    pub volumes: BTreeMap<String, bool>,
}

impl NodeEviction {
    pub fn is_completed(&self) -> bool {
        self.volumes.values().all(|done| *done)
    }
}

pub struct Evictor {
    store: Arc<dyn ObjectStore>,
    queue: TaskQueue,
    records: DashMap<String, NodeEviction>,
}

impl Evictor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            queue: TaskQueue::new("evictor", 0),
            records: DashMap::new(),
        }
    }

    pub fn enqueue_node(&self, name: &str) {
        self.queue.add(format!("{}{}", NODE_KEY_PREFIX, name));
    }

    pub fn enqueue_migrate(&self, name: &str) {
        if name.starts_with(MIGRATE_NAME_PREFIX) {
            self.queue.add(format!("{}{}", MIGRATE_KEY_PREFIX, name));
        }
    }

    pub fn record(&self, node: &str) -> Option<NodeEviction> {
        self.records.get(node).map(|r| r.clone())
    }

    pub async fn reconcile_node(&self, name: &str) -> Result<()> {
        let Some(node) = self.store.get_k8s_node(name).await? else {
            self.records.remove(name);
            return Ok(());
        };
        if !needs_eviction(&node) {
            return Ok(());
        }

        let mut volumes: Vec<String> = self
            .store
            .list_replicas_by_node(name)
            .await?
            .into_iter()
            .map(|r| r.spec.volume_name)
            .collect();
        volumes.sort();
        volumes.dedup();

        for volume in volumes {
            let migrate = LocalVolumeMigrate {
                metadata: ObjectMeta {
                    name: Some(migrate_name(&volume)),
                    finalizers: Some(vec![EVICTION_FINALIZER.to_string()]),
                    ..Default::default()
                },
                spec: LocalVolumeMigrateSpec {
                    volume_name: volume.clone(),
                    source_node: name.to_string(),
                    target_nodes: vec![],
                    abort: false,
                },
                status: None,
            };
            match self.store.create_migrate(&migrate).await {
                Ok(_) => info!("Evicting volume {} from node {}", volume, name),
                Err(Error::ResourceConflict { .. }) => {
                    debug!("Migration for volume {} already exists", volume)
                }
                Err(e) => return Err(e),
            }
            self.records
                .entry(name.to_string())
                .or_default()
                .volumes
                .entry(volume)
                .or_insert(false);
        }
        Ok(())
    }

    pub async fn reconcile_migrate(&self, name: &str) -> Result<()> {
        let Some(migrate) = self.store.get_migrate(name).await? else {
            return Ok(());
        };
        let completed = migrate.status.as_ref().and_then(|s| s.state) == Some(OperationState::Completed);
        if !completed {
            return Ok(());
        }

        if migrate.finalizers().iter().any(|f| f == EVICTION_FINALIZER) {
            let mut updated = migrate.clone();
            updated
                .finalizers_mut()
                .retain(|f| f != EVICTION_FINALIZER);
            self.store.update_migrate(&updated).await?;
            info!("Eviction of volume {} completed", migrate.spec.volume_name);
        }
        if let Some(mut record) = self.records.get_mut(&migrate.spec.source_node) {
            if let Some(done) = record.volumes.get_mut(&migrate.spec.volume_name) {
                *done = true;
            }
        }
        Ok(())
    }

    /// Drop records of nodes whose volumes all moved
    pub fn prune(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_completed());
        before - self.records.len()
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        if let Some(name) = key.strip_prefix(NODE_KEY_PREFIX) {
            self.reconcile_node(name).await
        } else if let Some(name) = key.strip_prefix(MIGRATE_KEY_PREFIX) {
            self.reconcile_migrate(name).await
        } else {
            Ok(())
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        info!("Evictor started");
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => break,
                _ = prune.tick() => {
                    let pruned = self.prune();
                    if pruned > 0 {
                        debug!("Pruned {} completed eviction records", pruned);
                    }
                    continue;
                }
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if e.is_retryable() => {
                    warn!("Eviction {} failed, retrying: {}", key, e);
                    self.queue.add_rate_limited(key.clone());
                }
                Err(e) => {
                    warn!("Eviction {} failed: {}", key, e);
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }
        info!("Evictor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::memory::MemoryStore;
    use crate::controller::testing::pending_replica;
    use crate::crd::OperationStatus;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};

    fn node(name: &str, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_needs_eviction() {
        assert!(!needs_eviction(&node("n1", false)));
        assert!(needs_eviction(&node("n1", true)));

        let mut tainted = node("n1", false);
        tainted.spec.as_mut().unwrap().taints = Some(vec![Taint {
            key: UNSCHEDULABLE_TAINT.into(),
            effect: "NoSchedule".into(),
            ..Default::default()
        }]);
        assert!(needs_eviction(&tainted));

        let mut disabled = node("n1", true);
        disabled
            .labels_mut()
            .insert(EVICTION_LABEL.into(), EVICTION_DISABLED.into());
        assert!(!needs_eviction(&disabled));
    }

    #[tokio::test]
    async fn test_eviction_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        store.k8s_nodes.put(node("n1", true));
        store.replicas.put(pending_replica("pvc-1"));
        let evictor = Evictor::new(store.clone());

        evictor.reconcile_node("n1").await.unwrap();
        let migrate = store.migrates.get("evictor-pvc-1").unwrap();
        assert_eq!(migrate.spec.source_node, "n1");
        assert_eq!(migrate.finalizers(), &[EVICTION_FINALIZER.to_string()]);
        assert!(!evictor.record("n1").unwrap().is_completed());

        // Second pass is idempotent
        evictor.reconcile_node("n1").await.unwrap();
        assert_eq!(store.migrates.list().len(), 1);

        let mut done = migrate.clone();
        done.status = Some(OperationStatus {
            state: Some(OperationState::Completed),
            ..Default::default()
        });
        store.migrates.put(done);
        evictor.reconcile_migrate("evictor-pvc-1").await.unwrap();
        assert!(store.migrates.get("evictor-pvc-1").unwrap().finalizers().is_empty());
        assert!(evictor.record("n1").unwrap().is_completed());

        assert_eq!(evictor.prune(), 1);
        assert!(evictor.record("n1").is_none());
    }

    #[tokio::test]
    async fn test_schedulable_node_untouched() {
        let store = Arc::new(MemoryStore::new());
        store.k8s_nodes.put(node("n1", false));
        store.replicas.put(pending_replica("pvc-1"));
        Evictor::new(store.clone()).reconcile_node("n1").await.unwrap();
        assert!(store.migrates.list().is_empty());
    }
}
