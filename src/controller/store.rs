//! Object Store
//!
//! Declarative objects are read and written through [`ObjectStore`] so the
//! reconcilers can run against the API server ([`KubeStore`]) or an
//! in-memory store in tests. Status writes carry the object's resource
//! version; a stale write surfaces as [`Error::ResourceConflict`] and is
//! retried with a fresh read on the next pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::crd::{
    FaultTicket, LocalDisk, LocalDiskAction, LocalDiskClaim, LocalStorageNode, LocalVolume,
    LocalVolumeConvert, LocalVolumeExpand, LocalVolumeMigrate, LocalVolumeReplica, PhysicalDisk,
};
use crate::error::{Error, Result};

/// Access to the declarative objects the engine reads and writes
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // Replicas
    async fn get_replica(&self, name: &str) -> Result<Option<LocalVolumeReplica>>;
    async fn update_replica_status(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica>;
    async fn delete_replica(&self, name: &str) -> Result<()>;
    async fn list_replicas_by_node(&self, node: &str) -> Result<Vec<LocalVolumeReplica>>;

    // Volumes and nodes
    async fn get_volume(&self, name: &str) -> Result<Option<LocalVolume>>;
    async fn update_volume(&self, volume: &LocalVolume) -> Result<LocalVolume>;
    async fn get_node(&self, name: &str) -> Result<Option<LocalStorageNode>>;
    async fn update_node_status(&self, node: &LocalStorageNode) -> Result<LocalStorageNode>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    // Disks
    async fn get_disk(&self, name: &str) -> Result<Option<LocalDisk>>;
    async fn list_disks(&self) -> Result<Vec<LocalDisk>>;
    async fn update_disk(&self, disk: &LocalDisk) -> Result<LocalDisk>;
    async fn create_disk(&self, disk: &LocalDisk) -> Result<LocalDisk>;
    async fn update_disk_status(&self, disk: &LocalDisk) -> Result<LocalDisk>;
    async fn get_disk_claim(&self, name: &str) -> Result<Option<LocalDiskClaim>>;
    async fn update_disk_claim(&self, claim: &LocalDiskClaim) -> Result<LocalDiskClaim>;
    async fn update_disk_claim_status(&self, claim: &LocalDiskClaim) -> Result<LocalDiskClaim>;
    async fn get_disk_action(&self, name: &str) -> Result<Option<LocalDiskAction>>;
    async fn list_disk_actions(&self) -> Result<Vec<LocalDiskAction>>;
    async fn update_disk_action_status(&self, action: &LocalDiskAction) -> Result<LocalDiskAction>;

    // Operations
    async fn create_migrate(&self, migrate: &LocalVolumeMigrate) -> Result<LocalVolumeMigrate>;
    async fn get_migrate(&self, name: &str) -> Result<Option<LocalVolumeMigrate>>;
    async fn list_migrates(&self) -> Result<Vec<LocalVolumeMigrate>>;
    async fn update_migrate(&self, migrate: &LocalVolumeMigrate) -> Result<LocalVolumeMigrate>;
    async fn list_converts(&self) -> Result<Vec<LocalVolumeConvert>>;
    async fn list_expands(&self) -> Result<Vec<LocalVolumeExpand>>;

    // Health
    async fn create_fault_ticket(&self, ticket: &FaultTicket) -> Result<FaultTicket>;
    async fn list_fault_tickets(&self) -> Result<Vec<FaultTicket>>;
    async fn list_physical_disks(&self, node: &str) -> Result<Vec<PhysicalDisk>>;
    async fn create_physical_disk(&self, disk: &PhysicalDisk) -> Result<PhysicalDisk>;
    async fn update_physical_disk_status(&self, disk: &PhysicalDisk) -> Result<PhysicalDisk>;

    // Core objects
    async fn get_k8s_node(&self, name: &str) -> Result<Option<Node>>;
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;
}

// =============================================================================
// Kubernetes Store
// =============================================================================

/// [`ObjectStore`] backed by the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

fn map_kube_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => Error::ResourceConflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn list_all<K>(api: &Api<K>) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&ListParams::default()).await?.items)
}

async fn replace<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let name = obj.name_any();
    api.replace(&name, &PostParams::default(), obj)
        .await
        .map_err(|e| map_kube_error(e, &K::kind(&Default::default()), &name))
}

async fn replace_status<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let name = obj.name_any();
    let data = serde_json::to_vec(obj)?;
    api.replace_status(&name, &PostParams::default(), data)
        .await
        .map_err(|e| map_kube_error(e, &K::kind(&Default::default()), &name))
}

async fn create<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let name = obj.name_any();
    api.create(&PostParams::default(), obj)
        .await
        .map_err(|e| map_kube_error(e, &K::kind(&Default::default()), &name))
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_replica(&self, name: &str) -> Result<Option<LocalVolumeReplica>> {
        get_opt(&self.api(), name).await
    }

    async fn update_replica_status(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        replace_status(&self.api(), replica).await
    }

    async fn delete_replica(&self, name: &str) -> Result<()> {
        let api: Api<LocalVolumeReplica> = self.api();
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_replicas_by_node(&self, node: &str) -> Result<Vec<LocalVolumeReplica>> {
        Ok(list_all(&self.api::<LocalVolumeReplica>())
            .await?
            .into_iter()
            .filter(|r| r.spec.node_name == node)
            .collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<LocalVolume>> {
        get_opt(&self.api(), name).await
    }

    async fn update_volume(&self, volume: &LocalVolume) -> Result<LocalVolume> {
        replace(&self.api(), volume).await
    }

    async fn get_node(&self, name: &str) -> Result<Option<LocalStorageNode>> {
        get_opt(&self.api(), name).await
    }

    async fn update_node_status(&self, node: &LocalStorageNode) -> Result<LocalStorageNode> {
        replace_status(&self.api(), node).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        get_opt(&Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_disk(&self, name: &str) -> Result<Option<LocalDisk>> {
        get_opt(&self.api(), name).await
    }

    async fn list_disks(&self) -> Result<Vec<LocalDisk>> {
        list_all(&self.api()).await
    }

    async fn update_disk(&self, disk: &LocalDisk) -> Result<LocalDisk> {
        replace(&self.api(), disk).await
    }

    async fn create_disk(&self, disk: &LocalDisk) -> Result<LocalDisk> {
        create(&self.api(), disk).await
    }

    async fn update_disk_status(&self, disk: &LocalDisk) -> Result<LocalDisk> {
        replace_status(&self.api(), disk).await
    }

    async fn get_disk_claim(&self, name: &str) -> Result<Option<LocalDiskClaim>> {
        get_opt(&self.api(), name).await
    }

    async fn update_disk_claim(&self, claim: &LocalDiskClaim) -> Result<LocalDiskClaim> {
        replace(&self.api(), claim).await
    }

    async fn update_disk_claim_status(&self, claim: &LocalDiskClaim) -> Result<LocalDiskClaim> {
        replace_status(&self.api(), claim).await
    }

    async fn get_disk_action(&self, name: &str) -> Result<Option<LocalDiskAction>> {
        get_opt(&self.api(), name).await
    }

    async fn list_disk_actions(&self) -> Result<Vec<LocalDiskAction>> {
        list_all(&self.api()).await
    }

    async fn update_disk_action_status(&self, action: &LocalDiskAction) -> Result<LocalDiskAction> {
        replace_status(&self.api(), action).await
    }

    async fn create_migrate(&self, migrate: &LocalVolumeMigrate) -> Result<LocalVolumeMigrate> {
        create(&self.api(), migrate).await
    }

    async fn get_migrate(&self, name: &str) -> Result<Option<LocalVolumeMigrate>> {
        get_opt(&self.api(), name).await
    }

    async fn list_migrates(&self) -> Result<Vec<LocalVolumeMigrate>> {
        list_all(&self.api()).await
    }

    async fn update_migrate(&self, migrate: &LocalVolumeMigrate) -> Result<LocalVolumeMigrate> {
        replace(&self.api(), migrate).await
    }

    async fn list_converts(&self) -> Result<Vec<LocalVolumeConvert>> {
        list_all(&self.api()).await
    }

    async fn list_expands(&self) -> Result<Vec<LocalVolumeExpand>> {
        list_all(&self.api()).await
    }

    async fn create_fault_ticket(&self, ticket: &FaultTicket) -> Result<FaultTicket> {
        create(&self.api(), ticket).await
    }

    async fn list_fault_tickets(&self) -> Result<Vec<FaultTicket>> {
        list_all(&self.api()).await
    }

    async fn list_physical_disks(&self, node: &str) -> Result<Vec<PhysicalDisk>> {
        Ok(list_all(&self.api::<PhysicalDisk>())
            .await?
            .into_iter()
            .filter(|d| d.spec.node_name == node)
            .collect())
    }

    async fn create_physical_disk(&self, disk: &PhysicalDisk) -> Result<PhysicalDisk> {
        create(&self.api(), disk).await
    }

    async fn update_physical_disk_status(&self, disk: &PhysicalDisk) -> Result<PhysicalDisk> {
        replace_status(&self.api(), disk).await
    }

    async fn get_k8s_node(&self, name: &str) -> Result<Option<Node>> {
        get_opt(&self.api(), name).await
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        get_opt(&Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        get_opt(&self.api(), name).await
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        get_opt(&self.api(), name).await
    }
}
