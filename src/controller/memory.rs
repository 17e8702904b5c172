//! In-memory [`ObjectStore`] for tests
//!
//! Objects carry a numeric resource version that is bumped on each write;
//! writing a stale version fails with `ResourceConflict`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::store::ObjectStore;
use crate::crd::{
    FaultTicket, LocalDisk, LocalDiskAction, LocalDiskClaim, LocalStorageNode, LocalVolume,
    LocalVolumeConvert, LocalVolumeExpand, LocalVolumeMigrate, LocalVolumeReplica, PhysicalDisk,
};
use crate::error::{Error, Result};

pub struct Table<K> {
    items: Mutex<BTreeMap<String, K>>,
}

impl<K> Default for Table<K> {
    fn default() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K> Table<K>
where
    K: Resource + Clone,
    K::DynamicType: Default,
{
    fn kind() -> String {
        K::kind(&Default::default()).to_string()
    }

    fn bump(obj: &mut K) {
        let next = obj
            .meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        obj.meta_mut().resource_version = Some(next.to_string());
    }

    pub fn get(&self, name: &str) -> Option<K> {
        self.items.lock().get(name).cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.items.lock().values().cloned().collect()
    }

    /// Insert or overwrite without version checks
    pub fn put(&self, mut obj: K) {
        let name = obj.name_any();
        let mut items = self.items.lock();
        if let Some(old) = items.get(&name) {
            obj.meta_mut().resource_version = old.meta().resource_version.clone();
        }
        Self::bump(&mut obj);
        items.insert(name, obj);
    }

    pub fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut items = self.items.lock();
        if items.contains_key(&name) {
            return Err(Error::ResourceConflict { kind: Self::kind(), name });
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = None;
        Self::bump(&mut obj);
        items.insert(name, obj.clone());
        Ok(obj)
    }

    pub fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut items = self.items.lock();
        let current = items.get(&name).ok_or_else(|| Error::ResourceNotFound {
            kind: Self::kind(),
            name: name.clone(),
        })?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != current.meta().resource_version
        {
            return Err(Error::ResourceConflict { kind: Self::kind(), name });
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = current.meta().resource_version.clone();
        Self::bump(&mut obj);
        items.insert(name, obj.clone());
        Ok(obj)
    }

    pub fn delete(&self, name: &str) {
        self.items.lock().remove(name);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub replicas: Table<LocalVolumeReplica>,
    pub volumes: Table<LocalVolume>,
    pub nodes: Table<LocalStorageNode>,
    pub secrets: Table<Secret>,
    pub disks: Table<LocalDisk>,
    pub claims: Table<LocalDiskClaim>,
    pub actions: Table<LocalDiskAction>,
    pub migrates: Table<LocalVolumeMigrate>,
    pub converts: Table<LocalVolumeConvert>,
    pub expands: Table<LocalVolumeExpand>,
    pub tickets: Table<FaultTicket>,
    pub physical_disks: Table<PhysicalDisk>,
    pub k8s_nodes: Table<Node>,
    pub pvcs: Table<PersistentVolumeClaim>,
    pub storage_classes: Table<StorageClass>,
    pub pvs: Table<PersistentVolume>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Secrets and PVCs are keyed `<namespace>/<name>`
fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl MemoryStore {
    pub fn put_secret(&self, mut secret: Secret) {
        let key = namespaced_key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        secret.metadata.name = Some(key);
        self.secrets.put(secret);
    }

    pub fn put_pvc(&self, mut pvc: PersistentVolumeClaim) {
        let key = namespaced_key(&pvc.namespace().unwrap_or_default(), &pvc.name_any());
        pvc.metadata.name = Some(key);
        self.pvcs.put(pvc);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_replica(&self, name: &str) -> Result<Option<LocalVolumeReplica>> {
        Ok(self.replicas.get(name))
    }

    async fn update_replica_status(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        self.replicas.update(replica)
    }

    async fn delete_replica(&self, name: &str) -> Result<()> {
        self.replicas.delete(name);
        Ok(())
    }

    async fn list_replicas_by_node(&self, node: &str) -> Result<Vec<LocalVolumeReplica>> {
        Ok(self
            .replicas
            .list()
            .into_iter()
            .filter(|r| r.spec.node_name == node)
            .collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<LocalVolume>> {
        Ok(self.volumes.get(name))
    }

    async fn update_volume(&self, volume: &LocalVolume) -> Result<LocalVolume> {
        self.volumes.update(volume)
    }

    async fn get_node(&self, name: &str) -> Result<Option<LocalStorageNode>> {
        Ok(self.nodes.get(name))
    }

    async fn update_node_status(&self, node: &LocalStorageNode) -> Result<LocalStorageNode> {
        self.nodes.update(node)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets.get(&namespaced_key(namespace, name)))
    }

    async fn get_disk(&self, name: &str) -> Result<Option<LocalDisk>> {
        Ok(self.disks.get(name))
    }

    async fn list_disks(&self) -> Result<Vec<LocalDisk>> {
        Ok(self.disks.list())
    }

    async fn update_disk(&self, disk: &LocalDisk) -> Result<LocalDisk> {
        self.disks.update(disk)
    }

    async fn create_disk(&self, disk: &LocalDisk) -> Result<LocalDisk> {
        self.disks.create(disk)
    }

    async fn update_disk_status(&self, disk: &LocalDisk) -> Result<LocalDisk> {
        self.disks.update(disk)
    }

    async fn get_disk_claim(&self, name: &str) -> Result<Option<LocalDiskClaim>> {
        Ok(self.claims.get(name))
    }

    async fn update_disk_claim(&self, claim: &LocalDiskClaim) -> Result<LocalDiskClaim> {
        self.claims.update(claim)
    }

    async fn update_disk_claim_status(&self, claim: &LocalDiskClaim) -> Result<LocalDiskClaim> {
        self.claims.update(claim)
    }

    async fn get_disk_action(&self, name: &str) -> Result<Option<LocalDiskAction>> {
        Ok(self.actions.get(name))
    }

    async fn list_disk_actions(&self) -> Result<Vec<LocalDiskAction>> {
        Ok(self.actions.list())
    }

    async fn update_disk_action_status(&self, action: &LocalDiskAction) -> Result<LocalDiskAction> {
        self.actions.update(action)
    }

    async fn create_migrate(&self, migrate: &LocalVolumeMigrate) -> Result<LocalVolumeMigrate> {
        self.migrates.create(migrate)
    }

    async fn get_migrate(&self, name: &str) -> Result<Option<LocalVolumeMigrate>> {
        Ok(self.migrates.get(name))
    }

    async fn list_migrates(&self) -> Result<Vec<LocalVolumeMigrate>> {
        Ok(self.migrates.list())
    }

    async fn update_migrate(&self, migrate: &LocalVolumeMigrate) -> Result<LocalVolumeMigrate> {
        self.migrates.update(migrate)
    }

    async fn list_converts(&self) -> Result<Vec<LocalVolumeConvert>> {
        Ok(self.converts.list())
    }

    async fn list_expands(&self) -> Result<Vec<LocalVolumeExpand>> {
        Ok(self.expands.list())
    }

    async fn create_fault_ticket(&self, ticket: &FaultTicket) -> Result<FaultTicket> {
        self.tickets.create(ticket)
    }

    async fn list_fault_tickets(&self) -> Result<Vec<FaultTicket>> {
        Ok(self.tickets.list())
    }

    async fn list_physical_disks(&self, node: &str) -> Result<Vec<PhysicalDisk>> {
        Ok(self
            .physical_disks
            .list()
            .into_iter()
            .filter(|d| d.spec.node_name == node)
            .collect())
    }

    async fn create_physical_disk(&self, disk: &PhysicalDisk) -> Result<PhysicalDisk> {
        self.physical_disks.create(disk)
    }

    async fn update_physical_disk_status(&self, disk: &PhysicalDisk) -> Result<PhysicalDisk> {
        self.physical_disks.update(disk)
    }

    async fn get_k8s_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.k8s_nodes.get(name))
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvcs.get(&namespaced_key(namespace, name)))
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.storage_classes.get(name))
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pvs.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::registry::tests::replica;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryStore::new();
        store.replicas.put(replica("pvc-1", "LocalStorage_PoolHDD", 1));

        let a = store.get_replica("pvc-1-n1").await.unwrap().unwrap();
        let b = a.clone();
        store.update_replica_status(&a).await.unwrap();
        assert_matches!(
            store.update_replica_status(&b).await,
            Err(Error::ResourceConflict { .. })
        );
    }
}
