//! Replica Manager
//!
//! Public entry point for replica lifecycle operations. Requests are
//! validated against the registry, dispatched to the executor of the
//! pool's volume kind, and the result is folded back into the registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::executor::{ConsistencyReport, ReplicaExecutor};
use super::registry::LocalRegistry;
use super::validator::Validator;
use crate::crd::{LocalVolumeReplica, VolumeKind};
use crate::error::{Error, Result};
use crate::ha::LuksManager;

/// Validates and dispatches replica operations
pub struct ReplicaManager {
    registry: LocalRegistry,
    validator: Validator,
    executors: BTreeMap<VolumeKind, Arc<dyn ReplicaExecutor>>,
    luks: Option<Arc<LuksManager>>,
}

impl ReplicaManager {
    pub fn new(registry: LocalRegistry) -> Self {
        Self {
            validator: Validator::new(registry.clone()),
            registry,
            executors: BTreeMap::new(),
            luks: None,
        }
    }

    /// Register the backend for its volume kind
    pub fn with_executor(mut self, executor: Arc<dyn ReplicaExecutor>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn with_luks(mut self, luks: Arc<LuksManager>) -> Self {
        self.luks = Some(luks);
        self
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    pub fn executors(&self) -> impl Iterator<Item = &Arc<dyn ReplicaExecutor>> {
        self.executors.values()
    }

    /// Kind of the pool hosting the replica, falling back to the request
    pub fn kind_of(&self, replica: &LocalVolumeReplica) -> VolumeKind {
        self.registry
            .pool(&replica.spec.pool_name)
            .map(|p| p.kind)
            .unwrap_or(replica.spec.kind)
    }

    fn executor(&self, replica: &LocalVolumeReplica) -> Result<&Arc<dyn ReplicaExecutor>> {
        let kind = self.kind_of(replica);
        self.executors.get(&kind).ok_or_else(|| Error::Unsupported {
            kind: kind.to_string(),
            operation: "replica".into(),
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create the backing of a replica.
    ///
    /// An already registered replica is returned with its registry status.
    pub async fn create(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        if let Some(existing) = self.registry.replica(&replica.spec.volume_name) {
            debug!("Replica {} already registered", replica.spec.volume_name);
            let mut out = replica.clone();
            out.status = existing.status;
            return Ok(out);
        }

        self.validator.can_create(replica)?;
        let created = self.executor(replica)?.create_replica(replica).await?;
        self.registry.register_replica(&created)?;
        info!(
            "Created replica {} in pool {}",
            created.spec.volume_name, created.spec.pool_name
        );
        Ok(created)
    }

    /// Create the backing and LUKS-format it with `key`
    pub async fn create_encrypted(
        &self,
        replica: &LocalVolumeReplica,
        key: &[u8],
    ) -> Result<LocalVolumeReplica> {
        let created = self.create(replica).await?;
        let luks = self.luks.as_ref().ok_or_else(|| {
            Error::Configuration("encryption requested but not configured".into())
        })?;
        let device = created
            .status
            .as_ref()
            .map(|s| s.storage_path.clone())
            .unwrap_or_default();
        luks.encrypt_volume(&created.spec.volume_name, &device, key)
            .await?;
        Ok(created)
    }

    /// Release the backing; an unknown replica is not an error
    pub async fn delete(&self, replica: &LocalVolumeReplica) -> Result<()> {
        match self.validator.can_delete(replica) {
            Ok(()) => {}
            Err(Error::ReplicaNotFound { volume }) => {
                debug!("Replica {} not registered, nothing to delete", volume);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let registered = self
            .registry
            .replica(&replica.spec.volume_name)
            .unwrap_or_else(|| replica.clone());
        self.executor(&registered)?.delete_replica(&registered).await?;

        match self.registry.deregister_replica(&registered.spec.volume_name) {
            Ok(()) | Err(Error::ReplicaNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!("Deleted replica {}", registered.spec.volume_name);
        Ok(())
    }

    /// Grow the backing to `new_capacity` bytes
    pub async fn expand(
        &self,
        replica: &LocalVolumeReplica,
        new_capacity: i64,
    ) -> Result<LocalVolumeReplica> {
        self.validator.can_expand(replica, new_capacity)?;
        let expanded = self
            .executor(replica)?
            .expand_replica(replica, new_capacity)
            .await?;
        self.registry.register_replica(&expanded)?;
        info!(
            "Expanded replica {} to {} bytes",
            expanded.spec.volume_name,
            expanded.allocated_capacity_bytes()
        );
        Ok(expanded)
    }

    /// Probe the backing and refresh the registered status
    pub async fn test(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        let tested = self.executor(replica)?.test_replica(replica).await?;
        if self.registry.has_replica(&tested.spec.volume_name) {
            self.registry.register_replica(&tested)?;
        }
        Ok(tested)
    }

    pub fn get(&self, volume_name: &str) -> Result<LocalVolumeReplica> {
        self.registry
            .replica(volume_name)
            .ok_or_else(|| Error::ReplicaNotFound {
                volume: volume_name.to_string(),
            })
    }

    /// Compare declared replicas of this node with the registry and host.
    ///
    /// Discrepancies are logged and returned, never written back.
    pub async fn consistency_check(
        &self,
        declared: &[LocalVolumeReplica],
    ) -> Result<ConsistencyReport> {
        let registered = self.registry.replicas();
        let mut report = ConsistencyReport::default();

        for (kind, executor) in &self.executors {
            let declared_kind: Vec<LocalVolumeReplica> = declared
                .iter()
                .filter(|r| self.kind_of(r) == *kind)
                .cloned()
                .collect();
            let registered_kind: BTreeMap<String, LocalVolumeReplica> = registered
                .iter()
                .filter(|(_, r)| self.kind_of(r) == *kind)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            report.merge(
                executor
                    .consistency_check(&declared_kind, &registered_kind)
                    .await?,
            );
        }

        if !report.is_consistent() {
            warn!(
                "Consistency check found {} issue(s) on node {}",
                report.issues.len(),
                self.registry.node_name()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalVolumeReplicaStatus, ReplicaState};
    use crate::storage::executor::{ready_status, with_status};
    use crate::storage::registry::tests::{pool, replica};
    use crate::storage::units::GIB;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const POOL: &str = "LocalStorage_PoolHDD";

    /// Executor that allocates exactly what is requested
    #[derive(Default)]
    struct FakeExecutor {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplicaExecutor for FakeExecutor {
        fn kind(&self) -> VolumeKind {
            VolumeKind::Lvm
        }

        async fn create_replica(&self, r: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
            Ok(with_status(
                r,
                ready_status(
                    format!("/dev/{}/{}", POOL, r.spec.volume_name),
                    format!("/dev/{}/{}", POOL, r.spec.volume_name),
                    r.spec.required_capacity_bytes,
                    vec!["/dev/sdb".into()],
                ),
            ))
        }

        async fn delete_replica(&self, r: &LocalVolumeReplica) -> Result<()> {
            self.deleted.lock().push(r.spec.volume_name.clone());
            Ok(())
        }

        async fn expand_replica(&self, r: &LocalVolumeReplica, new: i64) -> Result<LocalVolumeReplica> {
            let mut out = r.clone();
            out.status.get_or_insert_with(LocalVolumeReplicaStatus::default).allocated_capacity_bytes = new;
            Ok(out)
        }

        async fn test_replica(&self, r: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
            Ok(r.clone())
        }

        async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
            Ok(BTreeMap::new())
        }

        async fn extend_pools(&self, _disks: &[crate::crd::LocalDevice]) -> Result<bool> {
            Ok(false)
        }

        async fn pools_info(&self) -> Result<BTreeMap<String, crate::crd::LocalPool>> {
            Ok(BTreeMap::new())
        }

        async fn consistency_check(
            &self,
            declared: &[LocalVolumeReplica],
            registered: &BTreeMap<String, LocalVolumeReplica>,
        ) -> Result<ConsistencyReport> {
            Ok(ConsistencyReport {
                issues: vec![format!("{} declared, {} registered", declared.len(), registered.len())],
                repaired: Vec::new(),
            })
        }
    }

    fn setup() -> (ReplicaManager, Arc<FakeExecutor>) {
        let registry = LocalRegistry::new("n1");
        let mut pools = BTreeMap::new();
        pools.insert(POOL.to_string(), pool(POOL, 10 * GIB, 10));
        registry.sync_resources(pools, BTreeMap::new());
        let fake = Arc::new(FakeExecutor::default());
        let manager = ReplicaManager::new(registry).with_executor(fake.clone());
        (manager, fake)
    }

    fn request(volume: &str, required: i64) -> LocalVolumeReplica {
        let mut r = replica(volume, POOL, 0);
        r.spec.required_capacity_bytes = required;
        r.status = None;
        r
    }

    #[tokio::test]
    async fn test_create_registers() {
        let (manager, _) = setup();
        let created = manager.create(&request("pvc-1", GIB)).await.unwrap();
        assert_eq!(created.state(), Some(ReplicaState::Ready));

        let pool = manager.registry().pool(POOL).unwrap();
        assert_eq!(pool.used_capacity_bytes, GIB);
        assert_eq!(pool.volumes, vec!["pvc-1".to_string()]);
        assert!(manager.get("pvc-1").is_ok());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (manager, _) = setup();
        manager.create(&request("pvc-1", GIB)).await.unwrap();
        let again = manager.create(&request("pvc-1", GIB)).await.unwrap();
        assert_eq!(again.allocated_capacity_bytes(), GIB);
        assert_eq!(manager.registry().pool(POOL).unwrap().used_capacity_bytes, GIB);
    }

    #[tokio::test]
    async fn test_create_validation_order() {
        let (manager, _) = setup();
        let mut bad = request("pvc-1", GIB);
        bad.spec.pool_name = "LocalStorage_PoolSSD".into();
        assert_matches!(manager.create(&bad).await, Err(Error::PoolNotFound { .. }));
        assert_matches!(
            manager.create(&request("pvc-2", 20 * GIB)).await,
            Err(Error::InsufficientResources { .. })
        );
    }

    #[tokio::test]
    async fn test_delete_swallows_missing() {
        let (manager, fake) = setup();
        manager.delete(&request("pvc-x", GIB)).await.unwrap();
        assert!(fake.deleted.lock().is_empty());

        manager.create(&request("pvc-1", GIB)).await.unwrap();
        manager.delete(&request("pvc-1", GIB)).await.unwrap();
        assert_eq!(*fake.deleted.lock(), vec!["pvc-1".to_string()]);
        let pool = manager.registry().pool(POOL).unwrap();
        assert_eq!(pool.used_capacity_bytes, 0);
        assert_matches!(manager.get("pvc-1"), Err(Error::ReplicaNotFound { .. }));
    }

    #[tokio::test]
    async fn test_expand_reaccounts() {
        let (manager, _) = setup();
        let created = manager.create(&request("pvc-1", GIB)).await.unwrap();
        manager.expand(&created, 2 * GIB).await.unwrap();
        assert_eq!(manager.registry().pool(POOL).unwrap().used_capacity_bytes, 2 * GIB);
        assert_matches!(
            manager.expand(&created, GIB).await,
            Err(Error::InvalidSpec(_))
        );
    }

    #[tokio::test]
    async fn test_consistency_filters_by_kind() {
        let (manager, _) = setup();
        manager.create(&request("pvc-1", GIB)).await.unwrap();
        let mut ram = request("pvc-ram", GIB);
        ram.spec.kind = VolumeKind::Ram;
        ram.spec.pool_name = "LocalStorage_PoolRAM".into();

        let report = manager
            .consistency_check(&[request("pvc-1", GIB), ram])
            .await
            .unwrap();
        assert_eq!(report.issues, vec!["1 declared, 1 registered".to_string()]);
    }
}
