//! Replica request validation
//!
//! Checks run before any host mutation, in a fixed order so that the
//! reported error is deterministic.

use super::registry::LocalRegistry;
use crate::crd::{LocalPool, LocalVolumeReplica};
use crate::error::{Error, Result};

/// Validates replica requests against registry state
pub struct Validator {
    registry: LocalRegistry,
}

impl Validator {
    pub fn new(registry: LocalRegistry) -> Self {
        Self { registry }
    }

    fn check_struct(replica: &LocalVolumeReplica) -> Result<()> {
        if replica.spec.volume_name.is_empty() {
            return Err(Error::InvalidSpec("volume name is empty".into()));
        }
        if replica.spec.pool_name.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "pool name is empty for volume {}",
                replica.spec.volume_name
            )));
        }
        if replica.spec.required_capacity_bytes < 0 {
            return Err(Error::InvalidSpec(format!(
                "negative capacity for volume {}",
                replica.spec.volume_name
            )));
        }
        Ok(())
    }

    fn pool(&self, name: &str) -> Result<LocalPool> {
        self.registry
            .pool(name)
            .ok_or_else(|| Error::PoolNotFound { pool: name.to_string() })
    }

    /// Pool exists, replica absent, a free volume slot, enough free
    /// capacity, and within the pool ceiling
    pub fn can_create(&self, replica: &LocalVolumeReplica) -> Result<()> {
        Self::check_struct(replica)?;
        let pool = self.pool(&replica.spec.pool_name)?;
        let volume = &replica.spec.volume_name;
        let required = replica.spec.required_capacity_bytes;

        if self.registry.has_replica(volume) {
            return Err(Error::ReplicaExists { volume: volume.clone() });
        }
        if pool.free_volume_count <= 0 {
            return Err(Error::InsufficientResources {
                pool: pool.name,
                reason: "no free volume slot".into(),
            });
        }
        if pool.free_capacity_bytes < required {
            return Err(Error::InsufficientResources {
                reason: format!(
                    "requested {} bytes, {} free",
                    required, pool.free_capacity_bytes
                ),
                pool: pool.name,
            });
        }
        if required > pool.volume_capacity_bytes_limit {
            return Err(Error::OverLimit {
                pool: pool.name,
                requested: required,
                limit: pool.volume_capacity_bytes_limit,
            });
        }
        Ok(())
    }

    pub fn can_delete(&self, replica: &LocalVolumeReplica) -> Result<()> {
        Self::check_struct(replica)?;
        if !self.registry.has_replica(&replica.spec.volume_name) {
            return Err(Error::ReplicaNotFound {
                volume: replica.spec.volume_name.clone(),
            });
        }
        Ok(())
    }

    /// Replica exists, grows, the pool has the delta free, and the new size
    /// is within the pool ceiling
    pub fn can_expand(&self, replica: &LocalVolumeReplica, new_capacity: i64) -> Result<()> {
        Self::check_struct(replica)?;
        let volume = &replica.spec.volume_name;
        let current = self
            .registry
            .replica(volume)
            .ok_or_else(|| Error::ReplicaNotFound { volume: volume.clone() })?;
        let pool = self.pool(&current.spec.pool_name)?;
        let allocated = current.allocated_capacity_bytes();

        if new_capacity <= allocated {
            return Err(Error::InvalidSpec(format!(
                "volume {} cannot shrink or keep size: {} -> {}",
                volume, allocated, new_capacity
            )));
        }
        let delta = new_capacity - allocated;
        if pool.free_capacity_bytes < delta {
            return Err(Error::InsufficientResources {
                reason: format!("expansion needs {} bytes, {} free", delta, pool.free_capacity_bytes),
                pool: pool.name,
            });
        }
        if new_capacity > pool.volume_capacity_bytes_limit {
            return Err(Error::OverLimit {
                pool: pool.name,
                requested: new_capacity,
                limit: pool.volume_capacity_bytes_limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::registry::tests::{pool, replica};
    use crate::storage::units::GIB;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn setup(total: i64, slots: i64) -> (LocalRegistry, Validator) {
        let registry = LocalRegistry::new("n1");
        let mut pools = BTreeMap::new();
        pools.insert("LocalStorage_PoolHDD".to_string(), pool("LocalStorage_PoolHDD", total, slots));
        registry.sync_resources(pools, BTreeMap::new());
        (registry.clone(), Validator::new(registry))
    }

    #[test]
    fn test_create_order() {
        let (registry, validator) = setup(10 * GIB, 1);

        let mut bad = replica("", "LocalStorage_PoolHDD", GIB);
        bad.spec.volume_name.clear();
        assert_matches!(validator.can_create(&bad), Err(Error::InvalidSpec(_)));

        assert_matches!(
            validator.can_create(&replica("pvc-1", "LocalStorage_PoolSSD", GIB)),
            Err(Error::PoolNotFound { .. })
        );

        let first = replica("pvc-1", "LocalStorage_PoolHDD", GIB);
        validator.can_create(&first).unwrap();
        registry.register_replica(&first).unwrap();
        assert_matches!(validator.can_create(&first), Err(Error::ReplicaExists { .. }));

        // Slot exhaustion is reported before capacity
        assert_matches!(
            validator.can_create(&replica("pvc-2", "LocalStorage_PoolHDD", 100 * GIB)),
            Err(Error::InsufficientResources { ref reason, .. }) if reason.contains("slot")
        );
    }

    #[test]
    fn test_create_capacity_and_limit() {
        let (registry, validator) = setup(10 * GIB, 10);
        assert_matches!(
            validator.can_create(&replica("pvc-1", "LocalStorage_PoolHDD", 11 * GIB)),
            Err(Error::InsufficientResources { .. })
        );

        let mut p = registry.pool("LocalStorage_PoolHDD").unwrap();
        p.volume_capacity_bytes_limit = 2 * GIB;
        registry.update_pool(p);
        assert_matches!(
            validator.can_create(&replica("pvc-1", "LocalStorage_PoolHDD", 3 * GIB)),
            Err(Error::OverLimit { requested, limit, .. }) if requested == 3 * GIB && limit == 2 * GIB
        );
    }

    #[test]
    fn test_expand() {
        let (registry, validator) = setup(10 * GIB, 10);
        let r = replica("pvc-1", "LocalStorage_PoolHDD", 4 * GIB);
        assert_matches!(validator.can_expand(&r, 5 * GIB), Err(Error::ReplicaNotFound { .. }));

        registry.register_replica(&r).unwrap();
        assert_matches!(validator.can_expand(&r, 4 * GIB), Err(Error::InvalidSpec(_)));
        validator.can_expand(&r, 10 * GIB).unwrap();
        assert_matches!(
            validator.can_expand(&r, 11 * GIB),
            Err(Error::InsufficientResources { .. })
        );
    }

    #[test]
    fn test_expand_then_create_budget() {
        // A -> B growth plus a new replica C fits iff A + C + (B - A) <= total
        let (registry, validator) = setup(10 * GIB, 10);
        let a = replica("pvc-a", "LocalStorage_PoolHDD", 2 * GIB);
        registry.register_replica(&a).unwrap();

        validator.can_expand(&a, 6 * GIB).unwrap();
        registry
            .register_replica(&replica("pvc-a", "LocalStorage_PoolHDD", 6 * GIB))
            .unwrap();

        validator
            .can_create(&replica("pvc-c", "LocalStorage_PoolHDD", 4 * GIB))
            .unwrap();
        assert_matches!(
            validator.can_create(&replica("pvc-c", "LocalStorage_PoolHDD", 5 * GIB)),
            Err(Error::InsufficientResources { .. })
        );
    }

    #[test]
    fn test_delete() {
        let (registry, validator) = setup(10 * GIB, 10);
        let r = replica("pvc-1", "LocalStorage_PoolHDD", GIB);
        assert_matches!(validator.can_delete(&r), Err(Error::ReplicaNotFound { .. }));
        registry.register_replica(&r).unwrap();
        validator.can_delete(&r).unwrap();
    }
}
