//! Disk action controller
//!
//! Applies LocalDiskAction rules to LocalDisks. The only action is
//! `reserve`, which marks matching disks so they are never claimed or
//! pooled. Runs on the elected leader.

use glob::Pattern;
use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::store::ObjectStore;
use crate::crd::{DiskActionRule, LocalDisk, LocalDiskAction, LATEST_MATCHED_LENGTH};
use crate::error::{Error, Result};

pub const ACTION_RESERVE: &str = "reserve";

const DISK_KEY_PREFIX: &str = "disk/";
const ACTION_KEY_PREFIX: &str = "action/";

/// Whether `rule` selects `disk`. An empty rule selects nothing.
pub fn rule_matches(rule: &DiskActionRule, disk: &LocalDisk) -> bool {
    if rule.min_capacity == 0 && rule.max_capacity == 0 && rule.device_path.is_empty() {
        return false;
    }
    if rule.min_capacity != 0 && disk.spec.capacity >= rule.min_capacity {
        return false;
    }
    if rule.max_capacity != 0 && disk.spec.capacity <= rule.max_capacity {
        return false;
    }
    if !rule.device_path.is_empty() {
        match Pattern::new(&rule.device_path) {
            Ok(pattern) => {
                if !pattern.matches(&disk.spec.device_path) {
                    return false;
                }
            }
            Err(e) => {
                warn!("Invalid devicePath pattern {:?}: {}", rule.device_path, e);
                return false;
            }
        }
    }
    true
}

/// Put `name` at the front of `latest`, bounded; returns whether it changed
pub fn refresh_latest(latest: &mut Vec<String>, name: &str) -> bool {
    if latest.iter().any(|n| n == name) {
        return false;
    }
    latest.insert(0, name.to_string());
    latest.truncate(LATEST_MATCHED_LENGTH);
    true
}

pub struct DiskActionController {
    store: Arc<dyn ObjectStore>,
    queue: TaskQueue,
}

impl DiskActionController {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            queue: TaskQueue::new("disk-actions", 0),
        }
    }

    pub fn enqueue_disk(&self, name: &str) {
        self.queue.add(format!("{}{}", DISK_KEY_PREFIX, name));
    }

    pub fn enqueue_action(&self, name: &str) {
        self.queue.add(format!("{}{}", ACTION_KEY_PREFIX, name));
    }

    async fn reserve(&self, disk: &LocalDisk) -> Result<()> {
        if disk.spec.reserved {
            return Ok(());
        }
        let mut updated = disk.clone();
        updated.spec.reserved = true;
        self.store.update_disk(&updated).await?;
        info!(target: "audit", "Reserved local disk {}", disk.name_any());
        Ok(())
    }

    async fn record_match(&self, action: &LocalDiskAction, disk_name: &str) -> Result<()> {
        let mut updated = action.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        if refresh_latest(&mut status.latest_matched_lds, disk_name) {
            self.store.update_disk_action_status(&updated).await?;
        }
        Ok(())
    }

    /// A disk changed: the first matching reserve action reserves it
    pub async fn reconcile_disk(&self, name: &str) -> Result<()> {
        let Some(disk) = self.store.get_disk(name).await? else {
            debug!("Local disk {} is gone", name);
            return Ok(());
        };
        if disk.spec.reserved {
            return Ok(());
        }
        let mut actions = self.store.list_disk_actions().await?;
        actions.sort_by_key(|a| a.name_any());
        let matched = actions
            .iter()
            .find(|a| a.spec.action == ACTION_RESERVE && rule_matches(&a.spec.rule, &disk));
        if let Some(action) = matched {
            info!("Disk {} matches action {}", name, action.name_any());
            self.reserve(&disk).await?;
            self.record_match(action, name).await?;
        }
        Ok(())
    }

    /// An action changed: reserve every disk it matches
    pub async fn reconcile_action(&self, name: &str) -> Result<()> {
        let Some(mut action) = self.store.get_disk_action(name).await? else {
            debug!("Local disk action {} is gone", name);
            return Ok(());
        };
        if action.spec.action != ACTION_RESERVE {
            return Err(Error::InvalidSpec(format!(
                "unknown disk action {:?} in {}",
                action.spec.action, name
            )));
        }
        let mut disks = self.store.list_disks().await?;
        disks.retain(|d| !d.spec.reserved && rule_matches(&action.spec.rule, d));
        disks.sort_by_key(|d| d.name_any());
        for disk in &disks {
            self.reserve(disk).await?;
            let status = action.status.get_or_insert_with(Default::default);
            if refresh_latest(&mut status.latest_matched_lds, &disk.name_any()) {
                action = self.store.update_disk_action_status(&action).await?;
            }
        }
        Ok(())
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        if let Some(name) = key.strip_prefix(DISK_KEY_PREFIX) {
            self.reconcile_disk(name).await
        } else if let Some(name) = key.strip_prefix(ACTION_KEY_PREFIX) {
            self.reconcile_action(name).await
        } else {
            Ok(())
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        info!("Disk action controller started");
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if e.is_retryable() => {
                    warn!("Disk action {} failed, retrying: {}", key, e);
                    self.queue.add_rate_limited(&key);
                }
                Err(e) => {
                    warn!("Disk action {} failed: {}", key, e);
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }
        info!("Disk action controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::memory::MemoryStore;
    use crate::crd::{LocalDiskActionSpec, LocalDiskSpec};
    use proptest::prelude::*;

    fn disk(name: &str, path: &str, capacity: i64) -> LocalDisk {
        LocalDisk::new(
            name,
            LocalDiskSpec {
                node_name: "n1".into(),
                device_path: path.into(),
                capacity,
                class: None,
                reserved: false,
                claim_ref: None,
                serial_number: String::new(),
            },
        )
    }

    fn rule(min: i64, max: i64, path: &str) -> DiskActionRule {
        DiskActionRule {
            min_capacity: min,
            max_capacity: max,
            device_path: path.into(),
        }
    }

    fn action(name: &str, rule: DiskActionRule) -> LocalDiskAction {
        LocalDiskAction::new(
            name,
            LocalDiskActionSpec {
                action: ACTION_RESERVE.into(),
                rule,
            },
        )
    }

    #[test]
    fn test_rule_matches() {
        let d = disk("ld-1", "/dev/sdb", 100);
        assert!(!rule_matches(&rule(0, 0, ""), &d));
        assert!(rule_matches(&rule(200, 0, ""), &d));
        assert!(!rule_matches(&rule(100, 0, ""), &d));
        assert!(rule_matches(&rule(0, 50, ""), &d));
        assert!(!rule_matches(&rule(0, 100, ""), &d));
        assert!(rule_matches(&rule(0, 0, "/dev/sd*"), &d));
        assert!(!rule_matches(&rule(0, 0, "/dev/nvme*"), &d));
        assert!(!rule_matches(&rule(0, 0, "/dev/[sd"), &d));
        assert!(rule_matches(&rule(200, 0, "/dev/sd?"), &d));
    }

    #[test]
    fn test_refresh_latest() {
        let mut latest = vec!["b".to_string(), "a".to_string()];
        assert!(!refresh_latest(&mut latest, "a"));
        assert!(refresh_latest(&mut latest, "c"));
        assert_eq!(latest, vec!["c", "b", "a"]);
    }

    proptest! {
        #[test]
        fn prop_latest_is_bounded_and_unique(names in proptest::collection::vec("[a-e]{1,2}", 0..40)) {
            let mut latest = Vec::new();
            for name in &names {
                refresh_latest(&mut latest, name);
                prop_assert!(latest.len() <= LATEST_MATCHED_LENGTH);
                prop_assert!(latest.contains(name));
            }
            let mut dedup = latest.clone();
            dedup.sort();
            dedup.dedup();
            prop_assert_eq!(dedup.len(), latest.len());
        }
    }

    #[tokio::test]
    async fn test_action_reserves_matching_disks() {
        let store = Arc::new(MemoryStore::new());
        store.disks.put(disk("ld-1", "/dev/sdb", 100));
        store.disks.put(disk("ld-2", "/dev/sdc", 100));
        store.disks.put(disk("ld-3", "/dev/nvme0n1", 100));
        store.actions.put(action("reserve-sd", rule(0, 0, "/dev/sd*")));
        let controller = DiskActionController::new(store.clone());

        controller.reconcile_action("reserve-sd").await.unwrap();
        assert!(store.disks.get("ld-1").unwrap().spec.reserved);
        assert!(store.disks.get("ld-2").unwrap().spec.reserved);
        assert!(!store.disks.get("ld-3").unwrap().spec.reserved);
        let latest = store.actions.get("reserve-sd").unwrap().status.unwrap().latest_matched_lds;
        assert_eq!(latest, vec!["ld-2", "ld-1"]);
    }

    #[tokio::test]
    async fn test_disk_event_uses_first_matching_action() {
        let store = Arc::new(MemoryStore::new());
        store.disks.put(disk("ld-1", "/dev/sdb", 100));
        store.actions.put(action("a-small", rule(200, 0, "")));
        store.actions.put(action("b-sd", rule(0, 0, "/dev/sd*")));
        let controller = DiskActionController::new(store.clone());

        controller.reconcile_disk("ld-1").await.unwrap();
        assert!(store.disks.get("ld-1").unwrap().spec.reserved);
        assert_eq!(
            store.actions.get("a-small").unwrap().status.unwrap().latest_matched_lds,
            vec!["ld-1"]
        );
        assert!(store.actions.get("b-sd").unwrap().status.is_none());
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut a = action("wipe", rule(0, 0, "/dev/sd*"));
        a.spec.action = "wipe".into();
        store.actions.put(a);
        let controller = DiskActionController::new(store);
        assert!(controller.reconcile_action("wipe").await.is_err());
    }
}
