//! Disk claim binder
//!
//! Binds Pending LocalDiskClaims on this node to free LocalDisks.

use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::store::ObjectStore;
use crate::crd::{DiskClaimStatus, LocalDisk, LocalDiskClaim, LocalDiskClaimStatus};
use crate::error::{Error, ErrorAction, Result};

/// Whether `disk` can satisfy `claim`
pub fn disk_fits(claim: &LocalDiskClaim, disk: &LocalDisk) -> bool {
    let desc = &claim.spec.description;
    if disk.spec.node_name != claim.spec.node_name {
        return false;
    }
    if disk.spec.reserved || disk.spec.claim_ref.is_some() || !disk.is_available() {
        return false;
    }
    if desc.disk_type.is_some() && desc.disk_type != disk.spec.class {
        return false;
    }
    if disk.spec.capacity < desc.capacity {
        return false;
    }
    if !desc.local_disk_names.is_empty() && !desc.local_disk_names.contains(&disk.name_any()) {
        return false;
    }
    if !desc.device_paths.is_empty() && !desc.device_paths.contains(&disk.spec.device_path) {
        return false;
    }
    true
}

pub struct DiskClaimBinder {
    node_name: String,
    store: Arc<dyn ObjectStore>,
    queue: TaskQueue,
}

impl DiskClaimBinder {
    pub fn new(node_name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            queue: TaskQueue::new("disk-claims", 0),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub async fn run(&self, token: CancellationToken) {
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
                Err(e) => match e.action() {
                    ErrorAction::RequeueAfter(delay) => {
                        debug!("Claim {}: {}", key, e);
                        self.queue.add_after(key.clone(), delay);
                    }
                    ErrorAction::RequeueWithBackoff => {
                        warn!("Claim {} failed, retrying: {}", key, e);
                        self.queue.add_rate_limited(key.clone());
                    }
                    ErrorAction::NoRequeue => {
                        warn!("Claim {} failed: {}", key, e);
                        self.queue.forget(&key);
                    }
                },
            }
            self.queue.done(&key);
        }
    }

    async fn set_status(&self, claim: &LocalDiskClaim, status: DiskClaimStatus) -> Result<LocalDiskClaim> {
        let mut updated = claim.clone();
        updated.status = Some(LocalDiskClaimStatus { status: Some(status) });
        self.store.update_disk_claim_status(&updated).await
    }

    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let Some(mut claim) = self.store.get_disk_claim(name).await? else {
            return Ok(());
        };
        if claim.spec.node_name != self.node_name {
            return Ok(());
        }

        let status = claim.status.as_ref().and_then(|s| s.status);
        match status {
            None => {
                self.set_status(&claim, DiskClaimStatus::Pending).await?;
                Ok(())
            }
            Some(DiskClaimStatus::Pending) => {
                let mut disks: Vec<_> = self
                    .store
                    .list_disks()
                    .await?
                    .into_iter()
                    .filter(|d| disk_fits(&claim, d))
                    .collect();
                if disks.is_empty() {
                    debug!("No free disk for claim {} yet", name);
                    return Err(Error::InsufficientResources {
                        pool: claim.spec.node_name.clone(),
                        reason: format!("no local disk satisfies claim {}", name),
                    });
                }
                disks.sort_by_key(|d| d.name_any());

                for disk in &disks {
                    let mut claimed = disk.clone();
                    claimed.spec.claim_ref = Some(name.to_string());
                    self.store.update_disk(&claimed).await?;
                }
                claim.spec.disk_refs = disks.iter().map(|d| d.name_any()).collect();
                let claim = self.store.update_disk_claim(&claim).await?;
                self.set_status(&claim, DiskClaimStatus::Bound).await?;
                info!("Claim {} bound to {:?}", name, claim.spec.disk_refs);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }
}
