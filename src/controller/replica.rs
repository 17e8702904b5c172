//! Replica reconciler
//!
//! Drives each LocalVolumeReplica of this node through
//! `Creating → NotReady ⇄ Ready → ToBeDeleted → Deleted`. Every pass
//! re-derives what to do from the object's state and the host; status is
//! written back only when it changed.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::node::NodeStatusPublisher;
use super::queue::TaskQueue;
use super::store::ObjectStore;
use crate::crd::{
    HaState, HaStatus, LocalVolume, LocalVolumeReplica, LocalVolumeReplicaStatus, ReplicaState,
    VolumeKind,
};
use crate::error::{Error, ErrorAction, Result};
use crate::ha::luks::SECRET_KEY_FIELD;
use crate::ha::{DrbdConfigurator, LuksManager};
use crate::storage::units::MIB;
use crate::storage::ReplicaManager;

/// Smallest growth that triggers an expansion
pub const VOLUME_EXPANSION_MIN: i64 = MIB;

pub struct ReplicaReconciler {
    node_name: String,
    store: Arc<dyn ObjectStore>,
    manager: Arc<ReplicaManager>,
    publisher: Arc<NodeStatusPublisher>,
    queue: TaskQueue,
    drbd: Option<Arc<DrbdConfigurator>>,
    luks: Option<Arc<LuksManager>>,
}

impl ReplicaReconciler {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        manager: Arc<ReplicaManager>,
        publisher: Arc<NodeStatusPublisher>,
        queue: TaskQueue,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            manager,
            publisher,
            queue,
            drbd: None,
            luks: None,
        }
    }

    pub fn with_drbd(mut self, drbd: Arc<DrbdConfigurator>) -> Self {
        self.drbd = Some(drbd);
        self
    }

    pub fn with_luks(mut self, luks: Arc<LuksManager>) -> Self {
        self.luks = Some(luks);
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Process one key; returns false once the queue is shut down
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.process(&key).await;
        true
    }

    async fn process(&self, key: &str) {
        match self.reconcile(key).await {
            Ok(()) => self.queue.forget(key),
            Err(e) => match e.action() {
                ErrorAction::NoRequeue => {
                    error!("Replica {} failed permanently: {}", key, e);
                    self.queue.forget(key);
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!("Replica {} failed, retrying in {:?}: {}", key, delay, e);
                    self.queue.add_after(key, delay);
                }
                ErrorAction::RequeueWithBackoff => {
                    warn!("Replica {} failed, retrying: {}", key, e);
                    self.queue.add_rate_limited(key);
                }
            },
        }
        self.queue.done(key);
    }

    /// Cancellation only interrupts the wait for the next key; an item
    /// already taken runs to completion.
    pub async fn run(&self, token: CancellationToken) {
        info!("Replica reconciler started on {}", self.node_name);
        loop {
            let key = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(&key).await;
        }
        self.queue.shutdown();
        info!("Replica reconciler stopped");
    }

    /// Enqueue the replicas of volumes whose DRBD state changed
    pub async fn watch_ha_events(
        &self,
        mut events: broadcast::Receiver<(String, HaStatus)>,
        token: CancellationToken,
    ) {
        loop {
            let volume = tokio::select! {
                _ = token.cancelled() => break,
                ev = events.recv() => match ev {
                    Ok((volume, _)) => volume,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} DRBD events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            match self.store.list_replicas_by_node(&self.node_name).await {
                Ok(replicas) => replicas
                    .iter()
                    .filter(|r| r.spec.volume_name == volume)
                    .for_each(|r| self.queue.add(kube::ResourceExt::name_any(r))),
                Err(e) => warn!("Failed to list replicas for DRBD event: {}", e),
            }
        }
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let Some(replica) = self.store.get_replica(name).await? else {
            debug!("Replica {} is gone", name);
            return Ok(());
        };
        if replica.spec.node_name != self.node_name {
            return Ok(());
        }

        let state = replica.state();
        if replica.spec.delete
            && !matches!(state, Some(ReplicaState::ToBeDeleted) | Some(ReplicaState::Deleted))
        {
            return self
                .set_state(replica, ReplicaState::ToBeDeleted, "deletion requested")
                .await;
        }

        match state {
            None => self.set_state(replica, ReplicaState::Creating, "").await,
            Some(ReplicaState::Creating) => self.create(replica).await,
            Some(ReplicaState::Ready) | Some(ReplicaState::NotReady) => self.maintain(replica).await,
            Some(ReplicaState::ToBeDeleted) => self.remove(replica).await,
            Some(ReplicaState::Deleted) => {
                info!("Deleting replica object {}", name);
                self.store.delete_replica(name).await
            }
        }
    }

    async fn write_status(
        &self,
        replica: &LocalVolumeReplica,
        status: LocalVolumeReplicaStatus,
    ) -> Result<()> {
        if replica.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = replica.clone();
        updated.status = Some(status);
        self.store.update_replica_status(&updated).await?;
        // next pass picks up the new state
        self.queue.add(kube::ResourceExt::name_any(replica));
        Ok(())
    }

    async fn set_state(
        &self,
        replica: LocalVolumeReplica,
        state: ReplicaState,
        message: &str,
    ) -> Result<()> {
        let mut status = replica.status.clone().unwrap_or_default();
        status.state = Some(state);
        status.message = message.to_string();
        debug!("Replica {} -> {}", replica.spec.volume_name, state);
        self.write_status(&replica, status).await
    }

    async fn encryption_key(&self, volume: &LocalVolume) -> Result<Vec<u8>> {
        let Some(enc) = &volume.spec.encryption else {
            return Err(Error::Configuration("volume is not encrypted".into()));
        };
        let namespace = if enc.secret_namespace.is_empty() {
            volume.spec.pvc_namespace.as_str()
        } else {
            enc.secret_namespace.as_str()
        };
        let secret = self
            .store
            .get_secret(namespace, &enc.secret_name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Secret".into(),
                name: format!("{}/{}", namespace, enc.secret_name),
            })?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(SECRET_KEY_FIELD))
            .map(|b| b.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|d| d.get(SECRET_KEY_FIELD))
                    .map(|s| s.as_bytes().to_vec())
            })
            .ok_or_else(|| Error::Encryption {
                volume: volume.spec.pvc_name.clone(),
                reason: format!("secret {} has no {} field", enc.secret_name, SECRET_KEY_FIELD),
            })
    }

    async fn create(&self, replica: LocalVolumeReplica) -> Result<()> {
        let volume = self.store.get_volume(&replica.spec.volume_name).await?;
        let created = match volume.as_ref().filter(|v| v.is_encrypted()) {
            Some(volume) => {
                let key = self.encryption_key(volume).await?;
                self.manager.create_encrypted(&replica, &key).await?
            }
            None => self.manager.create(&replica).await?,
        };
        info!(
            target: "audit",
            "Created replica {} of {} bytes in {}",
            replica.spec.volume_name,
            created.allocated_capacity_bytes(),
            replica.spec.pool_name
        );

        let mut status = created.status.unwrap_or_default();
        status.state = Some(ReplicaState::NotReady);
        self.write_status(&replica, status).await?;
        self.publisher.publish(None).await
    }

    async fn maintain(&self, replica: LocalVolumeReplica) -> Result<()> {
        let volume = self.store.get_volume(&replica.spec.volume_name).await?;
        let required = replica.spec.required_capacity_bytes;
        let allocated = replica.allocated_capacity_bytes();

        if replica.is_ready()
            && self.manager.kind_of(&replica) == VolumeKind::Lvm
            && required > allocated + VOLUME_EXPANSION_MIN
        {
            info!(
                "Expanding replica {} from {} to {} bytes",
                replica.spec.volume_name, allocated, required
            );
            let expanded = self.manager.expand(&replica, required).await?;
            let mut status = expanded.status.unwrap_or_default();
            status.state = Some(ReplicaState::NotReady);
            status.message = "expanded".into();
            self.write_status(&replica, status).await?;
            return self.publisher.publish(None).await;
        }

        let tested = self.manager.test(&replica).await?;
        let mut status = tested.status.unwrap_or_default();
        // keep fields the executor does not own
        if let Some(prev) = &replica.status {
            status.in_use = prev.in_use;
            if status.ha_state.is_none() {
                status.ha_state = prev.ha_state.clone();
            }
        }

        if let Some(volume) = &volume {
            if status.state == Some(ReplicaState::Ready) {
                if let Err(e) = self.attach(&replica, volume, &mut status).await {
                    status.state = Some(ReplicaState::NotReady);
                    status.message = e.to_string();
                    self.write_status(&replica, status).await?;
                    return Err(e);
                }
            }
        }

        self.write_status(&replica, status).await?;
        self.publisher.publish(None).await
    }

    /// Encryption mapping and DRBD resource on top of a usable backing
    async fn attach(
        &self,
        replica: &LocalVolumeReplica,
        volume: &LocalVolume,
        status: &mut LocalVolumeReplicaStatus,
    ) -> Result<()> {
        let volume_name = &replica.spec.volume_name;
        let mut disk = status.storage_path.clone();

        if volume.is_encrypted() {
            let luks = self.luks.as_ref().ok_or_else(|| {
                Error::Configuration("encryption requested but not configured".into())
            })?;
            let key = self.encryption_key(volume).await?;
            disk = luks.open_volume(volume_name, &status.storage_path, &key).await?;
            status.device_path = disk.clone();
        }

        if replica.spec.kind != VolumeKind::Lvm {
            return Ok(());
        }
        if !volume.needs_ha_resource() {
            // left over when the volume was converted back to non-HA
            if let Some(drbd) = &self.drbd {
                if status.ha_state.is_some() || drbd.is_configured(volume_name).await {
                    drbd.delete_config(&replica.spec.pool_name, volume_name).await?;
                    status.ha_state = None;
                    status.synced = false;
                }
            }
            return Ok(());
        }
        let Some(drbd) = &self.drbd else {
            return Err(Error::Configuration("HA volume but DRBD is not configured".into()));
        };
        let Some(config) = &volume.spec.config else {
            status.state = Some(ReplicaState::NotReady);
            status.message = "waiting for HA placement".into();
            return Ok(());
        };

        let outcome = drbd
            .ensure_config(config, &replica.spec.pool_name, &disk)
            .await?;
        status.device_path = outcome.device_path;
        if outcome.initialized {
            let mut updated = volume.clone();
            if let Some(c) = updated.spec.config.as_mut() {
                c.initialized = true;
            }
            self.store.update_volume(&updated).await?;
            info!("DRBD resource {} initialized", volume_name);
        }

        let ha = drbd.test(volume_name).await;
        status.synced = ha.state == HaState::Consistent;
        status.ha_state = Some(ha);
        Ok(())
    }

    async fn remove(&self, replica: LocalVolumeReplica) -> Result<()> {
        let volume_name = &replica.spec.volume_name;
        let encrypted = self
            .store
            .get_volume(volume_name)
            .await?
            .is_some_and(|v| v.is_encrypted());
        let storage_path = replica
            .status
            .as_ref()
            .map(|s| s.storage_path.clone())
            .unwrap_or_default();

        if let Some(drbd) = self.drbd.as_ref().filter(|_| replica.spec.kind == VolumeKind::Lvm) {
            let has_ha = replica
                .status
                .as_ref()
                .is_some_and(|s| s.ha_state.is_some());
            if has_ha || drbd.is_configured(volume_name).await {
                drbd.delete_config(&replica.spec.pool_name, volume_name).await?;
            }
        }
        if let Some(luks) = &self.luks {
            if encrypted && !storage_path.is_empty() && replica.spec.kind != VolumeKind::Ram {
                luks.decrypt_volume(volume_name, &storage_path).await?;
            }
        }

        self.manager.delete(&replica).await?;
        info!(target: "audit", "Deleted replica {} from {}", volume_name, replica.spec.pool_name);

        self.set_state(replica, ReplicaState::Deleted, "").await?;
        self.publisher.publish(None).await
    }
}
