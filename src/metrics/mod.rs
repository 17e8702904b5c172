//! Prometheus exporter
//!
//! Gauges are rebuilt from the registry, the last health scan and the
//! volume operation objects on every scrape, so a stale label set never
//! outlives the object it describes.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

use crate::controller::store::ObjectStore;
use crate::crd::{operation_duration_secs, OperationStatus, ReplicaState};
use crate::error::{Error, Result};
use crate::hardware::HealthManager;
use crate::storage::LocalRegistry;

const REPLICA_STATES: [ReplicaState; 5] = [
    ReplicaState::Creating,
    ReplicaState::Ready,
    ReplicaState::NotReady,
    ReplicaState::ToBeDeleted,
    ReplicaState::Deleted,
];

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
    Ok(gauge)
}

pub struct NodeMetrics {
    node_name: String,
    registry: LocalRegistry,
    store: Arc<dyn ObjectStore>,
    health: Option<Arc<HealthManager>>,
    prom: Registry,
    pool_capacity: GaugeVec,
    pool_volumes: GaugeVec,
    replica_allocated: GaugeVec,
    replica_state: GaugeVec,
    operation_duration: GaugeVec,
    smart_attribute: GaugeVec,
}

impl NodeMetrics {
    pub fn new(
        node_name: impl Into<String>,
        registry: LocalRegistry,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let prom = Registry::new();
        Ok(Self {
            node_name: node_name.into(),
            registry,
            store,
            health: None,
            pool_capacity: gauge_vec(
                &prom,
                "hwameistor_pool_capacity_bytes",
                "Pool capacity in bytes",
                &["node", "pool", "kind"],
            )?,
            pool_volumes: gauge_vec(
                &prom,
                "hwameistor_pool_volume_count",
                "Pool volume slots",
                &["node", "pool", "kind"],
            )?,
            replica_allocated: gauge_vec(
                &prom,
                "hwameistor_replica_allocated_bytes",
                "Bytes allocated to a replica",
                &["node", "volume", "pool"],
            )?,
            replica_state: gauge_vec(
                &prom,
                "hwameistor_replica_state",
                "Current replica state",
                &["node", "volume", "state"],
            )?,
            operation_duration: gauge_vec(
                &prom,
                "hwameistor_volume_operation_duration_seconds",
                "Duration of completed volume operations",
                &["operation", "name", "state"],
            )?,
            smart_attribute: gauge_vec(
                &prom,
                "hwameistor_disk_smart_attribute",
                "SMART attribute value",
                &["node", "serial", "attribute"],
            )?,
            prom,
        })
    }

    pub fn with_health(mut self, health: Arc<HealthManager>) -> Self {
        self.health = Some(health);
        self
    }

    fn collect_pools(&self) {
        self.pool_capacity.reset();
        self.pool_volumes.reset();
        let node = self.node_name.as_str();
        for (name, pool) in self.registry.pools() {
            for (kind, capacity, volumes) in [
                ("total", pool.total_capacity_bytes, pool.total_volume_count),
                ("free", pool.free_capacity_bytes, pool.free_volume_count),
                ("used", pool.used_capacity_bytes, pool.used_volume_count),
            ] {
                self.pool_capacity
                    .with_label_values(&[node, &name, kind])
                    .set(capacity as f64);
                self.pool_volumes
                    .with_label_values(&[node, &name, kind])
                    .set(volumes as f64);
            }
        }
    }

    fn collect_replicas(&self) {
        self.replica_allocated.reset();
        self.replica_state.reset();
        let node = self.node_name.as_str();
        for (volume, replica) in self.registry.replicas() {
            self.replica_allocated
                .with_label_values(&[node, &volume, &replica.spec.pool_name])
                .set(replica.allocated_capacity_bytes() as f64);
            let current = replica.state();
            for state in REPLICA_STATES {
                let value = if current == Some(state) { 1.0 } else { 0.0 };
                self.replica_state
                    .with_label_values(&[node, &volume, &state.to_string()])
                    .set(value);
            }
        }
    }

    fn collect_smart(&self) {
        self.smart_attribute.reset();
        let Some(health) = &self.health else {
            return;
        };
        let node = self.node_name.as_str();
        for report in health.reports() {
            let serial = report.serial_number.as_str();
            for attr in &report.check.attributes {
                self.smart_attribute
                    .with_label_values(&[node, serial, &attr.name])
                    .set(attr.value as f64);
            }
            for (name, value) in &report.check.nvme_health {
                self.smart_attribute
                    .with_label_values(&[node, serial, name])
                    .set(*value as f64);
            }
        }
    }

    fn record_operation(
        &self,
        operation: &str,
        name: &str,
        created: Option<&DateTime<Utc>>,
        status: Option<&OperationStatus>,
    ) {
        let Some(secs) = operation_duration_secs(created, status) else {
            return;
        };
        let state = status
            .and_then(|s| s.state)
            .map(|s| s.to_string())
            .unwrap_or_default();
        self.operation_duration
            .with_label_values(&[operation, name, &state])
            .set(secs);
    }

    async fn collect_operations(&self) -> Result<()> {
        self.operation_duration.reset();
        for m in self.store.list_migrates().await? {
            let created = m.creation_timestamp().map(|t| t.0);
            self.record_operation("migrate", &m.name_any(), created.as_ref(), m.status.as_ref());
        }
        for c in self.store.list_converts().await? {
            let created = c.creation_timestamp().map(|t| t.0);
            self.record_operation("convert", &c.name_any(), created.as_ref(), c.status.as_ref());
        }
        for e in self.store.list_expands().await? {
            let created = e.creation_timestamp().map(|t| t.0);
            self.record_operation("expand", &e.name_any(), created.as_ref(), e.status.as_ref());
        }
        Ok(())
    }

    /// Refresh all gauges and render the text exposition
    pub async fn render(&self) -> Result<String> {
        self.collect_pools();
        self.collect_replicas();
        self.collect_smart();
        if let Err(e) = self.collect_operations().await {
            warn!("Skipping operation metrics: {}", e);
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.prom.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))
    }
}
