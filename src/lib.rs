//! HwameiStor node engine
//!
//! The per-node half of HwameiStor local storage: it discovers disks,
//! builds them into pools, materializes volume replicas on LVM, raw disks
//! or tmpfs, and replicates volumes across nodes with DRBD.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Kubernetes API server                          │
//! │   LocalVolumeReplica · LocalStorageNode · LocalDisk · PhysicalDisk   │
//! └───────────────┬───────────────────────────────────────▲──────────────┘
//!                 │ watch                                 │ status
//! ┌───────────────▼────────────┐   ┌──────────────────────┴──────────────┐
//! │  Replica reconciler        │   │  Node agent / status publisher      │
//! │  (work queue, per node)    │   │  (inventory, pools, consistency)    │
//! └───────┬───────────┬────────┘   └──────────┬──────────────────────────┘
//!         │           │                       │
//! ┌───────▼──────┐ ┌──▼──────────────┐ ┌──────▼─────────┐ ┌──────────────┐
//! │ Replica      │ │ HA configurator │ │ Pool manager   │ │ Disk health  │
//! │ manager      │ │ (DRBD, LUKS)    │ │ (LVM/disk/RAM) │ │ (smartctl)   │
//! └───────┬──────┘ └──┬──────────────┘ └──────┬─────────┘ └──────┬───────┘
//!         └───────────┴──────── Executor (nsenter) ──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`exec`]: command execution on the host
//! - [`hardware`]: disk inventory and SMART health
//! - [`storage`]: pools, replica backends and the local registry
//! - [`ha`]: DRBD replication and LUKS encryption
//! - [`controller`]: reconcilers, node agent and cluster collaborators
//! - [`webhook`]: pod admission mutation
//! - [`metrics`]: Prometheus exporter
//! - [`crd`]: Custom Resource Definitions
//! - [`config`]: node and process configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod exec;
pub mod ha;
pub mod hardware;
pub mod metrics;
pub mod storage;
pub mod webhook;

// Re-export commonly used types
pub use config::{NodeConfig, SystemConfig};

pub use controller::{
    DiskActionController, DiskClaimBinder, Evictor, KubeStore, LeaderConfig, LeaderElector,
    NodeAgent, NodeAgentConfig, NodeStatusPublisher, ObjectStore, ReplicaReconciler, TaskQueue,
};

pub use crd::{
    DiskClass, DiskState, HaState, HaStatus, LocalDisk, LocalPool, LocalStorageNode, LocalVolume,
    LocalVolumeReplica, ReplicaState, VolumeKind,
};

pub use error::{Error, ErrorAction, Result};

pub use exec::{BasicExecutor, ExecParams, ExecResult, Executor, NsExecutor};

pub use ha::{DrbdConfigurator, EventPump, LuksManager};

pub use hardware::{DiskInventory, HealthManager, ScannerConfig, SmartctlClient};

pub use metrics::NodeMetrics;

pub use storage::{
    DiskExecutor, LocalRegistry, LvmExecutor, PoolManager, RamExecutor, ReplicaExecutor,
    ReplicaManager,
};

pub use webhook::{PodMutator, WebhookServerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
