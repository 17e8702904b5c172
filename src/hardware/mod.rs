//! Hardware Module
//!
//! Disk inventory of the node (PCI filter, class, capacity, state) and the
//! periodic SMART health manager.

pub mod discovery;
pub mod health;

pub use discovery::*;
pub use health::{HealthConfig, HealthManager, HealthSummary};
