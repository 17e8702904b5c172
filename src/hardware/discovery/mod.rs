//! Hardware Discovery Module
//!
//! Finds the PCI-attached disks of the node and probes their SMART health.

pub mod scanner;
pub mod smartctl;

pub use scanner::*;
pub use smartctl::*;
