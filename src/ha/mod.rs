//! High availability
//!
//! DRBD resources for replicated volumes, the DRBD event stream that feeds
//! replica HA state, and LUKS encryption of replica devices.

pub mod drbd;
pub mod events;
pub mod luks;

pub use drbd::{DrbdConfigurator, DrbdSettings, EnsureOutcome, HaResource, ResourceState};
pub use events::{EventPump, ResourceStatus};
pub use luks::LuksManager;
