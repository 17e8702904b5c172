//! Admission webhook
//!
//! Mutating webhook that routes pods with HwameiStor volumes to the
//! HwameiStor scheduler and injects the dataset loader.

pub mod mutate;
pub mod server;

pub use mutate::{FailurePolicy, MutateConfig, PodMutator};
pub use server::{run_webhook_server, WebhookServerConfig};
