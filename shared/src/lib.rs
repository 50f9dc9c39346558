//! AgentMesh shared components.
//!
//! Data model, error taxonomy, wire codec, and ID types shared between
//! the `agentmesh-core` runtime and any out-of-process client written
//! against the same contract.

pub mod error;
pub mod ids;
pub mod model;
pub mod wire;

pub use error::{CoreError, CoreResult};
pub use ids::{MessageId, PlanId, SubscriptionId, TaskId};

/// Version information for the shared components.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
