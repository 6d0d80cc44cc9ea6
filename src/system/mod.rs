//! System orchestration and thread management.
//!
//! Contains the top-level `VioSystem` that owns the bounded input queues and
//! spawns the estimator worker, along with the shared state and the message
//! types crossing the queues.

pub mod messages;
pub mod shared_state;
mod vio_system;

pub use messages::{KeypointId, MargData, OpticalFlowResult, VioVisualizationData};
pub use shared_state::SharedState;
pub use vio_system::VioSystem;
