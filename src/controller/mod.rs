pub mod clock;
pub mod experiment;
pub mod pause;
pub mod rollout;
pub mod validation;

use crate::controller::experiment::client::ClientError;
use crate::trafficrouting::TrafficRoutingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("traffic routing: {0}")]
    TrafficRouting(#[from] TrafficRoutingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} missing namespace")]
    MissingNamespace { kind: &'static str },
}

pub use rollout::{reconcile, Context};
