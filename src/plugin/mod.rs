//! Out-of-process traffic router plugins
//!
//! The controller side ([`PluginManager`] and [`PluginClient`]) starts
//! plugin executables on demand and forwards the traffic routing contract to
//! them. The plugin side ([`server::serve`]) lets a plugin author implement
//! [`server::TrafficRouterPlugin`] and get the protocol for free.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use client::PluginClient;
pub use manager::PluginManager;
pub use supervisor::{PluginLauncher, ProcessLauncher};

use crate::config::ConfigError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unable to start plugin {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {path} checksum mismatch: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("plugin transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin message could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("plugin {name} did not answer within {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("plugin {0} exited")]
    Exited(String),

    #[error("{0}")]
    Rpc(String),

    #[error("unexpected response to {method}: {detail}")]
    UnexpectedResponse { method: &'static str, detail: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
#[path = "plugin_test.rs"]
mod tests;
