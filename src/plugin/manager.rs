//! Per-name cache of live plugin connections

use super::protocol::{Request, Response};
use super::supervisor::{PluginConnection, PluginLauncher, PluginTarget};
use super::PluginError;
use crate::config::{ConfigError, ControllerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

type Slot = Arc<AsyncMutex<Option<PluginConnection>>>;

/// Owns at most one running plugin per configured name
///
/// Each name has its own async slot: the first caller starts the plugin while
/// concurrent callers wait on the slot and then reuse the connection.
pub struct PluginManager {
    config: ControllerConfig,
    launcher: Arc<dyn PluginLauncher>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl PluginManager {
    pub fn new(config: ControllerConfig, launcher: Arc<dyn PluginLauncher>) -> Self {
        PluginManager {
            config,
            launcher,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.config.plugin(name).is_some()
    }

    fn slot(&self, name: &str) -> Slot {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(name.to_string()).or_default().clone()
    }

    fn target(&self, name: &str) -> Result<PluginTarget, PluginError> {
        let entry = self
            .config
            .plugin(name)
            .ok_or_else(|| ConfigError::PluginNotConfigured(name.to_string()))?;
        Ok(PluginTarget {
            name: name.to_string(),
            path: self.config.plugin_location(name)?,
            sha256: entry.sha256.clone(),
        })
    }

    async fn start(&self, name: &str) -> Result<PluginConnection, PluginError> {
        let target = self.target(name)?;
        let mut conn = self.launcher.launch(&target).await?;

        match conn.call(Request::InitPlugin).await? {
            Response::Ack { error } => error.into_result()?,
            other => {
                return Err(PluginError::UnexpectedResponse {
                    method: "InitPlugin",
                    detail: format!("{:?}", other),
                })
            }
        }

        info!(plugin = %name, "Plugin started");
        Ok(conn)
    }

    /// Forward one request to the named plugin, starting it if needed
    ///
    /// The cached connection is probed with `Ping` first; a dead or broken
    /// one is dropped (killing its process) and replaced. A failed call also
    /// invalidates the connection so the next call starts fresh.
    pub async fn call(&self, name: &str, request: Request) -> Result<Response, PluginError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;

        let healthy = match guard.as_mut() {
            Some(conn) => {
                conn.is_alive() && matches!(conn.call(Request::Ping).await, Ok(Response::Pong))
            }
            None => false,
        };
        if !healthy {
            if guard.take().is_some() {
                warn!(plugin = %name, "Plugin connection lost, restarting");
            }
            *guard = Some(self.start(name).await?);
        }

        let Some(conn) = guard.as_mut() else {
            return Err(PluginError::Exited(name.to_string()));
        };
        let result = conn.call(request).await;
        if let Err(e) = &result {
            warn!(plugin = %name, error = %e, "Plugin call failed, discarding connection");
            *guard = None;
        }
        result
    }

    /// Stop every running plugin
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = match self.slots.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for slot in slots {
            slot.lock().await.take();
        }
    }
}
