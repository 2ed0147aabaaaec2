//! Plugin subprocess supervision
//!
//! A [`PluginLauncher`] produces a handshake-verified [`PluginConnection`].
//! The production launcher spawns the plugin executable; tests hand back
//! in-memory pipes.

use super::protocol::{
    Handshake, Request, RequestFrame, Response, ResponseFrame, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
};
use super::PluginError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where and how to start a plugin
#[derive(Clone, Debug, PartialEq)]
pub struct PluginTarget {
    pub name: String,
    pub path: PathBuf,
    pub sha256: Option<String>,
}

/// Request/response channel to one running plugin
pub struct PluginConnection {
    name: String,
    lines: Lines<BufReader<BoxedReader>>,
    writer: BoxedWriter,
    next_id: u64,
    timeout: Duration,
    process: Option<Child>,
    broken: bool,
}

impl PluginConnection {
    /// Wait for the plugin's handshake line and check it
    pub async fn establish(
        name: &str,
        reader: BoxedReader,
        writer: BoxedWriter,
        process: Option<Child>,
        timeout: Duration,
    ) -> Result<Self, PluginError> {
        let mut lines = BufReader::new(reader).lines();
        let line = tokio::time::timeout(timeout, lines.next_line())
            .await
            .map_err(|_| PluginError::Timeout {
                name: name.to_string(),
                after: timeout,
            })??
            .ok_or_else(|| PluginError::Handshake("plugin closed stdout before handshake".to_string()))?;

        let handshake: Handshake = serde_json::from_str(&line)
            .map_err(|e| PluginError::Handshake(format!("unreadable handshake: {}", e)))?;
        handshake.validate()?;
        debug!(plugin = %name, "Plugin handshake accepted");

        Ok(PluginConnection {
            name: name.to_string(),
            lines,
            writer,
            next_id: 0,
            timeout,
            process,
            broken: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once a call failed or the subprocess exited
    pub fn is_alive(&mut self) -> bool {
        if self.broken {
            return false;
        }
        match self.process.as_mut().map(|p| p.try_wait()) {
            None | Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!(plugin = %self.name, status = %status, "Plugin process exited");
                false
            }
            Some(Err(e)) => {
                warn!(plugin = %self.name, error = %e, "Unable to poll plugin process");
                false
            }
        }
    }

    /// Send one request and wait for its response
    ///
    /// Any failure marks the connection broken so it is not reused.
    pub async fn call(&mut self, request: Request) -> Result<Response, PluginError> {
        let result = tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .unwrap_or_else(|_| {
                Err(PluginError::Timeout {
                    name: self.name.clone(),
                    after: self.timeout,
                })
            });
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn exchange(&mut self, request: Request) -> Result<Response, PluginError> {
        self.next_id += 1;
        let id = self.next_id;
        let method = request.method();

        let mut line = serde_json::to_vec(&RequestFrame { id, request })?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        let reply = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| PluginError::Exited(self.name.clone()))?;
        let frame: ResponseFrame = serde_json::from_str(&reply)?;
        if frame.id != id {
            return Err(PluginError::UnexpectedResponse {
                method,
                detail: format!("response id {} for request {}", frame.id, id),
            });
        }
        Ok(frame.response)
    }
}

/// Starts plugins and returns a connection that passed the handshake
#[async_trait]
pub trait PluginLauncher: Send + Sync {
    async fn launch(&self, target: &PluginTarget) -> Result<PluginConnection, PluginError>;
}

/// Spawns plugin executables with piped stdio
pub struct ProcessLauncher {
    timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(timeout: Duration) -> Self {
        ProcessLauncher { timeout }
    }
}

/// Check a plugin binary against its pinned digest
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), PluginError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| PluginError::Spawn {
        path: path.to_path_buf(),
        source,
    })?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(PluginError::Checksum {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(&self, target: &PluginTarget) -> Result<PluginConnection, PluginError> {
        if let Some(expected) = &target.sha256 {
            verify_checksum(&target.path, expected).await?;
        }

        info!(plugin = %target.name, path = %target.path.display(), "Starting plugin process");
        let mut child = Command::new(&target.path)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PluginError::Spawn {
                path: target.path.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Handshake("plugin stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Handshake("plugin stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = target.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(plugin = %name, "{}", line);
                }
            });
        }

        PluginConnection::establish(
            &target.name,
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            self.timeout,
        )
        .await
    }
}
