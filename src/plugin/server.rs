//! Plugin side of the protocol
//!
//! A plugin binary implements [`TrafficRouterPlugin`] and calls
//! [`serve_stdio`] from `main`.

use super::protocol::{
    Handshake, Request, RequestFrame, Response, ResponseFrame, RpcError, MAGIC_COOKIE_KEY,
    MAGIC_COOKIE_VALUE,
};
use super::PluginError;
use crate::crd::rollout::Rollout;
use crate::trafficrouting::{SetHeaderRoute, SetMirrorRoute, WeightDestination};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[async_trait]
pub trait TrafficRouterPlugin: Send + Sync {
    /// Called once after the handshake; an error aborts the plugin start
    async fn init(&self) -> Result<(), RpcError> {
        Ok(())
    }

    fn type_name(&self) -> String;

    async fn update_hash(
        &self,
        _rollout: &Rollout,
        _canary_hash: &str,
        _stable_hash: &str,
        _additional: &[WeightDestination],
    ) -> Result<(), RpcError> {
        Ok(())
    }

    async fn set_weight(
        &self,
        rollout: &Rollout,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<(), RpcError>;

    async fn verify_weight(
        &self,
        rollout: &Rollout,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<bool, RpcError>;

    async fn set_header_route(
        &self,
        _rollout: &Rollout,
        _route: &SetHeaderRoute,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    async fn set_mirror_route(
        &self,
        _rollout: &Rollout,
        _route: &SetMirrorRoute,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    async fn remove_managed_routes(&self, _rollout: &Rollout) -> Result<(), RpcError> {
        Ok(())
    }
}

async fn dispatch<P: TrafficRouterPlugin + ?Sized>(plugin: &P, request: Request) -> Response {
    let ack = |result: Result<(), RpcError>| Response::Ack {
        error: result.into(),
    };
    match request {
        Request::InitPlugin => ack(plugin.init().await),
        Request::Ping => Response::Pong,
        Request::Type => Response::Type {
            name: plugin.type_name(),
        },
        Request::UpdateHash(args) => ack(
            plugin
                .update_hash(
                    &args.rollout,
                    &args.canary_hash,
                    &args.stable_hash,
                    &args.additional_destinations,
                )
                .await,
        ),
        Request::SetWeight(args) => ack(
            plugin
                .set_weight(&args.rollout, args.desired_weight, &args.additional_destinations)
                .await,
        ),
        Request::VerifyWeight(args) => match plugin
            .verify_weight(&args.rollout, args.desired_weight, &args.additional_destinations)
            .await
        {
            Ok(verified) => Response::Verified {
                verified,
                error: RpcError::default(),
            },
            Err(error) => Response::Verified {
                verified: false,
                error,
            },
        },
        Request::SetHeaderRoute(args) => {
            ack(plugin.set_header_route(&args.rollout, &args.header_route).await)
        }
        Request::SetMirrorRoute(args) => {
            ack(plugin.set_mirror_route(&args.rollout, &args.mirror_route).await)
        }
        Request::RemoveManagedRoutes(args) => ack(plugin.remove_managed_routes(&args.rollout).await),
    }
}

/// Announce the handshake, then answer requests until the reader closes
pub async fn serve<R, W, P>(reader: R, mut writer: W, plugin: &P) -> Result<(), PluginError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    P: TrafficRouterPlugin + ?Sized,
{
    let mut handshake = serde_json::to_vec(&Handshake::expected())?;
    handshake.push(b'\n');
    writer.write_all(&handshake).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                continue;
            }
        };
        debug!(id = frame.id, method = frame.request.method(), "Plugin request");

        let response = dispatch(plugin, frame.request).await;
        let mut out = serde_json::to_vec(&ResponseFrame {
            id: frame.id,
            response,
        })?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve over stdin/stdout when launched by the controller
pub async fn serve_stdio<P: TrafficRouterPlugin + ?Sized>(plugin: &P) -> Result<(), PluginError> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(PluginError::Handshake(format!(
            "this binary is a plugin and must be started by the controller ({} not set)",
            MAGIC_COOKIE_KEY
        )));
    }
    serve(tokio::io::stdin(), tokio::io::stdout(), plugin).await
}
