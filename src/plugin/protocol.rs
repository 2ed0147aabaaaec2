//! Wire protocol between the controller and traffic router plugins
//!
//! Newline-delimited JSON over the plugin's stdin/stdout. The plugin speaks
//! first with a [`Handshake`]; afterwards every line from the controller is a
//! [`RequestFrame`] and every line back is the [`ResponseFrame`] with the
//! same id.

use super::PluginError;
use crate::crd::rollout::Rollout;
use crate::trafficrouting::{SetHeaderRoute, SetMirrorRoute, WeightDestination};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_COOKIE_KEY: &str = "ROLLGATE_RPC_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "trafficrouter";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "magicKey")]
    pub magic_key: String,
    #[serde(rename = "magicValue")]
    pub magic_value: String,
}

impl Handshake {
    pub fn expected() -> Self {
        Handshake {
            protocol_version: PROTOCOL_VERSION,
            magic_key: MAGIC_COOKIE_KEY.to_string(),
            magic_value: MAGIC_COOKIE_VALUE.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(PluginError::Handshake(format!(
                "protocol version {} not supported (want {})",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }
        if self.magic_key != MAGIC_COOKIE_KEY || self.magic_value != MAGIC_COOKIE_VALUE {
            return Err(PluginError::Handshake("magic cookie mismatch".to_string()));
        }
        Ok(())
    }
}

/// Error value carried in responses; an empty string means success
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcError {
    #[serde(rename = "errorString", default)]
    pub error_string: String,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        RpcError {
            error_string: message.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.error_string.is_empty()
    }

    pub fn into_result(self) -> Result<(), PluginError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(PluginError::Rpc(self.error_string))
        }
    }
}

impl From<Result<(), RpcError>> for RpcError {
    fn from(result: Result<(), RpcError>) -> Self {
        result.err().unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UpdateHashArgs {
    pub rollout: Rollout,
    #[serde(rename = "canaryHash")]
    pub canary_hash: String,
    #[serde(rename = "stableHash")]
    pub stable_hash: String,
    #[serde(rename = "additionalDestinations", default)]
    pub additional_destinations: Vec<WeightDestination>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WeightArgs {
    pub rollout: Rollout,
    #[serde(rename = "desiredWeight")]
    pub desired_weight: i32,
    #[serde(rename = "additionalDestinations", default)]
    pub additional_destinations: Vec<WeightDestination>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HeaderRouteArgs {
    pub rollout: Rollout,
    #[serde(rename = "headerRoute")]
    pub header_route: SetHeaderRoute,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MirrorRouteArgs {
    pub rollout: Rollout,
    #[serde(rename = "mirrorRoute")]
    pub mirror_route: SetMirrorRoute,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RolloutArgs {
    pub rollout: Rollout,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    InitPlugin,
    Ping,
    Type,
    UpdateHash(UpdateHashArgs),
    SetWeight(WeightArgs),
    VerifyWeight(WeightArgs),
    SetHeaderRoute(HeaderRouteArgs),
    SetMirrorRoute(MirrorRouteArgs),
    RemoveManagedRoutes(RolloutArgs),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::InitPlugin => "InitPlugin",
            Request::Ping => "Ping",
            Request::Type => "Type",
            Request::UpdateHash(_) => "UpdateHash",
            Request::SetWeight(_) => "SetWeight",
            Request::VerifyWeight(_) => "VerifyWeight",
            Request::SetHeaderRoute(_) => "SetHeaderRoute",
            Request::SetMirrorRoute(_) => "SetMirrorRoute",
            Request::RemoveManagedRoutes(_) => "RemoveManagedRoutes",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    Ack {
        #[serde(default)]
        error: RpcError,
    },
    Verified {
        verified: bool,
        #[serde(default)]
        error: RpcError,
    },
    Type {
        name: String,
    },
    Pong,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: Response,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_wire_format() {
        let line = serde_json::to_string(&Handshake::expected()).unwrap();
        assert_eq!(
            line,
            r#"{"protocolVersion":1,"magicKey":"ROLLGATE_RPC_PLUGIN","magicValue":"trafficrouter"}"#
        );
    }

    #[test]
    fn test_handshake_rejects_mismatch() {
        let mut wrong_version = Handshake::expected();
        wrong_version.protocol_version = 2;
        assert!(wrong_version.validate().is_err());

        let mut wrong_cookie = Handshake::expected();
        wrong_cookie.magic_value = "metricprovider".to_string();
        assert!(matches!(
            wrong_cookie.validate(),
            Err(PluginError::Handshake(_))
        ));

        assert!(Handshake::expected().validate().is_ok());
    }

    #[test]
    fn test_unit_request_has_no_params() {
        let frame = RequestFrame {
            id: 7,
            request: Request::Ping,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": 7, "request": {"method": "Ping"}})
        );
        let parsed: RequestFrame =
            serde_json::from_value(json!({"id": 8, "request": {"method": "InitPlugin"}})).unwrap();
        assert!(matches!(parsed.request, Request::InitPlugin));
    }

    #[test]
    fn test_response_error_defaults_to_empty() {
        let frame: ResponseFrame =
            serde_json::from_value(json!({"id": 1, "response": {"type": "Ack"}})).unwrap();
        assert_eq!(
            frame.response,
            Response::Ack {
                error: RpcError::default()
            }
        );

        let failed: ResponseFrame = serde_json::from_value(json!({
            "id": 2,
            "response": {"type": "Verified", "verified": false, "error": {"errorString": "boom"}}
        }))
        .unwrap();
        match failed.response {
            Response::Verified { error, .. } => {
                assert!(matches!(error.into_result(), Err(PluginError::Rpc(msg)) if msg == "boom"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
