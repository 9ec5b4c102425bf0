//! Relay message classification and handshake transitions

use outpost_shared::protocol::{ClientMessage, RelayMessage, ECHO_PREFIX, LOGIN_OK};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::session::{LinkState, Session};

/// What an inbound relay frame means to the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(RelayMessage),
    Echo(String),
    Suspend,
    Request(Vec<u8>),
    Ignored,
}

/// Classify a text frame. Malformed control text never becomes a request.
pub fn classify_text(text: &str) -> Inbound {
    if text.is_empty() {
        return Inbound::Ignored;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        let ty = map.get("type").and_then(Value::as_str).map(str::to_owned);
        if let Some(ty) = ty.filter(|t| RelayMessage::is_known_type(t)) {
            return match serde_json::from_value(Value::Object(map)) {
                Ok(msg) => Inbound::Control(msg),
                Err(e) => {
                    warn!("Malformed '{}' control message: {}", ty, e);
                    Inbound::Ignored
                }
            };
        }
    }

    match text.strip_prefix(ECHO_PREFIX) {
        Some(rest) => Inbound::Echo(rest.trim().to_string()),
        None => {
            debug!("Dropping unrecognized text frame ({} bytes)", text.len());
            Inbound::Ignored
        }
    }
}

/// Classify a binary frame against the session's suspend marker
pub fn classify_binary(payload: Vec<u8>, suspend: Option<&[u8]>) -> Inbound {
    if payload.is_empty() {
        Inbound::Ignored
    } else if suspend == Some(payload.as_slice()) {
        Inbound::Suspend
    } else {
        Inbound::Request(payload)
    }
}

/// Apply a relay control message to the session and return the reply to
/// send, if any.
pub fn on_control(session: &mut Session, config: &TunnelConfig, msg: RelayMessage) -> Option<ClientMessage> {
    match msg {
        RelayMessage::Hello => {
            debug!("Relay greeting received, logging in as '{}'", config.device);
            session.state = LinkState::AwaitingLoginAck;
            Some(ClientMessage::Login {
                domain: config.domain.clone(),
                secret: config.secret.clone(),
                device: config.device.clone(),
            })
        }
        RelayMessage::Login { status, primary } => {
            if status != LOGIN_OK {
                error!("Login rejected by relay (status: {})", status);
                return None;
            }
            session.primary = primary;
            session.state = LinkState::Active;
            debug!("Logged in (primary: {}), starting forwarding", primary);
            Some(ClientMessage::Start { usage: config.visibility })
        }
        RelayMessage::Start { suspend, eof } => {
            session.suspend = Some(suspend.into_bytes());
            session.eof = Some(eof.into_bytes());
            session.state = LinkState::Active;
            info!(
                "Tunnel online: {} -> {}:{}",
                config.public_url(session.primary),
                config.local_host,
                config.local_port
            );
            None
        }
        RelayMessage::Error { message } => {
            error!("Relay error: {}", message);
            None
        }
    }
}
