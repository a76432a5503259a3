//! Wire protocol frames (JSON-array framing over WebSocket).
//!
//! Client→relay: `REQ`, `CLOSE`, `EVENT`, `AUTH`.
//! Relay→client: `EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`, `AUTH`.
//!
//! Each WebSocket text frame is one JSON array. A frame that fails to
//! parse is an error on that frame only; callers log it and keep the
//! connection alive.

use nostr::{Event, JsonUtil};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::filter::Filter;

/// The machine-readable `OK` reason prefix that triggers the
/// authenticate-then-retry sequence.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

/// True when an `OK`/`CLOSED` reason demands NIP-42 authentication.
pub fn is_auth_required(reason: &str) -> bool {
    reason.starts_with(AUTH_REQUIRED_PREFIX)
}

/// A client→relay frame, ready to serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    Event {
        event: Box<Event>,
    },
    Auth {
        event: Box<Event>,
    },
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn event(event: Event) -> Self {
        Self::Event {
            event: Box::new(event),
        }
    }

    pub fn auth(event: Event) -> Self {
        Self::Auth {
            event: Box::new(event),
        }
    }

    /// Serialize to the JSON-array wire form.
    pub fn to_json(&self) -> String {
        match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                frame.extend(
                    filters
                        .iter()
                        .map(|f| serde_json::to_value(f).unwrap_or(Value::Null)),
                );
                Value::Array(frame).to_string()
            }
            Self::Close { subscription_id } => {
                Value::Array(vec![json!("CLOSE"), json!(subscription_id)]).to_string()
            }
            Self::Event { event } => format!("[\"EVENT\",{}]", event.as_json()),
            Self::Auth { event } => format!("[\"AUTH\",{}]", event.as_json()),
        }
    }
}

/// A relay→client frame, parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::Parse(format!("not JSON: {e}")))?;

        let frame = value
            .as_array()
            .ok_or_else(|| Error::Parse("frame is not a JSON array".to_string()))?;

        let kind = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse("frame has no type element".to_string()))?;

        match kind {
            "EVENT" => {
                let subscription_id = str_at(frame, 1, "EVENT")?;
                let event_value = frame
                    .get(2)
                    .ok_or_else(|| Error::Parse("EVENT frame missing payload".to_string()))?;
                let event = serde_json::from_value::<Event>(event_value.clone())
                    .map_err(|e| Error::Parse(format!("bad event payload: {e}")))?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => {
                let event_id = str_at(frame, 1, "OK")?;
                let accepted = frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::Parse("OK frame missing success flag".to_string()))?;
                let message = frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(Self::Eose {
                subscription_id: str_at(frame, 1, "EOSE")?,
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: str_at(frame, 1, "CLOSED")?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Ok(Self::Notice {
                message: str_at(frame, 1, "NOTICE")?,
            }),
            "AUTH" => Ok(Self::Auth {
                challenge: str_at(frame, 1, "AUTH")?,
            }),
            other => Err(Error::Parse(format!("unknown frame type '{other}'"))),
        }
    }
}

fn str_at(frame: &[Value], index: usize, kind: &str) -> Result<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Parse(format!("{kind} frame missing element {index}")))
}
