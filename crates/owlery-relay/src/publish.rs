//! One-shot publish with acknowledgment.
//!
//! Opens a dedicated socket, sends one EVENT, and races the relay's `OK`
//! against a deadline. An `auth-required:` rejection is handled
//! transparently: sign the challenge, wait for the auth `OK`, resend the
//! event exactly once. Only a failing or timed-out retry surfaces as an
//! error.
//!
//! Every wait here is a single-use exchange: the response either resolves
//! the pending state or the deadline/cancellation does, never both. A
//! caller-supplied cancellation token aborts cleanly before
//! acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use nostr::{Event, EventBuilder, RelayUrl};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use owlery_core::{CanonicalRelayUrl, ClientMessage, RelayMessage, canonical_relay_url, is_auth_required};

use crate::error::{Error, Result};
use crate::traits::Signer;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a publish resolved without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The relay acknowledged the event.
    Acknowledged,
    /// The caller's cancellation token fired before acknowledgment.
    Cancelled,
}

/// Publishes a single event over a dedicated short-lived connection.
pub struct OneShotPublisher {
    url: CanonicalRelayUrl,
    signer: Arc<dyn Signer>,
    timeout: Duration,
}

impl OneShotPublisher {
    pub fn new(url: &str, signer: Arc<dyn Signer>) -> Result<Self> {
        Ok(Self {
            url: canonical_relay_url(url)?,
            signer,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Publish and await acknowledgment.
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        self.publish_cancellable(event, CancellationToken::new())
            .await
    }

    /// Publish with a caller-supplied cancellation token. Cancellation
    /// before acknowledgment resolves as [`PublishOutcome::Cancelled`],
    /// not an error.
    pub async fn publish_cancellable(
        &self,
        event: &Event,
        cancel: CancellationToken,
    ) -> Result<PublishOutcome> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let connecting = connect_async(self.url.as_str());
        let (socket, _response) = tokio::select! {
            _ = cancel.cancelled() => return Ok(PublishOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout),
            connected = connecting => {
                connected.map_err(|e| Error::ConnectFailed(e.to_string()))?
            }
        };

        let mut exchange = Exchange {
            url: &self.url,
            signer: &*self.signer,
            socket,
            event_id: event.id.to_hex(),
            event_frame: ClientMessage::event(event.clone()).to_json(),
            challenge: None,
            auth_wanted: false,
            auth_event_id: None,
            resent: false,
        };

        exchange.send_event().await?;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(PublishOutcome::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout),
                frame = exchange.socket.next() => frame,
            };

            match frame {
                None => return Err(Error::SendFailed("connection closed".to_string())),
                Some(Err(error)) => return Err(Error::SendFailed(error.to_string())),
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(outcome) = exchange.handle_frame(text.as_str()).await? {
                        return Ok(outcome);
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// In-flight publish exchange state.
struct Exchange<'a> {
    url: &'a str,
    signer: &'a dyn Signer,
    socket: WsStream,
    event_id: String,
    event_frame: String,
    challenge: Option<String>,
    /// The relay answered `auth-required:`; authenticate as soon as a
    /// challenge is available.
    auth_wanted: bool,
    auth_event_id: Option<String>,
    resent: bool,
}

impl Exchange<'_> {
    async fn send_event(&mut self) -> Result<()> {
        let frame = self.event_frame.clone();
        self.send_frame(&frame).await
    }

    async fn send_frame(&mut self, frame: &str) -> Result<()> {
        self.socket
            .send(WsMessage::Text(frame.to_string().into()))
            .await
            .map_err(|e| Error::SendFailed(e.to_string()))
    }

    /// Process one inbound frame; `Some(outcome)` ends the exchange.
    async fn handle_frame(&mut self, text: &str) -> Result<Option<PublishOutcome>> {
        let message = match RelayMessage::parse(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(relay = %self.url, %error, "skipping unparseable frame");
                return Ok(None);
            }
        };

        match message {
            RelayMessage::Auth { challenge } => {
                self.challenge = Some(challenge);
                if self.auth_wanted && self.auth_event_id.is_none() {
                    self.send_auth().await?;
                }
                Ok(None)
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if event_id == self.event_id {
                    self.handle_event_ok(accepted, message).await
                } else if self.auth_event_id.as_deref() == Some(event_id.as_str()) {
                    self.handle_auth_ok(accepted, message).await?;
                    Ok(None)
                } else {
                    tracing::debug!(relay = %self.url, event_id, "ignoring unrelated OK");
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    async fn handle_event_ok(
        &mut self,
        accepted: bool,
        message: String,
    ) -> Result<Option<PublishOutcome>> {
        if accepted {
            counter!("oneshot_publishes_total", "result" => "ok").increment(1);
            return Ok(Some(PublishOutcome::Acknowledged));
        }
        if is_auth_required(&message) {
            if self.resent {
                // Authenticated and retried once already; give up.
                return Err(Error::AuthRequired);
            }
            self.auth_wanted = true;
            if self.challenge.is_some() && self.auth_event_id.is_none() {
                self.send_auth().await?;
            }
            return Ok(None);
        }
        counter!("oneshot_publishes_total", "result" => "rejected").increment(1);
        Err(Error::Rejected(message))
    }

    async fn handle_auth_ok(&mut self, accepted: bool, message: String) -> Result<()> {
        if !accepted {
            return Err(Error::AuthFailed(message));
        }
        // Authenticated: retry the event, exactly once.
        self.resent = true;
        self.send_event().await
    }

    async fn send_auth(&mut self) -> Result<()> {
        let Some(challenge) = self.challenge.clone() else {
            return Ok(());
        };
        let relay_url =
            RelayUrl::parse(self.url).map_err(|e| Error::ConnectFailed(e.to_string()))?;
        let unsigned = EventBuilder::auth(challenge, relay_url).build(self.signer.public_key());
        let signed = self.signer.sign_event(unsigned).await?;
        self.auth_event_id = Some(signed.id.to_hex());
        let frame = ClientMessage::auth(signed).to_json();
        tracing::debug!(relay = %self.url, "sending auth response");
        self.send_frame(&frame).await
    }
}
