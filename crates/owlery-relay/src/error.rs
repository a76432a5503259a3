//! Error types for the relay engine.
//!
//! Ambient relay flakiness (socket errors, reconnects) is absorbed by the
//! backoff machinery and only visible as standing connection state; these
//! errors surface from user-initiated operations and input validation.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the relay engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Core wire/URL error.
    #[error(transparent)]
    Core(#[from] owlery_core::Error),

    /// Device has no network connectivity.
    #[error("device is offline")]
    Offline,

    /// The WebSocket connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An operation did not complete before its deadline.
    #[error("timed out")]
    Timeout,

    /// The operation was aborted by its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// Additional (outbox/ephemeral) connections are currently suppressed
    /// by settings or VPN state; the configured relay set is unaffected.
    #[error("additional connections suppressed")]
    Suppressed,

    /// The relay demanded authentication and none could be provided.
    #[error("authentication required")]
    AuthRequired,

    /// The relay rejected our authentication response.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A frame could not be delivered.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The relay rejected the event with the given reason.
    #[error("relay rejected event: {0}")]
    Rejected(String),

    /// The relay is excluded from outbox routing.
    #[error("relay is penalty-boxed: {0}")]
    PenaltyBoxed(String),

    /// A peer's relay-list event declared an unusable configuration and
    /// was discarded from routing in its entirety.
    #[error("misconfigured relay list: {0}")]
    MisconfiguredRelayList(String),

    /// The signer collaborator failed to produce a signature.
    #[error("signer error: {0}")]
    Signer(String),

    /// No signer is configured for an operation that requires one.
    #[error("no signer configured")]
    NoSigner,

    /// Event store collaborator error.
    #[error("event store error: {0}")]
    Store(String),
}
