//! Error types shared by the core wire/URL layer.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while normalizing URLs or framing wire messages.
#[derive(Error, Debug)]
pub enum Error {
    /// The relay URL is syntactically invalid.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The relay URL matches a blocklist pattern.
    #[error("blocked relay URL '{url}': {reason}")]
    BlockedUrl { url: String, reason: String },

    /// An inbound frame could not be parsed as a protocol message.
    #[error("protocol parse error: {0}")]
    Parse(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
