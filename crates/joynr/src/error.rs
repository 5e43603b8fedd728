// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Core error type.
//!
//! Variants are grouped by how the messaging core reacts to them:
//! transient failures are retried until the owning message's TTL runs out,
//! terminal routing failures are reported once through the message's
//! failure callback, malformed input aborts the single affected item, and
//! subscription-domain errors travel to the remote peer inside a
//! `SubscriptionReply` instead of being raised locally.

/// Errors produced by the messaging core.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Transient transport failures (retryable until message expiry)
    // ========================================================================
    /// Transport temporarily unavailable (connection lost, broker down).
    TransportUnavailable(String),
    /// A single delivery attempt failed; the message may be retried.
    SendFailed(String),

    // ========================================================================
    // Terminal routing failures
    // ========================================================================
    /// No route to the recipient and resolution options are exhausted.
    NoRouteAvailable(String),
    /// The message's expiry date passed before delivery succeeded.
    MessageExpired(String),
    /// Address cannot be turned into a transport stub.
    InvalidAddress(String),

    // ========================================================================
    // Malformed input
    // ========================================================================
    /// JSON (de)serialization failed.
    Serialization(String),
    /// Caller-supplied argument is invalid (bad partition, empty id, ...).
    InvalidArgument(String),

    // ========================================================================
    // Subscription domain
    // ========================================================================
    /// No subscription registered under the given id.
    SubscriptionNotFound(String),
    /// Expected publication did not arrive within the alert interval.
    PublicationMissed(String),
    /// Target provider is not (or no longer) registered.
    ProviderMissing(String),
    /// Provider-side exception delivered inside a publication or reply.
    ProviderRuntime(String),

    // ========================================================================
    // Other
    // ========================================================================
    /// Component is shutting down; new work is refused.
    ShuttingDown,
    /// File I/O error (persistence).
    Io(std::io::Error),
}

impl Error {
    /// Whether a failed delivery attempt with this error may be retried
    /// (bounded by the message's own expiry, never by attempt count).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportUnavailable(_) | Error::SendFailed(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Transient
            Error::TransportUnavailable(msg) => write!(f, "Transport unavailable: {}", msg),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            // Terminal routing
            Error::NoRouteAvailable(id) => write!(f, "No route available for participant: {}", id),
            Error::MessageExpired(id) => write!(f, "Message expired: {}", id),
            Error::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            // Malformed input
            Error::Serialization(msg) => write!(f, "Serialization failed: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            // Subscription domain
            Error::SubscriptionNotFound(id) => write!(f, "Subscription not found: {}", id),
            Error::PublicationMissed(id) => {
                write!(f, "Missed publication for subscription: {}", id)
            }
            Error::ProviderMissing(id) => write!(f, "Provider not registered: {}", id),
            Error::ProviderRuntime(msg) => write!(f, "Provider exception: {}", msg),
            // Other
            Error::ShuttingDown => write!(f, "Component is shutting down"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Convenient alias for results using the core [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;

/// Success continuation for asynchronous operations.
pub type OnSuccess = Box<dyn FnOnce() + Send>;

/// Failure continuation for asynchronous operations.
///
/// Errors never cross an asynchronous boundary as panics or return values;
/// they always travel through one of these.
pub type OnError = Box<dyn FnOnce(Error) + Send>;
