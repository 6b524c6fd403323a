//! ## MASH protocol core
//!
//! Everything between the wire codec and the running device service:
//! the device model, the commissioning handshake, authenticated
//! sessions with their interaction client and subscription dispatcher,
//! capability snapshots, the use-case matcher and the certificate
//! helpers.
//!
//! The crate is transport-agnostic: sessions and the commissioning
//! handlers operate on any `AsyncRead + AsyncWrite` stream, the caller
//! decides what TLS looks like.

pub mod certs;
pub mod commissioning;
pub mod model;
pub mod pase;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod usecase;

use ciborium::Value;
use codec::message::Status;

/// Integer map key for CBOR payload construction.
pub fn message_key(key: u64) -> Value {
    Value::Integer(key.into())
}

/// Semantic error kinds of the protocol core.
///
/// The taxonomy matters more than the payload: transient errors tear
/// the connection down silently, protocol errors answer one-shot where
/// a message id is known, busy and authorization surface to the peer,
/// fatal errors bubble to the service event bus.
#[derive(Debug)]
pub enum ServiceError {
    /// Socket level failure, nothing is propagated to the peer.
    Transient(std::io::Error),
    /// Malformed or unexpected bytes from the peer.
    Protocol(codec::Error),
    /// Commissioning is unavailable; zero means permanently so.
    Busy { retry_after_secs: u32 },
    PermissionDenied,
    NotFound,
    Timeout,
    SessionClosed,
    /// An invariant was violated; the session closes and the service
    /// raises an error event.
    Fatal(String),
}

impl std::error::Error for ServiceError {}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(e) => write!(f, "transient: {}", e),
            Self::Protocol(e) => write!(f, "protocol: {}", e),
            Self::Busy { retry_after_secs } => {
                write!(f, "busy: retry_after={}", retry_after_secs)
            }
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NotFound => write!(f, "not found"),
            Self::Timeout => write!(f, "timeout"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Fatal(reason) => write!(f, "fatal: {}", reason),
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(value: std::io::Error) -> Self {
        Self::Transient(value)
    }
}

impl From<codec::Error> for ServiceError {
    fn from(value: codec::Error) -> Self {
        Self::Protocol(value)
    }
}

impl ServiceError {
    /// The wire status a peer sees for this error, where one is sent
    /// at all.
    pub fn status(&self) -> Status {
        match self {
            Self::Transient(_) => Status::Failed,
            Self::Protocol(_) => Status::InvalidParameter,
            Self::Busy { .. } => Status::Busy,
            Self::PermissionDenied => Status::PermissionDenied,
            Self::NotFound => Status::NotFound,
            Self::Timeout => Status::Timeout,
            Self::SessionClosed => Status::SessionClosed,
            Self::Fatal(_) => Status::Failed,
        }
    }
}
