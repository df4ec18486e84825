//! The relay boundary.
//!
//! The relay is untrusted and unreliable: frames may be dropped, delayed or
//! duplicated. The client only assumes it can enqueue ciphertext and drain an
//! unordered stream of incoming items. Acks are a distinct variant at this
//! boundary, never inferred from payload shape.

use std::time::Duration;

use tether_core::pairing::PairingSecret;
use tether_core::protocol::RequestId;

/// One item off the relay.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Plaintext pairing-handshake message (no session key exists yet).
    Plain(Vec<u8>),

    /// A sealed response envelope.
    Sealed(Vec<u8>),

    /// Bare acknowledgement: "received, extend my deadline". Carries only the
    /// correlation id of the request it acknowledges.
    Ack(RequestId),
}

#[derive(Debug, thiserror::Error)]
#[error("transport: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Abstraction over the relay. Implementations must be shareable across the
/// receive loop and arbitrary caller threads.
pub trait Transport: Send + Sync {
    /// Register relay addressing for a (possibly still incomplete) pairing
    /// and publish the workstation's side of the ceremony.
    fn setup(&self, pairing: &PairingSecret) -> Result<(), TransportError>;

    /// Enqueue one sealed request frame for delivery. Failures here surface
    /// immediately to the caller; they are not timeout-shaped.
    fn send(&self, ciphertext: Vec<u8>) -> Result<(), TransportError>;

    /// Wait up to `wait` for the next incoming item. `Ok(None)` means nothing
    /// arrived in time; the receive loop just polls again.
    fn recv(&self, wait: Duration) -> Result<Option<Incoming>, TransportError>;
}
