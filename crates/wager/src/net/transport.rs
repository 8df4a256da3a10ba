use async_trait::async_trait;

use super::protocol::{Envelope, EnvelopeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Received(Envelope),
    Connected,
    Disconnected { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("send failed: {0}")]
    Send(String),
}

impl From<EnvelopeError> for TransportError {
    fn from(err: EnvelopeError) -> Self {
        TransportError::Encode(err.to_string())
    }
}

/// Duplex channel to the relay. Delivery is best effort: envelopes may be
/// dropped or delayed but are never reordered. Incoming traffic and link
/// changes arrive on the receiver handed out alongside the transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}
