use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("outbound queue full")]
    QueueFull,
}

/// Handle to one connected peer, owned by the transport layer.
///
/// `send` must not block: implementations queue the payload and hand it
/// to their writer task. The broker never holds internal locks while
/// calling into a transport.
pub trait Transport: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Requests close. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}
