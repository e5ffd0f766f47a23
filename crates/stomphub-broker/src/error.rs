use stomphub_proto::FrameError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
