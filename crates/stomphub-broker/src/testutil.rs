use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use stomphub_proto::{Frame, WirePayload};

use crate::transport::{Transport, TransportError};

/// In-memory transport double: records every payload the broker writes
/// and exposes them parsed back into frames.
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    open: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()), open: AtomicBool::new(true) }
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every recorded payload that parses as a frame, in write order.
    pub fn frames(&self) -> Vec<Frame> {
        self.sent_payloads()
            .iter()
            .filter_map(|payload| match stomphub_proto::parse(payload) {
                Ok(WirePayload::Frame(frame)) => Some(frame),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.sent_payloads()
            .iter()
            .filter(|payload| payload.as_slice() == b"\n")
            .count()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(payload);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
