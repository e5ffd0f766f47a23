use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::heartbeat::HeartbeatHandle;
use crate::middleware::SessionInfo;
use crate::transport::Transport;

/// Well-known id of the in-process pseudo-session. Host subscriptions
/// are keyed to it, and host publishes originate from it, so the
/// self-suppression rule applies to the embedding program too.
pub const HOST_SESSION_ID: &str = "self_1234";

/// Per-connection state. Timestamps are millisecond offsets from the
/// session's start so the heartbeat tasks can read them lock-free.
pub(crate) struct Session {
    id: String,
    transport: Arc<dyn Transport>,
    remote: Option<String>,
    connected: AtomicBool,
    torn_down: AtomicBool,
    last_rx_ms: AtomicU64,
    started: Instant,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl Session {
    pub fn new(
        id: String,
        transport: Arc<dyn Transport>,
        remote: Option<String>,
    ) -> Self {
        Self {
            id,
            transport,
            remote,
            connected: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            last_rx_ms: AtomicU64::new(0),
            started: Instant::now(),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo { id: self.id.clone(), connected: self.is_connected() }
    }

    /// Records that bytes arrived. `fetch_max` keeps the timestamp
    /// monotonically non-decreasing under concurrent updates.
    pub fn touch_rx(&self) {
        self.last_rx_ms.fetch_max(self.now_ms(), Ordering::SeqCst);
    }

    pub fn idle_ms(&self) -> u64 {
        self.now_ms().saturating_sub(self.last_rx_ms.load(Ordering::SeqCst))
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn arm_heartbeat(&self, handle: HeartbeatHandle) {
        let previous = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn disarm_heartbeat(&self) {
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// First caller wins; teardown runs exactly once per session.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}
