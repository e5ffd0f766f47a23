use std::sync::Arc;
use std::time::Duration;

use stomphub_proto::HEARTBEAT_PAYLOAD;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Session;
use crate::transport::Transport;

/// Armed heartbeat timers for one session. Cancelling stops both timer
/// tasks within one tick.
pub(crate) struct HeartbeatHandle {
    token: CancellationToken,
}

impl HeartbeatHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// STOMP 1.1 negotiation. `server` is the broker's configured `[sx, sy]`
/// pair, `client` the CONNECT frame's `cx,cy`. Returns
/// `(server_send_ms, client_recv_ms)`; zero disables a direction.
pub(crate) fn negotiate(
    server: (u64, u64),
    client: (u64, u64),
) -> (u64, u64) {
    let (sx, sy) = server;
    let (cx, cy) = client;
    let send = if sx != 0 && cy != 0 { sx.max(cy) } else { 0 };
    let recv = if sy != 0 && cx != 0 { sy.max(cx) } else { 0 };
    (send, recv)
}

/// Spawns the negotiated timer tasks for a session. `on_timeout` runs at
/// most once, when the client stays silent past the receive interval
/// plus the error margin.
pub(crate) fn arm(
    session: &Arc<Session>,
    server_send_ms: u64,
    client_recv_ms: u64,
    error_margin: Duration,
    on_timeout: impl FnOnce() + Send + 'static,
) -> HeartbeatHandle {
    let token = CancellationToken::new();

    if server_send_ms > 0 {
        tokio::spawn(run_send_timer(
            session.transport().clone(),
            session.id().to_string(),
            server_send_ms,
            token.child_token(),
        ));
    }

    if client_recv_ms > 0 {
        tokio::spawn(run_recv_timer(
            session.clone(),
            client_recv_ms,
            error_margin,
            token.child_token(),
            on_timeout,
        ));
    }

    HeartbeatHandle { token }
}

async fn run_send_timer(
    transport: Arc<dyn Transport>,
    session_id: String,
    interval_ms: u64,
    token: CancellationToken,
) {
    let period = Duration::from_millis(interval_ms);
    let mut ticker = time::interval_at(time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if !transport.is_open() {
                    break;
                }
                if let Err(err) = transport.send(HEARTBEAT_PAYLOAD.to_vec()) {
                    debug!(
                        "heartbeat send failed: session={session_id}, error={err}"
                    );
                    break;
                }
            }
        }
    }
}

async fn run_recv_timer(
    session: Arc<Session>,
    interval_ms: u64,
    error_margin: Duration,
    token: CancellationToken,
    on_timeout: impl FnOnce() + Send,
) {
    let period = Duration::from_millis(interval_ms);
    let margin_ms = u64::try_from(error_margin.as_millis()).unwrap_or(u64::MAX);
    let mut ticker = time::interval_at(time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let idle = session.idle_ms();
                if idle > interval_ms.saturating_add(margin_ms) {
                    warn!(
                        "heartbeat timeout: session={}, idle_ms={idle}",
                        session.id()
                    );
                    on_timeout();
                    break;
                }
                debug!(
                    "heartbeat check passed: session={}, idle_ms={idle}",
                    session.id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::{arm, negotiate};
    use crate::session::Session;
    use crate::testutil::RecordingTransport;

    #[test]
    fn negotiate_takes_max_of_non_zero_pairs() {
        assert_eq!(negotiate((10_000, 10_000), (5_000, 10_000)), (
            10_000, 10_000
        ));
        assert_eq!(negotiate((5_000, 5_000), (20_000, 30_000)), (
            30_000, 20_000
        ));
    }

    #[test]
    fn negotiate_disables_direction_on_zero() {
        assert_eq!(negotiate((10_000, 10_000), (0, 0)), (0, 0));
        assert_eq!(negotiate((0, 10_000), (5_000, 5_000)), (0, 10_000));
        assert_eq!(negotiate((10_000, 0), (5_000, 5_000)), (10_000, 0));
    }

    #[tokio::test]
    async fn send_timer_emits_lf_beacons() {
        let transport = Arc::new(RecordingTransport::new());
        let session = Arc::new(Session::new(
            "sess-hb".to_string(),
            transport.clone(),
            None,
        ));

        let handle = arm(&session, 20, 0, Duration::from_millis(0), || {});
        sleep(Duration::from_millis(90)).await;
        handle.cancel();

        assert!(transport.heartbeat_count() >= 2);
    }

    #[tokio::test]
    async fn recv_timer_fires_timeout_when_idle() {
        let transport = Arc::new(RecordingTransport::new());
        let session = Arc::new(Session::new(
            "sess-hb".to_string(),
            transport.clone(),
            None,
        ));
        session.touch_rx();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _handle =
            arm(&session, 0, 30, Duration::from_millis(10), move || {
                flag.store(true, Ordering::SeqCst);
            });

        let wait = async {
            while !fired.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(2), wait).await.expect("timeout fires");
    }

    #[tokio::test]
    async fn recv_timer_stays_quiet_while_traffic_flows() {
        let transport = Arc::new(RecordingTransport::new());
        let session = Arc::new(Session::new(
            "sess-hb".to_string(),
            transport.clone(),
            None,
        ));
        session.touch_rx();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle =
            arm(&session, 0, 40, Duration::from_millis(60), move || {
                flag.store(true, Ordering::SeqCst);
            });

        for _ in 0..6 {
            sleep(Duration::from_millis(25)).await;
            session.touch_rx();
        }
        assert!(!fired.load(Ordering::SeqCst));
        handle.cancel();
    }
}
