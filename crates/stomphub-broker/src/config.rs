use std::time::Duration;

/// Broker-core settings handed in by the embedding program. The server
/// binary builds this from its YAML config; embedders fill it directly.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Value of the `server` header on CONNECTED frames.
    pub server_name: String,
    /// `[sx, sy]`: what the broker can send / wants to receive, in ms.
    pub heartbeat: (u64, u64),
    /// Slack added to the negotiated receive interval before a silent
    /// client is declared dead.
    pub heartbeat_error_margin: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_name: format!("stomphub/{}", env!("CARGO_PKG_VERSION")),
            heartbeat: (10_000, 10_000),
            heartbeat_error_margin: Duration::from_secs(1),
        }
    }
}
