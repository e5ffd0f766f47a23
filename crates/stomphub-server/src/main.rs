mod app;
mod config;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use stomphub_broker::{Broker, BrokerEvent};
use stomphub_helpers::{logging, shutdown};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ws::run_ws_server;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    logging::init(config.debug);

    let broker = Broker::new(config.broker_config());

    let state = AppState {
        broker: broker.clone(),
        config: Arc::new(config),
        shutdown: CancellationToken::new(),
    };

    info!(
        "broker starting: listen={}, path={}, heartbeat={},{}",
        state.config.listen,
        state.config.path,
        state.config.heartbeat[0],
        state.config.heartbeat[1]
    );

    tokio::spawn(shutdown::cancel_on_signal(state.shutdown.clone()));
    tokio::spawn(log_broker_events(broker.events()));

    run_ws_server(state).await
}

/// Drains the broker's event stream into the log.
async fn log_broker_events(mut events: broadcast::Receiver<BrokerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!("broker event: {event:?}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("broker event stream lagged: skipped={skipped}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
