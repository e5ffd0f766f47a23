use std::sync::Arc;

use stomphub_broker::Broker;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub config: Arc<Config>,
    pub shutdown: CancellationToken,
}
