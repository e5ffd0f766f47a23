//! Embeddable STOMP 1.1 broker core.
//!
//! The transport layer (see `stomphub-server` for the WebSocket one)
//! feeds connections in through [`Broker::session_opened`] /
//! [`Broker::session_message`] / [`Broker::session_closed`]; the
//! embedding program talks to [`Broker::subscribe`],
//! [`Broker::publish`] and the [`Broker::events`] stream.

mod broker;
mod config;
mod error;
mod events;
mod heartbeat;
mod middleware;
mod payload;
mod registry;
mod session;
#[cfg(test)]
mod testutil;
mod topic;
mod transport;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use events::{BrokerEvent, Delivery, DeliveryFn};
pub use middleware::{
    CommandArgs, CommandKind, Interceptor, Next, SessionInfo,
};
pub use payload::{CONTENT_TYPE_JSON, Payload};
pub use registry::Subscription;
pub use session::HOST_SESSION_ID;
pub use transport::{Transport, TransportError};
