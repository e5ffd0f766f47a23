use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use stomphub_proto::{Frame, Headers, WirePayload};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, Delivery, EventBus};
use crate::heartbeat;
use crate::middleware::{
    CommandArgs, CommandKind, Interceptor, MiddlewareSet, SessionInfo,
    run_chain,
};
use crate::payload::Payload;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::session::{HOST_SESSION_ID, Session};
use crate::topic;
use crate::transport::Transport;

/// The embeddable broker. Clones share one instance; the transport
/// layer drives it through `session_opened` / `session_message` /
/// `session_closed`, the host through `subscribe` / `publish`.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    registry: SubscriptionRegistry,
    middleware: Mutex<MiddlewareSet>,
    events: EventBus,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                registry: SubscriptionRegistry::new(),
                middleware: Mutex::new(MiddlewareSet::default()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Lifecycle event stream for the embedding host.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a host subscription under a fresh id and returns it.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> String {
        let sub_id = format!("sub-{}", Uuid::now_v7());
        // a fresh uuid cannot collide with an existing subscription id
        let _ = self.subscribe_with_id(&sub_id, topic, callback);
        sub_id
    }

    /// Registers a host subscription under a caller-chosen id.
    pub fn subscribe_with_id(
        &self,
        sub_id: &str,
        topic: &str,
        callback: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> Result<(), BrokerError> {
        if self.inner.registry.contains(HOST_SESSION_ID, sub_id) {
            return Err(BrokerError::Protocol(format!(
                "duplicate subscription id: {sub_id}"
            )));
        }

        let subscription = Subscription::new(sub_id, HOST_SESSION_ID, topic);
        self.inner.events.register_callback(sub_id, Arc::new(callback));
        self.inner.registry.add(subscription.clone());
        debug!("host subscribed: id={sub_id}, destination={topic}");
        self.inner.events.emit(BrokerEvent::Subscribed { subscription });
        Ok(())
    }

    /// Drops a host subscription and its delivery callback.
    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        self.inner.events.unregister_callback(sub_id);
        match self.inner.registry.remove(HOST_SESSION_ID, sub_id) {
            Some(subscription) => {
                self.inner
                    .events
                    .emit(BrokerEvent::Unsubscribed { subscription });
                true
            }
            None => false,
        }
    }

    /// Publishes as the pseudo-session, through the full `send`
    /// pipeline. The host's own matching subscriptions are suppressed
    /// like any other publisher's.
    pub fn publish(
        &self,
        topic: &str,
        headers: Headers,
        body: Payload,
    ) {
        let publisher = SessionInfo {
            id: HOST_SESSION_ID.to_string(),
            connected: true,
        };
        let mut args = CommandArgs::Send {
            destination: topic.to_string(),
            headers,
            body,
        };
        if !self.inner.run_middleware(&publisher, &mut args) {
            debug!("publish dropped by middleware: destination={topic}");
            return;
        }
        let CommandArgs::Send { destination, headers, body } = args else {
            return;
        };
        self.inner.fan_out(HOST_SESSION_ID, &destination, &headers, &body);
    }

    pub fn add_middleware(
        &self,
        kind: CommandKind,
        interceptor: Interceptor,
    ) {
        self.inner.lock_middleware().add(kind, interceptor);
    }

    pub fn set_middleware(
        &self,
        kind: CommandKind,
        interceptor: Interceptor,
    ) {
        self.inner.lock_middleware().set(kind, interceptor);
    }

    pub fn remove_middleware(
        &self,
        kind: CommandKind,
        interceptor: &Interceptor,
    ) -> bool {
        self.inner.lock_middleware().remove(kind, interceptor)
    }

    /// Admits a new connection. The returned session id keys every
    /// later call for this transport.
    pub fn session_opened(
        &self,
        transport: Arc<dyn Transport>,
        remote: Option<String>,
    ) -> String {
        let session_id = format!("sess-{}", Uuid::now_v7());
        let session = Arc::new(Session::new(
            session_id.clone(),
            transport,
            remote,
        ));
        info!(
            "session opening: session={session_id}, remote={}",
            session.remote().unwrap_or("-")
        );
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), session);
        self.inner
            .events
            .emit(BrokerEvent::Connecting { session_id: session_id.clone() });
        session_id
    }

    /// Feeds one WebSocket payload into the session's pipeline. The
    /// transport layer calls this serially per connection, which is
    /// what keeps handlers for a session from interleaving.
    pub fn session_message(
        &self,
        session_id: &str,
        payload: &[u8],
    ) {
        let Some(session) = self.inner.session(session_id) else {
            warn!("message for unknown session: session={session_id}");
            return;
        };
        session.touch_rx();

        match stomphub_proto::parse(payload) {
            Ok(WirePayload::Heartbeat) => {
                debug!("heartbeat received: session={session_id}");
            }
            Ok(WirePayload::Frame(frame)) => {
                self.inner.dispatch(&session, frame, payload);
            }
            Err(err) => {
                warn!("malformed frame: session={session_id}, error={err}");
                self.inner.send_error(
                    &session,
                    &err.to_string(),
                    Some(payload),
                );
                self.inner.teardown_session(session_id, "malformed frame");
            }
        }
    }

    pub fn session_closed(&self, session_id: &str) {
        self.inner.teardown_session(session_id, "transport closed");
    }

    pub fn session_error(
        &self,
        session_id: &str,
        message: &str,
    ) {
        self.inner.events.emit(BrokerEvent::Error {
            session_id: Some(session_id.to_string()),
            message: message.to_string(),
        });
        self.inner.teardown_session(session_id, "transport error");
    }

    /// Tears down every live session.
    pub fn shutdown(&self) {
        let session_ids: Vec<String> = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for session_id in session_ids {
            self.inner.teardown_session(&session_id, "broker shutdown");
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }
}

impl BrokerInner {
    fn dispatch(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: Frame,
        raw: &[u8],
    ) {
        match frame.command.as_str() {
            "CONNECT" | "STOMP" => self.handle_connect(session, frame),
            _ if !session.is_connected() => {
                self.send_error(session, "session is not connected", Some(raw));
                self.teardown_session(session.id(), "command before CONNECT");
            }
            "SEND" => self.handle_send(session, frame, raw),
            "SUBSCRIBE" => self.handle_subscribe(session, frame, raw),
            "UNSUBSCRIBE" => self.handle_unsubscribe(session, frame, raw),
            "DISCONNECT" => self.handle_disconnect(session),
            other => {
                warn!(
                    "unsupported command: session={}, command={other}",
                    session.id()
                );
                self.send_error(session, "Command not found", Some(raw));
            }
        }
    }

    fn handle_connect(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: Frame,
    ) {
        if session.is_connected() {
            self.send_error(session, "session is already connected", None);
            return;
        }

        let mut args = CommandArgs::Connect { headers: frame.headers };
        if !self.run_middleware(&session.info(), &mut args) {
            debug!("connect dropped by middleware: session={}", session.id());
            return;
        }
        let CommandArgs::Connect { headers } = args else {
            return;
        };

        if let Some(versions) = headers.get("accept-version") {
            let supported = versions
                .split(',')
                .any(|version| version.trim() == stomphub_proto::STOMP_VERSION);
            if !supported {
                self.send_error(
                    session,
                    "unsupported protocol version",
                    None,
                );
                self.teardown_session(session.id(), "version mismatch");
                return;
            }
        }

        let client_pair = match headers.get("heart-beat") {
            Some(value) => match stomphub_proto::parse_heart_beat(value) {
                Ok(pair) => pair,
                Err(err) => {
                    self.send_error(session, &err.to_string(), None);
                    self.teardown_session(
                        session.id(),
                        "invalid heart-beat header",
                    );
                    return;
                }
            },
            None => (0, 0),
        };
        let (send_ms, recv_ms) =
            heartbeat::negotiate(self.config.heartbeat, client_pair);

        session.set_connected();

        if send_ms > 0 || recv_ms > 0 {
            let broker = Arc::downgrade(self);
            let session_id = session.id().to_string();
            let handle = heartbeat::arm(
                session,
                send_ms,
                recv_ms,
                self.config.heartbeat_error_margin,
                move || {
                    if let Some(broker) = broker.upgrade() {
                        broker
                            .teardown_session(&session_id, "heartbeat timeout");
                    }
                },
            );
            session.arm_heartbeat(handle);
        }

        let connected = Frame::new("CONNECTED")
            .header("version", stomphub_proto::STOMP_VERSION)
            .header("server", self.config.server_name.as_str())
            .header("session", session.id())
            .header(
                "heart-beat",
                stomphub_proto::format_heart_beat(send_ms, recv_ms),
            );
        if let Err(err) =
            session.transport().send(stomphub_proto::serialize(&connected))
        {
            warn!(
                "failed to send CONNECTED: session={}, error={err}",
                session.id()
            );
            self.teardown_session(session.id(), "transport write failed");
            return;
        }

        info!(
            "session connected: session={}, heart_beat={send_ms},{recv_ms}",
            session.id()
        );
        self.events.emit(BrokerEvent::Connected {
            session_id: session.id().to_string(),
            headers,
        });
    }

    fn handle_send(
        &self,
        session: &Arc<Session>,
        frame: Frame,
        raw: &[u8],
    ) {
        let Some(destination) =
            frame.headers.get("destination").map(str::to_string)
        else {
            self.send_error(
                session,
                "SEND requires a destination header",
                Some(raw),
            );
            return;
        };

        let body = frame.body.as_deref().unwrap_or_default();
        let payload =
            match Payload::decode(frame.headers.get("content-type"), body) {
                Ok(payload) => payload,
                Err(err) => {
                    self.send_error(session, &err.to_string(), Some(raw));
                    return;
                }
            };

        let mut args = CommandArgs::Send {
            destination,
            headers: frame.headers,
            body: payload,
        };
        if !self.run_middleware(&session.info(), &mut args) {
            debug!("send dropped by middleware: session={}", session.id());
            return;
        }
        let CommandArgs::Send { destination, headers, body } = args else {
            return;
        };

        self.fan_out(session.id(), &destination, &headers, &body);
    }

    fn handle_subscribe(
        &self,
        session: &Arc<Session>,
        frame: Frame,
        raw: &[u8],
    ) {
        let Some(destination) =
            frame.headers.get("destination").map(str::to_string)
        else {
            self.send_error(
                session,
                "SUBSCRIBE requires a destination header",
                Some(raw),
            );
            return;
        };
        let Some(id) = frame.headers.get("id").map(str::to_string) else {
            self.send_error(session, "SUBSCRIBE requires an id header", Some(raw));
            return;
        };

        let mut args = CommandArgs::Subscribe { id, destination };
        if !self.run_middleware(&session.info(), &mut args) {
            debug!("subscribe dropped by middleware: session={}", session.id());
            return;
        }
        let CommandArgs::Subscribe { id, destination } = args else {
            return;
        };

        if self.registry.contains(session.id(), &id) {
            self.send_error(
                session,
                &format!("duplicate subscription id: {id}"),
                Some(raw),
            );
            return;
        }

        let subscription =
            Subscription::new(id.as_str(), session.id(), &destination);
        self.registry.add(subscription.clone());
        debug!(
            "subscribed: session={}, id={id}, destination={destination}",
            session.id()
        );
        self.events.emit(BrokerEvent::Subscribed { subscription });
    }

    fn handle_unsubscribe(
        &self,
        session: &Arc<Session>,
        frame: Frame,
        raw: &[u8],
    ) {
        let Some(id) = frame.headers.get("id").map(str::to_string) else {
            self.send_error(
                session,
                "UNSUBSCRIBE requires an id header",
                Some(raw),
            );
            return;
        };

        let mut args = CommandArgs::Unsubscribe { id };
        if !self.run_middleware(&session.info(), &mut args) {
            debug!(
                "unsubscribe dropped by middleware: session={}",
                session.id()
            );
            return;
        }
        let CommandArgs::Unsubscribe { id } = args else {
            return;
        };

        // removing an unknown id is silent on the wire
        match self.registry.remove(session.id(), &id) {
            Some(subscription) => {
                debug!("unsubscribed: session={}, id={id}", session.id());
                self.events.emit(BrokerEvent::Unsubscribed { subscription });
            }
            None => {
                debug!(
                    "unsubscribe ignored: session={}, id={id}",
                    session.id()
                );
            }
        }
    }

    fn handle_disconnect(&self, session: &Arc<Session>) {
        let mut args = CommandArgs::Disconnect;
        if !self.run_middleware(&session.info(), &mut args) {
            debug!(
                "disconnect dropped by middleware: session={}",
                session.id()
            );
            return;
        }
        self.teardown_session(session.id(), "client disconnect");
    }

    /// Terminal `send` handler: builds the MESSAGE frame and delivers
    /// it to every matching subscription on other sessions.
    fn fan_out(
        &self,
        publisher: &str,
        destination: &str,
        incoming: &Headers,
        body: &Payload,
    ) {
        let encoded = body.encode();

        let mut message = Frame::new("MESSAGE")
            .header("destination", destination)
            .header("message-id", format!("msg-{}", Uuid::now_v7()))
            .header("content-type", "text/plain");
        for (key, value) in incoming.iter() {
            message.headers.set(key, value);
        }
        message.headers.set("content-length", encoded.len().to_string());
        if !encoded.is_empty() {
            message.body = Some(encoded);
        }

        let destination_tokens = topic::tokenize(destination);
        let mut delivered = 0_usize;

        for subscription in self.registry.snapshot() {
            if subscription.session_id == publisher {
                continue;
            }
            if !topic::matches(&subscription.tokens, &destination_tokens) {
                continue;
            }

            let mut view = message.clone();
            view.headers.set("subscription", subscription.id.as_str());

            if subscription.session_id == HOST_SESSION_ID {
                let delivery =
                    Delivery { headers: view.headers, body: body.clone() };
                if self.events.deliver(&subscription.id, delivery) {
                    delivered += 1;
                }
                continue;
            }

            let Some(target) = self.session(&subscription.session_id) else {
                continue;
            };
            match target.transport().send(stomphub_proto::serialize(&view)) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    "message delivery failed: session={}, subscription={}, error={err}",
                    subscription.session_id, subscription.id
                ),
            }
        }

        debug!(
            "message fanned out: destination={destination}, delivered={delivered}"
        );
        self.events.emit(BrokerEvent::Sent {
            destination: destination.to_string(),
            frame: message,
        });
    }

    fn send_error(
        &self,
        session: &Session,
        reason: &str,
        offending: Option<&[u8]>,
    ) {
        let mut error = Frame::new("ERROR").header("message", reason);
        if let Some(offending) = offending {
            error = error.header("content-type", "text/plain");
            error.body = Some(offending.to_vec());
        }
        if let Err(err) =
            session.transport().send(stomphub_proto::serialize(&error))
        {
            debug!(
                "failed to send ERROR: session={}, error={err}",
                session.id()
            );
        }
        self.events.emit(BrokerEvent::Error {
            session_id: Some(session.id().to_string()),
            message: reason.to_string(),
        });
    }

    /// Idempotent. Removes the session's subscriptions, cancels its
    /// heartbeat timers, closes the transport, and announces the loss.
    fn teardown_session(
        &self,
        session_id: &str,
        reason: &str,
    ) {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(session) = session else {
            return;
        };
        if !session.begin_teardown() {
            return;
        }

        let dropped = self.registry.remove_all(session_id);
        session.disarm_heartbeat();
        if session.transport().is_open() {
            session.transport().close();
        }

        info!(
            "session closed: session={session_id}, reason={reason}, dropped_subscriptions={}",
            dropped.len()
        );
        self.events
            .emit(BrokerEvent::Disconnected { session_id: session_id.to_string() });
    }

    fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn run_middleware(
        &self,
        session: &SessionInfo,
        args: &mut CommandArgs,
    ) -> bool {
        let chain = self.lock_middleware().chain_for(args.kind());
        run_chain(&chain, session, args)
    }

    fn lock_middleware(
        &self,
    ) -> std::sync::MutexGuard<'_, MiddlewareSet> {
        self.middleware.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
