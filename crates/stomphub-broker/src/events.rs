use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stomphub_proto::{Frame, Headers};
use tokio::sync::broadcast;

use crate::payload::Payload;
use crate::registry::Subscription;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broker lifecycle notifications for the embedding host. A lagged
/// receiver misses events; the broker never blocks on emission.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Connecting { session_id: String },
    Connected { session_id: String, headers: Headers },
    Disconnected { session_id: String },
    Subscribed { subscription: Subscription },
    Unsubscribed { subscription: Subscription },
    Sent { destination: String, frame: Frame },
    Error { session_id: Option<String>, message: String },
}

/// One message handed to a host subscription callback.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub headers: Headers,
    pub body: Payload,
}

pub type DeliveryFn = Arc<dyn Fn(Delivery) + Send + Sync>;

pub(crate) struct EventBus {
    events: broadcast::Sender<BrokerEvent>,
    callbacks: Mutex<HashMap<String, DeliveryFn>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { events, callbacks: Mutex::new(HashMap::new()) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        // a send error only means no receiver is listening right now
        let _ = self.events.send(event);
    }

    pub fn register_callback(
        &self,
        sub_id: impl Into<String>,
        callback: DeliveryFn,
    ) {
        self.lock().insert(sub_id.into(), callback);
    }

    pub fn unregister_callback(&self, sub_id: &str) -> bool {
        self.lock().remove(sub_id).is_some()
    }

    /// Invokes the callback registered for `sub_id`, outside the map
    /// lock. Returns whether one was registered.
    pub fn deliver(
        &self,
        sub_id: &str,
        delivery: Delivery,
    ) -> bool {
        let callback = self.lock().get(sub_id).cloned();
        match callback {
            Some(callback) => {
                callback(delivery);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeliveryFn>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
