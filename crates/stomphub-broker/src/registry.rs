use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::topic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub session_id: String,
    pub topic: String,
    pub tokens: Vec<String>,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        topic: &str,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            topic: topic.to_string(),
            tokens: topic::tokenize(topic),
        }
    }
}

/// Flat, insertion-ordered set of active subscriptions.
///
/// Fan-out works on `snapshot` so the lock is never held across a
/// transport write; a subscription removed mid-fan-out is either
/// delivered to or skipped whole.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription: Subscription) {
        self.lock().push(subscription);
    }

    pub fn contains(
        &self,
        session_id: &str,
        sub_id: &str,
    ) -> bool {
        self.lock()
            .iter()
            .any(|sub| sub.session_id == session_id && sub.id == sub_id)
    }

    /// Removes the first `(session_id, sub_id)` match, returning it.
    pub fn remove(
        &self,
        session_id: &str,
        sub_id: &str,
    ) -> Option<Subscription> {
        let mut entries = self.lock();
        let position = entries
            .iter()
            .position(|sub| sub.session_id == session_id && sub.id == sub_id)?;
        Some(entries.remove(position))
    }

    /// Drops every subscription belonging to the session.
    pub fn remove_all(&self, session_id: &str) -> Vec<Subscription> {
        let mut entries = self.lock();
        let mut removed = Vec::new();
        entries.retain(|sub| {
            if sub.session_id == session_id {
                removed.push(sub.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
