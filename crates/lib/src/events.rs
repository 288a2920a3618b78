//! Observer registries with disposers.
//!
//! [`Listeners`] is a flat, ordered list of callbacks; [`EventRegistry`] keys
//! listener lists by event name and adds a wildcard bucket. Subscribing
//! returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the callback.
//!
//! Callbacks run synchronously on the emitting task, in registration order,
//! outside the registry lock, so a callback may subscribe or unsubscribe.

use crate::protocol::WILDCARD;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Ordered callback list; cloning shares the same list.
pub struct Listeners<T: ?Sized> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T: ?Sized> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut set = self.inner.lock();
            set.next_id += 1;
            let id = set.next_id;
            let callback: Callback<T> = Arc::new(callback);
            set.entries.push((id, callback));
            id
        };
        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer returned by every subscribe call.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    /// Keep the callback registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.dispose = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

/// Event name → listeners, plus wildcard listeners that see every event.
#[derive(Clone, Default)]
pub struct EventRegistry {
    by_name: Arc<Mutex<HashMap<String, Listeners<Value>>>>,
    wildcard: Listeners<Value>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for `event`. Subscribing to `"*"` is the same as [`EventRegistry::subscribe_any`].
    pub fn subscribe(
        &self,
        event: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        if event == WILDCARD {
            return self.subscribe_any(callback);
        }
        // Added under the map lock so a concurrent prune cannot orphan the bucket.
        let inner = self
            .by_name
            .lock()
            .entry(event.to_string())
            .or_default()
            .add(callback);
        let by_name = Arc::downgrade(&self.by_name);
        let name = event.to_string();
        Subscription::new(move || {
            inner.unsubscribe();
            if let Some(by_name) = by_name.upgrade() {
                let mut by_name = by_name.lock();
                if by_name.get(&name).is_some_and(|b| b.is_empty()) {
                    by_name.remove(&name);
                }
            }
        })
    }

    /// Listen for every event; the callback receives the payload with the
    /// event name merged in (see [`with_event_name`]).
    pub fn subscribe_any(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.wildcard.add(callback)
    }

    /// Deliver `payload` to listeners of `event`, then to wildcard listeners.
    pub fn dispatch(&self, event: &str, payload: &Value) {
        let bucket = self.by_name.lock().get(event).cloned();
        if let Some(bucket) = bucket {
            bucket.emit(payload);
        }
        if !self.wildcard.is_empty() {
            self.wildcard.emit(&with_event_name(event, payload));
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        if event == WILDCARD {
            return self.wildcard.len();
        }
        self.by_name.lock().get(event).map_or(0, |b| b.len())
    }
}

/// `{"event": name, ...payload}` for object payloads; other payloads are
/// nested as `{"event": name, "payload": payload}`.
pub fn with_event_name(event: &str, payload: &Value) -> Value {
    let mut merged = Map::new();
    merged.insert("event".to_string(), Value::String(event.to_string()));
    match payload {
        Value::Object(fields) => {
            for (k, v) in fields {
                if k != "event" {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        Value::Null => {}
        other => {
            merged.insert("payload".to_string(), other.clone());
        }
    }
    Value::Object(merged)
}
