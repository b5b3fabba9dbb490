//! In-process pub/sub event bus (spec §4.4), durability-first.
//!
//! `publish` appends the event to persistence before fanning it out to
//! subscribers and the webhook delivery queue — step (1) always
//! completes before (2) and (3). Persistence and webhook dispatch are
//! injected as traits so this crate has no dependency on either concrete
//! implementation; `kiln-core` wires the real ones in.
//!
//! The subscriber list is a copy-on-write `Arc<Vec<_>>` swapped under a
//! `Mutex`, so `publish` never holds a lock while invoking callbacks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kiln_types::{Event, EventKind, PrinterId};

/// Fields of an event not yet assigned a persisted sequence number.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub printer_id: Option<PrinterId>,
    pub job_id: Option<String>,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            printer_id: None,
            job_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_printer(mut self, printer_id: PrinterId) -> Self {
        self.printer_id = Some(printer_id);
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Durable sink for events, backed by `kiln-persistence` in the real
/// deployment. Returns the monotonic sequence number assigned to the row.
pub trait EventPersister: Send + Sync {
    fn append(&self, draft: &EventDraft) -> anyhow::Result<u64>;
}

/// Hands a published event to the webhook delivery queue if any
/// subscription matches its kind. Non-fallible from the bus's point of
/// view: a full queue is the dispatcher's problem (it publishes its own
/// `WEBHOOK_OVERFLOW` event rather than failing the original publish).
pub trait WebhookDispatch: Send + Sync {
    fn dispatch(&self, event: &Event);
}

pub type SubscriberCallback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: u64,
    kinds: Vec<EventKind>,
    callback: SubscriberCallback,
}

/// Opaque handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The event bus. Cheap to clone (internally `Arc`-backed); share one
/// instance across the dispatcher, pollers, and webhook workers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    persister: Arc<dyn EventPersister>,
    webhook: Arc<dyn WebhookDispatch>,
    subscribers: Mutex<Arc<Vec<Subscription>>>,
    next_subscription_id: AtomicU64,
    recent: Mutex<Vec<Event>>,
    recent_capacity: usize,
}

const DEFAULT_RECENT_CAPACITY: usize = 1000;

impl EventBus {
    pub fn new(persister: Arc<dyn EventPersister>, webhook: Arc<dyn WebhookDispatch>) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                persister,
                webhook,
                subscribers: Mutex::new(Arc::new(Vec::new())),
                next_subscription_id: AtomicU64::new(1),
                recent: Mutex::new(Vec::new()),
                recent_capacity: DEFAULT_RECENT_CAPACITY,
            }),
        }
    }

    /// Registers `callback` for events whose kind is in `kinds`. Rejects
    /// (returns `None`) a duplicate of an existing subscription with the
    /// same kind set and the same callback identity (`Arc::ptr_eq`).
    pub fn subscribe(&self, kinds: Vec<EventKind>, callback: SubscriberCallback) -> Option<SubscriptionId> {
        let mut guard = self.inner.subscribers.lock().expect("subscriber lock poisoned");
        if guard.iter().any(|s| s.kinds == kinds && Arc::ptr_eq(&s.callback, &callback)) {
            return None;
        }
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let mut next = (**guard).clone();
        next.push(Subscription { id, kinds, callback });
        *guard = Arc::new(next);
        Some(SubscriptionId(id))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut guard = self.inner.subscribers.lock().expect("subscriber lock poisoned");
        let next: Vec<Subscription> = guard.iter().filter(|s| s.id != id.0).cloned().collect();
        *guard = Arc::new(next);
    }

    /// Appends `draft` to persistence, then fans it out to matching
    /// subscribers (in subscription order) and the webhook queue. Returns
    /// the fully-sequenced `Event`.
    pub fn publish(&self, draft: EventDraft) -> anyhow::Result<Event> {
        let seq = self.inner.persister.append(&draft)?;
        let event = Event {
            id: seq,
            kind: draft.kind,
            timestamp: draft.timestamp,
            printer_id: draft.printer_id,
            job_id: draft.job_id,
            payload: draft.payload,
        };

        {
            let mut recent = self.inner.recent.lock().expect("recent-events lock poisoned");
            recent.push(event.clone());
            if recent.len() > self.inner.recent_capacity {
                let overflow = recent.len() - self.inner.recent_capacity;
                recent.drain(0..overflow);
            }
        }

        let subscribers = self.inner.subscribers.lock().expect("subscriber lock poisoned").clone();
        for sub in subscribers.iter() {
            if !sub.kinds.contains(&event.kind) {
                continue;
            }
            let callback = sub.callback.clone();
            let event_ref = &event;
            let _ = panic::catch_unwind(AssertUnwindSafe(|| (callback)(event_ref)));
        }

        self.inner.webhook.dispatch(&event);

        Ok(event)
    }

    /// Returns up to `limit` of the most recently published events, most
    /// recent last.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let recent = self.inner.recent.lock().expect("recent-events lock poisoned");
        let start = recent.len().saturating_sub(limit);
        recent[start..].to_vec()
    }
}
