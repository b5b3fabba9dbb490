//! HMAC-signed outbound webhook delivery (spec §4.8): bounded queue,
//! worker pool, SSRF-guarded registration, retry-on-5xx.
//!
//! Continues the teacher's `reqwest::blocking` + HMAC-SHA256-over-raw-body
//! signing (`shipper-webhook`) and the `shipper/src/engine_parallel.rs`
//! worker-pool shape, generalized from one-shot chunked dispatch to a
//! long-lived pool draining a channel.

mod ssrf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hmac::{Hmac, Mac};
use kiln_events::WebhookDispatch;
use kiln_retry::{RetryStrategy, calculate_delay};
use kiln_types::{Event, EventKind, KilnError, WebhookSubscription};
use sha2::Sha256;

pub use ssrf::validate_url;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub worker_count: usize,
    pub max_redirects: u32,
    pub queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { worker_count: 4, max_redirects: 0, queue_capacity: DEFAULT_QUEUE_CAPACITY }
    }
}

struct DeliveryTask {
    subscription: WebhookSubscription,
    event: Event,
}

/// Validates a candidate subscription URL against the SSRF guard. Callers
/// (`kiln-core::register_webhook`) must call this before persisting the
/// subscription.
pub fn validate_subscription_url(url: &str) -> Result<(), KilnError> {
    validate_url(url).map(|_| ())
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, PartialEq, Eq)]
enum DeliveryOutcome {
    Success,
    Retryable(String),
    NonRetryable(String),
}

fn deliver_once(client: &reqwest::blocking::Client, subscription: &WebhookSubscription, event: &Event) -> DeliveryOutcome {
    let body = match serde_json::to_vec(event) {
        Ok(b) => b,
        Err(e) => return DeliveryOutcome::NonRetryable(format!("failed to serialize event: {e}")),
    };

    let mut request = client
        .post(&subscription.url)
        .header("Content-Type", "application/json")
        .header("X-Kiln-Event-Kind", event.kind.as_str())
        .header("X-Kiln-Event-Seq", event.id.to_string());

    if let Some(secret) = &subscription.secret {
        request = request.header("X-Kiln-Signature", sign(secret, &body));
    }

    match request.body(body).send() {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                DeliveryOutcome::Success
            } else if status.is_server_error() {
                DeliveryOutcome::Retryable(format!("server returned {status}"))
            } else {
                DeliveryOutcome::NonRetryable(format!("server returned {status}"))
            }
        }
        Err(e) => DeliveryOutcome::Retryable(format!("network error: {e}")),
    }
}

fn deliver_with_retry(client: &reqwest::blocking::Client, task: &DeliveryTask) {
    let strategy = RetryStrategy::webhook_sequence();
    let max_attempts = strategy.max_attempts().unwrap_or(1);
    for attempt in 0..max_attempts {
        match deliver_once(client, &task.subscription, &task.event) {
            DeliveryOutcome::Success => return,
            DeliveryOutcome::NonRetryable(_) => return,
            DeliveryOutcome::Retryable(_) => {
                if attempt + 1 < max_attempts {
                    thread::sleep(calculate_delay(&strategy, attempt as u32));
                }
            }
        }
    }
}

fn build_client(config: &WebhookConfig) -> reqwest::blocking::Client {
    let redirect_policy = if config.max_redirects == 0 {
        reqwest::redirect::Policy::none()
    } else {
        let cap = config.max_redirects.min(3) as usize;
        reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= cap {
                return attempt.error("redirect cap exceeded");
            }
            match validate_url(attempt.url().as_str()) {
                Ok(_) => attempt.follow(),
                Err(_) => attempt.error("redirect target failed SSRF validation"),
            }
        })
    };

    reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(20))
        .redirect(redirect_policy)
        .build()
        .expect("static TLS/client configuration must build")
}

/// The delivery service: owns the bounded queue and worker pool, and
/// implements [`kiln_events::WebhookDispatch`] so `kiln-core` can wire it
/// directly into the event bus.
pub struct WebhookDeliveryService {
    sender: SyncSender<DeliveryTask>,
    subscriptions: Mutex<Arc<Vec<WebhookSubscription>>>,
    overflow_count: AtomicU64,
    on_overflow: Option<Arc<dyn Fn() + Send + Sync>>,
    _workers: Vec<JoinHandle<()>>,
}

impl WebhookDeliveryService {
    pub fn new(config: WebhookConfig, on_overflow: Option<Arc<dyn Fn() + Send + Sync>>) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<DeliveryTask>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let client = build_client(&config);

        let workers = (0..config.worker_count.max(1))
            .map(|n| {
                let receiver: Arc<Mutex<Receiver<DeliveryTask>>> = receiver.clone();
                let client = client.clone();
                thread::Builder::new()
                    .name(format!("kiln-webhook-worker-{n}"))
                    .spawn(move || loop {
                        let task = {
                            let rx = receiver.lock().expect("webhook receiver lock poisoned");
                            rx.recv()
                        };
                        match task {
                            Ok(task) => deliver_with_retry(&client, &task),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn webhook worker thread")
            })
            .collect();

        Self {
            sender,
            subscriptions: Mutex::new(Arc::new(Vec::new())),
            overflow_count: AtomicU64::new(0),
            on_overflow,
            _workers: workers,
        }
    }

    /// Replaces the in-memory subscription mirror used to match events to
    /// recipients. `kiln-core` calls this after every register/delete so
    /// the hot dispatch path never touches persistence.
    pub fn set_subscriptions(&self, subs: Vec<WebhookSubscription>) {
        *self.subscriptions.lock().expect("subscriptions lock poisoned") = Arc::new(subs);
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::SeqCst)
    }

    fn enqueue(&self, subscription: WebhookSubscription, event: Event) {
        match self.sender.try_send(DeliveryTask { subscription, event }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.overflow_count.fetch_add(1, Ordering::SeqCst);
                if let Some(cb) = &self.on_overflow {
                    cb();
                }
            }
        }
    }
}

impl WebhookDispatch for WebhookDeliveryService {
    fn dispatch(&self, event: &Event) {
        let subs = self.subscriptions.lock().expect("subscriptions lock poisoned").clone();
        for sub in subs.iter() {
            if sub.event_kinds.contains(&event.kind) {
                self.enqueue(sub.clone(), event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use tiny_http::{Response, Server};

    fn sample_event(kind: EventKind) -> Event {
        Event { id: 1, kind, timestamp: Utc::now(), printer_id: None, job_id: None, payload: serde_json::json!({}) }
    }

    #[test]
    fn sign_is_deterministic_for_same_inputs() {
        let a = sign("secret", b"body");
        let b = sign("secret", b"body");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
    }

    #[test]
    fn sign_differs_for_different_secrets() {
        assert_ne!(sign("secret-a", b"body"), sign("secret-b", b"body"));
    }

    #[test]
    fn dispatch_only_enqueues_matching_subscriptions() {
        let service = WebhookDeliveryService::new(
            WebhookConfig { worker_count: 0, ..WebhookConfig::default() },
            None,
        );
        service.set_subscriptions(vec![WebhookSubscription {
            id: "wh-1".into(),
            url: "http://127.0.0.1:1/unused".into(),
            event_kinds: vec![EventKind::JobFailed],
            secret: None,
            created_at: Utc::now(),
        }]);
        // worker_count 0 means no thread drains the channel below, so this
        // only exercises the matching/enqueue logic, not delivery.
        service.dispatch(&sample_event(EventKind::JobCompleted));
        assert_eq!(service.overflow_count(), 0);
    }

    #[test]
    fn overflow_increments_counter_and_calls_callback() {
        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = called.clone();
        let service = WebhookDeliveryService::new(
            WebhookConfig { worker_count: 0, queue_capacity: 1, ..WebhookConfig::default() },
            Some(Arc::new(move || {
                called_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let sub = WebhookSubscription {
            id: "wh-1".into(),
            url: "http://127.0.0.1:1/unused".into(),
            event_kinds: vec![EventKind::JobCompleted],
            secret: None,
            created_at: Utc::now(),
        };
        service.set_subscriptions(vec![sub]);
        // capacity 1, no worker drains it: second dispatch overflows.
        service.dispatch(&sample_event(EventKind::JobCompleted));
        service.dispatch(&sample_event(EventKind::JobCompleted));
        assert_eq!(service.overflow_count(), 1);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_succeeds_against_a_real_http_server() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();

        let handle = thread::spawn(move || {
            if let Ok(mut request) = server.recv() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                received_clone.lock().unwrap().push(body);
                let _ = request.respond(Response::from_string("ok"));
            }
        });

        let subscription = WebhookSubscription {
            id: "wh-1".into(),
            url: format!("http://{addr}/hook"),
            event_kinds: vec![EventKind::JobCompleted],
            secret: Some("shh".into()),
            created_at: Utc::now(),
        };
        let client = build_client(&WebhookConfig::default());
        let outcome = deliver_once(&client, &subscription, &sample_event(EventKind::JobCompleted));
        assert_eq!(outcome, DeliveryOutcome::Success);

        handle.join().unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn delivery_classifies_4xx_as_non_retryable() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(Response::from_string("bad").with_status_code(404));
            }
        });
        let subscription = WebhookSubscription {
            id: "wh-1".into(),
            url: format!("http://{addr}/hook"),
            event_kinds: vec![EventKind::JobCompleted],
            secret: None,
            created_at: Utc::now(),
        };
        let client = build_client(&WebhookConfig::default());
        let outcome = deliver_once(&client, &subscription, &sample_event(EventKind::JobCompleted));
        assert!(matches!(outcome, DeliveryOutcome::NonRetryable(_)));
        handle.join().unwrap();
    }
}
