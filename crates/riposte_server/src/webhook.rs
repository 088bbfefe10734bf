//! Webhook notifier: fire-and-forget event fan-out.
//!
//! Events go through a bounded queue drained by a dedicated delivery
//! thread, so a slow sink can never block a worker. Delivery is
//! best-effort with bounded retries and exponential backoff; a full
//! queue drops the event with a warning rather than applying
//! backpressure to the evaluator.

use riposte_protocol::defaults::{
    WEBHOOK_BACKOFF_BASE_MS, WEBHOOK_MAX_RETRIES, WEBHOOK_QUEUE_DEPTH,
};
use riposte_protocol::{Event, EventKind};
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Transport seam for delivery; the production implementation posts
/// over HTTP, tests record.
pub trait WebhookTransport: Send + Sync {
    fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<(), String>;
}

/// HTTP transport. The blocking client is built lazily on the
/// delivery thread; constructing it inside the async runtime would
/// panic.
pub struct HttpTransport {
    client: std::sync::OnceLock<reqwest::blocking::Client>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: std::sync::OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new())
        })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookTransport for HttpTransport {
    fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<(), String> {
        let mut request = self
            .client()
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("sink returned {}", response.status()))
        }
    }
}

/// A registered event sink.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebhookSink {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Subscribe to a subset of kinds; empty means everything.
    #[serde(default)]
    pub kinds: Vec<EventKind>,
}

impl WebhookSink {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Event fan-out with a dedicated delivery queue.
pub struct Notifier {
    sinks: Arc<RwLock<Vec<WebhookSink>>>,
    queue: SyncSender<Event>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn WebhookTransport>) -> Arc<Self> {
        let (tx, rx) = sync_channel::<Event>(WEBHOOK_QUEUE_DEPTH);
        let sinks: Arc<RwLock<Vec<WebhookSink>>> = Arc::new(RwLock::new(Vec::new()));

        spawn_delivery_thread(rx, Arc::clone(&sinks), transport);

        Arc::new(Self { sinks, queue: tx })
    }

    pub fn register(&self, sink: WebhookSink) {
        if let Ok(mut sinks) = self.sinks.write() {
            debug!(url = %sink.url, "webhook sink registered");
            sinks.push(sink);
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Queue an event for delivery. Never blocks.
    pub fn emit(&self, event: Event) {
        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(kind = %event.kind, "webhook queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("webhook delivery thread gone");
            }
        }
    }
}

fn spawn_delivery_thread(
    rx: Receiver<Event>,
    sinks: Arc<RwLock<Vec<WebhookSink>>>,
    transport: Arc<dyn WebhookTransport>,
) {
    std::thread::Builder::new()
        .name("webhook-delivery".to_string())
        .spawn(move || {
            for event in rx {
                let targets: Vec<WebhookSink> = sinks
                    .read()
                    .map(|s| s.iter().filter(|s| s.wants(event.kind)).cloned().collect())
                    .unwrap_or_default();
                if targets.is_empty() {
                    continue;
                }
                let Ok(body) = serde_json::to_vec(&event) else {
                    continue;
                };
                for sink in targets {
                    deliver_with_retry(transport.as_ref(), &sink, &body, event.kind);
                }
            }
            debug!("webhook delivery thread stopping");
        })
        .expect("spawning the delivery thread cannot fail");
}

fn deliver_with_retry(
    transport: &dyn WebhookTransport,
    sink: &WebhookSink,
    body: &[u8],
    kind: EventKind,
) {
    for attempt in 0..=WEBHOOK_MAX_RETRIES {
        match transport.post(&sink.url, &sink.headers, body) {
            Ok(()) => {
                debug!(url = %sink.url, kind = %kind, "webhook delivered");
                return;
            }
            Err(e) if attempt < WEBHOOK_MAX_RETRIES => {
                let backoff = WEBHOOK_BACKOFF_BASE_MS << attempt;
                debug!(url = %sink.url, attempt, "delivery failed ({}), retrying in {}ms", e, backoff);
                std::thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => {
                warn!(url = %sink.url, kind = %kind, "webhook delivery abandoned: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every delivered event body for assertions.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub posts: Mutex<Vec<(String, Vec<u8>)>>,
        pub fail_first: Mutex<usize>,
    }

    impl WebhookTransport for RecordingTransport {
        fn post(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
            body: &[u8],
        ) -> Result<(), String> {
            let mut failures = self.fail_first.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err("simulated failure".to_string());
            }
            self.posts
                .lock()
                .unwrap()
                .push((url.to_string(), body.to_vec()));
            Ok(())
        }
    }

    pub fn wait_for_posts(transport: &RecordingTransport, count: usize) -> Vec<(String, Vec<u8>)> {
        for _ in 0..500 {
            {
                let posts = transport.posts.lock().unwrap();
                if posts.len() >= count {
                    return posts.clone();
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        transport.posts.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{wait_for_posts, RecordingTransport};
    use super::*;
    use riposte_protocol::JobId;

    #[test]
    fn test_fanout_to_matching_sinks() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone() as Arc<dyn WebhookTransport>);

        notifier.register(WebhookSink {
            url: "http://a".to_string(),
            headers: HashMap::new(),
            kinds: vec![],
        });
        notifier.register(WebhookSink {
            url: "http://failures-only".to_string(),
            headers: HashMap::new(),
            kinds: vec![EventKind::JobFailed],
        });

        notifier.emit(Event::for_job(EventKind::JobCompleted, JobId::from("j1")));

        let posts = wait_for_posts(&transport, 1);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "http://a");
        let body: Event = serde_json::from_slice(&posts[0].1).unwrap();
        assert_eq!(body.kind, EventKind::JobCompleted);
    }

    #[test]
    fn test_retry_until_success() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.fail_first.lock().unwrap() = 2;
        let notifier = Notifier::new(transport.clone() as Arc<dyn WebhookTransport>);

        notifier.register(WebhookSink {
            url: "http://flaky".to_string(),
            headers: HashMap::new(),
            kinds: vec![],
        });
        notifier.emit(Event::for_job(EventKind::JobFailed, JobId::from("j1")));

        let posts = wait_for_posts(&transport, 1);
        assert_eq!(posts.len(), 1, "delivered after transient failures");
    }

    #[test]
    fn test_emit_never_blocks_without_sinks() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport as Arc<dyn WebhookTransport>);
        for i in 0..1000 {
            notifier.emit(Event::for_job(
                EventKind::JobSubmitted,
                JobId::from(format!("j{i}").as_str()),
            ));
        }
    }
}
