use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Typical browser limit for a queued beacon payload.
pub const DEFAULT_MAX_BEACON_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("request blocked before sending: {0}")]
    Blocked(String),
    #[error("endpoint failed: {0}")]
    Endpoint(String),
}

impl From<reqwest::Error> for TransportFailure {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            Self::Unreachable(error.to_string())
        } else if error.is_builder() {
            Self::Blocked(error.to_string())
        } else {
            Self::Endpoint(error.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SenderSetupError {
    #[error("no tokio runtime is running")]
    NoRuntime,
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Durable,
    Async,
}

/// One handed-off payload, as seen by recorders and hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub channel: Channel,
    pub path: String,
    pub body: String,
    pub captured_at: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(channel: Channel, path: &str, body: String) -> Self {
        Self {
            channel,
            path: path.to_string(),
            body,
            captured_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
    }
}

/// Fire-and-forget delivery of telemetry payloads.
#[async_trait]
pub trait BestEffortSender: Send + Sync {
    /// Queues `body` for delivery independent of the caller's lifetime.
    /// Returns whether the payload was queued; there is no completion signal
    /// and delivery failures are never reported back.
    fn send_durable(&self, path: &str, body: String) -> bool;

    /// POSTs `payload` as JSON. Callers are expected to swallow the error.
    async fn send_async(&self, path: &str, payload: &Value) -> Result<(), TransportFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpSenderOptions {
    pub base_url: String,
    pub max_beacon_bytes: usize,
    pub request_timeout: Option<Duration>,
}

impl Default for HttpSenderOptions {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            max_beacon_bytes: DEFAULT_MAX_BEACON_BYTES,
            request_timeout: None,
        }
    }
}

pub struct HttpSender {
    client: Client,
    base_url: String,
    max_beacon_bytes: usize,
    runtime: Handle,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HttpSender {
    /// Must be called from inside a tokio runtime; durable sends are spawned on it.
    pub fn new(options: HttpSenderOptions) -> Result<Self, SenderSetupError> {
        let runtime = Handle::try_current().map_err(|_| SenderSetupError::NoRuntime)?;
        let mut builder = Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: options.base_url,
            max_beacon_bytes: options.max_beacon_bytes,
            runtime,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn endpoint_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn in_flight(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending(&self) -> usize {
        self.in_flight()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits for every durable delivery queued so far.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight());
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "beacon delivery task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl BestEffortSender for HttpSender {
    fn send_durable(&self, path: &str, body: String) -> bool {
        if body.len() > self.max_beacon_bytes {
            debug!(
                path,
                bytes = body.len(),
                limit = self.max_beacon_bytes,
                "beacon payload over limit; not queued"
            );
            return false;
        }

        let request = self.client.post(self.endpoint_url(path)).body(body);
        let path = path.to_string();
        let handle = self.runtime.spawn(async move {
            match request.send().await {
                Ok(response) => {
                    debug!(path = %path, status = %response.status(), "beacon delivered")
                }
                Err(error) => {
                    debug!(path = %path, error = %TransportFailure::from(error), "beacon lost")
                }
            }
        });

        let mut in_flight = self.in_flight();
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(handle);
        true
    }

    async fn send_async(&self, path: &str, payload: &Value) -> Result<(), TransportFailure> {
        let response = self
            .client
            .post(self.endpoint_url(path))
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await?;

        debug!(path, status = %response.status(), "json request completed");
        Ok(())
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Keeps every dispatch in memory instead of sending it.
#[derive(Default)]
pub struct RecordingSender {
    dispatches: Mutex<Vec<Dispatch>>,
    async_failure: Option<TransportFailure>,
    max_beacon_bytes: Option<usize>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `send_async` fails with `failure` and records nothing.
    pub fn failing(failure: TransportFailure) -> Self {
        Self {
            async_failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_beacon_limit(mut self, max_beacon_bytes: usize) -> Self {
        self.max_beacon_bytes = Some(max_beacon_bytes);
        self
    }

    fn records(&self) -> MutexGuard<'_, Vec<Dispatch>> {
        self.dispatches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.records().clone()
    }

    pub fn dispatches_to(&self, path: &str) -> Vec<Dispatch> {
        self.records()
            .iter()
            .filter(|dispatch| dispatch.path == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BestEffortSender for RecordingSender {
    fn send_durable(&self, path: &str, body: String) -> bool {
        if self.max_beacon_bytes.is_some_and(|limit| body.len() > limit) {
            return false;
        }
        self.records().push(Dispatch::new(Channel::Durable, path, body));
        true
    }

    async fn send_async(&self, path: &str, payload: &Value) -> Result<(), TransportFailure> {
        if let Some(failure) = &self.async_failure {
            return Err(failure.clone());
        }
        self.records()
            .push(Dispatch::new(Channel::Async, path, payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        join_url, BestEffortSender, Channel, HttpSender, HttpSenderOptions, RecordingSender,
        SenderSetupError, TransportFailure,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct CapturedRequest {
        request_line: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl CapturedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        }
    }

    /// Accepts `count` connections and returns each request as received.
    async fn capture_requests(listener: TcpListener, count: usize) -> Vec<CapturedRequest> {
        let mut captured = Vec::new();
        for _ in 0..count {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let read = stream.read(&mut chunk).await.unwrap();
                assert!(read > 0, "connection closed before headers ended");
                raw.extend_from_slice(&chunk[..read]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos;
                }
            };

            let head = String::from_utf8(raw[..header_end].to_vec()).unwrap();
            let mut lines = head.split("\r\n");
            let request_line = lines.next().unwrap().to_string();
            let headers: Vec<(String, String)> = lines
                .filter_map(|line| line.split_once(':'))
                .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
                .collect();
            let length: usize = headers
                .iter()
                .find(|(key, _)| key == "content-length")
                .map(|(_, value)| value.parse().unwrap())
                .unwrap_or(0);

            let mut body = raw[header_end + 4..].to_vec();
            while body.len() < length {
                let read = stream.read(&mut chunk).await.unwrap();
                assert!(read > 0, "connection closed before body ended");
                body.extend_from_slice(&chunk[..read]);
            }

            stream
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();

            captured.push(CapturedRequest {
                request_line,
                headers,
                body: String::from_utf8(body).unwrap(),
            });
        }
        captured
    }

    #[tokio::test]
    async fn http_sender_matches_wire_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(capture_requests(listener, 2));

        let sender = HttpSender::new(HttpSenderOptions {
            base_url: format!("http://{}", address),
            request_timeout: Some(Duration::from_secs(5)),
            ..HttpSenderOptions::default()
        })
        .unwrap();

        sender
            .send_async("/analytics/api/analytics/record-view", &json!({ "page": "/a" }))
            .await
            .unwrap();

        let beacon = r#"{"event_type":"external_link","event_data":{"url":"https://x.org","linkText":"X"}}"#;
        assert!(sender.send_durable("/analytics/api/analytics/record-event", beacon.to_string()));
        sender.drain().await;

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);

        let view = &requests[0];
        assert_eq!(view.request_line, "POST /analytics/api/analytics/record-view HTTP/1.1");
        assert_eq!(view.header("content-type"), Some("application/json"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&view.body).unwrap(),
            json!({ "page": "/a" })
        );

        let event = &requests[1];
        assert_eq!(event.request_line, "POST /analytics/api/analytics/record-event HTTP/1.1");
        assert_eq!(event.header("content-type"), None);
        assert_eq!(event.body, beacon);
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://h:1/", "/a/b"), "http://h:1/a/b");
        assert_eq!(join_url("http://h:1", "a/b"), "http://h:1/a/b");
        assert_eq!(join_url("http://h:1", "/a"), "http://h:1/a");
    }

    #[tokio::test]
    async fn recording_sender_keeps_both_channels() {
        let sender = RecordingSender::new();
        sender.send_durable("/event", "{\"a\":1}".to_string());
        sender.send_async("/view", &json!({ "page": "/" })).await.unwrap();

        let dispatches = sender.dispatches();
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].channel, Channel::Durable);
        assert_eq!(dispatches[0].payload(), json!({ "a": 1 }));
        assert_eq!(dispatches[1].channel, Channel::Async);
        assert_eq!(sender.dispatches_to("/view").len(), 1);
    }

    #[tokio::test]
    async fn failing_sender_reports_and_records_nothing() {
        let sender = RecordingSender::failing(TransportFailure::Unreachable("down".into()));
        let result = sender.send_async("/view", &json!({})).await;
        assert_eq!(result, Err(TransportFailure::Unreachable("down".into())));
        assert!(sender.dispatches().is_empty());
    }

    #[test]
    fn recording_sender_honours_beacon_limit() {
        let sender = RecordingSender::new().with_beacon_limit(4);
        assert!(!sender.send_durable("/e", "12345".to_string()));
        assert!(sender.send_durable("/e", "1234".to_string()));
        assert_eq!(sender.dispatches().len(), 1);
    }

    #[test]
    fn http_sender_needs_a_runtime() {
        let result = HttpSender::new(HttpSenderOptions::default());
        assert!(matches!(result, Err(SenderSetupError::NoRuntime)));
    }

    #[tokio::test]
    async fn oversized_beacon_is_not_queued() {
        let sender = HttpSender::new(HttpSenderOptions {
            max_beacon_bytes: 8,
            ..HttpSenderOptions::default()
        })
        .unwrap();
        assert!(!sender.send_durable("/e", "x".repeat(9)));
        assert_eq!(sender.pending(), 0);
        sender.drain().await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_failure() {
        let sender = HttpSender::new(HttpSenderOptions {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Some(Duration::from_secs(2)),
            ..HttpSenderOptions::default()
        })
        .unwrap();

        let result = sender.send_async("/view", &json!({ "page": "/" })).await;
        assert!(matches!(
            result,
            Err(TransportFailure::Unreachable(_)) | Err(TransportFailure::Endpoint(_))
        ));
    }

    #[tokio::test]
    async fn invalid_base_url_is_blocked() {
        let sender = HttpSender::new(HttpSenderOptions {
            base_url: "not a url".to_string(),
            ..HttpSenderOptions::default()
        })
        .unwrap();

        let result = sender.send_async("/view", &json!({})).await;
        assert!(matches!(result, Err(TransportFailure::Blocked(_))));
    }

    #[tokio::test]
    async fn durable_send_to_unreachable_endpoint_is_silent() {
        let sender = HttpSender::new(HttpSenderOptions {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Some(Duration::from_secs(2)),
            ..HttpSenderOptions::default()
        })
        .unwrap();

        sender.send_durable("/event", "{}".to_string());
        sender.drain().await;
        assert_eq!(sender.pending(), 0);
    }
}
