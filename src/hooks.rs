use crate::sender::{BestEffortSender, Channel, Dispatch, TransportFailure};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

pub trait DispatchHook: Send + Sync {
    fn on_dispatch(&self, dispatch: &Dispatch) -> Result<()>;
}

/// Runs hooks for every payload the inner sender accepts. Durable payloads
/// refused at queue time are not reported. Hook failures are logged and
/// never reach the caller.
pub struct HookedSender {
    inner: Arc<dyn BestEffortSender>,
    hooks: Vec<Arc<dyn DispatchHook>>,
}

impl HookedSender {
    pub fn new(inner: Arc<dyn BestEffortSender>, hooks: Vec<Arc<dyn DispatchHook>>) -> Self {
        Self { inner, hooks }
    }

    fn notify(&self, dispatch: &Dispatch) {
        for hook in &self.hooks {
            if let Err(error) = hook.on_dispatch(dispatch) {
                warn!(error = %error, path = %dispatch.path, "dispatch hook failed");
            }
        }
    }
}

#[async_trait]
impl BestEffortSender for HookedSender {
    fn send_durable(&self, path: &str, body: String) -> bool {
        let dispatch = Dispatch::new(Channel::Durable, path, body.clone());
        let queued = self.inner.send_durable(path, body);
        if queued {
            self.notify(&dispatch);
        }
        queued
    }

    async fn send_async(&self, path: &str, payload: &Value) -> Result<(), TransportFailure> {
        self.notify(&Dispatch::new(Channel::Async, path, payload.to_string()));
        self.inner.send_async(path, payload).await
    }
}

/// Appends each dispatch as one JSON line.
pub struct JsonlDispatchLog {
    writer: Mutex<File>,
}

impl JsonlDispatchLog {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).with_context(|| {
                    format!("creating dispatch log directory {}", parent.display())
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening dispatch log {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(file),
        })
    }
}

impl DispatchHook for JsonlDispatchLog {
    fn on_dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        let mut line = serde_json::to_string(dispatch).context("serializing dispatch")?;
        line.push('\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

pub struct TracingHook;

impl DispatchHook for TracingHook {
    fn on_dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        info!(
            channel = ?dispatch.channel,
            path = %dispatch.path,
            bytes = dispatch.body.len(),
            "telemetry dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DispatchHook, HookedSender, JsonlDispatchLog};
    use crate::sender::{BestEffortSender, Channel, Dispatch, RecordingSender, TransportFailure};
    use anyhow::anyhow;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    struct CollectingHook(Mutex<Vec<Dispatch>>);

    impl DispatchHook for CollectingHook {
        fn on_dispatch(&self, dispatch: &Dispatch) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(dispatch.clone());
            Ok(())
        }
    }

    struct BrokenHook;

    impl DispatchHook for BrokenHook {
        fn on_dispatch(&self, _dispatch: &Dispatch) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    fn temp_log_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should move forward")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("page-beacon-hooks-{}", nanos))
            .join(format!("{}.jsonl", name))
    }

    #[tokio::test]
    async fn hooks_see_both_channels_and_inner_still_sends() {
        let inner = Arc::new(RecordingSender::new());
        let collector = Arc::new(CollectingHook(Mutex::new(Vec::new())));
        let hooks: Vec<Arc<dyn DispatchHook>> = vec![collector.clone()];
        let sender = HookedSender::new(inner.clone(), hooks);

        sender.send_durable("/event", "{}".to_string());
        sender.send_async("/view", &json!({ "page": "/" })).await.unwrap();

        let seen = collector.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].channel, Channel::Durable);
        assert_eq!(seen[1].channel, Channel::Async);
        assert_eq!(inner.dispatches().len(), 2);
    }

    #[tokio::test]
    async fn failing_hook_does_not_block_delivery() {
        let inner = Arc::new(RecordingSender::new());
        let hooks: Vec<Arc<dyn DispatchHook>> = vec![Arc::new(BrokenHook)];
        let sender = HookedSender::new(inner.clone(), hooks);

        sender.send_durable("/event", "{}".to_string());
        assert!(sender.send_async("/view", &json!({})).await.is_ok());
        assert_eq!(inner.dispatches().len(), 2);
    }

    #[test]
    fn refused_beacon_is_not_reported_to_hooks() {
        let inner = Arc::new(RecordingSender::new().with_beacon_limit(4));
        let collector = Arc::new(CollectingHook(Mutex::new(Vec::new())));
        let hooks: Vec<Arc<dyn DispatchHook>> = vec![collector.clone()];
        let sender = HookedSender::new(inner.clone(), hooks);

        assert!(!sender.send_durable("/event", "{\"too\":\"long\"}".to_string()));
        assert!(sender.send_durable("/event", "{}".to_string()));

        let seen = collector.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, "{}");
        assert_eq!(inner.dispatches().len(), 1);
    }

    #[tokio::test]
    async fn inner_failure_is_passed_through() {
        let inner = Arc::new(RecordingSender::failing(TransportFailure::Blocked("x".into())));
        let sender = HookedSender::new(inner, Vec::new());
        assert!(sender.send_async("/view", &json!({})).await.is_err());
    }

    #[test]
    fn jsonl_log_appends_one_line_per_dispatch() {
        let path = temp_log_path("dispatches");
        let log = JsonlDispatchLog::new(&path).expect("log should open");

        log.on_dispatch(&Dispatch::new(Channel::Durable, "/event", "{\"a\":1}".to_string()))
            .unwrap();
        log.on_dispatch(&Dispatch::new(Channel::Async, "/view", "{}".to_string()))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Dispatch = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.path, "/event");
        assert_eq!(first.channel, Channel::Durable);

        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }
}
