//! Fire-and-forget notification delivery.

pub mod telegram;

pub use telegram::TelegramSink;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Signal,
    /// A signal dropped by a gate before submission.
    Dropped,
    Fill,
    Reject,
    Trail,
    Close,
    Zone,
    Halt,
    Summary,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Signal => "signal",
            EventKind::Dropped => "signal-dropped",
            EventKind::Fill => "fill",
            EventKind::Reject => "reject",
            EventKind::Trail => "trail",
            EventKind::Close => "close",
            EventKind::Zone => "zone",
            EventKind::Halt => "halt",
            EventKind::Summary => "summary",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// One human-readable line.
    pub message: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: EventKind, message: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            message: message.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

/// Writes every event to the log. Used when no external channel is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        info!("[{}] {}", event.kind, event.message);
        Ok(())
    }
}

/// Cloneable handle fanning events out to every sink. `notify` returns
/// immediately; each delivery runs on its own task under a timeout.
/// Clones share the set of deliveries still in flight so `drain` sees them all.
#[derive(Clone)]
pub struct Notifier {
    sinks: Arc<Vec<Arc<dyn NotificationSink>>>,
    timeout: Duration,
    pending: Arc<Mutex<JoinSet<()>>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, timeout: Duration) -> Self {
        Self {
            sinks: Arc::new(sinks),
            timeout,
            pending: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// A notifier with no sinks.
    pub fn silent() -> Self {
        Self::new(Vec::new(), Duration::from_secs(1))
    }

    pub fn notify(&self, event: NotificationEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to deliver {} notification", event.kind);
            return;
        };
        let event = Arc::new(event);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while pending.try_join_next().is_some() {}
        for sink in self.sinks.iter() {
            let sink = Arc::clone(sink);
            let event = Arc::clone(&event);
            let limit = self.timeout;
            pending.spawn_on(async move {
                match tokio::time::timeout(limit, sink.deliver(&event)).await {
                    Ok(Ok(())) => debug!("Delivered {} via {}", event.kind, sink.name()),
                    Ok(Err(e)) => warn!("{} delivery of {} failed: {}", sink.name(), event.kind, e),
                    Err(_) => warn!("{} delivery of {} timed out", sink.name(), event.kind),
                }
            }, &handle);
        }
    }

    /// Wait for deliveries still in flight, at most one delivery timeout.
    pub async fn drain(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if pending.is_empty() {
            return;
        }
        let limit = self.timeout + Duration::from_millis(50);
        let finished = tokio::time::timeout(limit, async {
            while pending.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !finished {
            warn!("Abandoning {} notification(s) still in flight", pending.len());
            pending.abort_all();
        }
    }
}
