//! In-process fan-out of rollout and scan progress events.
//!
//! [`EventBus`] is the publish/subscribe hub between the engines and the
//! event-stream gateway. Subscribers register either for a single job or
//! globally; `emit` delivers synchronously under the bus lock, so each
//! subscriber observes a job's events in emission order. A slow or vanished
//! subscriber is pruned without disturbing the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Reserved job id used by the inventory scan engine.
pub const SCAN_JOB_ID: &str = "check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateEventType {
    JobStarted,
    JobProgress,
    JobCompleted,
    RouterStarted,
    RouterProgress,
    RouterCompleted,
    RouterFailed,
    BatchStarted,
    BatchCompleted,
    BatchWaiting,
}

impl UpdateEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::JobProgress => "job_progress",
            Self::JobCompleted => "job_completed",
            Self::RouterStarted => "router_started",
            Self::RouterProgress => "router_progress",
            Self::RouterCompleted => "router_completed",
            Self::RouterFailed => "router_failed",
            Self::BatchStarted => "batch_started",
            Self::BatchCompleted => "batch_completed",
            Self::BatchWaiting => "batch_waiting",
        }
    }
}

/// Optional-field data bag carried by every event. Only the fields relevant
/// to the event type are set; nulls are omitted on the wire.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_batches: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_time_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateEvent {
    #[serde(rename = "type")]
    pub event_type: UpdateEventType,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: EventData,
}

impl UpdateEvent {
    pub fn new(event_type: UpdateEventType, job_id: impl Into<String>) -> Self {
        Self {
            event_type,
            job_id: job_id.into(),
            timestamp: Utc::now(),
            data: EventData::default(),
        }
    }

    pub fn with_router(mut self, id: Uuid, device_name: &str, ip_address: &str) -> Self {
        self.data.router_id = Some(id);
        self.data.device_name = Some(device_name.to_string());
        self.data.ip_address = Some(ip_address.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.data.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.data.status = Some(status.into());
        self
    }

    pub fn with_progress(mut self, progress: u32) -> Self {
        self.data.progress = Some(progress);
        self
    }

    pub fn with_total(mut self, total: u32) -> Self {
        self.data.total = Some(total);
        self
    }

    pub fn with_counts(mut self, completed: u32, failed: u32) -> Self {
        self.data.completed = Some(completed);
        self.data.failed = Some(failed);
        self
    }

    pub fn with_batch(mut self, batch_number: u32, total_batches: u32) -> Self {
        self.data.batch_number = Some(batch_number);
        self.data.total_batches = Some(total_batches);
        self
    }

    pub fn with_wait_remaining(mut self, minutes: u32) -> Self {
        self.data.wait_time_remaining = Some(minutes);
        self
    }

    pub fn with_firmware(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.data.firmware_before = before;
        self.data.firmware_after = after;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.data.error = Some(error.into());
        self
    }
}

#[derive(Default)]
struct Registry {
    by_job: HashMap<String, HashMap<u64, mpsc::UnboundedSender<UpdateEvent>>>,
    global: HashMap<u64, mpsc::UnboundedSender<UpdateEvent>>,
}

#[derive(Default)]
struct BusInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

/// Process-wide event hub. The handle clones cheaply; all clones share one
/// subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    bus: EventBus,
    scope: Option<String>,
    id: u64,
    rx: mpsc::UnboundedReceiver<UpdateEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UpdateEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.scope.as_deref(), self.id);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the events of a single job.
    pub fn subscribe(&self, job_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.inner.registry.lock().expect("event bus lock poisoned");
        registry
            .by_job
            .entry(job_id.to_string())
            .or_default()
            .insert(id, tx);
        Subscription {
            bus: self.clone(),
            scope: Some(job_id.to_string()),
            id,
            rx,
        }
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe_all(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.inner.registry.lock().expect("event bus lock poisoned");
        registry.global.insert(id, tx);
        Subscription {
            bus: self.clone(),
            scope: None,
            id,
            rx,
        }
    }

    /// Deliver an event to the job's subscribers and all global subscribers.
    /// Delivery order per subscriber matches emission order; a closed
    /// subscriber is pruned and does not affect the rest.
    pub fn emit(&self, event: UpdateEvent) {
        let mut registry = self.inner.registry.lock().expect("event bus lock poisoned");
        if let Some(subscribers) = registry.by_job.get_mut(&event.job_id) {
            subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
        registry.global.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Drop all subscribers scoped to a finished job.
    pub fn cleanup(&self, job_id: &str) {
        let mut registry = self.inner.registry.lock().expect("event bus lock poisoned");
        registry.by_job.remove(job_id);
    }

    fn unsubscribe(&self, scope: Option<&str>, id: u64) {
        let mut registry = self.inner.registry.lock().expect("event bus lock poisoned");
        match scope {
            Some(job_id) => {
                if let Some(subscribers) = registry.by_job.get_mut(job_id) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        registry.by_job.remove(job_id);
                    }
                }
            }
            None => {
                registry.global.remove(&id);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, job_id: &str) -> usize {
        let registry = self.inner.registry.lock().expect("event bus lock poisoned");
        registry.by_job.get(job_id).map(|s| s.len()).unwrap_or(0)
    }
}
