//! Task model: lifecycle state, retry scheduling and the wire envelope.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::BokchoyResult;
use crate::serializer::Serializer;

/// Current time as Unix nanoseconds, the clock every timestamp in the
/// system is expressed in (including delayed-set scores).
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Status of a task over its lifecycle.
///
/// The discriminants are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum TaskStatus {
    /// Zero value of a record that was never initialized properly
    Invalid = 0,
    /// Published, waiting in the ready list or the delayed set
    Waiting = 1,
    /// Picked up by a consumer, handlers running
    Processing = 2,
    /// Handler failed with retry budget left; republished with a new ETA
    Retrying = 5,
    /// Handler chain completed without error (terminal)
    Succeeded = 10,
    /// Handler failed with no retry budget left (terminal)
    Failed = -1,
    /// Cancelled before or during processing (terminal)
    Cancelled = -2,
    /// Handler execution exceeded the task timeout (terminal)
    TimedOut = -3,
}

impl TaskStatus {
    /// Whether this status ends the task lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    fn from_wire(raw: i8) -> TaskStatus {
        match raw {
            1 => TaskStatus::Waiting,
            2 => TaskStatus::Processing,
            5 => TaskStatus::Retrying,
            10 => TaskStatus::Succeeded,
            -1 => TaskStatus::Failed,
            -2 => TaskStatus::Cancelled,
            -3 => TaskStatus::TimedOut,
            _ => TaskStatus::Invalid,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Invalid => "invalid",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Processing => "processing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// A unit of work flowing through a queue.
///
/// Tasks are created by [`Queue::new_task`](crate::Queue::new_task) (or
/// [`Queue::publish`](crate::Queue::publish)), which stamps the id, the
/// owning queue and the queue's option defaults. Identity fields are
/// private; everything a handler may legitimately touch is public.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: String,
    queue_name: String,
    /// When the task was published, Unix nanoseconds
    pub published_at: i64,
    started_at: i64,
    processed_at: i64,
    status: TaskStatus,
    old_status: TaskStatus,
    /// Remaining retry budget, decremented on each retry scheduling
    pub max_retries: i8,
    /// Last handler error, if any
    pub error: Option<String>,
    /// Last captured handler panic, if any
    pub panic: Option<String>,
    payload: Value,
    payload_encoded: Vec<u8>,
    payload_dirty: bool,
    /// Wall-clock duration of the last handler execution
    pub exec_time: Duration,
    /// How long the record is retained after reaching a terminal status
    pub ttl: Duration,
    /// Hard cap on a single handler execution; zero disables
    pub timeout: Duration,
    /// Absolute eligibility time, Unix nanoseconds; zero means immediate
    pub eta: i64,
    /// Backoff schedule indexed by attempt number
    pub retry_intervals: Vec<Duration>,
}

impl Task {
    pub(crate) fn new(queue_name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Ulid::new().to_string(),
            queue_name: queue_name.into(),
            published_at: now_nanos(),
            started_at: 0,
            processed_at: 0,
            status: TaskStatus::Waiting,
            old_status: TaskStatus::Invalid,
            max_retries: 0,
            error: None,
            panic: None,
            payload,
            payload_encoded: Vec::new(),
            payload_dirty: true,
            exec_time: Duration::ZERO,
            ttl: Duration::ZERO,
            timeout: Duration::ZERO,
            eta: 0,
            retry_intervals: Vec::new(),
        }
    }

    /// Unique lexicographically time-sortable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the owning queue, immutable after creation.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Record key of this task: `<queue>/<id>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.queue_name, self.id)
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// When handler execution started, Unix nanoseconds; zero if never started.
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// When the task reached its last settled status, Unix nanoseconds.
    pub fn processed_at(&self) -> i64 {
        self.processed_at
    }

    /// The opaque user payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Replace the payload; the serialized cache is regenerated on next save.
    pub fn set_payload(&mut self, payload: Value) {
        self.payload = payload;
        self.payload_dirty = true;
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> BokchoyResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Overwrite the status. Intended for lifecycle callbacks that
    /// deliberately re-route a task; firing is bounded, see
    /// [`Queue`](crate::Queue) callback semantics.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.transition(status);
    }

    fn transition(&mut self, next: TaskStatus) {
        self.old_status = self.status;
        self.status = next;
    }

    pub(crate) fn mark_as_processing(&mut self) {
        self.started_at = now_nanos();
        self.transition(TaskStatus::Processing);
    }

    pub(crate) fn mark_as_succeeded(&mut self) {
        self.processed_at = now_nanos();
        self.transition(TaskStatus::Succeeded);
        self.exec_time = Duration::from_nanos((self.processed_at - self.started_at).max(0) as u64);
    }

    pub(crate) fn mark_as_failed(&mut self) {
        self.processed_at = now_nanos();
        self.transition(TaskStatus::Failed);
        self.exec_time = Duration::from_nanos((self.processed_at - self.started_at).max(0) as u64);
    }

    pub(crate) fn mark_as_cancelled(&mut self) {
        self.processed_at = now_nanos();
        self.transition(TaskStatus::Cancelled);
    }

    pub(crate) fn mark_as_timed_out(&mut self) {
        self.processed_at = now_nanos();
        self.transition(TaskStatus::TimedOut);
    }

    /// Schedule the next attempt. The ETA is computed from the backoff
    /// schedule before the budget is decremented: with `k` intervals and
    /// `r` retries remaining, attempt `k-r+1` uses `retry_intervals[k-r]`
    /// (the first attempt, where `r == k`, uses index 0). Decrementing
    /// first would index one past the schedule on the final attempt.
    pub(crate) fn mark_as_retrying(&mut self) {
        self.eta = self.next_eta();
        self.max_retries = self.max_retries.saturating_sub(1);
        self.transition(TaskStatus::Retrying);
    }

    fn next_eta(&self) -> i64 {
        let k = self.retry_intervals.len() as i8;
        if k == 0 {
            return 0;
        }
        let interval = if self.max_retries < k {
            self.retry_intervals[(k - self.max_retries) as usize]
        } else {
            self.retry_intervals[0]
        };
        now_nanos() + interval.as_nanos() as i64
    }

    /// Whether the task has settled and the completion callbacks should run.
    ///
    /// Succeeded counts whether observed now or before the current firing
    /// round; Failed counts only once the retry budget is spent; Cancelled
    /// and TimedOut always count.
    pub fn is_finished(&self) -> bool {
        self.old_status == TaskStatus::Succeeded
            || self.status == TaskStatus::Succeeded
            || ((self.old_status == TaskStatus::Failed || self.status == TaskStatus::Failed)
                && self.max_retries <= 0)
            || self.status == TaskStatus::Cancelled
            || self.status == TaskStatus::TimedOut
    }

    /// Encode the task into its wire envelope.
    ///
    /// The payload bytes are reused from the cache unless the payload was
    /// replaced since the last encoding.
    pub fn serialize(&mut self, serializer: &dyn Serializer) -> BokchoyResult<Vec<u8>> {
        if self.payload_dirty || self.payload_encoded.is_empty() {
            self.payload_encoded = serializer.dumps(&self.payload)?;
            self.payload_dirty = false;
        }

        let view = TaskEnvelope {
            id: self.id.clone(),
            queue_name: self.queue_name.clone(),
            published_at: self.published_at,
            started_at: self.started_at,
            processed_at: self.processed_at,
            status: self.status as i8,
            old_status: self.old_status as i8,
            max_retries: self.max_retries,
            payload: serde_bytes::ByteBuf::from(self.payload_encoded.clone()),
            exec_time: self.exec_time.as_nanos() as i64,
            ttl: self.ttl.as_nanos() as i64,
            timeout: self.timeout.as_nanos() as i64,
            eta: self.eta,
            retry_intervals: self
                .retry_intervals
                .iter()
                .map(|d| d.as_nanos() as i64)
                .collect(),
        };

        Ok(rmp_serde::to_vec_named(&view)?)
    }

    /// Decode a task from its wire envelope.
    pub fn deserialize(data: &[u8], serializer: &dyn Serializer) -> BokchoyResult<Task> {
        let view: TaskEnvelope = rmp_serde::from_slice(data)?;
        let payload_encoded = view.payload.into_vec();
        let payload = serializer.loads(&payload_encoded)?;

        Ok(Task {
            id: view.id,
            queue_name: view.queue_name,
            published_at: view.published_at,
            started_at: view.started_at,
            processed_at: view.processed_at,
            status: TaskStatus::from_wire(view.status),
            old_status: TaskStatus::from_wire(view.old_status),
            max_retries: view.max_retries,
            error: None,
            panic: None,
            payload,
            payload_encoded,
            payload_dirty: false,
            exec_time: Duration::from_nanos(view.exec_time.max(0) as u64),
            ttl: Duration::from_nanos(view.ttl.max(0) as u64),
            timeout: Duration::from_nanos(view.timeout.max(0) as u64),
            eta: view.eta,
            retry_intervals: view
                .retry_intervals
                .into_iter()
                .map(|n| Duration::from_nanos(n.max(0) as u64))
                .collect(),
        })
    }
}

/// Wire form of a [`Task`]: primitive-typed fields only, so the envelope
/// codec never has to reflect over domain types. Durations and timestamps
/// travel as i64 nanoseconds, the status as its i8 discriminant. The user
/// payload is an opaque byte string produced by the configured
/// [`Serializer`]; handler errors and panics are process-local and do not
/// travel.
#[derive(Serialize, Deserialize)]
struct TaskEnvelope {
    #[serde(rename = "id")]
    id: String,
    #[serde(rename = "nn")]
    queue_name: String,
    #[serde(rename = "pl")]
    published_at: i64,
    #[serde(rename = "st")]
    started_at: i64,
    #[serde(rename = "pr")]
    processed_at: i64,
    #[serde(rename = "s")]
    status: i8,
    #[serde(rename = "s0")]
    old_status: i8,
    #[serde(rename = "re")]
    max_retries: i8,
    #[serde(rename = "p", with = "serde_bytes")]
    payload: serde_bytes::ByteBuf,
    #[serde(rename = "ex")]
    exec_time: i64,
    #[serde(rename = "tl")]
    ttl: i64,
    #[serde(rename = "to")]
    timeout: i64,
    #[serde(rename = "et")]
    eta: i64,
    #[serde(rename = "ri")]
    retry_intervals: Vec<i64>,
}
