//! Broker contract and key schema.
//!
//! The broker is the only component that talks to the backing store. Two
//! implementations ship with the crate:
//! - [`RedisBroker`]: the canonical distributed backend
//! - [`MemoryBroker`]: in-process state for development and tests
//!
//! All broker state lives under the `bokchoy/` namespace:
//! - `bokchoy/<queue>` — ready list of task ids (FIFO, overdue tasks prepended)
//! - `bokchoy/<queue>:delay` — sorted set of task ids scored by ETA nanoseconds
//! - `bokchoy/<queue>/<task_id>` — the serialized task record

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BokchoyResult;

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

pub(crate) const KEY_PREFIX: &str = "bokchoy/";
pub(crate) const DELAY_SUFFIX: &str = ":delay";

/// Builds a namespaced broker key: `bokchoy/<part1>` or
/// `bokchoy/<part1>/<part2>`. Every key the system touches goes through
/// this one builder.
pub(crate) fn build_key(part1: &str, part2: &str) -> String {
    let mut key = String::with_capacity(KEY_PREFIX.len() + part1.len() + 1 + part2.len());
    key.push_str(KEY_PREFIX);
    key.push_str(part1);
    if !part2.is_empty() {
        key.push('/');
        key.push_str(part2);
    }
    key
}

/// Key of a queue's ready list.
pub(crate) fn queue_key(queue: &str) -> String {
    build_key(queue, "")
}

/// Key of a queue's delayed sorted set.
pub(crate) fn delay_key(queue: &str) -> String {
    let mut key = build_key(queue, "");
    key.push_str(DELAY_SUFFIX);
    key
}

/// Counts reported by [`Broker::count`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Tasks waiting in the ready list
    pub direct: usize,
    /// Tasks waiting in the delayed set
    pub delayed: usize,
    /// Sum of both
    pub total: usize,
}

/// Contract between the queueing layer and the backing store.
///
/// Implementations must be safe for concurrent use from every worker of
/// every queue.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Display {
    /// Prepare the broker for use (e.g. preload server-side scripts).
    async fn initialize(&self) -> BokchoyResult<()>;

    /// Check connectivity. Fails with
    /// [`BrokerUnavailable`](crate::BokchoyError::BrokerUnavailable) when the
    /// store is unreachable.
    async fn ping(&self) -> BokchoyResult<()>;

    /// Write the task record and enqueue the task id, atomically.
    ///
    /// `eta` routing: zero appends to the ready list; a past timestamp
    /// prepends (the task is already overdue); a future timestamp inserts
    /// into the delayed set scored by `eta`.
    async fn publish(
        &self,
        queue: &str,
        task_id: &str,
        payload: &[u8],
        eta: i64,
    ) -> BokchoyResult<()>;

    /// Fetch a batch of task records.
    ///
    /// `max_eta` of zero pops from the ready list, blocking up to one
    /// second. A nonzero `max_eta` reads the delayed set members scored in
    /// `[0, max_eta]` without removing them (removal is the promoter's
    /// job). An empty batch is not an error.
    async fn consume(&self, queue: &str, max_eta: i64) -> BokchoyResult<Vec<Vec<u8>>>;

    /// Read one task record, `None` when absent.
    async fn get(&self, queue: &str, task_id: &str) -> BokchoyResult<Option<Vec<u8>>>;

    /// Overwrite a task record. A nonzero `ttl` expires the record after
    /// that duration; zero retains it indefinitely.
    async fn set(
        &self,
        queue: &str,
        task_id: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> BokchoyResult<()>;

    /// Delete a task record. Idempotent.
    async fn delete(&self, queue: &str, task_id: &str) -> BokchoyResult<()>;

    /// Records of every task currently in the ready list, in list order.
    async fn list(&self, queue: &str) -> BokchoyResult<Vec<Vec<u8>>>;

    /// Ready/delayed/total counts for a queue.
    async fn count(&self, queue: &str) -> BokchoyResult<BrokerStats>;

    /// Drop a queue's ready list. The delayed set is left untouched.
    async fn empty(&self, queue: &str) -> BokchoyResult<()>;

    /// Remove every key under the `bokchoy/` namespace.
    async fn clear_all(&self) -> BokchoyResult<()>;
}
