//! In-memory broker implementation.
//!
//! Keeps the whole contract in process memory: ready lists, delayed sets
//! and task records with lazy TTL expiry. Useful for development, for
//! single-process deployments that do not need durability, and as the
//! backend the test suite runs against.
//!
//! Delayed tasks are promoted inline at the top of each consume call
//! instead of by a background ticker: with a single process there is no
//! crash window between the two structures to defend against.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{build_key, Broker, BrokerStats};
use crate::error::BokchoyResult;
use crate::task::now_nanos;

#[derive(Debug)]
struct MemoryRecord {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Ready task ids per queue; front is the consumption end
    ready: HashMap<String, VecDeque<String>>,
    /// Delayed (eta, task id) pairs per queue, kept sorted by eta
    delayed: HashMap<String, Vec<(i64, String)>>,
    /// Task records by full record key
    records: HashMap<String, MemoryRecord>,
}

impl MemoryState {
    /// Move every due delayed task into the ready list, prepended since its
    /// ETA has already passed.
    fn promote_due(&mut self, queue: &str, now: i64) {
        let Some(delayed) = self.delayed.get_mut(queue) else {
            return;
        };
        let ready = self.ready.entry(queue.to_string()).or_default();
        let mut remaining = Vec::with_capacity(delayed.len());
        for (eta, task_id) in delayed.drain(..) {
            if eta <= now {
                ready.push_front(task_id);
            } else {
                remaining.push((eta, task_id));
            }
        }
        *delayed = remaining;
    }

    /// Nanoseconds until the next delayed task of this queue comes due.
    fn next_due_in(&self, queue: &str, now: i64) -> Option<i64> {
        self.delayed
            .get(queue)?
            .iter()
            .map(|(eta, _)| *eta - now)
            .min()
    }

    fn record(&mut self, key: &str, now: Instant) -> Option<&MemoryRecord> {
        if let Some(record) = self.records.get(key) {
            if record.expires_at.is_some_and(|at| at <= now) {
                self.records.remove(key);
                return None;
            }
        }
        self.records.get(key)
    }
}

/// In-process broker, safe for concurrent use from every worker.
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty in-memory broker.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
        }
    }

    /// Promote due tasks and pop the next ready id, returning its record.
    fn try_pop(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.promote_due(queue, now_nanos());
        let task_id = state.ready.get_mut(queue)?.pop_front()?;
        let key = build_key(queue, &task_id);
        state.record(&key, Instant::now()).map(|r| r.payload.clone())
    }

    /// How long a consume call may sleep before something can change:
    /// capped at the 1-second blocking-pop budget, shortened when a delayed
    /// task comes due earlier.
    fn wait_budget(&self, queue: &str) -> Duration {
        let cap = Duration::from_secs(1);
        let state = self.state.lock().unwrap();
        match state.next_due_in(queue, now_nanos()) {
            Some(nanos) if nanos <= 0 => Duration::ZERO,
            Some(nanos) => cap.min(Duration::from_nanos(nanos as u64)),
            None => cap,
        }
    }
}

impl fmt::Display for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("In-memory broker")
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn initialize(&self) -> BokchoyResult<()> {
        Ok(())
    }

    async fn ping(&self) -> BokchoyResult<()> {
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        task_id: &str,
        payload: &[u8],
        eta: i64,
    ) -> BokchoyResult<()> {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            build_key(queue, task_id),
            MemoryRecord {
                payload: payload.to_vec(),
                expires_at: None,
            },
        );

        if eta == 0 {
            state
                .ready
                .entry(queue.to_string())
                .or_default()
                .push_back(task_id.to_string());
        } else if eta <= now_nanos() {
            // Already overdue, consume before the backlog.
            state
                .ready
                .entry(queue.to_string())
                .or_default()
                .push_front(task_id.to_string());
        } else {
            let delayed = state.delayed.entry(queue.to_string()).or_default();
            delayed.push((eta, task_id.to_string()));
            delayed.sort_by(|a, b| a.0.cmp(&b.0));
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str, max_eta: i64) -> BokchoyResult<Vec<Vec<u8>>> {
        if max_eta != 0 {
            // Delayed read: no removal, the promoter owns that.
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let ids: Vec<String> = state
                .delayed
                .get(queue)
                .map(|d| {
                    d.iter()
                        .filter(|(eta, _)| *eta <= max_eta)
                        .map(|(_, id)| id.clone())
                        .collect()
                })
                .unwrap_or_default();
            let records = ids
                .iter()
                .filter_map(|id| {
                    let key = build_key(queue, id);
                    state.record(&key, now).map(|r| r.payload.clone())
                })
                .collect();
            return Ok(records);
        }

        if let Some(payload) = self.try_pop(queue) {
            return Ok(vec![payload]);
        }

        let notified = self.notify.notified();
        if let Some(payload) = self.try_pop(queue) {
            return Ok(vec![payload]);
        }

        let _ = tokio::time::timeout(self.wait_budget(queue), notified).await;
        Ok(self.try_pop(queue).into_iter().collect())
    }

    async fn get(&self, queue: &str, task_id: &str) -> BokchoyResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        let key = build_key(queue, task_id);
        Ok(state.record(&key, Instant::now()).map(|r| r.payload.clone()))
    }

    async fn set(
        &self,
        queue: &str,
        task_id: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> BokchoyResult<()> {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            build_key(queue, task_id),
            MemoryRecord {
                payload: payload.to_vec(),
                expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, queue: &str, task_id: &str) -> BokchoyResult<()> {
        let mut state = self.state.lock().unwrap();
        state.records.remove(&build_key(queue, task_id));
        Ok(())
    }

    async fn list(&self, queue: &str) -> BokchoyResult<Vec<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let ids: Vec<String> = state
            .ready
            .get(queue)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let key = build_key(queue, id);
                state.record(&key, now).map(|r| r.payload.clone())
            })
            .collect())
    }

    async fn count(&self, queue: &str) -> BokchoyResult<BrokerStats> {
        let state = self.state.lock().unwrap();
        let direct = state.ready.get(queue).map_or(0, VecDeque::len);
        let delayed = state.delayed.get(queue).map_or(0, Vec::len);
        Ok(BrokerStats {
            direct,
            delayed,
            total: direct + delayed,
        })
    }

    async fn empty(&self, queue: &str) -> BokchoyResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ready.remove(queue);
        Ok(())
    }

    async fn clear_all(&self) -> BokchoyResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ready.clear();
        state.delayed.clear();
        state.records.clear();
        Ok(())
    }
}
