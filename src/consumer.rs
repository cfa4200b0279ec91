//! Consumer slots: the per-queue worker pool, the freeze protocol and the
//! timeout-bounded task dispatch path.
//!
//! Each queue owns a fixed number of slots. Slot 0 is the master: when a
//! burst of consecutive broker errors freezes the pool, only the master
//! keeps probing, dropping retry pressure on the failing dependency to a
//! single caller while preserving liveness. The first successful consume
//! thaws everyone.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::{BokchoyError, BokchoyResult};
use crate::queue::{Handler, QueueShared};
use crate::task::{Task, TaskStatus};

/// Consecutive consume errors tolerated before a slot freezes.
pub(crate) const MAX_ERRORS_IN_A_ROW: i32 = 10;

/// Callback firing aborts after this many status-change rounds.
const MAX_STATUS_CHANGE_ROUNDS: usize = 10;

const STATUS_IDLE: i32 = 0;
const STATUS_ACTIVE: i32 = 1;
const STATUS_STOPPED: i32 = 2;
const STATUS_FROZEN: i32 = 3;

/// One worker slot of a queue.
pub(crate) struct Consumer {
    /// Slot state, one of the STATUS_* constants
    status: AtomicI32,
    /// Whether a consume loop is currently running for this slot. A frozen
    /// slave's loop exits; the thaw must respawn it, and this flag is what
    /// decides between respawn and leaving a still-live loop alone.
    loop_alive: AtomicBool,
    /// Slot index; index 0 is the master
    idx: usize,
    queue: Arc<QueueShared>,
}

impl Consumer {
    pub(crate) fn new(idx: usize, queue: Arc<QueueShared>) -> Self {
        Self {
            status: AtomicI32::new(STATUS_IDLE),
            loop_alive: AtomicBool::new(false),
            idx,
            queue,
        }
    }

    /// Mark the slot active and make sure a loop is running for it.
    pub(crate) fn request_start(self: &Arc<Self>) {
        self.status.store(STATUS_ACTIVE, Ordering::SeqCst);
        self.ensure_loop();
    }

    /// Spawn the consume loop unless one is already live. The liveness
    /// flag, not the status, is the spawn gate: a thaw sets the status to
    /// Active before the old loop has necessarily exited, and must neither
    /// skip the respawn of a dead loop nor double-spawn a live one.
    fn ensure_loop(self: &Arc<Self>) {
        if self
            .loop_alive
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let consumer = Arc::clone(self);
            self.queue
                .tracker
                .spawn(async move { consumer.consume_loop().await });
        }
    }

    /// Ask the loop to exit after its current iteration.
    pub(crate) fn request_stop(&self) {
        self.status.store(STATUS_STOPPED, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_ACTIVE
    }

    #[cfg(test)]
    pub(crate) fn is_frozen(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_FROZEN
    }

    fn may_run(&self, status: i32) -> bool {
        status == STATUS_ACTIVE || (status == STATUS_FROZEN && self.idx == 0)
    }

    async fn consume_loop(&self) {
        debug!(queue = %self.queue.name, consumer = self.idx, "consumer started");

        loop {
            if self.may_run(self.status.load(Ordering::SeqCst)) {
                self.consume_iter().await;
                continue;
            }

            // Hand the slot back before exiting. A thaw may have raced in
            // between the status read and this point; re-check, and if the
            // slot should run again, reclaim it instead of exiting. At most
            // one of this reclaim and a concurrent ensure_loop wins the
            // liveness flag, so the slot never ends up with two loops or
            // none.
            self.loop_alive.store(false, Ordering::SeqCst);
            if self.may_run(self.status.load(Ordering::SeqCst))
                && self
                    .loop_alive
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                continue;
            }
            break;
        }

        debug!(queue = %self.queue.name, consumer = self.idx, "consumer stopped");
    }

    async fn consume_iter(&self) {
        let tasks = match self.queue.consume().await {
            Ok(tasks) => {
                self.handle_error(None);
                tasks
            }
            Err(err) => {
                self.handle_error(Some(&err));
                return;
            }
        };

        if tasks.is_empty() {
            return;
        }

        debug!(
            queue = %self.queue.name,
            received = tasks.len(),
            consumer = self.idx,
            "received tasks to consume"
        );

        for task in tasks {
            let result = self.process_task(task).await;
            self.handle_error(result.as_ref().err());
        }
    }

    /// Track consume outcomes against the shared error counter and drive
    /// the freeze protocol.
    ///
    /// On an error the counter grows; crossing the threshold freezes this
    /// slot (a CAS from Active, so a concurrent stop is never overridden).
    /// On a success the counter resets and the master thaws every frozen
    /// slave. If a slave's CAS fails a stop raced in; the observed status
    /// is propagated to all earlier siblings so the pool converges on the
    /// newest decision.
    fn handle_error(&self, err: Option<&BokchoyError>) {
        let Some(err) = err else {
            self.queue.err_counter.store(0, Ordering::SeqCst);
            if self.idx != 0 {
                return;
            }

            let _ = self.status.compare_exchange(
                STATUS_FROZEN,
                STATUS_ACTIVE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );

            let consumers = self.queue.consumers.read().unwrap().clone();
            for (i, slave) in consumers.iter().enumerate().skip(1) {
                let thawed = slave.status.compare_exchange(
                    STATUS_FROZEN,
                    STATUS_ACTIVE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                match thawed {
                    // The CAS already made the slot Active; what the slave
                    // still needs is a running loop, since a frozen slave's
                    // loop has exited.
                    Ok(_) => slave.ensure_loop(),
                    Err(observed) if observed == STATUS_ACTIVE => {}
                    Err(observed) => {
                        for earlier in &consumers[1..i] {
                            earlier.status.store(observed, Ordering::SeqCst);
                        }
                        break;
                    }
                }
            }
            return;
        };

        let seen = self.queue.err_counter.load(Ordering::SeqCst);
        if seen >= MAX_ERRORS_IN_A_ROW {
            let _ = self.status.compare_exchange(
                STATUS_ACTIVE,
                STATUS_FROZEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            return;
        }

        let count = self.queue.err_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= MAX_ERRORS_IN_A_ROW {
            error!(
                queue = %self.queue.name,
                consumer = self.idx,
                error = %err,
                "error limit reached; every consumer but the master freezes until the broker recovers"
            );
            let _ = self.status.compare_exchange(
                STATUS_ACTIVE,
                STATUS_FROZEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        } else {
            error!(
                queue = %self.queue.name,
                consumer = self.idx,
                errors_in_a_row = count,
                error = %err,
                "failed to consume tasks"
            );
        }
    }

    /// Drive one task through the state machine and write the outcome
    /// back.
    async fn process_task(&self, task: Task) -> BokchoyResult<()> {
        debug!(queue = %self.queue.name, task_id = %task.id(), "task processing started");

        // Cancelled while waiting: the handler chain never runs, the
        // failure and completion callbacks fire once.
        if task.status() == TaskStatus::Cancelled {
            let mut task = task;
            fire_events(&self.queue, &mut task).await;
            return self.queue.save(&mut task).await;
        }

        let mut task = if task.timeout.is_zero() {
            fire(Arc::clone(&self.queue), task).await
        } else {
            let cap = task.timeout;
            let retained = task.clone();
            let handle = tokio::spawn(fire(Arc::clone(&self.queue), task));

            match tokio::time::timeout(cap, handle).await {
                Ok(Ok(done)) => done,
                Ok(Err(join_err)) => {
                    let mut task = retained;
                    task.error = Some(format!("handler task aborted: {join_err}"));
                    task.mark_as_failed();
                    task
                }
                Err(_elapsed) => {
                    // The in-flight handler finishes in the background;
                    // whatever it does to its copy of the task is never
                    // written back.
                    let mut task = retained;
                    task.mark_as_timed_out();
                    warn!(
                        queue = %self.queue.name,
                        task_id = %task.id(),
                        timeout = ?cap,
                        "task timed out; handler left to finish in the background"
                    );
                    task
                }
            }
        };

        // A retrying task was already republished with its record.
        if task.status() == TaskStatus::Retrying {
            return Ok(());
        }

        self.queue.save(&mut task).await
    }
}

/// Run the full dispatch for one task: mark processing, fire the start
/// callbacks, run the handler chain, settle the status, fire the terminal
/// callbacks.
async fn fire(queue: Arc<QueueShared>, mut task: Task) -> Task {
    task.mark_as_processing();
    fire_events(&queue, &mut task).await;

    // A start callback may have re-routed the task already.
    if task.status() != TaskStatus::Processing {
        return task;
    }

    let handlers = queue.handlers_snapshot();
    let status_before = task.status();
    for handler in handlers.iter() {
        safe_call(handler.as_ref(), &mut task).await;
        if !may_continue(&queue, &mut task).await || task.status() != status_before {
            break;
        }
    }

    if task.status() == TaskStatus::Processing {
        task.mark_as_succeeded();
    }

    fire_events(&queue, &mut task).await;
    task
}

/// Invoke one handler with panic containment: a panic is captured into the
/// task and converted into a handler error, and firing continues as if the
/// handler had returned that error.
async fn safe_call(handler: &dyn Handler, task: &mut Task) {
    match AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => task.error = Some(err.to_string()),
        Err(panic) => {
            let message = panic_message(panic);
            task.error = Some(format!("handler panicked: {message}"));
            task.panic = Some(message);
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Whether the firing loop may call the next handler. A pending error is
/// resolved here: schedule a retry when budget remains (recompute the ETA,
/// decrement the budget, republish), otherwise fail the task.
async fn may_continue(queue: &Arc<QueueShared>, task: &mut Task) -> bool {
    match task.status() {
        // Already failed: let the remaining failure callbacks run.
        TaskStatus::Failed => return true,
        TaskStatus::Retrying | TaskStatus::TimedOut | TaskStatus::Invalid => return false,
        TaskStatus::Waiting
        | TaskStatus::Processing
        | TaskStatus::Succeeded
        | TaskStatus::Cancelled => {
            if task.error.is_none() && task.panic.is_none() {
                return true;
            }
        }
    }

    if task.max_retries <= 0 {
        task.mark_as_failed();
        return false;
    }

    task.mark_as_retrying();
    if let Err(err) = queue.publish_task(task).await {
        task.mark_as_failed();
        error!(
            queue = %queue.name,
            task_id = %task.id(),
            error = %err,
            "failed to republish task for retry; marking as failed"
        );
    }
    false
}

/// Fire the status-routed callbacks, bounded to ten status-change rounds.
/// Callbacks that keep flipping the status get the bound, a warning and no
/// further firing.
async fn fire_events(queue: &Arc<QueueShared>, task: &mut Task) {
    let mut converged = false;

    for _ in 0..MAX_STATUS_CHANGE_ROUNDS {
        let callbacks = queue.callbacks_for(task.status());
        let mut status_before = task.status();

        for callback in callbacks.iter() {
            safe_call(callback.as_ref(), task).await;
            if !may_continue(queue, task).await || task.status() != status_before {
                break;
            }
        }

        if task.is_finished() {
            status_before = task.status();
            let completions = queue.on_complete_snapshot();
            for callback in completions.iter() {
                safe_call(callback.as_ref(), task).await;
                if !may_continue(queue, task).await || task.status() != status_before {
                    break;
                }
            }
        }

        if !may_continue(queue, task).await
            || task.status() == status_before
            || task.status() == TaskStatus::Retrying
        {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            queue = %queue.name,
            task_id = %task.id(),
            status = %task.status(),
            "too many status changes while firing callbacks; aborting further firing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerStats, MemoryBroker};
    use crate::config::{Config, TaskOptions};
    use crate::queue::{HandlerList, Queue};
    use crate::serializer::JsonSerializer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fmt;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};
    use tokio_util::task::TaskTracker;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _task: &mut Task) -> BokchoyResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BokchoyError::handler("induced failure"))
            } else {
                Ok(())
            }
        }
    }

    struct SleepingHandler {
        calls: Arc<AtomicUsize>,
        duration: Duration,
    }

    #[async_trait]
    impl Handler for SleepingHandler {
        async fn handle(&self, _task: &mut Task) -> BokchoyResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.duration).await;
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl Handler for PanickingHandler {
        async fn handle(&self, _task: &mut Task) -> BokchoyResult<()> {
            panic!("handler exploded");
        }
    }

    /// Broker that fails its first N consume calls, then behaves.
    struct FlakyBroker {
        inner: MemoryBroker,
        failures_left: AtomicI32,
    }

    impl FlakyBroker {
        fn new(failures: i32) -> Self {
            Self {
                inner: MemoryBroker::new(),
                failures_left: AtomicI32::new(failures),
            }
        }
    }

    impl fmt::Display for FlakyBroker {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("Flaky in-memory broker")
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn initialize(&self) -> BokchoyResult<()> {
            self.inner.initialize().await
        }

        async fn ping(&self) -> BokchoyResult<()> {
            self.inner.ping().await
        }

        async fn publish(
            &self,
            queue: &str,
            task_id: &str,
            payload: &[u8],
            eta: i64,
        ) -> BokchoyResult<()> {
            self.inner.publish(queue, task_id, payload, eta).await
        }

        async fn consume(&self, queue: &str, max_eta: i64) -> BokchoyResult<Vec<Vec<u8>>> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                sleep(Duration::from_millis(2)).await;
                return Err(BokchoyError::broker_message("induced consume failure"));
            }
            self.inner.consume(queue, max_eta).await
        }

        async fn get(&self, queue: &str, task_id: &str) -> BokchoyResult<Option<Vec<u8>>> {
            self.inner.get(queue, task_id).await
        }

        async fn set(
            &self,
            queue: &str,
            task_id: &str,
            payload: &[u8],
            ttl: Duration,
        ) -> BokchoyResult<()> {
            self.inner.set(queue, task_id, payload, ttl).await
        }

        async fn delete(&self, queue: &str, task_id: &str) -> BokchoyResult<()> {
            self.inner.delete(queue, task_id).await
        }

        async fn list(&self, queue: &str) -> BokchoyResult<Vec<Vec<u8>>> {
            self.inner.list(queue).await
        }

        async fn count(&self, queue: &str) -> BokchoyResult<BrokerStats> {
            self.inner.count(queue).await
        }

        async fn empty(&self, queue: &str) -> BokchoyResult<()> {
            self.inner.empty(queue).await
        }

        async fn clear_all(&self) -> BokchoyResult<()> {
            self.inner.clear_all().await
        }
    }

    fn harness(config: Config, broker: Arc<dyn Broker>) -> Queue {
        Queue::new(
            "q1",
            config,
            broker,
            Arc::new(JsonSerializer),
            Arc::new(HandlerList::new()),
            TaskTracker::new(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn counting(calls: &Arc<AtomicUsize>, fail: bool) -> Arc<dyn Handler> {
        Arc::new(CountingHandler {
            calls: Arc::clone(calls),
            fail,
        })
    }

    async fn wait_for_status(queue: &Queue, task_id: &str, want: TaskStatus, deadline: Duration) -> Task {
        let started = Instant::now();
        loop {
            if let Some(task) = queue.get(task_id).await.unwrap() {
                if task.status() == want {
                    return task;
                }
            }
            assert!(
                started.elapsed() < deadline,
                "task {task_id} did not reach {want} within {deadline:?}"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn shutdown(queue: &Queue) {
        queue.shared.stop();
        queue.shared.tracker.close();
        tokio::time::timeout(Duration::from_secs(5), queue.shared.tracker.wait())
            .await
            .expect("consumers did not drain after stop");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_successful_task_fires_each_callback_once() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let on_start = Arc::new(AtomicUsize::new(0));
        let on_success = Arc::new(AtomicUsize::new(0));
        let on_failure = Arc::new(AtomicUsize::new(0));
        let on_complete = Arc::new(AtomicUsize::new(0));

        let queue = harness(Config::default(), Arc::new(MemoryBroker::new()));
        queue.use_handler(counting(&handler_calls, false));
        queue.on_start(counting(&on_start, false));
        queue.on_success(counting(&on_success, false));
        queue.on_failure(counting(&on_failure, false));
        queue.on_complete(counting(&on_complete, false));
        QueueShared::start(&queue.shared);

        let task = queue
            .publish(json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();

        let done = wait_for_status(&queue, task.id(), TaskStatus::Succeeded, Duration::from_secs(3)).await;
        assert!(done.is_finished());
        assert!(done.processed_at() > 0);

        // Let any stray firing settle before asserting exact counts.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
        assert_eq!(on_start.load(Ordering::SeqCst), 1);
        assert_eq!(on_success.load(Ordering::SeqCst), 1);
        assert_eq!(on_failure.load(Ordering::SeqCst), 0);
        assert_eq!(on_complete.load(Ordering::SeqCst), 1);

        shutdown(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_handler_retries_then_fails() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let config = Config::default()
            .with_max_retries(2)
            .with_retry_intervals(vec![Duration::from_millis(100), Duration::from_millis(200)]);

        let queue = harness(config, Arc::new(MemoryBroker::new()));
        queue.use_handler(counting(&handler_calls, true));
        QueueShared::start(&queue.shared);

        let task = queue
            .publish(json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();

        let failed = wait_for_status(&queue, task.id(), TaskStatus::Failed, Duration::from_secs(5)).await;
        assert_eq!(failed.max_retries, 0);
        assert!(failed.eta > 0, "the eta of the final retry is preserved");
        assert_eq!(handler_calls.load(Ordering::SeqCst), 3);

        shutdown(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_discards_late_handler_result() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let config = Config::default().with_timeout(Duration::from_millis(100));

        let queue = harness(config, Arc::new(MemoryBroker::new()));
        queue.use_handler(Arc::new(SleepingHandler {
            calls: Arc::clone(&handler_calls),
            duration: Duration::from_millis(500),
        }));
        QueueShared::start(&queue.shared);

        let task = queue
            .publish(json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();

        wait_for_status(&queue, task.id(), TaskStatus::TimedOut, Duration::from_secs(2)).await;

        // The handler finishes in the background; its success never lands.
        sleep(Duration::from_millis(600)).await;
        let still = queue.get(task.id()).await.unwrap().unwrap();
        assert_eq!(still.status(), TaskStatus::TimedOut);
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

        shutdown(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_countdown_defers_consumption() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let queue = harness(Config::default(), Arc::new(MemoryBroker::new()));
        queue.use_handler(counting(&handler_calls, false));
        QueueShared::start(&queue.shared);

        let options = TaskOptions::default().with_countdown(Duration::from_millis(500));
        let task = queue.publish(json!({"x": 1}), &options).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        let stats = queue.count().await.unwrap();
        assert_eq!((stats.direct, stats.delayed), (0, 1));
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);

        wait_for_status(&queue, task.id(), TaskStatus::Succeeded, Duration::from_secs(3)).await;
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

        shutdown(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_task_skips_handlers_and_fires_failure_callbacks() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let on_failure = Arc::new(AtomicUsize::new(0));
        let on_complete = Arc::new(AtomicUsize::new(0));

        let queue = harness(Config::default(), Arc::new(MemoryBroker::new()));
        queue.use_handler(counting(&handler_calls, false));
        queue.on_failure(counting(&on_failure, false));
        queue.on_complete(counting(&on_complete, false));

        // Publish and cancel before any consumer exists.
        let task = queue
            .publish(json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();
        queue.cancel(task.id()).await.unwrap();

        QueueShared::start(&queue.shared);
        sleep(Duration::from_millis(300)).await;

        let stored = queue.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Cancelled);
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
        assert_eq!(on_failure.load(Ordering::SeqCst), 1);
        assert_eq!(on_complete.load(Ordering::SeqCst), 1);

        shutdown(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_handler_fails_task_without_budget() {
        let on_failure = Arc::new(AtomicUsize::new(0));
        let config = Config::default().with_max_retries(0);

        let queue = harness(config, Arc::new(MemoryBroker::new()));
        queue.use_handler(Arc::new(PanickingHandler));
        queue.on_failure(counting(&on_failure, false));
        QueueShared::start(&queue.shared);

        let task = queue
            .publish(json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();

        let failed = wait_for_status(&queue, task.id(), TaskStatus::Failed, Duration::from_secs(3)).await;
        assert_eq!(failed.max_retries, 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(on_failure.load(Ordering::SeqCst), 1);

        shutdown(&queue).await;
    }

    /// Handler that parks until released, exposing how many invocations
    /// are in flight at once.
    struct BlockingHandler {
        in_flight: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Handler for BlockingHandler {
        async fn handle(&self, _task: &mut Task) -> BokchoyResult<()> {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(10)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_burst_freezes_slaves_and_master_revives_them() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let config = Config::default().with_concurrency(3);
        let queue = harness(config, Arc::new(FlakyBroker::new(60)));
        queue.use_handler(Arc::new(BlockingHandler {
            in_flight: Arc::clone(&in_flight),
            released: Arc::clone(&released),
        }));
        QueueShared::start(&queue.shared);

        // Phase 1: the error burst crosses the threshold and every slave
        // freezes while the master keeps probing.
        let frozen_deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let consumers = queue.shared.consumers.read().unwrap();
                let slaves_frozen = consumers[1..].iter().all(|c| c.is_frozen());
                if slaves_frozen {
                    break;
                }
            }
            assert!(Instant::now() < frozen_deadline, "slaves never froze");
            sleep(Duration::from_millis(10)).await;
        }

        // Phase 2: the broker recovers; the master's first success thaws
        // the pool and resets the counter.
        let thawed_deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let consumers = queue.shared.consumers.read().unwrap();
                if consumers.iter().all(|c| c.is_active()) {
                    break;
                }
            }
            assert!(Instant::now() < thawed_deadline, "pool never thawed");
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.shared.err_counter.load(Ordering::SeqCst), 0);

        // Phase 3: prove the thawed slaves are pulling work again, not just
        // flagged Active. Two parked handlers must be in flight at once;
        // the master is stuck inside the first, so the second can only be
        // picked up by a revived slave loop.
        let first = queue
            .publish(json!({"n": 1}), &TaskOptions::default())
            .await
            .unwrap();
        let second = queue
            .publish(json!({"n": 2}), &TaskOptions::default())
            .await
            .unwrap();

        let concurrent_deadline = Instant::now() + Duration::from_secs(5);
        while in_flight.load(Ordering::SeqCst) < 2 {
            assert!(
                Instant::now() < concurrent_deadline,
                "second task never entered processing; a frozen slave loop did not resume"
            );
            sleep(Duration::from_millis(10)).await;
        }

        released.store(true, Ordering::SeqCst);
        wait_for_status(&queue, first.id(), TaskStatus::Succeeded, Duration::from_secs(3)).await;
        wait_for_status(&queue, second.id(), TaskStatus::Succeeded, Duration::from_secs(3)).await;

        shutdown(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_drains_every_consumer() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let config = Config::default().with_concurrency(2);
        let queue = harness(config, Arc::new(MemoryBroker::new()));
        queue.use_handler(counting(&handler_calls, false));
        QueueShared::start(&queue.shared);

        let task = queue
            .publish(json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();
        wait_for_status(&queue, task.id(), TaskStatus::Succeeded, Duration::from_secs(3)).await;

        // Stop must leave no worker task behind.
        shutdown(&queue).await;
    }
}
