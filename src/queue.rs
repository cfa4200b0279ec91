//! Queue handle: handler registration, publishing and broker-backed
//! inspection.
//!
//! A [`Queue`] is created lazily by the coordinator and shared by cheap
//! clone. It owns a fixed set of consumer slots (sized by the concurrency
//! option), the main handler chain and the four lifecycle callback lists.
//! Handler chains are inherited from the coordinator by aliasing; the
//! first per-queue registration copies the chain so sibling queues never
//! observe each other's handlers.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerStats};
use crate::config::{Config, TaskOptions};
use crate::consumer::Consumer;
use crate::error::{BokchoyError, BokchoyResult};
use crate::serializer::Serializer;
use crate::task::{now_nanos, Task, TaskStatus};

/// A unit of task-processing logic: the main handler of a queue, or one of
/// its lifecycle callbacks.
///
/// Handlers receive the task mutably and may rewrite its payload or
/// status; returning an error routes the task into retry or failure.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one task.
    async fn handle(&self, task: &mut Task) -> BokchoyResult<()>;
}

/// Adapter implementing [`Handler`] for a closure; built by [`handler_fn`].
pub struct HandlerFunc<F>(F);

#[async_trait]
impl<F> Handler for HandlerFunc<F>
where
    F: for<'a> Fn(&'a mut Task) -> BoxFuture<'a, BokchoyResult<()>> + Send + Sync,
{
    async fn handle(&self, task: &mut Task) -> BokchoyResult<()> {
        (self.0)(task).await
    }
}

/// Wrap a closure as a [`Handler`].
///
/// ```rust
/// use bokchoy::handler_fn;
/// use futures::FutureExt;
///
/// let handler = handler_fn(|task| {
///     let id = task.id().to_string();
///     async move {
///         println!("processing {id}");
///         Ok(())
///     }
///     .boxed()
/// });
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut Task) -> BoxFuture<'a, BokchoyResult<()>> + Send + Sync + 'static,
{
    Arc::new(HandlerFunc(f))
}

pub(crate) type HandlerList = Vec<Arc<dyn Handler>>;

pub(crate) struct QueueShared {
    pub(crate) name: String,
    pub(crate) options: Config,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) serializer: Arc<dyn Serializer>,
    /// Consecutive consume failures, shared by every slot of this queue
    pub(crate) err_counter: AtomicI32,
    /// Main handler chain; aliases the coordinator chain until the first
    /// per-queue registration copies it
    handlers: RwLock<Arc<HandlerList>>,
    /// The coordinator chain this queue aliased at creation
    default_handlers: Arc<HandlerList>,
    on_start: RwLock<Arc<HandlerList>>,
    on_success: RwLock<Arc<HandlerList>>,
    on_failure: RwLock<Arc<HandlerList>>,
    on_complete: RwLock<Arc<HandlerList>>,
    pub(crate) consumers: RwLock<Vec<Arc<Consumer>>>,
    pub(crate) tracker: TaskTracker,
    started: Arc<AtomicBool>,
}

impl QueueShared {
    pub(crate) fn handlers_snapshot(&self) -> Arc<HandlerList> {
        self.handlers.read().unwrap().clone()
    }

    /// Callbacks to fire for a status: started tasks, succeeded tasks, and
    /// failed or cancelled tasks each have their list; other statuses have
    /// none.
    pub(crate) fn callbacks_for(&self, status: TaskStatus) -> Arc<HandlerList> {
        match status {
            TaskStatus::Processing => self.on_start.read().unwrap().clone(),
            TaskStatus::Succeeded => self.on_success.read().unwrap().clone(),
            TaskStatus::Failed | TaskStatus::Cancelled => self.on_failure.read().unwrap().clone(),
            _ => Arc::new(Vec::new()),
        }
    }

    pub(crate) fn on_complete_snapshot(&self) -> Arc<HandlerList> {
        self.on_complete.read().unwrap().clone()
    }

    /// One consume round against the broker. Records that fail to decode
    /// are skipped and logged; losing one poisoned record must not stall
    /// the queue.
    pub(crate) async fn consume(&self) -> BokchoyResult<Vec<Task>> {
        let raw = self.broker.consume(&self.name, 0).await?;
        let mut tasks = Vec::with_capacity(raw.len());
        for bytes in raw {
            match Task::deserialize(&bytes, self.serializer.as_ref()) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    warn!(queue = %self.name, error = %err, "skipping undecodable task record")
                }
            }
        }
        Ok(tasks)
    }

    /// Write the record back. Finished tasks get the configured TTL;
    /// anything still in flight is retained indefinitely.
    pub(crate) async fn save(&self, task: &mut Task) -> BokchoyResult<()> {
        let bytes = task.serialize(self.serializer.as_ref())?;
        let ttl = if task.is_finished() {
            task.ttl
        } else {
            Duration::ZERO
        };
        self.broker.set(&self.name, task.id(), &bytes, ttl).await
    }

    /// Serialize and hand the task to the broker; the ETA decides the
    /// target structure.
    pub(crate) async fn publish_task(&self, task: &mut Task) -> BokchoyResult<()> {
        let bytes = task.serialize(self.serializer.as_ref())?;
        self.broker
            .publish(&self.name, task.id(), &bytes, task.eta)
            .await?;
        debug!(queue = %self.name, task_id = %task.id(), eta = task.eta, "task published");
        Ok(())
    }

    /// Spawn the consumer slots. Called by the coordinator under its
    /// lifecycle lock.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.handlers.read().unwrap().is_empty() {
            warn!(
                queue = %self.name,
                "queue start requested without a registered handler; consumers not started"
            );
            return;
        }

        let slots = self.options.worker_slots();
        {
            let mut consumers = self.consumers.write().unwrap();
            if consumers.is_empty() {
                for idx in 0..slots {
                    consumers.push(Arc::new(Consumer::new(idx, Arc::clone(self))));
                }
            }
        }

        let consumers = self.consumers.read().unwrap();
        for consumer in consumers.iter() {
            consumer.request_start();
        }
        debug!(queue = %self.name, consumers = consumers.len(), "queue consumers started");
    }

    /// Signal every consumer slot to stop after its current iteration.
    pub(crate) fn stop(&self) {
        let consumers = self.consumers.read().unwrap();
        for consumer in consumers.iter() {
            consumer.request_stop();
        }
        if !consumers.is_empty() {
            debug!(queue = %self.name, consumers = consumers.len(), "queue consumers stopping");
        }
    }
}

/// Named queue handle. Clones share the same underlying queue.
#[derive(Clone)]
pub struct Queue {
    pub(crate) shared: Arc<QueueShared>,
}

impl Queue {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: impl Into<String>,
        options: Config,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn Serializer>,
        default_handlers: Arc<HandlerList>,
        tracker: TaskTracker,
        started: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name: name.into(),
                options,
                broker,
                serializer,
                err_counter: AtomicI32::new(0),
                handlers: RwLock::new(Arc::clone(&default_handlers)),
                default_handlers,
                on_start: RwLock::new(Arc::new(Vec::new())),
                on_success: RwLock::new(Arc::new(Vec::new())),
                on_failure: RwLock::new(Arc::new(Vec::new())),
                on_complete: RwLock::new(Arc::new(Vec::new())),
                consumers: RwLock::new(Vec::new()),
                tracker,
                started,
            }),
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn registration_allowed(&self, what: &str) -> bool {
        if self.shared.started.load(Ordering::SeqCst) {
            warn!(
                queue = %self.shared.name,
                registration = what,
                "consumers already running; registration ignored"
            );
            return false;
        }
        true
    }

    /// Append a handler to this queue's main chain.
    ///
    /// The chain is inherited from the coordinator by aliasing; the first
    /// per-queue registration copies it, so additions here never leak into
    /// sibling queues.
    pub fn use_handler(&self, handler: Arc<dyn Handler>) -> &Self {
        if !self.registration_allowed("handler") {
            return self;
        }

        let mut guard = self.shared.handlers.write().unwrap();
        if Arc::ptr_eq(&*guard, &self.shared.default_handlers) {
            let mut owned = guard.as_ref().clone();
            owned.push(handler);
            *guard = Arc::new(owned);
        } else {
            Arc::make_mut(&mut *guard).push(handler);
        }
        self
    }

    fn register_callback(
        &self,
        list: &RwLock<Arc<HandlerList>>,
        callback: Arc<dyn Handler>,
        what: &str,
    ) -> &Self {
        if !self.registration_allowed(what) {
            return self;
        }
        let mut guard = list.write().unwrap();
        Arc::make_mut(&mut *guard).push(callback);
        self
    }

    /// Register a callback fired when a task starts processing.
    pub fn on_start(&self, callback: Arc<dyn Handler>) -> &Self {
        self.register_callback(&self.shared.on_start, callback, "on_start")
    }

    /// Register a callback fired when a task succeeds.
    pub fn on_success(&self, callback: Arc<dyn Handler>) -> &Self {
        self.register_callback(&self.shared.on_success, callback, "on_success")
    }

    /// Register a callback fired when a task fails or is cancelled.
    pub fn on_failure(&self, callback: Arc<dyn Handler>) -> &Self {
        self.register_callback(&self.shared.on_failure, callback, "on_failure")
    }

    /// Register a callback fired once a task reaches a terminal status.
    pub fn on_complete(&self, callback: Arc<dyn Handler>) -> &Self {
        self.register_callback(&self.shared.on_complete, callback, "on_complete")
    }

    /// Build a task carrying this queue's defaults overlaid with `options`.
    pub fn new_task<P: Serialize>(
        &self,
        payload: P,
        options: &TaskOptions,
    ) -> BokchoyResult<Task> {
        let payload = serde_json::to_value(payload)?;
        let defaults = &self.shared.options;

        let mut task = Task::new(&self.shared.name, payload);
        task.max_retries = options.max_retries.unwrap_or(defaults.max_retries);
        task.retry_intervals = options
            .retry_intervals
            .clone()
            .unwrap_or_else(|| defaults.retry_intervals.clone());
        task.ttl = options.ttl.unwrap_or(defaults.ttl);
        task.timeout = options.timeout.unwrap_or(defaults.timeout);
        if let Some(countdown) = options.countdown.or(defaults.countdown) {
            task.eta = now_nanos() + countdown.as_nanos() as i64;
        }
        Ok(task)
    }

    /// Create and publish a task in one step.
    pub async fn publish<P: Serialize>(
        &self,
        payload: P,
        options: &TaskOptions,
    ) -> BokchoyResult<Task> {
        let mut task = self.new_task(payload, options)?;
        self.shared.publish_task(&mut task).await?;
        Ok(task)
    }

    /// Publish an already-built task.
    pub async fn publish_task(&self, task: &mut Task) -> BokchoyResult<()> {
        self.shared.publish_task(task).await
    }

    /// Load a task record, `None` when absent or expired.
    pub async fn get(&self, task_id: &str) -> BokchoyResult<Option<Task>> {
        let Some(bytes) = self.shared.broker.get(&self.shared.name, task_id).await? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(Task::deserialize(
            &bytes,
            self.shared.serializer.as_ref(),
        )?))
    }

    /// Tasks currently waiting in the ready list.
    pub async fn list(&self) -> BokchoyResult<Vec<Task>> {
        let raw = self.shared.broker.list(&self.shared.name).await?;
        raw.iter()
            .map(|bytes| Task::deserialize(bytes, self.shared.serializer.as_ref()))
            .collect()
    }

    /// Ready/delayed/total counts.
    pub async fn count(&self) -> BokchoyResult<BrokerStats> {
        self.shared.broker.count(&self.shared.name).await
    }

    /// Cancel a task by id. The record is rewritten as Cancelled; if the
    /// id is still queued, the consumer recognizes the status and skips
    /// the handler chain.
    pub async fn cancel(&self, task_id: &str) -> BokchoyResult<Task> {
        let mut task = self
            .get(task_id)
            .await?
            .ok_or_else(|| BokchoyError::TaskNotFound {
                queue: self.shared.name.clone(),
                task_id: task_id.to_string(),
            })?;

        task.mark_as_cancelled();
        self.shared.save(&mut task).await?;

        debug!(queue = %self.shared.name, task_id = %task_id, "task cancelled");
        Ok(task)
    }

    /// Drop the queue's ready list; delayed tasks stay scheduled.
    pub async fn empty(&self) -> BokchoyResult<()> {
        self.shared.broker.empty(&self.shared.name).await?;
        debug!(queue = %self.shared.name, "queue emptied");
        Ok(())
    }
}
