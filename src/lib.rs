//! # bokchoy
//!
//! A distributed background-task queue over Redis.
//!
//! Producers publish opaque payloads to named queues; consumer workers
//! drain those queues, invoke the registered handlers and manage the task
//! lifecycle: timeouts, retries with backoff, delayed execution,
//! cancellation and success/failure callbacks. State lives in the broker,
//! so any number of producer and consumer processes cooperate over the
//! same logical queues with at-least-once delivery.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bokchoy::prelude::*;
//! use bokchoy::handler_fn;
//! use futures::FutureExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> BokchoyResult<()> {
//!     let broker = Arc::new(RedisBroker::new("redis://127.0.0.1:6379").await?);
//!     let bokchoy = Bokchoy::new(broker, Arc::new(JsonSerializer), Config::default()).await?;
//!
//!     let queue = bokchoy.queue("emails");
//!     queue.use_handler(handler_fn(|task| {
//!         let payload = task.payload().clone();
//!         async move {
//!             println!("sending email: {payload}");
//!             Ok(())
//!         }
//!         .boxed()
//!     }));
//!
//!     bokchoy
//!         .publish("emails", serde_json::json!({"to": "user@example.com"}), &TaskOptions::default())
//!         .await?;
//!
//!     // Blocks until stop() is called from elsewhere.
//!     bokchoy.run().await
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

mod banner;
pub mod broker;
pub mod config;
mod consumer;
pub mod error;
pub mod global;
pub mod queue;
pub mod serializer;
pub mod task;

pub use broker::{Broker, BrokerStats, MemoryBroker, RedisBroker};
pub use config::{Config, TaskOptions};
pub use error::{BokchoyError, BokchoyResult};
pub use queue::{handler_fn, Handler, HandlerFunc, Queue};
pub use serializer::{JsonSerializer, Serializer};
pub use task::{Task, TaskStatus};

use queue::{HandlerList, QueueShared};

pub mod prelude {
    //! Everything needed to set up and run a bokchoy system.
    pub use crate::broker::{Broker, BrokerStats, MemoryBroker, RedisBroker};
    pub use crate::config::{Config, TaskOptions};
    pub use crate::error::{BokchoyError, BokchoyResult};
    pub use crate::queue::{handler_fn, Handler, HandlerFunc, Queue};
    pub use crate::serializer::{JsonSerializer, Serializer};
    pub use crate::task::{Task, TaskStatus};
    pub use crate::Bokchoy;
    pub use async_trait::async_trait;
}

struct BokchoyInner {
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn Serializer>,
    options: Config,
    /// Handler chain queues alias at creation, until their first own
    /// registration copies it
    default_handlers: RwLock<Arc<HandlerList>>,
    queues: RwLock<HashMap<String, Queue>>,
    /// Serializes run/stop/empty/clear_all; never held across broker
    /// calls once the system is running
    lifecycle: tokio::sync::Mutex<()>,
    started: Arc<AtomicBool>,
    tracker: TaskTracker,
}

/// The coordinator: queue registry, configuration and lifecycle.
///
/// Cheap to clone; clones share the same system.
#[derive(Clone)]
pub struct Bokchoy {
    inner: Arc<BokchoyInner>,
}

impl Bokchoy {
    /// Build a system from its two required collaborators and the
    /// configuration.
    ///
    /// Unless `initialize` is disabled, the broker is initialized here
    /// (for Redis that preloads the server-side scripts). Queues named in
    /// `config.queues` are declared immediately; others appear lazily on
    /// first reference.
    pub async fn new(
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn Serializer>,
        config: Config,
    ) -> BokchoyResult<Self> {
        if config.initialize {
            debug!(broker = %broker, "initializing broker");
            broker.initialize().await?;
        } else {
            warn!("broker initialization disabled; server-side scripts must be preloaded elsewhere");
        }

        let queue_names = config.queues.clone();
        let disable_output = config.disable_output;

        let bokchoy = Self {
            inner: Arc::new(BokchoyInner {
                broker,
                serializer,
                options: config,
                default_handlers: RwLock::new(Arc::new(Vec::new())),
                queues: RwLock::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                started: Arc::new(AtomicBool::new(false)),
                tracker: TaskTracker::new(),
            }),
        };

        for name in &queue_names {
            if !name.is_empty() {
                let _ = bokchoy.queue(name);
            }
        }

        if !disable_output {
            banner::display(
                bokchoy.inner.broker.as_ref(),
                bokchoy.inner.serializer.as_ref(),
                &bokchoy.inner.options,
                &queue_names,
            );
        }

        Ok(bokchoy)
    }

    /// Get or lazily create a queue.
    pub fn queue(&self, name: &str) -> Queue {
        let mut queues = self.inner.queues.write().unwrap();
        if let Some(queue) = queues.get(name) {
            return queue.clone();
        }

        let queue = Queue::new(
            name,
            self.inner.options.clone(),
            Arc::clone(&self.inner.broker),
            Arc::clone(&self.inner.serializer),
            self.inner.default_handlers.read().unwrap().clone(),
            self.inner.tracker.clone(),
            Arc::clone(&self.inner.started),
        );
        queues.insert(name.to_string(), queue.clone());
        queue
    }

    /// Append a handler to the default chain every subsequently created
    /// queue inherits.
    pub fn use_handler(&self, handler: Arc<dyn Handler>) -> &Self {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!("consumers already running; registration ignored");
            return self;
        }
        let mut guard = self.inner.default_handlers.write().unwrap();
        Arc::make_mut(&mut *guard).push(handler);
        self
    }

    /// Register a handler on a queue; shorthand for
    /// `self.queue(name).use_handler(handler)`.
    pub fn handle(&self, queue_name: &str, handler: Arc<dyn Handler>) -> Queue {
        let queue = self.queue(queue_name);
        queue.use_handler(handler);
        queue
    }

    /// Publish a payload to a queue.
    pub async fn publish<P: Serialize>(
        &self,
        queue_name: &str,
        payload: P,
        options: &TaskOptions,
    ) -> BokchoyResult<Task> {
        self.queue(queue_name).publish(payload, options).await
    }

    /// Check broker connectivity.
    pub async fn ping(&self) -> BokchoyResult<()> {
        self.inner.broker.ping().await
    }

    /// Start every queue's consumers and block until they drain.
    ///
    /// Fails only when the system is already running or the broker cannot
    /// be pinged. Returns after [`stop`](Self::stop) has been called and
    /// every worker has exited.
    pub async fn run(&self) -> BokchoyResult<()> {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if self.inner.started.load(Ordering::SeqCst) {
                return Err(BokchoyError::AlreadyRunning);
            }

            self.inner.broker.ping().await?;

            let queues: Vec<Queue> = self.inner.queues.read().unwrap().values().cloned().collect();
            debug!(queues = queues.len(), "starting queues and their consumers");
            for queue in &queues {
                QueueShared::start(&queue.shared);
            }
            self.inner.started.store(true, Ordering::SeqCst);
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        Ok(())
    }

    /// Signal every consumer to stop and wait for them to drain. Does
    /// nothing when the system is not running; never fails.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }

        let queues: Vec<Queue> = self.inner.queues.read().unwrap().values().cloned().collect();
        for queue in &queues {
            queue.shared.stop();
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("queues and their consumers stopped");
    }

    /// Empty the ready list of every declared queue. Rejected while the
    /// system is running; returns the first failure.
    pub async fn empty(&self) -> BokchoyResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(BokchoyError::AlreadyRunning);
        }

        let queues: Vec<Queue> = self.inner.queues.read().unwrap().values().cloned().collect();
        for queue in &queues {
            queue.empty().await?;
        }
        Ok(())
    }

    /// Remove every key under the broker namespace. Rejected while the
    /// system is running.
    pub async fn clear_all(&self) -> BokchoyResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(BokchoyError::AlreadyRunning);
        }
        self.inner.broker.clear_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fmt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _task: &mut Task) -> BokchoyResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Broker whose ping always fails; everything else delegates.
    struct UnreachableBroker {
        inner: MemoryBroker,
    }

    impl fmt::Display for UnreachableBroker {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("Unreachable broker")
        }
    }

    #[async_trait]
    impl Broker for UnreachableBroker {
        async fn initialize(&self) -> BokchoyResult<()> {
            Ok(())
        }

        async fn ping(&self) -> BokchoyResult<()> {
            Err(BokchoyError::BrokerUnavailable {
                message: "induced outage".to_string(),
                source: None,
            })
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

    async fn test_system(config: Config) -> Bokchoy {
        Bokchoy::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(JsonSerializer),
            config.with_disable_output(true),
        )
        .await
        .unwrap()
    }

    async fn wait_for_status(bokchoy: &Bokchoy, queue: &str, task_id: &str, want: TaskStatus) {
        let queue = bokchoy.queue(queue);
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(task) = queue.get(task_id).await.unwrap() {
                if task.status() == want {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "task never reached {want}");
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_queue_is_created_once() {
        let bokchoy = test_system(Config::default()).await;

        let a = bokchoy.queue("q1");
        let b = bokchoy.queue("q1");

        assert!(Arc::ptr_eq(&a.shared, &b.shared));
        assert_eq!(a.name(), "q1");
    }

    #[tokio::test]
    async fn test_declared_queues_exist_at_startup() {
        let bokchoy = test_system(Config::default().with_queues(["a", "b"])).await;
        assert_eq!(bokchoy.inner.queues.read().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_processes_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bokchoy = test_system(Config::default()).await;
        bokchoy.handle(
            "q1",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        let task = bokchoy
            .publish("q1", json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();

        let runner = {
            let bokchoy = bokchoy.clone();
            tokio::spawn(async move { bokchoy.run().await })
        };

        wait_for_status(&bokchoy, "q1", task.id(), TaskStatus::Succeeded).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        bokchoy.stop().await;
        let result = timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not return after stop")
            .unwrap();
        assert!(result.is_ok());

        // The lifecycle stays spent: a second run is rejected.
        assert!(matches!(
            bokchoy.run().await,
            Err(BokchoyError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_run_fails_when_broker_unreachable() {
        let bokchoy = Bokchoy::new(
            Arc::new(UnreachableBroker {
                inner: MemoryBroker::new(),
            }),
            Arc::new(JsonSerializer),
            Config::default().with_disable_output(true),
        )
        .await
        .unwrap();

        assert!(matches!(
            bokchoy.run().await,
            Err(BokchoyError::BrokerUnavailable { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_maintenance_rejected_while_running() {
        let bokchoy = test_system(Config::default()).await;
        bokchoy.handle(
            "q1",
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let runner = {
            let bokchoy = bokchoy.clone();
            tokio::spawn(async move { bokchoy.run().await })
        };
        sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            bokchoy.empty().await,
            Err(BokchoyError::AlreadyRunning)
        ));
        assert!(matches!(
            bokchoy.clear_all().await,
            Err(BokchoyError::AlreadyRunning)
        ));

        bokchoy.stop().await;
        let _ = timeout(Duration::from_secs(5), runner).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_clears_every_declared_queue() {
        let bokchoy = test_system(Config::default().with_queues(["a", "b"])).await;
        bokchoy
            .publish("a", json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();
        bokchoy
            .publish("b", json!({"x": 2}), &TaskOptions::default())
            .await
            .unwrap();

        bokchoy.empty().await.unwrap();

        assert_eq!(bokchoy.queue("a").count().await.unwrap().direct, 0);
        assert_eq!(bokchoy.queue("b").count().await.unwrap().direct, 0);
    }

    #[tokio::test]
    async fn test_default_handlers_inherited_by_new_queues() {
        let bokchoy = test_system(Config::default()).await;
        bokchoy.use_handler(Arc::new(CountingHandler {
            calls: Arc::new(AtomicUsize::new(0)),
        }));

        let queue = bokchoy.queue("q1");
        assert_eq!(queue.shared.handlers_snapshot().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registration_frozen_after_run() {
        let bokchoy = test_system(Config::default()).await;
        let queue = bokchoy.handle(
            "q1",
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let runner = {
            let bokchoy = bokchoy.clone();
            tokio::spawn(async move { bokchoy.run().await })
        };
        sleep(Duration::from_millis(100)).await;

        queue.use_handler(Arc::new(CountingHandler {
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        assert_eq!(queue.shared.handlers_snapshot().len(), 1);

        bokchoy.stop().await;
        let _ = timeout(Duration::from_secs(5), runner).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_shim() {
        let bokchoy = test_system(Config::default()).await;
        global::init(bokchoy).unwrap();

        let task = global::publish("gq", json!({"x": 1}), &TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(task.queue_name(), "gq");
        assert_eq!(global::queue("gq").unwrap().count().await.unwrap().direct, 1);

        // A second install is rejected.
        let another = test_system(Config::default()).await;
        assert!(global::init(another).is_err());
    }
}
