//! Optional process-wide default instance.
//!
//! Explicit [`Bokchoy`](crate::Bokchoy) instances are the preferred API;
//! this shim exists for binaries that want one shared client without
//! threading it everywhere.

use std::sync::OnceLock;

use serde::Serialize;

use crate::config::TaskOptions;
use crate::error::{BokchoyError, BokchoyResult};
use crate::queue::Queue;
use crate::task::Task;
use crate::Bokchoy;

static DEFAULT_CLIENT: OnceLock<Bokchoy> = OnceLock::new();

/// Install the process-wide instance. Fails if one is already installed.
pub fn init(bokchoy: Bokchoy) -> BokchoyResult<()> {
    DEFAULT_CLIENT
        .set(bokchoy)
        .map_err(|_| BokchoyError::config("default instance already initialized"))
}

fn client() -> BokchoyResult<&'static Bokchoy> {
    DEFAULT_CLIENT
        .get()
        .ok_or_else(|| BokchoyError::config("default instance not initialized; call init() first"))
}

/// Get or create a queue on the default instance.
pub fn queue(name: &str) -> BokchoyResult<Queue> {
    Ok(client()?.queue(name))
}

/// Publish a payload through the default instance.
pub async fn publish<P: Serialize>(
    queue_name: &str,
    payload: P,
    options: &TaskOptions,
) -> BokchoyResult<Task> {
    client()?.publish(queue_name, payload, options).await
}

/// Run the default instance, blocking until every consumer drains.
pub async fn run() -> BokchoyResult<()> {
    client()?.run().await
}

/// Stop the default instance's consumers.
pub async fn stop() -> BokchoyResult<()> {
    client()?.stop().await;
    Ok(())
}
