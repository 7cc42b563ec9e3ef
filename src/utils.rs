use std::future::Future;

use anyhow::Result as AnyResult;
use futures::FutureExt;
use tokio::{spawn, task::JoinHandle};
use tracing::error;

/// Spawn a task and abort process if it results in error.
/// Tasks must result in [`AnyResult<()>`]
pub fn spawn_or_abort<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
{
    spawn(future.map(|result| {
        if let Err(error) = result {
            // Log error
            error!(?error, "Error in task");
            // Abort process
            std::process::abort();
        }
    }))
}
