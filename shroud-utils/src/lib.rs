pub mod constants;
pub mod encoding;
pub mod encryption;
pub mod hashing;

use anyhow::{Context, Result};
use tokio::sync::watch;

pub use encryption::{Cipher, CiphertextBlock, Nonce, PlaintextElement};

/// Spawns a task that will automatically trigger shutdown if it encounters an error
///
/// This helper wraps a future in a tokio task that monitors its execution.
/// If the wrapped future returns an error, a shutdown signal is sent through
/// the provided sender so that sibling services (for instance the result
/// event dispatcher) stop as well.
///
/// # Arguments
///
/// * `f` - The future to execute, which must return a `Result<()>`
/// * `shutdown_sender` - A channel sender used to signal shutdown to other parts of the application
///
/// # Returns
///
/// Returns a `JoinHandle` for the spawned task
///
/// # Example
///
/// `shroud_events::ResultEventSubscriber::spawn` runs the result dispatcher
/// through this helper:
///
/// ```rust,ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let subscriber = ResultEventSubscriber::new(listeners, event_receiver, shutdown_rx);
/// let handle = spawn_with_shutdown(subscriber.run(), shutdown_tx);
/// ```
pub fn spawn_with_shutdown<F>(
    f: F,
    shutdown_sender: watch::Sender<bool>,
) -> tokio::task::JoinHandle<Result<()>>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::task::spawn(async move {
        let res = f.await;
        if let Err(e) = &res {
            tracing::error!(
                target = "shroud-utils",
                event = "task_failed",
                error = %e,
                "Spawned task failed, signalling shutdown"
            );
            // Only send shutdown signal if the task failed
            shutdown_sender
                .send(true)
                .context("Failed to send shutdown signal")?;
        }
        res
    })
}
