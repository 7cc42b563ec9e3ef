use tokio::sync::watch;
use tracing::info;

/// Cloneable shutdown handle backed by a watch channel.
#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Send the signal to shutdown the program.
    pub fn shutdown(&self) {
        // Does not fail because we hold a receiver.
        self.sender.send(true).ok();
    }

    /// Are we currently shutting down?
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the program to shutdown.
    ///
    /// Resolves immediately if the program is already shutting down.
    /// The resulting future is safe to cancel by dropping.
    pub async fn await_shutdown(&self) {
        let mut watch = self.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because we hold a sender.
        watch.changed().await.ok();
    }

    /// Trip the handle on SIGINT/SIGTERM.
    pub fn watch_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if let Err(err) = signal_shutdown().await {
                tracing::error!("Error handling shutdown signal: {}", err);
            }
            handle.shutdown();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal() {
        let shutdown = Shutdown::new();
        let start = tokio::time::Instant::now();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.shutdown();
        });

        shutdown.await_shutdown().await;

        let elapsed = start.elapsed();

        assert!(elapsed > Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_resolves_immediately_when_already_down() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        shutdown.await_shutdown().await;
    }
}
