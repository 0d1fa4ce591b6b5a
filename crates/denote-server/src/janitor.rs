//! Periodic background sweeps with an acknowledged shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Something that can drop its stale entries on demand.
pub trait Sweeper: Send + Sync + 'static {
    /// Remove whatever has expired as of now. Returns the number removed.
    fn sweep_expired(&self) -> Result<usize>;
}

impl<T: Sweeper + ?Sized> Sweeper for Arc<T> {
    fn sweep_expired(&self) -> Result<usize> {
        (**self).sweep_expired()
    }
}

/// Handle to a running sweep loop.
pub struct Janitor {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Janitor {
    /// Spawn a task that calls `sweeper.sweep_expired()` every `interval`.
    /// The first sweep runs one interval after spawning. Each sweep runs on
    /// the blocking pool and is awaited before the next tick.
    pub fn spawn<S: Sweeper>(name: &'static str, interval: Duration, sweeper: S) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let sweeper = Arc::new(sweeper);

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let s = Arc::clone(&sweeper);
                        match tokio::task::spawn_blocking(move || s.sweep_expired()).await {
                            Ok(Ok(n)) => debug!(janitor = name, removed = n, "sweep done"),
                            Ok(Err(e)) => warn!(janitor = name, error = %e, "sweep error"),
                            Err(e) => warn!(janitor = name, error = %e, "sweep task failed"),
                        }
                    }
                }
            }
            debug!(janitor = name, "sweep loop exited");
        });

        info!(janitor = name, interval = ?interval, "janitor started");
        Self {
            name,
            stop: Some(stop_tx),
            task,
        }
    }

    /// Signal the loop and wait until it has fully exited. A sweep that is
    /// already running completes first; none starts afterwards.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(janitor = self.name, error = %e, "janitor task ended abnormally");
        }
        info!(janitor = self.name, "janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Sweeper for Counting {
        fn sweep_expired(&self) -> Result<usize> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_and_stops() {
        let counter = Arc::new(Counting::default());
        let janitor = Janitor::spawn("test", Duration::from_secs(10), Arc::clone(&counter));

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(31)).await;
        let before = counter.0.load(Ordering::SeqCst);
        assert!(before >= 3, "expected at least three sweeps, got {before}");

        janitor.shutdown().await;
        let after = counter.0.load(Ordering::SeqCst);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn shutdown_before_first_tick() {
        let counter = Arc::new(Counting::default());
        let janitor = Janitor::spawn("idle", Duration::from_secs(3600), Arc::clone(&counter));
        janitor.shutdown().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
