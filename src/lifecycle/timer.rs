//! Proactive refresh timer

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a running refresh timer
///
/// Dropping the handle stops the timer.
#[derive(Debug)]
pub struct RefreshTimer {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RefreshTimer {
    /// Run `tick` every `period`, first immediately
    pub(crate) fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (shutdown, mut stop) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("Refresh timer stopped");
        });

        Self {
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Stop the timer and wait for an in-progress tick to finish
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
