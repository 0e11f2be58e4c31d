use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// A cancellable loop that runs `tick` once per period
///
/// Cancellation is checked before every tick and while waiting for the next
/// one. A tick already in progress is allowed to finish until the grace
/// period given to [`stop`](Self::stop) runs out.
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if !matches!(stop_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)) {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                tick().await;
            }
            debug!(task = name, "periodic task stopped");
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// Signal the loop and wait up to `grace` for it to finish. Returns false
    /// if the task had to be aborted.
    pub async fn stop(self, grace: Duration) -> bool {
        let _ = self.stop_tx.try_send(());
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(task = self.name, "periodic task did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }
}
