use crate::core::monitor::{Monitor, TickOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Running schedule. Stops on [`MonitorHandle::stop`] or when dropped.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancels future ticks and waits for the loop to exit. A tick already
    /// in flight runs to completion first.
    pub async fn stop(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "monitoring task ended abnormally");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Runs [`Monitor::run_tick`] every `period`, first one `period` from now.
///
/// Ticks are awaited in the loop, so a slow tick delays the next one instead
/// of overlapping it; ticks missed meanwhile are dropped.
pub fn schedule_monitoring(monitor: Arc<Monitor>, period: Duration) -> MonitorHandle {
    let period = period.max(MIN_PERIOD);
    let cancel_token = CancellationToken::new();
    let task_cancel = cancel_token.clone();

    let task = tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs_f64(), "device monitoring scheduled");

        loop {
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => break,
                _ = interval.tick() => {
                    match monitor.run_tick().await {
                        TickOutcome::Completed(updates) => {
                            debug!(count = updates.len(), "scheduled tick completed");
                        }
                        TickOutcome::Skipped => debug!("scheduled tick skipped"),
                        TickOutcome::Failed(_) => debug!("scheduled tick failed, waiting for next"),
                    }
                }
            }
        }
        info!("device monitoring stopped");
    });

    MonitorHandle {
        cancel_token,
        task: Some(task),
    }
}
