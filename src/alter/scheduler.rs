use crate::alter::Alter;
use crate::alter::job::now_ms;
use crate::alter::runner::StepOutcome;
use crate::config::FeConfig;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub stepped: usize,
    pub advanced: usize,
    pub retrying: usize,
    pub busy: usize,
    pub purged: usize,
}

impl TickReport {
    fn record(&mut self, outcome: StepOutcome) {
        self.stepped += 1;
        match outcome {
            StepOutcome::Idle => {}
            StepOutcome::Busy => self.busy += 1,
            StepOutcome::Advanced(_) => self.advanced += 1,
            StepOutcome::Retrying { .. } => self.retrying += 1,
        }
    }
}

/// Drives every live alter job one step per tick.
pub struct AlterScheduler {
    alter: Arc<Alter>,
    config: FeConfig,
}

impl AlterScheduler {
    pub fn new(alter: Arc<Alter>, config: FeConfig) -> Self {
        Self { alter, config }
    }

    /// One pass on the calling thread: steps each live job in id order, then
    /// purges expired history.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for slot in self.alter.active_slots() {
            report.record(self.alter.run_step(&slot));
        }
        report.purged = self.purge();
        report
    }

    /// One pass with steps of different jobs running concurrently on the
    /// blocking pool, at most `max_concurrent_job_steps` at a time. Returns
    /// once every step of the pass has completed.
    pub async fn tick_concurrent(&self) -> TickReport {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_job_steps));
        let mut steps = JoinSet::new();
        for slot in self.alter.active_slots() {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let alter = Arc::clone(&self.alter);
            steps.spawn_blocking(move || {
                let _permit = permit;
                alter.run_step(&slot)
            });
        }
        let mut report = TickReport::default();
        while let Some(joined) = steps.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => warn!(error = %e, "alter job step panicked"),
            }
        }
        report.purged = self.purge();
        report
    }

    fn purge(&self) -> usize {
        match self.alter.purge_expired(now_ms()) {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "failed to purge expired alter jobs");
                0
            }
        }
    }

    /// Starts the periodic loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.scheduler_interval();
        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "alter scheduler started");
            loop {
                let report = self.tick_concurrent().await;
                if report.advanced > 0 || report.retrying > 0 || report.purged > 0 {
                    debug!(
                        stepped = report.stepped,
                        advanced = report.advanced,
                        retrying = report.retrying,
                        purged = report.purged,
                        "alter scheduler tick"
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("alter scheduler stopped");
        });
        SchedulerHandle {
            shutdown_tx,
            task: Some(task),
        }
    }
}

/// Owner of a running scheduler loop. Dropping it aborts the loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops the loop after the pass in progress and waits for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
