use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::ingest::coordinator::Coordinator;

enum SchedulerCommand {
    RunNow,
    Shutdown,
}

/// Timer-driven ingestion loop.
///
/// Ticks are strictly sequential: the next interval tick is not polled while
/// a job runs, and ticks missed during a long job are collapsed rather than
/// replayed.
pub struct Scheduler {
    coordinator: Coordinator,
    tick_interval: Duration,
}

/// Handle for the spawned scheduler task.
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    pub fn new(coordinator: Coordinator, tick_interval: Duration) -> Self {
        Self {
            coordinator,
            tick_interval,
        }
    }

    /// Spawn the scheduler onto the runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (sender, mut receiver) = mpsc::channel(8);
        let cancel = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));

        let task_cancel = Arc::clone(&cancel);
        let task_running = Arc::clone(&running);
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.tick_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = self.tick_interval.as_secs(),
                "Ingestion scheduler started"
            );

            // The first interval tick fires immediately, which doubles as the
            // startup ingestion pass.
            loop {
                if task_cancel.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = timer.tick() => {
                        self.tick(&task_cancel, &task_running).await;
                    }
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(SchedulerCommand::RunNow) => {
                                self.tick(&task_cancel, &task_running).await;
                            }
                            Some(SchedulerCommand::Shutdown) | None => break,
                        }
                    }
                }
            }
            tracing::info!("Ingestion scheduler stopped");
        });

        SchedulerHandle {
            sender,
            cancel,
            running,
            task,
        }
    }

    async fn tick(&self, cancel: &AtomicBool, running: &AtomicBool) {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        running.store(true, Ordering::SeqCst);
        if let Err(e) = self.coordinator.run_once(cancel).await {
            tracing::error!(error = %e, "Ingestion tick failed");
        }
        running.store(false, Ordering::SeqCst);
    }
}

impl SchedulerHandle {
    /// Trigger a tick without waiting for the interval. Queued behind any
    /// job already in flight.
    pub async fn run_now(&self) {
        let _ = self.sender.send(SchedulerCommand::RunNow).await;
    }

    /// Whether a job is executing right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the scheduler and wait for it to wind down.
    ///
    /// An in-flight job finishes the feeds it already started but begins no
    /// new ones, and is finalized as cancelled.
    pub async fn shutdown(self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
        let _ = self.task.await;
    }
}
