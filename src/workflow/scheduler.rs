//! Scheduler
//!
//! Owns the two periodic sweep loops (monitoring and retrieval) with an
//! explicit start/stop lifecycle. Tests drive the same sweeps through
//! [`Scheduler::run_monitor_sweep`] and [`Scheduler::run_retrieval_sweep`]
//! without starting any timer.

use crate::config::SchedulerConfig;
use crate::error::OrchestratorError;
use crate::workflow::retrieval::{RetrievalQueue, RetrievalSweepReport};
use crate::workflow::step::{MonitorSweepReport, StepMachine};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

struct RunningLoops {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    steps: Arc<StepMachine>,
    retrieval: Arc<RetrievalQueue>,
    config: SchedulerConfig,
    running: Mutex<Option<RunningLoops>>,
}

impl Scheduler {
    pub fn new(
        steps: Arc<StepMachine>,
        retrieval: Arc<RetrievalQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            steps,
            retrieval,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn both sweep loops on the current tokio runtime.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(OrchestratorError::Conflict(
                "scheduler is already running".to_string(),
            ));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let steps = self.steps.clone();
        let monitor = spawn_loop(
            "monitor",
            Duration::from_millis(self.config.monitor_interval_ms),
            shutdown_rx.clone(),
            move || {
                let steps = steps.clone();
                async move { steps.sweep().await.map(|_| ()) }
            },
        );
        let retrieval = self.retrieval.clone();
        let fetch = spawn_loop(
            "retrieval",
            Duration::from_millis(self.config.retrieval_interval_ms),
            shutdown_rx,
            move || {
                let retrieval = retrieval.clone();
                async move { retrieval.sweep().await.map(|_| ()) }
            },
        );

        *running = Some(RunningLoops {
            shutdown,
            handles: vec![monitor, fetch],
        });
        info!(
            monitor_interval_ms = self.config.monitor_interval_ms,
            retrieval_interval_ms = self.config.retrieval_interval_ms,
            "Scheduler started"
        );
        Ok(())
    }

    /// Signal both loops and wait for them to finish their current sweep.
    pub async fn stop(&self) {
        let Some(loops) = self.running.lock().take() else {
            return;
        };
        let _ = loops.shutdown.send(true);
        for handle in loops.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Sweep loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    pub async fn run_monitor_sweep(&self) -> Result<MonitorSweepReport, OrchestratorError> {
        self.steps.sweep().await
    }

    pub async fn run_retrieval_sweep(&self) -> Result<RetrievalSweepReport, OrchestratorError> {
        self.retrieval.sweep().await
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sweep().await {
                        error!(sweep = name, error = %e, "Sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
