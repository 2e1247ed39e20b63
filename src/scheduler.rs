//! # Control loop scheduler
//!
//! Runs the resource detection loop and the scale event consumption loop as
//! two background tasks. Each task only ticks while it holds its leadership
//! lease; the lease token is handed to the loop body, so losing the lease
//! stops the in-flight tick at its next cluster boundary. The task then goes
//! back to acquiring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ControlLoopConfig;
use crate::elastic::ElasticGroupOrchestrator;
use crate::events::ScaleEventConsumer;
use crate::lock::{CONSUME_LOCK_KEY, DETECT_LOCK_KEY, LeaderElector};

/// Periods of the two loops and of lease acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopIntervals {
    pub detect: Duration,
    pub consume: Duration,
    pub lease_retry: Duration,
}

impl From<&ControlLoopConfig> for LoopIntervals {
    fn from(config: &ControlLoopConfig) -> Self {
        Self {
            detect: config.detect_interval(),
            consume: config.consume_interval(),
            lease_retry: config.lease_retry(),
        }
    }
}

/// Work done on every tick of a leader loop.
#[async_trait]
pub trait LoopBody: Send + Sync {
    fn name(&self) -> &'static str;

    /// `tick` counts from 1 across lease changes; `cancel` fires when the
    /// lease is lost or shutdown starts.
    async fn run_tick(&self, tick: u64, cancel: &CancellationToken);
}

struct DetectLoop(Arc<ElasticGroupOrchestrator>);

#[async_trait]
impl LoopBody for DetectLoop {
    fn name(&self) -> &'static str {
        "detect"
    }

    async fn run_tick(&self, _tick: u64, cancel: &CancellationToken) {
        let report = self.0.detect_resource(cancel).await;
        info!(
            evaluated = report.evaluated.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "Detection tick completed"
        );
    }
}

struct ConsumeLoop(Arc<ScaleEventConsumer>);

#[async_trait]
impl LoopBody for ConsumeLoop {
    fn name(&self) -> &'static str {
        "consume"
    }

    async fn run_tick(&self, tick: u64, cancel: &CancellationToken) {
        let report = self.0.process_tick(tick, cancel).await;
        debug!(
            clusters = report.clusters,
            consumed = report.consumed,
            failed = report.failed,
            cron_runs_imported = report.cron_runs_imported,
            cancelled = report.cancelled,
            "Consumption tick completed"
        );
    }
}

/// A periodic loop guarded by a leadership lease.
pub struct LeaderLoop {
    key: &'static str,
    interval: Duration,
    lease_retry: Duration,
    elector: Arc<dyn LeaderElector>,
    body: Arc<dyn LoopBody>,
}

impl LeaderLoop {
    pub fn new(
        key: &'static str,
        interval: Duration,
        lease_retry: Duration,
        elector: Arc<dyn LeaderElector>,
        body: Arc<dyn LoopBody>,
    ) -> Self {
        Self {
            key,
            interval,
            lease_retry,
            elector,
            body,
        }
    }

    /// Run until `shutdown` fires. The lease is released on the way out.
    #[instrument(skip_all, fields(lease = self.key, body = self.body.name()))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting control loop");
        let mut tick: u64 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let lease = match self.elector.try_acquire(self.key, &shutdown).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!("Lease held elsewhere, waiting");
                    if self.wait_retry(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "Lease acquisition failed");
                    if self.wait_retry(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            counter!("autoscaler_leases_acquired_total", "lease" => self.key).increment(1);

            let token = lease.token().clone();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(self.interval) => {
                        tick += 1;
                        let started = Instant::now();
                        self.body.run_tick(tick, &token).await;
                        histogram!("autoscaler_loop_tick_duration_ms", "loop" => self.body.name())
                            .record(started.elapsed().as_secs_f64() * 1_000.0);
                    }
                }
            }

            if !shutdown.is_cancelled() {
                warn!("Lease lost, stopping ticks until it is reacquired");
                counter!("autoscaler_leases_lost_total", "lease" => self.key).increment(1);
            }
            if let Err(err) = self.elector.release(lease).await {
                error!(error = %err, "Failed to release lease");
            }
        }

        info!("Control loop stopped");
    }

    /// Sleep for the retry period; `true` when shutdown fired meanwhile.
    async fn wait_retry(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = sleep(self.lease_retry) => false,
        }
    }
}

pub struct ControlLoopScheduler {
    elector: Arc<dyn LeaderElector>,
    orchestrator: Arc<ElasticGroupOrchestrator>,
    consumer: Arc<ScaleEventConsumer>,
    intervals: LoopIntervals,
}

/// Handle over the two spawned loops.
pub struct SchedulerHandle {
    detect: JoinHandle<()>,
    consume: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Wait for both loops to finish.
    pub async fn join(self) {
        for (name, handle) in [("detect", self.detect), ("consume", self.consume)] {
            if let Err(err) = handle.await {
                error!(control_loop = name, error = %err, "Control loop task panicked");
            }
        }
    }
}

impl ControlLoopScheduler {
    pub fn new(
        elector: Arc<dyn LeaderElector>,
        orchestrator: Arc<ElasticGroupOrchestrator>,
        consumer: Arc<ScaleEventConsumer>,
        intervals: LoopIntervals,
    ) -> Self {
        Self {
            elector,
            orchestrator,
            consumer,
            intervals,
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> SchedulerHandle {
        let detect = LeaderLoop::new(
            DETECT_LOCK_KEY,
            self.intervals.detect,
            self.intervals.lease_retry,
            self.elector.clone(),
            Arc::new(DetectLoop(self.orchestrator.clone())),
        );
        let consume = LeaderLoop::new(
            CONSUME_LOCK_KEY,
            self.intervals.consume,
            self.intervals.lease_retry,
            self.elector.clone(),
            Arc::new(ConsumeLoop(self.consumer.clone())),
        );

        SchedulerHandle {
            detect: tokio::spawn(detect.run(shutdown.clone())),
            consume: tokio::spawn(consume.run(shutdown)),
        }
    }
}
