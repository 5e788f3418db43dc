//! Background loop driving periodic synchronization passes and count flushes.

use crate::counter::ImpressionsCounter;
use crate::errors::{RecorderError, SyncError, TaskError};
use crate::recorder::ImpressionCountRecorder;
use crate::synchronizer::{ImpressionSynchronizer, PassOutcome};
use crate::telemetry::{ResourceKind, TelemetryRecorder};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Sends the duplicate counter's accumulated window upstream.
pub struct CountFlusher {
    counter: Arc<ImpressionsCounter>,
    recorder: Arc<dyn ImpressionCountRecorder>,
    telemetry: Arc<dyn TelemetryRecorder>,
}

impl CountFlusher {
    pub fn new(
        counter: Arc<ImpressionsCounter>,
        recorder: Arc<dyn ImpressionCountRecorder>,
        telemetry: Arc<dyn TelemetryRecorder>,
    ) -> Self {
        CountFlusher {
            counter,
            recorder,
            telemetry,
        }
    }

    /// Takes the current window and posts it. A failed post drops the window.
    pub async fn flush(&self) -> Result<(), RecorderError> {
        let snapshot = self.counter.pop_all();
        if snapshot.is_empty() {
            return Ok(());
        }

        let payload = snapshot.to_payload();
        let before = std::time::Instant::now();
        let result = self.recorder.record_counts(&payload).await;
        self.telemetry
            .record_sync_latency(ResourceKind::ImpressionCountSync, before.elapsed());

        match &result {
            Ok(()) => {
                self.telemetry
                    .record_successful_sync(ResourceKind::ImpressionCountSync, SystemTime::now());
                tracing::debug!(
                    features = payload.per_feature.len(),
                    total = snapshot.total(),
                    "impression counts flushed"
                );
            }
            Err(e) => tracing::error!(
                error = %e,
                total = snapshot.total(),
                "failed to record impression counts"
            ),
        }
        result
    }
}

#[derive(Debug)]
pub enum Command {
    // Run a pass now, outside of the regular interval
    SyncNow(oneshot::Sender<Result<PassOutcome, SyncError>>),
    // Stop scheduling, wait for in-flight passes and flush counts
    Shutdown,
}

pub struct SyncTask {
    synchronizer: ImpressionSynchronizer,
    count_flusher: Option<CountFlusher>,
    batch_size: usize,
    post_rate: Duration,
    count_post_rate: Duration,
}

impl SyncTask {
    pub fn new(
        synchronizer: ImpressionSynchronizer,
        count_flusher: Option<CountFlusher>,
        batch_size: usize,
        post_rate: Duration,
        count_post_rate: Duration,
    ) -> Self {
        SyncTask {
            synchronizer,
            count_flusher,
            batch_size,
            post_rate,
            count_post_rate,
        }
    }

    pub fn synchronizer(&self) -> &ImpressionSynchronizer {
        &self.synchronizer
    }

    pub fn spawn(self) -> SyncTaskHandle {
        let (tx, rx) = mpsc::channel::<Command>(64);
        let running = Arc::new(AtomicBool::new(true));

        let running_clone = running.clone();
        let handle = tokio::spawn(async move {
            self.run(rx).await;
            running_clone.store(false, Ordering::Relaxed);
        });

        SyncTaskHandle {
            tx,
            running,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let now = Instant::now();
        let mut post_interval = interval_at(now + self.post_rate, self.post_rate);
        post_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut count_interval = interval_at(now + self.count_post_rate, self.count_post_rate);
        count_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut passes = JoinSet::new();
        tracing::info!(
            mode = self.synchronizer.mode().as_str(),
            batch_size = self.batch_size,
            post_rate_secs = self.post_rate.as_secs(),
            "impression sync task started"
        );

        loop {
            tokio::select! {
                _ = post_interval.tick() => {
                    if self.synchronizer.is_busy() {
                        tracing::debug!("governor busy, not starting a new pass");
                        continue;
                    }
                    let synchronizer = self.synchronizer.clone();
                    let batch_size = self.batch_size;
                    passes.spawn(async move { synchronizer.try_synchronize(batch_size).await });
                }
                _ = count_interval.tick(), if self.count_flusher.is_some() => {
                    if let Some(flusher) = &self.count_flusher {
                        let _ = flusher.flush().await;
                    }
                }
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    log_pass(joined);
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::SyncNow(reply)) => {
                        let result = self.synchronizer.try_synchronize(self.batch_size).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        tracing::info!(in_flight = passes.len(), "impression sync task stopping");
        while let Some(joined) = passes.join_next().await {
            log_pass(joined);
        }
        if let Some(flusher) = &self.count_flusher {
            let _ = flusher.flush().await;
        }
        tracing::info!("impression sync task stopped");
    }
}

fn log_pass(joined: Result<Result<PassOutcome, SyncError>, JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(
            error = %e,
            failed_groups = e.failed_groups(),
            "impression sync pass failed"
        ),
        Err(e) => tracing::error!(error = %e, "impression sync pass panicked"),
    }
}

#[derive(Clone)]
pub struct SyncTaskHandle {
    tx: mpsc::Sender<Command>,
    running: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncTaskHandle {
    pub async fn sync_now(&self) -> Result<PassOutcome, TaskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::SyncNow(reply_tx))
            .await
            .map_err(|_| TaskError::NotRunning)?;
        let outcome = reply_rx.await.map_err(|_| TaskError::NotRunning)??;
        Ok(outcome)
    }

    /// Stops the task and waits until in-flight passes and the final count
    /// flush are done.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "impression sync task panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}
