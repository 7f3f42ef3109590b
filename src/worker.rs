//! The queue consumer: one job at a time, from receipt to acknowledgement.

use crate::callback::CallbackNotifier;
use crate::job::{Context, Job, PreviewResult};
use crate::queue::{Delivery, MessageQueue};
use crate::runner::JobRunner;
use crate::storage::ResultStore;
use crate::telemetry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// A heartbeat is recorded every this many jobs.
const HEARTBEAT_INTERVAL: u64 = 10;

pub struct Worker {
    queue: Arc<dyn MessageQueue>,
    runner: Arc<dyn JobRunner>,
    results: ResultStore,
    notifier: CallbackNotifier,
    wait: Duration,
    retry_delay: Duration,
    processed: u64,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        runner: Arc<dyn JobRunner>,
        results: ResultStore,
        notifier: CallbackNotifier,
        wait: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            queue,
            runner,
            results,
            notifier,
            wait,
            retry_delay,
            processed: 0,
        }
    }

    /// Consumes the queue until `shutdown` fires.
    ///
    /// A job that is already running is finished (and acknowledged) before
    /// the loop exits.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        match self.queue.recover().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Recovered jobs left in flight by a previous run"),
            Err(e) => warn!(error = %e, "Unable to recover in-flight jobs"),
        }
        info!("Worker started, waiting for jobs");

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(self.wait) => received,
            };

            match received {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, retry_in = ?self.retry_delay, "Unable to receive from the queue");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        info!(processed = self.processed, "Worker stopped");
    }

    /// Processes one delivery. Never fails: every outcome ends with the
    /// message acknowledged.
    pub async fn handle(&mut self, delivery: Delivery) {
        let job = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                // Nothing to call back to; retrying would only loop.
                error!(body = %delivery.body, error = %e, "Discarding malformed queue message");
                self.acknowledge(&delivery).await;
                return;
            }
        };

        let span = info_span!("preview_job", job_id = %job.id);
        async {
            let started = Instant::now();
            info!(url = %job.url, "Processing job");

            let result = self.produce(&job).await;
            // Failures are logged by the notifier and never retried.
            let _ = self.notifier.notify(&job, &result).await;
            self.acknowledge(&delivery).await;

            telemetry::record_job_telemetry(&job, result.status(), started.elapsed());
        }
        .instrument(span)
        .await;

        self.processed += 1;
        if self.processed % HEARTBEAT_INTERVAL == 0 {
            telemetry::record_worker_heartbeat(self.processed);
        }
    }

    /// Runs the job in a scratch directory that is gone by the time this
    /// returns, and uploads whatever it produced.
    async fn produce(&self, job: &Job) -> PreviewResult<String> {
        let directory = match tempfile::Builder::new().prefix("preview-").tempdir() {
            Ok(directory) => directory,
            Err(e) => {
                error!(error = %e, "Unable to create a working directory");
                return PreviewResult::Error;
            }
        };

        let ctx = Context::new(job.clone(), directory.path());
        let produced = self.runner.run(&ctx).await;
        let stored = match self.results.store(produced).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Unable to store the generated files");
                PreviewResult::Error
            }
        };

        if let Err(e) = directory.close() {
            warn!(error = %e, "Unable to remove the working directory");
        }
        stored
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.acknowledge(delivery).await {
            error!(error = %e, "Unable to acknowledge the message, it will be redelivered");
        }
    }
}
