//! Shared pool of scan workers.
//!
//! A single mpmc job queue feeds a fixed number of workers. Each job carries
//! its own oneshot for the outcome, so the number of workers bounds how many
//! images are in flight across all scans without affecting batch order.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scan::ImagePipeline;
use crate::{ImageRef, ProgressEvent, ScanOutcome};

/// One image of one scan, submitted to the pool.
pub struct ImageJob {
    pub src: ImageRef,
    pub result_tx: oneshot::Sender<ScanOutcome>,
    pub index: usize,
    pub total: usize,
    /// Progress callback for this job's scan.
    pub progress: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
}

/// A pool of worker tasks that acquire and classify images.
///
/// Submit jobs via [`submit()`](ScanPool::submit), receive outcomes via the
/// oneshot receiver paired with each job.
pub struct ScanPool {
    job_tx: async_channel::Sender<ImageJob>,
    workers_handle: JoinHandle<()>,
}

impl ScanPool {
    /// Create a new pool with `num_workers` concurrent workers (at least one).
    pub fn new(
        pipeline: Arc<ImagePipeline>,
        cancel: CancellationToken,
        num_workers: usize,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let (job_tx, job_rx) = async_channel::unbounded::<ImageJob>();

        let workers_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers);
            for _ in 0..num_workers {
                let rx = job_rx.clone();
                let pipeline = pipeline.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(worker_loop(rx, pipeline, cancel)));
            }
            // Drop our clone of the receiver so workers can exit when sender closes
            drop(job_rx);
            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            workers_handle,
        }
    }

    /// Submit a job. If the pool is closed the job is dropped, and with it
    /// its result sender.
    pub async fn submit(&self, job: ImageJob) {
        if self.job_tx.send(job).await.is_err() {
            log::warn!("scan pool is closed; job dropped");
        }
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn close(&self) {
        self.job_tx.close();
    }

    /// Close the pool and wait for all workers to finish.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.workers_handle.await;
    }
}

/// Worker loop: receive jobs, process them, send outcomes via oneshot.
async fn worker_loop(
    job_rx: async_channel::Receiver<ImageJob>,
    pipeline: Arc<ImagePipeline>,
    cancel: CancellationToken,
) {
    while let Ok(job) = job_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }

        let ImageJob {
            src,
            mut result_tx,
            index,
            total,
            progress,
        } = job;

        let outcome = tokio::select! {
            biased;
            _ = result_tx.closed() => continue,
            _ = cancel.cancelled() => break,
            outcome = pipeline.process(&src) => outcome,
        };

        progress(ProgressEvent {
            index,
            total,
            outcome: Box::new(outcome.clone()),
        });

        let _ = result_tx.send(outcome);
    }
}
