//! Worker pool running bibliography entries in parallel.
//!
//! Entries are independent; the only state they share is what lives on the
//! [`RunContext`]: the per-host rate limiters and the cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::pipeline::{EntryOutcome, EntryStatus, generate_outf, process_entry};
use crate::record::BibliographicRecord;

/// Progress notifications emitted by the workers.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        index: usize,
        total: usize,
        title: String,
    },
    Finished {
        index: usize,
        total: usize,
        status: EntryStatus,
    },
}

/// One entry submitted to the pool.
pub struct EntryJob {
    pub record: BibliographicRecord,
    pub outf: PathBuf,
    pub index: usize,
    pub total: usize,
    pub result_tx: oneshot::Sender<EntryOutcome>,
    pub progress: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
}

/// A fixed set of worker tasks fed from one queue.
///
/// Submit jobs via [`submit()`](ProcessPool::submit) and await the oneshot
/// receiver paired with each job.
pub struct ProcessPool {
    job_tx: async_channel::Sender<EntryJob>,
    pool_handle: JoinHandle<()>,
}

impl ProcessPool {
    pub fn new(ctx: Arc<RunContext>, cancel: CancellationToken, num_workers: usize) -> Self {
        let (job_tx, job_rx) = async_channel::unbounded::<EntryJob>();

        let pool_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers.max(1));
            for _ in 0..num_workers.max(1) {
                handles.push(tokio::spawn(worker_loop(
                    job_rx.clone(),
                    ctx.clone(),
                    cancel.clone(),
                )));
            }
            drop(job_rx);
            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            pool_handle,
        }
    }

    pub async fn submit(&self, job: EntryJob) {
        let _ = self.job_tx.send(job).await;
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.pool_handle.await;
    }
}

async fn worker_loop(
    job_rx: async_channel::Receiver<EntryJob>,
    ctx: Arc<RunContext>,
    cancel: CancellationToken,
) {
    while let Ok(job) = job_rx.recv().await {
        if cancel.is_cancelled() {
            let _ = job.result_tx.send(EntryOutcome::cancelled(&job.record));
            continue;
        }
        let EntryJob {
            record,
            outf,
            index,
            total,
            result_tx,
            progress,
        } = job;

        progress(ProgressEvent::Started {
            index,
            total,
            title: record.title().to_string(),
        });
        let outcome = tokio::select! {
            _ = cancel.cancelled() => EntryOutcome::cancelled(&record),
            outcome = process_entry(&ctx, &record, &outf) => outcome,
        };
        progress(ProgressEvent::Finished {
            index,
            total,
            status: outcome.status,
        });
        let _ = result_tx.send(outcome);
    }
}

/// Run every record through the pool, writing into `outdir`.
///
/// Outcomes come back in input order. Entries not run because of
/// cancellation are reported as failed.
pub async fn run_batch(
    records: Vec<BibliographicRecord>,
    outdir: &Path,
    ctx: Arc<RunContext>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Vec<EntryOutcome> {
    let total = records.len();
    if total == 0 {
        return vec![];
    }
    let num_workers = ctx.settings.processing.workers.max(1);
    let progress: Arc<dyn Fn(ProgressEvent) + Send + Sync> = Arc::new(progress);
    let pool = ProcessPool::new(ctx, cancel.clone(), num_workers);

    let mut taken = HashSet::new();
    let mut receivers = Vec::with_capacity(total);
    for (index, record) in records.iter().enumerate() {
        let (result_tx, result_rx) = oneshot::channel();
        let job = EntryJob {
            record: record.clone(),
            outf: generate_outf(outdir, record, &mut taken),
            index,
            total,
            result_tx,
            progress: progress.clone(),
        };
        pool.submit(job).await;
        receivers.push(result_rx);
    }

    let mut outcomes = Vec::with_capacity(total);
    for (record, rx) in records.iter().zip(receivers) {
        outcomes.push(match rx.await {
            Ok(outcome) => outcome,
            Err(_) => EntryOutcome::cancelled(record),
        });
    }
    pool.shutdown().await;
    outcomes
}
