// 📬 Ingestion Queue - fire-and-forget handoff to background workers
//
// Submitting never waits: a listing is either enqueued or rejected on the
// spot. What happens to it afterwards is visible only in logs.

use crate::db::AlertStore;
use crate::entities::ListingEvent;
use crate::notifier::EmailSender;
use crate::pipeline::{IngestOutcome, IngestReport, IngestionPipeline};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("ingestion queue is full")]
    Full,

    #[error("ingestion queue is closed")]
    Closed,
}

pub type Rx = mpsc::Receiver<ListingEvent>;

/// Submission handle. Cloneable; the worker exits once every handle is dropped
/// and the queue is drained.
#[derive(Debug, Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<ListingEvent>,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> (IngestQueue, Rx) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (IngestQueue { tx }, rx)
    }

    pub fn submit(&self, listing: ListingEvent) -> Result<(), SubmitError> {
        self.tx.try_send(listing).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

/// Totals over the lifetime of a worker.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServeStats {
    pub received: usize,
    pub notified: usize,
    pub sent: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub panicked: usize,
}

/// Consumes listings from `rx`, running up to `max_concurrent` pipeline runs
/// at once. Returns after `rx` closes and every started run has finished.
#[tracing::instrument(skip(pipeline, rx))]
pub async fn serve<S, ES>(
    pipeline: Arc<IngestionPipeline<S, ES>>,
    mut rx: Rx,
    max_concurrent: usize,
) -> ServeStats
where
    S: AlertStore,
    ES: EmailSender,
{
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut running: JoinSet<IngestReport> = JoinSet::new();
    let mut stats = ServeStats::default();
    let mut closed = false;

    loop {
        tokio::select! {
            // Prefer reaping finished runs before starting new ones.
            biased;

            joined = running.join_next(), if !running.is_empty() => {
                match joined {
                    Some(Ok(report)) => {
                        match report.outcome {
                            IngestOutcome::Notified => stats.notified += 1,
                            IngestOutcome::StoreUnavailable => stats.abandoned += 1,
                            IngestOutcome::UnknownCorrelation
                            | IngestOutcome::NoMatchingAlerts
                            | IngestOutcome::AlreadyDelivered => {}
                        }
                        stats.sent += report.sent;
                        stats.failed += report.failed;
                    }
                    Some(Err(error)) => {
                        stats.panicked += 1;
                        tracing::error!(%error, "ingestion task did not complete");
                    }
                    None => {}
                }
            }
            recv = rx.recv(), if !closed => {
                match recv {
                    None => {
                        closed = true;
                        tracing::debug!("ingestion queue closed");
                    }
                    Some(listing) => {
                        stats.received += 1;
                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            tracing::error!("ingestion permits closed, worker exiting");
                            return stats;
                        };
                        let pipeline = pipeline.clone();
                        running.spawn(async move {
                            let _permit = permit;
                            pipeline.ingest(listing).await
                        });
                    }
                }
            }
            else => {
                tracing::info!(?stats, "ingestion queue drained, worker exiting");
                return stats;
            }
        }
    }
}
