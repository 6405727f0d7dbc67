use crate::db::{DBConnection, DBError, SharedDb};
use crate::ingest::pipeline::IngestionPipeline;
use crate::ingest::queue::IngestionQueue;
use crate::models::ingestion_jobs::{IngestionJob, IngestionJobError};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub stale_after: Duration,
}

/// How often a running job refreshes its lease. Three beats fit inside one stale window.
pub fn lease_heartbeat(stale_after: Duration) -> Duration {
    (stale_after / 3).max(Duration::from_millis(10))
}

/// Claims and runs the next queued job, refreshing its lease every `heartbeat`.
/// Returns the job as left by this attempt, or `None` if the queue is empty or the
/// lease was lost mid-run.
pub async fn process_next(
    db: &(dyn DBConnection + Send + Sync),
    pipeline: &IngestionPipeline,
    worker_id: &str,
    heartbeat: Duration,
) -> Result<Option<IngestionJob>, DBError> {
    let Some(job) = db.claim_next_ingestion_job(worker_id)? else {
        return Ok(None);
    };
    debug!(
        "Worker {} claimed job {} (attempt {}/{})",
        worker_id, job.uuid, job.attempts, job.max_attempts
    );

    let run = pipeline.run(&job);
    tokio::pin!(run);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = ticker.tick() => match db.touch_ingestion_job(job.id, worker_id) {
                Ok(true) => {}
                Ok(false) => {
                    // Dropping the run discards its uncommitted chunks.
                    warn!(
                        "Worker {} lost the lease on ingestion job {}, abandoning it",
                        worker_id, job.uuid
                    );
                    return Ok(None);
                }
                Err(e) => warn!("Could not refresh lease on ingestion job {}: {:?}", job.uuid, e),
            },
        }
    };

    let updated = match outcome {
        Ok(commit) => {
            let chunk_count = i32::try_from(commit.chunk_count()).unwrap_or(i32::MAX);
            info!(
                "Ingestion job {} completed with {} chunks",
                job.uuid, chunk_count
            );
            db.complete_ingestion_job(job.id, worker_id, chunk_count)
        }
        Err(e) if e.is_retryable() && !job.attempts_exhausted() => {
            warn!(
                "Ingestion job {} attempt {}/{} failed, requeueing: {}",
                job.uuid, job.attempts, job.max_attempts, e
            );
            db.requeue_ingestion_job(job.id, worker_id, &e.to_string())
        }
        Err(e) => {
            error!(
                "Ingestion job {} for document {} failed after {} attempts; reporting to {}: {}",
                job.uuid, job.document_id, job.attempts, job.requested_by, e
            );
            db.fail_ingestion_job(job.id, worker_id, &e.to_string())
        }
    };

    match updated {
        Ok(job) => Ok(Some(job)),
        // The job row went with a deleted document, or another worker holds it now.
        Err(DBError::IngestionJobError(IngestionJobError::NotFound)) => {
            debug!("Ingestion job {} is no longer held by {}", job.uuid, worker_id);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn run_worker(
    worker_id: String,
    db: SharedDb,
    pipeline: IngestionPipeline,
    queue: IngestionQueue,
    poll_interval: Duration,
    heartbeat: Duration,
) {
    info!("Ingestion worker {} started", worker_id);
    let notify = queue.notified();
    loop {
        match process_next(db.as_ref(), &pipeline, &worker_id, heartbeat).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!("Ingestion worker {} could not process a job: {:?}", worker_id, e),
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Requeues (or fails) jobs whose worker stopped reporting.
async fn run_stale_sweeper(db: SharedDb, stale_after: Duration, interval: Duration) {
    let stale_after =
        chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(365));
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - stale_after;
        match db.recover_stale_ingestion_jobs(cutoff) {
            Ok((0, 0)) => {}
            Ok((requeued, failed)) => warn!(
                "Recovered stale ingestion jobs: {} requeued, {} failed",
                requeued, failed
            ),
            Err(e) => error!("Stale ingestion sweep failed: {:?}", e),
        }
    }
}

/// Starts the worker pool plus the stale-job sweeper.
pub fn spawn_workers(
    db: SharedDb,
    pipeline: IngestionPipeline,
    queue: IngestionQueue,
    settings: WorkerSettings,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(settings.workers + 1);
    for i in 0..settings.workers.max(1) {
        let worker_id = format!("worker-{}-{}", std::process::id(), i);
        handles.push(tokio::spawn(run_worker(
            worker_id,
            db.clone(),
            pipeline.clone(),
            queue.clone(),
            settings.poll_interval,
            lease_heartbeat(settings.stale_after),
        )));
    }
    handles.push(tokio::spawn(run_stale_sweeper(
        db,
        settings.stale_after,
        settings.poll_interval,
    )));
    handles
}
