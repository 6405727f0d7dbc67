use crate::access::Principal;
use crate::db::{DBError, SharedDb};
use crate::models::ingestion_jobs::{IngestionJob, NewIngestionJob};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Database-backed task queue for ingestion.
///
/// `enqueue` records a job and wakes one idle worker. It never waits for the job.
#[derive(Clone)]
pub struct IngestionQueue {
    db: SharedDb,
    notify: Arc<Notify>,
    max_attempts: i32,
}

impl IngestionQueue {
    pub fn new(db: SharedDb, max_attempts: i32) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
            max_attempts,
        }
    }

    /// Queues ingestion of `document_id` into `chatbot_id` on behalf of `principal`.
    ///
    /// The caller must already have checked that `principal` owns the chatbot.
    pub fn enqueue(
        &self,
        document_id: i64,
        chatbot_id: i64,
        principal: &Principal,
    ) -> Result<IngestionJob, DBError> {
        let job = self.db.create_ingestion_job(NewIngestionJob::new(
            document_id,
            chatbot_id,
            principal.user_id,
            self.max_attempts,
        ))?;
        info!(
            "Queued ingestion job {} for document {} (chatbot {})",
            job.uuid, document_id, chatbot_id
        );
        self.notify.notify_one();
        Ok(job)
    }

    pub(crate) fn notified(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
