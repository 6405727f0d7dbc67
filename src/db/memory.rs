//! In-process [`DBConnection`] used by unit and router tests.
//!
//! Mirrors the database semantics the service relies on: unique grants, cascading
//! deletes, the chunk foreign keys, and read filtering by the same rules as the
//! row-level-security policies.

use super::{DBConnection, DBError};
use crate::access::policy::can_read;
use crate::access::Principal;
use crate::models::chatbot_permissions::ChatbotPermission;
use crate::models::chatbots::{Chatbot, ChatbotError, NewChatbot, Visibility};
use crate::models::document_chunks::{
    is_current, ChunkCommit, ChunkError, DocumentChunk, NewDocumentChunk,
};
use crate::models::documents::{Document, DocumentError, NewDocument};
use crate::models::ingestion_jobs::{
    IngestionJob, IngestionJobError, IngestionStatus, NewIngestionJob, STALE_LEASE_ERROR,
};
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    next_id: i64,
    chatbots: Vec<Chatbot>,
    permissions: Vec<ChatbotPermission>,
    documents: Vec<Document>,
    chunks: Vec<DocumentChunk>,
    jobs: Vec<IngestionJob>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn readable(&self, principal: &Principal, chatbot: &Chatbot) -> bool {
        let granted = self
            .permissions
            .iter()
            .any(|p| p.chatbot_id == chatbot.id && p.user_id == principal.user_id);
        can_read(principal, chatbot, granted)
    }

    fn chunk_readable(&self, principal: &Principal, chunk: &DocumentChunk) -> bool {
        self.chatbots
            .iter()
            .find(|c| c.id == chunk.chatbot_id)
            .map(|c| self.readable(principal, c))
            .unwrap_or(false)
    }

    fn job_mut(&mut self, id: i64) -> Result<&mut IngestionJob, DBError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(DBError::IngestionJobError(IngestionJobError::NotFound))
    }

    /// The job only while `worker` still holds its lease.
    fn leased_job_mut(&mut self, id: i64, worker: &str) -> Result<&mut IngestionJob, DBError> {
        let job = self.job_mut(id)?;
        if job.status != IngestionStatus::InProgress || job.worker_id.as_deref() != Some(worker) {
            return Err(DBError::IngestionJobError(IngestionJobError::NotFound));
        }
        Ok(job)
    }
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<State>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a chunk row directly, bypassing the document checks. Used to model
    /// integrity faults such as a chunk whose chatbot has vanished.
    pub fn insert_raw_chunk(&self, chatbot_id: i64, content: &str) -> DocumentChunk {
        let mut state = self.lock();
        let chunk = DocumentChunk {
            id: state.id(),
            uuid: Uuid::new_v4(),
            chatbot_id,
            document_id: 0,
            chunk_index: 0,
            content: content.to_string(),
            embedding: Vec::new(),
            embedding_model: "raw".to_string(),
            vector_dim: 0,
            token_count: 0,
            source_hash: String::new(),
            created_at: Utc::now(),
        };
        state.chunks.push(chunk.clone());
        chunk
    }

    /// Removes a chatbot row without cascading, leaving its chunks dangling.
    pub fn remove_chatbot_row(&self, chatbot_id: i64) {
        self.lock().chatbots.retain(|c| c.id != chatbot_id);
    }

    pub fn chunks_for_document(&self, document_id: i64) -> Vec<DocumentChunk> {
        let mut chunks: Vec<DocumentChunk> = self
            .lock()
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }

    pub fn grant_count(&self, chatbot_id: i64) -> usize {
        self.lock()
            .permissions
            .iter()
            .filter(|p| p.chatbot_id == chatbot_id)
            .count()
    }

    /// Backdates a job's last update, as if its worker stopped reporting.
    pub fn age_job(&self, job_id: i64, updated_at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.iter_mut().find(|j| j.id == job_id) {
            job.updated_at = updated_at;
        }
    }
}

impl DBConnection for MemoryDb {
    fn create_chatbot(&self, new_chatbot: NewChatbot) -> Result<Chatbot, DBError> {
        let mut state = self.lock();
        let now = Utc::now();
        let chatbot = Chatbot {
            id: state.id(),
            uuid: new_chatbot.uuid,
            owner_id: new_chatbot.owner_id,
            name: new_chatbot.name,
            description: new_chatbot.description,
            visibility: new_chatbot.visibility,
            created_at: now,
            updated_at: now,
        };
        state.chatbots.push(chatbot.clone());
        Ok(chatbot)
    }

    fn get_chatbot_by_id(&self, id: i64) -> Result<Option<Chatbot>, DBError> {
        Ok(self.lock().chatbots.iter().find(|c| c.id == id).cloned())
    }

    fn get_chatbot_by_uuid(&self, uuid: Uuid) -> Result<Option<Chatbot>, DBError> {
        Ok(self.lock().chatbots.iter().find(|c| c.uuid == uuid).cloned())
    }

    fn list_readable_chatbots(&self, principal: &Principal) -> Result<Vec<Chatbot>, DBError> {
        let state = self.lock();
        let mut out: Vec<Chatbot> = state
            .chatbots
            .iter()
            .filter(|c| state.readable(principal, c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    fn update_chatbot_visibility(
        &self,
        chatbot_id: i64,
        visibility: Visibility,
    ) -> Result<Chatbot, DBError> {
        let mut state = self.lock();
        let chatbot = state
            .chatbots
            .iter_mut()
            .find(|c| c.id == chatbot_id)
            .ok_or(DBError::ChatbotError(ChatbotError::NotFound))?;
        chatbot.visibility = visibility;
        chatbot.updated_at = Utc::now();
        Ok(chatbot.clone())
    }

    fn delete_chatbot(&self, chatbot_id: i64) -> Result<(), DBError> {
        let mut state = self.lock();
        let before = state.chatbots.len();
        state.chatbots.retain(|c| c.id != chatbot_id);
        if state.chatbots.len() == before {
            return Err(DBError::ChatbotError(ChatbotError::NotFound));
        }
        state.permissions.retain(|p| p.chatbot_id != chatbot_id);
        state.documents.retain(|d| d.chatbot_id != chatbot_id);
        state.chunks.retain(|c| c.chatbot_id != chatbot_id);
        state.jobs.retain(|j| j.chatbot_id != chatbot_id);
        Ok(())
    }

    fn grant_permission(
        &self,
        chatbot_id: i64,
        user_id: Uuid,
        granted_by: Uuid,
    ) -> Result<bool, DBError> {
        let mut state = self.lock();
        if state
            .permissions
            .iter()
            .any(|p| p.chatbot_id == chatbot_id && p.user_id == user_id)
        {
            return Ok(false);
        }
        let id = state.id();
        state.permissions.push(ChatbotPermission {
            id,
            chatbot_id,
            user_id,
            granted_by,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    fn revoke_permission(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError> {
        let mut state = self.lock();
        let before = state.permissions.len();
        state
            .permissions
            .retain(|p| !(p.chatbot_id == chatbot_id && p.user_id == user_id));
        Ok(state.permissions.len() != before)
    }

    fn list_grantees(&self, chatbot_id: i64) -> Result<Vec<Uuid>, DBError> {
        Ok(self
            .lock()
            .permissions
            .iter()
            .filter(|p| p.chatbot_id == chatbot_id)
            .map(|p| p.user_id)
            .collect())
    }

    fn has_grant(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError> {
        Ok(self
            .lock()
            .permissions
            .iter()
            .any(|p| p.chatbot_id == chatbot_id && p.user_id == user_id))
    }

    fn create_document(&self, new_document: NewDocument) -> Result<Document, DBError> {
        let mut state = self.lock();
        if !state.chatbots.iter().any(|c| c.id == new_document.chatbot_id) {
            return Err(DBError::ChatbotError(ChatbotError::NotFound));
        }
        let now = Utc::now();
        let document = Document {
            id: state.id(),
            uuid: new_document.uuid,
            chatbot_id: new_document.chatbot_id,
            uploaded_by: new_document.uploaded_by,
            filename: new_document.filename,
            content_type: new_document.content_type,
            content: new_document.content,
            content_hash: new_document.content_hash,
            byte_size: new_document.byte_size,
            created_at: now,
            updated_at: now,
        };
        state.documents.push(document.clone());
        Ok(document)
    }

    fn get_document_by_id(&self, id: i64) -> Result<Option<Document>, DBError> {
        Ok(self.lock().documents.iter().find(|d| d.id == id).cloned())
    }

    fn get_document_by_uuid(&self, uuid: Uuid) -> Result<Option<Document>, DBError> {
        Ok(self.lock().documents.iter().find(|d| d.uuid == uuid).cloned())
    }

    fn delete_document(&self, id: i64) -> Result<(), DBError> {
        let mut state = self.lock();
        let before = state.documents.len();
        state.documents.retain(|d| d.id != id);
        if state.documents.len() == before {
            return Err(DBError::DocumentError(DocumentError::NotFound));
        }
        state.chunks.retain(|c| c.document_id != id);
        state.jobs.retain(|j| j.document_id != id);
        Ok(())
    }

    fn replace_document_chunks(
        &self,
        document_id: i64,
        chatbot_id: i64,
        fingerprint: &str,
        chunks: &[NewDocumentChunk],
    ) -> Result<ChunkCommit, DBError> {
        let mut state = self.lock();
        if !state
            .documents
            .iter()
            .any(|d| d.id == document_id && d.chatbot_id == chatbot_id)
        {
            return Err(DBError::ChunkError(ChunkError::DocumentMissing));
        }

        let stored: Vec<String> = state
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.source_hash.clone())
            .collect();
        if is_current(&stored, fingerprint, Some(chunks.len())) {
            return Ok(ChunkCommit::Unchanged(stored.len()));
        }

        state.chunks.retain(|c| c.document_id != document_id);
        let now = Utc::now();
        for chunk in chunks {
            let id = state.id();
            state.chunks.push(DocumentChunk {
                id,
                uuid: chunk.uuid,
                chatbot_id: chunk.chatbot_id,
                document_id: chunk.document_id,
                chunk_index: chunk.chunk_index,
                content: chunk.content.clone(),
                embedding: chunk.embedding.clone(),
                embedding_model: chunk.embedding_model.clone(),
                vector_dim: chunk.vector_dim,
                token_count: chunk.token_count,
                source_hash: chunk.source_hash.clone(),
                created_at: now,
            });
        }
        Ok(ChunkCommit::Replaced(chunks.len()))
    }

    fn get_chunk_source_hashes(&self, document_id: i64) -> Result<Vec<String>, DBError> {
        Ok(self
            .lock()
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.source_hash.clone())
            .collect())
    }

    fn get_readable_chunk_by_uuid(
        &self,
        principal: &Principal,
        uuid: Uuid,
    ) -> Result<Option<DocumentChunk>, DBError> {
        let state = self.lock();
        Ok(state
            .chunks
            .iter()
            .find(|c| c.uuid == uuid && state.chunk_readable(principal, c))
            .cloned())
    }

    fn list_readable_chunks_for_chatbot(
        &self,
        principal: &Principal,
        chatbot_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DocumentChunk>, DBError> {
        let state = self.lock();
        let mut out: Vec<DocumentChunk> = state
            .chunks
            .iter()
            .filter(|c| c.chatbot_id == chatbot_id && state.chunk_readable(principal, c))
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.document_id, c.chunk_index));
        Ok(out
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    fn list_readable_chunks_for_chatbots(
        &self,
        principal: &Principal,
        chatbot_ids: &[i64],
    ) -> Result<Vec<DocumentChunk>, DBError> {
        let state = self.lock();
        Ok(state
            .chunks
            .iter()
            .filter(|c| chatbot_ids.contains(&c.chatbot_id) && state.chunk_readable(principal, c))
            .cloned()
            .collect())
    }

    fn create_ingestion_job(&self, new_job: NewIngestionJob) -> Result<IngestionJob, DBError> {
        let mut state = self.lock();
        if !state.documents.iter().any(|d| d.id == new_job.document_id) {
            return Err(DBError::DocumentError(DocumentError::NotFound));
        }
        let now = Utc::now();
        let job = IngestionJob {
            id: state.id(),
            uuid: new_job.uuid,
            document_id: new_job.document_id,
            chatbot_id: new_job.chatbot_id,
            requested_by: new_job.requested_by,
            status: new_job.status,
            attempts: 0,
            max_attempts: new_job.max_attempts,
            last_error: None,
            chunk_count: None,
            worker_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        state.jobs.push(job.clone());
        Ok(job)
    }

    fn get_ingestion_job_by_uuid(&self, uuid: Uuid) -> Result<Option<IngestionJob>, DBError> {
        Ok(self.lock().jobs.iter().find(|j| j.uuid == uuid).cloned())
    }

    fn claim_next_ingestion_job(&self, worker_id: &str) -> Result<Option<IngestionJob>, DBError> {
        let mut state = self.lock();
        let now = Utc::now();
        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == IngestionStatus::Queued)
            .min_by_key(|j| (j.created_at, j.id));
        let Some(job) = next else {
            return Ok(None);
        };
        job.status = IngestionStatus::InProgress;
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    fn touch_ingestion_job(&self, job_id: i64, worker_id: &str) -> Result<bool, DBError> {
        let mut state = self.lock();
        match state.leased_job_mut(job_id, worker_id) {
            Ok(job) => {
                job.updated_at = Utc::now();
                Ok(true)
            }
            Err(DBError::IngestionJobError(IngestionJobError::NotFound)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn complete_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        chunk_count: i32,
    ) -> Result<IngestionJob, DBError> {
        let mut state = self.lock();
        let job = state.leased_job_mut(job_id, worker_id)?;
        let now = Utc::now();
        job.status = IngestionStatus::Completed;
        job.chunk_count = Some(chunk_count);
        job.last_error = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    fn fail_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<IngestionJob, DBError> {
        let mut state = self.lock();
        let job = state.leased_job_mut(job_id, worker_id)?;
        let now = Utc::now();
        job.status = IngestionStatus::Failed;
        job.last_error = Some(error.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    fn requeue_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<IngestionJob, DBError> {
        let mut state = self.lock();
        let job = state.leased_job_mut(job_id, worker_id)?;
        job.status = IngestionStatus::Queued;
        job.last_error = Some(error.to_string());
        job.worker_id = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn recover_stale_ingestion_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize), DBError> {
        let mut state = self.lock();
        let now = Utc::now();
        let (mut requeued, mut failed) = (0, 0);
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == IngestionStatus::InProgress && j.updated_at < cutoff)
        {
            job.last_error = Some(STALE_LEASE_ERROR.to_string());
            job.updated_at = now;
            if job.attempts_exhausted() {
                job.status = IngestionStatus::Failed;
                job.completed_at = Some(now);
                failed += 1;
            } else {
                job.status = IngestionStatus::Queued;
                job.worker_id = None;
                requeued += 1;
            }
        }
        Ok((requeued, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot(db: &MemoryDb, owner: Uuid, visibility: Visibility) -> Chatbot {
        db.create_chatbot(NewChatbot::new(owner, "bot", None, visibility))
            .unwrap()
    }

    #[test]
    fn grant_twice_leaves_one_row_and_revoke_is_idempotent() {
        let db = MemoryDb::new();
        let owner = Uuid::new_v4();
        let user = Uuid::new_v4();
        let chatbot = bot(&db, owner, Visibility::Shared);

        assert!(db.grant_permission(chatbot.id, user, owner).unwrap());
        assert!(!db.grant_permission(chatbot.id, user, owner).unwrap());
        assert_eq!(db.grant_count(chatbot.id), 1);

        assert!(db.revoke_permission(chatbot.id, user).unwrap());
        assert!(!db.revoke_permission(chatbot.id, user).unwrap());
        assert_eq!(db.grant_count(chatbot.id), 0);
    }

    #[test]
    fn deleting_chatbot_cascades() {
        let db = MemoryDb::new();
        let owner = Uuid::new_v4();
        let chatbot = bot(&db, owner, Visibility::Shared);
        db.grant_permission(chatbot.id, Uuid::new_v4(), owner).unwrap();
        let doc = db
            .create_document(NewDocument::new(chatbot.id, owner, "a", "text/plain", b"x".to_vec()))
            .unwrap();

        db.delete_chatbot(chatbot.id).unwrap();
        assert_eq!(db.grant_count(chatbot.id), 0);
        assert!(db.get_document_by_id(doc.id).unwrap().is_none());
    }

    #[test]
    fn stale_jobs_are_requeued_or_failed() {
        let db = MemoryDb::new();
        let owner = Uuid::new_v4();
        let chatbot = bot(&db, owner, Visibility::Private);
        let doc = db
            .create_document(NewDocument::new(chatbot.id, owner, "a", "text/plain", b"x".to_vec()))
            .unwrap();
        let retryable = db
            .create_ingestion_job(NewIngestionJob::new(doc.id, chatbot.id, owner, 3))
            .unwrap();
        let last_try = db
            .create_ingestion_job(NewIngestionJob::new(doc.id, chatbot.id, owner, 1))
            .unwrap();

        db.claim_next_ingestion_job("w1").unwrap().unwrap();
        db.claim_next_ingestion_job("w2").unwrap().unwrap();
        let past = Utc::now() - chrono::Duration::minutes(30);
        db.age_job(retryable.id, past);
        db.age_job(last_try.id, past);

        let (requeued, failed) = db
            .recover_stale_ingestion_jobs(Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
        assert_eq!((requeued, failed), (1, 1));

        let failed_job = db.get_ingestion_job_by_uuid(last_try.uuid).unwrap().unwrap();
        assert_eq!(failed_job.status, IngestionStatus::Failed);
        assert_eq!(failed_job.last_error.as_deref(), Some(STALE_LEASE_ERROR));
    }

    #[test]
    fn recovered_job_rejects_its_previous_worker() {
        let db = MemoryDb::new();
        let owner = Uuid::new_v4();
        let chatbot = bot(&db, owner, Visibility::Private);
        let doc = db
            .create_document(NewDocument::new(chatbot.id, owner, "a", "text/plain", b"x".to_vec()))
            .unwrap();
        let job = db
            .create_ingestion_job(NewIngestionJob::new(doc.id, chatbot.id, owner, 3))
            .unwrap();

        db.claim_next_ingestion_job("w1").unwrap().unwrap();
        assert!(db.touch_ingestion_job(job.id, "w1").unwrap());
        assert!(!db.touch_ingestion_job(job.id, "w2").unwrap());

        db.age_job(job.id, Utc::now() - chrono::Duration::minutes(30));
        db.recover_stale_ingestion_jobs(Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
        let reclaimed = db.claim_next_ingestion_job("w2").unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);

        assert!(!db.touch_ingestion_job(job.id, "w1").unwrap());
        for result in [
            db.complete_ingestion_job(job.id, "w1", 4),
            db.fail_ingestion_job(job.id, "w1", "late"),
            db.requeue_ingestion_job(job.id, "w1", "late"),
        ] {
            assert!(matches!(
                result,
                Err(DBError::IngestionJobError(IngestionJobError::NotFound))
            ));
        }

        let current = db.get_ingestion_job_by_uuid(job.uuid).unwrap().unwrap();
        assert_eq!(current.status, IngestionStatus::InProgress);
        assert_eq!(current.worker_id.as_deref(), Some("w2"));
        assert_eq!(current.attempts, 2);

        let done = db.complete_ingestion_job(job.id, "w2", 4).unwrap();
        assert_eq!(done.status, IngestionStatus::Completed);
    }
}
