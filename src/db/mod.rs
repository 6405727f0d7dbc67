//! Storage seam. Every handler and the ingestion workers go through [`DBConnection`].

#[cfg(test)]
pub mod memory;
mod postgres;

use crate::access::Principal;
use crate::models::chatbot_permissions::PermissionError;
use crate::models::chatbots::{Chatbot, ChatbotError, NewChatbot, Visibility};
use crate::models::document_chunks::{ChunkCommit, ChunkError, DocumentChunk, NewDocumentChunk};
use crate::models::documents::{Document, DocumentError, NewDocument};
use crate::models::ingestion_jobs::{IngestionJob, IngestionJobError, NewIngestionJob};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use postgres::setup_db;

#[derive(Error, Debug)]
pub enum DBError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Connection pool error: {0}")]
    PoolError(#[from] diesel::r2d2::PoolError),
    #[error("Migration error: {0}")]
    MigrationError(String),
    #[error("Chatbot error: {0}")]
    ChatbotError(#[from] ChatbotError),
    #[error("Permission error: {0}")]
    PermissionError(#[from] PermissionError),
    #[error("Document error: {0}")]
    DocumentError(#[from] DocumentError),
    #[error("Chunk error: {0}")]
    ChunkError(#[from] ChunkError),
    #[error("Ingestion job error: {0}")]
    IngestionJobError(#[from] IngestionJobError),
}

pub trait DBConnection {
    // Chatbots
    fn create_chatbot(&self, new_chatbot: NewChatbot) -> Result<Chatbot, DBError>;
    fn get_chatbot_by_id(&self, id: i64) -> Result<Option<Chatbot>, DBError>;
    fn get_chatbot_by_uuid(&self, uuid: Uuid) -> Result<Option<Chatbot>, DBError>;
    fn list_readable_chatbots(&self, principal: &Principal) -> Result<Vec<Chatbot>, DBError>;
    fn update_chatbot_visibility(
        &self,
        chatbot_id: i64,
        visibility: Visibility,
    ) -> Result<Chatbot, DBError>;
    fn delete_chatbot(&self, chatbot_id: i64) -> Result<(), DBError>;

    // Permissions
    /// Returns true if a new grant was stored, false if it already existed.
    fn grant_permission(
        &self,
        chatbot_id: i64,
        user_id: Uuid,
        granted_by: Uuid,
    ) -> Result<bool, DBError>;
    /// Returns true if a grant was removed, false if there was none.
    fn revoke_permission(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError>;
    fn list_grantees(&self, chatbot_id: i64) -> Result<Vec<Uuid>, DBError>;
    fn has_grant(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError>;

    // Documents
    fn create_document(&self, new_document: NewDocument) -> Result<Document, DBError>;
    fn get_document_by_id(&self, id: i64) -> Result<Option<Document>, DBError>;
    fn get_document_by_uuid(&self, uuid: Uuid) -> Result<Option<Document>, DBError>;
    fn delete_document(&self, id: i64) -> Result<(), DBError>;

    // Chunks
    fn replace_document_chunks(
        &self,
        document_id: i64,
        chatbot_id: i64,
        fingerprint: &str,
        chunks: &[NewDocumentChunk],
    ) -> Result<ChunkCommit, DBError>;
    fn get_chunk_source_hashes(&self, document_id: i64) -> Result<Vec<String>, DBError>;
    fn get_readable_chunk_by_uuid(
        &self,
        principal: &Principal,
        uuid: Uuid,
    ) -> Result<Option<DocumentChunk>, DBError>;
    fn list_readable_chunks_for_chatbot(
        &self,
        principal: &Principal,
        chatbot_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DocumentChunk>, DBError>;
    fn list_readable_chunks_for_chatbots(
        &self,
        principal: &Principal,
        chatbot_ids: &[i64],
    ) -> Result<Vec<DocumentChunk>, DBError>;

    // Ingestion jobs
    fn create_ingestion_job(&self, new_job: NewIngestionJob) -> Result<IngestionJob, DBError>;
    fn get_ingestion_job_by_uuid(&self, uuid: Uuid) -> Result<Option<IngestionJob>, DBError>;
    fn claim_next_ingestion_job(&self, worker_id: &str) -> Result<Option<IngestionJob>, DBError>;
    /// False when `worker_id` no longer holds the job.
    fn touch_ingestion_job(&self, job_id: i64, worker_id: &str) -> Result<bool, DBError>;
    fn complete_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        chunk_count: i32,
    ) -> Result<IngestionJob, DBError>;
    fn fail_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<IngestionJob, DBError>;
    fn requeue_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<IngestionJob, DBError>;
    fn recover_stale_ingestion_jobs(&self, cutoff: DateTime<Utc>)
        -> Result<(usize, usize), DBError>;
}

pub type SharedDb = Arc<dyn DBConnection + Send + Sync>;
