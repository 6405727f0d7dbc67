use super::{DBConnection, DBError, SharedDb};
use crate::access::filter::{readable_chatbots, readable_chunks};
use crate::access::policy::{PRINCIPAL_SETTING, READER_ROLE};
use crate::access::Principal;
use crate::models::chatbot_permissions::{ChatbotPermission, NewChatbotPermission};
use crate::models::chatbots::{Chatbot, NewChatbot, Visibility};
use crate::models::document_chunks::{ChunkCommit, DocumentChunk, NewDocumentChunk};
use crate::models::documents::{Document, NewDocument};
use crate::models::ingestion_jobs::{IngestionJob, NewIngestionJob};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::Text;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct PostgresConnection {
    db: PgPool,
}

impl PostgresConnection {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, DBError> {
        Ok(self.db.get()?)
    }

    /// Runs `f` in a transaction as the read-path role with the principal bound for
    /// row-level security. Rows the principal cannot read are invisible to `f`.
    fn with_principal<T, F>(&self, principal: &Principal, f: F) -> Result<T, DBError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, DBError>,
    {
        let mut conn = self.conn()?;
        conn.transaction::<T, DBError, _>(|conn| {
            diesel::sql_query(format!("SET LOCAL ROLE {READER_ROLE}")).execute(conn)?;
            diesel::sql_query("SELECT set_config($1, $2, true)")
                .bind::<Text, _>(PRINCIPAL_SETTING)
                .bind::<Text, _>(principal.user_id.to_string())
                .execute(conn)?;
            f(conn)
        })
    }
}

pub fn setup_db(url: &str) -> Result<SharedDb, DBError> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder()
        .test_on_check_out(true)
        .build(manager)
        .map_err(|e| DBError::MigrationError(format!("could not build pool: {e}")))?;

    {
        let mut conn = pool.get()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| DBError::MigrationError(e.to_string()))?;
        info!("Applied {} pending migrations", applied.len());
    }

    Ok(Arc::new(PostgresConnection::new(pool)))
}

impl DBConnection for PostgresConnection {
    fn create_chatbot(&self, new_chatbot: NewChatbot) -> Result<Chatbot, DBError> {
        debug!("Creating chatbot for owner {}", new_chatbot.owner_id);
        let conn = &mut self.conn()?;
        Ok(new_chatbot.insert(conn)?)
    }

    fn get_chatbot_by_id(&self, id: i64) -> Result<Option<Chatbot>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chatbot::get_by_id(conn, id)?)
    }

    fn get_chatbot_by_uuid(&self, uuid: Uuid) -> Result<Option<Chatbot>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chatbot::get_by_uuid(conn, uuid)?)
    }

    fn list_readable_chatbots(&self, principal: &Principal) -> Result<Vec<Chatbot>, DBError> {
        self.with_principal(principal, |conn| {
            Ok(Chatbot::list_filtered(conn, readable_chatbots(principal))?)
        })
    }

    fn update_chatbot_visibility(
        &self,
        chatbot_id: i64,
        visibility: Visibility,
    ) -> Result<Chatbot, DBError> {
        debug!("Setting chatbot {} visibility to {}", chatbot_id, visibility);
        let conn = &mut self.conn()?;
        Ok(Chatbot::update_visibility(conn, chatbot_id, visibility)?)
    }

    fn delete_chatbot(&self, chatbot_id: i64) -> Result<(), DBError> {
        debug!("Deleting chatbot {}", chatbot_id);
        let conn = &mut self.conn()?;
        Ok(Chatbot::delete_by_id(conn, chatbot_id)?)
    }

    fn grant_permission(
        &self,
        chatbot_id: i64,
        user_id: Uuid,
        granted_by: Uuid,
    ) -> Result<bool, DBError> {
        let conn = &mut self.conn()?;
        let created = NewChatbotPermission {
            chatbot_id,
            user_id,
            granted_by,
        }
        .insert_if_absent(conn)?;
        Ok(created)
    }

    fn revoke_permission(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError> {
        let conn = &mut self.conn()?;
        let removed = ChatbotPermission::delete_for_chatbot_and_user(conn, chatbot_id, user_id)?;
        Ok(removed > 0)
    }

    fn list_grantees(&self, chatbot_id: i64) -> Result<Vec<Uuid>, DBError> {
        let conn = &mut self.conn()?;
        Ok(ChatbotPermission::list_user_ids_for_chatbot(conn, chatbot_id)?)
    }

    fn has_grant(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError> {
        let conn = &mut self.conn()?;
        Ok(ChatbotPermission::exists(conn, chatbot_id, user_id)?)
    }

    fn create_document(&self, new_document: NewDocument) -> Result<Document, DBError> {
        debug!(
            "Creating document {} for chatbot {}",
            new_document.filename, new_document.chatbot_id
        );
        let conn = &mut self.conn()?;
        Ok(new_document.insert(conn)?)
    }

    fn get_document_by_id(&self, id: i64) -> Result<Option<Document>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Document::get_by_id(conn, id)?)
    }

    fn get_document_by_uuid(&self, uuid: Uuid) -> Result<Option<Document>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Document::get_by_uuid(conn, uuid)?)
    }

    fn delete_document(&self, id: i64) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(Document::delete_by_id(conn, id)?)
    }

    fn replace_document_chunks(
        &self,
        document_id: i64,
        chatbot_id: i64,
        fingerprint: &str,
        chunks: &[NewDocumentChunk],
    ) -> Result<ChunkCommit, DBError> {
        let conn = &mut self.conn()?;
        Ok(DocumentChunk::replace_for_document(
            conn,
            document_id,
            chatbot_id,
            fingerprint,
            chunks,
        )?)
    }

    fn get_chunk_source_hashes(&self, document_id: i64) -> Result<Vec<String>, DBError> {
        let conn = &mut self.conn()?;
        Ok(DocumentChunk::source_hashes_for_document(conn, document_id)?)
    }

    fn get_readable_chunk_by_uuid(
        &self,
        principal: &Principal,
        uuid: Uuid,
    ) -> Result<Option<DocumentChunk>, DBError> {
        self.with_principal(principal, |conn| {
            Ok(DocumentChunk::get_by_uuid(conn, readable_chunks(principal), uuid)?)
        })
    }

    fn list_readable_chunks_for_chatbot(
        &self,
        principal: &Principal,
        chatbot_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DocumentChunk>, DBError> {
        self.with_principal(principal, |conn| {
            Ok(DocumentChunk::list_for_chatbot(
                conn,
                readable_chunks(principal),
                chatbot_id,
                limit,
                offset,
            )?)
        })
    }

    fn list_readable_chunks_for_chatbots(
        &self,
        principal: &Principal,
        chatbot_ids: &[i64],
    ) -> Result<Vec<DocumentChunk>, DBError> {
        self.with_principal(principal, |conn| {
            Ok(DocumentChunk::list_for_chatbots(
                conn,
                readable_chunks(principal),
                chatbot_ids,
            )?)
        })
    }

    fn create_ingestion_job(&self, new_job: NewIngestionJob) -> Result<IngestionJob, DBError> {
        let conn = &mut self.conn()?;
        Ok(new_job.insert(conn)?)
    }

    fn get_ingestion_job_by_uuid(&self, uuid: Uuid) -> Result<Option<IngestionJob>, DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::get_by_uuid(conn, uuid)?)
    }

    fn claim_next_ingestion_job(&self, worker_id: &str) -> Result<Option<IngestionJob>, DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::claim_next(conn, worker_id)?)
    }

    fn touch_ingestion_job(&self, job_id: i64, worker_id: &str) -> Result<bool, DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::touch(conn, job_id, worker_id)?)
    }

    fn complete_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        chunk_count: i32,
    ) -> Result<IngestionJob, DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::mark_completed(conn, job_id, worker_id, chunk_count)?)
    }

    fn fail_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<IngestionJob, DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::mark_failed(conn, job_id, worker_id, error)?)
    }

    fn requeue_ingestion_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<IngestionJob, DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::requeue(conn, job_id, worker_id, error)?)
    }

    fn recover_stale_ingestion_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize), DBError> {
        let conn = &mut self.conn()?;
        Ok(IngestionJob::recover_stale(conn, cutoff)?)
    }
}
