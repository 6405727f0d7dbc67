use crate::models::schema::{document_chunks, documents};
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::Bool;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Source document no longer exists")]
    DocumentMissing,
}

/// Rows per INSERT. Postgres allows 65535 bind parameters per statement and each
/// chunk row binds one per column.
pub const INSERT_BATCH_ROWS: usize = 1000;

pub type ChunkFilter = Box<dyn BoxableExpression<document_chunks::table, Pg, SqlType = Bool>>;

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = document_chunks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DocumentChunk {
    pub id: i64,
    pub uuid: Uuid,
    pub chatbot_id: i64,
    pub document_id: i64,
    pub chunk_index: i32,
    pub content: String,
    #[serde(skip_serializing)]
    pub embedding: Vec<u8>,
    pub embedding_model: String,
    pub vector_dim: i32,
    pub token_count: i32,
    #[serde(skip_serializing)]
    pub source_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = document_chunks)]
pub struct NewDocumentChunk {
    pub uuid: Uuid,
    pub chatbot_id: i64,
    pub document_id: i64,
    pub chunk_index: i32,
    pub content: String,
    pub embedding: Vec<u8>,
    pub embedding_model: String,
    pub vector_dim: i32,
    pub token_count: i32,
    pub source_hash: String,
}

/// Outcome of committing a document's chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCommit {
    /// Previous chunks were deleted and this many were written.
    Replaced(usize),
    /// The stored chunk set already came from the same fingerprint; nothing was written.
    Unchanged(usize),
}

impl ChunkCommit {
    pub fn chunk_count(&self) -> usize {
        match self {
            ChunkCommit::Replaced(n) | ChunkCommit::Unchanged(n) => *n,
        }
    }
}

/// True when a stored chunk set was produced from `fingerprint` and is complete.
pub fn is_current(stored_hashes: &[String], fingerprint: &str, expected: Option<usize>) -> bool {
    if stored_hashes.is_empty() {
        return false;
    }
    if let Some(expected) = expected {
        if stored_hashes.len() != expected {
            return false;
        }
    }
    stored_hashes.iter().all(|h| h == fingerprint)
}

impl DocumentChunk {
    pub fn get_by_uuid(
        conn: &mut PgConnection,
        readable: ChunkFilter,
        uuid: Uuid,
    ) -> Result<Option<DocumentChunk>, ChunkError> {
        document_chunks::table
            .filter(readable)
            .filter(document_chunks::uuid.eq(uuid))
            .first::<DocumentChunk>(conn)
            .optional()
            .map_err(ChunkError::DatabaseError)
    }

    pub fn list_for_chatbot(
        conn: &mut PgConnection,
        readable: ChunkFilter,
        lookup_chatbot_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DocumentChunk>, ChunkError> {
        document_chunks::table
            .filter(readable)
            .filter(document_chunks::chatbot_id.eq(lookup_chatbot_id))
            .order((
                document_chunks::document_id.asc(),
                document_chunks::chunk_index.asc(),
            ))
            .limit(limit)
            .offset(offset)
            .load::<DocumentChunk>(conn)
            .map_err(ChunkError::DatabaseError)
    }

    pub fn list_for_chatbots(
        conn: &mut PgConnection,
        readable: ChunkFilter,
        chatbot_ids: &[i64],
    ) -> Result<Vec<DocumentChunk>, ChunkError> {
        document_chunks::table
            .filter(readable)
            .filter(document_chunks::chatbot_id.eq_any(chatbot_ids))
            .order(document_chunks::id.asc())
            .load::<DocumentChunk>(conn)
            .map_err(ChunkError::DatabaseError)
    }

    pub fn source_hashes_for_document(
        conn: &mut PgConnection,
        lookup_document_id: i64,
    ) -> Result<Vec<String>, ChunkError> {
        document_chunks::table
            .filter(document_chunks::document_id.eq(lookup_document_id))
            .select(document_chunks::source_hash)
            .load::<String>(conn)
            .map_err(ChunkError::DatabaseError)
    }

    /// Atomically swaps the chunk set of one document.
    ///
    /// The document row is locked first, so concurrent commits for the same document
    /// serialize in the database and a commit for a deleted document fails instead of
    /// leaving orphans. If the stored set already matches `fingerprint`, nothing changes.
    pub fn replace_for_document(
        conn: &mut PgConnection,
        document_id: i64,
        chatbot_id: i64,
        fingerprint: &str,
        chunks: &[NewDocumentChunk],
    ) -> Result<ChunkCommit, ChunkError> {
        conn.transaction::<ChunkCommit, ChunkError, _>(|conn| {
            let locked = documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::chatbot_id.eq(chatbot_id))
                .select(documents::id)
                .for_update()
                .first::<i64>(conn)
                .optional()?;

            if locked.is_none() {
                return Err(ChunkError::DocumentMissing);
            }

            let stored = Self::source_hashes_for_document(conn, document_id)?;
            if is_current(&stored, fingerprint, Some(chunks.len())) {
                return Ok(ChunkCommit::Unchanged(stored.len()));
            }

            diesel::delete(
                document_chunks::table.filter(document_chunks::document_id.eq(document_id)),
            )
            .execute(conn)?;

            let mut written = 0;
            for batch in chunks.chunks(INSERT_BATCH_ROWS) {
                written += diesel::insert_into(document_chunks::table)
                    .values(batch)
                    .execute(conn)?;
            }

            Ok(ChunkCommit::Replaced(written))
        })
    }
}
