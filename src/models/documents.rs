use crate::models::schema::documents;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Document not found")]
    NotFound,
}

#[derive(Queryable, Selectable, Identifiable, Clone, Serialize)]
#[diesel(table_name = documents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Document {
    pub id: i64,
    pub uuid: Uuid,
    pub chatbot_id: i64,
    pub uploaded_by: Uuid,
    pub filename: String,
    pub content_type: String,
    #[serde(skip_serializing)]
    pub content: Vec<u8>,
    pub content_hash: String,
    pub byte_size: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("chatbot_id", &self.chatbot_id)
            .field("uploaded_by", &self.uploaded_by)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("content", &format_args!("<{} bytes>", self.content.len()))
            .field("content_hash", &self.content_hash)
            .finish()
    }
}

impl Document {
    pub fn get_by_id(conn: &mut PgConnection, id: i64) -> Result<Option<Document>, DocumentError> {
        documents::table
            .filter(documents::id.eq(id))
            .first::<Document>(conn)
            .optional()
            .map_err(DocumentError::DatabaseError)
    }

    pub fn get_by_uuid(
        conn: &mut PgConnection,
        uuid: Uuid,
    ) -> Result<Option<Document>, DocumentError> {
        documents::table
            .filter(documents::uuid.eq(uuid))
            .first::<Document>(conn)
            .optional()
            .map_err(DocumentError::DatabaseError)
    }

    /// Deletes the document; its chunks and jobs cascade in the database.
    pub fn delete_by_id(conn: &mut PgConnection, id: i64) -> Result<(), DocumentError> {
        let rows = diesel::delete(documents::table.filter(documents::id.eq(id)))
            .execute(conn)
            .map_err(DocumentError::DatabaseError)?;

        if rows == 0 {
            Err(DocumentError::NotFound)
        } else {
            Ok(())
        }
    }
}

#[derive(Insertable, Clone)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub uuid: Uuid,
    pub chatbot_id: i64,
    pub uploaded_by: Uuid,
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
    pub content_hash: String,
    pub byte_size: i32,
}

impl std::fmt::Debug for NewDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewDocument")
            .field("chatbot_id", &self.chatbot_id)
            .field("uploaded_by", &self.uploaded_by)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("content", &format_args!("<{} bytes>", self.content.len()))
            .finish()
    }
}

pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

impl NewDocument {
    pub fn new(
        chatbot_id: i64,
        uploaded_by: Uuid,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        NewDocument {
            uuid: Uuid::new_v4(),
            chatbot_id,
            uploaded_by,
            filename: filename.into(),
            content_type: content_type.into(),
            content_hash: content_hash(&content),
            byte_size: i32::try_from(content.len()).unwrap_or(i32::MAX),
            content,
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<Document, DocumentError> {
        diesel::insert_into(documents::table)
            .values(self)
            .get_result::<Document>(conn)
            .map_err(DocumentError::DatabaseError)
    }
}
