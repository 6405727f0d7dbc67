//! Error mapping utilities shared by the HTTP handlers.

use crate::db::DBError;
use crate::ingest::embedding::EmbeddingError;
use crate::models::chatbots::ChatbotError;
use crate::models::documents::DocumentError;
use crate::models::ingestion_jobs::IngestionJobError;
use crate::rag::RagError;
use crate::ApiError;
use tracing::error;
use validator::ValidationErrors;

pub mod error_mapping {
    use super::*;

    /// Missing rows become 404; anything else is logged and collapsed to 500.
    pub fn map_db_error(e: DBError) -> ApiError {
        match e {
            DBError::ChatbotError(ChatbotError::NotFound)
            | DBError::DocumentError(DocumentError::NotFound)
            | DBError::IngestionJobError(IngestionJobError::NotFound) => ApiError::NotFound,
            _ => {
                error!("Database error: {:?}", e);
                ApiError::InternalServerError
            }
        }
    }

    pub fn map_validation_error(e: ValidationErrors) -> ApiError {
        tracing::debug!("Request validation failed: {}", e);
        ApiError::BadRequest
    }

    /// The embedding service is an upstream dependency; callers only learn it failed.
    pub fn map_embedding_error(e: EmbeddingError) -> ApiError {
        error!("Embedding service error: {:?}", e);
        if e.is_transient() {
            ApiError::ServiceUnavailable
        } else {
            ApiError::InternalServerError
        }
    }

    pub fn map_rag_error(e: RagError) -> ApiError {
        match e {
            RagError::Embedding(e) => map_embedding_error(e),
            RagError::Database(e) => map_db_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::error_mapping::*;
    use super::*;

    #[test]
    fn not_found_rows_map_to_404() {
        assert!(matches!(
            map_db_error(DBError::ChatbotError(ChatbotError::NotFound)),
            ApiError::NotFound
        ));
        assert!(matches!(
            map_db_error(DBError::IngestionJobError(IngestionJobError::NotFound)),
            ApiError::NotFound
        ));
    }

    #[test]
    fn other_db_errors_are_internal() {
        let e = DBError::DatabaseError(diesel::result::Error::RollbackTransaction);
        assert!(matches!(map_db_error(e), ApiError::InternalServerError));
    }

    #[test]
    fn transient_embedding_errors_are_503() {
        let e = EmbeddingError::Api {
            status: 503,
            message: String::new(),
        };
        assert!(matches!(map_embedding_error(e), ApiError::ServiceUnavailable));
    }
}
