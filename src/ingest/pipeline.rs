//! Turns one document into a committed chunk set.

use crate::db::{DBError, SharedDb};
use crate::ingest::chunker::{chunk_text, Segment};
use crate::ingest::embedding::{check_dimensions, serialize_f32_le, EmbeddingError, SharedEmbedder};
use crate::models::document_chunks::{is_current, ChunkCommit, ChunkError, NewDocumentChunk};
use crate::models::documents::Document;
use crate::models::ingestion_jobs::IngestionJob;
use crate::rag::SharedChunkCache;
use backoff::ExponentialBackoffBuilder;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FINGERPRINT_VERSION: &str = "v1";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Document {0} no longer exists")]
    DocumentGone(i64),
    #[error("Document is not valid UTF-8 text")]
    NotUtf8,
    #[error("Segment {index} failed: {source}")]
    Segment {
        index: usize,
        #[source]
        source: EmbeddingError,
    },
    #[error("Database error: {0}")]
    Database(#[from] DBError),
}

impl IngestError {
    /// Whether re-running the whole document may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::DocumentGone(_) | IngestError::NotUtf8 => false,
            IngestError::Segment { source, .. } => source.is_transient(),
            IngestError::Database(_) => true,
        }
    }
}

/// Backoff applied to a single segment before the attempt is given up.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRetry {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for SegmentRetry {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct IngestionPipeline {
    db: SharedDb,
    embedder: SharedEmbedder,
    chunk_cache: SharedChunkCache,
    chunk_max_tokens: usize,
    segment_retry: SegmentRetry,
}

/// Identifies the inputs a chunk set was derived from. Equal fingerprints mean a
/// re-run would produce the same chunks.
pub fn fingerprint(
    content_hash: &str,
    chunk_max_tokens: usize,
    model: &str,
    dims: usize,
) -> String {
    let inputs = format!("{FINGERPRINT_VERSION}|{content_hash}|{chunk_max_tokens}|{model}|{dims}");
    let mut hasher = Sha256::new();
    hasher.update(inputs.as_bytes());
    hex::encode(hasher.finalize())
}

impl IngestionPipeline {
    pub fn new(
        db: SharedDb,
        embedder: SharedEmbedder,
        chunk_cache: SharedChunkCache,
        chunk_max_tokens: usize,
        segment_retry: SegmentRetry,
    ) -> Self {
        Self {
            db,
            embedder,
            chunk_cache,
            chunk_max_tokens,
            segment_retry,
        }
    }

    fn fingerprint_for(&self, document: &Document) -> String {
        fingerprint(
            &document.content_hash,
            self.chunk_max_tokens,
            self.embedder.model(),
            self.embedder.dimensions(),
        )
    }

    /// Ingests the document a claimed job points at.
    ///
    /// Nothing is written until every segment is embedded; the commit then swaps the
    /// document's chunk set in one transaction, so readers see the old set or the new one.
    pub async fn run(&self, job: &IngestionJob) -> Result<ChunkCommit, IngestError> {
        let document = self
            .db
            .get_document_by_id(job.document_id)?
            .filter(|d| d.chatbot_id == job.chatbot_id)
            .ok_or(IngestError::DocumentGone(job.document_id))?;

        let fingerprint = self.fingerprint_for(&document);
        let stored = self.db.get_chunk_source_hashes(document.id)?;
        if is_current(&stored, &fingerprint, None) {
            debug!(
                "Document {} already ingested from the same content; skipping",
                document.id
            );
            return Ok(ChunkCommit::Unchanged(stored.len()));
        }

        let text = std::str::from_utf8(&document.content).map_err(|_| IngestError::NotUtf8)?;
        let segments = chunk_text(text, self.chunk_max_tokens);
        debug!(
            "Document {} split into {} segments",
            document.id,
            segments.len()
        );

        let mut chunks = Vec::with_capacity(segments.len());
        for segment in &segments {
            let vector = self.embed_segment(segment).await?;
            chunks.push(self.new_chunk(&document, segment, &vector, &fingerprint));
        }

        let commit = self
            .db
            .replace_document_chunks(document.id, document.chatbot_id, &fingerprint, &chunks)
            .map_err(|e| match e {
                DBError::ChunkError(ChunkError::DocumentMissing) => {
                    IngestError::DocumentGone(document.id)
                }
                other => IngestError::Database(other),
            })?;

        if let ChunkCommit::Replaced(n) = commit {
            self.chunk_cache
                .lock()
                .await
                .evict_chatbot(document.chatbot_id);
            info!(
                "Committed {} chunks for document {} (chatbot {})",
                n, document.id, document.chatbot_id
            );
        }
        Ok(commit)
    }

    async fn embed_segment(&self, segment: &Segment) -> Result<Vec<f32>, IngestError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.segment_retry.initial_interval)
            .with_max_interval(self.segment_retry.max_interval)
            .with_max_elapsed_time(Some(self.segment_retry.max_elapsed))
            .build();
        let dims = self.embedder.dimensions();

        backoff::future::retry_notify(
            policy,
            || async move {
                let vector = self
                    .embedder
                    .embed(&segment.content)
                    .await
                    .map_err(classify)?;
                check_dimensions(&vector, dims).map_err(backoff::Error::permanent)?;
                Ok::<_, backoff::Error<EmbeddingError>>(vector)
            },
            |err: EmbeddingError, wait: Duration| {
                warn!(
                    "Embedding segment {} failed ({}); retrying in {:?}",
                    segment.index, err, wait
                );
            },
        )
        .await
        .map_err(|source| IngestError::Segment {
            index: segment.index,
            source,
        })
    }

    fn new_chunk(
        &self,
        document: &Document,
        segment: &Segment,
        vector: &[f32],
        fingerprint: &str,
    ) -> NewDocumentChunk {
        NewDocumentChunk {
            uuid: Uuid::new_v4(),
            chatbot_id: document.chatbot_id,
            document_id: document.id,
            chunk_index: i32::try_from(segment.index).unwrap_or(i32::MAX),
            content: segment.content.clone(),
            embedding: serialize_f32_le(vector),
            embedding_model: self.embedder.model().to_string(),
            vector_dim: i32::try_from(vector.len()).unwrap_or(i32::MAX),
            token_count: i32::try_from(segment.token_count).unwrap_or(i32::MAX),
            source_hash: fingerprint.to_string(),
        }
    }
}

fn classify(err: EmbeddingError) -> backoff::Error<EmbeddingError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}
