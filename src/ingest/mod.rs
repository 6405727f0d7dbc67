//! Asynchronous document ingestion: chunking, embedding, atomic commit, and the
//! worker pool that drives it from the job queue.

pub mod chunker;
pub mod embedding;
pub mod pipeline;
pub mod queue;
pub mod worker;

pub use pipeline::{IngestionPipeline, SegmentRetry};
pub use queue::IngestionQueue;
pub use worker::{spawn_workers, WorkerSettings};
