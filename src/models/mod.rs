pub mod chatbot_permissions;
pub mod chatbots;
pub mod document_chunks;
pub mod documents;
pub mod ingestion_jobs;
pub mod schema;
