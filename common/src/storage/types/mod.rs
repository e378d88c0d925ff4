pub mod document;
pub mod ingestion_job;
pub mod progress_event;
pub mod text_chunk;
