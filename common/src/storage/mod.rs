pub mod job_store;
pub mod types;
pub mod vector_store;
