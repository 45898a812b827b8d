pub mod cache;
pub mod converter;
pub mod jobs;
pub mod metadata;
pub mod queue;
pub mod status;
pub mod storage;
pub mod worker;
