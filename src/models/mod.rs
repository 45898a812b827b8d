pub mod api;
pub mod job;
pub mod metadata;
pub mod snapshot;
pub mod task;
