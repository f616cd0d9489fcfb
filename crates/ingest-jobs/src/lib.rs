//! Per-entity ingestion jobs: fetch, archive, normalize, upsert, with
//! resumable cursors, date windowing and static-dataset fallback.

pub mod fallback;
pub mod jobs;
pub mod normalize;
pub mod windows;

pub use fallback::DatasetConfig;
pub use jobs::IngestJobs;
