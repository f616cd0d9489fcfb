//! Durable archive: content-addressed raw payloads grouped into
//! Merkle-committed batches, anchor publishing, job cursors and
//! reconciliation reports, all in one sqlite store.

pub mod anchor;
pub mod job_state;
pub mod queries;
pub mod raw_archive;
pub mod reports;
pub mod store;

pub use anchor::AnchorPublisher;
pub use job_state::JobStateStore;
pub use raw_archive::RawArchive;
pub use store::ArchiveStore;
