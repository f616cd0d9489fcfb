//! Shared vocabulary of the workspace: persisted row shapes, normalized
//! entities, job cursors, canonical ids, endpoint constants and the
//! typed error enum.

pub mod endpoints;
pub mod error;
pub mod ids;
pub mod types;
