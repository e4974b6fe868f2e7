//! Error types shared by the core crate.

use thiserror::Error;

use crate::types::JobId;

/// Errors surfaced by [`JobRegistry`](crate::registry::JobRegistry)
/// operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The job id is already registered and its result has not been
    /// delivered yet. Returned synchronously to the registering caller.
    #[error("job '{0}' is already registered and not yet delivered")]
    DuplicateJob(JobId),
}
