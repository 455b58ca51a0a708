//! Errors surfaced to dispatch callers.
//!
//! Provider and model failures are recovered inside their components and never
//! show up here.

use thiserror::Error;

use crate::models::{CustomerId, SkippedCandidate, TechnicianId};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Customer {0} not found")]
    CustomerNotFound(CustomerId),

    #[error("Technician {0} not found")]
    TechnicianNotFound(TechnicianId),

    #[error("No free technicians available")]
    NoCandidatesAvailable,

    #[error("No technician distance could be resolved ({} skipped)", .skipped.len())]
    NoResolvableDistance { skipped: Vec<SkippedCandidate> },

    #[error("Technician {technician_id} was assigned by another request; retry the dispatch")]
    AssignmentConflict { technician_id: TechnicianId },

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    /// Whether re-running the whole dispatch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::AssignmentConflict { .. })
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
