//! Proximity Dispatch
//!
//! Assigns a field technician to a customer request:
//! - Driving distance via a routing-provider fallback chain
//! - Nearest-first shortlist with concurrent resolution
//! - Model-based arbitration with a deterministic fallback
//! - Atomic, conflict-checked assignment commits

pub mod arbiter;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod distance;
pub mod error;
pub mod models;
pub mod ranker;
pub mod store;

// Re-exports for convenience
pub use arbiter::{LLMProvider, SelectionArbiter};
pub use config::DispatchConfig;
pub use coordinator::AssignmentCoordinator;
pub use dispatch::Dispatcher;
pub use distance::{DistanceProvider, DistanceResolver};
pub use error::{DispatchError, DispatchResult};
pub use ranker::CandidateRanker;
pub use store::{DispatchStore, SqliteDispatchStore};
