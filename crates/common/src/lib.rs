//! Trialkit Common Library
//!
//! The resource-scoped test session core shared by every trialkit suite:
//! - [`RetryPolicy`]: attempt budget, backoff schedule, retryable predicate
//! - [`ResourceLease`]: acquire once, release exactly once on every exit path
//! - [`SessionOrchestrator`]: acquire -> run -> release, retrying per policy
//! - [`ResultReporter`]: fan sealed [`SessionRecord`]s out to report sinks

pub mod artifacts;
pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod orchestrator;
pub mod record;
pub mod reporter;
pub mod retry;

// Re-export commonly used types
pub use artifacts::ArtifactLayout;
pub use config::HarnessConfig;
pub use error::{AcquisitionError, AttemptError, BodyError, Error, ReleaseError, Result};
pub use lease::{LeaseState, Resource, ResourceLease};
pub use orchestrator::{
    body_fn, AttemptContext, FnBody, OrchestratorState, SessionOrchestrator, TestBody,
};
pub use record::{AttemptOutcome, AttemptRecord, FinalOutcome, SessionRecord};
pub use reporter::{summarize, JsonLinesSink, MemorySink, ReportSink, ResultReporter, Summary};
pub use retry::RetryPolicy;

/// Trialkit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use tokio_util::sync::CancellationToken;
