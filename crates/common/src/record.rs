//! Attempt and session records
//!
//! Records are created by the orchestrator and are read-only afterwards:
//! fields are private and only exposed through getters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    Failed,
    Errored,
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Passed => "passed",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Errored => "errored",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sealed verdict of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    attempt: u32,
    outcome: AttemptOutcome,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<PathBuf>,
}

impl AttemptRecord {
    pub(crate) fn new(
        attempt: u32,
        outcome: AttemptOutcome,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: Option<String>,
        warnings: Vec<String>,
        artifacts: Vec<PathBuf>,
    ) -> Self {
        Self {
            attempt,
            outcome,
            started_at,
            duration_ms,
            error,
            warnings,
            artifacts,
        }
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Teardown problems observed after the attempt ran
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    session_id: String,
    test_name: String,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    attempts: Vec<AttemptRecord>,
    final_outcome: FinalOutcome,
}

impl SessionRecord {
    /// Correlation id shared by every log line of the session
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Attempts in chronological order
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn final_outcome(&self) -> FinalOutcome {
        self.final_outcome
    }

    pub fn passed(&self) -> bool {
        self.final_outcome == FinalOutcome::Passed
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }
}

/// Mutable session under construction; only the orchestrator holds one.
#[derive(Debug)]
pub(crate) struct SessionBuilder {
    session_id: String,
    test_name: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    attempts: Vec<AttemptRecord>,
}

impl SessionBuilder {
    pub(crate) fn new(test_name: impl Into<String>) -> Self {
        Self {
            session_id: correlation_id(),
            test_name: test_name.into(),
            started_at: Utc::now(),
            clock: Instant::now(),
            attempts: Vec::new(),
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn push(&mut self, record: AttemptRecord) {
        debug_assert!(
            self.attempts
                .last()
                .map_or(true, |last| last.attempt < record.attempt),
            "attempt records must be appended in increasing order"
        );
        self.attempts.push(record);
    }

    pub(crate) fn seal(self) -> SessionRecord {
        let final_outcome = if self
            .attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::Passed)
        {
            FinalOutcome::Passed
        } else {
            FinalOutcome::Failed
        };

        SessionRecord {
            session_id: self.session_id,
            test_name: self.test_name,
            started_at: self.started_at,
            duration_ms: self.clock.elapsed().as_millis() as u64,
            attempts: self.attempts,
            final_outcome,
        }
    }
}

/// `test-<unix millis>-<8 hex chars>`
pub fn correlation_id() -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!("test-{}-{}", Utc::now().timestamp_millis(), &unique[..8])
}
