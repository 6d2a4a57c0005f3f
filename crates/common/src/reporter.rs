//! Session reporting
//!
//! Sinks receive sealed session records; rendering them into HTML, TRX or
//! Allure happens elsewhere. Every sink must accept appends from many
//! sessions at once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::record::{AttemptOutcome, SessionRecord};

/// Append-only destination for session records
pub trait ReportSink: Send + Sync {
    fn append(&self, record: &SessionRecord) -> Result<()>;
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ReportSink for MemorySink {
    fn append(&self, record: &SessionRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Writes one JSON document per line.
///
/// A line is serialized, written and flushed while the lock is held, so
/// concurrent sessions never interleave partial lines.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating parent directories as needed
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in a JSON lines file
    pub fn read_all(path: &Path) -> Result<Vec<SessionRecord>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

impl ReportSink for JsonLinesSink {
    fn append(&self, record: &SessionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Aggregate counts over a set of sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub sessions: usize,
    pub passed: usize,
    pub failed: usize,
    /// Sessions that passed after at least one unsuccessful attempt
    pub flaky: usize,
    pub attempts: usize,
    pub attempts_passed: usize,
    pub attempts_failed: usize,
    pub attempts_errored: usize,
    pub attempts_timed_out: usize,
    pub attempts_cancelled: usize,
    pub duration_ms: u64,
}

impl Summary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Process exit code for a run with these results
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }
}

/// Pure aggregation; records are only read
pub fn summarize(records: &[SessionRecord]) -> Summary {
    let mut summary = Summary {
        sessions: records.len(),
        ..Default::default()
    };

    for record in records {
        if record.passed() {
            summary.passed += 1;
            if record.attempts().len() > 1 {
                summary.flaky += 1;
            }
        } else {
            summary.failed += 1;
        }
        summary.duration_ms += record.duration_ms();

        for attempt in record.attempts() {
            summary.attempts += 1;
            match attempt.outcome() {
                AttemptOutcome::Passed => summary.attempts_passed += 1,
                AttemptOutcome::Failed => summary.attempts_failed += 1,
                AttemptOutcome::Errored => summary.attempts_errored += 1,
                AttemptOutcome::TimedOut => summary.attempts_timed_out += 1,
                AttemptOutcome::Cancelled => summary.attempts_cancelled += 1,
            }
        }
    }

    summary
}

/// Fans sealed sessions out to every configured sink
#[derive(Clone, Default)]
pub struct ResultReporter {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl ResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log the verdict and append to each sink.
    ///
    /// Every sink is attempted; the first failure is returned.
    pub fn record(&self, record: &SessionRecord) -> Result<()> {
        let attempts = record.attempts().len();
        if record.passed() {
            info!(
                "✓ {} ({} ms, {} attempt{})",
                record.test_name(),
                record.duration_ms(),
                attempts,
                if attempts == 1 { "" } else { "s" }
            );
        } else {
            error!(
                "✗ {} - {}",
                record.test_name(),
                record
                    .last_attempt()
                    .and_then(|a| a.error())
                    .unwrap_or("unknown error")
            );
        }

        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.append(record) {
                error!("Failed to report {}: {}", record.session_id(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn summarize(&self, records: &[SessionRecord]) -> Summary {
        summarize(records)
    }
}
