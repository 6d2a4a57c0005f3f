//! Suite runner: every spec becomes one orchestrated session against a
//! fresh server and browser per attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use trialkit_common::{
    summarize, ArtifactLayout, AttemptContext, BodyError, HarnessConfig, JsonLinesSink,
    ReportSink, ResultReporter, RetryPolicy, SessionOrchestrator, SessionRecord, Summary,
    TestBody,
};

use crate::error::{E2eError, E2eResult};
use crate::playwright::{Browser, PlaywrightConfig, PlaywrightResource, PlaywrightSession};
use crate::server::{ServerConfig, ServerHandle, ServerResource};
use crate::spec::TestSpec;

/// Opened in this order for every attempt, closed in reverse
pub type SuiteResources = (Arc<ServerResource>, Arc<PlaywrightResource>);

/// One JSON line per finished session, under the reports directory
pub const SESSIONS_FILE: &str = "sessions.jsonl";

/// Suite summary, under the reports directory
pub const RESULTS_FILE: &str = "test-results.json";

/// Runs a spec's steps against the attempt's server and browser
pub struct SpecBody {
    spec: TestSpec,
}

impl SpecBody {
    pub fn new(spec: TestSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl TestBody<(ServerHandle, PlaywrightSession)> for SpecBody {
    async fn run(
        &self,
        handle: &(ServerHandle, PlaywrightSession),
        ctx: &AttemptContext,
    ) -> Result<(), BodyError> {
        let (server, browser) = handle;
        let report = browser
            .run_steps(
                server.base_url(),
                &self.spec.name,
                ctx.attempt(),
                self.spec.viewport,
                &self.spec.steps,
            )
            .await?;

        for screenshot in &report.screenshots {
            ctx.attach_artifact(screenshot.clone());
        }

        match report.failure {
            Some(failure) => Err(BodyError::assertion(format!(
                "step {} ({}) failed: {}",
                failure.step + 1,
                failure.label,
                failure.error
            ))),
            None => Ok(()),
        }
    }
}

/// Result of running a set of specs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary: Summary,
    pub sessions: Vec<SessionRecord>,

    /// Sessions a sink failed to record; the sessions themselves are kept
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub report_errors: Vec<String>,
}

impl SuiteResult {
    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }
}

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub harness: HarnessConfig,
    pub server: ServerConfig,
    pub playwright: PlaywrightConfig,
    pub specs_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            harness: HarnessConfig::default(),
            server: ServerConfig::default(),
            playwright: PlaywrightConfig::default(),
            specs_dir: PathBuf::from("tests/specs"),
        }
    }
}

impl RunnerConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> E2eResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Harness overrides plus the browser-side variables: `BASE_URL`,
    /// `DEFAULT_TIMEOUT`, `NAVIGATION_TIMEOUT` (ms), `BROWSER`, `HEADLESS`
    /// and `SPECS_DIR`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> E2eResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.harness.apply_overrides(&lookup)?;

        if let Some(url) = lookup("BASE_URL") {
            self.server.base_url = url;
        }
        if let Some(ms) = lookup("DEFAULT_TIMEOUT") {
            self.playwright.action_timeout_ms = parse_var("DEFAULT_TIMEOUT", &ms)?;
        }
        if let Some(ms) = lookup("NAVIGATION_TIMEOUT") {
            self.playwright.navigation_timeout_ms = parse_var("NAVIGATION_TIMEOUT", &ms)?;
        }
        if let Some(browser) = lookup("BROWSER") {
            self.playwright.browser = browser.parse::<Browser>()?;
        }
        if let Some(headless) = lookup("HEADLESS") {
            self.playwright.headless = parse_var("HEADLESS", &headless.to_ascii_lowercase())?;
        }
        if let Some(dir) = lookup("SPECS_DIR") {
            self.specs_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> E2eResult<T> {
    value.trim().parse().map_err(|_| {
        E2eError::Harness(trialkit_common::Error::InvalidConfig(format!(
            "{} has an invalid value: {}",
            name, value
        )))
    })
}

/// Main browser test runner
pub struct TestRunner {
    config: RunnerConfig,
    layout: ArtifactLayout,
    resources: Arc<SuiteResources>,
    reporter: ResultReporter,
    cancel: CancellationToken,
}

impl TestRunner {
    /// Create a test runner with default configuration
    pub fn new() -> E2eResult<Self> {
        Self::with_config(RunnerConfig::default())
    }

    /// Prepare the artifact directories and the session log.
    pub fn with_config(config: RunnerConfig) -> E2eResult<Self> {
        config.harness.validate()?;

        let layout = ArtifactLayout::from_config(&config.harness.artifacts);
        layout.prepare()?;

        let sessions = JsonLinesSink::create(layout.reports().join(SESSIONS_FILE))?;
        let server = ServerResource::new(config.server.clone())?;
        let browser = PlaywrightResource::new(config.playwright.clone(), layout.screenshots());

        Ok(Self {
            layout,
            resources: Arc::new((Arc::new(server), Arc::new(browser))),
            reporter: ResultReporter::new().with_sink(Arc::new(sessions)),
            cancel: CancellationToken::new(),
            config,
        })
    }

    /// Report every session to `sink` as well
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.reporter = self.reporter.with_sink(sink);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Token that stops every running and pending session once cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the current run. One-shot: every later run on this runner
    /// records its sessions as cancelled without acquiring anything.
    pub fn cancel(&self) {
        info!("Cancelling test run");
        self.cancel.cancel();
    }

    /// Run all tests in the specs directory
    pub async fn run_all(&self) -> E2eResult<SuiteResult> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;
        self.run_specs(&specs).await
    }

    /// Run tests matching a tag
    pub async fn run_tagged(&self, tag: &str) -> E2eResult<SuiteResult> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;
        let filtered: Vec<TestSpec> = specs.into_iter().filter(|s| s.has_tag(tag)).collect();
        self.run_specs(&filtered).await
    }

    /// Run a specific test by name
    pub async fn run_test(&self, name: &str) -> E2eResult<SessionRecord> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;
        let spec = specs
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| E2eError::TestNotFound(name.to_string()))?;

        self.run_spec(&spec).await
    }

    /// Run specs with up to `parallel.max_workers` sessions at once.
    ///
    /// Every spec's retry settings are checked before the first session
    /// starts. Sessions come back in spec order.
    pub async fn run_specs(&self, specs: &[TestSpec]) -> E2eResult<SuiteResult> {
        let start = Instant::now();
        let orchestrators = specs
            .iter()
            .map(|spec| self.orchestrator(spec))
            .collect::<E2eResult<Vec<_>>>()?;

        let workers = self.config.harness.parallel.max_workers.max(1);
        info!("Running {} test(s) with {} worker(s)...", specs.len(), workers);

        let results: Vec<(SessionRecord, Option<String>)> =
            stream::iter(specs.iter().zip(orchestrators))
                .map(|(spec, orchestrator)| self.execute(spec, orchestrator))
                .buffered(workers)
                .collect()
                .await;
        let (sessions, report_errors): (Vec<_>, Vec<_>) = results.into_iter().unzip();
        let report_errors: Vec<String> = report_errors.into_iter().flatten().collect();

        let summary = summarize(&sessions);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!("");
        info!(
            "Test Results: {} passed, {} failed, {} flaky ({} ms)",
            summary.passed, summary.failed, summary.flaky, duration_ms
        );

        Ok(SuiteResult {
            generated_at: Utc::now(),
            duration_ms,
            summary,
            sessions,
            report_errors,
        })
    }

    /// Run a single test spec.
    ///
    /// A sink that fails to record the session is logged; the record is
    /// still returned.
    pub async fn run_spec(&self, spec: &TestSpec) -> E2eResult<SessionRecord> {
        let orchestrator = self.orchestrator(spec)?;
        let (record, _) = self.execute(spec, orchestrator).await;
        Ok(record)
    }

    /// Write the suite result as pretty JSON
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        let dir = self.layout.reports();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(RESULTS_FILE);
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }

    fn orchestrator(&self, spec: &TestSpec) -> E2eResult<SessionOrchestrator<SuiteResources>> {
        let policy = RetryPolicy::from_config(&spec.retry_config(&self.config.harness.retry))
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", spec.name, e)))?;

        let mut orchestrator = SessionOrchestrator::shared(Arc::clone(&self.resources), policy)
            .with_timeouts(&self.config.harness.timeouts);
        if let Some(limit) = spec.attempt_timeout() {
            orchestrator = orchestrator.with_attempt_timeout(limit);
        }
        Ok(orchestrator)
    }

    async fn execute(
        &self,
        spec: &TestSpec,
        orchestrator: SessionOrchestrator<SuiteResources>,
    ) -> (SessionRecord, Option<String>) {
        debug!("Running test: {}", spec.name);
        let body = SpecBody::new(spec.clone());
        let record = orchestrator
            .run_until_cancelled(&spec.name, &body, &self.cancel)
            .await;
        // The reporter has already logged the failure
        let report_error = self
            .reporter
            .record(&record)
            .err()
            .map(|e| format!("{}: {}", record.test_name(), e));
        (record, report_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use trialkit_common::AttemptOutcome;

    fn write_spec(dir: &std::path::Path, file: &str, name: &str, tags: &[&str]) {
        let yaml = format!(
            "name: {}\ntags: [{}]\nsteps:\n  - action: navigate\n    url: /\n",
            name,
            tags.join(", ")
        );
        std::fs::write(dir.join(file), yaml).unwrap();
    }

    fn runner(root: &std::path::Path) -> TestRunner {
        let mut config = RunnerConfig::default();
        config.harness.artifacts.path = root.join("results");
        config.specs_dir = root.join("specs");
        config.playwright.verify_install = false;
        std::fs::create_dir_all(&config.specs_dir).unwrap();
        TestRunner::with_config(config).unwrap()
    }

    #[test]
    fn test_overrides_reach_every_layer() {
        let vars: HashMap<&str, &str> = [
            ("MAX_RETRIES", "2"),
            ("BASE_URL", "https://staging.example.com"),
            ("DEFAULT_TIMEOUT", "15000"),
            ("BROWSER", "firefox"),
            ("HEADLESS", "False"),
            ("SPECS_DIR", "suites/smoke"),
        ]
        .into_iter()
        .collect();

        let mut config = RunnerConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.harness.retry.max_attempts, 3);
        assert_eq!(config.server.base_url, "https://staging.example.com");
        assert_eq!(config.playwright.action_timeout_ms, 15000);
        assert_eq!(config.playwright.browser, Browser::Firefox);
        assert!(!config.playwright.headless);
        assert_eq!(config.specs_dir, PathBuf::from("suites/smoke"));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = RunnerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "NAVIGATION_TIMEOUT").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("NAVIGATION_TIMEOUT"));
    }

    #[tokio::test]
    async fn test_unknown_test_name() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        write_spec(&dir.path().join("specs"), "a.yaml", "alpha", &[]);

        let err = runner.run_test("omega").await.unwrap_err();
        assert!(matches!(err, E2eError::TestNotFound(name) if name == "omega"));
    }

    #[tokio::test]
    async fn test_invalid_spec_retry_fails_before_any_session() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let yaml =
            "name: broken\nretry:\n  max_attempts: 0\nsteps:\n  - action: log\n    message: hi\n";
        std::fs::write(dir.path().join("specs").join("broken.yaml"), yaml).unwrap();

        let err = runner.run_all().await.unwrap_err();
        assert!(matches!(err, E2eError::SpecParse(_)));
        let log = runner.layout().reports().join(SESSIONS_FILE);
        assert!(JsonLinesSink::read_all(&log).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_runner_records_without_launching() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let specs = dir.path().join("specs");
        write_spec(&specs, "01-login.yaml", "login", &["smoke"]);
        write_spec(&specs, "02-search.yml", "search", &["smoke"]);
        write_spec(&specs, "03-admin.yaml", "admin", &["slow"]);

        runner.cancel();
        let result = runner.run_tagged("smoke").await.unwrap();

        let names: Vec<&str> = result.sessions.iter().map(|s| s.test_name()).collect();
        assert_eq!(names, vec!["login", "search"]);
        for session in &result.sessions {
            assert_eq!(session.attempts().len(), 1);
            assert_eq!(session.attempts()[0].outcome(), AttemptOutcome::Cancelled);
        }
        assert_eq!(result.summary.failed, 2);
        assert_eq!(result.exit_code(), 1);

        let log = runner.layout().reports().join(SESSIONS_FILE);
        let logged = JsonLinesSink::read_all(&log).unwrap();
        assert_eq!(logged.len(), 2);

        let again = runner.run_tagged("smoke").await.unwrap();
        assert!(again
            .sessions
            .iter()
            .all(|s| s.attempts()[0].outcome() == AttemptOutcome::Cancelled));

        let path = runner.write_results(&result).unwrap();
        let back: SuiteResult =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, result);
    }

    struct DiskFull;

    impl ReportSink for DiskFull {
        fn append(&self, _record: &SessionRecord) -> trialkit_common::Result<()> {
            Err(trialkit_common::Error::Report("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_sink_keeps_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path()).with_sink(Arc::new(DiskFull));
        let specs = dir.path().join("specs");
        write_spec(&specs, "01-login.yaml", "login", &[]);
        write_spec(&specs, "02-search.yaml", "search", &[]);
        write_spec(&specs, "03-admin.yaml", "admin", &[]);

        runner.cancel();
        let result = runner.run_all().await.unwrap();

        let names: Vec<&str> = result.sessions.iter().map(|s| s.test_name()).collect();
        assert_eq!(names, vec!["login", "search", "admin"]);
        assert_eq!(result.summary.sessions, 3);
        assert_eq!(result.report_errors.len(), 3);
        assert!(result.report_errors[0].starts_with("login: "));
        assert!(result.report_errors[0].contains("disk full"));

        // The healthy sink still got every record
        let log = runner.layout().reports().join(SESSIONS_FILE);
        assert_eq!(JsonLinesSink::read_all(&log).unwrap().len(), 3);

        let record = runner.run_test("search").await.unwrap();
        assert_eq!(record.test_name(), "search");
    }
}
