//! Session orchestration
//!
//! One session runs a test body up to `max_attempts` times, strictly one
//! attempt after another:
//!
//! ```text
//!   Idle ──► Attempting ──► Succeeded
//!                │  ▲
//!                │  └── Retrying ◄── failure, policy allows another attempt
//!                └────► Exhausted ◄── failure, policy refuses / cancelled
//! ```
//!
//! Every attempt gets a fresh [`ResourceLease`], and the lease is released
//! before the attempt is recorded, whatever the body did.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::TimeoutConfig;
use crate::error::{AttemptError, BodyError};
use crate::lease::{Resource, ResourceLease};
use crate::record::{AttemptOutcome, AttemptRecord, SessionBuilder, SessionRecord};
use crate::retry::RetryPolicy;

/// What a test body can see about the attempt it runs in
#[derive(Debug, Clone)]
pub struct AttemptContext {
    session_id: String,
    test_name: String,
    attempt: u32,
    cancel: CancellationToken,
    artifacts: Arc<Mutex<Vec<PathBuf>>>,
}

impl AttemptContext {
    fn new(session_id: &str, test_name: &str, attempt: u32, parent: &CancellationToken) -> Self {
        Self {
            session_id: session_id.to_string(),
            test_name: test_name.to_string(),
            attempt,
            cancel: parent.child_token(),
            artifacts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Set once the attempt is being abandoned (timeout, deadline or
    /// cancellation). Work the body spawned should stop when it fires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a file produced by this attempt (screenshot, trace, log)
    pub fn attach_artifact(&self, path: impl Into<PathBuf>) {
        self.artifacts.lock().push(path.into());
    }

    fn take_artifacts(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.artifacts.lock())
    }
}

/// The test itself, run once per attempt against freshly acquired handles
#[async_trait]
pub trait TestBody<H: Send + Sync>: Send + Sync {
    async fn run(&self, handle: &H, ctx: &AttemptContext) -> Result<(), BodyError>;
}

/// Adapts a closure into a [`TestBody`]; the handle is cloned per call.
pub struct FnBody<F>(F);

pub fn body_fn<H, F, Fut>(f: F) -> FnBody<F>
where
    F: Fn(H, AttemptContext) -> Fut,
    Fut: Future<Output = Result<(), BodyError>>,
{
    FnBody(f)
}

#[async_trait]
impl<H, F, Fut> TestBody<H> for FnBody<F>
where
    H: Clone + Send + Sync + 'static,
    F: Fn(H, AttemptContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BodyError>> + Send + 'static,
{
    async fn run(&self, handle: &H, ctx: &AttemptContext) -> Result<(), BodyError> {
        (self.0)(handle.clone(), ctx.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Attempting,
    Retrying,
    Succeeded,
    Exhausted,
}

impl OrchestratorState {
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Idle, Attempting)
                | (Idle, Exhausted)
                | (Attempting, Succeeded)
                | (Attempting, Retrying)
                | (Attempting, Exhausted)
                | (Retrying, Attempting)
                | (Retrying, Exhausted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrchestratorState::Succeeded | OrchestratorState::Exhausted)
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Attempt that has run but whose record is not committed yet; a
/// cancellation during the following retry wait still changes its outcome.
struct PendingAttempt {
    attempt: u32,
    started_at: DateTime<Utc>,
    duration: Duration,
    error: Option<AttemptError>,
    warnings: Vec<String>,
    artifacts: Vec<PathBuf>,
}

impl PendingAttempt {
    fn into_record(self, interrupted_by: Option<AttemptError>) -> AttemptRecord {
        let (outcome, error) = match (interrupted_by, self.error) {
            (Some(interrupt), Some(original)) => (
                interrupt.outcome(),
                Some(format!("{} (while retrying after: {})", interrupt, original)),
            ),
            (Some(interrupt), None) => (interrupt.outcome(), Some(interrupt.to_string())),
            (None, Some(err)) => (err.outcome(), Some(err.to_string())),
            (None, None) => (AttemptOutcome::Passed, None),
        };

        AttemptRecord::new(
            self.attempt,
            outcome,
            self.started_at,
            self.duration.as_millis() as u64,
            error,
            self.warnings,
            self.artifacts,
        )
    }
}

enum Next {
    Succeeded,
    Retry,
    Exhausted,
}

/// Runs test bodies against one resource (or tuple of resources) under a
/// shared retry policy. Cheap to share: every run owns its own state.
pub struct SessionOrchestrator<R: Resource> {
    resource: Arc<R>,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
    session_timeout: Option<Duration>,
}

impl<R: Resource> SessionOrchestrator<R> {
    pub fn new(resource: R, policy: RetryPolicy) -> Self {
        Self::shared(Arc::new(resource), policy)
    }

    pub fn shared(resource: Arc<R>, policy: RetryPolicy) -> Self {
        Self {
            resource,
            policy,
            attempt_timeout: None,
            session_timeout: None,
        }
    }

    /// Limit each attempt, acquisition included
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Limit the whole session, retry waits included
    pub fn with_session_timeout(mut self, limit: Duration) -> Self {
        self.session_timeout = Some(limit);
        self
    }

    pub fn with_timeouts(mut self, timeouts: &TimeoutConfig) -> Self {
        self.attempt_timeout = timeouts.attempt();
        self.session_timeout = timeouts.session();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    pub async fn run<B>(&self, test_name: &str, body: &B) -> SessionRecord
    where
        B: TestBody<R::Handle> + ?Sized,
    {
        self.run_until_cancelled(test_name, body, &CancellationToken::new())
            .await
    }

    /// Run a session that stops early once `cancel` fires
    pub async fn run_until_cancelled<B>(
        &self,
        test_name: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> SessionRecord
    where
        B: TestBody<R::Handle> + ?Sized,
    {
        let session = SessionBuilder::new(test_name);
        let span = info_span!(
            "session",
            test = %test_name,
            correlation_id = %session.session_id()
        );
        self.drive(session, test_name, body, cancel)
            .instrument(span)
            .await
    }

    async fn drive<B>(
        &self,
        mut session: SessionBuilder,
        test_name: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> SessionRecord
    where
        B: TestBody<R::Handle> + ?Sized,
    {
        let deadline = self.session_timeout.map(|limit| Deadline {
            at: Instant::now() + limit,
            limit,
        });
        let mut state = OrchestratorState::Idle;

        if let Some(interrupt) = interruption(cancel, deadline) {
            warn!("Session interrupted before the first attempt: {}", interrupt);
            session.push(AttemptRecord::new(
                1,
                interrupt.outcome(),
                Utc::now(),
                0,
                Some(interrupt.to_string()),
                Vec::new(),
                Vec::new(),
            ));
            transition(&mut state, OrchestratorState::Exhausted);
            return session.seal();
        }

        let mut attempt = 1;
        loop {
            transition(&mut state, OrchestratorState::Attempting);
            let ctx = AttemptContext::new(session.session_id(), test_name, attempt, cancel);
            let pending = self.attempt(ctx, body, cancel, deadline).await;

            let next = match &pending.error {
                None => Next::Succeeded,
                Some(err) if err.is_interrupt() => Next::Exhausted,
                Some(err) if self.policy.should_retry(attempt, err) => Next::Retry,
                Some(_) => Next::Exhausted,
            };

            match next {
                Next::Succeeded => {
                    info!("Attempt {} passed", attempt);
                    session.push(pending.into_record(None));
                    transition(&mut state, OrchestratorState::Succeeded);
                    break;
                }
                Next::Exhausted => {
                    if let Some(err) = &pending.error {
                        warn!("Attempt {} {}: {}; giving up", attempt, err.outcome(), err);
                    }
                    session.push(pending.into_record(None));
                    transition(&mut state, OrchestratorState::Exhausted);
                    break;
                }
                Next::Retry => {
                    transition(&mut state, OrchestratorState::Retrying);
                    let delay = self.policy.delay_before_attempt(attempt + 1);
                    if let Some(err) = &pending.error {
                        warn!(
                            "Attempt {}/{} {}: {}; retrying in {:?}",
                            attempt,
                            self.policy.max_attempts(),
                            err.outcome(),
                            err,
                            delay
                        );
                    }

                    if let Err(interrupt) = wait(delay, cancel, deadline).await {
                        warn!("Retry wait interrupted: {}", interrupt);
                        session.push(pending.into_record(Some(interrupt)));
                        transition(&mut state, OrchestratorState::Exhausted);
                        break;
                    }
                    session.push(pending.into_record(None));
                    attempt += 1;
                }
            }
        }

        session.seal()
    }

    async fn attempt<B>(
        &self,
        ctx: AttemptContext,
        body: &B,
        cancel: &CancellationToken,
        deadline: Option<Deadline>,
    ) -> PendingAttempt
    where
        B: TestBody<R::Handle> + ?Sized,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut lease = ResourceLease::new(Arc::clone(&self.resource));
        debug!("Attempt {} started", ctx.attempt());

        let run = async {
            let handle = lease.acquire().await?;
            body.run(handle, &ctx).await?;
            Ok::<(), AttemptError>(())
        };
        let result = self.guard(run, cancel, deadline).await;
        let duration = clock.elapsed();

        // Anything the body left running must stop before teardown.
        ctx.cancel.cancel();

        let mut warnings = Vec::new();
        if let Err(e) = lease.release().await {
            warnings.push(e.to_string());
        }

        PendingAttempt {
            attempt: ctx.attempt(),
            started_at,
            duration,
            error: result.err(),
            warnings,
            artifacts: ctx.take_artifacts(),
        }
    }

    async fn guard<F>(
        &self,
        run: F,
        cancel: &CancellationToken,
        deadline: Option<Deadline>,
    ) -> Result<(), AttemptError>
    where
        F: Future<Output = Result<(), AttemptError>>,
    {
        let attempt_timeout = self.attempt_timeout;
        let timer = async move {
            match attempt_timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            limit = until(deadline) => Err(AttemptError::Deadline(limit)),
            limit = timer => Err(AttemptError::Timeout(limit)),
            result = run => result,
        }
    }
}

fn transition(state: &mut OrchestratorState, next: OrchestratorState) {
    debug_assert!(
        state.can_transition_to(next),
        "invalid orchestrator transition {:?} -> {:?}",
        state,
        next
    );
    debug!("{:?} -> {:?}", state, next);
    *state = next;
}

fn interruption(cancel: &CancellationToken, deadline: Option<Deadline>) -> Option<AttemptError> {
    if cancel.is_cancelled() {
        return Some(AttemptError::Cancelled);
    }
    match deadline {
        Some(d) if Instant::now() >= d.at => Some(AttemptError::Deadline(d.limit)),
        _ => None,
    }
}

async fn until(deadline: Option<Deadline>) -> Duration {
    match deadline {
        Some(d) => {
            tokio::time::sleep_until(d.at).await;
            d.limit
        }
        None => std::future::pending().await,
    }
}

/// Retry backoff; only this session is suspended.
async fn wait(
    delay: Duration,
    cancel: &CancellationToken,
    deadline: Option<Deadline>,
) -> Result<(), AttemptError> {
    if let Some(interrupt) = interruption(cancel, deadline) {
        return Err(interrupt);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AttemptError::Cancelled),
        limit = until(deadline) => Err(AttemptError::Deadline(limit)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
