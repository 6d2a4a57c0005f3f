//! Session-level behaviour of the orchestrator: attempt counts, lease
//! accounting, timeouts, cancellation and concurrent reporting.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use trialkit_common::retry::{retry_none, skip_timeouts};
use trialkit_common::{
    body_fn, AcquisitionError, AttemptContext, AttemptOutcome, BodyError, CancellationToken,
    FinalOutcome, MemorySink, ReleaseError, Resource, ResultReporter, RetryPolicy,
    SessionOrchestrator, TestBody,
};

/// Counts opens and closes; can be told to fail either
#[derive(Default)]
struct Tracked {
    opens: AtomicU32,
    closes: AtomicU32,
    fail_opens_until: u32,
    fail_close: bool,
}

impl Tracked {
    fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for Tracked {
    type Handle = u32;

    fn name(&self) -> String {
        "tracked".to_string()
    }

    async fn open(&self) -> Result<u32, AcquisitionError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_opens_until {
            return Err(AcquisitionError::new("tracked", format!("open #{} refused", n)));
        }
        Ok(n)
    }

    async fn close(&self, _handle: u32) -> Result<(), ReleaseError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(ReleaseError::new("tracked", "browser would not exit"));
        }
        Ok(())
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(1))
        .build()
        .unwrap()
}

fn failing_until(k: u32) -> impl TestBody<u32> {
    body_fn(move |_: u32, ctx: AttemptContext| async move {
        if ctx.attempt() < k {
            Err(BodyError::assertion(format!("attempt {} not yet", ctx.attempt())))
        } else {
            Ok(())
        }
    })
}

/// Opens only after the attempt has long been abandoned
struct Stalled;

#[async_trait]
impl Resource for Stalled {
    type Handle = ();

    fn name(&self) -> String {
        "stalled".to_string()
    }

    async fn open(&self) -> Result<(), AcquisitionError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn close(&self, _handle: ()) -> Result<(), ReleaseError> {
        Ok(())
    }
}

/// Gives background releases a chance to finish
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

struct Detached;

#[async_trait]
impl TestBody<u32> for Detached {
    async fn run(&self, _handle: &u32, _ctx: &AttemptContext) -> Result<(), BodyError> {
        Err(BodyError::error("element handle detached"))
    }
}

#[tokio::test]
async fn always_failing_body_uses_every_attempt() {
    for n in 1..=4 {
        let orchestrator = SessionOrchestrator::new(Tracked::default(), policy(n));
        let record = orchestrator.run("always-fails", &failing_until(u32::MAX)).await;

        assert_eq!(record.attempts().len(), n as usize);
        assert!(record
            .attempts()
            .iter()
            .all(|a| a.outcome() == AttemptOutcome::Failed));
        assert_eq!(record.final_outcome(), FinalOutcome::Failed);
    }
}

#[tokio::test]
async fn stops_on_first_success() {
    for k in 1..=5 {
        let orchestrator = SessionOrchestrator::new(Tracked::default(), policy(5));
        let record = orchestrator.run("eventually", &failing_until(k)).await;

        assert_eq!(record.attempts().len(), k as usize);
        assert_eq!(record.final_outcome(), FinalOutcome::Passed);
        let numbers: Vec<u32> = record.attempts().iter().map(|a| a.attempt()).collect();
        assert_eq!(numbers, (1..=k).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn every_acquire_is_released_once_even_when_body_errors() {
    let resource = Arc::new(Tracked::default());
    let orchestrator = SessionOrchestrator::shared(Arc::clone(&resource), policy(3));

    let record = orchestrator.run("errors", &Detached).await;

    assert_eq!(record.attempts().len(), 3);
    assert!(record
        .attempts()
        .iter()
        .all(|a| a.outcome() == AttemptOutcome::Errored));
    assert_eq!(resource.opens(), 3);
    assert_eq!(resource.closes(), 3);
}

#[tokio::test]
async fn acquisition_failure_is_a_retryable_attempt_failure() {
    let resource = Arc::new(Tracked {
        fail_opens_until: 2,
        ..Default::default()
    });
    let orchestrator = SessionOrchestrator::shared(Arc::clone(&resource), policy(3));

    let record = orchestrator.run("cold-start", &failing_until(0)).await;

    let outcomes: Vec<AttemptOutcome> = record.attempts().iter().map(|a| a.outcome()).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Errored, AttemptOutcome::Errored, AttemptOutcome::Passed]
    );
    assert!(record.attempts()[0]
        .error()
        .unwrap()
        .contains("failed to acquire tracked"));
    // Failed opens never reached Acquired, so only the successful one closes.
    assert_eq!(resource.closes(), 1);
}

#[tokio::test]
async fn acquisition_failure_on_last_attempt_fails_session() {
    let resource = Tracked {
        fail_opens_until: u32::MAX,
        ..Default::default()
    };
    let record = SessionOrchestrator::new(resource, policy(2))
        .run("never-opens", &failing_until(0))
        .await;

    assert_eq!(record.attempts().len(), 2);
    assert_eq!(record.final_outcome(), FinalOutcome::Failed);
}

#[tokio::test]
async fn non_retryable_error_stops_after_one_attempt() {
    let policy = RetryPolicy::builder()
        .max_attempts(5)
        .retryable(retry_none())
        .build()
        .unwrap();
    let record = SessionOrchestrator::new(Tracked::default(), policy)
        .run("fatal", &failing_until(u32::MAX))
        .await;

    assert_eq!(record.attempts().len(), 1);
    assert_eq!(record.final_outcome(), FinalOutcome::Failed);
}

#[tokio::test]
async fn teardown_failure_never_masks_a_pass() {
    let resource = Tracked {
        fail_close: true,
        ..Default::default()
    };
    let record = SessionOrchestrator::new(resource, policy(3))
        .run("leaky", &failing_until(0))
        .await;

    assert_eq!(record.final_outcome(), FinalOutcome::Passed);
    let attempt = &record.attempts()[0];
    assert_eq!(attempt.outcome(), AttemptOutcome::Passed);
    assert_eq!(attempt.error(), None);
    assert_eq!(attempt.warnings().len(), 1);
    assert!(attempt.warnings()[0].contains("browser would not exit"));
}

#[tokio::test]
async fn backoff_delays_are_observed() {
    let policy = RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(40))
        .backoff_multiplier(2.0)
        .build()
        .unwrap();
    let orchestrator = SessionOrchestrator::new((), policy);
    let body = body_fn(|_: (), _ctx| async { Err(BodyError::assertion("still broken")) });

    let start = Instant::now();
    let record = orchestrator.run("slow-retry", &body).await;

    assert_eq!(record.attempts().len(), 3);
    // 40ms before attempt 2, 80ms before attempt 3
    assert!(start.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn attempt_timeout_is_recorded_and_released() {
    let resource = Arc::new(Tracked::default());
    let policy = RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(1))
        .retryable(skip_timeouts())
        .build()
        .unwrap();
    let orchestrator = SessionOrchestrator::shared(Arc::clone(&resource), policy)
        .with_attempt_timeout(Duration::from_millis(20));
    let body = body_fn(|_: u32, _ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    });

    let record = orchestrator.run("hangs", &body).await;

    assert_eq!(record.attempts().len(), 1);
    assert_eq!(record.attempts()[0].outcome(), AttemptOutcome::TimedOut);
    assert_eq!(resource.opens(), 1);
    assert_eq!(resource.closes(), 1);
}

#[tokio::test]
async fn attempt_timeout_while_second_resource_opens_releases_first() {
    let server = Arc::new(Tracked::default());
    let orchestrator =
        SessionOrchestrator::new((Arc::clone(&server), Arc::new(Stalled)), policy(1))
            .with_attempt_timeout(Duration::from_millis(20));
    let body = body_fn(|_: (u32, ()), _ctx| async { Ok(()) });

    let record = orchestrator.run("slow-browser", &body).await;
    settle().await;

    assert_eq!(record.attempts()[0].outcome(), AttemptOutcome::TimedOut);
    assert_eq!(server.opens(), 1);
    assert_eq!(server.closes(), 1);
}

#[tokio::test]
async fn cancellation_while_second_resource_opens_releases_first() {
    let server = Arc::new(Tracked::default());
    let orchestrator =
        SessionOrchestrator::new((Arc::clone(&server), Arc::new(Stalled)), policy(3));
    let cancel = CancellationToken::new();
    let body = body_fn(|_: (u32, ()), _ctx| async { Ok(()) });

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let record = orchestrator
        .run_until_cancelled("slow-browser", &body, &cancel)
        .await;
    settle().await;

    assert_eq!(record.attempts().len(), 1);
    assert_eq!(record.attempts()[0].outcome(), AttemptOutcome::Cancelled);
    assert_eq!(server.opens(), 1);
    assert_eq!(server.closes(), 1);
}

#[tokio::test]
async fn timeouts_can_be_retried_when_policy_allows() {
    let orchestrator = SessionOrchestrator::new((), policy(2))
        .with_attempt_timeout(Duration::from_millis(20));
    let body = body_fn(|_: (), ctx: AttemptContext| async move {
        if ctx.attempt() == 1 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(())
    });

    let record = orchestrator.run("slow-first", &body).await;
    let outcomes: Vec<AttemptOutcome> = record.attempts().iter().map(|a| a.outcome()).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::TimedOut, AttemptOutcome::Passed]);
}

#[tokio::test]
async fn cancellation_during_attempt_releases_and_stops() {
    let resource = Arc::new(Tracked::default());
    let orchestrator = SessionOrchestrator::shared(Arc::clone(&resource), policy(5));
    let cancel = CancellationToken::new();
    let body = body_fn(|_: u32, _ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    });

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let record = orchestrator
        .run_until_cancelled("cancelled", &body, &cancel)
        .await;

    assert_eq!(record.attempts().len(), 1);
    assert_eq!(record.attempts()[0].outcome(), AttemptOutcome::Cancelled);
    assert_eq!(record.final_outcome(), FinalOutcome::Failed);
    assert_eq!(resource.closes(), 1);
}

#[tokio::test]
async fn cancellation_during_backoff_marks_last_attempt() {
    let policy = RetryPolicy::builder()
        .max_attempts(5)
        .base_delay(Duration::from_secs(30))
        .build()
        .unwrap();
    let orchestrator = SessionOrchestrator::new((), policy);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let body = body_fn(|_: (), _ctx| async { Err(BodyError::assertion("flaky")) });
    let record = orchestrator
        .run_until_cancelled("backing-off", &body, &cancel)
        .await;

    assert_eq!(record.attempts().len(), 1);
    let last = &record.attempts()[0];
    assert_eq!(last.outcome(), AttemptOutcome::Cancelled);
    assert!(last.error().unwrap().contains("flaky"));
}

#[tokio::test]
async fn session_deadline_marks_last_attempt_timed_out() {
    let policy = RetryPolicy::builder()
        .max_attempts(5)
        .base_delay(Duration::from_secs(30))
        .build()
        .unwrap();
    let orchestrator =
        SessionOrchestrator::new((), policy).with_session_timeout(Duration::from_millis(30));
    let body = body_fn(|_: (), _ctx| async { Err(BodyError::assertion("flaky")) });

    let record = orchestrator.run("deadline", &body).await;

    assert_eq!(record.attempts().len(), 1);
    assert_eq!(record.attempts()[0].outcome(), AttemptOutcome::TimedOut);
    assert_eq!(record.final_outcome(), FinalOutcome::Failed);
}

#[tokio::test]
async fn already_cancelled_session_never_acquires() {
    let resource = Arc::new(Tracked::default());
    let orchestrator = SessionOrchestrator::shared(Arc::clone(&resource), policy(3));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let record = orchestrator
        .run_until_cancelled("pre-cancelled", &failing_until(0), &cancel)
        .await;

    assert_eq!(record.attempts().len(), 1);
    assert_eq!(record.attempts()[0].outcome(), AttemptOutcome::Cancelled);
    assert_eq!(resource.opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_report_cleanly() {
    let sink = Arc::new(MemorySink::new());
    let reporter = ResultReporter::new().with_sink(sink.clone());
    let orchestrator = Arc::new(SessionOrchestrator::new(Tracked::default(), policy(3)));

    let mut tasks = Vec::new();
    for i in 0..10u32 {
        let orchestrator = Arc::clone(&orchestrator);
        let reporter = reporter.clone();
        tasks.push(tokio::spawn(async move {
            // Sessions pass on attempt 1, 2 or 3, or never
            let passes_on = i % 4 + 1;
            let record = orchestrator
                .run(&format!("session-{}", i), &failing_until(passes_on))
                .await;
            reporter.record(&record).unwrap();
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let records = sink.records();
    assert_eq!(records.len(), 10);
    for record in &records {
        let numbers: Vec<u32> = record.attempts().iter().map(|a| a.attempt()).collect();
        let expected: Vec<u32> = (1..=numbers.len() as u32).collect();
        assert_eq!(numbers, expected, "{} out of order", record.test_name());
        assert!(numbers.len() <= 3);
    }

    let summary = trialkit_common::summarize(&records);
    assert_eq!(summary.sessions, 10);
    // i % 4 == 3 needs a fourth attempt and exhausts the budget
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.passed, 8);
}
