use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mealsync::{MealSyncError, RetryDispatcher, RetryError, RetryPolicy};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BASE: Duration = Duration::from_millis(500);

fn dispatcher(max_attempts: u32) -> RetryDispatcher {
    RetryDispatcher::new(
        RetryPolicy::new()
            .max_attempts(max_attempts)
            .initial_delay(BASE)
            .max_delay(Duration::from_secs(60)),
    )
}

/// Records the (virtual) instant of every attempt.
#[derive(Default)]
struct Attempts {
    at: Mutex<Vec<Instant>>,
}

impl Attempts {
    fn record(&self) {
        self.at.lock().unwrap().push(Instant::now());
    }

    fn count(&self) -> usize {
        self.at.lock().unwrap().len()
    }

    fn gaps(&self) -> Vec<Duration> {
        let at = self.at.lock().unwrap();
        at.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let attempts = Arc::new(Attempts::default());
    let result: Result<(), _> = dispatcher(5)
        .execute(
            "upload",
            || {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.record();
                    Err(MealSyncError::Timeout(Duration::from_secs(30)))
                }
            },
            MealSyncError::class,
        )
        .await;

    let err = result.unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(err.attempts(), 5);
    assert_eq!(attempts.count(), 5);
    assert_eq!(attempts.gaps(), vec![BASE, BASE * 2, BASE * 4, BASE * 8]);
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_is_not_retried() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = dispatcher(5)
        .execute(
            "upload",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MealSyncError::InvalidInput("corrupt image".into())) }
            },
            MealSyncError::class,
        )
        .await;

    assert!(matches!(
        result,
        Err(RetryError::Terminal {
            attempts: 1,
            error: MealSyncError::InvalidInput(_)
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn succeeds_after_transient_failures() {
    let calls = AtomicU32::new(0);
    let result = dispatcher(5)
        .execute(
            "upload",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(MealSyncError::Api {
                            status: 502,
                            message: "bad gateway".into(),
                        })
                    } else {
                        Ok("done")
                    }
                }
            },
            MealSyncError::class,
        )
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_for_server_hint() {
    let attempts = Arc::new(Attempts::default());
    let result = dispatcher(2)
        .execute(
            "upload",
            || {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.record();
                    if attempts.count() == 1 {
                        Err(MealSyncError::RateLimited {
                            retry_after: Some(Duration::from_secs(7)),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
            MealSyncError::class,
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(attempts.gaps(), vec![Duration::from_secs(7)]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_before_next_attempt() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let task = {
        let cancel = cancel.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            dispatcher(5)
                .execute_cancellable(
                    "upload",
                    &cancel,
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(MealSyncError::Timeout(Duration::ZERO)) }
                    },
                    MealSyncError::class,
                )
                .await
        })
    };

    // First attempt fails immediately, then the dispatcher sleeps 500ms.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(RetryError::Cancelled {
            attempts: 1,
            last: Some(_)
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn already_cancelled_makes_no_attempt() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = dispatcher(3)
        .execute_cancellable(
            "upload",
            &cancel,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), MealSyncError>(()) }
            },
            MealSyncError::class,
        )
        .await;

    assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_converts_to_classified_error() {
    let result: Result<(), RetryError<MealSyncError>> = dispatcher(2)
        .execute(
            "upload",
            || async { Err(MealSyncError::Http("offline".into())) },
            MealSyncError::class,
        )
        .await;

    let err = MealSyncError::from(result.unwrap_err());
    assert!(matches!(err, MealSyncError::Exhausted { attempts: 2, .. }));
    assert!(err.is_transient());
}
