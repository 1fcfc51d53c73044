// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Behavioural properties of the circuit breaker.
//!
//! Every test runs on a paused tokio clock; cooldowns are crossed with
//! `tokio::time::advance`, never with real sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::domain::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use bulwark_core::domain::errors::{BackendError, CallError};

fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
    CircuitBreaker::new(
        "database:primary",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            max_recovery_timeout: recovery * 8,
            ..Default::default()
        },
    )
}

async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CallError> {
    breaker
        .attempt_call(None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BackendError::Unavailable("connection refused".into()))
        })
        .await
}

async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CallError> {
    breaker
        .attempt_call(None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_opens_exactly_at_threshold_for_any_threshold() {
    for threshold in 1..=6 {
        let breaker = breaker(threshold, Duration::from_secs(5));
        let calls = AtomicUsize::new(0);

        for attempt in 1..=threshold {
            assert_eq!(breaker.state(), CircuitState::Closed, "threshold {threshold}, attempt {attempt}");
            assert!(matches!(fail(&breaker, &calls).await, Err(CallError::Failed { .. })));
        }
        assert_eq!(breaker.state(), CircuitState::Open, "threshold {threshold}");
        assert_eq!(calls.load(Ordering::SeqCst), threshold as usize);
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_in_between_resets_the_count() {
    let breaker = breaker(3, Duration::from_secs(5));
    let calls = AtomicUsize::new(0);

    for _ in 0..4 {
        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        succeed(&breaker, &calls).await.unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_never_invokes_before_cooldown() {
    let recovery = Duration::from_secs(30);
    let breaker = breaker(2, recovery);
    let calls = AtomicUsize::new(0);
    fail(&breaker, &calls).await.unwrap_err();
    fail(&breaker, &calls).await.unwrap_err();

    // walk right up to the edge of the cooldown
    for _ in 0..29 {
        tokio::time::advance(Duration::from_secs(1)).await;
        match succeed(&breaker, &calls).await {
            Err(CallError::Rejected(open)) => {
                assert_eq!(open.state, CircuitState::Open);
                assert!(open.retry_after > Duration::ZERO);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(succeed(&breaker, &calls).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_one_probe_and_rejects_the_rest() {
    let breaker = breaker(1, Duration::from_secs(10));
    let calls = AtomicUsize::new(0);
    fail(&breaker, &calls).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(10)).await;

    let probe = breaker.try_acquire().expect("first caller becomes the probe");
    assert!(probe.is_probe());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    for _ in 0..5 {
        let rejected = breaker.try_acquire().unwrap_err();
        assert_eq!(rejected.state, CircuitState::HalfOpen);
        assert_eq!(rejected.retry_after, Duration::ZERO);
    }

    probe.success();
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
    assert!(snapshot.opened_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_race_for_a_single_probe() {
    let breaker = Arc::new(breaker(1, Duration::from_secs(1)));
    let calls = Arc::new(AtomicUsize::new(0));
    fail(&breaker, &calls).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(1)).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let (breaker, calls) = (breaker.clone(), calls.clone());
        handles.push(tokio::spawn(async move {
            breaker
                .attempt_call(None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_with_longer_cooldown() {
    let breaker = breaker(1, Duration::from_secs(10));
    let calls = AtomicUsize::new(0);
    fail(&breaker, &calls).await.unwrap_err();
    let first = breaker.snapshot().current_recovery_timeout;

    tokio::time::advance(first).await;
    fail(&breaker, &calls).await.unwrap_err();
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, CircuitState::Open);
    assert!(snapshot.current_recovery_timeout > first);

    // the old cooldown is no longer enough
    tokio::time::advance(first).await;
    assert!(matches!(succeed(&breaker, &calls).await, Err(CallError::Rejected(_))));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_per_call_counts_as_failure() {
    let breaker = CircuitBreaker::new(
        "llm:hosted",
        CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_per_call: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let result = breaker
        .attempt_call(None, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

    assert!(matches!(
        result,
        Err(CallError::Failed { source: BackendError::Timeout(_), .. })
    ));
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_caller_errors_leave_the_breaker_closed() {
    let breaker = breaker(1, Duration::from_secs(10));
    for _ in 0..5 {
        let result = breaker
            .attempt_call(None, || async { Err::<(), _>(BackendError::NotFound("users/42".into())) })
            .await;
        assert!(matches!(result, Err(CallError::Failed { source: BackendError::NotFound(_), .. })));
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}
