// Tests for the circuit breaker state machine
use crate::resilience::breaker::{BreakerPolicy, BreakerState, CallError, CircuitBreaker, Rejection};

use std::sync::Arc;
use std::time::Duration;

fn policy(max_failures: u32, timeout_ms: u64, half_open_max_calls: u32) -> BreakerPolicy {
    BreakerPolicy {
        max_failures,
        timeout: Duration::from_millis(timeout_ms),
        half_open_max_calls,
    }
}

fn fail(breaker: &CircuitBreaker, times: usize) {
    for _ in 0..times {
        breaker.try_acquire().expect("admitted").failure();
    }
}

#[tokio::test(start_paused = true)]
async fn test_trips_after_max_failures() {
    let breaker = CircuitBreaker::new("test", policy(3, 2000, 1));

    fail(&breaker, 2);
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.failures(), 2);

    fail(&breaker, 1);
    assert_eq!(breaker.state(), BreakerState::Open);

    match breaker.try_acquire() {
        Err(Rejection::Open { retry_after }) => assert!(retry_after <= Duration::from_secs(2)),
        other => panic!("expected open rejection, got {:?}", other.map(|_| ())),
    };
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failures_in_closed() {
    let breaker = CircuitBreaker::new("test", policy(3, 2000, 1));

    fail(&breaker, 2);
    breaker.try_acquire().unwrap().success();
    assert_eq!(breaker.failures(), 0);

    fail(&breaker, 2);
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_closes_on_success() {
    let breaker = CircuitBreaker::new("test", policy(1, 1000, 1));
    fail(&breaker, 1);
    assert_eq!(breaker.state(), BreakerState::Open);

    tokio::time::advance(Duration::from_millis(1001)).await;

    let probe = breaker.try_acquire().expect("probe admitted");
    assert!(probe.is_probe());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    // quota of one probe is taken
    assert_eq!(breaker.try_acquire().err(), Some(Rejection::HalfOpenFull));

    probe.success();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_failure_reopens() {
    let breaker = CircuitBreaker::new("test", policy(1, 1000, 2));
    fail(&breaker, 1);
    tokio::time::advance(Duration::from_millis(1000)).await;

    let first = breaker.try_acquire().unwrap();
    let second = breaker.try_acquire().unwrap();
    assert!(breaker.try_acquire().is_err());

    first.success();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    second.failure();
    assert_eq!(breaker.state(), BreakerState::Open);

    // the timeout window restarts from the reopen
    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(matches!(breaker.try_acquire(), Err(Rejection::Open { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_needs_max_calls_successes() {
    let breaker = CircuitBreaker::new("test", policy(1, 100, 2));
    fail(&breaker, 1);
    tokio::time::advance(Duration::from_millis(100)).await;

    breaker.try_acquire().unwrap().success();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    breaker.try_acquire().unwrap().success();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_probe_counts_as_failure() {
    let breaker = CircuitBreaker::new("test", policy(1, 100, 1));
    fail(&breaker, 1);
    tokio::time::advance(Duration::from_millis(100)).await;

    {
        let _probe = breaker.try_acquire().unwrap();
    }
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_stale_outcome_is_ignored() {
    let breaker = CircuitBreaker::new("test", policy(1, 100, 1));

    let slow = breaker.try_acquire().unwrap();
    fail(&breaker, 1);
    assert_eq!(breaker.state(), BreakerState::Open);

    tokio::time::advance(Duration::from_millis(100)).await;
    let probe = breaker.try_acquire().unwrap();

    // a success admitted before the trip must not close the breaker
    slow.success();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    probe.success();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_probes_never_exceed_quota() {
    let breaker = Arc::new(CircuitBreaker::new("test", policy(1, 10, 3)));
    fail(&breaker, 1);
    tokio::time::advance(Duration::from_millis(10)).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            match breaker.try_acquire() {
                Ok(permit) => {
                    std::mem::forget(permit);
                    1u32
                }
                Err(_) => 0,
            }
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        admitted += handle.await.unwrap();
    }
    assert_eq!(admitted, 3);
}

#[tokio::test]
async fn test_call_records_outcomes() {
    let breaker = CircuitBreaker::new("test", policy(2, 60_000, 1));

    let ok: Result<u32, CallError<&str>> = breaker.call(async { Ok(7) }).await;
    assert_eq!(ok.unwrap(), 7);

    let err = breaker.call(async { Err::<u32, _>("down") }).await;
    assert!(matches!(err, Err(CallError::Failed("down"))));
    let _ = breaker.call(async { Err::<u32, _>("down") }).await;
    assert_eq!(breaker.state(), BreakerState::Open);

    let rejected = breaker.call(async { Ok::<u32, &str>(1) }).await;
    assert!(matches!(rejected, Err(CallError::Rejected(Rejection::Open { .. }))));
}

#[tokio::test]
async fn test_call_panic_is_failure_and_resumes() {
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    let breaker = CircuitBreaker::new("test", policy(1, 60_000, 1));
    let outcome = AssertUnwindSafe(breaker.call(async {
        if true {
            panic!("handler exploded");
        }
        Ok::<(), ()>(())
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[test]
fn test_reset_closes() {
    let breaker = CircuitBreaker::new("test", policy(1, 60_000, 1));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    rt.block_on(async {
        fail(&breaker, 1);
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    });
    assert_eq!(BreakerState::HalfOpen.to_string(), "half_open");
}
