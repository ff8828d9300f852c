use std::time::Duration;
use vigil::coordination::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};

fn breaker(threshold: u32, recovery: Duration, half_open: u32) -> CircuitBreaker {
    CircuitBreaker::new(CircuitBreakerConfig {
        name: "integration".to_string(),
        failure_threshold: threshold,
        recovery_timeout: recovery,
        half_open_max_calls: half_open,
    })
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
    breaker.call(|| async { Err::<(), _>("downstream error") }).await
}

async fn succeed(breaker: &CircuitBreaker) -> Result<u32, CircuitError<&'static str>> {
    breaker.call(|| async { Ok::<_, &'static str>(7) }).await
}

#[tokio::test]
async fn full_cycle_closed_open_half_open_closed() {
    let breaker = breaker(3, Duration::from_millis(100), 2);

    for _ in 0..3 {
        assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner("downstream error"))));
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    let mut ran = false;
    let rejected = breaker
        .call(|| {
            ran = true;
            async { Ok::<_, &'static str>(()) }
        })
        .await;
    assert!(rejected.as_ref().err().is_some_and(|e| e.is_open()));
    assert!(!ran);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    assert_eq!(succeed(&breaker).await.ok(), Some(7));
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    assert_eq!(succeed(&breaker).await.ok(), Some(7));
    assert_eq!(breaker.state().await, CircuitState::Closed);

    let snapshot = breaker.snapshot().await;
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.total_trips, 1);
    assert!(snapshot.last_failure_time.is_some());
}

#[tokio::test]
async fn half_open_failure_reopens() {
    let breaker = breaker(2, Duration::from_millis(50), 3);

    fail(&breaker).await.ok();
    fail(&breaker).await.ok();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    fail(&breaker).await.ok();
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(breaker.snapshot().await.total_trips, 2);
}

#[tokio::test]
async fn success_resets_consecutive_failures() {
    let breaker = breaker(3, Duration::from_secs(60), 1);

    fail(&breaker).await.ok();
    fail(&breaker).await.ok();
    succeed(&breaker).await.ok();
    fail(&breaker).await.ok();
    fail(&breaker).await.ok();

    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.snapshot().await.failure_count, 2);
}

#[tokio::test]
async fn manual_trip_and_reset() {
    let breaker = breaker(5, Duration::from_secs(60), 1);

    breaker.trip("operator request").await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(succeed(&breaker).await.is_err());

    breaker.reset().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(succeed(&breaker).await.ok(), Some(7));
}
