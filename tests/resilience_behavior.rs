//! Behavior-driven tests for retry and circuit breaking
//!
//! These tests verify HOW provider failures are retried, when a provider is
//! cut off by its circuit breaker, and how it is let back in.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crosslist_core::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, DispatchRequest, Dispatcher, ErrorKind,
    ItemCondition, Listing, Operation, OperationKind, ProviderError, ProviderId, ProviderSettings,
    RateLimit, RetryExecutor, RetryPolicy, SandboxMarketplace,
};
use tokio::time::Instant;

fn id(value: &str) -> ProviderId {
    ProviderId::parse(value).expect("valid provider id")
}

fn lamp() -> Listing {
    Listing::new("sku-7", "Brass desk lamp", "Works", 60.0, 1, ItemCondition::Good)
        .expect("valid listing")
}

fn breaker_settings(threshold: u32, recovery: Duration) -> ProviderSettings {
    ProviderSettings::default()
        .with_retry(RetryPolicy::no_retry())
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
}

// =============================================================================
// Retry Executor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_failures_stay_transient_the_executor_makes_exactly_r_plus_one_attempts() {
    for max_retries in [0_u32, 1, 3, 5] {
        // Given: A call that always times out
        let policy = RetryPolicy::fixed(Duration::from_millis(50), max_retries);
        let calls = AtomicU32::new(0);

        // When: It runs through the executor
        let result: Result<(), ProviderError> = RetryExecutor::new(&policy)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::timeout("read timed out")) }
            })
            .await;

        // Then: r + 1 attempts were made and the error says so
        assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
        let error = result.expect_err("never succeeds");
        assert_eq!(error.kind(), ErrorKind::RetryExhausted);
        assert!(error
            .message()
            .contains(&format!("after {} attempt(s)", max_retries + 1)));
    }
}

#[tokio::test(start_paused = true)]
async fn when_backoff_is_exponential_delays_grow_and_are_capped() {
    // Given: A jitter-free exponential policy capped at 5 seconds
    let policy = RetryPolicy {
        max_retries: 4,
        base_delay: Duration::from_secs(1),
        backoff_factor: 2.0,
        max_backoff: Duration::from_secs(5),
        jitter: 0.0,
        ..RetryPolicy::default()
    };
    let started = Instant::now();
    let stamps = std::sync::Mutex::new(Vec::new());

    // When: Every attempt fails with a 503
    let _ = RetryExecutor::new(&policy)
        .execute(|_| {
            stamps
                .lock()
                .expect("stamps lock is not poisoned")
                .push(started.elapsed().as_secs());
            async { Err::<(), _>(ProviderError::status(503, "unavailable")) }
        })
        .await;

    // Then: Attempts start at 0, 1, 3, 7 and 12 seconds (delays 1, 2, 4, 5)
    assert_eq!(
        *stamps.lock().expect("stamps lock is not poisoned"),
        vec![0, 1, 3, 7, 12]
    );
}

#[tokio::test(start_paused = true)]
async fn when_a_status_is_outside_the_retry_list_it_is_returned_immediately() {
    // Given: A policy that only retries 503
    let policy = RetryPolicy::exponential(3).with_retry_on_status(vec![503]);
    let calls = AtomicU32::new(0);

    // When: The call fails with a 429
    let result: Result<(), ProviderError> = RetryExecutor::new(&policy)
        .execute(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::status(429, "slow down")) }
        })
        .await;

    // Then: The original transient error comes back after one attempt
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let error = result.expect_err("not retried");
    assert_eq!(error.kind(), ErrorKind::Transient);
    assert_eq!(error.status_code(), Some(429));
}

// =============================================================================
// Circuit Breaker: Opening
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_failures_reach_the_threshold_later_calls_never_reach_the_provider() {
    // Given: Provider X with a breaker threshold of 3 that always returns 502
    let x = Arc::new(SandboxMarketplace::new(id("x")));
    x.fail_always(OperationKind::Create, ProviderError::status(502, "bad gateway"));
    let dispatcher = Dispatcher::builder()
        .register(x.clone(), breaker_settings(3, Duration::from_secs(60)))
        .build()
        .expect("valid dispatcher");

    // When: Three dispatches fail
    for _ in 0..3 {
        let outcome = dispatcher.create_listing(lamp(), vec![id("x")]).await;
        assert!(!outcome.overall_success);
    }

    // Then: The breaker for (x, create) is open
    assert_eq!(
        dispatcher.breaker_state(&id("x"), OperationKind::Create),
        CircuitState::Open
    );
    assert_eq!(x.calls(OperationKind::Create), 3);

    // When: Another dispatch targets X
    let outcome = dispatcher.create_listing(lamp(), vec![id("x")]).await;

    // Then: It is rejected at once without a network call
    let result = outcome.result(&id("x")).expect("x result");
    assert_eq!(result.error_kind(), Some(ErrorKind::CircuitOpen));
    assert_eq!(result.attempts, 0);
    assert_eq!(result.elapsed_ms, 0);
    assert_eq!(outcome.total_elapsed_ms, 0);
    assert_eq!(x.calls(OperationKind::Create), 3);
}

#[tokio::test(start_paused = true)]
async fn when_a_breaker_opens_retries_stop_at_the_rejection() {
    // Given: A threshold of 2 and a generous retry budget
    let x = Arc::new(SandboxMarketplace::new(id("x")));
    x.fail_always(OperationKind::HealthCheck, ProviderError::connect("refused"));
    let settings = ProviderSettings::default()
        .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 5))
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        });
    let dispatcher = Dispatcher::builder()
        .register(x.clone(), settings)
        .build()
        .expect("valid dispatcher");

    // When: One dispatch runs
    let outcome = dispatcher.health_check().await;

    // Then: The third attempt is refused by the breaker
    let result = outcome.result(&id("x")).expect("x result");
    assert_eq!(result.error_kind(), Some(ErrorKind::CircuitOpen));
    assert_eq!(result.attempts, 2);
    assert_eq!(x.calls(OperationKind::HealthCheck), 2);
}

#[tokio::test(start_paused = true)]
async fn when_one_operation_is_cut_off_other_operations_still_flow() {
    // Given: Creates on eBay are failing hard enough to open their breaker
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    ebay.fail_always(OperationKind::Create, ProviderError::status(500, "boom"));
    let dispatcher = Dispatcher::builder()
        .register(ebay.clone(), breaker_settings(1, Duration::from_secs(60)))
        .build()
        .expect("valid dispatcher");
    dispatcher.create_listing(lamp(), vec![id("ebay")]).await;
    assert_eq!(
        dispatcher.breaker_state(&id("ebay"), OperationKind::Create),
        CircuitState::Open
    );

    // When: A health check runs against the same provider
    let outcome = dispatcher.health_check().await;

    // Then: It is unaffected by the create breaker
    assert!(outcome.all_succeeded());
    assert_eq!(
        dispatcher.breaker_state(&id("ebay"), OperationKind::HealthCheck),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn when_failures_are_permanent_the_breaker_stays_closed() {
    // Given: A provider that rejects every payload with 400
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    ebay.fail_always(OperationKind::Create, ProviderError::status(400, "bad payload"));
    let dispatcher = Dispatcher::builder()
        .register(ebay.clone(), breaker_settings(2, Duration::from_secs(60)))
        .build()
        .expect("valid dispatcher");

    // When: It fails many times
    for _ in 0..5 {
        dispatcher.create_listing(lamp(), vec![id("ebay")]).await;
    }

    // Then: Caller mistakes never trip the breaker
    assert_eq!(
        dispatcher.breaker_state(&id("ebay"), OperationKind::Create),
        CircuitState::Closed
    );
    assert_eq!(ebay.calls(OperationKind::Create), 5);
}

#[tokio::test(start_paused = true)]
async fn when_permanent_failures_interleave_outages_the_breaker_still_opens() {
    // Given: A provider whose failures alternate between 500 and 400
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let dispatcher = Dispatcher::builder()
        .register(ebay.clone(), breaker_settings(3, Duration::from_secs(60)))
        .build()
        .expect("valid dispatcher");

    // When: Five creates fail in turn
    for call in 0..5 {
        let status = if call % 2 == 0 { 500 } else { 400 };
        ebay.fail_next(OperationKind::Create, ProviderError::status(status, "failed"), 1);
        dispatcher.create_listing(lamp(), vec![id("ebay")]).await;
    }

    // Then: The 400s did not wipe the outage count and the third 500 opened it
    assert_eq!(
        dispatcher.breaker_state(&id("ebay"), OperationKind::Create),
        CircuitState::Open
    );
    let outcome = dispatcher.create_listing(lamp(), vec![id("ebay")]).await;
    let result = outcome.result(&id("ebay")).expect("ebay result");
    assert_eq!(result.error_kind(), Some(ErrorKind::CircuitOpen));
    assert_eq!(ebay.calls(OperationKind::Create), 5);
}

// =============================================================================
// Circuit Breaker: Recovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_the_recovery_timeout_passes_a_successful_probe_closes_the_breaker() {
    // Given: An open breaker with a 30s recovery timeout
    let x = Arc::new(SandboxMarketplace::new(id("x")));
    x.fail_always(OperationKind::HealthCheck, ProviderError::status(503, "down"));
    let dispatcher = Dispatcher::builder()
        .register(x.clone(), breaker_settings(1, Duration::from_secs(30)))
        .build()
        .expect("valid dispatcher");
    dispatcher.health_check().await;
    assert_eq!(
        dispatcher.breaker_state(&id("x"), OperationKind::HealthCheck),
        CircuitState::Open
    );

    // When: The provider recovers but the timeout has not yet elapsed
    x.clear_failures(OperationKind::HealthCheck);
    tokio::time::advance(Duration::from_secs(29)).await;
    let early = dispatcher.health_check().await;

    // Then: The call is still rejected
    assert_eq!(
        early.result(&id("x")).and_then(|r| r.error_kind()),
        Some(ErrorKind::CircuitOpen)
    );
    assert_eq!(x.calls(OperationKind::HealthCheck), 1);

    // When: The timeout elapses
    tokio::time::advance(Duration::from_secs(1)).await;
    let probe = dispatcher.health_check().await;

    // Then: The probe reaches the provider and closes the breaker
    assert!(probe.all_succeeded());
    assert_eq!(x.calls(OperationKind::HealthCheck), 2);
    assert_eq!(
        dispatcher.breaker_state(&id("x"), OperationKind::HealthCheck),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn when_a_probe_fails_the_breaker_reopens_for_a_full_timeout() {
    // Given: An open breaker whose provider is still down
    let x = Arc::new(SandboxMarketplace::new(id("x")));
    x.fail_always(OperationKind::HealthCheck, ProviderError::status(503, "down"));
    let dispatcher = Dispatcher::builder()
        .register(x.clone(), breaker_settings(1, Duration::from_secs(30)))
        .build()
        .expect("valid dispatcher");
    dispatcher.health_check().await;

    // When: The probe after the recovery timeout also fails
    tokio::time::advance(Duration::from_secs(30)).await;
    dispatcher.health_check().await;

    // Then: The breaker is open again and needs another full timeout
    assert_eq!(
        dispatcher.breaker_state(&id("x"), OperationKind::HealthCheck),
        CircuitState::Open
    );
    tokio::time::advance(Duration::from_secs(20)).await;
    let outcome = dispatcher.health_check().await;
    assert_eq!(
        outcome.result(&id("x")).and_then(|r| r.error_kind()),
        Some(ErrorKind::CircuitOpen)
    );
    assert_eq!(x.calls(OperationKind::HealthCheck), 2);
}

#[tokio::test(start_paused = true)]
async fn when_concurrent_calls_arrive_half_open_admits_a_single_probe() {
    // Given: An open breaker whose provider has recovered but answers slowly
    let x = Arc::new(SandboxMarketplace::new(id("x")).with_latency(Duration::from_millis(500)));
    x.fail_next(OperationKind::HealthCheck, ProviderError::status(503, "down"), 1);
    let dispatcher = Dispatcher::builder()
        .register(x.clone(), breaker_settings(1, Duration::from_secs(10)))
        .build()
        .expect("valid dispatcher");
    dispatcher.health_check().await;
    tokio::time::advance(Duration::from_secs(10)).await;

    // When: Two dispatches race after the recovery timeout
    let (first, second) = tokio::join!(dispatcher.health_check(), dispatcher.health_check());

    // Then: Exactly one reached the provider and the other was rejected
    let kinds = [&first, &second]
        .map(|outcome| outcome.result(&id("x")).and_then(|r| r.error_kind()));
    assert_eq!(
        kinds.iter().filter(|kind| kind.is_none()).count(),
        1,
        "one probe succeeds: {kinds:?}"
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|kind| **kind == Some(ErrorKind::CircuitOpen))
            .count(),
        1
    );
    assert_eq!(x.calls(OperationKind::HealthCheck), 2);
    assert_eq!(
        dispatcher.breaker_state(&id("x"), OperationKind::HealthCheck),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn when_used_standalone_the_breaker_guards_any_call() {
    // Given: A standalone breaker with threshold 2
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(5),
    })
    .with_scope("'ebay' fetch_sales");
    let policy = RetryPolicy::no_retry();
    let executor = RetryExecutor::new(&policy).with_breaker(&breaker);

    // When: Two calls fail transiently
    for _ in 0..2 {
        let _ = executor
            .execute(|_| async { Err::<(), _>(ProviderError::status(500, "boom")) })
            .await;
    }

    // Then: The third is rejected with a message naming the scope
    let error = executor
        .execute(|_| async { Ok::<_, ProviderError>(()) })
        .await
        .expect_err("breaker open");
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert!(error.message().contains("'ebay' fetch_sales"));
    assert_eq!(breaker.consecutive_failures(), 2);
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_provider_is_rate_limited_calls_within_budget_proceed() {
    // Given: A provider limited to 600 requests per minute with a burst of 5
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let dispatcher = Dispatcher::builder()
        .register(
            ebay.clone(),
            ProviderSettings::default().with_rate_limit(RateLimit::per_minute(600).with_burst(5)),
        )
        .build()
        .expect("valid dispatcher");

    // When: Three health checks run back to back
    for _ in 0..3 {
        assert!(dispatcher.health_check().await.all_succeeded());
    }

    // Then: Every call went through
    assert_eq!(ebay.calls(OperationKind::HealthCheck), 3);
}

// The limiter keeps real time, so the tests below run on an unpaused runtime.

#[tokio::test]
async fn when_the_rate_limit_budget_is_spent_the_next_call_waits_for_a_slot() {
    // Given: A provider allowed one request every 100ms with no burst
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let dispatcher = Dispatcher::builder()
        .register(
            ebay.clone(),
            ProviderSettings::default().with_rate_limit(RateLimit::per_minute(600).with_burst(1)),
        )
        .build()
        .expect("valid dispatcher");
    assert!(dispatcher.health_check().await.all_succeeded());

    // When: A second health check follows immediately
    let started = std::time::Instant::now();
    let outcome = dispatcher.health_check().await;

    // Then: It succeeds only after the limiter frees the next slot
    assert!(outcome.all_succeeded());
    assert!(started.elapsed() >= Duration::from_millis(80), "{:?}", started.elapsed());
    assert_eq!(ebay.calls(OperationKind::HealthCheck), 2);
}

#[tokio::test]
async fn when_the_deadline_expires_during_a_rate_limit_wait_the_provider_fails() {
    // Given: A provider allowed one request per minute, already used up
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let dispatcher = Dispatcher::builder()
        .register(
            ebay.clone(),
            ProviderSettings::default().with_rate_limit(RateLimit::per_minute(1).with_burst(1)),
        )
        .build()
        .expect("valid dispatcher");
    assert!(dispatcher.health_check().await.all_succeeded());

    // When: Another dispatch runs with a 200ms deadline
    let started = std::time::Instant::now();
    let outcome = dispatcher
        .dispatch(
            DispatchRequest::new(Operation::HealthCheck, vec![id("ebay")])
                .with_deadline(Duration::from_millis(200)),
        )
        .await;

    // Then: The wait is cut off by the deadline and the provider never sees the call
    assert!(started.elapsed() < Duration::from_secs(5));
    let result = outcome.result(&id("ebay")).expect("ebay result");
    assert_eq!(result.error_kind(), Some(ErrorKind::DeadlineExceeded));
    assert_eq!(ebay.calls(OperationKind::HealthCheck), 1);
}
