//! Request coordinator tests.

mod common;

use bytes::Bytes;
use common::CallCounter;
use http::Method;
use idemgate::coordinator::{Disposition, Execution, Reply, RequestMeta, REPLAY_HEADER};
use idemgate::core::config::Config;
use idemgate::core::error::OperationError;
use idemgate::core::time::system_clock;
use idemgate::lock::AcquirePolicy;
use idemgate::store::{IdempotencyStore, KeyStatus, ResponseHead};
use idemgate::stream::{Frame, FrameKind};
use idemgate::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn request() -> RequestMeta {
    RequestMeta::new(Method::POST, "/api/v1/tasks")
        .with_key("abc123")
        .with_owner("u1")
}

fn stream_request() -> RequestMeta {
    RequestMeta::new(Method::POST, "/api/v1/chat/stream")
        .with_key("abc123")
        .with_owner("u1")
}

fn created(body: &'static str) -> Execution {
    Execution::single(
        ResponseHead::new(201)
            .with_header("content-type", "application/json")
            .with_header("x-trace-id", "t-1"),
        body,
    )
}

fn event_stream_head() -> ResponseHead {
    ResponseHead::new(200).with_header("content-type", "text/event-stream")
}

async fn create(
    coordinator: &Coordinator,
    request: &RequestMeta,
    counter: &CallCounter,
    body: &'static str,
) -> Result<Reply, OperationError> {
    let counter = counter.clone();
    coordinator
        .handle(request, move || async move {
            counter.hit();
            Ok(created(body))
        })
        .await
}

async fn greet(
    coordinator: &Coordinator,
    counter: &CallCounter,
    gap: Duration,
) -> Result<Reply, OperationError> {
    let counter = counter.clone();
    coordinator
        .handle(&stream_request(), move || async move {
            counter.hit();
            Ok(Execution::stream(
                event_stream_head(),
                common::paced_frames(common::greeting_frames(), gap),
            ))
        })
        .await
}

fn json_body(reply: &Reply) -> serde_json::Value {
    serde_json::from_slice(reply.body_bytes().expect("buffered body")).unwrap()
}

// ============================================================================
// Single-value operations
// ============================================================================

#[tokio::test]
async fn completed_response_is_replayed_without_running_again() {
    let coordinator = common::coordinator(&common::fast_config(), common::memory_store(system_clock()));
    let counter = CallCounter::default();

    let first = create(&coordinator, &request(), &counter, r#"{"id":1}"#).await.unwrap();
    assert_eq!(first.disposition, Disposition::Executed);
    assert_eq!(first.status(), 201);
    assert_eq!(first.head.header(REPLAY_HEADER), None);

    let second = create(&coordinator, &request(), &counter, r#"{"id":2}"#).await.unwrap();
    assert!(second.is_replay());
    assert_eq!(second.status(), 201);
    assert_eq!(second.body_bytes(), Some(&Bytes::from_static(br#"{"id":1}"#)));
    assert_eq!(second.head.header(REPLAY_HEADER), Some("true"));
    assert_eq!(second.head.header("content-type"), Some("application/json"));
    assert_eq!(second.head.header("x-trace-id"), None);

    assert_eq!(counter.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_run_the_operation_once() {
    let coordinator = Arc::new(common::coordinator(
        &common::fast_config(),
        common::memory_store(system_clock()),
    ));
    let counter = CallCounter::default();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let coordinator = coordinator.clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .handle(&request(), move || async move {
                    counter.hit();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(created(r#"{"id":1}"#))
                })
                .await
                .unwrap()
        }));
    }

    let mut executed = 0;
    for handle in handles {
        let reply = handle.await.unwrap();
        match reply.disposition {
            Disposition::Executed => executed += 1,
            Disposition::Conflict => assert_eq!(reply.status(), 409),
            Disposition::Replayed => assert_eq!(reply.status(), 201),
            other => panic!("unexpected disposition {other:?}"),
        }
    }
    assert_eq!(executed, 1);
    assert_eq!(counter.count(), 1);
}

#[tokio::test]
async fn operation_error_is_returned_unmodified_and_not_cached() {
    let store = common::memory_store(system_clock());
    let coordinator = common::coordinator(&common::fast_config(), store.clone());
    let counter = CallCounter::default();

    let failing = counter.clone();
    let result = coordinator
        .handle(&request(), move || async move {
            failing.hit();
            Err(OperationError::new(422, "plan is not valid"))
        })
        .await;
    assert_eq!(result.unwrap_err(), OperationError::new(422, "plan is not valid"));
    assert_eq!(store.status(&common::abc123()).await.unwrap(), KeyStatus::Absent);

    let retry = create(&coordinator, &request(), &counter, "{}").await.unwrap();
    assert_eq!(retry.disposition, Disposition::Executed);
    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn non_success_response_is_not_cached() {
    let store = common::memory_store(system_clock());
    let coordinator = common::coordinator(&common::fast_config(), store.clone());
    let counter = CallCounter::default();

    let failing = counter.clone();
    let reply = coordinator
        .handle(&request(), move || async move {
            failing.hit();
            Ok(Execution::single(ResponseHead::new(500), "upstream exploded"))
        })
        .await
        .unwrap();
    assert_eq!(reply.disposition, Disposition::Executed);
    assert_eq!(reply.status(), 500);
    assert!(store.get(&common::abc123()).await.is_none());

    create(&coordinator, &request(), &counter, "{}").await.unwrap();
    assert_eq!(counter.count(), 2);
}

// ============================================================================
// Streaming operations
// ============================================================================

#[tokio::test]
async fn stream_in_flight_conflicts_then_replays() {
    let coordinator = common::coordinator(&common::fast_config(), common::memory_store(system_clock()));
    let counter = CallCounter::default();

    // A: streams Hi, there, done with gaps between frames.
    let a = greet(&coordinator, &counter, Duration::from_millis(100)).await.unwrap();
    assert_eq!(a.disposition, Disposition::Executed);
    assert!(a.is_stream());
    let consumer = tokio::spawn(a.collect_frames());

    // B: arrives while A is still streaming.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = greet(&coordinator, &counter, Duration::ZERO).await.unwrap();
    assert_eq!(b.disposition, Disposition::Conflict);
    assert_eq!(b.status(), 409);
    let body = json_body(&b);
    assert_eq!(body["error"], "Request is being processed");
    assert_eq!(body["code"], "IDEMPOTENCY_KEY_IN_USE");

    let live = consumer.await.unwrap();
    assert_eq!(live.len(), 3);
    assert_eq!(live[2].kind, FrameKind::Terminal);

    // C: after completion, the same frames without running again.
    let c = greet(&coordinator, &counter, Duration::ZERO).await.unwrap();
    assert!(c.is_replay());
    assert_eq!(c.head.header(REPLAY_HEADER), Some("true"));
    assert_eq!(c.head.header("content-type"), Some("text/event-stream"));
    let replayed = c.collect_frames().await;
    assert_eq!(replayed, live);

    assert_eq!(counter.count(), 1);
}

#[tokio::test]
async fn failed_stream_can_be_retried() {
    let store = common::memory_store(system_clock());
    let coordinator = common::coordinator(&common::fast_config(), store.clone());
    let counter = CallCounter::default();

    let failing = counter.clone();
    let reply = coordinator
        .handle(&stream_request(), move || async move {
            failing.hit();
            Ok(Execution::stream(
                event_stream_head(),
                idemgate::stream::frames_from_iter(vec![
                    Ok(Frame::data(None, "partial")),
                    Err(OperationError::new(503, "model overloaded")),
                ]),
            ))
        })
        .await
        .unwrap();
    let frames = reply.collect_frames().await;
    assert_eq!(frames.last().unwrap().kind, FrameKind::Error);
    assert_eq!(store.status(&common::abc123()).await.unwrap(), KeyStatus::Absent);

    let retry = greet(&coordinator, &counter, Duration::ZERO).await.unwrap();
    assert_eq!(retry.disposition, Disposition::Executed);
    assert_eq!(retry.collect_frames().await.len(), 3);
    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn non_success_stream_is_forwarded_but_not_cached() {
    let store = common::memory_store(system_clock());
    let coordinator = common::coordinator(&common::fast_config(), store.clone());

    let reply = coordinator
        .handle(&stream_request(), || async {
            Ok(Execution::stream(
                ResponseHead::new(503),
                idemgate::stream::frames_from_iter(common::greeting_frames()),
            ))
        })
        .await
        .unwrap();
    assert_eq!(reply.status(), 503);
    assert_eq!(reply.collect_frames().await.len(), 3);
    assert!(store.get(&common::abc123()).await.is_none());
    assert_eq!(store.status(&common::abc123()).await.unwrap(), KeyStatus::Absent);
}

// ============================================================================
// Record lifetime
// ============================================================================

#[tokio::test]
async fn expired_record_lets_the_key_execute_again() {
    let mut config = common::fast_config();
    config.coordinator.record_ttl_seconds = 1;
    let (clock, shared) = common::manual_clock();
    let coordinator = common::coordinator(&config, common::memory_store(shared));
    let counter = CallCounter::default();

    create(&coordinator, &request(), &counter, "{}").await.unwrap();
    clock.advance(Duration::from_millis(500));
    assert!(create(&coordinator, &request(), &counter, "{}").await.unwrap().is_replay());

    clock.advance(Duration::from_millis(600));
    let again = create(&coordinator, &request(), &counter, "{}").await.unwrap();
    assert_eq!(again.disposition, Disposition::Executed);
    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn expiry_follows_wall_clock() {
    let mut config = common::fast_config();
    config.coordinator.record_ttl_seconds = 1;
    let coordinator = common::coordinator(&config, common::memory_store(system_clock()));
    let counter = CallCounter::default();

    create(&coordinator, &request(), &counter, "{}").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let again = create(&coordinator, &request(), &counter, "{}").await.unwrap();
    assert_eq!(again.disposition, Disposition::Executed);
    assert_eq!(counter.count(), 2);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn uncoordinated_requests_pass_through() {
    let store = common::memory_store(system_clock());
    let coordinator = common::coordinator(&common::fast_config(), store.clone());
    let counter = CallCounter::default();

    let requests = [
        RequestMeta::new(Method::GET, "/api/v1/tasks")
            .with_key("abc123")
            .with_owner("u1"),
        RequestMeta::new(Method::POST, "/api/v1/health")
            .with_key("abc123")
            .with_owner("u1"),
        RequestMeta::new(Method::POST, "/api/v1/tasksets")
            .with_key("abc123")
            .with_owner("u1"),
        RequestMeta::new(Method::POST, "/api/v1/tasks").with_owner("u1"),
        RequestMeta::new(Method::POST, "/api/v1/tasks").with_key("abc123"),
    ];
    for request in &requests {
        for _ in 0..2 {
            let reply = create(&coordinator, request, &counter, "{}").await.unwrap();
            assert_eq!(reply.disposition, Disposition::Passthrough, "{request:?}");
        }
    }

    assert_eq!(counter.count(), requests.len() * 2);
    assert!(store.records().await.unwrap().is_empty());
    assert_eq!(coordinator.metrics().snapshot().passthrough, 10);
}

#[tokio::test]
async fn invalid_keys_are_rejected_without_running() {
    let coordinator = common::coordinator(&common::fast_config(), common::memory_store(system_clock()));
    let counter = CallCounter::default();

    let too_long = "k".repeat(65);
    for key in ["", "   ", too_long.as_str(), "line\nbreak"] {
        let request = RequestMeta::new(Method::POST, "/api/v1/tasks")
            .with_key(key)
            .with_owner("u1");
        let reply = create(&coordinator, &request, &counter, "{}").await.unwrap();
        assert_eq!(reply.disposition, Disposition::Rejected, "{key:?}");
        assert_eq!(reply.status(), 400);
        assert_eq!(json_body(&reply)["code"], "IDEMPOTENCY_KEY_INVALID");
    }

    let longest = RequestMeta::new(Method::POST, "/api/v1/tasks")
        .with_key("k".repeat(64))
        .with_owner("u1");
    let reply = create(&coordinator, &longest, &counter, "{}").await.unwrap();
    assert_eq!(reply.disposition, Disposition::Executed);
    assert_eq!(counter.count(), 1);
}

#[tokio::test]
async fn store_outage_fails_open() {
    let (_, clock) = common::manual_clock();
    let coordinator = common::coordinator(&common::fast_config(), common::unavailable_store(clock));
    let counter = CallCounter::default();

    for _ in 0..2 {
        let reply = create(&coordinator, &request(), &counter, "{}").await.unwrap();
        assert_eq!(reply.disposition, Disposition::Unguarded);
        assert_eq!(reply.status(), 201);
    }
    assert_eq!(counter.count(), 2);
    assert_eq!(coordinator.metrics().snapshot().unguarded, 2);
}

// ============================================================================
// Lease renewal
// ============================================================================

#[tokio::test(start_paused = true)]
async fn slow_operation_keeps_its_lease() {
    let mut config = common::fast_config();
    config.lock.lease_ms = 200;
    config.lock.heartbeat_interval_ms = 50;
    let (clock, shared) = common::manual_clock();
    let coordinator = Arc::new(common::coordinator(&config, common::memory_store(shared)));
    let counter = CallCounter::default();
    let gate = Arc::new(Notify::new());

    // A: runs until the gate opens.
    let a = {
        let coordinator = coordinator.clone();
        let counter = counter.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            coordinator
                .handle(&request(), move || async move {
                    counter.hit();
                    gate.notified().await;
                    Ok(created("{}"))
                })
                .await
        })
    };

    // Three times the lease passes on the store's clock.
    for _ in 0..12 {
        clock.advance(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let b = create(&coordinator, &request(), &counter, "{}").await.unwrap();
    assert_eq!(b.disposition, Disposition::Conflict);
    assert_eq!(counter.count(), 1);

    gate.notify_one();
    let a = a.await.unwrap().unwrap();
    assert_eq!(a.disposition, Disposition::Executed);

    let c = create(&coordinator, &request(), &counter, "{}").await.unwrap();
    assert!(c.is_replay());
    assert_eq!(counter.count(), 1);

    let snapshot = coordinator.metrics().snapshot();
    assert!(snapshot.lease_renewals >= 10, "{snapshot:?}");
    assert_eq!(snapshot.token_mismatches, 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn dropped_request_releases_the_key() {
    let store = common::memory_store(system_clock());
    let coordinator = common::coordinator(&common::fast_config(), store.clone());
    let counter = CallCounter::default();

    let slow = counter.clone();
    let request = request();
    let pending = coordinator.handle(&request, move || async move {
        slow.hit();
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(created("{}"))
    });
    assert!(tokio::time::timeout(Duration::from_millis(50), pending)
        .await
        .is_err());

    let key = common::abc123();
    for _ in 0..100 {
        if store.status(&key).await.unwrap() == KeyStatus::Absent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.status(&key).await.unwrap(), KeyStatus::Absent);

    let retry = create(&coordinator, &request, &counter, "{}").await.unwrap();
    assert_eq!(retry.disposition, Disposition::Executed);
    assert_eq!(counter.count(), 2);
}

// ============================================================================
// Persistent backend
// ============================================================================

#[tokio::test]
async fn long_multibyte_key_is_deduplicated_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        IdempotencyStore::persistent(dir.path(), AcquirePolicy::no_retry(), system_clock())
            .await
            .unwrap();
    let coordinator = common::coordinator(&common::fast_config(), Arc::new(store));
    let counter = CallCounter::default();
    let request = RequestMeta::new(Method::POST, "/api/v1/tasks")
        .with_key("键".repeat(64))
        .with_owner("u1");

    let first = create(&coordinator, &request, &counter, r#"{"id":9}"#).await.unwrap();
    assert_eq!(first.disposition, Disposition::Executed);
    let second = create(&coordinator, &request, &counter, r#"{"id":9}"#).await.unwrap();
    assert_eq!(second.disposition, Disposition::Replayed);
    assert_eq!(second.body_bytes(), Some(&Bytes::from_static(br#"{"id":9}"#)));

    assert_eq!(counter.count(), 1);
    assert_eq!(coordinator.metrics().snapshot().unguarded, 0);
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn decisions_are_counted() {
    let coordinator = common::coordinator(&common::fast_config(), common::memory_store(system_clock()));
    let counter = CallCounter::default();

    create(&coordinator, &request(), &counter, "{}").await.unwrap();
    create(&coordinator, &request(), &counter, "{}").await.unwrap();
    create(&coordinator, &request().with_key(""), &counter, "{}").await.unwrap();
    create(
        &coordinator,
        &RequestMeta::new(Method::GET, "/api/v1/tasks"),
        &counter,
        "{}",
    )
    .await
    .unwrap();

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.execute, 1);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.replay, 1);
    assert_eq!(snapshot.rejected, 1);
    assert_eq!(snapshot.passthrough, 1);
    assert_eq!(snapshot.conflict, 0);
}

#[test]
fn default_config_protects_the_task_routes() {
    let coordinator = Coordinator::from_config(
        &Config::default(),
        common::memory_store(system_clock()),
    );
    assert!(coordinator.routes().is_protected(&Method::POST, "/api/v1/tasks"));
    assert!(coordinator.routes().is_protected(&Method::POST, "/api/v1/tasks/42/run"));
    assert!(!coordinator.routes().is_protected(&Method::DELETE, "/api/v1/tasks"));
}
