//! Stream reconciler tests.

mod common;

use idemgate::core::error::OperationError;
use idemgate::core::time::system_clock;
use idemgate::ops::metrics::CoordinatorMetrics;
use idemgate::store::{Begin, IdempotencyStore, KeyStatus, RecordKey, ResponseHead};
use idemgate::stream::{
    frames_from_iter, replay_stream, CaptureBinding, Frame, FrameKind, Reconciler, StreamSettings,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

fn settings() -> StreamSettings {
    StreamSettings {
        max_duration: Duration::from_secs(10),
        keep_alive: None,
        max_capture_bytes: 1024 * 1024,
        channel_capacity: 16,
        heartbeat: Duration::from_millis(100),
        lease: Duration::from_secs(1),
        record_ttl: Duration::from_secs(3_600),
        captured_headers: vec!["content-type".to_string()],
    }
}

fn head() -> ResponseHead {
    ResponseHead::new(200)
        .with_header("content-type", "text/event-stream")
        .with_header("x-request-id", "r-1")
}

async fn bind(store: &Arc<IdempotencyStore>, key: &RecordKey, lease: Duration) -> CaptureBinding {
    let Begin::Acquired(token) = store.begin(key, lease).await.unwrap() else {
        panic!("expected to acquire {key}");
    };
    CaptureBinding {
        store: store.clone(),
        key: key.clone(),
        token,
    }
}

async fn wait_for_status(store: &IdempotencyStore, key: &RecordKey, expected: KeyStatus) {
    for _ in 0..200 {
        if store.status(key).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{key} never reached {expected:?}");
}

fn payloads(frames: &[Frame]) -> Vec<&[u8]> {
    frames.iter().map(|f| f.data.as_ref()).collect()
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn live_and_replay_see_the_same_frames() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let metrics = Arc::new(CoordinatorMetrics::new());
    let reconciler = Reconciler::new(settings(), metrics.clone());

    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler
        .spawn(head(), frames_from_iter(common::greeting_frames()), Some(binding))
        .collect()
        .await;
    assert_eq!(payloads(&live), vec![&b"Hi"[..], b"there", b"done"]);
    assert!(live[2].is_terminal());

    let record = store.get(&key).await.expect("stream was recorded");
    assert!(record.response.is_stream());
    assert_eq!(record.response.head.header("content-type"), Some("text/event-stream"));
    assert_eq!(record.response.head.header("x-request-id"), None);

    let replayed: Vec<Frame> = replay_stream(&record.response).collect().await;
    assert_eq!(replayed, live);
    assert_eq!(metrics.snapshot().completed, 1);
    assert_eq!(metrics.active_streams(), 0);
}

#[tokio::test]
async fn unbound_stream_is_forwarded_without_recording() {
    let store = common::memory_store(system_clock());
    let reconciler = Reconciler::new(settings(), Arc::new(CoordinatorMetrics::new()));

    let live: Vec<Frame> = reconciler
        .spawn(head(), frames_from_iter(common::greeting_frames()), None)
        .collect()
        .await;
    assert_eq!(live.len(), 3);
    assert!(store.records().await.unwrap().is_empty());
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn producer_error_aborts_and_ends_with_error_frame() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let metrics = Arc::new(CoordinatorMetrics::new());
    let reconciler = Reconciler::new(settings(), metrics.clone());

    let frames = frames_from_iter(vec![
        Ok(Frame::data(None, "one")),
        Ok(Frame::data(None, "two")),
        Err(OperationError::new(503, "model overloaded")),
    ]);
    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler.spawn(head(), frames, Some(binding)).collect().await;

    assert_eq!(live.len(), 3);
    assert_eq!(payloads(&live[..2]), vec![&b"one"[..], b"two"]);
    assert_eq!(live[2].kind, FrameKind::Error);
    let error: serde_json::Value = serde_json::from_slice(&live[2].data).unwrap();
    assert_eq!(error["status"], 503);

    assert_eq!(store.status(&key).await.unwrap(), KeyStatus::Absent);
    assert_eq!(metrics.snapshot().aborted, 1);
}

#[tokio::test]
async fn missing_terminal_frame_is_a_failure() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let reconciler = Reconciler::new(settings(), Arc::new(CoordinatorMetrics::new()));

    let frames = frames_from_iter(vec![Ok(Frame::data(None, "partial"))]);
    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler.spawn(head(), frames, Some(binding)).collect().await;

    assert_eq!(live.last().unwrap().kind, FrameKind::Error);
    let error: serde_json::Value = serde_json::from_slice(&live[1].data).unwrap();
    assert_eq!(error["status"], 502);
    assert!(store.get(&key).await.is_none());
    assert_eq!(store.status(&key).await.unwrap(), KeyStatus::Absent);
}

#[tokio::test]
async fn caller_disconnect_mid_stream_aborts() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let metrics = Arc::new(CoordinatorMetrics::new());
    let reconciler = Reconciler::new(settings(), metrics.clone());

    let frames = common::paced_frames(
        vec![
            Ok(Frame::data(None, "1")),
            Ok(Frame::data(None, "2")),
            Ok(Frame::data(None, "3")),
            Ok(Frame::data(None, "4")),
            Ok(Frame::terminal(None, "5")),
        ],
        Duration::from_millis(30),
    );
    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let mut live = reconciler.spawn(head(), frames, Some(binding));

    assert_eq!(live.next().await.unwrap().data, "1");
    assert_eq!(live.next().await.unwrap().data, "2");
    drop(live);

    wait_for_status(&store, &key, KeyStatus::Absent).await;
    assert!(store.get(&key).await.is_none());
    assert_eq!(metrics.snapshot().completed, 0);
}

#[tokio::test]
async fn stream_is_cut_off_at_max_duration() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let reconciler = Reconciler::new(
        StreamSettings {
            max_duration: Duration::from_millis(150),
            ..settings()
        },
        Arc::new(CoordinatorMetrics::new()),
    );

    let frames = common::paced_frames(
        (0..20).map(|i| Ok(Frame::data(None, i.to_string()))).collect(),
        Duration::from_millis(50),
    );
    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler.spawn(head(), frames, Some(binding)).collect().await;

    let last = live.last().unwrap();
    assert_eq!(last.kind, FrameKind::Error);
    let error: serde_json::Value = serde_json::from_slice(&last.data).unwrap();
    assert_eq!(error["status"], 504);
    assert!(live.len() < 20);
    assert_eq!(store.status(&key).await.unwrap(), KeyStatus::Absent);
}

#[tokio::test]
async fn oversized_capture_is_forwarded_but_not_cached() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let metrics = Arc::new(CoordinatorMetrics::new());
    let reconciler = Reconciler::new(
        StreamSettings {
            max_capture_bytes: 4,
            ..settings()
        },
        metrics.clone(),
    );

    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler
        .spawn(head(), frames_from_iter(common::greeting_frames()), Some(binding))
        .collect()
        .await;

    assert_eq!(payloads(&live), vec![&b"Hi"[..], b"there", b"done"]);
    assert!(store.get(&key).await.is_none());
    assert_eq!(store.status(&key).await.unwrap(), KeyStatus::Absent);
    assert_eq!(metrics.capture_overflows.load(Ordering::Relaxed), 1);
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn heartbeat_keeps_the_lock_through_a_long_stream() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let metrics = Arc::new(CoordinatorMetrics::new());
    let reconciler = Reconciler::new(
        StreamSettings {
            lease: Duration::from_millis(300),
            heartbeat: Duration::from_millis(100),
            ..settings()
        },
        metrics.clone(),
    );

    let mut items: Vec<_> = (0..8).map(|i| Ok(Frame::data(None, i.to_string()))).collect();
    items.push(Ok(Frame::terminal(None, "end")));
    let frames = common::paced_frames(items, Duration::from_millis(100));

    let binding = bind(&store, &key, Duration::from_millis(300)).await;
    let live = reconciler.spawn(head(), frames, Some(binding));
    let consumer = tokio::spawn(async move { live.collect::<Vec<Frame>>().await });

    // Well past the original lease: a second execution must still be refused.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.begin(&key, Duration::from_secs(1)).await.unwrap(), Begin::Pending);

    let live = consumer.await.unwrap();
    assert_eq!(live.len(), 9);
    assert!(store.get(&key).await.is_some());
    assert!(metrics.snapshot().lease_renewals >= 3);
}

#[tokio::test]
async fn keep_alives_reach_the_caller_but_not_the_record() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let reconciler = Reconciler::new(
        StreamSettings {
            keep_alive: Some(Duration::from_millis(40)),
            ..settings()
        },
        Arc::new(CoordinatorMetrics::new()),
    );

    let frames = common::paced_frames(common::greeting_frames(), Duration::from_millis(150));
    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler.spawn(head(), frames, Some(binding)).collect().await;

    assert!(live.iter().any(|f| f.kind == FrameKind::KeepAlive));
    let data: Vec<_> = live
        .iter()
        .filter(|f| f.kind != FrameKind::KeepAlive)
        .cloned()
        .collect();
    assert_eq!(data.len(), 3);

    let record = store.get(&key).await.unwrap();
    let replayed: Vec<Frame> = replay_stream(&record.response).collect().await;
    assert_eq!(replayed, data);
}

#[tokio::test]
async fn unbounded_durations_do_not_overflow() {
    let store = common::memory_store(system_clock());
    let key = common::abc123();
    let reconciler = Reconciler::new(
        StreamSettings {
            max_duration: Duration::MAX,
            keep_alive: Some(Duration::MAX),
            ..settings()
        },
        Arc::new(CoordinatorMetrics::new()),
    );

    let binding = bind(&store, &key, Duration::from_secs(1)).await;
    let live: Vec<Frame> = reconciler
        .spawn(
            head(),
            common::paced_frames(common::greeting_frames(), Duration::from_millis(5)),
            Some(binding),
        )
        .collect()
        .await;

    assert_eq!(payloads(&live), vec![&b"Hi"[..], b"there", b"done"]);
    wait_for_status(&store, &key, KeyStatus::Completed).await;
}
