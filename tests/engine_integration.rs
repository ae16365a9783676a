//! Integration tests for the engine against a scripted transport

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;

use devmgr_app::{ChannelListener, DeviceListener, Engine, EngineEvent, Settings};
use devmgr_core::{parse_since, DiscoveryEvent};
use devmgr_daemon::test_utils::{ready, MockTransport};

fn engine(mock: &Arc<MockTransport>) -> Engine<MockTransport> {
    let mut settings = Settings::default();
    settings.scripts.dir = Some(std::env::temp_dir().join("devmgr-no-scripts"));
    settings.logging.flush_interval_ms = 20;
    Engine::new(Arc::clone(mock), settings)
}

/// Poll `check` until it holds or two seconds pass
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn next_log_batch(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<String> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no log batch delivered")
            .expect("channel closed");
        if let EngineEvent::LogEntries { entries, .. } = event {
            return entries.into_iter().map(|e| e.message).collect();
        }
    }
}

#[tokio::test]
async fn test_new_ready_device_is_added_and_fetched_once() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine(&mock);
    let mut events = engine.subscribe();
    let (listener, _rx) = ChannelListener::channel();

    mock.push_snapshot(vec![ready("ABC123")]);
    engine.start_discovery(Arc::new(listener));

    eventually(|| {
        engine
            .device("ABC123")
            .is_some_and(|d| d.has_fetched_details)
    })
    .await;

    let device = engine.device("ABC123").unwrap();
    assert!(device.is_online);
    assert!(device.status.is_none());

    let mut added = 0;
    while let Ok(event) = events.try_recv() {
        if event.is_added() {
            added += 1;
        }
    }
    assert_eq!(added, 1);
    assert_eq!(mock.count_calls("getprop ABC123"), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_repeated_snapshots_never_refetch() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine(&mock);
    let (listener, _rx) = ChannelListener::channel();

    mock.push_snapshot(vec![ready("S1")]);
    engine.start_discovery(Arc::new(listener));
    eventually(|| engine.device("S1").is_some_and(|d| d.has_fetched_details)).await;

    mock.push_snapshot(vec![ready("S1")]);
    mock.push_snapshot(vec![ready("S1"), ready("S1")]);
    mock.push_snapshot(vec![ready("S1")]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mock.count_calls("getprop S1"), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_device_keeps_cache_and_returns() {
    let mock = Arc::new(MockTransport::new());
    mock.set_properties("S1", &[(devmgr_core::props::MODEL, "Pixel 7")]);
    let engine = engine(&mock);
    let mut events = engine.subscribe();
    let (listener, mut rx) = ChannelListener::channel();

    mock.push_snapshot(vec![ready("S1")]);
    engine.start_discovery(Arc::new(listener));
    eventually(|| engine.device("S1").is_some_and(|d| d.has_fetched_details)).await;

    mock.push_snapshot(vec![]);
    eventually(|| engine.device("S1").is_some_and(|d| !d.is_online)).await;
    assert_eq!(engine.devices().len(), 1);

    mock.push_snapshot(vec![ready("S1")]);
    eventually(|| engine.device("S1").is_some_and(|d| d.is_online)).await;

    let device = engine.device("S1").unwrap();
    assert_eq!(device.display_name(), "Pixel 7 - S1");
    assert_eq!(mock.count_calls("getprop S1"), 1);

    let kinds: Vec<&'static str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| match e {
            DiscoveryEvent::Added(_) => "added",
            DiscoveryEvent::Updated(_) => "updated",
            DiscoveryEvent::Removed(_) => "removed",
            DiscoveryEvent::Error(_) => "error",
        })
        .collect();
    assert_eq!(kinds, vec!["added", "removed", "updated"]);

    let removed = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, EngineEvent::DeviceRemoved { .. }))
        .count();
    assert_eq!(removed, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_watch_failure_reaches_listener() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine(&mock);
    let (listener, mut rx) = ChannelListener::channel();
    let listener: Arc<dyn DeviceListener> = Arc::new(listener);

    mock.fail_watch("adb server went away");
    engine.start_discovery(listener);

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        EngineEvent::Error { message } => assert!(message.contains("adb server went away")),
        other => panic!("unexpected {other:?}"),
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_log_stream_filters_and_restarts() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine(&mock);
    let (listener, mut rx) = ChannelListener::channel();
    let listener = Arc::new(listener);

    let mut first = mock.log_stream("S1");
    let mut second = mock.log_stream("S1");
    let since = parse_since("10-16 11:34:00");

    engine.start_logs("S1", since, listener.clone()).await;
    first
        .write_all(
            b"--------- beginning of main\n\
              10-16 11:33:59.000  100  100 I Old: too early\n\
              10-16 11:34:17.824  1234  1256 I Tag: kept\n",
        )
        .await
        .unwrap();
    assert_eq!(next_log_batch(&mut rx).await, vec!["kept"]);

    // Restarting replaces the first stream
    engine.start_logs("S1", since, listener).await;
    assert_eq!(engine.logs().active_count(), 1);

    second
        .write_all(b"10-16 11:35:00.000  1234  1256 W Tag: from second\n")
        .await
        .unwrap();
    assert_eq!(next_log_batch(&mut rx).await, vec!["from second"]);

    assert!(engine.stop_logs("S1"));
    engine.shutdown().await;
    assert_eq!(engine.logs().active_count(), 0);
}
