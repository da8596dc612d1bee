//! Log broadcaster unit tests

use deployd::models::deployment::DeploymentStatus;
use deployd::stream::broadcaster::LogBroadcaster;
use deployd::stream::frame::{FrameKind, StreamFrame};

#[test]
fn test_publish_reaches_every_subscriber() {
    let broadcaster = LogBroadcaster::new();
    let mut first = broadcaster.attach("dep-1");
    let mut second = broadcaster.attach("dep-1");
    assert_ne!(first.id, second.id);

    let frame = StreamFrame::update("==> [fetch] Pulling origin/main\n", DeploymentStatus::Running);
    assert_eq!(broadcaster.publish("dep-1", &frame), 2);

    for sub in [&mut first, &mut second] {
        let received = sub.frames.try_recv().unwrap();
        assert_eq!(received.kind, FrameKind::Update);
        assert_eq!(received.phase.as_deref(), Some("fetch"));
    }
}

#[test]
fn test_deployments_are_isolated() {
    let broadcaster = LogBroadcaster::new();
    let mut other = broadcaster.attach("dep-2");
    let _watched = broadcaster.attach("dep-1");

    broadcaster.publish("dep-1", &StreamFrame::heartbeat());
    assert!(other.frames.try_recv().is_err());
    assert_eq!(broadcaster.publish("dep-3", &StreamFrame::heartbeat()), 0);
}

#[test]
fn test_frames_in_publish_order() {
    let broadcaster = LogBroadcaster::new();
    let mut sub = broadcaster.attach("dep-1");

    broadcaster.publish("dep-1", &StreamFrame::update("a\n", DeploymentStatus::Running));
    broadcaster.publish("dep-1", &StreamFrame::update("a\nb\n", DeploymentStatus::Running));
    broadcaster.publish("dep-1", &StreamFrame::final_state("a\nb\n", DeploymentStatus::Success));

    let kinds: Vec<FrameKind> = std::iter::from_fn(|| sub.frames.try_recv().ok())
        .map(|f| f.kind)
        .collect();
    assert_eq!(kinds, vec![FrameKind::Update, FrameKind::Update, FrameKind::Final]);
}

#[test]
fn test_detach_stops_delivery() {
    let broadcaster = LogBroadcaster::new();
    let sub = broadcaster.attach("dep-1");
    assert_eq!(broadcaster.subscriber_count("dep-1"), 1);

    broadcaster.detach("dep-1", sub.id);
    assert_eq!(broadcaster.subscriber_count("dep-1"), 0);
    assert_eq!(broadcaster.publish("dep-1", &StreamFrame::heartbeat()), 0);
}

#[test]
fn test_dropped_subscriber_is_pruned() {
    let broadcaster = LogBroadcaster::new();
    let kept = broadcaster.attach("dep-1");
    let dropped = broadcaster.attach("dep-1");
    drop(dropped);

    assert_eq!(broadcaster.publish("dep-1", &StreamFrame::heartbeat()), 1);
    assert_eq!(broadcaster.subscriber_count("dep-1"), 1);
    drop(kept);
}
