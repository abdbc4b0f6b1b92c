//! Discovery protocol tests
//!
//! Announce, discover and leave traffic flows through the loopback broker into
//! the presence manager; assertions are made on the emitted updates.


use bytes::Bytes;
use mqtt_presence::device::{Identity, InfoUpdate};
use mqtt_presence::server::UpdateType;
use mqtt_presence::transport::Transport;
use presence_harness::{assert_quiet, device, eventually, next_update, PresenceHarness};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[tokio::test]
async fn test_announce_before_discover_is_not_reachable_until_reannounced() {
    // Arrange: a retained announcement from an earlier session
    let harness = PresenceHarness::connected(50).await;
    let lamp = device("lights/lamp", "bridge-1");
    harness.seed_announce(&lamp).await;

    // Act: start discovery at t=0, re-announce at t=100ms
    let started = Instant::now();
    let (_manager, mut updates) = harness.manager();

    let added = next_update(&mut updates).await;
    tokio::time::sleep_until(started + Duration::from_millis(100)).await;
    harness.announce(&lamp).await;
    let updated = next_update(&mut updates).await;

    // Assert
    assert_eq!(added.update_type, UpdateType::Added);
    assert!(!added.device.is_reachable());
    assert_eq!(updated.update_type, UpdateType::Updated);
    assert_eq!(updated.changes, vec![InfoUpdate::new("reachable", "0", "1")]);
    assert!(updated.device.is_reachable());
    assert_quiet(&mut updates).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_discover_trigger_published_once_after_delay() {
    let harness = PresenceHarness::connected(40).await;
    let (_manager, _updates) = harness.manager();

    sleep(Duration::from_millis(10)).await;
    assert!(harness.broker.published_to("discover").await.is_empty());

    let broker = harness.broker.clone();
    assert!(
        eventually(|| {
            let broker = broker.clone();
            async move { !broker.published_to("discover").await.is_empty() }
        })
        .await
    );
    sleep(Duration::from_millis(80)).await;

    let triggers = harness.broker.published_to("discover").await;
    assert_eq!(triggers.len(), 1);
    assert!(triggers[0].1, "discover trigger must be retained");
    assert!(harness.transport.discovery().discover_sent());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_leave_marks_every_device_of_the_will_unreachable() {
    // Arrange: three live devices, two behind the same connection
    let harness = PresenceHarness::connected(20).await;
    let (_manager, mut updates) = harness.manager();
    sleep(Duration::from_millis(60)).await;

    for info in [
        device("lights/kitchen", "bridge-1"),
        device("lights/hall", "bridge-1"),
        device("lights/porch", "bridge-2"),
    ] {
        harness.announce(&info).await;
        let added = next_update(&mut updates).await;
        assert_eq!(added.update_type, UpdateType::Added);
        assert!(added.device.is_reachable());
    }

    // Act
    harness.leave("bridge-1");

    // Assert: one unreachable update per device of that will
    let mut left = BTreeSet::new();
    for _ in 0..2 {
        let update = next_update(&mut updates).await;
        assert_eq!(update.update_type, UpdateType::Updated);
        assert_eq!(update.changes, vec![InfoUpdate::unreachable()]);
        left.insert(update.device.id());
    }
    assert_eq!(
        left,
        BTreeSet::from(["lights/hall".to_string(), "lights/kitchen".to_string()])
    );
    assert_quiet(&mut updates).await;

    let discovery = harness.transport.discovery();
    assert!(discovery.devices_for_will("bridge-1").is_empty());
    assert_eq!(discovery.will_ids(), vec!["bridge-2".to_string()]);

    // The bucket is gone, so the same leave again does nothing
    harness.leave("bridge-1");
    assert_quiet(&mut updates).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_device_moving_to_new_will_is_not_left_behind() {
    let harness = PresenceHarness::connected(20).await;
    let (manager, mut updates) = harness.manager();
    sleep(Duration::from_millis(60)).await;

    harness.announce(&device("lights/lamp", "bridge-1")).await;
    next_update(&mut updates).await;
    harness.announce(&device("lights/lamp", "bridge-2")).await;
    let moved = next_update(&mut updates).await;
    assert_eq!(
        moved.changes,
        vec![InfoUpdate::new("lastWillID", "bridge-1", "bridge-2")]
    );

    harness.leave("bridge-1");
    assert_quiet(&mut updates).await;
    assert!(manager.device("lights/lamp").is_reachable());

    harness.leave("bridge-2");
    let left = next_update(&mut updates).await;
    assert_eq!(left.changes, vec![InfoUpdate::unreachable()]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cleared_announcement_removes_device_once() {
    let harness = PresenceHarness::connected(20).await;
    let (manager, mut updates) = harness.manager();
    sleep(Duration::from_millis(60)).await;

    harness.announce(&device("lights/lamp", "bridge-1")).await;
    next_update(&mut updates).await;

    harness
        .transport
        .publish_meta("lights/lamp", Bytes::new())
        .await
        .unwrap();
    let removed = next_update(&mut updates).await;
    assert_eq!(removed.update_type, UpdateType::Removed);
    assert!(!manager.has_device("lights/lamp"));

    harness
        .transport
        .publish_meta("lights/lamp", Bytes::new())
        .await
        .unwrap();
    harness
        .transport
        .publish_meta("lights/never-seen", Bytes::new())
        .await
        .unwrap();
    assert_quiet(&mut updates).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_announcement_is_dropped() {
    let harness = PresenceHarness::connected(20).await;
    let (manager, mut updates) = harness.manager();

    harness
        .script
        .message("announce/lights/broken", "{not json", true);
    assert_quiet(&mut updates).await;
    assert!(!manager.has_device("lights/broken"));

    // The stream keeps working afterwards
    harness.announce(&device("lights/lamp", "bridge-1")).await;
    assert_eq!(
        next_update(&mut updates).await.update_type,
        UpdateType::Added
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_identical_reannounce_emits_nothing() {
    let harness = PresenceHarness::connected(20).await;
    let (_manager, mut updates) = harness.manager();
    sleep(Duration::from_millis(60)).await;

    let lamp = device("lights/lamp", "bridge-1");
    harness.announce(&lamp).await;
    next_update(&mut updates).await;

    harness.announce(&lamp).await;
    harness.announce(&lamp).await;
    assert_quiet(&mut updates).await;

    harness.shutdown().await;
}
