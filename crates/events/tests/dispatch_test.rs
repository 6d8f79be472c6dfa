//! Fan-out behavior of the event bus as seen by subscribing modules.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetsync_core::UnitId;
use fleetsync_events::{Event, EventBus, Listener, listener};

type Inbox = Arc<Mutex<Vec<Event>>>;

fn inbox() -> (Inbox, Listener) {
    let events: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let handler = listener(move |event| {
        let sink = Arc::clone(&sink);
        async move {
            if let Ok(mut guard) = sink.lock() {
                guard.push(event);
            }
        }
    });
    (events, handler)
}

fn types(inbox: &Inbox) -> Vec<String> {
    let mut types: Vec<String> = inbox
        .lock()
        .map(|events| events.iter().map(|e| e.event_type.clone()).collect())
        .unwrap_or_default();
    types.sort();
    types
}

#[tokio::test]
async fn test_deploy_wildcard_receives_deploy_events_only() {
    let bus = EventBus::new();
    let (received, handler) = inbox();
    bus.subscribe("deploy_*", handler).await;

    for event_type in ["deploy_success", "deploy_failed", "notify_info"] {
        bus.publish(Event::new(event_type, "test")).await;
    }
    bus.drain().await;

    assert_eq!(
        types(&received),
        vec!["deploy_failed".to_string(), "deploy_success".to_string()],
        "deploy_* must not receive notify_info"
    );
}

#[tokio::test]
async fn test_event_payload_reaches_subscriber_intact() {
    let bus = EventBus::new();
    let (received, handler) = inbox();
    bus.subscribe("deploy_success", handler).await;

    let unit = UnitId::new("alice", "app");
    bus.publish(
        Event::new("deploy_success", "reconciler")
            .with_unit(unit.clone())
            .with_detail("path", "stacks/alice/app")
            .with_message("deployed"),
    )
    .await;
    bus.drain().await;

    let events = received.lock().map(|g| g.clone()).unwrap_or_default();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.source, "reconciler");
    assert_eq!(event.unit.as_ref(), Some(&unit));
    assert_eq!(event.detail("path").and_then(|v| v.as_str()), Some("stacks/alice/app"));
    assert_eq!(event.message, "deployed");
}

#[tokio::test]
async fn test_slow_handler_does_not_delay_siblings() {
    let bus = EventBus::new();
    bus.subscribe(
        "ping",
        listener(|_event| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }),
    )
    .await;
    let (received, handler) = inbox();
    bus.subscribe("ping", handler).await;

    bus.publish(Event::new("ping", "test")).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while types(&received).is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(types(&received), vec!["ping".to_string()]);
    assert_eq!(bus.in_flight(), 1, "slow handler still running");
}

#[tokio::test]
async fn test_publish_without_subscribers_is_noop() {
    let bus = EventBus::new();
    assert_eq!(bus.publish(Event::new("orphan", "test")).await, 0);
    bus.drain().await;
    assert_eq!(bus.subscriber_count().await, 0);
}
