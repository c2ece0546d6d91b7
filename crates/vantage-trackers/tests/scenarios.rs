//! End-to-end tracking scenarios through a `TrackerHost`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use vantage_trackers::memory::{ElementDef, MemoryRoot};
use vantage_trackers::{
    AnalyticsRoot, EventRecord, Listener, ScrollGeometry, TrackerError, TrackerHost,
    TrackingSettings, VERTICAL_BOUNDARY_VAR,
};
use vantage_types::{RootKind, ScrollSpec, Selector, TimerSpec, TriggerConfig, Vars};

fn collector() -> (Listener, Arc<Mutex<Vec<EventRecord>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Listener =
        Arc::new(move |record: EventRecord| sink.lock().expect("lock").push(record));
    (listener, seen)
}

fn count(seen: &Arc<Mutex<Vec<EventRecord>>>) -> usize {
    seen.lock().expect("lock").len()
}

fn setup() -> (Arc<MemoryRoot>, Arc<TrackerHost>) {
    let root = MemoryRoot::new(RootKind::AmpDoc);
    let host = TrackerHost::new(root.clone(), TrackingSettings::default());
    (root, host)
}

fn scrolled_to(percent: f64) -> ScrollGeometry {
    ScrollGeometry {
        top: percent * 10.0 - 100.0,
        height: 100.0,
        width: 100.0,
        scroll_height: 1000.0,
        scroll_width: 100.0,
        initial_scroll_height: 1000.0,
        initial_scroll_width: 100.0,
        ..ScrollGeometry::default()
    }
}

// ── scroll ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scroll_boundaries_fire_once_each() {
    let (root, host) = setup();
    let (listener, seen) = collector();
    let config = TriggerConfig {
        scroll_spec: Some(ScrollSpec {
            vertical_boundaries: Some(vec![12.0, 47.0]),
            ..ScrollSpec::default()
        }),
        ..TriggerConfig::on("scroll")
    };
    let _ = host
        .add_trigger(&root.root_element(), &config, listener)
        .expect("scroll trigger should register");

    root.scroll(&scrolled_to(30.0));
    assert_eq!(count(&seen), 1);
    assert_eq!(
        seen.lock().expect("lock")[0].var(VERTICAL_BOUNDARY_VAR),
        Some(&json!("10"))
    );

    root.scroll(&scrolled_to(46.0));
    assert_eq!(count(&seen), 2);
    assert_eq!(
        seen.lock().expect("lock")[1].var(VERTICAL_BOUNDARY_VAR),
        Some(&json!("45"))
    );

    root.scroll(&scrolled_to(100.0));
    root.scroll(&scrolled_to(20.0));
    assert_eq!(count(&seen), 2);

    host.dispose();
    assert_eq!(root.memory_scroll_manager().handler_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scroll_without_boundaries_is_a_soft_failure() {
    let (root, host) = setup();
    let (listener, _) = collector();
    let unlisten = host
        .add_trigger(&root.root_element(), &TriggerConfig::on("scroll"), listener)
        .expect("soft failure should not error");
    assert!(unlisten.is_noop());
    assert_eq!(root.memory_scroll_manager().handler_count(), 0);
}

// ── timer ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn immediate_timer_fires_at_once_and_after_each_interval() {
    let (root, host) = setup();
    let (listener, seen) = collector();
    let config = TriggerConfig {
        timer_spec: Some(TimerSpec {
            interval: Some(1.0),
            immediate: Some(true),
            ..TimerSpec::default()
        }),
        ..TriggerConfig::on("timer")
    };
    let unlisten = host
        .add_trigger(&root.root_element(), &config, listener)
        .expect("timer trigger should register");
    assert_eq!(count(&seen), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(count(&seen), 2);

    unlisten.cancel();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(count(&seen), 3);
}

#[tokio::test(start_paused = true)]
async fn timer_runs_between_start_and_stop_clicks() {
    let (root, host) = setup();
    let play = root.insert(None, ElementDef::new("button").selector("#play"));
    let pause = root.insert(None, ElementDef::new("button").selector("#pause"));
    let (listener, seen) = collector();

    let config = TriggerConfig {
        timer_spec: Some(TimerSpec {
            interval: Some(2.0),
            immediate: Some(false),
            start_spec: Some(Box::new(
                TriggerConfig::on("click").with_selector(Selector::one("#play")),
            )),
            stop_spec: Some(Box::new(
                TriggerConfig::on("click").with_selector(Selector::one("#pause")),
            )),
            ..TimerSpec::default()
        }),
        ..TriggerConfig::on("timer")
    };
    let _ = host
        .add_trigger(&root.root_element(), &config, listener)
        .expect("timer trigger should register");

    root.click(&pause);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&seen), 0, "idle timer ignores stop");

    root.click(&play);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&seen), 2);

    root.click(&pause);
    assert_eq!(count(&seen), 3);
    assert_eq!(
        seen.lock().expect("lock")[2].var("timerDuration"),
        Some(&json!(1000))
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&seen), 3);
}

// ── custom ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn buffered_custom_events_replay_in_order() {
    let (root, host) = setup();
    let section = root.insert(None, ElementDef::new("section").selector("#main"));
    let custom = host.custom_tracker().expect("custom tracker is allowed");

    for n in 0..3 {
        let mut vars = Vars::new();
        vars.insert("n".to_string(), json!(n));
        custom.trigger(EventRecord::new(section.clone(), "x", vars));
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (listener, seen) = collector();
    let _ = host
        .add_trigger(&root.root_element(), &TriggerConfig::on("x"), listener)
        .expect("custom trigger should register");
    tokio::time::sleep(Duration::from_millis(1)).await;

    let order: Vec<_> = seen
        .lock()
        .expect("lock")
        .iter()
        .map(|r| r.var("n").cloned())
        .collect();
    assert_eq!(order, vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
}

#[tokio::test(start_paused = true)]
async fn custom_events_after_the_window_are_not_buffered() {
    let (root, host) = setup();
    let custom = host.custom_tracker().expect("custom tracker is allowed");

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(custom.buffer_expired());
    custom.trigger(EventRecord::new(root.root_element(), "late", Vars::new()));

    let (listener, seen) = collector();
    let _ = host
        .add_trigger(&root.root_element(), &TriggerConfig::on("late"), listener)
        .expect("custom trigger should register");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(count(&seen), 0);
}

// ── host ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timer_roots_reject_document_only_trackers() {
    let root = MemoryRoot::new(RootKind::Embed);
    let host = TrackerHost::new(root.clone(), TrackingSettings::default());
    let (listener, _) = collector();

    let click = TriggerConfig::on("click").with_selector(Selector::one("html"));
    assert!(host
        .add_trigger(&root.root_element(), &click, listener.clone())
        .is_ok());

    let timer_root = MemoryRoot::new(RootKind::Timer);
    let timer_host = TrackerHost::new(timer_root.clone(), TrackingSettings::default());
    let err = timer_host
        .add_trigger(
            &timer_root.root_element(),
            &TriggerConfig::on("story-page-visible"),
            listener,
        )
        .expect_err("story is not allowed in a timer root");
    assert!(matches!(err, TrackerError::Unavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn dispose_detaches_root_listeners() {
    let (root, host) = setup();
    let button = root.insert(None, ElementDef::new("button").selector("#buy"));
    let (listener, seen) = collector();
    let _ = host
        .add_trigger(
            &root.root_element(),
            &TriggerConfig::on("click").with_selector(Selector::one("#buy")),
            listener,
        )
        .expect("click trigger should register");

    root.click(&button);
    assert_eq!(count(&seen), 1);

    host.dispose();
    assert_eq!(root.root_listener_count("click"), 0);
    root.click(&button);
    assert_eq!(count(&seen), 1);
}
