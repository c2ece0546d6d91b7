//! Visibility triggers.
//!
//! Measurement itself belongs to the root's [`VisibilityManager`]. This
//! tracker decides what is measured (the root, or each element a selector
//! resolves to), when measurement may begin (`waitFor`, delegated to a
//! signal-style tracker) and when the result is reported (`reportWhen`).
//!
//! [`VisibilityManager`]: crate::root::VisibilityManager

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures_util::FutureExt;
use tokio::sync::oneshot;
use vantage_types::{
    ready_now, signals, ElementRef, EventRecord, ReadyFuture, RootKind, TriggerConfig, Vars,
};

use crate::error::TrackerError;
use crate::registry::{types_allowed_for, TrackerDeps, TrackerKey, TrackerLookup};
use crate::root::{AnalyticsRoot, StateCallback, StopFactory, WindowEvent};
use crate::tracker::{selector_scope, EventTracker, Listener, ReadinessSource};
use crate::unlisten::Unlisten;

pub const DOCUMENT_HIDDEN: &str = "documentHidden";
pub const DOCUMENT_EXIT: &str = "documentExit";
/// `waitFor` value that disables waiting.
pub const WAIT_FOR_NONE: &str = "none";

type Trigger = Arc<dyn Fn() + Send + Sync>;

/// Cancels the wrapped registration when dropped.
struct CancelOnDrop(Option<Unlisten>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(unlisten) = self.0.take() {
            unlisten.cancel();
        }
    }
}

/// A trigger and the completion its first call resolves.
fn latch() -> (Trigger, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let trigger: Trigger = Arc::new(move || {
        if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    });
    (trigger, rx)
}

/// Awaits `rx`, keeping `registration` attached until then.
fn held_until(rx: oneshot::Receiver<()>, registration: Unlisten) -> ReadyFuture {
    async move {
        let _guard = CancelOnDrop(Some(registration));
        if rx.await.is_err() {
            futures_util::future::pending::<()>().await;
        }
    }
    .boxed()
}

/// Resolves once the document is hidden (immediately if it already is).
fn document_hidden_stop(root: &Arc<dyn AnalyticsRoot>) -> StopFactory {
    let weak = Arc::downgrade(root);
    Arc::new(move || {
        let Some(root) = weak.upgrade() else {
            return futures_util::future::pending::<()>().boxed();
        };
        if !root.document_visible() {
            return ready_now();
        }
        let (trigger, rx) = latch();
        let watched = Arc::downgrade(&root);
        let registration = root.on_visibility_change(Arc::new(move || {
            if watched.upgrade().is_some_and(|root| !root.document_visible()) {
                trigger();
            }
        }));
        held_until(rx, registration)
    })
}

/// Resolves on the first `pagehide`, or on `unload` where `pagehide` is
/// unsupported. Never listens for both.
fn document_exit_stop(root: &Arc<dyn AnalyticsRoot>) -> StopFactory {
    let weak = Arc::downgrade(root);
    Arc::new(move || {
        let Some(root) = weak.upgrade() else {
            return futures_util::future::pending::<()>().boxed();
        };
        let event = if root.supports_page_hide() {
            WindowEvent::PageHide
        } else {
            WindowEvent::Unload
        };
        let (trigger, rx) = latch();
        let registration = root.add_window_listener(event, trigger);
        held_until(rx, registration)
    })
}

/// Builds the record for one measurement. Declared variables win over
/// measured state on key collisions.
fn on_event(event_type: &str, listener: Listener, target: ElementRef) -> StateCallback {
    let event_type = event_type.to_string();
    Arc::new(move |mut state: Vars| {
        state.extend(target.declared_vars());
        listener(EventRecord::without_declared_vars(
            target.clone(),
            event_type.clone(),
            state,
        ));
    })
}

struct VisibilityInner {
    root: Arc<dyn AnalyticsRoot>,
    lookup: Weak<dyn TrackerLookup>,
    wait_for_trackers: Mutex<HashMap<TrackerKey, Arc<dyn ReadinessSource>>>,
}

impl VisibilityInner {
    fn wait_for_tracker(&self, key: TrackerKey) -> Option<Arc<dyn ReadinessSource>> {
        if let Some(cached) = self
            .wait_for_trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Some(cached.clone());
        }
        let tracker = self
            .lookup
            .upgrade()?
            .tracker_for_allowlist(key, &types_allowed_for(RootKind::Visible))?
            .readiness()?;
        self.wait_for_trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, tracker.clone());
        Some(tracker)
    }

    /// The readiness gate for a root (`element` is `None`) or element target.
    ///
    /// Without `waitFor`, roots wait for nothing unless a root selector was
    /// given explicitly, and elements wait for `ini-load`.
    fn ready_signal(
        &self,
        wait_for: Option<&str>,
        selector_given: bool,
        element: Option<&ElementRef>,
    ) -> Result<Option<ReadyFuture>, TrackerError> {
        let wait_for = match wait_for.filter(|w| !w.is_empty()) {
            Some(wait_for) => wait_for,
            None if selector_given => signals::INI_LOAD,
            None => return Ok(None),
        };
        if wait_for == WAIT_FOR_NONE {
            return Ok(None);
        }
        let key = wait_for
            .parse::<TrackerKey>()
            .ok()
            .filter(|key| types_allowed_for(RootKind::Visible).contains_key(key))
            .ok_or_else(|| {
                TrackerError::Unavailable(format!("waitFor value {wait_for} not supported"))
            })?;
        let Some(tracker) = self.wait_for_tracker(key) else {
            return Ok(None);
        };
        Ok(Some(match element {
            Some(element) => tracker.element_signal(wait_for, element),
            None => tracker.root_signal(wait_for),
        }))
    }

    fn element_ready(
        &self,
        wait_for: Option<&str>,
        element: &ElementRef,
    ) -> Result<Option<ReadyFuture>, TrackerError> {
        if element.signals().is_none() {
            return match wait_for.filter(|w| !w.is_empty()) {
                None | Some(WAIT_FOR_NONE) => Ok(None),
                Some(other) => Err(TrackerError::Unavailable(format!(
                    "Element <{}> is not an AMP element and cannot wait for {other}",
                    element.tag_name()
                ))),
            };
        }
        self.ready_signal(wait_for, true, Some(element))
    }
}

/// Tracks `visible` and `hidden` triggers.
pub struct VisibilityTracker {
    inner: Arc<VisibilityInner>,
}

impl VisibilityTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            inner: Arc::new(VisibilityInner {
                root: deps.root.clone(),
                lookup: deps.lookup.clone(),
                wait_for_trackers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl EventTracker for VisibilityTracker {
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let spec = config.visibility_spec.clone().unwrap_or_default();
        let selector = config
            .selector
            .as_ref()
            .or(spec.selector.as_ref())
            .filter(|s| !s.is_empty())
            .cloned();

        let mut report_when = spec.report_when.clone().filter(|r| !r.is_empty());
        if report_when.is_some() && spec.repeat.unwrap_or(false) {
            return Err(TrackerError::assertion(
                "reportWhen and repeat are mutually exclusive.",
            ));
        }
        if event_type == "hidden" {
            if report_when.is_some() {
                tracing::error!("ReportWhen should not be defined when eventType is \"hidden\"");
            }
            report_when = Some(DOCUMENT_HIDDEN.to_string());
        }

        let root = &self.inner.root;
        let stop = match report_when.as_deref() {
            None => None,
            Some(DOCUMENT_HIDDEN) => Some(document_hidden_stop(root)),
            Some(DOCUMENT_EXIT) => Some(document_exit_stop(root)),
            Some(other) => {
                tracing::error!("reportWhen value {other} not supported.");
                return Ok(Unlisten::noop());
            }
        };

        let manager = root.visibility_manager();
        let wait_for = spec.wait_for.clone();

        if selector.as_ref().map_or(true, |s| s.is_root()) {
            let ready =
                match self
                    .inner
                    .ready_signal(wait_for.as_deref(), selector.is_some(), None)
                {
                    Ok(ready) => ready,
                    Err(err) => {
                        tracing::error!(error = %err, "visibility trigger ignored");
                        return Ok(Unlisten::noop());
                    }
                };
            let callback = on_event(event_type, listener, root.root_element());
            return Ok(manager.listen_root(&spec, ready, stop, callback));
        }

        let selectors = selector.map(|s| s.to_list()).unwrap_or_default();
        let method = config.selection_method.or(spec.selection_method);
        let resolving = root.resolve_elements(&selector_scope(context), &selectors, method);

        // `None` once the registration is cancelled.
        let registrations: Arc<Mutex<Option<Vec<Unlisten>>>> =
            Arc::new(Mutex::new(Some(Vec::new())));
        let slot = registrations.clone();
        let weak = Arc::downgrade(&self.inner);
        let event_type = event_type.to_string();
        let task = tokio::spawn(async move {
            let elements = match resolving.await {
                Ok(elements) => elements,
                Err(err) => {
                    tracing::warn!(error = %err, "visibility trigger target did not resolve");
                    return;
                }
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            for element in elements {
                let ready = match inner.element_ready(wait_for.as_deref(), &element) {
                    Ok(ready) => ready,
                    Err(err) => {
                        tracing::error!(error = %err, "visibility trigger ignored for element");
                        continue;
                    }
                };
                let callback = on_event(&event_type, listener.clone(), element.clone());
                let registration =
                    manager.listen_element(&element, &spec, ready, stop.clone(), callback);
                let rejected = {
                    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                    match slot.as_mut() {
                        Some(list) => {
                            list.push(registration);
                            None
                        }
                        None => Some(registration),
                    }
                };
                if let Some(registration) = rejected {
                    registration.cancel();
                }
            }
        });

        Ok(Unlisten::new(move || {
            task.abort();
            let taken = registrations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            for registration in taken.into_iter().flatten() {
                registration.cancel();
            }
        }))
    }

    fn dispose(&self) {
        self.inner
            .wait_for_trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TrackerHost;
    use crate::memory::{ElementDef, MemoryRoot};
    use crate::settings::TrackingSettings;
    use crate::tracker::Tracker;
    use serde_json::json;
    use std::time::Duration;
    use vantage_types::{Selector, VisibilitySpec};

    fn visibility_tracker(host: &Arc<TrackerHost>) -> Arc<VisibilityTracker> {
        match host.tracker(TrackerKey::Visible) {
            Some(Tracker::Visibility(tracker)) => tracker,
            other => panic!("expected a visibility tracker, got {other:?}"),
        }
    }

    fn setup() -> (Arc<MemoryRoot>, Arc<TrackerHost>, Arc<VisibilityTracker>) {
        let root = MemoryRoot::new(RootKind::AmpDoc);
        let host = TrackerHost::new(root.clone(), TrackingSettings::default());
        let tracker = visibility_tracker(&host);
        (root, host, tracker)
    }

    fn collector() -> (Listener, Arc<Mutex<Vec<EventRecord>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener =
            Arc::new(move |record: EventRecord| sink.lock().expect("lock").push(record));
        (listener, seen)
    }

    fn with_spec(config: TriggerConfig, spec: VisibilitySpec) -> TriggerConfig {
        TriggerConfig {
            visibility_spec: Some(spec),
            ..config
        }
    }

    fn state(visible_ms: u64) -> Vars {
        let mut state = Vars::new();
        state.insert("totalVisibleTime".to_string(), json!(visible_ms));
        state
    }

    fn count(seen: &Arc<Mutex<Vec<EventRecord>>>) -> usize {
        seen.lock().expect("lock").len()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // ── validation tests ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn report_when_and_repeat_are_exclusive() {
        let (root, _host, tracker) = setup();
        let (listener, _) = collector();
        let config = with_spec(
            TriggerConfig::on("visible"),
            VisibilitySpec {
                report_when: Some(DOCUMENT_EXIT.into()),
                repeat: Some(true),
                ..VisibilitySpec::default()
            },
        );
        let err = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect_err("exclusive options should fail");
        assert_eq!(
            err,
            TrackerError::Assertion("reportWhen and repeat are mutually exclusive.".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_values_are_soft_failures() {
        let (root, _host, tracker) = setup();
        let (listener, _) = collector();

        for spec in [
            VisibilitySpec {
                report_when: Some("documentLater".into()),
                ..VisibilitySpec::default()
            },
            VisibilitySpec {
                wait_for: Some("click".into()),
                ..VisibilitySpec::default()
            },
        ] {
            let config = with_spec(TriggerConfig::on("visible"), spec);
            let unlisten = tracker
                .add(&root.root_element(), "visible", &config, listener.clone())
                .expect("soft failure should not error");
            assert!(unlisten.is_noop());
        }
        assert!(root.memory_visibility_manager().listens().is_empty());
    }

    // ── root target tests ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn root_without_selector_reports_immediately() {
        let (root, _host, tracker) = setup();
        let (listener, seen) = collector();
        let _ = tracker
            .add(&root.root_element(), "visible", &TriggerConfig::on("visible"), listener)
            .expect("add should succeed");

        root.report_visible(&root.root_element(), state(500));
        settle().await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type(), "visible");
        assert_eq!(seen[0].target().id(), root.root_element().id());
        assert_eq!(seen[0].var("totalVisibleTime"), Some(&json!(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_root_selector_waits_for_ini_load() {
        let (root, _host, tracker) = setup();
        let (listener, seen) = collector();
        let config = TriggerConfig::on("visible").with_selector(Selector::one(":root"));
        let _ = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect("add should succeed");

        root.report_visible(&root.root_element(), state(500));
        settle().await;
        assert_eq!(count(&seen), 0);

        root.fire_signal(signals::INI_LOAD);
        settle().await;
        assert_eq!(count(&seen), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn document_hidden_resolves_at_once_when_already_hidden() {
        let (root, _host, tracker) = setup();
        let (listener, seen) = collector();
        root.set_document_visible(false);

        let config = with_spec(
            TriggerConfig::on("visible"),
            VisibilitySpec {
                report_when: Some(DOCUMENT_HIDDEN.into()),
                ..VisibilitySpec::default()
            },
        );
        let _ = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect("add should succeed");
        root.report_visible(&root.root_element(), state(100));
        settle().await;
        assert_eq!(count(&seen), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_event_waits_for_the_document_to_hide() {
        let (root, _host, tracker) = setup();
        let (listener, seen) = collector();
        let _ = tracker
            .add(&root.root_element(), "hidden", &TriggerConfig::on("hidden"), listener)
            .expect("add should succeed");

        root.report_visible(&root.root_element(), state(100));
        settle().await;
        assert_eq!(count(&seen), 0);

        root.set_document_visible(true);
        settle().await;
        assert_eq!(count(&seen), 0);

        root.set_document_visible(false);
        settle().await;
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type(), "hidden");
    }

    #[tokio::test(start_paused = true)]
    async fn document_exit_installs_exactly_one_window_listener() {
        let (root, _host, tracker) = setup();
        let (listener, seen) = collector();
        let config = with_spec(
            TriggerConfig::on("visible"),
            VisibilitySpec {
                report_when: Some(DOCUMENT_EXIT.into()),
                ..VisibilitySpec::default()
            },
        );
        let _ = tracker
            .add(&root.root_element(), "visible", &config, listener.clone())
            .expect("add should succeed");
        assert_eq!(root.window_listener_count(WindowEvent::PageHide), 1);
        assert_eq!(root.window_listener_count(WindowEvent::Unload), 0);

        root.report_visible(&root.root_element(), state(100));
        settle().await;
        assert_eq!(count(&seen), 0);

        root.fire_window(WindowEvent::PageHide);
        settle().await;
        assert_eq!(count(&seen), 1);
        assert_eq!(root.window_listener_count(WindowEvent::PageHide), 0);

        root.set_page_hide_supported(false);
        let _ = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect("add should succeed");
        assert_eq!(root.window_listener_count(WindowEvent::PageHide), 0);
        assert_eq!(root.window_listener_count(WindowEvent::Unload), 1);
    }

    // ── element target tests ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn each_element_waits_for_its_own_ini_load() {
        let (root, _host, tracker) = setup();
        let first = root.insert(
            None,
            ElementDef::new("amp-ad")
                .selector(".ad")
                .var("slot", "declared")
                .amp(),
        );
        let second = root.insert(None, ElementDef::new("amp-ad").selector(".ad").amp());
        let (listener, seen) = collector();

        let config = TriggerConfig::on("visible").with_selector(Selector::one(".ad"));
        let _ = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect("add should succeed");
        settle().await;
        assert_eq!(root.memory_visibility_manager().listens().len(), 2);

        let mut measured = state(250);
        measured.insert("slot".to_string(), json!("measured"));
        root.report_visible(&first, measured);
        root.report_visible(&second, state(250));
        root.fire_element_signal(&first, signals::INI_LOAD);
        settle().await;

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].target().id(), first.id());
        assert_eq!(seen[0].var("slot"), Some(&json!("declared")));
        assert_eq!(seen[0].var("totalVisibleTime"), Some(&json!(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_elements_cannot_wait_for_signals() {
        let (root, _host, tracker) = setup();
        let _plain = root.insert(None, ElementDef::new("div").selector("#plain"));
        let (listener, _) = collector();

        let config = with_spec(
            TriggerConfig::on("visible").with_selector(Selector::one("#plain")),
            VisibilitySpec {
                wait_for: Some("render-start".into()),
                ..VisibilitySpec::default()
            },
        );
        let _ = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect("add should succeed");
        settle().await;
        assert!(root.memory_visibility_manager().listens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unlisten_cancels_every_element_registration() {
        let (root, _host, tracker) = setup();
        let ad = root.insert(None, ElementDef::new("div").selector(".ad"));
        let (listener, seen) = collector();

        let config = TriggerConfig::on("visible").with_selector(Selector::one(".ad"));
        let unlisten = tracker
            .add(&root.root_element(), "visible", &config, listener)
            .expect("add should succeed");
        settle().await;
        assert_eq!(root.memory_visibility_manager().listens().len(), 1);

        unlisten.cancel();
        root.report_visible(&ad, state(100));
        settle().await;
        assert_eq!(count(&seen), 0);
    }
}
