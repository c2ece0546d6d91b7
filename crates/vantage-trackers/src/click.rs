//! Click triggers.

use std::sync::{Arc, Mutex};

use vantage_types::{ElementRef, EventRecord, TriggerConfig, Vars};

use crate::error::TrackerError;
use crate::observable::Observable;
use crate::registry::TrackerDeps;
use crate::root::{AnalyticsRoot, DomEvent};
use crate::tracker::{selector_scope, EventTracker, Listener};
use crate::unlisten::Unlisten;

/// Tracks clicks through one root-wide listener.
///
/// Every registration is a selective listener on a shared multicast, so the
/// root only ever sees a single `click` handler from this tracker.
pub struct ClickTracker {
    root: Arc<dyn AnalyticsRoot>,
    clicks: Observable<DomEvent>,
    detach: Mutex<Option<Unlisten>>,
}

impl ClickTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        let clicks = Observable::new();
        let fan_out = clicks.clone();
        let detach = deps
            .root
            .add_root_listener("click", Arc::new(move |event: &DomEvent| fan_out.fire(event)));
        Self {
            root: deps.root.clone(),
            clicks,
            detach: Mutex::new(Some(detach)),
        }
    }
}

impl EventTracker for ClickTracker {
    fn add(
        &self,
        context: &ElementRef,
        _event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let selectors = config
            .selector
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_list())
            .ok_or_else(|| TrackerError::assertion("Missing required selector on click trigger"))?;

        let scope = selector_scope(context);
        let unlistens = selectors
            .iter()
            .map(|selector| {
                let listener = listener.clone();
                let handler = self.root.selective_listener(
                    Arc::new(move |target: &ElementRef, _: &DomEvent| {
                        listener(EventRecord::new(target.clone(), "click", Vars::new()));
                    }),
                    scope.clone(),
                    selector,
                    config.selection_method,
                );
                self.clicks.add(move |event| handler(event))
            })
            .collect();
        Ok(Unlisten::merge(unlistens))
    }

    fn dispose(&self) {
        self.clicks.remove_all();
        if let Some(detach) = self
            .detach
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            detach.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ElementDef, MemoryRoot};
    use crate::registry::TrackerLookup;
    use crate::settings::TrackingSettings;
    use std::sync::Weak;
    use vantage_types::{RootKind, Selector};

    fn tracker(root: &Arc<MemoryRoot>) -> ClickTracker {
        let lookup: Weak<dyn TrackerLookup> = Weak::<crate::host::TrackerHost>::new();
        ClickTracker::new(&TrackerDeps {
            root: root.clone(),
            lookup,
            settings: Arc::new(TrackingSettings::default()),
        })
    }

    #[test]
    fn selector_is_required() {
        let root = MemoryRoot::new(RootKind::AmpDoc);
        let tracker = tracker(&root);
        let err = tracker
            .add(
                &root.root_element(),
                "click",
                &TriggerConfig::on("click"),
                Arc::new(|_: EventRecord| {}),
            )
            .expect_err("missing selector should fail");
        assert_eq!(
            err,
            TrackerError::Assertion("Missing required selector on click trigger".into())
        );
    }

    #[test]
    fn clicks_on_descendants_report_matched_element_with_declared_vars() {
        let root = MemoryRoot::new(RootKind::AmpDoc);
        let button = root.insert(
            None,
            ElementDef::new("button")
                .selector("#buy")
                .var("product", "shoe"),
        );
        let icon = root.insert(Some(&button), ElementDef::new("span"));
        let other = root.insert(None, ElementDef::new("a"));
        let tracker = tracker(&root);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let unlisten = tracker
            .add(
                &root.root_element(),
                "click",
                &TriggerConfig::on("click").with_selector(Selector::one("#buy")),
                Arc::new(move |r: EventRecord| sink.lock().expect("lock").push(r)),
            )
            .expect("add should succeed");

        root.click(&icon);
        root.click(&other);
        {
            let seen = seen.lock().expect("lock");
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].target().id(), button.id());
            assert_eq!(seen[0].event_type(), "click");
            assert_eq!(seen[0].var("product"), Some(&serde_json::json!("shoe")));
        }

        unlisten.cancel();
        root.click(&icon);
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn dispose_detaches_the_root_listener() {
        let root = MemoryRoot::new(RootKind::AmpDoc);
        let tracker = tracker(&root);
        assert_eq!(root.root_listener_count("click"), 1);

        tracker.dispose();
        assert_eq!(root.root_listener_count("click"), 0);
    }
}
