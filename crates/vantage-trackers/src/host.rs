//! Per-root ownership of tracker instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use vantage_types::{ElementRef, TriggerConfig};

use crate::custom::CustomTracker;
use crate::error::TrackerError;
use crate::registry::{
    key_for, types_allowed_for, Allowlist, TrackerDeps, TrackerKey, TrackerLookup,
};
use crate::root::AnalyticsRoot;
use crate::settings::TrackingSettings;
use crate::story::StoryTracker;
use crate::tracker::{Listener, Tracker};
use crate::unlisten::Unlisten;

/// Owns every tracker built for one root context.
///
/// Trackers are built lazily, at most one per key, the first time a lookup
/// names a key the caller's allow-list permits. The host hands itself to the
/// trackers it builds as a weak [`TrackerLookup`], so timers and visibility
/// triggers can reach nested trackers without keeping the host alive.
pub struct TrackerHost {
    root: Arc<dyn AnalyticsRoot>,
    settings: Arc<TrackingSettings>,
    me: Weak<TrackerHost>,
    trackers: Mutex<HashMap<TrackerKey, Tracker>>,
}

impl TrackerHost {
    /// Creates a host for `root`.
    pub fn new(root: Arc<dyn AnalyticsRoot>, settings: TrackingSettings) -> Arc<Self> {
        let settings = Arc::new(settings);
        Arc::new_cyclic(|me| Self {
            root,
            settings,
            me: me.clone(),
            trackers: Mutex::new(HashMap::new()),
        })
    }

    /// The root context this host serves.
    pub fn root(&self) -> &Arc<dyn AnalyticsRoot> {
        &self.root
    }

    pub fn settings(&self) -> &TrackingSettings {
        &self.settings
    }

    /// The tracker for `key`, if the root's kind allows it.
    pub fn tracker(&self, key: TrackerKey) -> Option<Tracker> {
        self.tracker_for_allowlist(key, &types_allowed_for(self.root.kind()))
    }

    /// The tracker that handles `event_type`, if the root's kind allows it.
    pub fn tracker_for_event(&self, event_type: &str) -> Option<Tracker> {
        self.tracker(key_for(event_type))
    }

    /// The custom tracker, used to trigger application events.
    pub fn custom_tracker(&self) -> Option<Arc<CustomTracker>> {
        self.tracker(TrackerKey::Custom).and_then(|t| t.as_custom().cloned())
    }

    /// The story tracker, used to trigger story events.
    pub fn story_tracker(&self) -> Option<Arc<StoryTracker>> {
        self.tracker(TrackerKey::Story).and_then(|t| t.as_story().cloned())
    }

    /// Registers one trigger with the tracker its `on` type maps to.
    pub fn add_trigger(
        &self,
        context: &ElementRef,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let event_type = config
            .on
            .as_deref()
            .filter(|on| !on.is_empty())
            .ok_or_else(|| TrackerError::assertion("Trigger is missing an \"on\" event type"))?;
        let tracker = self.tracker_for_event(event_type).ok_or_else(|| {
            TrackerError::Unavailable(format!(
                "\"{event_type}\" is not supported in a {} root",
                self.root.kind()
            ))
        })?;
        tracing::debug!(event_type, tracker = tracker.name(), "registering trigger");
        tracker.add(context, event_type, config, listener)
    }

    /// Disposes every tracker built so far.
    pub fn dispose(&self) {
        let trackers: Vec<(TrackerKey, Tracker)> = {
            let mut map = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().collect()
        };
        for (key, tracker) in trackers {
            tracing::debug!(key = %key, "disposing tracker");
            tracker.dispose();
        }
    }

    fn deps(&self) -> TrackerDeps {
        let lookup: Weak<dyn TrackerLookup> = self.me.clone();
        TrackerDeps {
            root: self.root.clone(),
            lookup,
            settings: self.settings.clone(),
        }
    }
}

impl TrackerLookup for TrackerHost {
    fn tracker_for_allowlist(&self, key: TrackerKey, allowlist: &Allowlist) -> Option<Tracker> {
        let factory = allowlist.get(&key)?;
        if let Some(existing) = self
            .trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Some(existing.clone());
        }

        // Built outside the lock: construction attaches listeners on the root.
        let built = factory(&self.deps());
        let mut map = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&key) {
            let existing = existing.clone();
            drop(map);
            built.dispose();
            return Some(existing);
        }
        tracing::debug!(key = %key, tracker = built.name(), "built tracker");
        map.insert(key, built.clone());
        Some(built)
    }
}
