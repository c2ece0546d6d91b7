//! Story events: custom-style buffering with tag and repeat filtering.

use std::sync::Arc;

use vantage_types::{ElementRef, EventRecord, TriggerConfig};

use crate::custom::DispatchCore;
use crate::error::TrackerError;
use crate::registry::TrackerDeps;
use crate::root::AnalyticsRoot;
use crate::tracker::{EventTracker, Listener};
use crate::unlisten::Unlisten;

/// Payload key holding story event details.
pub const EVENT_DETAILS: &str = "eventDetails";

/// Per-registration delivery filter for story events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryFilter {
    tag_name: Option<String>,
    repeat: bool,
}

impl StoryFilter {
    pub fn from_config(config: &TriggerConfig) -> Self {
        Self {
            tag_name: config.tag_name.clone(),
            repeat: config
                .story_spec
                .as_ref()
                .and_then(|s| s.repeat)
                .unwrap_or(true),
        }
    }

    /// Whether `record` passes the tag-name check and then the repeat check.
    pub fn admits(&self, record: &EventRecord) -> bool {
        let details = record.var(EVENT_DETAILS);

        if let (Some(wanted), Some(actual)) = (
            self.tag_name.as_deref(),
            details
                .and_then(|d| d.get("tagName"))
                .and_then(|t| t.as_str()),
        ) {
            if !wanted.eq_ignore_ascii_case(actual) {
                return false;
            }
        }

        let repeated = details
            .and_then(|d| d.get("repeated"))
            .is_some_and(|r| r.as_bool().unwrap_or(!r.is_null()));
        self.repeat || !repeated
    }
}

/// Tracks `story*` event types.
///
/// Listeners always target the root element. Records buffered before a
/// listener registers are replayed synchronously inside `add`.
pub struct StoryTracker {
    root: Arc<dyn AnalyticsRoot>,
    core: DispatchCore,
}

impl StoryTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            root: deps.root.clone(),
            core: DispatchCore::new(deps.settings.buffer_window()),
        }
    }

    /// Delivers `record` to registered listeners and buffers it while the
    /// buffer window is open.
    pub fn trigger(&self, record: EventRecord) {
        self.core.trigger(record);
    }
}

fn deliver(
    root_target: &ElementRef,
    filter: &StoryFilter,
    record: &EventRecord,
    listener: &Listener,
) {
    if filter.admits(record) {
        listener(EventRecord::new(
            root_target.clone(),
            record.event_type(),
            record.vars().clone(),
        ));
    }
}

impl EventTracker for StoryTracker {
    fn add(
        &self,
        _context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let root_target = self.root.root_element();
        let filter = StoryFilter::from_config(config);

        let live_target = root_target.clone();
        let live_filter = filter.clone();
        let live_listener = listener.clone();
        let (replay, unlisten) = self.core.subscribe(event_type, move |record| {
            deliver(&live_target, &live_filter, record, &live_listener);
        });

        for record in replay.unwrap_or_default() {
            deliver(&root_target, &filter, &record, &listener);
        }
        Ok(unlisten)
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}
