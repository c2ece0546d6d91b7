//! The static tracker descriptor table.
//!
//! Each descriptor maps a tracker key to the root kinds it may be built for
//! and the constructor that builds it. The table is the only place that
//! knows which concrete tracker handles which event type.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use vantage_types::RootKind;

use crate::click::ClickTracker;
use crate::custom::CustomTracker;
use crate::root::AnalyticsRoot;
use crate::scroll::ScrollTracker;
use crate::settings::TrackingSettings;
use crate::signal::{IniLoadTracker, SignalTracker};
use crate::story::StoryTracker;
use crate::timer::TimerTracker;
use crate::tracker::Tracker;
use crate::video::VideoTracker;
use crate::visibility::VisibilityTracker;

/// Canonical tracker keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackerKey {
    Click,
    Custom,
    /// Alias whose canonical tracker is [`TrackerKey::Visible`].
    Hidden,
    IniLoad,
    RenderStart,
    Scroll,
    Story,
    Timer,
    Video,
    Visible,
}

impl TrackerKey {
    /// Returns the event type string for this key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Custom => "custom",
            Self::Hidden => "hidden",
            Self::IniLoad => "ini-load",
            Self::RenderStart => "render-start",
            Self::Scroll => "scroll",
            Self::Story => "story",
            Self::Timer => "timer",
            Self::Video => "video",
            Self::Visible => "visible",
        }
    }
}

impl std::fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackerKey {
    type Err = ParseTrackerKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "click" => Ok(Self::Click),
            "custom" => Ok(Self::Custom),
            "hidden" => Ok(Self::Hidden),
            "ini-load" => Ok(Self::IniLoad),
            "render-start" => Ok(Self::RenderStart),
            "scroll" => Ok(Self::Scroll),
            "story" => Ok(Self::Story),
            "timer" => Ok(Self::Timer),
            "video" => Ok(Self::Video),
            "visible" => Ok(Self::Visible),
            _ => Err(ParseTrackerKeyError(s.to_string())),
        }
    }
}

/// Error returned when parsing a string that is not a reserved tracker key.
#[derive(Debug, Clone)]
pub struct ParseTrackerKeyError(pub String);

impl std::fmt::Display for ParseTrackerKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown tracker key: {}", self.0)
    }
}

impl std::error::Error for ParseTrackerKeyError {}

/// Builds a tracker for one root context.
pub type TrackerFactory = fn(&TrackerDeps) -> Tracker;

/// Trackers allowed in some context, by key.
pub type Allowlist = BTreeMap<TrackerKey, TrackerFactory>;

/// What a tracker factory is handed.
#[derive(Clone)]
pub struct TrackerDeps {
    /// The root context the tracker operates within.
    pub root: Arc<dyn AnalyticsRoot>,
    /// Lookup for nested trackers (timer start/stop, visibility `waitFor`).
    pub lookup: Weak<dyn TrackerLookup>,
    pub settings: Arc<TrackingSettings>,
}

/// Finds (or lazily builds) a tracker restricted to an allow-list.
pub trait TrackerLookup: Send + Sync {
    fn tracker_for_allowlist(&self, key: TrackerKey, allowlist: &Allowlist) -> Option<Tracker>;
}

/// One row of the descriptor table.
#[derive(Clone, Copy)]
pub struct TrackerDescriptor {
    pub key: TrackerKey,
    /// Canonical tracker name; differs from `key` only for aliases.
    pub name: TrackerKey,
    pub allowed_for: &'static [RootKind],
    pub factory: TrackerFactory,
}

impl std::fmt::Debug for TrackerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerDescriptor")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("allowed_for", &self.allowed_for)
            .finish()
    }
}

const DOC_TIMER: &[RootKind] = &[RootKind::AmpDoc, RootKind::Embed, RootKind::Timer];
const DOC_TIMER_VISIBLE: &[RootKind] = &[
    RootKind::AmpDoc,
    RootKind::Embed,
    RootKind::Timer,
    RootKind::Visible,
];
const DOC_ONLY: &[RootKind] = &[RootKind::AmpDoc, RootKind::Embed];

static DESCRIPTORS: [TrackerDescriptor; 10] = [
    TrackerDescriptor {
        key: TrackerKey::Click,
        name: TrackerKey::Click,
        allowed_for: DOC_TIMER,
        factory: build_click,
    },
    TrackerDescriptor {
        key: TrackerKey::Custom,
        name: TrackerKey::Custom,
        allowed_for: DOC_TIMER,
        factory: build_custom,
    },
    TrackerDescriptor {
        key: TrackerKey::Hidden,
        name: TrackerKey::Visible,
        allowed_for: DOC_TIMER,
        factory: build_visibility,
    },
    TrackerDescriptor {
        key: TrackerKey::IniLoad,
        name: TrackerKey::IniLoad,
        allowed_for: DOC_TIMER_VISIBLE,
        factory: build_ini_load,
    },
    TrackerDescriptor {
        key: TrackerKey::RenderStart,
        name: TrackerKey::RenderStart,
        allowed_for: DOC_TIMER_VISIBLE,
        factory: build_signal,
    },
    TrackerDescriptor {
        key: TrackerKey::Scroll,
        name: TrackerKey::Scroll,
        allowed_for: DOC_TIMER,
        factory: build_scroll,
    },
    TrackerDescriptor {
        key: TrackerKey::Story,
        name: TrackerKey::Story,
        allowed_for: DOC_ONLY,
        factory: build_story,
    },
    TrackerDescriptor {
        key: TrackerKey::Timer,
        name: TrackerKey::Timer,
        allowed_for: DOC_ONLY,
        factory: build_timer,
    },
    TrackerDescriptor {
        key: TrackerKey::Video,
        name: TrackerKey::Video,
        allowed_for: DOC_TIMER,
        factory: build_video,
    },
    TrackerDescriptor {
        key: TrackerKey::Visible,
        name: TrackerKey::Visible,
        allowed_for: DOC_TIMER,
        factory: build_visibility,
    },
];

fn build_click(deps: &TrackerDeps) -> Tracker {
    Tracker::Click(Arc::new(ClickTracker::new(deps)))
}

fn build_custom(deps: &TrackerDeps) -> Tracker {
    Tracker::Custom(Arc::new(CustomTracker::new(deps)))
}

fn build_story(deps: &TrackerDeps) -> Tracker {
    Tracker::Story(Arc::new(StoryTracker::new(deps)))
}

fn build_scroll(deps: &TrackerDeps) -> Tracker {
    Tracker::Scroll(Arc::new(ScrollTracker::new(deps)))
}

fn build_signal(deps: &TrackerDeps) -> Tracker {
    Tracker::Signal(Arc::new(SignalTracker::new(deps)))
}

fn build_ini_load(deps: &TrackerDeps) -> Tracker {
    Tracker::IniLoad(Arc::new(IniLoadTracker::new(deps)))
}

fn build_timer(deps: &TrackerDeps) -> Tracker {
    Tracker::Timer(Arc::new(TimerTracker::new(deps)))
}

fn build_video(deps: &TrackerDeps) -> Tracker {
    Tracker::Video(Arc::new(VideoTracker::new(deps)))
}

fn build_visibility(deps: &TrackerDeps) -> Tracker {
    Tracker::Visibility(Arc::new(VisibilityTracker::new(deps)))
}

/// The full descriptor table.
pub fn descriptors() -> &'static [TrackerDescriptor] {
    &DESCRIPTORS
}

fn descriptor(key: TrackerKey) -> Option<&'static TrackerDescriptor> {
    DESCRIPTORS.iter().find(|d| d.key == key)
}

/// Maps an event type to the key of the tracker that handles it.
///
/// `video*` types go to the video tracker and `story*` types to the story
/// tracker. Any other type that is not reserved is a custom event.
pub fn key_for(event_type: &str) -> TrackerKey {
    if event_type.starts_with("video") {
        return TrackerKey::Video;
    }
    if event_type.starts_with("story") {
        return TrackerKey::Story;
    }
    match event_type.parse::<TrackerKey>() {
        Ok(key) => descriptor(key).map_or(key, |d| d.name),
        Err(_) => TrackerKey::Custom,
    }
}

/// Every tracker allowed for `kind`, keyed by table key.
pub fn types_allowed_for(kind: RootKind) -> Allowlist {
    DESCRIPTORS
        .iter()
        .filter(|d| d.allowed_for.contains(&kind))
        .map(|d| (d.key, d.factory))
        .collect()
}
