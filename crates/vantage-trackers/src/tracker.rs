//! The tracker capability and the closed set of tracker implementations.

use std::sync::Arc;

use vantage_types::{ElementRef, EventRecord, ReadyFuture, Selector, TriggerConfig};

use crate::click::ClickTracker;
use crate::custom::CustomTracker;
use crate::error::TrackerError;
use crate::scroll::ScrollTracker;
use crate::signal::{IniLoadTracker, SignalTracker};
use crate::story::StoryTracker;
use crate::timer::TimerTracker;
use crate::unlisten::Unlisten;
use crate::video::VideoTracker;
use crate::visibility::VisibilityTracker;

/// Receives the records a registration produces.
pub type Listener = Arc<dyn Fn(EventRecord) + Send + Sync>;

/// Normalizes one class of signal into [`EventRecord`]s.
pub trait EventTracker: Send + Sync {
    /// Registers `listener` for `event_type` as configured by `config`.
    ///
    /// `context` is the element the trigger was declared on; selectors
    /// resolve relative to it.
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError>;

    /// Releases every resource the tracker owns.
    fn dispose(&self);
}

/// Trackers whose signals can gate other trackers.
pub trait ReadinessSource: Send + Sync {
    /// Completion of `event_type` at root level.
    fn root_signal(&self, event_type: &str) -> ReadyFuture;

    /// Completion of `event_type` for one element.
    fn element_signal(&self, event_type: &str, element: &ElementRef) -> ReadyFuture;
}

/// A constructed tracker.
#[derive(Clone)]
pub enum Tracker {
    Click(Arc<ClickTracker>),
    Custom(Arc<CustomTracker>),
    Story(Arc<StoryTracker>),
    Scroll(Arc<ScrollTracker>),
    Signal(Arc<SignalTracker>),
    IniLoad(Arc<IniLoadTracker>),
    Timer(Arc<TimerTracker>),
    Video(Arc<VideoTracker>),
    Visibility(Arc<VisibilityTracker>),
}

impl Tracker {
    fn as_event_tracker(&self) -> &dyn EventTracker {
        match self {
            Self::Click(t) => &**t,
            Self::Custom(t) => &**t,
            Self::Story(t) => &**t,
            Self::Scroll(t) => &**t,
            Self::Signal(t) => &**t,
            Self::IniLoad(t) => &**t,
            Self::Timer(t) => &**t,
            Self::Video(t) => &**t,
            Self::Visibility(t) => &**t,
        }
    }

    /// See [`EventTracker::add`].
    pub fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        self.as_event_tracker().add(context, event_type, config, listener)
    }

    /// See [`EventTracker::dispose`].
    pub fn dispose(&self) {
        self.as_event_tracker().dispose();
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click(_) => "click",
            Self::Custom(_) => "custom",
            Self::Story(_) => "story",
            Self::Scroll(_) => "scroll",
            Self::Signal(_) => "signal",
            Self::IniLoad(_) => "ini-load",
            Self::Timer(_) => "timer",
            Self::Video(_) => "video",
            Self::Visibility(_) => "visibility",
        }
    }

    /// The readiness view of signal-style trackers.
    pub fn readiness(&self) -> Option<Arc<dyn ReadinessSource>> {
        match self {
            Self::Signal(t) => Some(t.clone() as Arc<dyn ReadinessSource>),
            Self::IniLoad(t) => Some(t.clone() as Arc<dyn ReadinessSource>),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&Arc<CustomTracker>> {
        match self {
            Self::Custom(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_story(&self) -> Option<&Arc<StoryTracker>> {
        match self {
            Self::Story(t) => Some(t),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tracker({})", self.name())
    }
}

/// The single selector a trigger names, or `default` when it names none.
///
/// A one-entry list counts as a single selector.
pub(crate) fn single_selector(
    config: &TriggerConfig,
    default: Option<&str>,
    trigger: &str,
) -> Result<Option<String>, TrackerError> {
    match &config.selector {
        Some(Selector::One(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(Selector::Many(list)) if list.len() == 1 && !list[0].is_empty() => {
            Ok(Some(list[0].clone()))
        }
        Some(Selector::Many(list)) if list.len() > 1 => Err(TrackerError::assertion(format!(
            "{trigger} trigger accepts a single selector"
        ))),
        _ => Ok(default.map(str::to_owned)),
    }
}

/// Selectors are resolved against the context's parent when it has one.
pub(crate) fn selector_scope(context: &ElementRef) -> ElementRef {
    context.parent().unwrap_or_else(|| context.clone())
}
