//! Typed trigger configuration handed to trackers.
//!
//! These structs mirror the declarative trigger objects of the surrounding
//! system. Deserialization is lenient: unknown fields are ignored and every
//! field is optional, so validation of required options happens inside the
//! tracker that needs them.

use serde::{Deserialize, Serialize};

use crate::record::Vars;

/// Selector that targets the root element of the context.
pub const ROOT_SELECTOR: &str = ":root";
/// Selector that targets the host element of an embedded context.
pub const HOST_SELECTOR: &str = ":host";

/// A single selector or a list of selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    /// One selector string.
    One(String),
    /// Several selectors; each resolves independently.
    Many(Vec<String>),
}

impl Selector {
    /// Builds a single-selector value.
    pub fn one(selector: impl Into<String>) -> Self {
        Self::One(selector.into())
    }

    /// Returns the selector when exactly one was given.
    pub fn as_single(&self) -> Option<&str> {
        match self {
            Self::One(s) => Some(s),
            Self::Many(_) => None,
        }
    }

    /// Whether this is `:root` or `:host`.
    pub fn is_root(&self) -> bool {
        matches!(self.as_single(), Some(ROOT_SELECTOR) | Some(HOST_SELECTOR))
    }

    /// Whether no selector text was given at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::One(s) => s.is_empty(),
            Self::Many(list) => list.is_empty(),
        }
    }

    /// Whether a list repeats any selector.
    pub fn has_duplicates(&self) -> bool {
        match self {
            Self::One(_) => false,
            Self::Many(list) => {
                let unique: std::collections::BTreeSet<&String> = list.iter().collect();
                unique.len() != list.len()
            }
        }
    }

    /// All selectors as an owned list.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(list) => list.clone(),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::One(s) => f.write_str(s),
            Self::Many(list) => write!(f, "[{}]", list.join(", ")),
        }
    }
}

/// How a selector is resolved relative to the context element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// The closest ancestor-or-self of the context that matches.
    Closest,
    /// The first match inside the context's subtree.
    Scope,
}

/// One trigger's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// The event type this trigger listens for.
    #[serde(default)]
    pub on: Option<String>,

    /// Target selector(s).
    #[serde(default)]
    pub selector: Option<Selector>,

    /// Selector resolution method.
    #[serde(default)]
    pub selection_method: Option<SelectionMethod>,

    /// Tag-name filter used by story triggers.
    #[serde(default)]
    pub tag_name: Option<String>,

    /// Scroll trigger options.
    #[serde(default)]
    pub scroll_spec: Option<ScrollSpec>,

    /// Timer trigger options.
    #[serde(default)]
    pub timer_spec: Option<TimerSpec>,

    /// Video trigger options.
    #[serde(default)]
    pub video_spec: Option<VideoSpec>,

    /// Visibility trigger options.
    #[serde(default)]
    pub visibility_spec: Option<VisibilitySpec>,

    /// Story trigger options.
    #[serde(default)]
    pub story_spec: Option<StorySpec>,
}

impl TriggerConfig {
    /// A configuration listening for `on` with no other options.
    pub fn on(event_type: impl Into<String>) -> Self {
        Self {
            on: Some(event_type.into()),
            ..Self::default()
        }
    }

    /// Sets the selector.
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }
}

/// Scroll trigger options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollSpec {
    /// Vertical boundaries in percent.
    #[serde(default)]
    pub vertical_boundaries: Option<Vec<f64>>,

    /// Horizontal boundaries in percent.
    #[serde(default)]
    pub horizontal_boundaries: Option<Vec<f64>>,

    /// Measure against the page size captured when scrolling began.
    #[serde(default)]
    pub use_initial_page_size: bool,
}

/// Timer trigger options, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSpec {
    /// Seconds between ticks.
    #[serde(default)]
    pub interval: Option<f64>,

    /// Seconds after which a running timer is removed.
    #[serde(default)]
    pub max_timer_length: Option<f64>,

    /// Fire a tick as soon as the timer starts.
    #[serde(default)]
    pub immediate: Option<bool>,

    /// Trigger that starts the timer.
    #[serde(default)]
    pub start_spec: Option<Box<TriggerConfig>>,

    /// Trigger that stops the timer.
    #[serde(default)]
    pub stop_spec: Option<Box<TriggerConfig>>,
}

/// Video trigger options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoSpec {
    /// Target selector(s), used when the trigger has none.
    #[serde(default)]
    pub selector: Option<Selector>,

    /// Report every Nth `video-seconds-played` tick.
    #[serde(default)]
    pub interval: Option<u32>,

    /// Percentages reported by `video-percentage-played`.
    #[serde(default)]
    pub percentages: Option<Vec<f64>>,

    /// Report `video-session-visible` as a session end.
    #[serde(default, rename = "end-session-when-invisible")]
    pub end_session_when_invisible: bool,

    /// Ignore signals from autoplaying videos.
    #[serde(default, rename = "exclude-autoplay")]
    pub exclude_autoplay: bool,
}

/// Visibility trigger options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilitySpec {
    /// Target selector(s), used when the trigger has none.
    #[serde(default)]
    pub selector: Option<Selector>,

    /// Selector resolution method, used when the trigger has none.
    #[serde(default)]
    pub selection_method: Option<SelectionMethod>,

    /// Readiness signal to wait for before measuring.
    #[serde(default)]
    pub wait_for: Option<String>,

    /// When to report: `documentHidden` or `documentExit`.
    #[serde(default)]
    pub report_when: Option<String>,

    /// Report every time the conditions are met again.
    #[serde(default)]
    pub repeat: Option<bool>,

    /// Measurement conditions passed through to the visibility engine
    /// (for example `visiblePercentageMin`, `totalTimeMin`).
    #[serde(flatten)]
    pub conditions: Vars,
}

/// Story trigger options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorySpec {
    /// Deliver repeated occurrences (defaults to true).
    #[serde(default)]
    pub repeat: Option<bool>,
}
