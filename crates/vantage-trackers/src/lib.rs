//! Event tracking for the Vantage analytics runtime.
//!
//! Trackers turn raw signals from a root context (clicks, scroll geometry,
//! playback events, visibility measurements, readiness signals, timers and
//! application-triggered events) into [`EventRecord`]s handed to the
//! listeners that triggers register.
//!
//! # Trackers
//!
//! | Event types | Tracker |
//! |-------------|---------|
//! | `click` | [`ClickTracker`] |
//! | any unreserved type | [`CustomTracker`] |
//! | `story*` | [`StoryTracker`] |
//! | `scroll` | [`ScrollTracker`] |
//! | `render-start` | [`SignalTracker`] |
//! | `ini-load` | [`IniLoadTracker`] |
//! | `timer` | [`TimerTracker`] |
//! | `video*` | [`VideoTracker`] |
//! | `visible`, `hidden` | [`VisibilityTracker`] |
//!
//! Which trackers a root may build is decided by the descriptor table in
//! [`registry`]; a [`TrackerHost`] owns the trackers of one root and builds
//! them on first use.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use vantage_trackers::memory::MemoryRoot;
//! use vantage_trackers::{EventRecord, TrackerHost, TrackingSettings};
//! use vantage_types::{RootKind, Selector, TriggerConfig};
//!
//! let root = MemoryRoot::new(RootKind::AmpDoc);
//! let host = TrackerHost::new(root.clone(), TrackingSettings::default());
//! let unlisten = host.add_trigger(
//!     &root.root_element(),
//!     &TriggerConfig::on("click").with_selector(Selector::one("#buy")),
//!     Arc::new(|record: EventRecord| println!("{}", record.to_json())),
//! )?;
//! ```

mod click;
mod custom;
mod delivery;
mod error;
mod host;
pub mod memory;
mod observable;
pub mod registry;
mod root;
mod scroll;
mod settings;
mod signal;
mod story;
mod timer;
mod tracker;
mod unlisten;
mod video;
mod visibility;

pub use click::ClickTracker;
pub use custom::{is_sandboxed, CustomTracker};
pub use error::TrackerError;
pub use host::TrackerHost;
pub use observable::Observable;
pub use registry::{
    descriptors, key_for, types_allowed_for, Allowlist, TrackerDeps, TrackerDescriptor,
    TrackerKey, TrackerLookup,
};
pub use root::{
    AnalyticsRoot, DomEvent, DomHandler, ScrollGeometry, ScrollHandler, ScrollManager,
    SelectiveHandler, StateCallback, StopFactory, VisibilityManager, WindowEvent,
};
pub use scroll::{BoundarySet, ScrollTracker, HORIZONTAL_BOUNDARY_VAR, VERTICAL_BOUNDARY_VAR};
pub use settings::TrackingSettings;
pub use signal::{IniLoadTracker, SignalTracker};
pub use story::{StoryFilter, StoryTracker, EVENT_DETAILS};
pub use timer::{TimerController, TimerTracker};
pub use tracker::{EventTracker, Listener, ReadinessSource, Tracker};
pub use unlisten::Unlisten;
pub use video::{
    VideoTracker, CUSTOM_EVENT_TYPE_KEY, PLAYBACK_SIGNALS, PLAYING_AUTO, VIDEO_AD_END,
    VIDEO_AD_START, VIDEO_CUSTOM, VIDEO_ENDED, VIDEO_PAUSE, VIDEO_PERCENTAGE_PLAYED,
    VIDEO_PLAY, VIDEO_SECONDS_PLAYED, VIDEO_SESSION, VIDEO_SESSION_VISIBLE,
};
pub use visibility::{VisibilityTracker, DOCUMENT_EXIT, DOCUMENT_HIDDEN, WAIT_FOR_NONE};

pub use vantage_types::EventRecord;
