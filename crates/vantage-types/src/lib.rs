//! Shared types for the Vantage event tracking workspace.
//!
//! This crate provides the value types that every tracker speaks in: the
//! immutable [`EventRecord`] and its flat variable map, the [`Element`]
//! capability that stands in for a node of the host document, one-shot
//! readiness futures, and the typed trigger configuration that callers hand
//! to trackers.
//!
//! Nothing in here knows how trackers work. Keeping the vocabulary separate
//! lets the root-context implementations and the trackers depend on the same
//! definitions without depending on each other.

mod config;
mod element;
mod record;

pub use config::{
    ScrollSpec, Selector, SelectionMethod, StorySpec, TimerSpec, TriggerConfig, VideoSpec,
    VisibilitySpec, HOST_SELECTOR, ROOT_SELECTOR,
};
pub use element::{ready_now, signals, Element, ElementRef, ReadyFuture, SignalSource};
pub use record::{EventRecord, Vars};

use serde::{Deserialize, Serialize};

/// The kind of root context a tracker operates within.
///
/// Tracker descriptors list the kinds they may be constructed for. Besides
/// the two document-level kinds, `Timer` and `Visible` act as pseudo-roots
/// used to allow-list the trackers that timers and visibility triggers may
/// nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    /// A top-level document.
    #[serde(rename = "ampdoc")]
    AmpDoc,
    /// An embedded document (friendly iframe or shadow root).
    Embed,
    /// Trackers that may drive a timer's start and stop.
    Timer,
    /// Trackers that may gate a visibility trigger's readiness.
    Visible,
}

impl RootKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AmpDoc => "ampdoc",
            Self::Embed => "embed",
            Self::Timer => "timer",
            Self::Visible => "visible",
        }
    }
}

impl std::fmt::Display for RootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_kind_labels_match_serde_names() {
        for kind in [
            RootKind::AmpDoc,
            RootKind::Embed,
            RootKind::Timer,
            RootKind::Visible,
        ] {
            let json = serde_json::to_string(&kind).expect("kind should serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
