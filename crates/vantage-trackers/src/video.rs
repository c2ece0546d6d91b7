//! Video playback triggers.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use vantage_types::{ElementRef, EventRecord, TriggerConfig, Vars, VideoSpec};

use crate::delivery;
use crate::error::TrackerError;
use crate::observable::Observable;
use crate::registry::TrackerDeps;
use crate::root::{AnalyticsRoot, DomEvent};
use crate::tracker::{EventTracker, Listener};
use crate::unlisten::Unlisten;

pub const VIDEO_ENDED: &str = "video-ended";
pub const VIDEO_PAUSE: &str = "video-pause";
pub const VIDEO_PLAY: &str = "video-play";
pub const VIDEO_SESSION: &str = "video-session";
pub const VIDEO_SESSION_VISIBLE: &str = "video-session-visible";
pub const VIDEO_SECONDS_PLAYED: &str = "video-seconds-played";
pub const VIDEO_CUSTOM: &str = "video-hosted-custom";
pub const VIDEO_PERCENTAGE_PLAYED: &str = "video-percentage-played";
pub const VIDEO_AD_START: &str = "video-ad-start";
pub const VIDEO_AD_END: &str = "video-ad-end";

/// Every playback signal the tracker listens for on the root.
pub const PLAYBACK_SIGNALS: [&str; 10] = [
    VIDEO_ENDED,
    VIDEO_PAUSE,
    VIDEO_PLAY,
    VIDEO_SESSION,
    VIDEO_SESSION_VISIBLE,
    VIDEO_SECONDS_PLAYED,
    VIDEO_CUSTOM,
    VIDEO_PERCENTAGE_PLAYED,
    VIDEO_AD_START,
    VIDEO_AD_END,
];

/// Payload key carrying the real type of a `video-hosted-custom` signal.
pub const CUSTOM_EVENT_TYPE_KEY: &str = "__amp:eventType";

/// Playback state reported by autoplaying videos.
pub const PLAYING_AUTO: &str = "playing_auto";

const PERCENTAGE_STEP: i64 = 5;

/// `parseInt`-style reading of a reported percentage.
fn reported_percentage(value: &Value) -> Option<i64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then(|| number.trunc() as i64)
}

/// Per-registration signal filter.
struct VideoFilter {
    on: String,
    interval: Option<u32>,
    percentages: Option<Vec<f64>>,
    end_session_when_invisible: bool,
    exclude_autoplay: bool,
    interval_counter: u32,
    last_percentage: i64,
}

impl VideoFilter {
    fn new(on: &str, spec: &VideoSpec) -> Self {
        Self {
            on: on.to_string(),
            interval: spec.interval,
            percentages: spec.percentages.clone(),
            end_session_when_invisible: spec.end_session_when_invisible,
            exclude_autoplay: spec.exclude_autoplay,
            interval_counter: 0,
            last_percentage: 0,
        }
    }

    /// The normalized type and cleaned payload of a signal that passes.
    fn admit(&mut self, event: &DomEvent) -> Option<(String, Vars)> {
        let session_visible = event.name == VIDEO_SESSION_VISIBLE;
        let normalized = if session_visible {
            VIDEO_SESSION.to_string()
        } else if event.name == VIDEO_CUSTOM {
            event
                .data
                .get(CUSTOM_EVENT_TYPE_KEY)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            event.name.clone()
        };
        if normalized != self.on {
            return None;
        }

        if normalized == VIDEO_SECONDS_PLAYED {
            let Some(interval) = self.interval.filter(|i| *i > 0) else {
                tracing::error!("video-seconds-played requires interval spec with non-zero value");
                return None;
            };
            self.interval_counter += 1;
            if self.interval_counter % interval != 0 {
                return None;
            }
        }

        if normalized == VIDEO_PERCENTAGE_PLAYED {
            let Some(percentages) = &self.percentages else {
                tracing::error!("video-percentage-played requires percentages spec.");
                return None;
            };
            let step = PERCENTAGE_STEP as f64;
            if percentages.iter().any(|p| *p <= 0.0 || p % step != 0.0) {
                tracing::error!(
                    "Percentages must be set in increments of {PERCENTAGE_STEP} with non-zero values"
                );
                return None;
            }
            let Some(percentage) = event
                .data
                .get("normalizedPercentage")
                .and_then(reported_percentage)
                .filter(|p| p % PERCENTAGE_STEP == 0)
            else {
                tracing::warn!(data = ?event.data, "ignoring malformed percentage signal");
                return None;
            };
            if percentages.len() > 1 && percentage == self.last_percentage {
                return None;
            }
            if !percentages.iter().any(|p| *p == percentage as f64) {
                return None;
            }
            self.last_percentage = percentage;
        }

        if session_visible && !self.end_session_when_invisible {
            return None;
        }
        if self.exclude_autoplay
            && event.data.get("state").and_then(Value::as_str) == Some(PLAYING_AUTO)
        {
            return None;
        }

        let mut details = event.data.clone();
        details.remove(CUSTOM_EVENT_TYPE_KEY);
        Some((normalized, details))
    }
}

/// Tracks playback signals emitted by video players.
///
/// One root listener per playback signal feeds a shared session multicast;
/// registrations filter it.
pub struct VideoTracker {
    root: Arc<dyn AnalyticsRoot>,
    sessions: Observable<DomEvent>,
    detach: Mutex<Vec<Unlisten>>,
}

impl VideoTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        let sessions = Observable::new();
        let detach = PLAYBACK_SIGNALS
            .iter()
            .map(|name| {
                let fan_out = sessions.clone();
                deps.root
                    .add_root_listener(name, Arc::new(move |event: &DomEvent| fan_out.fire(event)))
            })
            .collect();
        Self {
            root: deps.root.clone(),
            sessions,
            detach: Mutex::new(detach),
        }
    }
}

impl EventTracker for VideoTracker {
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let spec = config.video_spec.clone().unwrap_or_default();
        let selector = config
            .selector
            .as_ref()
            .or(spec.selector.as_ref())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TrackerError::assertion("Missing required selector on video trigger"))?;
        if selector.has_duplicates() {
            return Err(TrackerError::assertion(
                "Cannot have duplicate selectors in selectors list",
            ));
        }

        let targets =
            self.root
                .resolve_elements(context, &selector.to_list(), config.selection_method);
        let on = config.on.as_deref().unwrap_or(event_type);
        let filter = Mutex::new(VideoFilter::new(on, &spec));

        let (feed, drain) = delivery::ordered::<(ElementRef, String, Vars)>();
        let unlisten = self.sessions.add(move |event: &DomEvent| {
            let admitted = filter.lock().unwrap_or_else(|e| e.into_inner()).admit(event);
            if let Some((event_type, details)) = admitted {
                feed.push((event.target.clone(), event_type, details));
            }
        });
        let task = drain.spawn(
            targets,
            Vec::new(),
            move |targets: &Vec<ElementRef>, (origin, event_type, details)| {
                for target in targets {
                    if target.contains(origin.as_ref()) {
                        listener(EventRecord::new(
                            target.clone(),
                            event_type.clone(),
                            details.clone(),
                        ));
                    }
                }
            },
            None,
        );

        Ok(Unlisten::new(move || {
            unlisten.cancel();
            task.stop();
        }))
    }

    fn dispose(&self) {
        self.sessions.remove_all();
        let detach: Vec<Unlisten> = self
            .detach
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for unlisten in detach {
            unlisten.cancel();
        }
    }
}
