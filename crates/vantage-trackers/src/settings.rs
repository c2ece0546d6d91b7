//! Tunables shared by every tracker of a root context.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tracker tunables.
///
/// Every field has a default, so an empty `[tracking]` table (or none at all)
/// yields the standard behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// How long custom and story events stay buffered after the tracker is
    /// created, in milliseconds.
    #[serde(default = "default_custom_buffer_window_ms")]
    pub custom_buffer_window_ms: u64,

    /// Smallest accepted timer interval, in seconds. Values below 0.5 are
    /// raised to 0.5.
    #[serde(default = "default_min_timer_interval_secs")]
    pub min_timer_interval_secs: f64,

    /// Timer cap used when a trigger sets no `maxTimerLength`, in seconds.
    #[serde(default = "default_max_timer_length_secs")]
    pub default_max_timer_length_secs: f64,

    /// Granularity scroll boundaries are rounded to, in percent.
    #[serde(default = "default_scroll_precision_percent")]
    pub scroll_precision_percent: f64,
}

fn default_custom_buffer_window_ms() -> u64 {
    10_000
}

fn default_min_timer_interval_secs() -> f64 {
    0.5
}

fn default_max_timer_length_secs() -> f64 {
    7200.0
}

fn default_scroll_precision_percent() -> f64 {
    5.0
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            custom_buffer_window_ms: default_custom_buffer_window_ms(),
            min_timer_interval_secs: default_min_timer_interval_secs(),
            default_max_timer_length_secs: default_max_timer_length_secs(),
            scroll_precision_percent: default_scroll_precision_percent(),
        }
    }
}

impl TrackingSettings {
    /// The custom buffer window as a duration.
    pub fn buffer_window(&self) -> Duration {
        Duration::from_millis(self.custom_buffer_window_ms)
    }

    /// Smallest accepted timer interval, never below the 0.5 s floor.
    pub fn min_timer_interval_secs(&self) -> f64 {
        self.min_timer_interval_secs
            .max(default_min_timer_interval_secs())
    }

    /// Scroll precision, falling back to the default for non-positive values.
    pub fn scroll_precision(&self) -> f64 {
        if self.scroll_precision_percent.is_finite() && self.scroll_precision_percent > 0.0 {
            self.scroll_precision_percent
        } else {
            default_scroll_precision_percent()
        }
    }
}
