//! Scenario configuration loading from file and environment variables.

use serde::Deserialize;
use thiserror::Error;
use vantage_trackers::TrackingSettings;
use vantage_types::{RootKind, TriggerConfig, Vars};

/// A complete simulation scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Which kind of root context to simulate.
    #[serde(default = "default_root")]
    pub root: RootKind,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tracker tunables.
    #[serde(default)]
    pub tracking: TrackingSettings,

    /// The element tree, in document order.
    #[serde(default)]
    pub elements: Vec<ElementConfig>,

    /// Triggers registered before the first step runs.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    /// The scripted input.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "vantage_trackers=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// One element of the simulated document.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementConfig {
    /// Name that steps and child elements refer to.
    pub name: String,

    #[serde(default = "default_tag")]
    pub tag: String,

    /// Selectors this element matches, e.g. `"#buy"` or `".ad"`.
    #[serde(default)]
    pub selectors: Vec<String>,

    /// Name of the parent element; the root element when absent.
    #[serde(default)]
    pub parent: Option<String>,

    /// Whether the element is a managed component with readiness signals.
    #[serde(default)]
    pub amp: bool,

    /// Declared variables merged into every record targeting the element.
    #[serde(default)]
    pub vars: Vars,
}

/// A scripted input to the simulated root.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Step {
    /// Clicks the named element.
    Click { target: String },

    /// Scrolls so the viewport's far edge sits at the given percentages.
    Scroll {
        #[serde(default)]
        vertical: f64,
        #[serde(default)]
        horizontal: f64,
    },

    /// Triggers an application-defined event.
    Custom {
        event: String,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        vars: Vars,
    },

    /// Triggers a story event whose details carry `tagName` and `repeated`.
    Story {
        event: String,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        details: Vars,
    },

    /// Fires a readiness signal on the root, or on an element when given.
    Signal {
        name: String,
        #[serde(default)]
        target: Option<String>,
    },

    /// Dispatches a playback event from a player element.
    Video {
        event: String,
        target: String,
        #[serde(default)]
        data: Vars,
    },

    /// Reports a visibility measurement for the root or an element.
    Visibility {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        state: Vars,
    },

    /// Changes document visibility.
    Document { visible: bool },

    /// Fires the page-hide lifecycle event.
    #[serde(rename = "pagehide")]
    PageHide,

    /// Lets time pass.
    Wait { ms: u64 },
}

fn default_root() -> RootKind {
    RootKind::AmpDoc
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tag() -> String {
    "div".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            logging: LoggingConfig::default(),
            tracking: TrackingSettings::default(),
            elements: Vec::new(),
            triggers: Vec::new(),
            steps: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads a scenario from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VANTAGE_LOG_LEVEL` overrides `logging.level`
/// - `VANTAGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VANTAGE_BUFFER_WINDOW_MS` overrides `tracking.custom_buffer_window_ms`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(level) = std::env::var("VANTAGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("VANTAGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(window) = std::env::var("VANTAGE_BUFFER_WINDOW_MS") {
        match window.parse() {
            Ok(parsed) => config.tracking.custom_buffer_window_ms = parsed,
            Err(_) => tracing::warn!(value = %window, "ignoring invalid VANTAGE_BUFFER_WINDOW_MS"),
        }
    }

    Ok(config)
}
