//! Scenario simulator for the Vantage trackers.
//!
//! A scenario is a TOML file describing an in-memory document, the triggers
//! to register against it, and a script of inputs. Running it prints every
//! delivered [`vantage_types::EventRecord`] as one JSON line:
//!
//! ```text
//! {"record":{"target":{...},"type":"click","vars":{...}},"trigger":0}
//! ```

pub mod config;
pub mod scenario;

pub use config::{load_config, Config, ConfigError, ElementConfig, LoggingConfig, Step};
pub use scenario::{run, SimError, Simulation};
