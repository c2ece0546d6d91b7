//! Drives the trackers of one in-memory root through a scripted scenario.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use vantage_trackers::memory::{ElementDef, MemoryRoot};
use vantage_trackers::{
    AnalyticsRoot, DomEvent, EventRecord, Listener, ScrollGeometry, TrackerError, TrackerHost,
    WindowEvent, EVENT_DETAILS,
};
use vantage_types::{ElementRef, Vars};

use crate::config::{Config, ConfigError, ElementConfig, Step};

/// Page extent the scroll steps are measured against.
const PAGE_EXTENT: f64 = 1000.0;

/// Time given to spawned delivery tasks after every step.
const SETTLE: Duration = Duration::from_millis(1);

/// Errors that abort a simulation.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A trigger was rejected by its tracker.
    #[error("trigger {index} rejected: {source}")]
    Trigger {
        index: usize,
        #[source]
        source: TrackerError,
    },

    /// A step or element referred to an element name that was never declared.
    #[error("unknown element \"{0}\"")]
    UnknownElement(String),

    #[error("element \"{0}\" is declared twice")]
    DuplicateElement(String),

    /// Custom events cannot be triggered in this kind of root.
    #[error("custom events are not available in a {0} root")]
    CustomUnavailable(String),

    #[error("story events are not available in a {0} root")]
    StoryUnavailable(String),
}

/// An in-memory root with its tracker host and named elements.
pub struct Simulation {
    root: Arc<MemoryRoot>,
    host: Arc<TrackerHost>,
    elements: HashMap<String, ElementRef>,
    delivered: Arc<Mutex<Vec<Value>>>,
}

impl Simulation {
    /// Builds the element tree and registers every trigger.
    ///
    /// # Errors
    ///
    /// Returns `SimError` if an element refers to an unknown parent or a
    /// trigger is rejected.
    pub fn new(config: &Config) -> Result<Self, SimError> {
        let root = MemoryRoot::new(config.root);
        let host = TrackerHost::new(root.clone(), config.tracking.clone());
        let mut sim = Self {
            root,
            host,
            elements: HashMap::new(),
            delivered: Arc::new(Mutex::new(Vec::new())),
        };

        for element in &config.elements {
            sim.insert(element)?;
        }

        let context = sim.root.root_element();
        for (index, trigger) in config.triggers.iter().enumerate() {
            let sink = sim.delivered.clone();
            let listener: Listener = Arc::new(move |record: EventRecord| {
                let line = json!({ "trigger": index, "record": record.to_json() });
                sink.lock().unwrap_or_else(|e| e.into_inner()).push(line);
            });
            // Registrations live until the host is disposed.
            let _ = sim
                .host
                .add_trigger(&context, trigger, listener)
                .map_err(|source| SimError::Trigger { index, source })?;
        }
        tracing::info!(
            elements = sim.elements.len(),
            triggers = config.triggers.len(),
            root = %config.root,
            "simulation ready"
        );
        Ok(sim)
    }

    fn insert(&mut self, element: &ElementConfig) -> Result<(), SimError> {
        if self.elements.contains_key(&element.name) {
            return Err(SimError::DuplicateElement(element.name.clone()));
        }
        let parent = element
            .parent
            .as_deref()
            .map(|name| self.element(name))
            .transpose()?;

        let mut def = ElementDef::new(&element.tag);
        for selector in &element.selectors {
            def = def.selector(selector.clone());
        }
        for (key, value) in &element.vars {
            def = def.var(key.clone(), value.clone());
        }
        if element.amp {
            def = def.amp();
        }
        let inserted = self.root.insert(parent.as_ref(), def);
        self.elements.insert(element.name.clone(), inserted);
        Ok(())
    }

    fn element(&self, name: &str) -> Result<ElementRef, SimError> {
        self.elements
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::UnknownElement(name.to_string()))
    }

    fn target_or_root(&self, name: Option<&str>) -> Result<ElementRef, SimError> {
        match name {
            Some(name) => self.element(name),
            None => Ok(self.root.root_element()),
        }
    }

    /// Runs one step and lets the resulting deliveries settle.
    ///
    /// # Errors
    ///
    /// Returns `SimError` if the step names an unknown element.
    pub async fn step(&self, step: &Step) -> Result<(), SimError> {
        tracing::debug!(?step, "running step");
        match step {
            Step::Click { target } => self.root.click(&self.element(target)?),
            Step::Scroll {
                vertical,
                horizontal,
            } => self.root.scroll(&geometry_at(*vertical, *horizontal)),
            Step::Custom {
                event,
                target,
                vars,
            } => {
                let custom = self
                    .host
                    .custom_tracker()
                    .ok_or_else(|| SimError::CustomUnavailable(self.root.kind().to_string()))?;
                let target = self.target_or_root(target.as_deref())?;
                custom.trigger(EventRecord::new(target, event.clone(), vars.clone()));
            }
            Step::Story {
                event,
                target,
                details,
            } => {
                let story = self
                    .host
                    .story_tracker()
                    .ok_or_else(|| SimError::StoryUnavailable(self.root.kind().to_string()))?;
                let target = self.target_or_root(target.as_deref())?;
                let mut vars = Vars::new();
                vars.insert(
                    EVENT_DETAILS.to_string(),
                    Value::Object(details.clone().into_iter().collect()),
                );
                story.trigger(EventRecord::new(target, event.clone(), vars));
            }
            Step::Signal { name, target } => match target {
                Some(target) => {
                    if !self.root.fire_element_signal(&self.element(target)?, name) {
                        tracing::warn!(element = %target, signal = %name, "element has no signals");
                    }
                }
                None => self.root.fire_signal(name),
            },
            Step::Video {
                event,
                target,
                data,
            } => {
                let event = DomEvent::new(event.clone(), self.element(target)?).with_data(data.clone());
                self.root.dispatch(&event);
            }
            Step::Visibility { target, state } => {
                let target = self.target_or_root(target.as_deref())?;
                self.root.report_visible(&target, state.clone());
            }
            Step::Document { visible } => self.root.set_document_visible(*visible),
            Step::PageHide => self.root.fire_window(WindowEvent::PageHide),
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        }
        tokio::time::sleep(SETTLE).await;
        Ok(())
    }

    /// Takes every record delivered since the last call.
    pub fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut *self.delivered.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Disposes every tracker of the root.
    pub fn dispose(&self) {
        self.host.dispose();
    }
}

fn geometry_at(vertical: f64, horizontal: f64) -> ScrollGeometry {
    let viewport = PAGE_EXTENT / 10.0;
    ScrollGeometry {
        top: vertical * PAGE_EXTENT / 100.0 - viewport,
        left: horizontal * PAGE_EXTENT / 100.0 - viewport,
        width: viewport,
        height: viewport,
        scroll_height: PAGE_EXTENT,
        scroll_width: PAGE_EXTENT,
        initial_scroll_height: PAGE_EXTENT,
        initial_scroll_width: PAGE_EXTENT,
    }
}

/// Runs a whole scenario, handing each delivered record to `emit` in order.
///
/// # Errors
///
/// Returns `SimError` if the scenario cannot be set up or a step names an
/// unknown element.
pub async fn run(config: &Config, mut emit: impl FnMut(Value)) -> Result<usize, SimError> {
    let sim = Simulation::new(config)?;
    tokio::time::sleep(SETTLE).await;

    let mut delivered = 0;
    for line in sim.drain() {
        emit(line);
        delivered += 1;
    }
    for step in &config.steps {
        let outcome = sim.step(step).await;
        for line in sim.drain() {
            emit(line);
            delivered += 1;
        }
        if let Err(e) = outcome {
            sim.dispose();
            return Err(e);
        }
    }

    sim.dispose();
    for line in sim.drain() {
        emit(line);
        delivered += 1;
    }
    tracing::info!(delivered, "simulation finished");
    Ok(delivered)
}
