//! Scroll-depth triggers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use vantage_types::{ElementRef, EventRecord, TriggerConfig, Vars};

use crate::error::TrackerError;
use crate::registry::TrackerDeps;
use crate::root::{AnalyticsRoot, ScrollGeometry, ScrollHandler};
use crate::tracker::{EventTracker, Listener};
use crate::unlisten::Unlisten;

pub const VERTICAL_BOUNDARY_VAR: &str = "verticalScrollBoundary";
pub const HORIZONTAL_BOUNDARY_VAR: &str = "horizontalScrollBoundary";

/// Normalized boundaries of one axis, each with its fired flag.
///
/// Iteration is ascending, so crossings within one update fire in boundary
/// order. A boundary fires at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundarySet(BTreeMap<u32, bool>);

impl BoundarySet {
    /// Rounds each boundary to the nearest multiple of `precision` and caps
    /// it at 100. Returns `None` if any boundary is not finite.
    pub fn normalize(boundaries: &[f64], precision: f64) -> Option<Self> {
        let mut set = BTreeMap::new();
        for &boundary in boundaries {
            if !boundary.is_finite() {
                return None;
            }
            let rounded = ((boundary / precision).round() * precision).clamp(0.0, 100.0);
            set.insert(rounded as u32, false);
        }
        Some(Self(set))
    }

    /// Marks and returns every unfired boundary at or below `percent`.
    ///
    /// A percent of zero (or NaN) crosses nothing.
    pub fn cross(&mut self, percent: f64) -> Vec<u32> {
        if percent.is_nan() || percent == 0.0 {
            return Vec::new();
        }
        let mut crossed = Vec::new();
        for (&boundary, fired) in self.0.iter_mut() {
            if *fired || f64::from(boundary) > percent {
                continue;
            }
            *fired = true;
            crossed.push(boundary);
        }
        crossed
    }

    pub fn boundaries(&self) -> Vec<u32> {
        self.0.keys().copied().collect()
    }
}

/// Tracks scroll depth against configured percentage boundaries.
pub struct ScrollTracker {
    root: Arc<dyn AnalyticsRoot>,
    precision: f64,
    handlers: Arc<Mutex<Vec<ScrollHandler>>>,
}

impl ScrollTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            root: deps.root.clone(),
            precision: deps.settings.scroll_precision(),
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    fn tracked_handlers(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// `None` when the axis has a non-finite boundary.
    fn axis(&self, boundaries: Option<&Vec<f64>>) -> Option<BoundarySet> {
        match boundaries {
            Some(list) => BoundarySet::normalize(list, self.precision),
            None => Some(BoundarySet::default()),
        }
    }
}

fn emit(target: &ElementRef, listener: &Listener, var: &str, boundaries: Vec<u32>) {
    for boundary in boundaries {
        let mut vars = Vars::new();
        vars.insert(var.to_string(), Value::String(boundary.to_string()));
        listener(EventRecord::without_declared_vars(target.clone(), "scroll", vars));
    }
}

impl EventTracker for ScrollTracker {
    fn add(
        &self,
        _context: &ElementRef,
        _event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let Some(spec) = config.scroll_spec.as_ref() else {
            tracing::error!("Missing scrollSpec on scroll trigger.");
            return Ok(Unlisten::noop());
        };
        if spec.vertical_boundaries.is_none() && spec.horizontal_boundaries.is_none() {
            tracing::error!("Boundaries are required for the scroll trigger to work.");
            return Ok(Unlisten::noop());
        }
        let (Some(vertical), Some(horizontal)) = (
            self.axis(spec.vertical_boundaries.as_ref()),
            self.axis(spec.horizontal_boundaries.as_ref()),
        ) else {
            tracing::error!("Scroll trigger boundaries must be finite.");
            return Ok(Unlisten::noop());
        };

        let use_initial_size = spec.use_initial_page_size;
        let target = self.root.root_element();
        let bounds = Mutex::new((vertical, horizontal));
        let handler: ScrollHandler = Arc::new(move |geometry: &ScrollGeometry| {
            let (scroll_height, scroll_width) = if use_initial_size {
                (geometry.initial_scroll_height, geometry.initial_scroll_width)
            } else {
                (geometry.scroll_height, geometry.scroll_width)
            };
            let vertical_percent = (geometry.top + geometry.height) * 100.0 / scroll_height;
            let horizontal_percent = (geometry.left + geometry.width) * 100.0 / scroll_width;

            let (vertical, horizontal) = {
                let mut bounds = bounds.lock().unwrap_or_else(|e| e.into_inner());
                (
                    bounds.0.cross(vertical_percent),
                    bounds.1.cross(horizontal_percent),
                )
            };
            emit(&target, &listener, VERTICAL_BOUNDARY_VAR, vertical);
            emit(&target, &listener, HORIZONTAL_BOUNDARY_VAR, horizontal);
        });

        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler.clone());
        let registered = self.root.scroll_manager().add_scroll_handler(handler.clone());
        let weak = Arc::downgrade(&self.handlers);
        let forget = Unlisten::new(move || {
            if let Some(handlers) = weak.upgrade() {
                handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|h| !Arc::ptr_eq(h, &handler));
            }
        });
        Ok(Unlisten::merge(vec![registered, forget]))
    }

    fn dispose(&self) {
        let manager = self.root.scroll_manager();
        let handlers: Vec<ScrollHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handler in &handlers {
            manager.remove_scroll_handler(handler);
        }
    }
}
