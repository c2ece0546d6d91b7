//! One-shot triggers gated on readiness signals.
//!
//! Both trackers resolve their target once, wait for a completion signal and
//! invoke the listener exactly once. The registration cannot be cancelled:
//! `add` always returns a no-op [`Unlisten`].

use std::sync::Arc;

use futures_util::FutureExt;
use vantage_types::{
    ready_now, signals, ElementRef, EventRecord, ReadyFuture, TriggerConfig, Vars,
    HOST_SELECTOR, ROOT_SELECTOR,
};

use crate::error::TrackerError;
use crate::registry::TrackerDeps;
use crate::root::AnalyticsRoot;
use crate::tracker::{selector_scope, single_selector, EventTracker, Listener, ReadinessSource};
use crate::unlisten::Unlisten;

type ElementSignal = fn(&str, &ElementRef) -> ReadyFuture;

fn named_element_signal(event_type: &str, element: &ElementRef) -> ReadyFuture {
    match element.signals() {
        Some(source) => source.when_signal(event_type),
        None => ready_now(),
    }
}

fn ini_load_element_signal(_event_type: &str, element: &ElementRef) -> ReadyFuture {
    match element.signals() {
        Some(source) => {
            let loaded = source.when_signal(signals::INI_LOAD);
            let ended = source.when_signal(signals::LOAD_END);
            async move {
                futures_util::future::select(loaded, ended).await;
            }
            .boxed()
        }
        None => ready_now(),
    }
}

fn add_one_shot(
    root: &Arc<dyn AnalyticsRoot>,
    context: &ElementRef,
    event_type: &str,
    config: &TriggerConfig,
    listener: Listener,
    root_signal: impl FnOnce() -> ReadyFuture,
    element_signal: ElementSignal,
) -> Result<Unlisten, TrackerError> {
    let selector = single_selector(config, Some(ROOT_SELECTOR), event_type)?
        .unwrap_or_else(|| ROOT_SELECTOR.to_string());
    let event_type = event_type.to_string();

    if selector == ROOT_SELECTOR || selector == HOST_SELECTOR {
        let target = root.root_element();
        let ready = root_signal();
        tokio::spawn(async move {
            ready.await;
            listener(EventRecord::new(target, event_type, Vars::new()));
        });
    } else {
        let resolving =
            root.resolve_element(&selector_scope(context), &selector, config.selection_method);
        tokio::spawn(async move {
            match resolving.await {
                Ok(target) => {
                    element_signal(&event_type, &target).await;
                    listener(EventRecord::new(target, event_type, Vars::new()));
                }
                Err(err) => {
                    tracing::warn!(event_type, error = %err, "signal trigger target did not resolve");
                }
            }
        });
    }
    Ok(Unlisten::noop())
}

/// Fires once a named signal (for example `render-start`) completes.
pub struct SignalTracker {
    root: Arc<dyn AnalyticsRoot>,
}

impl SignalTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            root: deps.root.clone(),
        }
    }
}

impl ReadinessSource for SignalTracker {
    fn root_signal(&self, event_type: &str) -> ReadyFuture {
        self.root.signals().when_signal(event_type)
    }

    fn element_signal(&self, event_type: &str, element: &ElementRef) -> ReadyFuture {
        named_element_signal(event_type, element)
    }
}

impl EventTracker for SignalTracker {
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        add_one_shot(
            &self.root,
            context,
            event_type,
            config,
            listener,
            || self.root_signal(event_type),
            named_element_signal,
        )
    }

    fn dispose(&self) {}
}

/// Fires once the root, or an element, finished its initial load.
///
/// An element counts as loaded on `ini-load` or `load-end`, whichever
/// comes first.
pub struct IniLoadTracker {
    root: Arc<dyn AnalyticsRoot>,
}

impl IniLoadTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            root: deps.root.clone(),
        }
    }
}

impl ReadinessSource for IniLoadTracker {
    fn root_signal(&self, _event_type: &str) -> ReadyFuture {
        self.root.when_ini_loaded()
    }

    fn element_signal(&self, event_type: &str, element: &ElementRef) -> ReadyFuture {
        ini_load_element_signal(event_type, element)
    }
}

impl EventTracker for IniLoadTracker {
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        add_one_shot(
            &self.root,
            context,
            event_type,
            config,
            listener,
            || self.root_signal(event_type),
            ini_load_element_signal,
        )
    }

    fn dispose(&self) {}
}
