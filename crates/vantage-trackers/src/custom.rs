//! Application-declared events.
//!
//! The custom tracker multicasts every triggered record to the listeners
//! registered for its type and buffers it for listeners that register late.
//! Two buffers exist:
//!
//! - the default buffer, discarded once the buffer window (10 s by default)
//!   has passed since the tracker was built;
//! - the sandbox buffer for `sandbox-` types, which never expires but is
//!   consumed by the first listener registered for a type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use vantage_types::{ElementRef, EventRecord, TriggerConfig, ROOT_SELECTOR};

use crate::delivery;
use crate::error::TrackerError;
use crate::observable::Observable;
use crate::registry::TrackerDeps;
use crate::root::AnalyticsRoot;
use crate::tracker::{single_selector, EventTracker, Listener};
use crate::unlisten::Unlisten;

const SANDBOX_PREFIX: &str = "sandbox-";

/// Whether `event_type` uses the sandbox buffer.
pub fn is_sandboxed(event_type: &str) -> bool {
    event_type.starts_with(SANDBOX_PREFIX)
}

type Buffer = HashMap<String, Vec<EventRecord>>;

struct CoreState {
    observables: HashMap<String, Observable<EventRecord>>,
    /// `None` once expired or disposed.
    buffer: Option<Buffer>,
    /// `None` once disposed.
    sandbox: Option<Buffer>,
}

/// Buffering and fan-out shared by the custom and story trackers.
pub(crate) struct DispatchCore {
    state: Arc<Mutex<CoreState>>,
    expiry: Mutex<Option<AbortHandle>>,
}

impl DispatchCore {
    /// Creates the core and schedules expiry of the default buffer.
    pub(crate) fn new(window: Duration) -> Self {
        let state = Arc::new(Mutex::new(CoreState {
            observables: HashMap::new(),
            buffer: Some(HashMap::new()),
            sandbox: Some(HashMap::new()),
        }));
        let weak = Arc::downgrade(&state);
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(state) = weak.upgrade() {
                state.lock().unwrap_or_else(|e| e.into_inner()).buffer = None;
                tracing::debug!("event buffer expired");
            }
        });
        Self {
            state,
            expiry: Mutex::new(Some(expiry.abort_handle())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `handler` for `event_type` and returns the records buffered
    /// for that type at the moment of registration.
    ///
    /// The snapshot is `None` when no buffer exists for the type.
    pub(crate) fn subscribe(
        &self,
        event_type: &str,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> (Option<Vec<EventRecord>>, Unlisten) {
        let mut state = self.lock();
        let buffer = if is_sandboxed(event_type) {
            state.sandbox.as_ref()
        } else {
            state.buffer.as_ref()
        };
        let snapshot = buffer.and_then(|b| b.get(event_type)).cloned();
        let unlisten = state
            .observables
            .entry(event_type.to_string())
            .or_default()
            .add(handler);
        (snapshot, unlisten)
    }

    /// Fires `record` to current listeners and buffers it where the buffering
    /// policy allows.
    pub(crate) fn trigger(&self, record: EventRecord) {
        let event_type = record.event_type().to_string();
        let sandboxed = is_sandboxed(&event_type);
        let observable = {
            let mut state = self.lock();
            let observable = state.observables.get(&event_type).cloned();
            // A sandboxed type with a dispatcher goes out live only.
            if !(sandboxed && observable.is_some()) {
                let buffer = if sandboxed {
                    state.sandbox.as_mut()
                } else {
                    state.buffer.as_mut()
                };
                if let Some(buffer) = buffer {
                    buffer.entry(event_type.clone()).or_default().push(record.clone());
                }
            }
            observable
        };
        if let Some(observable) = observable {
            observable.fire(&record);
        }
    }

    /// A closure that drops the sandbox buffer for `event_type`.
    pub(crate) fn sandbox_consumer(&self, event_type: &str) -> Box<dyn FnOnce() + Send> {
        let weak: Weak<Mutex<CoreState>> = Arc::downgrade(&self.state);
        let event_type = event_type.to_string();
        Box::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(sandbox) = state.sandbox.as_mut() {
                    sandbox.remove(&event_type);
                }
            }
        })
    }

    /// Whether the default buffer has expired.
    pub(crate) fn is_expired(&self) -> bool {
        self.lock().buffer.is_none()
    }

    pub(crate) fn dispose(&self) {
        if let Some(expiry) = self
            .expiry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            expiry.abort();
        }
        let observables: Vec<Observable<EventRecord>> = {
            let mut state = self.lock();
            state.buffer = None;
            state.sandbox = None;
            state.observables.values().cloned().collect()
        };
        for observable in observables {
            observable.remove_all();
        }
    }
}

/// Tracks application-declared event types.
pub struct CustomTracker {
    root: Arc<dyn AnalyticsRoot>,
    core: DispatchCore,
}

impl CustomTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            root: deps.root.clone(),
            core: DispatchCore::new(deps.settings.buffer_window()),
        }
    }

    /// Delivers `record` to registered listeners and buffers it for
    /// listeners that register later.
    pub fn trigger(&self, record: EventRecord) {
        tracing::trace!(event_type = record.event_type(), "custom event triggered");
        self.core.trigger(record);
    }

    /// Whether late listeners can no longer receive buffered records.
    pub fn buffer_expired(&self) -> bool {
        self.core.is_expired()
    }
}

impl EventTracker for CustomTracker {
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let selector = single_selector(config, Some(ROOT_SELECTOR), "Custom")?
            .unwrap_or_else(|| ROOT_SELECTOR.to_string());
        let target = self
            .root
            .resolve_element(context, &selector, config.selection_method);

        let (feed, drain) = delivery::ordered::<EventRecord>();
        let (replay, unlisten) = self
            .core
            .subscribe(event_type, move |record| feed.push(record.clone()));

        let after_replay = match &replay {
            Some(_) if is_sandboxed(event_type) => Some(self.core.sandbox_consumer(event_type)),
            _ => None,
        };
        let task = drain.spawn(
            target,
            replay.unwrap_or_default(),
            move |target: &ElementRef, record: EventRecord| {
                if target.contains(record.target().as_ref()) {
                    listener(record);
                }
            },
            after_replay,
        );

        Ok(Unlisten::new(move || {
            unlisten.cancel();
            task.stop();
        }))
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}
