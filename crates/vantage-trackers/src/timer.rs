//! Periodic timer triggers.
//!
//! A timer is a two-state machine (idle, running). It starts at
//! registration, or when a nested trigger named by `startSpec` fires, and
//! stops when the nested `stopSpec` trigger fires or when its cap elapses.
//! Start and stop share one toggle callback that consults the current state,
//! so a timer whose start and stop are the same event on the same element
//! alternates cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use vantage_types::{ElementRef, EventRecord, RootKind, TimerSpec, TriggerConfig, Vars};

use crate::error::TrackerError;
use crate::registry::{key_for, types_allowed_for, TrackerDeps, TrackerLookup};
use crate::root::AnalyticsRoot;
use crate::settings::TrackingSettings;
use crate::tracker::{EventTracker, Listener, Tracker};
use crate::unlisten::Unlisten;

/// Arms a nested start or stop trigger.
type Builder = Arc<dyn Fn() -> Result<Unlisten, TrackerError> + Send + Sync>;
type Tick = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct TimerTiming {
    interval: Duration,
    max_length: Duration,
    /// `maxTimerLength` was given explicitly.
    max_in_spec: bool,
    immediate: bool,
}

impl TimerTiming {
    fn from_spec(spec: &TimerSpec, settings: &TrackingSettings) -> Result<Self, TrackerError> {
        let interval = spec
            .interval
            .ok_or_else(|| TrackerError::assertion("Timer interval specification required"))?;
        let interval = Some(interval)
            .filter(|secs| *secs >= settings.min_timer_interval_secs())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|period| !period.is_zero())
            .ok_or_else(|| TrackerError::assertion("Bad timer interval specification"))?;

        let max_length = spec
            .max_timer_length
            .unwrap_or(settings.default_max_timer_length_secs);
        let max_length = Some(max_length)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| TrackerError::assertion("Bad maxTimerLength specification"))?;

        Ok(Self {
            interval,
            max_length,
            max_in_spec: spec.max_timer_length.is_some(),
            immediate: spec.immediate.unwrap_or(true),
        })
    }
}

#[derive(Default)]
struct ControllerState {
    /// The periodic task; `Some` exactly while running.
    interval: Option<AbortHandle>,
    /// Pending removal at the maximum length, counted from the earliest
    /// start it covers.
    cap: Option<AbortHandle>,
    tick: Option<Tick>,
    started: Option<Instant>,
    started_epoch_ms: i64,
    last_request: Option<Instant>,
    unlisten_start: Option<Unlisten>,
    unlisten_stop: Option<Unlisten>,
}

/// Runtime state of one timer.
pub struct TimerController {
    timing: TimerTiming,
    start_builder: Option<Builder>,
    stop_builder: Option<Builder>,
    state: Mutex<ControllerState>,
}

impl TimerController {
    fn new(
        spec: &TimerSpec,
        settings: &TrackingSettings,
        start_builder: Option<Builder>,
        stop_builder: Option<Builder>,
    ) -> Result<Self, TrackerError> {
        Ok(Self {
            timing: TimerTiming::from_spec(spec, settings)?,
            start_builder,
            stop_builder,
            state: Mutex::new(ControllerState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock().interval.is_some()
    }

    /// `timerDuration` is the time in ms since the previous query (or since
    /// the start, for the first query), and 0 while idle. `timerStart` is
    /// the epoch ms of the latest start, 0 if the timer never started.
    pub fn timer_vars(&self) -> Vars {
        let mut state = self.lock();
        let mut duration = 0u64;
        if state.interval.is_some() {
            let now = Instant::now();
            if let Some(since) = state.last_request.or(state.started) {
                duration = now.saturating_duration_since(since).as_millis() as u64;
            }
            state.last_request = Some(now);
        }
        let mut vars = Vars::new();
        vars.insert("timerDuration".to_string(), json!(duration));
        vars.insert("timerStart".to_string(), json!(state.started_epoch_ms));
        vars
    }

    fn listen_for_start(&self) -> Result<(), TrackerError> {
        let Some(builder) = &self.start_builder else {
            return Ok(());
        };
        let unlisten = builder()?;
        self.lock().unlisten_start = Some(unlisten);
        Ok(())
    }

    fn listen_for_stop(&self) -> Result<(), TrackerError> {
        let Some(builder) = &self.stop_builder else {
            return Ok(());
        };
        match builder() {
            Ok(unlisten) => {
                self.lock().unlisten_stop = Some(unlisten);
                Ok(())
            }
            Err(err) => {
                self.dispose();
                Err(err)
            }
        }
    }

    /// Enters the running state; a no-op when already running.
    fn start(&self, tick: Tick, on_cap: Box<dyn FnOnce() + Send>) -> Result<(), TrackerError> {
        let unlisten_start = {
            let mut state = self.lock();
            if state.interval.is_some() {
                return Ok(());
            }
            state.started = Some(Instant::now());
            state.started_epoch_ms = chrono::Utc::now().timestamp_millis();
            state.last_request = None;
            state.tick = Some(tick.clone());

            let period = self.timing.interval;
            let first = Instant::now() + period;
            let ticker = tick.clone();
            let interval = tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(first, period);
                loop {
                    interval.tick().await;
                    ticker();
                }
            });
            state.interval = Some(interval.abort_handle());

            // Without a stop trigger the cap is the only way the timer ends.
            // A pending cap from an earlier start fires first, so it stands.
            let capped = matches!(&state.cap, Some(cap) if !cap.is_finished());
            if !capped && (self.stop_builder.is_none() || self.timing.max_in_spec) {
                let max_length = self.timing.max_length;
                let cap = tokio::spawn(async move {
                    tokio::time::sleep(max_length).await;
                    on_cap();
                });
                state.cap = Some(cap.abort_handle());
            }
            state.unlisten_start.take()
        };
        if let Some(unlisten) = unlisten_start {
            unlisten.cancel();
        }
        if self.timing.immediate {
            tick();
        }
        self.listen_for_stop()
    }

    /// Flushes one final tick and returns to idle, re-arming the start
    /// trigger. A no-op when idle.
    fn stop(&self) -> Result<(), TrackerError> {
        let tick = {
            let state = self.lock();
            if state.interval.is_none() {
                return Ok(());
            }
            state.tick.clone()
        };
        if let Some(tick) = tick {
            tick();
        }
        let unlisten_stop = {
            let mut state = self.lock();
            if let Some(interval) = state.interval.take() {
                interval.abort();
            }
            state.tick = None;
            state.last_request = None;
            state.unlisten_stop.take()
        };
        if let Some(unlisten) = unlisten_stop {
            unlisten.cancel();
        }
        self.listen_for_start()
    }

    /// Detaches the nested start and stop triggers.
    fn dispose(&self) {
        let (stop, start) = {
            let mut state = self.lock();
            (state.unlisten_stop.take(), state.unlisten_start.take())
        };
        for unlisten in [stop, start].into_iter().flatten() {
            unlisten.cancel();
        }
    }

    /// Aborts the periodic task and the pending cap without flushing.
    fn halt(&self) {
        let mut state = self.lock();
        if let Some(interval) = state.interval.take() {
            interval.abort();
        }
        if let Some(cap) = state.cap.take() {
            cap.abort();
        }
        state.tick = None;
    }

    #[cfg(test)]
    fn has_pending_cap(&self) -> bool {
        matches!(&self.lock().cap, Some(cap) if !cap.is_finished())
    }
}

struct TimerInner {
    root: Arc<dyn AnalyticsRoot>,
    lookup: Weak<dyn TrackerLookup>,
    settings: Arc<TrackingSettings>,
    timers: Mutex<HashMap<u64, Arc<TimerController>>>,
    id_sequence: AtomicU64,
}

impl TimerInner {
    fn next_id(&self) -> u64 {
        self.id_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn timer(&self, id: u64) -> Option<Arc<TimerController>> {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn take(&self, id: u64) -> Option<Arc<TimerController>> {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn nested_tracker(&self, on: &str) -> Option<Tracker> {
        let lookup = self.lookup.upgrade()?;
        lookup.tracker_for_allowlist(key_for(on), &types_allowed_for(RootKind::Timer))
    }

    fn builder(
        self: &Arc<Self>,
        id: u64,
        context: &ElementRef,
        nested: &TriggerConfig,
        event_type: &str,
        listener: &Listener,
        which: &str,
    ) -> Result<Builder, TrackerError> {
        let cannot_track = || TrackerError::assertion(format!("Cannot track timer {which}"));
        let on = nested
            .on
            .clone()
            .filter(|on| !on.is_empty())
            .ok_or_else(cannot_track)?;
        let tracker = self.nested_tracker(&on).ok_or_else(cannot_track)?;

        let weak = Arc::downgrade(self);
        let event_type = event_type.to_string();
        let listener = listener.clone();
        let toggle: Listener = Arc::new(move |_: EventRecord| {
            if let Some(inner) = weak.upgrade() {
                inner.toggle(id, &event_type, &listener);
            }
        });
        let context = context.clone();
        let nested = nested.clone();
        Ok(Arc::new(move || {
            tracker.add(&context, &on, &nested, toggle.clone())
        }))
    }

    fn toggle(self: &Arc<Self>, id: u64, event_type: &str, listener: &Listener) {
        let Some(controller) = self.timer(id) else {
            return;
        };
        let result = if controller.is_running() {
            controller.stop()
        } else {
            self.start(id, &controller, event_type, listener.clone())
        };
        if let Err(err) = result {
            tracing::error!(timer = id, error = %err, "timer toggle failed");
        }
    }

    fn start(
        self: &Arc<Self>,
        id: u64,
        controller: &Arc<TimerController>,
        event_type: &str,
        listener: Listener,
    ) -> Result<(), TrackerError> {
        let weak_controller = Arc::downgrade(controller);
        let target = self.root.root_element();
        let event_type = event_type.to_string();
        let tick: Tick = Arc::new(move || {
            if let Some(controller) = weak_controller.upgrade() {
                let vars = controller.timer_vars();
                listener(EventRecord::without_declared_vars(
                    target.clone(),
                    event_type.clone(),
                    vars,
                ));
            }
        });

        let weak = Arc::downgrade(self);
        let on_cap = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                tracing::debug!(timer = id, "timer reached its maximum length");
                inner.remove(id);
            }
        });

        controller.start(tick, on_cap).inspect_err(|_| self.discard(id))
    }

    /// Stops (flushing a final tick), detaches and forgets a timer.
    fn remove(&self, id: u64) {
        let Some(controller) = self.take(id) else {
            return;
        };
        if let Err(err) = controller.stop() {
            tracing::error!(timer = id, error = %err, "timer start trigger could not re-arm");
        }
        controller.dispose();
        controller.halt();
    }

    /// Forgets a timer without a final tick.
    fn discard(&self, id: u64) {
        if let Some(controller) = self.take(id) {
            controller.dispose();
            controller.halt();
        }
    }
}

/// Tracks timer triggers. Each registration owns one [`TimerController`].
pub struct TimerTracker {
    inner: Arc<TimerInner>,
}

impl TimerTracker {
    pub fn new(deps: &TrackerDeps) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                root: deps.root.clone(),
                lookup: deps.lookup.clone(),
                settings: deps.settings.clone(),
                timers: Mutex::new(HashMap::new()),
                id_sequence: AtomicU64::new(1),
            }),
        }
    }

    /// Ids of every live timer, ascending.
    pub fn timer_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn timer(&self, id: u64) -> Option<Arc<TimerController>> {
        self.inner.timer(id)
    }
}

impl EventTracker for TimerTracker {
    fn add(
        &self,
        context: &ElementRef,
        event_type: &str,
        config: &TriggerConfig,
        listener: Listener,
    ) -> Result<Unlisten, TrackerError> {
        let spec = config
            .timer_spec
            .as_ref()
            .ok_or_else(|| TrackerError::assertion("Bad timer specification"))?;
        let start_spec = spec.start_spec.as_deref();
        let stop_spec = spec.stop_spec.as_deref();
        if start_spec.is_some() && stop_spec.is_none() {
            return Err(TrackerError::assertion("Bad timer stop specification"));
        }

        let inner = &self.inner;
        let id = inner.next_id();
        let start_builder = start_spec
            .map(|nested| inner.builder(id, context, nested, event_type, &listener, "start"))
            .transpose()?;
        let stop_builder = stop_spec
            .map(|nested| inner.builder(id, context, nested, event_type, &listener, "stop"))
            .transpose()?;

        let controller = Arc::new(TimerController::new(
            spec,
            &inner.settings,
            start_builder,
            stop_builder,
        )?);
        inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, controller.clone());
        tracing::debug!(timer = id, event_type, "timer registered");

        if controller.start_builder.is_some() {
            controller
                .listen_for_start()
                .inspect_err(|_| inner.discard(id))?;
        } else {
            inner.start(id, &controller, event_type, listener)?;
        }

        let weak = Arc::downgrade(inner);
        Ok(Unlisten::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        }))
    }

    fn dispose(&self) {
        for id in self.timer_ids() {
            self.inner.remove(id);
        }
    }
}
