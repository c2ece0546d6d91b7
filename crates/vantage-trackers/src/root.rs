//! The root-context boundary.
//!
//! Trackers never touch the host document directly. Everything they need
//! from it (selector resolution, raw listeners, scroll geometry, visibility
//! measurement, readiness signals, page lifecycle) comes through
//! [`AnalyticsRoot`]. The [`memory`](crate::memory) module provides an
//! in-process implementation.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use vantage_types::{
    ElementRef, ReadyFuture, RootKind, SelectionMethod, SignalSource, Vars, VisibilitySpec,
};

use crate::error::TrackerError;
use crate::unlisten::Unlisten;

/// A raw event observed on the root (a click, a playback signal).
#[derive(Debug, Clone)]
pub struct DomEvent {
    /// Event name, for example `click` or `video-play`.
    pub name: String,
    /// The element the event originated from.
    pub target: ElementRef,
    /// Event payload; empty for events that carry none.
    pub data: Vars,
}

impl DomEvent {
    /// Builds an event with no payload.
    pub fn new(name: impl Into<String>, target: ElementRef) -> Self {
        Self {
            name: name.into(),
            target,
            data: Vars::new(),
        }
    }

    /// Attaches a payload.
    pub fn with_data(mut self, data: Vars) -> Self {
        self.data = data;
        self
    }
}

/// Handler for raw root events.
pub type DomHandler = Arc<dyn Fn(&DomEvent) + Send + Sync>;

/// Handler invoked by a selective listener with the matched element.
pub type SelectiveHandler = Arc<dyn Fn(&ElementRef, &DomEvent) + Send + Sync>;

/// Page-lifecycle events observed on the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowEvent {
    /// The page is being hidden (possibly into the back/forward cache).
    PageHide,
    /// The page is being unloaded.
    Unload,
}

impl WindowEvent {
    /// Returns the DOM event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageHide => "pagehide",
            Self::Unload => "unload",
        }
    }
}

/// Scroll position and page extent reported by the scroll engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollGeometry {
    pub top: f64,
    pub left: f64,
    /// Viewport width.
    pub width: f64,
    /// Viewport height.
    pub height: f64,
    pub scroll_height: f64,
    pub scroll_width: f64,
    /// Page height when scrolling was first observed.
    pub initial_scroll_height: f64,
    /// Page width when scrolling was first observed.
    pub initial_scroll_width: f64,
}

/// Callback receiving scroll geometry.
pub type ScrollHandler = Arc<dyn Fn(&ScrollGeometry) + Send + Sync>;

/// The scroll-geometry engine.
pub trait ScrollManager: Send + Sync {
    /// Registers a handler for every scroll update.
    fn add_scroll_handler(&self, handler: ScrollHandler) -> Unlisten;

    /// Removes a handler previously passed to `add_scroll_handler`.
    fn remove_scroll_handler(&self, handler: &ScrollHandler);
}

/// Produces the "stop reporting" completion for a visibility listener.
pub type StopFactory = Arc<dyn Fn() -> ReadyFuture + Send + Sync>;

/// Receives the measured visibility state.
pub type StateCallback = Arc<dyn Fn(Vars) + Send + Sync>;

/// The visibility-measurement engine.
///
/// Measurement starts once `ready` completes (immediately when `None`).
/// When a stop factory is given, the engine calls it at registration and
/// holds the report until the returned completion resolves.
pub trait VisibilityManager: Send + Sync {
    /// Measures the root as a whole.
    fn listen_root(
        &self,
        spec: &VisibilitySpec,
        ready: Option<ReadyFuture>,
        stop: Option<StopFactory>,
        callback: StateCallback,
    ) -> Unlisten;

    /// Measures one element.
    fn listen_element(
        &self,
        element: &ElementRef,
        spec: &VisibilitySpec,
        ready: Option<ReadyFuture>,
        stop: Option<StopFactory>,
        callback: StateCallback,
    ) -> Unlisten;
}

/// The root context a set of trackers operates within.
pub trait AnalyticsRoot: Send + Sync {
    /// Which kind of root this is; decides the allowed trackers.
    fn kind(&self) -> RootKind;

    /// The root element (the document element, or an embed's host).
    fn root_element(&self) -> ElementRef;

    /// Resolves one selector relative to `context`.
    fn resolve_element(
        &self,
        context: &ElementRef,
        selector: &str,
        method: Option<SelectionMethod>,
    ) -> BoxFuture<'static, Result<ElementRef, TrackerError>>;

    /// Resolves every element matched by any of `selectors`.
    fn resolve_elements(
        &self,
        context: &ElementRef,
        selectors: &[String],
        method: Option<SelectionMethod>,
    ) -> BoxFuture<'static, Result<Vec<ElementRef>, TrackerError>>;

    /// Attaches a raw listener for events named `name` anywhere in the root.
    fn add_root_listener(&self, name: &str, handler: DomHandler) -> Unlisten;

    /// Wraps `handler` so it only runs for events whose target (or an
    /// ancestor of it) matches `selector` relative to `context`.
    fn selective_listener(
        &self,
        handler: SelectiveHandler,
        context: ElementRef,
        selector: &str,
        method: Option<SelectionMethod>,
    ) -> DomHandler;

    fn scroll_manager(&self) -> Arc<dyn ScrollManager>;

    fn visibility_manager(&self) -> Arc<dyn VisibilityManager>;

    /// Root-level named signals.
    fn signals(&self) -> Arc<dyn SignalSource>;

    /// Completes when the root's first viewport finished loading.
    fn when_ini_loaded(&self) -> ReadyFuture;

    /// Whether the document is currently visible.
    fn document_visible(&self) -> bool;

    /// Registers a handler for document visibility changes.
    fn on_visibility_change(&self, handler: Arc<dyn Fn() + Send + Sync>) -> Unlisten;

    /// Whether the window dispatches `pagehide`.
    fn supports_page_hide(&self) -> bool;

    /// Registers a page-lifecycle handler.
    fn add_window_listener(
        &self,
        event: WindowEvent,
        handler: Arc<dyn Fn() + Send + Sync>,
    ) -> Unlisten;
}
