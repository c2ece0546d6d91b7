//! An in-process root context.
//!
//! [`MemoryRoot`] keeps a flat element registry with parent links and
//! resolves selectors by exact match against the selectors each element was
//! declared with (`#id`, `.class`, the tag name, or anything else). Scroll
//! geometry, visibility measurements, readiness signals and page lifecycle
//! events are all driven explicitly by the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use vantage_types::{
    signals, Element, ElementRef, ReadyFuture, RootKind, SelectionMethod, SignalSource, Vars,
    VisibilitySpec, HOST_SELECTOR, ROOT_SELECTOR,
};

use crate::error::TrackerError;
use crate::observable::Observable;
use crate::root::{
    AnalyticsRoot, DomEvent, DomHandler, ScrollGeometry, ScrollHandler, ScrollManager,
    SelectiveHandler, StateCallback, StopFactory, VisibilityManager, WindowEvent,
};
use crate::unlisten::Unlisten;

const ROOT_ID: u64 = 1;

// ── signals ──────────────────────────────────────────────────────────────

/// A set of named one-shot signals.
#[derive(Debug)]
pub struct SignalBoard {
    fired: watch::Sender<BTreeSet<String>>,
}

impl SignalBoard {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(BTreeSet::new());
        Self { fired }
    }

    /// Fires `name`; firing twice is harmless.
    pub fn fire(&self, name: &str) {
        self.fired.send_modify(|fired| {
            fired.insert(name.to_string());
        });
    }

    pub fn has_fired(&self, name: &str) -> bool {
        self.fired.borrow().contains(name)
    }
}

impl Default for SignalBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for SignalBoard {
    fn when_signal(&self, name: &str) -> ReadyFuture {
        let mut rx = self.fired.subscribe();
        let name = name.to_string();
        async move {
            loop {
                if rx.borrow_and_update().contains(&name) {
                    return;
                }
                if rx.changed().await.is_err() {
                    futures_util::future::pending::<()>().await;
                }
            }
        }
        .boxed()
    }
}

// ── elements ─────────────────────────────────────────────────────────────

/// Declaration of an element to insert.
#[derive(Debug, Clone, Default)]
pub struct ElementDef {
    tag: String,
    selectors: Vec<String>,
    vars: Vars,
    amp: bool,
}

impl ElementDef {
    /// An element matched by its tag name.
    pub fn new(tag: impl Into<String>) -> Self {
        let tag = tag.into().to_lowercase();
        Self {
            selectors: vec![tag.clone()],
            tag,
            ..Self::default()
        }
    }

    /// Adds a selector the element matches.
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push(selector.into());
        self
    }

    /// Declares a variable (a `data-vars-*` attribute).
    pub fn var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Makes the element publish readiness signals.
    pub fn amp(mut self) -> Self {
        self.amp = true;
        self
    }
}

/// An element held by a [`MemoryRoot`].
#[derive(Debug)]
pub struct MemoryElement {
    id: u64,
    tag: String,
    parent: Option<ElementRef>,
    selectors: Vec<String>,
    vars: Vars,
    board: Option<Arc<SignalBoard>>,
}

impl MemoryElement {
    fn matches(&self, selector: &str) -> bool {
        selector == "*" || self.selectors.iter().any(|s| s == selector)
    }

    /// The element's signal board, when it publishes signals.
    pub fn signal_board(&self) -> Option<&Arc<SignalBoard>> {
        self.board.as_ref()
    }
}

impl Element for MemoryElement {
    fn id(&self) -> u64 {
        self.id
    }

    fn tag_name(&self) -> &str {
        &self.tag
    }

    fn parent(&self) -> Option<ElementRef> {
        self.parent.clone()
    }

    fn declared_vars(&self) -> Vars {
        self.vars.clone()
    }

    fn signals(&self) -> Option<Arc<dyn SignalSource>> {
        self.board
            .clone()
            .map(|board| board as Arc<dyn SignalSource>)
    }
}

// ── scroll ───────────────────────────────────────────────────────────────

/// Scroll engine driven by [`MemoryRoot::scroll`].
#[derive(Default)]
pub struct MemoryScrollManager {
    handlers: Arc<Mutex<Vec<ScrollHandler>>>,
}

fn same_handler(a: &ScrollHandler, b: &ScrollHandler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl MemoryScrollManager {
    /// Sends `geometry` to every handler.
    pub fn emit(&self, geometry: &ScrollGeometry) {
        let snapshot: Vec<ScrollHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in snapshot {
            handler(geometry);
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl ScrollManager for MemoryScrollManager {
    fn add_scroll_handler(&self, handler: ScrollHandler) -> Unlisten {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler.clone());
        let weak = Arc::downgrade(&self.handlers);
        Unlisten::new(move || {
            if let Some(handlers) = weak.upgrade() {
                handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|h| !same_handler(h, &handler));
            }
        })
    }

    fn remove_scroll_handler(&self, handler: &ScrollHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|h| !same_handler(h, handler));
    }
}

// ── visibility ───────────────────────────────────────────────────────────

/// One registration seen by the memory visibility engine.
#[derive(Debug, Clone)]
pub struct VisibilityListen {
    /// The measured element's id.
    pub element: u64,
    /// Whether this was a root-level registration.
    pub root: bool,
    pub spec: VisibilitySpec,
}

/// Visibility engine driven by [`MemoryRoot::report_visible`].
///
/// A registration waits for its ready signal, then for a measurement of its
/// element, then for its stop signal, and reports the measured state once.
pub struct MemoryVisibilityManager {
    measured: watch::Sender<BTreeMap<u64, Vars>>,
    listens: Mutex<Vec<VisibilityListen>>,
}

impl MemoryVisibilityManager {
    fn new() -> Self {
        let (measured, _) = watch::channel(BTreeMap::new());
        Self {
            measured,
            listens: Mutex::new(Vec::new()),
        }
    }

    /// Records a measurement of element `id`.
    pub fn report(&self, id: u64, state: Vars) {
        self.measured.send_modify(|measured| {
            measured.insert(id, state);
        });
    }

    /// Every registration so far, in order.
    pub fn listens(&self) -> Vec<VisibilityListen> {
        self.listens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn listen(
        &self,
        id: u64,
        root: bool,
        spec: &VisibilitySpec,
        ready: Option<ReadyFuture>,
        stop: Option<StopFactory>,
        callback: StateCallback,
    ) -> Unlisten {
        self.listens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(VisibilityListen {
                element: id,
                root,
                spec: spec.clone(),
            });

        let stop_signal = stop.map(|factory| factory());
        let mut rx = self.measured.subscribe();
        let handle = tokio::spawn(async move {
            if let Some(ready) = ready {
                ready.await;
            }
            let state = loop {
                let current = rx.borrow_and_update().get(&id).cloned();
                if let Some(state) = current {
                    break state;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            };
            if let Some(stop_signal) = stop_signal {
                stop_signal.await;
            }
            callback(state);
        });
        Unlisten::new(move || handle.abort())
    }
}

impl VisibilityManager for MemoryVisibilityManager {
    fn listen_root(
        &self,
        spec: &VisibilitySpec,
        ready: Option<ReadyFuture>,
        stop: Option<StopFactory>,
        callback: StateCallback,
    ) -> Unlisten {
        self.listen(ROOT_ID, true, spec, ready, stop, callback)
    }

    fn listen_element(
        &self,
        element: &ElementRef,
        spec: &VisibilitySpec,
        ready: Option<ReadyFuture>,
        stop: Option<StopFactory>,
        callback: StateCallback,
    ) -> Unlisten {
        self.listen(element.id(), false, spec, ready, stop, callback)
    }
}

// ── root ─────────────────────────────────────────────────────────────────

/// An in-memory [`AnalyticsRoot`].
pub struct MemoryRoot {
    kind: RootKind,
    me: Weak<MemoryRoot>,
    next_id: AtomicU64,
    root: Arc<MemoryElement>,
    elements: Mutex<Vec<Arc<MemoryElement>>>,
    listeners: Mutex<HashMap<String, Observable<DomEvent>>>,
    scroll: Arc<MemoryScrollManager>,
    visibility: Arc<MemoryVisibilityManager>,
    signals: Arc<SignalBoard>,
    document_visible: AtomicBool,
    visibility_changes: Observable<()>,
    page_hide_supported: AtomicBool,
    window: Mutex<HashMap<WindowEvent, Observable<()>>>,
}

impl MemoryRoot {
    /// Creates a root with only its root element (`html`, matched by
    /// `:root`). The document starts visible and supports `pagehide`.
    pub fn new(kind: RootKind) -> Arc<Self> {
        let root = Arc::new(MemoryElement {
            id: ROOT_ID,
            tag: "html".to_string(),
            parent: None,
            selectors: vec!["html".to_string(), ROOT_SELECTOR.to_string()],
            vars: Vars::new(),
            board: None,
        });
        Arc::new_cyclic(|me| Self {
            kind,
            me: me.clone(),
            next_id: AtomicU64::new(ROOT_ID + 1),
            elements: Mutex::new(vec![root.clone()]),
            root,
            listeners: Mutex::new(HashMap::new()),
            scroll: Arc::new(MemoryScrollManager::default()),
            visibility: Arc::new(MemoryVisibilityManager::new()),
            signals: Arc::new(SignalBoard::new()),
            document_visible: AtomicBool::new(true),
            visibility_changes: Observable::new(),
            page_hide_supported: AtomicBool::new(true),
            window: Mutex::new(HashMap::new()),
        })
    }

    /// Inserts an element under `parent` (the root element when `None`).
    pub fn insert(&self, parent: Option<&ElementRef>, def: ElementDef) -> ElementRef {
        let parent = parent.cloned().unwrap_or_else(|| self.root.clone());
        let element = Arc::new(MemoryElement {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tag: def.tag,
            parent: Some(parent),
            selectors: def.selectors,
            vars: def.vars,
            board: def.amp.then(|| Arc::new(SignalBoard::new())),
        });
        self.elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(element.clone());
        element
    }

    fn element(&self, id: u64) -> Option<Arc<MemoryElement>> {
        self.elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    fn element_matches(&self, id: u64, selector: &str) -> bool {
        self.element(id).is_some_and(|e| e.matches(selector))
    }

    /// The first element anywhere in the root matching `selector`.
    pub fn find(&self, selector: &str) -> Option<ElementRef> {
        let root = self.root_element();
        self.resolve_now(&root, selector, None).ok()
    }

    fn resolve_all(
        &self,
        context: &ElementRef,
        selector: &str,
        method: Option<SelectionMethod>,
    ) -> Vec<ElementRef> {
        if selector == ROOT_SELECTOR || selector == HOST_SELECTOR {
            return vec![self.root_element()];
        }
        if method == Some(SelectionMethod::Closest) {
            let mut current = Some(context.clone());
            while let Some(node) = current {
                if self.element_matches(node.id(), selector) {
                    return vec![node];
                }
                current = node.parent();
            }
            return Vec::new();
        }
        let elements = self
            .elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        elements
            .into_iter()
            .filter(|e| e.matches(selector) && context.contains(&**e))
            .map(|e| e as ElementRef)
            .collect()
    }

    fn resolve_now(
        &self,
        context: &ElementRef,
        selector: &str,
        method: Option<SelectionMethod>,
    ) -> Result<ElementRef, TrackerError> {
        self.resolve_all(context, selector, method)
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::Resolve(format!("Element \"{selector}\" not found")))
    }

    /// Dispatches a raw event to the root listeners registered for its name.
    pub fn dispatch(&self, event: &DomEvent) {
        let observable = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.name)
            .cloned();
        if let Some(observable) = observable {
            observable.fire(event);
        }
    }

    /// Dispatches a `click` on `target`.
    pub fn click(&self, target: &ElementRef) {
        self.dispatch(&DomEvent::new("click", target.clone()));
    }

    /// Feeds scroll geometry to the scroll engine.
    pub fn scroll(&self, geometry: &ScrollGeometry) {
        self.scroll.emit(geometry);
    }

    pub fn memory_scroll_manager(&self) -> &Arc<MemoryScrollManager> {
        &self.scroll
    }

    pub fn memory_visibility_manager(&self) -> &Arc<MemoryVisibilityManager> {
        &self.visibility
    }

    /// Records a visibility measurement for `element`.
    pub fn report_visible(&self, element: &ElementRef, state: Vars) {
        self.visibility.report(element.id(), state);
    }

    /// Fires a root-level signal.
    pub fn fire_signal(&self, name: &str) {
        self.signals.fire(name);
    }

    /// Fires a signal on `element`; returns false if it publishes none.
    pub fn fire_element_signal(&self, element: &ElementRef, name: &str) -> bool {
        match self.element(element.id()).and_then(|e| e.board.clone()) {
            Some(board) => {
                board.fire(name);
                true
            }
            None => false,
        }
    }

    /// Changes document visibility and notifies visibility-change handlers.
    pub fn set_document_visible(&self, visible: bool) {
        self.document_visible.store(visible, Ordering::SeqCst);
        self.visibility_changes.fire(&());
    }

    pub fn set_page_hide_supported(&self, supported: bool) {
        self.page_hide_supported.store(supported, Ordering::SeqCst);
    }

    /// Dispatches a page-lifecycle event.
    pub fn fire_window(&self, event: WindowEvent) {
        let observable = self
            .window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .cloned();
        if let Some(observable) = observable {
            observable.fire(&());
        }
    }

    /// Number of handlers registered for a page-lifecycle event.
    pub fn window_listener_count(&self, event: WindowEvent) -> usize {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .map_or(0, Observable::len)
    }

    /// Number of raw listeners registered for `name`.
    pub fn root_listener_count(&self, name: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, Observable::len)
    }
}

impl AnalyticsRoot for MemoryRoot {
    fn kind(&self) -> RootKind {
        self.kind
    }

    fn root_element(&self) -> ElementRef {
        self.root.clone()
    }

    fn resolve_element(
        &self,
        context: &ElementRef,
        selector: &str,
        method: Option<SelectionMethod>,
    ) -> BoxFuture<'static, Result<ElementRef, TrackerError>> {
        futures_util::future::ready(self.resolve_now(context, selector, method)).boxed()
    }

    fn resolve_elements(
        &self,
        context: &ElementRef,
        selectors: &[String],
        method: Option<SelectionMethod>,
    ) -> BoxFuture<'static, Result<Vec<ElementRef>, TrackerError>> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::new();
        for selector in selectors {
            let found = self.resolve_all(context, selector, method);
            if found.is_empty() {
                let err = TrackerError::Resolve(format!("Element \"{selector}\" not found"));
                return futures_util::future::ready(Err(err)).boxed();
            }
            for element in found {
                if seen.insert(element.id()) {
                    resolved.push(element);
                }
            }
        }
        futures_util::future::ready(Ok(resolved)).boxed()
    }

    fn add_root_listener(&self, name: &str, handler: DomHandler) -> Unlisten {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .add(move |event: &DomEvent| handler(event))
    }

    fn selective_listener(
        &self,
        handler: SelectiveHandler,
        context: ElementRef,
        selector: &str,
        method: Option<SelectionMethod>,
    ) -> DomHandler {
        let me = self.me.clone();
        let root_element = self.root_element();
        let selector = selector.to_string();
        Arc::new(move |event: &DomEvent| {
            if selector == HOST_SELECTOR {
                return;
            }
            let Some(this) = me.upgrade() else {
                return;
            };
            let select_root = selector == ROOT_SELECTOR;
            let mut target = Some(event.target.clone());
            while let Some(node) = target {
                if !root_element.contains(node.as_ref()) {
                    break;
                }
                if method == Some(SelectionMethod::Scope)
                    && !select_root
                    && !context.contains(node.as_ref())
                {
                    break;
                }
                if method == Some(SelectionMethod::Closest) && !node.contains(context.as_ref()) {
                    target = node.parent();
                    continue;
                }
                if selector == "*"
                    || (select_root && node.id() == root_element.id())
                    || this.element_matches(node.id(), &selector)
                {
                    handler(&node, event);
                    break;
                }
                target = node.parent();
            }
        })
    }

    fn scroll_manager(&self) -> Arc<dyn ScrollManager> {
        self.scroll.clone()
    }

    fn visibility_manager(&self) -> Arc<dyn VisibilityManager> {
        self.visibility.clone()
    }

    fn signals(&self) -> Arc<dyn SignalSource> {
        self.signals.clone()
    }

    fn when_ini_loaded(&self) -> ReadyFuture {
        self.signals.when_signal(signals::INI_LOAD)
    }

    fn document_visible(&self) -> bool {
        self.document_visible.load(Ordering::SeqCst)
    }

    fn on_visibility_change(&self, handler: Arc<dyn Fn() + Send + Sync>) -> Unlisten {
        self.visibility_changes.add(move |_: &()| handler())
    }

    fn supports_page_hide(&self) -> bool {
        self.page_hide_supported.load(Ordering::SeqCst)
    }

    fn add_window_listener(
        &self,
        event: WindowEvent,
        handler: Arc<dyn Fn() + Send + Sync>,
    ) -> Unlisten {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event)
            .or_default()
            .add(move |_: &()| handler())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tree() -> (Arc<MemoryRoot>, ElementRef, ElementRef, ElementRef) {
        let root = MemoryRoot::new(RootKind::AmpDoc);
        let article = root.insert(None, ElementDef::new("article").selector("#story"));
        let first = root.insert(Some(&article), ElementDef::new("p").selector(".para"));
        let second = root.insert(Some(&article), ElementDef::new("p").selector(".para"));
        (root, article, first, second)
    }

    #[test]
    fn scope_resolution_stays_inside_context() {
        let (root, article, first, _) = tree();
        let outside = root.insert(None, ElementDef::new("p").selector(".para"));

        let found = root.resolve_now(&article, ".para", None).expect("should resolve");
        assert_eq!(found.id(), first.id());

        let err = root
            .resolve_now(&outside, "#story", Some(SelectionMethod::Scope))
            .expect_err("article is not inside the outside paragraph");
        assert!(matches!(err, TrackerError::Resolve(_)));
    }

    #[test]
    fn closest_resolution_walks_up() {
        let (root, article, _, second) = tree();
        let found = root
            .resolve_now(&second, "#story", Some(SelectionMethod::Closest))
            .expect("ancestor should match");
        assert_eq!(found.id(), article.id());
        assert_eq!(
            root.resolve_now(&second, ":host", None).expect("root").id(),
            ROOT_ID
        );
    }

    #[tokio::test]
    async fn resolve_elements_dedupes_and_fails_on_missing() {
        let (root, _, _, _) = tree();
        let context = root.root_element();
        let all = root
            .resolve_elements(&context, &[".para".into(), "p".into()], None)
            .await
            .expect("should resolve");
        assert_eq!(all.len(), 2);

        assert!(root
            .resolve_elements(&context, &["#nope".into()], None)
            .await
            .is_err());
    }

    #[test]
    fn selective_listener_matches_ancestor_of_event_target() {
        let (root, article, first, _) = tree();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        let handler = root.selective_listener(
            Arc::new(move |matched: &ElementRef, _: &DomEvent| {
                sink.lock().expect("lock").push(matched.id())
            }),
            root.root_element(),
            "#story",
            None,
        );
        let _unlisten = root.add_root_listener("click", handler);

        root.click(&first);
        root.click(&root.root_element());

        assert_eq!(*hits.lock().expect("lock"), vec![article.id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_board_resolves_after_fire() {
        let board = SignalBoard::new();
        let waiting = tokio::spawn(board.when_signal("ini-load"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!waiting.is_finished());

        board.fire("ini-load");
        waiting.await.expect("signal task should finish");
        board.when_signal("ini-load").await;
        assert!(board.has_fired("ini-load"));
    }
}
