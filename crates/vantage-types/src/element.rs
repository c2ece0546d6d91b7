//! The element capability and readiness futures.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::record::Vars;

/// A one-shot completion with no payload beyond "it happened".
pub type ReadyFuture = BoxFuture<'static, ()>;

/// Returns a readiness future that completes on its first poll.
pub fn ready_now() -> ReadyFuture {
    futures_util::future::ready(()).boxed()
}

/// Well-known signal names published by elements and roots.
pub mod signals {
    /// The element (or every element in the first viewport) finished its initial load.
    pub const INI_LOAD: &str = "ini-load";
    /// The element finished loading, successfully or not.
    pub const LOAD_END: &str = "load-end";
    /// The element started rendering.
    pub const RENDER_START: &str = "render-start";
}

/// A source of named one-shot signals.
///
/// Each signal completes at most once; awaiting a signal that already fired
/// completes immediately.
pub trait SignalSource: Send + Sync {
    /// Returns a future that completes once the named signal has fired.
    fn when_signal(&self, name: &str) -> ReadyFuture;
}

/// Shared handle to an element.
pub type ElementRef = Arc<dyn Element>;

/// A node of the host document, as seen by trackers.
///
/// Trackers never walk or mutate the document. They only compare identities,
/// test containment, read the element's declared variables, and await its
/// signals.
pub trait Element: Send + Sync + fmt::Debug {
    /// Identity of this element, unique within its root context.
    fn id(&self) -> u64;

    /// Lower-case tag name.
    fn tag_name(&self) -> &str;

    /// The parent element, if any.
    fn parent(&self) -> Option<ElementRef>;

    /// Key/value attributes declared on the element (for example
    /// `data-vars-*`), already stripped of their attribute prefix.
    fn declared_vars(&self) -> Vars;

    /// The element's own signal source, when it publishes one.
    fn signals(&self) -> Option<Arc<dyn SignalSource>>;

    /// Whether `other` is this element or one of its descendants.
    fn contains(&self, other: &dyn Element) -> bool {
        if other.id() == self.id() {
            return true;
        }
        let mut current = other.parent();
        while let Some(node) = current {
            if node.id() == self.id() {
                return true;
            }
            current = node.parent();
        }
        false
    }
}
