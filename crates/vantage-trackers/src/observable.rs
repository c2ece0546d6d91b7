//! A minimal multicast emitter.

use std::sync::{Arc, Mutex};

use crate::unlisten::Unlisten;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Handlers<T> {
    next_id: u64,
    entries: Vec<(u64, Handler<T>)>,
}

/// Distributes each fired value to every registered handler, in
/// registration order.
///
/// Handlers are snapshotted before a fire, so a handler may add or remove
/// handlers (including itself) without deadlocking. Changes take effect on
/// the next fire.
pub struct Observable<T> {
    inner: Arc<Mutex<Handlers<T>>>,
}

impl<T: 'static> Observable<T> {
    /// Creates an emitter with no handlers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Handlers {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers a handler; the returned handle removes it.
    pub fn add(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Unlisten {
        let id = {
            let mut handlers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = handlers.next_id;
            handlers.next_id += 1;
            handlers.entries.push((id, Arc::new(handler)));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Unlisten::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut handlers = inner.lock().unwrap_or_else(|e| e.into_inner());
                handlers.entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Invokes every handler registered at the time of the call.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = {
            let handlers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            handlers.entries.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in snapshot {
            handler(value);
        }
    }

    /// Removes every handler.
    pub fn remove_all(&self) {
        let mut handlers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        handlers.entries.clear();
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_registration_order_and_unlistens() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observable = Observable::<u32>::new();

        let first = {
            let seen = seen.clone();
            observable.add(move |v| seen.lock().expect("lock").push(("first", *v)))
        };
        let _second = {
            let seen = seen.clone();
            observable.add(move |v| seen.lock().expect("lock").push(("second", *v)))
        };

        observable.fire(&1);
        first.cancel();
        observable.fire(&2);

        assert_eq!(
            *seen.lock().expect("lock"),
            vec![("first", 1), ("second", 1), ("second", 2)]
        );
        assert_eq!(observable.len(), 1);
    }

    #[test]
    fn handler_may_register_during_fire() {
        let observable = Observable::<()>::new();
        let inner = observable.clone();
        let _unlisten = observable.add(move |_| {
            let _nested = inner.add(|_| {});
        });

        observable.fire(&());
        assert_eq!(observable.len(), 2);

        observable.remove_all();
        assert!(observable.is_empty());
    }
}
