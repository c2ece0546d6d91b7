//! Cancellation handles returned by every `add`.

use std::fmt;

/// Detaches one registration when cancelled.
///
/// Dropping an `Unlisten` without calling [`cancel`](Self::cancel) leaves the
/// registration in place. Registrations live until cancelled or until the
/// owning tracker is disposed.
#[must_use = "dropping an Unlisten leaves the listener attached"]
pub struct Unlisten(Option<Box<dyn FnOnce() + Send>>);

impl Unlisten {
    /// Wraps a cancellation closure.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// A handle that does nothing when cancelled.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Whether cancelling this handle has no effect.
    pub fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    /// Runs the cancellation.
    pub fn cancel(self) {
        if let Some(cancel) = self.0 {
            cancel();
        }
    }

    /// Combines several handles into one that cancels them in order.
    pub fn merge(handles: Vec<Unlisten>) -> Self {
        let handles: Vec<Unlisten> = handles.into_iter().filter(|h| !h.is_noop()).collect();
        if handles.is_empty() {
            return Self::noop();
        }
        Self::new(move || {
            for handle in handles {
                handle.cancel();
            }
        })
    }
}

impl fmt::Debug for Unlisten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            f.write_str("Unlisten(noop)")
        } else {
            f.write_str("Unlisten")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn merged_handles_cancel_each_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let handles = (0..3)
            .map(|_| {
                let count = count.clone();
                Unlisten::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .chain(std::iter::once(Unlisten::noop()))
            .collect();

        Unlisten::merge(handles).cancel();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn merging_only_noops_is_noop() {
        assert!(Unlisten::merge(vec![Unlisten::noop(), Unlisten::noop()]).is_noop());
    }
}
