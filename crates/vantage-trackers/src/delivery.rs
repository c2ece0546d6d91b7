//! Ordered delivery for registrations whose targets resolve asynchronously.
//!
//! Records produced before the target is known queue up in a channel. Once
//! the target resolves, a task replays the buffered snapshot and then drains
//! the channel, so a listener always sees buffered records first and live
//! records after, each in the order they were produced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::TrackerError;

/// Producer side of an ordered delivery queue.
pub(crate) struct Feed<I> {
    tx: mpsc::UnboundedSender<I>,
}

impl<I> Feed<I> {
    pub(crate) fn push(&self, item: I) {
        // A closed channel means the registration is gone.
        let _ = self.tx.send(item);
    }
}

/// Consumer side, turned into a task by [`Drain::spawn`].
pub(crate) struct Drain<I> {
    rx: mpsc::UnboundedReceiver<I>,
}

/// Creates a connected feed/drain pair.
pub(crate) fn ordered<I>() -> (Feed<I>, Drain<I>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Feed { tx }, Drain { rx })
}

impl<I: Send + 'static> Drain<I> {
    /// Spawns the delivery task.
    ///
    /// `deliver` runs for every replayed and live item once `targets`
    /// resolves. Replay happens one scheduler tick after resolution, and
    /// `after_replay` runs right after it.
    pub(crate) fn spawn<T, D>(
        self,
        targets: BoxFuture<'static, Result<T, TrackerError>>,
        replay: Vec<I>,
        mut deliver: D,
        after_replay: Option<Box<dyn FnOnce() + Send>>,
    ) -> DeliveryTask
    where
        T: Send + 'static,
        D: FnMut(&T, I) + Send + 'static,
    {
        let mut rx = self.rx;
        let active = Arc::new(AtomicBool::new(true));
        let alive = active.clone();
        let handle = tokio::spawn(async move {
            let targets = match targets.await {
                Ok(targets) => targets,
                Err(err) => {
                    tracing::warn!(error = %err, "trigger target did not resolve");
                    return;
                }
            };
            if !replay.is_empty() {
                tokio::task::yield_now().await;
            }
            for item in replay {
                if !alive.load(Ordering::Acquire) {
                    return;
                }
                deliver(&targets, item);
            }
            if let Some(after_replay) = after_replay {
                after_replay();
            }
            while let Some(item) = rx.recv().await {
                if !alive.load(Ordering::Acquire) {
                    break;
                }
                deliver(&targets, item);
            }
        });
        DeliveryTask {
            active,
            handle: handle.abort_handle(),
        }
    }
}

/// Handle to a running delivery task.
pub(crate) struct DeliveryTask {
    active: Arc<AtomicBool>,
    handle: AbortHandle,
}

impl DeliveryTask {
    /// Stops delivery; nothing reaches the listener afterwards.
    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn replay_precedes_live_items() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (feed, drain) = ordered::<u32>();
        let (resolve, resolved) = tokio::sync::oneshot::channel::<()>();

        let sink = seen.clone();
        let task = drain.spawn(
            async move {
                let _ = resolved.await;
                Ok(10u32)
            }
            .boxed(),
            vec![1, 2],
            move |offset: &u32, item: u32| sink.lock().expect("lock").push(offset + item),
            None,
        );

        feed.push(3);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(seen.lock().expect("lock").is_empty());

        resolve.send(()).expect("task waiting");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*seen.lock().expect("lock"), vec![11, 12, 13]);

        task.stop();
        feed.push(4);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(seen.lock().expect("lock").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_target_delivers_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (feed, drain) = ordered::<u32>();
        let sink = seen.clone();
        let _task = drain.spawn(
            async { Err::<(), _>(TrackerError::Resolve("#missing".into())) }.boxed(),
            vec![1],
            move |_: &(), item: u32| sink.lock().expect("lock").push(item),
            None,
        );

        feed.push(2);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(seen.lock().expect("lock").is_empty());
    }
}
