//! Upload/download progress notifications.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    Upload,
    Download,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub request_id: String,
    /// Bytes transferred so far.
    pub loaded: u64,
    /// Expected total, when the peer announced one.
    pub total: Option<u64>,
}

impl ProgressEvent {
    /// Completed share in `[0, 1]`, when the total is known and non-zero.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.loaded as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Token returned by [`ProgressTracker::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Publish/subscribe registry for [`ProgressEvent`]s.
///
/// Handlers run in subscription order on the emitting task. A handler that
/// panics is logged and skipped; later handlers still receive the event.
#[derive(Default)]
pub struct ProgressTracker {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, ProgressKind, Handler)>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: ProgressKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, kind, Arc::new(handler)));
        id
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &ProgressEvent) {
        // Handlers run outside the lock so they may (un)subscribe.
        let handlers: Vec<Handler> = self
            .lock()
            .iter()
            .filter(|(_, kind, _)| *kind == event.kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(
                    request_id = %event.request_id,
                    kind = ?event.kind,
                    "progress handler panicked"
                );
            }
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, ProgressKind, Handler)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{ProgressEvent, ProgressKind, ProgressTracker};

    fn event(kind: ProgressKind, loaded: u64) -> ProgressEvent {
        ProgressEvent {
            kind,
            request_id: "req-1".to_owned(),
            loaded,
            total: Some(10),
        }
    }

    #[test]
    fn delivers_in_subscription_order_despite_panicking_handler() {
        let tracker = ProgressTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        tracker.subscribe(ProgressKind::Download, move |_| {
            first.lock().expect("lock").push("first");
        });
        tracker.subscribe(ProgressKind::Download, |_| panic!("handler failure"));
        let third = Arc::clone(&seen);
        tracker.subscribe(ProgressKind::Download, move |_| {
            third.lock().expect("lock").push("third");
        });

        tracker.emit(&event(ProgressKind::Download, 5));
        assert_eq!(*seen.lock().expect("lock"), vec!["first", "third"]);
    }

    #[test]
    fn only_matching_kind_is_notified() {
        let tracker = ProgressTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.subscribe(ProgressKind::Upload, move |event| {
            sink.lock().expect("lock").push(event.loaded);
        });

        tracker.emit(&event(ProgressKind::Download, 3));
        tracker.emit(&event(ProgressKind::Upload, 7));
        assert_eq!(*seen.lock().expect("lock"), vec![7]);
    }

    #[test]
    fn unsubscribe_and_clear() {
        let tracker = ProgressTracker::new();
        let id = tracker.subscribe(ProgressKind::Upload, |_| {});
        tracker.subscribe(ProgressKind::Download, |_| {});

        assert!(tracker.unsubscribe(id));
        assert!(!tracker.unsubscribe(id));
        assert_eq!(tracker.listener_count(), 1);

        tracker.clear();
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn fraction_requires_known_total() {
        assert_eq!(event(ProgressKind::Upload, 5).fraction(), Some(0.5));
        let unknown = ProgressEvent {
            total: None,
            ..event(ProgressKind::Upload, 5)
        };
        assert_eq!(unknown.fraction(), None);
    }
}
