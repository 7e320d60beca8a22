//! Cooperative cancellation and per-attempt deadlines.
//!
//! A [`CancelSignal`] is a cloneable flag that fires at most once with a
//! [`CancelReason`]. Signals compose with [`CancelSignal::any`], and a
//! [`TimeoutController`] owns a signal that fires on its own after a deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a [`CancelSignal`] fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The attempt exceeded its deadline.
    Timeout,
    /// The caller cancelled the request explicitly.
    Caller(String),
    /// The owning client was disposed while the request was in flight.
    Disposed,
}

impl CancelReason {
    /// Returns `true` for the deadline reason, which the executor may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("Request timeout"),
            Self::Caller(message) if message.is_empty() => f.write_str("Request cancelled"),
            Self::Caller(message) => f.write_str(message),
            Self::Disposed => f.write_str("Client disposed"),
        }
    }
}

/// Cloneable cancellation flag.
///
/// All clones observe the same state. A signal built with
/// [`CancelSignal::any`] additionally reports the reason of any of its
/// sources.
#[derive(Clone)]
pub struct CancelSignal {
    state: Arc<watch::Sender<Option<CancelReason>>>,
    sources: Arc<[CancelSignal]>,
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("reason", &self.reason())
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            sources: Arc::from(Vec::new()),
        }
    }

    /// Combines signals with logical OR.
    ///
    /// The result fires as soon as any source fires. If a source has already
    /// fired, the combined signal is fired from the start.
    pub fn any<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = CancelSignal>,
    {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            sources: sources.into_iter().collect::<Vec<_>>().into(),
        }
    }

    /// Fires the signal. Returns `false` when it had already fired; the first
    /// reason is kept.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Reason the signal (or one of its sources) fired, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        let own = self.state.borrow().clone();
        own.or_else(|| self.sources.iter().find_map(CancelSignal::reason))
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the signal or any of its sources fires.
    pub fn cancelled(&self) -> BoxFuture<'static, CancelReason> {
        let this = self.clone();
        async move {
            if let Some(reason) = this.reason() {
                return reason;
            }

            let mut receiver = this.state.subscribe();
            let own = async move {
                let fired = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map(|reason| reason.clone());
                match fired {
                    Ok(Some(reason)) => reason,
                    // The sender lives as long as `this`, so the channel
                    // cannot close while we wait.
                    _ => future::pending().await,
                }
            }
            .boxed();

            let mut waiters = Vec::with_capacity(this.sources.len() + 1);
            waiters.push(own);
            waiters.extend(this.sources.iter().map(CancelSignal::cancelled));

            let (reason, _, _) = future::select_all(waiters).await;
            reason
        }
        .boxed()
    }
}

/// Owns a [`CancelSignal`] that fires with [`CancelReason::Timeout`] once the
/// deadline passes.
///
/// The timer task is released by [`TimeoutController::cleanup`] or on drop,
/// whichever comes first, so every exit path of an attempt frees it.
#[derive(Debug)]
pub struct TimeoutController {
    signal: CancelSignal,
    timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl TimeoutController {
    /// Arms a timer for `timeout`. A zero timeout never fires.
    ///
    /// Must be called from within a tokio runtime when `timeout` is non-zero.
    pub fn new(timeout: Duration) -> Self {
        let signal = CancelSignal::new();
        let timeout = (!timeout.is_zero()).then_some(timeout);
        let timer = timeout.map(|timeout| {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                signal.cancel(CancelReason::Timeout);
            })
        });

        Self {
            signal,
            timeout,
            timer,
        }
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns `true` while the timer is still pending.
    pub fn is_armed(&self) -> bool {
        self.timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Stops the timer without firing the signal. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CancelReason, CancelSignal, TimeoutController};

    #[test]
    fn first_reason_wins() {
        let signal = CancelSignal::new();
        assert!(signal.cancel(CancelReason::Caller("stop".to_owned())));
        assert!(!signal.cancel(CancelReason::Disposed));
        assert_eq!(signal.reason(), Some(CancelReason::Caller("stop".to_owned())));
    }

    #[test]
    fn timeout_reason_displays_request_timeout() {
        assert_eq!(CancelReason::Timeout.to_string(), "Request timeout");
        assert_eq!(
            CancelReason::Caller(String::new()).to_string(),
            "Request cancelled"
        );
    }

    #[test]
    fn combined_signal_fires_immediately_when_source_already_fired() {
        let fired = CancelSignal::new();
        fired.cancel(CancelReason::Disposed);
        let idle = CancelSignal::new();

        let combined = CancelSignal::any([idle, fired]);
        assert_eq!(combined.reason(), Some(CancelReason::Disposed));
    }

    #[tokio::test]
    async fn combined_signal_fires_when_any_source_fires() {
        let first = CancelSignal::new();
        let second = CancelSignal::new();
        let combined = CancelSignal::any([first.clone(), second.clone()]);
        assert!(!combined.is_cancelled());

        let waiter = tokio::spawn(combined.cancelled());
        second.cancel(CancelReason::Caller("user".to_owned()));

        let reason = waiter.await.expect("waiter must not panic");
        assert_eq!(reason, CancelReason::Caller("user".to_owned()));
        assert!(!first.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_controller_fires_after_deadline() {
        let controller = TimeoutController::new(Duration::from_millis(50));
        assert!(controller.is_armed());
        assert!(!controller.signal().is_cancelled());

        let reason = controller.signal().cancelled().await;
        assert_eq!(reason, CancelReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_disarms_without_firing() {
        let mut controller = TimeoutController::new(Duration::from_millis(50));
        controller.cleanup();
        controller.cleanup();
        assert!(!controller.is_armed());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!controller.signal().is_cancelled());
    }

    #[tokio::test]
    async fn zero_timeout_never_arms() {
        let controller = TimeoutController::new(Duration::ZERO);
        assert_eq!(controller.timeout(), None);
        assert!(!controller.is_armed());
        assert!(!controller.signal().is_cancelled());
    }
}
