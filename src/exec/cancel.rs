//! Cancellation plumbing shared by the scheduler, executors and VUs.
//!
//! A `(Canceller, CancelToken)` pair is the shutdown signal for one scope of
//! work: the canceller flips an atomic flag and closes a channel, every cloned
//! token sees both. Blocking code selects on [`CancelToken::done`] next to its
//! other channels; hot loops poll [`CancelToken::is_cancelled`] instead.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

struct Shared {
    cancelled: AtomicBool,
    // Dropping this sender disconnects every token's `done` receiver, which
    // is the broadcast. Kept in the shared block so tokens keep it alive.
    keepalive: Mutex<Option<Sender<Infallible>>>,
}

/// Creates a linked canceller/token pair.
pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = bounded::<Infallible>(0);
    let shared = Arc::new(Shared {
        cancelled: AtomicBool::new(false),
        keepalive: Mutex::new(Some(tx)),
    });
    (
        Canceller {
            shared: Arc::clone(&shared),
        },
        CancelToken { shared, done: rx },
    )
}

/// The cancelling half of a pair. Cloneable; cancelling twice is a no-op.
#[derive(Clone)]
pub struct Canceller {
    shared: Arc<Shared>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.keepalive.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// The observing half of a pair. Cheap to clone and hand to worker threads.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
    done: Receiver<Infallible>,
}

impl CancelToken {
    /// A token that never fires. Its canceller is discarded, but the channel
    /// stays open because the token itself keeps the shared block alive.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once the pair is cancelled.
    /// Intended for `select!` arms next to other channel operations.
    pub fn done(&self) -> &Receiver<Infallible> {
        &self.done
    }

    /// Sleeps for `dur` unless cancelled first. Returns `true` when the full
    /// duration elapsed, `false` on cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        select! {
            recv(self.done) -> _ => false,
            default(dur) => true,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_observed_by_clones() {
        let (canceller, token) = cancel_pair();
        let other = token.clone();
        assert!(!token.is_cancelled());
        canceller.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
        // The done channel is disconnected, so recv is immediately ready.
        assert!(other.done().recv().is_err());
    }

    #[test]
    fn test_cancel_twice_is_noop() {
        let (canceller, token) = cancel_pair();
        canceller.cancel();
        canceller.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_sleep_interrupted() {
        let (canceller, token) = cancel_pair();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let start = Instant::now();
        let slept = token.sleep(Duration::from_secs(5));
        assert!(!slept);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let token = CancelToken::never();
        assert!(token.sleep(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }
}
