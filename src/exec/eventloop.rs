//! Cooperative single-threaded task queue, one per VU.
//!
//! The contract a script runtime needs at an iteration boundary: do not hand
//! the VU back to the scheduler until every queued task has run and every
//! outstanding reservation has completed, unless the run is cancelled. This is
//! not a general-purpose event loop; there are no timer wheels. Timers and
//! other external asynchronous work go through [`EventLoop::reserve`].

use std::mem;
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

use super::cancel::CancelToken;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: Vec<Task>,
    reserved_count: usize,
}

pub struct EventLoop {
    inner: Mutex<Inner>,
    wakeup_tx: Sender<()>,
    wakeup_rx: Receiver<()>,
}

impl EventLoop {
    pub fn new() -> Self {
        // Single-slot wakeup: one pending signal is enough, extra sends are
        // dropped on the floor.
        let (wakeup_tx, wakeup_rx) = bounded(1);
        Self {
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                reserved_count: 0,
            }),
            wakeup_tx,
            wakeup_rx,
        }
    }

    fn wake(&self) {
        let _ = self.wakeup_tx.try_send(());
    }

    /// Queues `task` to run on the loop. Safe from any thread, including a
    /// task currently running on the loop.
    pub fn run_on_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.lock().queue.push(Box::new(task));
        self.wake();
    }

    /// Reserves a spot on the loop, keeping [`EventLoop::start`] from
    /// returning until the reservation completes (or is dropped).
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        self.inner.lock().reserved_count += 1;
        Reservation {
            event_loop: Arc::clone(self),
            completed: false,
        }
    }

    /// Runs until the queue is empty with no reservations outstanding, or
    /// until `token` fires.
    ///
    /// Each drain cycle takes a snapshot of the queue, so tasks queued by the
    /// running batch execute in the next cycle and a storm of synchronous
    /// re-queues cannot starve the cancellation check.
    pub fn start(&self, token: &CancelToken) {
        loop {
            if token.is_cancelled() {
                return;
            }

            let (batch, reserved) = {
                let mut inner = self.inner.lock();
                (mem::take(&mut inner.queue), inner.reserved_count != 0)
            };

            if batch.is_empty() {
                if !reserved {
                    return;
                }
                select! {
                    recv(token.done()) -> _ => return,
                    recv(self.wakeup_rx) -> _ => {}
                }
                continue;
            }

            for task in batch {
                if token.is_cancelled() {
                    return;
                }
                task();
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// A claimed spot on the loop. Complete it with the task the external work
/// wants to run on the loop; completion is by value, so completing twice does
/// not typecheck. Dropping an unfinished reservation releases the spot, which
/// lets the loop exit instead of hanging on work that will never arrive.
pub struct Reservation {
    event_loop: Arc<EventLoop>,
    completed: bool,
}

impl Reservation {
    /// Queues `task` and releases the reservation. Safe from any thread.
    pub fn complete(mut self, task: impl FnOnce() + Send + 'static) {
        self.completed = true;
        let mut inner = self.event_loop.inner.lock();
        inner.queue.push(Box::new(task));
        inner.reserved_count -= 1;
        drop(inner);
        self.event_loop.wake();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.completed {
            self.event_loop.inner.lock().reserved_count -= 1;
            self.event_loop.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::cancel::cancel_pair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_basic_drain() {
        let el = Arc::new(EventLoop::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::never();

        let r = ran.clone();
        el.run_on_loop(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        el.start(&token);
        assert_eq!(ran.load(Ordering::Relaxed), 1);

        // The loop is reusable after it returns.
        for _ in 0..2 {
            let r = ran.clone();
            el.run_on_loop(move || {
                r.fetch_add(1, Ordering::Relaxed);
            });
        }
        el.start(&token);
        assert_eq!(ran.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_cancellation_skips_remaining_tasks() {
        let el = Arc::new(EventLoop::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let (canceller, token) = cancel_pair();

        let r = ran.clone();
        el.run_on_loop(move || {
            r.fetch_add(1, Ordering::Relaxed);
            canceller.cancel();
        });
        let r = ran.clone();
        el.run_on_loop(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        el.start(&token);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_batch_runs_exactly_once() {
        let el = Arc::new(EventLoop::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let k = 64;
        for _ in 0..k {
            let r = ran.clone();
            el.run_on_loop(move || {
                r.fetch_add(1, Ordering::Relaxed);
            });
        }
        el.start(&CancelToken::never());
        assert_eq!(ran.load(Ordering::Relaxed), k);
    }

    #[test]
    fn test_task_enqueued_by_task_runs_next_cycle() {
        let el = Arc::new(EventLoop::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let el2 = Arc::clone(&el);
        let ord = order.clone();
        el.run_on_loop(move || {
            ord.lock().push("first");
            let ord2 = ord.clone();
            el2.run_on_loop(move || {
                ord2.lock().push("queued-by-first");
            });
        });
        let ord = order.clone();
        el.run_on_loop(move || {
            ord.lock().push("second");
        });

        el.start(&CancelToken::never());
        assert_eq!(*order.lock(), vec!["first", "second", "queued-by-first"]);
    }

    #[test]
    fn test_reservation_holds_loop_open() {
        let el = Arc::new(EventLoop::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let el2 = Arc::clone(&el);
        let r = ran.clone();
        el.run_on_loop(move || {
            r.fetch_add(1, Ordering::Relaxed);
            let reservation = el2.reserve();
            let r2 = r.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_secs(1));
                reservation.complete(move || {
                    r2.fetch_add(1, Ordering::Relaxed);
                });
            });
        });

        let start = Instant::now();
        el.start(&CancelToken::never());
        assert_eq!(ran.load(Ordering::Relaxed), 2);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_dropped_reservation_releases_loop() {
        let el = Arc::new(EventLoop::new());
        let reservation = el.reserve();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(reservation);
        });
        let start = Instant::now();
        el.start(&CancelToken::never());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_cancelled_while_waiting_on_reservation() {
        let el = Arc::new(EventLoop::new());
        let (canceller, token) = cancel_pair();
        // Keep the reservation alive past the cancellation so only the token
        // can release the loop.
        let reservation = el.reserve();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let start = Instant::now();
        el.start(&token);
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(reservation);
    }
}
