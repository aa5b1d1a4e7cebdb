//! Shared state of one test run: VU pool, counters, status machine,
//! pause/resume and elapsed-time accounting.
//!
//! The counters are observational: they are read with relaxed atomics for
//! progress display and sizing decisions, never for establishing
//! happens-before between VUs. The only synchronizing pieces are the VU
//! buffer channel, the pause lock with its resume broadcast, and the
//! unplanned-VU budget.

use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::cancel::CancelToken;
use super::segment::{ExecutionTuple, SegmentedIndex};
use super::vu::InitializedVU;
use super::ExecError;
use crate::cli::config::Options;

/// Longest a single wait on the VU buffer may take before a warning is
/// logged. Exceeding it repeatedly means either an executor accounting bug or
/// a badly overloaded machine.
pub const MAX_TIME_TO_WAIT_FOR_PLANNED_VU: Duration = Duration::from_millis(400);

/// How many [`MAX_TIME_TO_WAIT_FOR_PLANNED_VU`] waits are tolerated before
/// [`ExecutionState::get_planned_vu`] gives up with an error.
pub const MAX_RETRIES_GET_PLANNED_VU: usize = 5;

/// Fine-grained local execution status. Transitions are monotonic along the
/// declaration order, with `Interrupted` as the abnormal branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExecutionStatus {
    Created = 0,
    InitVus,
    InitExecutors,
    InitDone,
    PausedBeforeRun,
    Started,
    Setup,
    Running,
    Teardown,
    Ended,
    Interrupted,
}

impl ExecutionStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::InitVus,
            2 => Self::InitExecutors,
            3 => Self::InitDone,
            4 => Self::PausedBeforeRun,
            5 => Self::Started,
            6 => Self::Setup,
            7 => Self::Running,
            8 => Self::Teardown,
            9 => Self::Ended,
            _ => Self::Interrupted,
        }
    }
}

/// Constructor injected by the scheduler for lazily initializing unplanned
/// VUs mid-run. Receives the state so it can allocate unique VU IDs without
/// holding its own reference to it.
pub type InitVuFn = std::sync::Arc<
    dyn Fn(&ExecutionState, &CancelToken) -> Result<Box<dyn InitializedVU>, ExecError>
        + Send
        + Sync,
>;

struct PauseState {
    total_paused: Duration,
    // Dropping the sender closes every cloned receiver: the resume
    // broadcast. `None` while the run is not paused.
    resume_tx: Option<Sender<Infallible>>,
    resume_rx: Receiver<Infallible>,
}

pub struct ExecutionState {
    pub options: Options,
    execution_tuple: ExecutionTuple,

    vus_tx: Sender<Box<dyn InitializedVU>>,
    vus_rx: Receiver<Box<dyn InitializedVU>>,
    vu_id_seg_index: Mutex<SegmentedIndex>,
    init_vu_func: RwLock<Option<InitVuFn>>,

    initialized_vus: AtomicI64,
    uninitialized_unplanned_vus: AtomicI64,
    active_vus: AtomicI64,
    full_iterations: AtomicU64,
    interrupted_iterations: AtomicU64,

    execution_status: AtomicU32,
    // Nanoseconds relative to `epoch`, offset by +1 so 0 stays the unset
    // sentinel. Differences between stamps are exact.
    start_time: AtomicI64,
    end_time: AtomicI64,
    current_pause_time: AtomicI64,
    pause_state: RwLock<PauseState>,
    epoch: Instant,

    max_planned_vus: u64,
    max_possible_vus: u64,
}

impl ExecutionState {
    pub fn new(
        options: Options,
        execution_tuple: ExecutionTuple,
        max_planned_vus: u64,
        max_possible_vus: u64,
    ) -> Self {
        let (vus_tx, vus_rx) = bounded(max_possible_vus.max(1) as usize);
        // The state starts unpaused: a resume channel that is already closed.
        let (resume_tx, resume_rx) = bounded::<Infallible>(0);
        drop(resume_tx);

        let vu_id_seg_index = Mutex::new(execution_tuple.segmented_index());
        Self {
            options,
            execution_tuple,
            vus_tx,
            vus_rx,
            vu_id_seg_index,
            init_vu_func: RwLock::new(None),
            initialized_vus: AtomicI64::new(0),
            uninitialized_unplanned_vus: AtomicI64::new(
                max_possible_vus.saturating_sub(max_planned_vus) as i64,
            ),
            active_vus: AtomicI64::new(0),
            full_iterations: AtomicU64::new(0),
            interrupted_iterations: AtomicU64::new(0),
            execution_status: AtomicU32::new(ExecutionStatus::Created as u32),
            start_time: AtomicI64::new(0),
            end_time: AtomicI64::new(0),
            current_pause_time: AtomicI64::new(0),
            pause_state: RwLock::new(PauseState {
                total_paused: Duration::ZERO,
                resume_tx: None,
                resume_rx,
            }),
            epoch: Instant::now(),
            max_planned_vus,
            max_possible_vus,
        }
    }

    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64 + 1
    }

    pub fn execution_tuple(&self) -> &ExecutionTuple {
        &self.execution_tuple
    }

    pub fn max_planned_vus(&self) -> u64 {
        self.max_planned_vus
    }

    pub fn max_possible_vus(&self) -> u64 {
        self.max_possible_vus
    }

    /// Next unique VU ID pair: `(local, global)`, both starting from 1 and
    /// respecting the execution segment's stride.
    pub fn get_unique_vu_identifiers(&self) -> (u64, u64) {
        let mut idx = self.vu_id_seg_index.lock();
        idx.next()
    }

    // ---- observational counters ----

    pub fn initialized_vus_count(&self) -> i64 {
        self.initialized_vus.load(Ordering::Relaxed)
    }

    pub fn mod_initialized_vus_count(&self, delta: i64) -> i64 {
        self.initialized_vus.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn active_vus_count(&self) -> i64 {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub fn mod_active_vus_count(&self, delta: i64) -> i64 {
        self.active_vus.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn uninitialized_unplanned_vus_count(&self) -> i64 {
        self.uninitialized_unplanned_vus.load(Ordering::Relaxed)
    }

    pub fn full_iteration_count(&self) -> u64 {
        self.full_iterations.load(Ordering::Relaxed)
    }

    pub fn add_full_iterations(&self, count: u64) -> u64 {
        self.full_iterations.fetch_add(count, Ordering::Relaxed) + count
    }

    pub fn interrupted_iteration_count(&self) -> u64 {
        self.interrupted_iterations.load(Ordering::Relaxed)
    }

    pub fn add_interrupted_iterations(&self, count: u64) -> u64 {
        self.interrupted_iterations.fetch_add(count, Ordering::Relaxed) + count
    }

    // ---- status machine ----

    /// Swaps in the new status and returns the previous one.
    pub fn set_execution_status(&self, new: ExecutionStatus) -> ExecutionStatus {
        ExecutionStatus::from_u32(self.execution_status.swap(new as u32, Ordering::SeqCst))
    }

    pub fn current_execution_status(&self) -> ExecutionStatus {
        ExecutionStatus::from_u32(self.execution_status.load(Ordering::SeqCst))
    }

    /// Stamps the test start time.
    ///
    /// Panics when called a second time; starting a run twice is a scheduler
    /// bug, not a recoverable condition.
    pub fn mark_started(&self) {
        if self
            .start_time
            .compare_exchange(0, self.now_ns(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("the execution scheduler was started a second time");
        }
        self.set_execution_status(ExecutionStatus::Started);
    }

    /// Stamps the test end time. Panics when called a second time.
    pub fn mark_ended(&self) {
        if self
            .end_time
            .compare_exchange(0, self.now_ns(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("the execution scheduler was stopped a second time");
        }
        self.set_execution_status(ExecutionStatus::Ended);
    }

    pub fn has_started(&self) -> bool {
        self.start_time.load(Ordering::SeqCst) != 0
    }

    pub fn has_ended(&self) -> bool {
        self.end_time.load(Ordering::SeqCst) != 0
    }

    // ---- pause / resume ----

    /// Fast path for observers; `current_pause_time != 0` is the paused flag.
    pub fn is_paused(&self) -> bool {
        self.current_pause_time.load(Ordering::SeqCst) != 0
    }

    pub fn pause(&self) -> Result<(), ExecError> {
        let mut ps = self.pause_state.write();
        if self
            .current_pause_time
            .compare_exchange(0, self.now_ns(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExecError::AlreadyPaused);
        }
        let (tx, rx) = bounded::<Infallible>(0);
        ps.resume_tx = Some(tx);
        ps.resume_rx = rx;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ExecError> {
        let mut ps = self.pause_state.write();
        let pause_started = self.current_pause_time.swap(0, Ordering::SeqCst);
        if pause_started == 0 {
            return Err(ExecError::NotPaused);
        }
        // A pause that arrived before the run started does not count against
        // the test duration.
        if self.start_time.load(Ordering::SeqCst) != 0 {
            ps.total_paused += Duration::from_nanos((self.now_ns() - pause_started).max(0) as u64);
        }
        ps.resume_tx.take();
        Ok(())
    }

    /// Receiver that becomes ready (disconnected) on resume. Check
    /// [`ExecutionState::is_paused`] first; this is the slow path.
    pub fn resume_notify(&self) -> Receiver<Infallible> {
        self.pause_state.read().resume_rx.clone()
    }

    /// Parks until the run is unpaused or `token` fires. Returns `false` when
    /// cancelled while waiting.
    pub fn wait_if_paused(&self, token: &CancelToken) -> bool {
        if !self.is_paused() {
            return true;
        }
        let resume = self.resume_notify();
        crossbeam_channel::select! {
            recv(resume) -> _ => true,
            recv(token.done()) -> _ => false,
        }
    }

    /// How long the test has effectively run: zero before start, frozen while
    /// paused and after the end, with all paused time subtracted.
    pub fn get_current_test_run_duration(&self) -> Duration {
        let start = self.start_time.load(Ordering::SeqCst);
        if start == 0 {
            return Duration::ZERO;
        }

        let (mut end, paused) = {
            let ps = self.pause_state.read();
            (self.end_time.load(Ordering::SeqCst), ps.total_paused)
        };
        if end == 0 {
            let pause_time = self.current_pause_time.load(Ordering::SeqCst);
            end = if pause_time != 0 {
                pause_time
            } else {
                self.now_ns()
            };
        }
        Duration::from_nanos((end - start).max(0) as u64).saturating_sub(paused)
    }

    // ---- VU pool ----

    pub fn set_init_vu_func(&self, f: InitVuFn) {
        *self.init_vu_func.write() = Some(f);
    }

    /// Borrows a pre-initialized VU from the buffer. This should be
    /// instantaneous under correct executor accounting; every
    /// [`MAX_TIME_TO_WAIT_FOR_PLANNED_VU`] spent waiting logs a warning, and
    /// exhausting all retries is a bug signal surfaced as
    /// [`ExecError::VuStarvation`].
    pub fn get_planned_vu(
        &self,
        modify_active_vu_count: bool,
    ) -> Result<Box<dyn InitializedVU>, ExecError> {
        let mut waited = Duration::ZERO;
        for attempt in 1..=MAX_RETRIES_GET_PLANNED_VU {
            match self.vus_rx.recv_timeout(MAX_TIME_TO_WAIT_FOR_PLANNED_VU) {
                Ok(vu) => {
                    if modify_active_vu_count {
                        self.mod_active_vus_count(1);
                    }
                    return Ok(vu);
                }
                Err(RecvTimeoutError::Timeout) => {
                    waited += MAX_TIME_TO_WAIT_FOR_PLANNED_VU;
                    warn!(attempt, waited_ms = waited.as_millis() as u64,
                        "could not get a VU from the buffer");
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Err(ExecError::VuStarvation(waited))
    }

    /// Hands out an unplanned VU: constructs a fresh one while the lazy
    /// budget lasts, then falls back to the shared buffer. Never bumps the
    /// active-VU counter; callers that use the VU immediately do that
    /// themselves.
    ///
    /// The budget check is a CAS loop that refuses to go below zero, so no
    /// observer ever sees a transiently negative count.
    pub fn get_unplanned_vu(&self, token: &CancelToken) -> Result<Box<dyn InitializedVU>, ExecError> {
        loop {
            let remaining = self.uninitialized_unplanned_vus.load(Ordering::SeqCst);
            if remaining <= 0 {
                debug!("reusing a previously initialized unplanned VU");
                return self.get_planned_vu(false);
            }
            if self
                .uninitialized_unplanned_vus
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!("initializing an unplanned VU, this may affect test results");
                return self.initialize_new_vu(token);
            }
        }
    }

    /// Constructs a brand new VU through the injected constructor and bumps
    /// the initialized counter.
    pub fn initialize_new_vu(&self, token: &CancelToken) -> Result<Box<dyn InitializedVU>, ExecError> {
        let init = self
            .init_vu_func
            .read()
            .clone()
            .ok_or_else(|| ExecError::Config("VU init function was not set".into()))?;
        let vu = init(self, token)?;
        self.mod_initialized_vus_count(1);
        Ok(vu)
    }

    /// Puts a VU into the buffer during Init and counts it as initialized.
    pub fn add_initialized_vu(&self, vu: Box<dyn InitializedVU>) {
        if self.vus_tx.try_send(vu).is_err() {
            panic!("tried to add a VU beyond the buffer capacity");
        }
        self.mod_initialized_vus_count(1);
    }

    /// Returns a borrowed VU to the buffer. Returning more VUs than were
    /// borrowed would overflow the buffer and is a programming error, hence
    /// the panic instead of a blocking send.
    pub fn return_vu(&self, vu: Box<dyn InitializedVU>, was_active: bool) {
        if self.vus_tx.try_send(vu).is_err() {
            panic!("a VU was returned to an already full buffer");
        }
        if was_active {
            self.mod_active_vus_count(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::cancel::cancel_pair;
    use crate::exec::testutil::MiniRunner;
    use crate::exec::vu::Runner;
    use crate::stats::sample_channel;
    use std::sync::Arc;

    fn new_state(max_planned: u64, max_possible: u64) -> ExecutionState {
        ExecutionState::new(
            Options::default(),
            ExecutionTuple::full(),
            max_planned,
            max_possible,
        )
    }

    fn install_mini_init(state: &ExecutionState) {
        let runner = Arc::new(MiniRunner::default());
        let (tx, rx) = sample_channel(1024);
        std::mem::forget(rx); // keep the channel open; these VUs never send
        let ids = Arc::new(AtomicU64::new(0));
        state.set_init_vu_func(Arc::new(
            move |_state: &ExecutionState, _token: &CancelToken| {
                let n = ids.fetch_add(1, Ordering::Relaxed) + 1;
                runner.new_vu(n, n, tx.clone())
            },
        ));
    }

    #[test]
    fn test_unique_vu_identifiers_are_distinct() {
        let state = new_state(0, 0);
        let mut locals = std::collections::HashSet::new();
        let mut globals = std::collections::HashSet::new();
        for _ in 0..100 {
            let (local, global) = state.get_unique_vu_identifiers();
            assert!(locals.insert(local));
            assert!(globals.insert(global));
        }
        assert_eq!(locals.len(), 100);
        assert_eq!(globals.len(), 100);
    }

    #[test]
    fn test_status_swap_returns_previous() {
        let state = new_state(0, 0);
        assert_eq!(state.current_execution_status(), ExecutionStatus::Created);
        let old = state.set_execution_status(ExecutionStatus::InitVus);
        assert_eq!(old, ExecutionStatus::Created);
        let old = state.set_execution_status(ExecutionStatus::InitExecutors);
        assert_eq!(old, ExecutionStatus::InitVus);
    }

    #[test]
    #[should_panic(expected = "started a second time")]
    fn test_mark_started_twice_panics() {
        let state = new_state(0, 0);
        state.mark_started();
        state.mark_started();
    }

    #[test]
    fn test_mark_started_race_exactly_one_wins() {
        let state = Arc::new(new_state(0, 0));
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        state.mark_started()
                    }))
                    .is_ok()
                })
            })
            .collect();
        let oks: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(oks.iter().filter(|ok| **ok).count(), 1);
        assert!(state.has_started());
    }

    #[test]
    fn test_duration_zero_before_start() {
        let state = new_state(0, 0);
        assert_eq!(state.get_current_test_run_duration(), Duration::ZERO);
    }

    #[test]
    fn test_pause_resume_alternate_strictly() {
        let state = new_state(0, 0);
        assert!(matches!(state.resume(), Err(ExecError::NotPaused)));
        state.pause().unwrap();
        assert!(state.is_paused());
        assert!(matches!(state.pause(), Err(ExecError::AlreadyPaused)));
        state.resume().unwrap();
        assert!(!state.is_paused());
        assert!(matches!(state.resume(), Err(ExecError::NotPaused)));
    }

    #[test]
    fn test_pause_before_start_accumulates_nothing() {
        let state = new_state(0, 0);
        state.pause().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        state.resume().unwrap();
        state.mark_started();
        let total = state.pause_state.read().total_paused;
        assert_eq!(total, Duration::ZERO);
    }

    #[test]
    fn test_paused_duration_accumulates_spans() {
        let state = new_state(0, 0);
        state.mark_started();
        let mut expected_min = Duration::ZERO;
        for _ in 0..3 {
            state.pause().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            state.resume().unwrap();
            expected_min += Duration::from_millis(20);
        }
        let total = state.pause_state.read().total_paused;
        assert!(total >= expected_min, "accumulated {total:?} < {expected_min:?}");
        // Sanity: the spans are in the tens of milliseconds, not seconds.
        assert!(total < Duration::from_secs(1));
    }

    #[test]
    fn test_duration_frozen_while_paused() {
        let state = new_state(0, 0);
        state.mark_started();
        std::thread::sleep(Duration::from_millis(10));
        state.pause().unwrap();
        let at_pause = state.get_current_test_run_duration();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(state.get_current_test_run_duration(), at_pause);
        state.resume().unwrap();
        assert!(state.get_current_test_run_duration() >= at_pause);
    }

    #[test]
    fn test_resume_notify_broadcasts() {
        let state = Arc::new(new_state(0, 0));
        state.pause().unwrap();
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                let rx = state.resume_notify();
                // Blocks until the channel closes on resume.
                rx.recv().is_err()
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        state.resume().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_if_paused_cancellable() {
        let state = Arc::new(new_state(0, 0));
        state.pause().unwrap();
        let (canceller, token) = cancel_pair();
        let handle = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.wait_if_paused(&token))
        };
        canceller.cancel();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_planned_vu_starvation_times_out() {
        let state = new_state(0, 2);
        let start = Instant::now();
        let err = match state.get_planned_vu(true) {
            Ok(_) => panic!("expected starvation"),
            Err(err) => err,
        };
        let elapsed = start.elapsed();
        assert!(matches!(err, ExecError::VuStarvation(_)));
        assert!(elapsed >= Duration::from_millis(1900), "gave up after {elapsed:?}");
        assert_eq!(state.active_vus_count(), 0);
    }

    #[test]
    fn test_borrow_and_return_roundtrip() {
        let state = new_state(2, 2);
        let runner = MiniRunner::default();
        let (tx, rx) = sample_channel(16);
        std::mem::forget(rx);
        for i in 0..2u64 {
            let vu = runner.new_vu(i + 1, i + 1, tx.clone()).unwrap();
            state.add_initialized_vu(vu);
        }
        assert_eq!(state.initialized_vus_count(), 2);

        let vu = state.get_planned_vu(true).unwrap();
        assert_eq!(state.active_vus_count(), 1);
        state.return_vu(vu, true);
        assert_eq!(state.active_vus_count(), 0);
        assert_eq!(state.initialized_vus_count(), 2);
    }

    #[test]
    fn test_unplanned_budget_is_bounded() {
        let state = new_state(2, 5);
        install_mini_init(&state);
        let token = CancelToken::never();

        assert_eq!(state.uninitialized_unplanned_vus_count(), 3);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(state.get_unplanned_vu(&token).unwrap());
        }
        assert_eq!(state.uninitialized_unplanned_vus_count(), 0);
        assert_eq!(state.initialized_vus_count(), 3);

        // Budget exhausted: the next request falls through to the planned
        // buffer, which is empty, so it must starve rather than construct.
        let start = Instant::now();
        let err = match state.get_unplanned_vu(&token) {
            Ok(_) => panic!("expected starvation"),
            Err(err) => err,
        };
        assert!(matches!(err, ExecError::VuStarvation(_)));
        assert!(start.elapsed() >= Duration::from_millis(1900));
        assert_eq!(state.initialized_vus_count(), 3);
        assert_eq!(state.uninitialized_unplanned_vus_count(), 0);
    }

    #[test]
    fn test_unplanned_falls_back_to_buffer() {
        let state = new_state(1, 1);
        install_mini_init(&state);
        let token = CancelToken::never();
        let vu = state.initialize_new_vu(&token).unwrap();
        state.add_initialized_vu(vu);

        // No unplanned budget at all: the call must come from the buffer.
        let vu = state.get_unplanned_vu(&token).unwrap();
        assert_eq!(state.active_vus_count(), 0);
        state.return_vu(vu, false);
    }

    #[test]
    #[should_panic(expected = "already full buffer")]
    fn test_double_return_panics() {
        let state = new_state(1, 1);
        install_mini_init(&state);
        let token = CancelToken::never();
        let vu = state.initialize_new_vu(&token).unwrap();
        state.add_initialized_vu(vu);
        let extra = state.initialize_new_vu(&token).unwrap();
        // The buffer already holds its full capacity.
        state.return_vu(extra, false);
    }

    #[test]
    fn test_iteration_counters_monotonic() {
        let state = new_state(0, 0);
        assert_eq!(state.add_full_iterations(2), 2);
        assert_eq!(state.add_interrupted_iterations(1), 1);
        assert_eq!(state.add_full_iterations(1), 3);
        assert_eq!(state.full_iteration_count() + state.interrupted_iteration_count(), 4);
    }
}
