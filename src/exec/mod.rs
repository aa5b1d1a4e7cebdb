//! The execution core: VU pool and lifecycle, per-VU event loop, executors,
//! and the scheduler that drives them against a shared [`ExecutionState`].

pub mod cancel;
pub mod eventloop;
pub mod executors;
pub mod scheduler;
pub mod segment;
pub mod state;
pub mod tags;
pub mod testutil;
pub mod vu;

use std::time::Duration;

use crossbeam_channel::Sender;
use thiserror::Error;

pub use cancel::{cancel_pair, CancelToken, Canceller};
pub use eventloop::EventLoop;
pub use scheduler::LocalScheduler;
pub use state::{ExecutionState, ExecutionStatus};
pub use tags::TagMap;
pub use vu::{ActivationParams, ActiveVU, InitializedVU, Runner};

use crate::stats::Samples;

/// Errors surfaced by the execution core. VU-level failures never poison the
/// pool; fatal ones flow up through [`LocalScheduler::run`] and the caller
/// picks the exit code.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("could not initialize VU: {0}")]
    VuConstruction(String),
    #[error("could not get a VU from the buffer in {0:?}")]
    VuStarvation(Duration),
    #[error("script error: {0}")]
    Script(String),
    #[error("test execution was already paused")]
    AlreadyPaused,
    #[error("test execution wasn't paused")]
    NotPaused,
    #[error("execution was cancelled")]
    Cancelled,
    #[error("setup ran for longer than {0:?}")]
    SetupTimeout(Duration),
    #[error("teardown ran for longer than {0:?}")]
    TeardownTimeout(Duration),
    #[error("the sample channel was closed")]
    SampleChannelClosed,
}

/// One row of an executor's declared needs, relative to the start of the run.
/// The scheduler sums these across executors to size the VU pool before
/// anything is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionRequirement {
    pub time_offset: Duration,
    /// VUs that must be pre-initialized before this offset.
    pub planned_vus: u64,
    /// Ceiling including lazily initialized unplanned VUs.
    pub max_vus: u64,
}

/// Aggregates requirement rows into the `(planned, possible)` pool sizes.
pub fn pool_sizes<'a>(
    requirements: impl IntoIterator<Item = &'a ExecutionRequirement>,
) -> (u64, u64) {
    let mut planned = 0;
    let mut possible = 0;
    for req in requirements {
        planned = planned.max(req.planned_vus);
        possible = possible.max(req.max_vus.max(req.planned_vus));
    }
    (planned, possible)
}

/// A policy deciding when VUs run iterations and how many are active at each
/// instant. Executors borrow VUs from the shared state, must treat
/// [`ExecutionState::get_current_test_run_duration`] as the authoritative
/// clock (so pauses stretch their schedules), and must stop promptly when the
/// token fires.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Reserve or prepare whatever the executor needs before the run starts.
    fn init(&self, token: &CancelToken) -> Result<(), ExecError>;

    /// Drive iterations until the schedule is exhausted or `token` fires.
    /// Plain cancellation is not an error.
    fn run(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError>;

    fn execution_requirements(&self) -> Vec<ExecutionRequirement>;

    /// Whether the scheduler may honor a pause request after the run started.
    fn is_pausable(&self) -> bool {
        false
    }

    /// Delay before the executor's schedule begins.
    fn start_delay(&self) -> Duration {
        Duration::ZERO
    }
}
