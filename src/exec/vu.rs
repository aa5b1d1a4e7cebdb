//! The virtual-user lifecycle: a `Runner` constructs initialized VUs, an
//! executor activates one for a stretch of iterations and deactivates it
//! before handing it back to the pool.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::Sender;

use super::cancel::CancelToken;
use super::ExecError;
use crate::cli::config::Options;
use crate::stats::{Report, Samples};

/// Everything an executor passes down when it activates a VU.
#[derive(Clone)]
pub struct ActivationParams {
    pub run_token: CancelToken,
    /// Scenario the VU is running under, used for tagging.
    pub scenario: String,
    /// Name of the exported script function to run, usually `"default"`.
    pub exec: String,
    pub env: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

impl ActivationParams {
    pub fn new(run_token: CancelToken, scenario: impl Into<String>) -> Self {
        Self {
            run_token,
            scenario: scenario.into(),
            exec: "default".to_string(),
            env: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    pub fn with_exec(mut self, exec: impl Into<String>) -> Self {
        self.exec = exec.into();
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Final numbers handed to `Runner::handle_summary` once the run is over.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub test_run_duration: Duration,
    pub full_iterations: u64,
    pub interrupted_iterations: u64,
    pub report: Report,
}

/// Constructs VUs and owns the one-shot lifecycle hooks. Implementations:
/// the script-backed runner in `crate::js`, and the closure-backed
/// [`MiniRunner`](super::testutil::MiniRunner) for tests.
pub trait Runner: Send + Sync {
    fn new_vu(
        &self,
        id_local: u64,
        id_global: u64,
        samples_out: Sender<Samples>,
    ) -> Result<Box<dyn InitializedVU>, ExecError>;

    fn setup(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError>;

    fn teardown(&self, token: &CancelToken, samples_out: &Sender<Samples>)
        -> Result<(), ExecError>;

    /// Returns artifacts as a file-name → content map; empty means "use the
    /// default report".
    fn handle_summary(
        &self,
        token: &CancelToken,
        summary: &Summary,
    ) -> Result<HashMap<String, String>, ExecError>;

    fn default_group(&self) -> String {
        String::new()
    }

    fn options(&self) -> Options;
}

/// A VU whose script context has been initialized (imports resolved,
/// top-level statements evaluated). Holds no per-iteration state. Lives from
/// construction until pool teardown and is never duplicated.
pub trait InitializedVU: Send {
    /// Consumes the initialized VU and produces the activated form. The VU is
    /// exclusively owned by one executor from here until deactivation.
    fn activate(self: Box<Self>, params: ActivationParams) -> Box<dyn ActiveVU>;

    fn id_local(&self) -> u64;

    fn id_global(&self) -> u64;
}

/// An activated VU. `run_once` executes exactly one script iteration;
/// `deactivate` reverts to the initialized form so the VU can be pooled
/// again.
pub trait ActiveVU: Send {
    /// Runs one iteration. `Err(ExecError::Cancelled)` means the iteration
    /// was interrupted by the run token; any other error is a script failure.
    /// The caller tallies full vs interrupted iterations either way.
    fn run_once(&mut self) -> Result<(), ExecError>;

    fn deactivate(self: Box<Self>) -> Box<dyn InitializedVU>;
}
