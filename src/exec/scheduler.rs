//! The local execution scheduler: sizes the VU pool from the executors'
//! declared needs, initializes everything, then drives all executors
//! concurrently against the shared state.

use std::sync::Arc;

use crossbeam_channel::{bounded, select, Sender};
use tracing::{debug, error, info, warn};

use super::cancel::{cancel_pair, CancelToken};
use super::executors;
use super::state::{ExecutionState, ExecutionStatus, InitVuFn};
use super::vu::Runner;
use super::{pool_sizes, ExecError, Executor};
use crate::cli::config::Options;
use crate::stats::{MetricKind, Sample, Samples, VUS, VUS_MAX};

/// Schedules VUs on the local machine. The same surface could be implemented
/// by a controller for a test distributed across instances; executors and the
/// state would not notice the difference.
pub struct LocalScheduler {
    runner: Arc<dyn Runner>,
    state: Arc<ExecutionState>,
    executors: Vec<Arc<dyn Executor>>,
}

impl LocalScheduler {
    /// Validates the plan, sums executor requirements into the pool sizes and
    /// builds the executors. Nothing is initialized yet.
    pub fn new(runner: Arc<dyn Runner>, options: Options) -> Result<Self, ExecError> {
        let et = options.execution_tuple()?;
        let scenarios = options.effective_scenarios();

        let mut max_planned_vus = 0u64;
        let mut max_possible_vus = 0u64;
        for (name, cfg) in &scenarios {
            let reqs = executors::requirements(cfg, &et)
                .map_err(|err| ExecError::Config(format!("scenario {name:?}: {err}")))?;
            let (planned, possible) = pool_sizes(reqs.iter());
            // Cumulative demand must fit the pool, so executor maxima sum.
            max_planned_vus += planned;
            max_possible_vus += possible;
        }

        let state = Arc::new(ExecutionState::new(
            options,
            et,
            max_planned_vus,
            max_possible_vus,
        ));
        let executors = scenarios
            .iter()
            .map(|(name, cfg)| executors::build(name, cfg, Arc::clone(&state)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            runner,
            state,
            executors,
        })
    }

    pub fn state(&self) -> &Arc<ExecutionState> {
        &self.state
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub fn executors(&self) -> &[Arc<dyn Executor>] {
        &self.executors
    }

    /// Pre-allocates all planned VUs and initializes every executor. With
    /// `paused` in the options, blocks in status `PausedBeforeRun` until the
    /// run is resumed or `token` fires.
    pub fn init(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        self.state.set_execution_status(ExecutionStatus::InitVus);

        let runner = Arc::clone(&self.runner);
        let samples = samples_out.clone();
        let init_fn: InitVuFn = Arc::new(move |state: &ExecutionState, _token: &CancelToken| {
            let (id_local, id_global) = state.get_unique_vu_identifiers();
            debug!(id_local, id_global, "initializing VU");
            runner.new_vu(id_local, id_global, samples.clone())
        });
        self.state.set_init_vu_func(Arc::clone(&init_fn));

        let planned = self.state.max_planned_vus();
        info!(
            planned,
            max_possible = self.state.max_possible_vus(),
            "initializing VUs"
        );
        for _ in 0..planned {
            if token.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            let vu = init_fn(&self.state, token)?;
            self.state.add_initialized_vu(vu);
        }

        self.state.set_execution_status(ExecutionStatus::InitExecutors);
        for executor in &self.executors {
            executor.init(token)?;
        }
        self.state.set_execution_status(ExecutionStatus::InitDone);

        if self.state.options.paused == Some(true) {
            match self.state.pause() {
                Ok(()) | Err(ExecError::AlreadyPaused) => {}
                Err(err) => return Err(err),
            }
            self.state.set_execution_status(ExecutionStatus::PausedBeforeRun);
            info!("execution is paused, waiting for a resume");
            if !self.state.wait_if_paused(token) {
                return Err(ExecError::Cancelled);
            }
        }
        Ok(())
    }

    /// Runs the test: Setup on a transient VU, all executors concurrently,
    /// Teardown on another transient VU. `run_token` cancels the test proper;
    /// `global_token` outlives it by a grace window so teardown and the final
    /// sample drain can finish. A clean interrupt is not an error.
    pub fn run(
        &self,
        global_token: &CancelToken,
        run_token: &CancelToken,
        samples_out: &Sender<Samples>,
    ) -> Result<(), ExecError> {
        self.state.mark_started();
        let run_result = self.run_inner(run_token, samples_out);

        let teardown_result = if self.state.options.no_teardown == Some(true) {
            Ok(())
        } else {
            // Teardown runs under the longer-lived token even after failures
            // or interruption.
            self.state.set_execution_status(ExecutionStatus::Teardown);
            self.run_stage("teardown", global_token, samples_out)
        };

        self.state.mark_ended();
        if run_token.is_cancelled() {
            self.state.set_execution_status(ExecutionStatus::Interrupted);
        }
        info!(
            duration_s = self.state.get_current_test_run_duration().as_secs_f64(),
            full_iterations = self.state.full_iteration_count(),
            interrupted_iterations = self.state.interrupted_iteration_count(),
            "execution finished"
        );
        run_result.and(teardown_result)
    }

    fn run_inner(
        &self,
        run_token: &CancelToken,
        samples_out: &Sender<Samples>,
    ) -> Result<(), ExecError> {
        if self.state.options.no_setup != Some(true) {
            self.state.set_execution_status(ExecutionStatus::Setup);
            self.run_stage("setup", run_token, samples_out)?;
        }

        self.state.set_execution_status(ExecutionStatus::Running);
        info!(executors = self.executors.len(), "execution scheduler starting executors");

        let (exec_canceller, exec_token) = cancel_pair();
        let (done_tx, done_rx) = bounded::<()>(0);

        // Mirror run-token cancellation into the executor token, flipping the
        // status the moment the interrupt is observed.
        let watcher = {
            let state = Arc::clone(&self.state);
            let run_token = run_token.clone();
            let exec_canceller = exec_canceller.clone();
            let done_rx = done_rx.clone();
            std::thread::spawn(move || {
                select! {
                    recv(run_token.done()) -> _ => {
                        state.set_execution_status(ExecutionStatus::Interrupted);
                        warn!("run interrupted, waiting for executors to wind down");
                        exec_canceller.cancel();
                    }
                    recv(done_rx) -> _ => {}
                }
            })
        };

        // Periodic vus / vus_max gauges while executors run.
        let reporter = {
            let state = Arc::clone(&self.state);
            let samples = samples_out.clone();
            std::thread::spawn(move || loop {
                select! {
                    recv(done_rx) -> _ => return,
                    default(std::time::Duration::from_secs(1)) => {
                        let _ = samples.send(Samples(vec![
                            Sample::new(VUS, MetricKind::Gauge, state.active_vus_count() as f64),
                            Sample::new(VUS_MAX, MetricKind::Gauge, state.max_possible_vus() as f64),
                        ]));
                    }
                }
            })
        };

        let handles: Vec<_> = self
            .executors
            .iter()
            .map(|executor| {
                let executor = Arc::clone(executor);
                let token = exec_token.clone();
                let samples = samples_out.clone();
                let canceller = exec_canceller.clone();
                std::thread::spawn(move || {
                    let delay = executor.start_delay();
                    if !delay.is_zero() && !token.sleep(delay) {
                        return Ok(());
                    }
                    let result = executor.run(&token, &samples);
                    if let Err(err) = &result {
                        error!(scenario = executor.name(), error = %err,
                            "executor failed, interrupting the others");
                        canceller.cancel();
                    }
                    result
                })
            })
            .collect();

        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(_) => {
                    first_err.get_or_insert(ExecError::Script("an executor thread panicked".into()));
                }
            }
        }
        drop(done_tx);
        let _ = watcher.join();
        let _ = reporter.join();

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs a one-shot lifecycle hook on a transient VU with its configured
    /// timeout. The hook thread is abandoned (its token cancelled) on timeout
    /// or outer cancellation.
    fn run_stage(
        &self,
        stage: &'static str,
        token: &CancelToken,
        samples_out: &Sender<Samples>,
    ) -> Result<(), ExecError> {
        let timeout = if stage == "setup" {
            self.state.options.setup_timeout_duration()?
        } else {
            self.state.options.teardown_timeout_duration()?
        };
        info!(stage, timeout_s = timeout.as_secs_f64(), "running lifecycle stage");

        let (stage_canceller, stage_token) = cancel_pair();
        let (result_tx, result_rx) = bounded(1);
        let runner = Arc::clone(&self.runner);
        let samples = samples_out.clone();
        let worker = std::thread::spawn(move || {
            let result = if stage == "setup" {
                runner.setup(&stage_token, &samples)
            } else {
                runner.teardown(&stage_token, &samples)
            };
            let _ = result_tx.send(result);
        });

        select! {
            recv(result_rx) -> result => {
                let _ = worker.join();
                result.unwrap_or_else(|_| {
                    Err(ExecError::Script(format!("the {stage} worker disappeared")))
                })
            }
            recv(token.done()) -> _ => {
                stage_canceller.cancel();
                Err(ExecError::Cancelled)
            }
            default(timeout) => {
                stage_canceller.cancel();
                if stage == "setup" {
                    Err(ExecError::SetupTimeout(timeout))
                } else {
                    Err(ExecError::TeardownTimeout(timeout))
                }
            }
        }
    }

    /// Pauses or resumes the run. Pausing after the start is honored only
    /// when every executor supports it.
    pub fn set_paused(&self, paused: bool) -> Result<(), ExecError> {
        if paused && self.state.has_started() {
            for executor in &self.executors {
                if !executor.is_pausable() {
                    return Err(ExecError::Config(format!(
                        "executor {} doesn't support pause and resume operations after the run has started",
                        executor.name()
                    )));
                }
            }
        }
        if paused {
            self.state.pause()
        } else {
            self.state.resume()
        }
    }
}
