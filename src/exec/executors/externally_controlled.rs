//! Executor whose VU target is steered from outside while the test runs,
//! e.g. by a REST controller or an interactive session. The only executor
//! that supports pausing and resuming mid-run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::info;

use super::{record_iteration, scenario_tags};
use crate::cli::config::{parse_duration, ScenarioConfig};
use crate::exec::cancel::CancelToken;
use crate::exec::segment::ExecutionTuple;
use crate::exec::state::ExecutionState;
use crate::exec::vu::{ActivationParams, InitializedVU};
use crate::exec::{ExecError, ExecutionRequirement, Executor};
use crate::stats::Samples;

const TICK: Duration = Duration::from_millis(100);

fn parse_config(cfg: &ScenarioConfig) -> Result<(u64, u64, Duration), ExecError> {
    let starting = cfg.vus.unwrap_or(0);
    let max_vus = cfg.max_vus.unwrap_or(starting).max(starting);
    if max_vus == 0 {
        return Err(ExecError::Config(
            "externally-controlled requires vus or maxVUs".into(),
        ));
    }
    let duration = cfg
        .duration
        .as_deref()
        .ok_or_else(|| ExecError::Config("externally-controlled requires a duration".into()))
        .and_then(parse_duration)?;
    Ok((starting, max_vus, duration))
}

pub(super) fn requirements(
    cfg: &ScenarioConfig,
    et: &ExecutionTuple,
) -> Result<Vec<ExecutionRequirement>, ExecError> {
    let (_, max_vus, _) = parse_config(cfg)?;
    // Everything is planned up-front: an operator may ramp to the ceiling at
    // any moment and lazy initialization would lag the command.
    let scaled = et.scale(max_vus);
    Ok(vec![ExecutionRequirement {
        time_offset: cfg.start_delay()?,
        planned_vus: scaled,
        max_vus: scaled,
    }])
}

/// Shared knob for steering a running externally-controlled scenario.
#[derive(Clone)]
pub struct ControlHandle {
    target: Arc<AtomicU64>,
    max_vus: u64,
}

impl ControlHandle {
    /// Sets the global VU target, clamped to the configured ceiling, and
    /// returns the value actually applied.
    pub fn set_target(&self, target: u64) -> u64 {
        let clamped = target.min(self.max_vus);
        self.target.store(clamped, Ordering::SeqCst);
        clamped
    }

    pub fn target(&self) -> u64 {
        self.target.load(Ordering::SeqCst)
    }
}

pub struct ExternallyControlled {
    name: String,
    max_vus: u64,
    duration: Duration,
    start_delay: Duration,
    exec: String,
    tags: HashMap<String, String>,
    tag_vu: bool,
    /// Global (unscaled) VU target; scaled per tick against the segment.
    target: Arc<AtomicU64>,
    state: Arc<ExecutionState>,
}

impl ExternallyControlled {
    pub fn new(
        name: &str,
        cfg: &ScenarioConfig,
        state: Arc<ExecutionState>,
    ) -> Result<Self, ExecError> {
        let (starting, max_vus, duration) = parse_config(cfg)?;
        let (tags, tag_vu) = scenario_tags(&state, name, cfg)?;
        Ok(Self {
            name: name.to_string(),
            max_vus,
            duration,
            start_delay: cfg.start_delay()?,
            exec: cfg.exec.clone().unwrap_or_else(|| "default".to_string()),
            tags,
            tag_vu,
            target: Arc::new(AtomicU64::new(starting)),
            state,
        })
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            target: Arc::clone(&self.target),
            max_vus: self.max_vus,
        }
    }

    fn spawn_worker(
        &self,
        token: &CancelToken,
        samples_out: &Sender<Samples>,
        base: Duration,
    ) -> Result<(JoinHandle<Box<dyn InitializedVU>>, Arc<AtomicBool>), ExecError> {
        let vu = self.state.get_planned_vu(true)?;
        let mut tags = self.tags.clone();
        if self.tag_vu {
            tags.insert("vu".to_string(), vu.id_local().to_string());
        }
        let params = ActivationParams::new(token.clone(), &self.name)
            .with_exec(self.exec.clone())
            .with_tags(tags.clone());
        let mut active = vu.activate(params);

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let state = Arc::clone(&self.state);
        let token = token.clone();
        let samples = samples_out.clone();
        let duration = self.duration;
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Relaxed)
                && !token.is_cancelled()
                && state.get_current_test_run_duration().saturating_sub(base) < duration
            {
                // Mid-run pause parks the VU between iterations.
                if !state.wait_if_paused(&token) {
                    break;
                }
                let started = Instant::now();
                let result = active.run_once();
                record_iteration(&state, &samples, &tags, started, &result);
                if matches!(result, Err(ExecError::Cancelled)) {
                    break;
                }
            }
            active.deactivate()
        });
        Ok((handle, running))
    }
}

impl Executor for ExternallyControlled {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, _token: &CancelToken) -> Result<(), ExecError> {
        Ok(())
    }

    fn execution_requirements(&self) -> Vec<ExecutionRequirement> {
        let scaled = self.state.execution_tuple().scale(self.max_vus);
        vec![ExecutionRequirement {
            time_offset: self.start_delay,
            planned_vus: scaled,
            max_vus: scaled,
        }]
    }

    fn is_pausable(&self) -> bool {
        true
    }

    fn start_delay(&self) -> Duration {
        self.start_delay
    }

    fn run(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        info!(scenario = %self.name, max_vus = self.max_vus,
            duration_s = self.duration.as_secs_f64(),
            "starting externally-controlled executor");

        let base = self.state.get_current_test_run_duration();
        let mut workers: Vec<(JoinHandle<Box<dyn InitializedVU>>, Arc<AtomicBool>)> = Vec::new();
        let mut first_err = None;

        loop {
            if token.is_cancelled() {
                break;
            }
            let elapsed = self.state.get_current_test_run_duration().saturating_sub(base);
            if elapsed >= self.duration {
                break;
            }
            if !self.state.wait_if_paused(token) {
                break;
            }

            let target = self
                .state
                .execution_tuple()
                .scale(self.target.load(Ordering::SeqCst)) as usize;
            while workers.len() < target {
                match self.spawn_worker(token, samples_out, base) {
                    Ok(worker) => workers.push(worker),
                    Err(err) => {
                        first_err = Some(err);
                        break;
                    }
                }
            }
            if first_err.is_some() {
                break;
            }
            while workers.len() > target {
                if let Some((handle, running)) = workers.pop() {
                    running.store(false, Ordering::Relaxed);
                    match handle.join() {
                        Ok(vu) => self.state.return_vu(vu, true),
                        Err(_) => {
                            first_err.get_or_insert_with(|| {
                                ExecError::Script("a VU worker panicked".into())
                            });
                        }
                    }
                }
            }

            token.sleep(TICK);
        }

        for (_, running) in &workers {
            running.store(false, Ordering::Relaxed);
        }
        for (handle, _) in workers {
            match handle.join() {
                Ok(vu) => self.state.return_vu(vu, true),
                Err(_) => {
                    first_err
                        .get_or_insert_with(|| ExecError::Script("a VU worker panicked".into()));
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
