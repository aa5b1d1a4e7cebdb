//! A fixed number of VUs looping for a fixed duration, the closed-model
//! workhorse.

use std::collections::HashMap;
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

fn parse_config(cfg: &ScenarioConfig) -> Result<(u64, Duration), ExecError> {
    let vus = cfg
        .vus
        .filter(|v| *v > 0)
        .ok_or_else(|| ExecError::Config("constant-vus requires a positive vus count".into()))?;
    let duration = cfg
        .duration
        .as_deref()
        .ok_or_else(|| ExecError::Config("constant-vus requires a duration".into()))
        .and_then(parse_duration)?;
    if duration.is_zero() {
        return Err(ExecError::Config(
            "constant-vus requires a non-zero duration".into(),
        ));
    }
    Ok((vus, duration))
}

pub(super) fn requirements(
    cfg: &ScenarioConfig,
    et: &ExecutionTuple,
) -> Result<Vec<ExecutionRequirement>, ExecError> {
    let (vus, _) = parse_config(cfg)?;
    let scaled = et.scale(vus);
    Ok(vec![ExecutionRequirement {
        time_offset: cfg.start_delay()?,
        planned_vus: scaled,
        max_vus: scaled,
    }])
}

pub struct ConstantVus {
    name: String,
    vus: u64,
    duration: Duration,
    start_delay: Duration,
    exec: String,
    tags: HashMap<String, String>,
    tag_vu: bool,
    state: Arc<ExecutionState>,
}

impl ConstantVus {
    pub fn new(
        name: &str,
        cfg: &ScenarioConfig,
        state: Arc<ExecutionState>,
    ) -> Result<Self, ExecError> {
        let (vus, duration) = parse_config(cfg)?;
        let (tags, tag_vu) = scenario_tags(&state, name, cfg)?;
        Ok(Self {
            name: name.to_string(),
            vus: state.execution_tuple().scale(vus),
            duration,
            start_delay: cfg.start_delay()?,
            exec: cfg.exec.clone().unwrap_or_else(|| "default".to_string()),
            tags,
            tag_vu,
            state,
        })
    }
}

impl Executor for ConstantVus {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, _token: &CancelToken) -> Result<(), ExecError> {
        Ok(())
    }

    fn execution_requirements(&self) -> Vec<ExecutionRequirement> {
        vec![ExecutionRequirement {
            time_offset: self.start_delay,
            planned_vus: self.vus,
            max_vus: self.vus,
        }]
    }

    fn start_delay(&self) -> Duration {
        self.start_delay
    }

    fn run(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        info!(scenario = %self.name, vus = self.vus, duration_s = self.duration.as_secs_f64(),
            "starting constant-VUs executor");

        let base = self.state.get_current_test_run_duration();
        let mut workers: Vec<JoinHandle<Box<dyn InitializedVU>>> =
            Vec::with_capacity(self.vus as usize);
        let mut first_err = None;

        for _ in 0..self.vus {
            let vu = match self.state.get_planned_vu(true) {
                Ok(vu) => vu,
                Err(err) => {
                    first_err = Some(err);
                    break;
                }
            };
            let mut tags = self.tags.clone();
            if self.tag_vu {
                tags.insert("vu".to_string(), vu.id_local().to_string());
            }
            let params = ActivationParams::new(token.clone(), &self.name)
                .with_exec(self.exec.clone())
                .with_tags(tags.clone());
            let mut active = vu.activate(params);

            let state = Arc::clone(&self.state);
            let token = token.clone();
            let samples = samples_out.clone();
            let duration = self.duration;
            workers.push(std::thread::spawn(move || {
                while !token.is_cancelled()
                    && state.get_current_test_run_duration().saturating_sub(base) < duration
                {
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
            }));
        }

        for worker in workers {
            match worker.join() {
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
