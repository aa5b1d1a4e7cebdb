//! Linearly ramps the active VU count through a list of stages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
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

fn parse_stages(cfg: &ScenarioConfig) -> Result<Vec<(Duration, u64)>, ExecError> {
    let stages = cfg
        .stages
        .as_ref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExecError::Config("ramping-vus requires at least one stage".into()))?;
    stages
        .iter()
        .map(|stage| {
            let duration = parse_duration(&stage.duration)?;
            if duration.is_zero() {
                return Err(ExecError::Config("ramping-vus stage duration is zero".into()));
            }
            Ok((duration, stage.target))
        })
        .collect()
}

pub(super) fn requirements(
    cfg: &ScenarioConfig,
    et: &ExecutionTuple,
) -> Result<Vec<ExecutionRequirement>, ExecError> {
    let stages = parse_stages(cfg)?;
    let start_vus = cfg.start_vus.unwrap_or(0);
    // The pool must fit the peak of the whole schedule.
    let peak = stages
        .iter()
        .map(|(_, target)| *target)
        .chain(std::iter::once(start_vus))
        .max()
        .unwrap_or(0);
    let scaled_peak = et.scale(peak);
    Ok(vec![ExecutionRequirement {
        time_offset: cfg.start_delay()?,
        planned_vus: scaled_peak,
        max_vus: scaled_peak,
    }])
}

pub struct RampingVus {
    name: String,
    start_vus: u64,
    /// Stage targets, already scaled to this instance's segment.
    stages: Vec<(Duration, u64)>,
    start_delay: Duration,
    exec: String,
    tags: HashMap<String, String>,
    tag_vu: bool,
    state: Arc<ExecutionState>,
}

impl RampingVus {
    pub fn new(
        name: &str,
        cfg: &ScenarioConfig,
        state: Arc<ExecutionState>,
    ) -> Result<Self, ExecError> {
        let et = state.execution_tuple().clone();
        let stages = parse_stages(cfg)?
            .into_iter()
            .map(|(duration, target)| (duration, et.scale(target)))
            .collect();
        let (tags, tag_vu) = scenario_tags(&state, name, cfg)?;
        Ok(Self {
            name: name.to_string(),
            start_vus: et.scale(cfg.start_vus.unwrap_or(0)),
            stages,
            start_delay: cfg.start_delay()?,
            exec: cfg.exec.clone().unwrap_or_else(|| "default".to_string()),
            tags,
            tag_vu,
            state,
        })
    }

    fn total_duration(&self) -> Duration {
        self.stages.iter().map(|(d, _)| *d).sum()
    }

    /// Linear interpolation between the previous stage's target and the
    /// current one, clamped to the last target after the schedule ends.
    fn target_at(&self, elapsed: Duration) -> u64 {
        let mut active_time = Duration::ZERO;
        let mut prev_target = self.start_vus;
        for (duration, target) in &self.stages {
            if elapsed < active_time + *duration {
                let progress =
                    (elapsed - active_time).as_secs_f64() / duration.as_secs_f64();
                let diff = *target as f64 - prev_target as f64;
                return (prev_target as f64 + diff * progress) as u64;
            }
            active_time += *duration;
            prev_target = *target;
        }
        prev_target
    }

    fn spawn_worker(
        &self,
        token: &CancelToken,
        samples_out: &Sender<Samples>,
        stop_at: Duration,
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
        let state = Arc::clone(&self.state);
        let token = token.clone();
        let samples = samples_out.clone();
        let flag = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Relaxed)
                && !token.is_cancelled()
                && state.get_current_test_run_duration().saturating_sub(base) < stop_at
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
        });
        Ok((handle, running))
    }
}

impl Executor for RampingVus {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, _token: &CancelToken) -> Result<(), ExecError> {
        Ok(())
    }

    fn execution_requirements(&self) -> Vec<ExecutionRequirement> {
        let peak = self
            .stages
            .iter()
            .map(|(_, t)| *t)
            .chain(std::iter::once(self.start_vus))
            .max()
            .unwrap_or(0);
        vec![ExecutionRequirement {
            time_offset: self.start_delay,
            planned_vus: peak,
            max_vus: peak,
        }]
    }

    fn start_delay(&self) -> Duration {
        self.start_delay
    }

    fn run(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        let total = self.total_duration();
        info!(scenario = %self.name, stages = self.stages.len(),
            total_s = total.as_secs_f64(), "starting ramping-VUs executor");

        let base = self.state.get_current_test_run_duration();
        let mut workers: Vec<(JoinHandle<Box<dyn InitializedVU>>, Arc<AtomicBool>)> = Vec::new();
        let mut retiring: Vec<JoinHandle<Box<dyn InitializedVU>>> = Vec::new();
        let mut first_err = None;

        loop {
            if token.is_cancelled() {
                break;
            }
            let elapsed = self.state.get_current_test_run_duration().saturating_sub(base);
            if elapsed >= total {
                break;
            }
            if !self.state.wait_if_paused(token) {
                break;
            }

            let target = self.target_at(elapsed) as usize;
            while workers.len() < target {
                match self.spawn_worker(token, samples_out, total, base) {
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
                    retiring.push(handle);
                }
            }

            // Reap finished retirees promptly so their VUs rejoin the pool
            // before the schedule needs them again.
            let mut i = 0;
            while i < retiring.len() {
                if retiring[i].is_finished() {
                    let handle = retiring.swap_remove(i);
                    match handle.join() {
                        Ok(vu) => self.state.return_vu(vu, true),
                        Err(_) => {
                            first_err.get_or_insert_with(|| {
                                ExecError::Script("a VU worker panicked".into())
                            });
                        }
                    }
                } else {
                    i += 1;
                }
            }

            token.sleep(TICK);
        }

        for (_, running) in &workers {
            running.store(false, Ordering::Relaxed);
        }
        for handle in retiring
            .into_iter()
            .chain(workers.into_iter().map(|(handle, _)| handle))
        {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{Options, Stage};
    use crate::exec::segment::ExecutionTuple;

    fn ramping(stages: &[(&str, u64)], start_vus: Option<u64>) -> RampingVus {
        let cfg = ScenarioConfig {
            executor: Some("ramping-vus".to_string()),
            start_vus,
            stages: Some(
                stages
                    .iter()
                    .map(|(d, t)| Stage {
                        duration: d.to_string(),
                        target: *t,
                    })
                    .collect(),
            ),
            ..ScenarioConfig::default()
        };
        let state = Arc::new(ExecutionState::new(
            Options::default(),
            ExecutionTuple::full(),
            0,
            0,
        ));
        RampingVus::new("ramp", &cfg, state).unwrap()
    }

    #[test]
    fn test_target_interpolates_linearly() {
        let ex = ramping(&[("10s", 10)], None);
        assert_eq!(ex.target_at(Duration::ZERO), 0);
        assert_eq!(ex.target_at(Duration::from_secs(5)), 5);
        assert_eq!(ex.target_at(Duration::from_secs(10)), 10);
    }

    #[test]
    fn test_target_ramps_down_from_start_vus() {
        let ex = ramping(&[("10s", 0)], Some(10));
        assert_eq!(ex.target_at(Duration::ZERO), 10);
        assert_eq!(ex.target_at(Duration::from_secs(5)), 5);
        assert_eq!(ex.target_at(Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_target_across_stages() {
        let ex = ramping(&[("10s", 10), ("5s", 10), ("10s", 0)], None);
        assert_eq!(ex.target_at(Duration::from_secs(12)), 10);
        assert_eq!(ex.target_at(Duration::from_secs(20)), 5);
        assert_eq!(ex.target_at(Duration::from_secs(60)), 0);
        assert_eq!(ex.total_duration(), Duration::from_secs(25));
    }

    #[test]
    fn test_requirements_cover_peak() {
        let cfg = ScenarioConfig {
            executor: Some("ramping-vus".to_string()),
            stages: Some(vec![
                Stage {
                    duration: "10s".to_string(),
                    target: 10,
                },
                Stage {
                    duration: "10s".to_string(),
                    target: 3,
                },
            ]),
            ..ScenarioConfig::default()
        };
        let reqs = requirements(&cfg, &ExecutionTuple::full()).unwrap();
        let peak = reqs.iter().map(|r| r.max_vus).max().unwrap();
        assert_eq!(peak, 10);
    }

    #[test]
    fn test_empty_stages_rejected() {
        let cfg = ScenarioConfig {
            executor: Some("ramping-vus".to_string()),
            stages: Some(Vec::new()),
            ..ScenarioConfig::default()
        };
        assert!(requirements(&cfg, &ExecutionTuple::full()).is_err());
    }
}
