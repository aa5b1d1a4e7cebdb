//! Open-model executor: starts iterations at a fixed rate regardless of how
//! long each one takes, lazily growing the VU set up to a hard ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use super::{record_iteration, scenario_tags};
use crate::cli::config::{parse_duration, ScenarioConfig};
use crate::exec::cancel::CancelToken;
use crate::exec::segment::ExecutionTuple;
use crate::exec::state::ExecutionState;
use crate::exec::vu::{ActivationParams, ActiveVU};
use crate::exec::{ExecError, ExecutionRequirement, Executor};
use crate::stats::{MetricKind, Sample, Samples, DROPPED_ITERATIONS};

/// How long to wait for in-flight iterations to hand their VUs back once the
/// schedule is done.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct Config {
    rate: u64,
    time_unit: Duration,
    duration: Duration,
    pre_allocated_vus: u64,
    max_vus: u64,
}

fn parse_config(cfg: &ScenarioConfig) -> Result<Config, ExecError> {
    let rate = cfg.rate.filter(|r| *r > 0).ok_or_else(|| {
        ExecError::Config("constant-arrival-rate requires a positive rate".into())
    })?;
    let time_unit = match &cfg.time_unit {
        Some(s) => parse_duration(s)?,
        None => Duration::from_secs(1),
    };
    if time_unit.is_zero() {
        return Err(ExecError::Config("time_unit must be non-zero".into()));
    }
    let duration = cfg
        .duration
        .as_deref()
        .ok_or_else(|| ExecError::Config("constant-arrival-rate requires a duration".into()))
        .and_then(parse_duration)?;
    let pre_allocated_vus = cfg.pre_allocated_vus.unwrap_or(1).max(1);
    let max_vus = cfg.max_vus.unwrap_or(pre_allocated_vus);
    if max_vus < pre_allocated_vus {
        return Err(ExecError::Config(
            "maxVUs must not be lower than preAllocatedVUs".into(),
        ));
    }
    Ok(Config {
        rate,
        time_unit,
        duration,
        pre_allocated_vus,
        max_vus,
    })
}

pub(super) fn requirements(
    cfg: &ScenarioConfig,
    et: &ExecutionTuple,
) -> Result<Vec<ExecutionRequirement>, ExecError> {
    let parsed = parse_config(cfg)?;
    Ok(vec![ExecutionRequirement {
        time_offset: cfg.start_delay()?,
        planned_vus: et.scale(parsed.pre_allocated_vus),
        max_vus: et.scale(parsed.max_vus),
    }])
}

/// An activated VU waiting for its next iteration, carrying the tags it was
/// activated with.
struct PooledVu {
    vu: Box<dyn ActiveVU>,
    tags: HashMap<String, String>,
}

pub struct ConstantArrivalRate {
    name: String,
    rate: u64,
    time_unit: Duration,
    duration: Duration,
    pre_allocated_vus: u64,
    max_vus: u64,
    start_delay: Duration,
    exec: String,
    tags: HashMap<String, String>,
    tag_vu: bool,
    state: Arc<ExecutionState>,
}

impl ConstantArrivalRate {
    pub fn new(
        name: &str,
        cfg: &ScenarioConfig,
        state: Arc<ExecutionState>,
    ) -> Result<Self, ExecError> {
        let parsed = parse_config(cfg)?;
        let et = state.execution_tuple().clone();
        let (tags, tag_vu) = scenario_tags(&state, name, cfg)?;
        Ok(Self {
            name: name.to_string(),
            // The rate is shared across instances the same way VUs are.
            rate: et.scale(parsed.rate).max(1),
            time_unit: parsed.time_unit,
            duration: parsed.duration,
            pre_allocated_vus: et.scale(parsed.pre_allocated_vus),
            max_vus: et.scale(parsed.max_vus),
            start_delay: cfg.start_delay()?,
            exec: cfg.exec.clone().unwrap_or_else(|| "default".to_string()),
            tags,
            tag_vu,
            state,
        })
    }

    /// Gap between two started iterations.
    fn interval(&self) -> Duration {
        Duration::from_nanos((self.time_unit.as_nanos() / self.rate as u128).max(1) as u64)
    }

    fn activation_params(&self, token: &CancelToken, id_local: u64) -> (ActivationParams, HashMap<String, String>) {
        let mut tags = self.tags.clone();
        if self.tag_vu {
            tags.insert("vu".to_string(), id_local.to_string());
        }
        let params = ActivationParams::new(token.clone(), &self.name)
            .with_exec(self.exec.clone())
            .with_tags(tags.clone());
        (params, tags)
    }
}

impl Executor for ConstantArrivalRate {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, _token: &CancelToken) -> Result<(), ExecError> {
        Ok(())
    }

    fn execution_requirements(&self) -> Vec<ExecutionRequirement> {
        vec![ExecutionRequirement {
            time_offset: self.start_delay,
            planned_vus: self.pre_allocated_vus,
            max_vus: self.max_vus,
        }]
    }

    fn start_delay(&self) -> Duration {
        self.start_delay
    }

    fn run(&self, token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        let interval = self.interval();
        info!(scenario = %self.name, rate = self.rate,
            interval_ms = interval.as_millis() as u64,
            pre_allocated = self.pre_allocated_vus, max = self.max_vus,
            "starting constant-arrival-rate executor");

        let (idle_tx, idle_rx) = bounded::<PooledVu>(self.max_vus.max(1) as usize);
        let mut owned: u64 = 0;

        for _ in 0..self.pre_allocated_vus {
            let vu = self.state.get_planned_vu(true)?;
            let (params, tags) = self.activation_params(token, vu.id_local());
            let pooled = PooledVu {
                vu: vu.activate(params),
                tags,
            };
            // The receiver lives in this scope, so the send cannot fail.
            let _ = idle_tx.send(pooled);
            owned += 1;
        }

        let base = self.state.get_current_test_run_duration();
        let mut launched: u64 = 0;
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

            // The pause-aware clock drives the schedule, so the rate
            // stretches across pauses instead of bursting after them.
            let scheduled = (elapsed.as_nanos() / interval.as_nanos()) as u64 + 1;
            while launched < scheduled {
                launched += 1;
                let pooled = match idle_rx.try_recv() {
                    Ok(pooled) => Some(pooled),
                    Err(_) if owned < self.max_vus => {
                        match self.state.get_unplanned_vu(token) {
                            Ok(vu) => {
                                self.state.mod_active_vus_count(1);
                                owned += 1;
                                let (params, tags) =
                                    self.activation_params(token, vu.id_local());
                                Some(PooledVu {
                                    vu: vu.activate(params),
                                    tags,
                                })
                            }
                            Err(err) => {
                                warn!(error = %err, "could not grow the arrival-rate VU set");
                                None
                            }
                        }
                    }
                    Err(_) => None,
                };

                match pooled {
                    Some(mut pooled) => {
                        let state = Arc::clone(&self.state);
                        let samples = samples_out.clone();
                        let idle_tx = idle_tx.clone();
                        std::thread::spawn(move || {
                            let started = Instant::now();
                            let result = pooled.vu.run_once();
                            record_iteration(&state, &samples, &pooled.tags, started, &result);
                            // Capacity equals the VU ceiling, so this cannot
                            // block.
                            let _ = idle_tx.send(pooled);
                        });
                    }
                    None => {
                        let _ = samples_out.send(
                            Sample::new(DROPPED_ITERATIONS, MetricKind::Counter, 1.0)
                                .with_tags(self.tags.clone())
                                .into(),
                        );
                    }
                }
            }

            token.sleep(interval.min(Duration::from_millis(50)));
        }

        // Wait for in-flight iterations to hand their VUs back, then return
        // everything to the shared pool.
        let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
        for _ in 0..owned {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            match idle_rx.recv_timeout(remaining) {
                Ok(pooled) => self.state.return_vu(pooled.vu.deactivate(), true),
                Err(_) => {
                    return Err(ExecError::Script(
                        "arrival-rate VUs did not finish within the drain window".into(),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::Options;

    fn arrival_cfg() -> ScenarioConfig {
        ScenarioConfig {
            executor: Some("constant-arrival-rate".to_string()),
            rate: Some(10),
            time_unit: Some("1s".to_string()),
            duration: Some("5s".to_string()),
            pre_allocated_vus: Some(2),
            max_vus: Some(5),
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn test_interval() {
        let state = Arc::new(ExecutionState::new(
            Options::default(),
            ExecutionTuple::full(),
            2,
            5,
        ));
        let ex = ConstantArrivalRate::new("open", &arrival_cfg(), state).unwrap();
        assert_eq!(ex.interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_requirements_expose_unplanned_headroom() {
        let reqs = requirements(&arrival_cfg(), &ExecutionTuple::full()).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].planned_vus, 2);
        assert_eq!(reqs[0].max_vus, 5);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut cfg = arrival_cfg();
        cfg.rate = Some(0);
        assert!(requirements(&cfg, &ExecutionTuple::full()).is_err());

        let mut cfg = arrival_cfg();
        cfg.max_vus = Some(1);
        assert!(requirements(&cfg, &ExecutionTuple::full()).is_err());

        let mut cfg = arrival_cfg();
        cfg.duration = None;
        assert!(requirements(&cfg, &ExecutionTuple::full()).is_err());
    }
}
