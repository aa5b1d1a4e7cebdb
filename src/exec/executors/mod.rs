//! Executor implementations: the policies deciding when VUs run iterations
//! and how many are active at each instant.

pub mod constant_arrival_rate;
pub mod constant_vus;
pub mod externally_controlled;
pub mod ramping_vus;

pub use constant_arrival_rate::ConstantArrivalRate;
pub use constant_vus::ConstantVus;
pub use externally_controlled::{ControlHandle, ExternallyControlled};
pub use ramping_vus::RampingVus;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::warn;

use super::segment::ExecutionTuple;
use super::state::ExecutionState;
use super::{ExecError, ExecutionRequirement, Executor};
use crate::cli::config::{ScenarioConfig, SystemTagSet};
use crate::stats::{MetricKind, Sample, Samples, ITERATIONS, ITERATION_DURATION};

/// Sizing pass, run before the [`ExecutionState`] exists.
pub fn requirements(
    cfg: &ScenarioConfig,
    et: &ExecutionTuple,
) -> Result<Vec<ExecutionRequirement>, ExecError> {
    match cfg.executor_kind() {
        "constant-vus" => constant_vus::requirements(cfg, et),
        "ramping-vus" => ramping_vus::requirements(cfg, et),
        "constant-arrival-rate" => constant_arrival_rate::requirements(cfg, et),
        "externally-controlled" => externally_controlled::requirements(cfg, et),
        other => Err(ExecError::Config(format!("unknown executor {other:?}"))),
    }
}

/// Builds the executor for one validated scenario.
pub fn build(
    name: &str,
    cfg: &ScenarioConfig,
    state: Arc<ExecutionState>,
) -> Result<Arc<dyn Executor>, ExecError> {
    Ok(match cfg.executor_kind() {
        "constant-vus" => Arc::new(ConstantVus::new(name, cfg, state)?),
        "ramping-vus" => Arc::new(RampingVus::new(name, cfg, state)?),
        "constant-arrival-rate" => Arc::new(ConstantArrivalRate::new(name, cfg, state)?),
        "externally-controlled" => Arc::new(ExternallyControlled::new(name, cfg, state)?),
        other => return Err(ExecError::Config(format!("unknown executor {other:?}"))),
    })
}

/// Merged run/scenario tags plus whether per-VU tagging is on. Computed once
/// per executor at construction.
pub(crate) fn scenario_tags(
    state: &ExecutionState,
    scenario: &str,
    cfg: &ScenarioConfig,
) -> Result<(HashMap<String, String>, bool), ExecError> {
    let system = state.options.system_tag_set()?;
    let mut tags = state.options.tags.clone().unwrap_or_default();
    if let Some(extra) = &cfg.tags {
        tags.extend(extra.clone());
    }
    if system.contains(SystemTagSet::SCENARIO) {
        tags.insert("scenario".to_string(), scenario.to_string());
    }
    Ok((tags, system.contains(SystemTagSet::VU)))
}

/// Tallies one finished iteration against the shared counters and emits its
/// samples. Script failures count as interrupted but do not stop the VU; the
/// caller decides what to do about cancellation.
pub(crate) fn record_iteration(
    state: &ExecutionState,
    samples_out: &Sender<Samples>,
    tags: &HashMap<String, String>,
    started: Instant,
    result: &Result<(), ExecError>,
) {
    match result {
        Ok(()) => {
            state.add_full_iterations(1);
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            // A hung-up consumer is only possible during graceful shutdown.
            let _ = samples_out.send(Samples(vec![
                Sample::new(ITERATIONS, MetricKind::Counter, 1.0).with_tags(tags.clone()),
                Sample::new(ITERATION_DURATION, MetricKind::Trend, elapsed_ms)
                    .with_tags(tags.clone()),
            ]));
        }
        Err(ExecError::Cancelled) => {
            state.add_interrupted_iterations(1);
        }
        Err(err) => {
            state.add_interrupted_iterations(1);
            warn!(error = %err, "iteration failed");
        }
    }
}
