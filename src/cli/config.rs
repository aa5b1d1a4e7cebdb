use std::collections::HashMap;
use std::time::Duration;

use bitflags::bitflags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::exec::segment::{ExecutionSegment, ExecutionSegmentSequence, ExecutionTuple};
use crate::exec::ExecError;

/// Parses human durations: "500ms", "30s", "5m", "1h", or bare milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration, ExecError> {
    let parse = |v: &str| {
        v.parse::<u64>()
            .map_err(|_| ExecError::Config(format!("invalid duration {s:?}")))
    };
    if let Some(v) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(v)?))
    } else if let Some(v) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(v)? * 3600))
    } else if let Some(v) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(v)? * 60))
    } else if let Some(v) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(v)?))
    } else {
        Ok(Duration::from_millis(parse(s)?))
    }
}

bitflags! {
    /// Which tags the core attaches to every sample it emits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SystemTagSet: u32 {
        const SCENARIO = 1 << 0;
        const VU       = 1 << 1;
        const ITER     = 1 << 2;
        const GROUP    = 1 << 3;
        const STATUS   = 1 << 4;
        const NAME     = 1 << 5;
        const ERROR    = 1 << 6;
        const CHECK    = 1 << 7;
    }
}

impl SystemTagSet {
    pub fn default_set() -> Self {
        Self::SCENARIO | Self::GROUP | Self::STATUS | Self::NAME
    }

    pub fn from_names(names: &[String]) -> Result<Self, ExecError> {
        let mut set = Self::empty();
        for name in names {
            set |= match name.as_str() {
                "scenario" => Self::SCENARIO,
                "vu" => Self::VU,
                "iter" => Self::ITER,
                "group" => Self::GROUP,
                "status" => Self::STATUS,
                "name" => Self::NAME,
                "error" => Self::ERROR,
                "check" => Self::CHECK,
                other => {
                    return Err(ExecError::Config(format!("unknown system tag {other:?}")))
                }
            };
        }
        Ok(set)
    }
}

/// One step of a ramping schedule: ramp linearly to `target` over `duration`.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct Stage {
    pub duration: String,
    pub target: u64,
}

/// Configuration for a single scenario. Which fields are required depends on
/// the executor; validation happens when the scheduler builds the executor.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct ScenarioConfig {
    /// Executor type: constant-vus, ramping-vus, constant-arrival-rate,
    /// externally-controlled.
    pub executor: Option<String>,
    /// Number of looping VUs (constant-vus), or the starting VU count for
    /// externally-controlled.
    pub vus: Option<u64>,
    /// Scenario duration, e.g. "30s".
    pub duration: Option<String>,
    /// Ramping schedule.
    pub stages: Option<Vec<Stage>>,
    /// VU count a ramping schedule starts from.
    #[serde(alias = "startVUs")]
    pub start_vus: Option<u64>,
    /// Iterations started per `time_unit` for arrival-rate executors.
    pub rate: Option<u64>,
    #[serde(alias = "timeUnit")]
    pub time_unit: Option<String>,
    /// VUs pre-initialized for an arrival-rate scenario.
    #[serde(alias = "preAllocatedVUs")]
    pub pre_allocated_vus: Option<u64>,
    /// Hard VU ceiling, including lazily initialized ones.
    #[serde(alias = "maxVUs")]
    pub max_vus: Option<u64>,
    /// Exported script function to run (default: "default").
    pub exec: Option<String>,
    /// Delay before the scenario starts, e.g. "30s".
    #[serde(alias = "startTime")]
    pub start_time: Option<String>,
    /// Extra environment entries exposed to this scenario's iterations.
    pub env: Option<HashMap<String, String>>,
    /// Extra tags attached to this scenario's samples.
    pub tags: Option<HashMap<String, String>>,
}

impl ScenarioConfig {
    pub fn executor_kind(&self) -> &str {
        self.executor.as_deref().unwrap_or("constant-vus")
    }

    pub fn start_delay(&self) -> Result<Duration, ExecError> {
        match &self.start_time {
            Some(s) => parse_duration(s),
            None => Ok(Duration::ZERO),
        }
    }
}

/// Run configuration, the subset the execution core consumes. Merging
/// precedence is defaults, then the script's exported options, then CLI
/// flags; [`Options::apply`] implements one merge step.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Options {
    /// Number of concurrent VUs for the implicit default scenario.
    pub vus: Option<u64>,
    /// Duration of the implicit default scenario.
    pub duration: Option<String>,
    /// Start the run paused; it begins only after an explicit resume.
    pub paused: Option<bool>,
    #[serde(alias = "setupTimeout")]
    pub setup_timeout: Option<String>,
    #[serde(alias = "teardownTimeout")]
    pub teardown_timeout: Option<String>,
    #[serde(alias = "noSetup")]
    pub no_setup: Option<bool>,
    #[serde(alias = "noTeardown")]
    pub no_teardown: Option<bool>,
    /// System tags to attach to emitted samples; names from
    /// [`SystemTagSet::from_names`].
    #[serde(alias = "systemTags")]
    pub system_tags: Option<Vec<String>>,
    /// Tags attached to every sample of the run.
    pub tags: Option<HashMap<String, String>>,
    /// This instance's slice of the global plan, e.g. "1/4:1/2".
    #[serde(alias = "executionSegment")]
    pub execution_segment: Option<String>,
    /// Boundaries of all slices, e.g. "0,1/4,1/2,1".
    #[serde(alias = "executionSegmentSequence")]
    pub execution_segment_sequence: Option<String>,
    /// Named scenarios; when present, `vus`/`duration` are ignored.
    pub scenarios: Option<HashMap<String, ScenarioConfig>>,
    /// Opaque per-collaborator configuration, e.g. `ext.cloud`.
    pub ext: Option<HashMap<String, serde_json::Value>>,
}

impl Options {
    /// Field-wise merge: values set in `other` win over `self`.
    pub fn apply(mut self, other: Options) -> Options {
        if other.vus.is_some() {
            self.vus = other.vus;
        }
        if other.duration.is_some() {
            self.duration = other.duration;
        }
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        if other.setup_timeout.is_some() {
            self.setup_timeout = other.setup_timeout;
        }
        if other.teardown_timeout.is_some() {
            self.teardown_timeout = other.teardown_timeout;
        }
        if other.no_setup.is_some() {
            self.no_setup = other.no_setup;
        }
        if other.no_teardown.is_some() {
            self.no_teardown = other.no_teardown;
        }
        if other.system_tags.is_some() {
            self.system_tags = other.system_tags;
        }
        if other.tags.is_some() {
            self.tags = other.tags;
        }
        if other.execution_segment.is_some() {
            self.execution_segment = other.execution_segment;
        }
        if other.execution_segment_sequence.is_some() {
            self.execution_segment_sequence = other.execution_segment_sequence;
        }
        if other.scenarios.is_some() {
            self.scenarios = other.scenarios;
        }
        if other.ext.is_some() {
            self.ext = other.ext;
        }
        self
    }

    pub fn setup_timeout_duration(&self) -> Result<Duration, ExecError> {
        match &self.setup_timeout {
            Some(s) => parse_duration(s),
            None => Ok(Duration::from_secs(60)),
        }
    }

    pub fn teardown_timeout_duration(&self) -> Result<Duration, ExecError> {
        match &self.teardown_timeout {
            Some(s) => parse_duration(s),
            None => Ok(Duration::from_secs(60)),
        }
    }

    pub fn system_tag_set(&self) -> Result<SystemTagSet, ExecError> {
        match &self.system_tags {
            Some(names) => SystemTagSet::from_names(names),
            None => Ok(SystemTagSet::default_set()),
        }
    }

    pub fn execution_tuple(&self) -> Result<ExecutionTuple, ExecError> {
        let segment = match &self.execution_segment {
            Some(s) => ExecutionSegment::parse(s)?,
            None => return Ok(ExecutionTuple::full()),
        };
        let sequence = self
            .execution_segment_sequence
            .as_deref()
            .map(ExecutionSegmentSequence::parse)
            .transpose()?;
        ExecutionTuple::new(segment, sequence)
    }

    /// The scenarios the scheduler will actually run, sorted by name. An
    /// empty scenario map with top-level `vus`/`duration` set synthesizes the
    /// implicit constant-vus scenario.
    pub fn effective_scenarios(&self) -> Vec<(String, ScenarioConfig)> {
        if let Some(scenarios) = &self.scenarios {
            let mut entries: Vec<_> = scenarios
                .iter()
                .map(|(name, cfg)| (name.clone(), cfg.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            return entries;
        }
        if self.vus.is_none() && self.duration.is_none() {
            return Vec::new();
        }
        vec![(
            "default".to_string(),
            ScenarioConfig {
                executor: Some("constant-vus".to_string()),
                vus: self.vus.or(Some(1)),
                duration: self.duration.clone().or_else(|| Some("10s".to_string())),
                ..ScenarioConfig::default()
            },
        )]
    }
}
