//! Closure-backed `Runner` used by the core's own tests and available to
//! downstream integration tests, in the spirit of a minimal script runner
//! without the script engine.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Sender;

use super::cancel::CancelToken;
use super::eventloop::EventLoop;
use super::vu::{ActivationParams, ActiveVU, InitializedVU, Runner, Summary};
use super::ExecError;
use crate::cli::config::Options;
use crate::stats::Samples;

/// What a [`MiniRunner`] iteration closure gets to work with.
pub struct VuContext<'a> {
    pub id_local: u64,
    pub id_global: u64,
    pub params: &'a ActivationParams,
    pub samples: &'a Sender<Samples>,
    /// The VU's own loop; iteration closures may queue deferred work or take
    /// reservations, and `run_once` drains it before returning.
    pub event_loop: &'a Arc<EventLoop>,
}

type IterFn = Arc<dyn Fn(&VuContext<'_>) -> Result<(), ExecError> + Send + Sync>;
type HookFn = Arc<dyn Fn(&Sender<Samples>) -> Result<(), ExecError> + Send + Sync>;
type InitHookFn = Arc<dyn Fn(&VuContext<'_>) + Send + Sync>;

/// Configurable in-process runner: each hook is a closure, each VU gets its
/// own event loop.
#[derive(Clone, Default)]
pub struct MiniRunner {
    pub options: Options,
    pub vu_fn: Option<IterFn>,
    /// Runs once per VU at construction time, with the VU's event loop
    /// available. Stands in for a script runner's init-context work.
    pub init_fn: Option<InitHookFn>,
    pub setup_fn: Option<HookFn>,
    pub teardown_fn: Option<HookFn>,
}

impl MiniRunner {
    pub fn with_vu_fn(
        f: impl Fn(&VuContext<'_>) -> Result<(), ExecError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            vu_fn: Some(Arc::new(f)),
            ..Self::default()
        }
    }
}

impl Runner for MiniRunner {
    fn new_vu(
        &self,
        id_local: u64,
        id_global: u64,
        samples_out: Sender<Samples>,
    ) -> Result<Box<dyn InitializedVU>, ExecError> {
        let event_loop = Arc::new(EventLoop::new());
        if let Some(init_fn) = &self.init_fn {
            let params = ActivationParams::new(CancelToken::never(), "init");
            let ctx = VuContext {
                id_local,
                id_global,
                params: &params,
                samples: &samples_out,
                event_loop: &event_loop,
            };
            init_fn(&ctx);
            event_loop.start(&params.run_token);
        }
        Ok(Box::new(MiniVU {
            id_local,
            id_global,
            samples: samples_out,
            event_loop,
            vu_fn: self.vu_fn.clone(),
        }))
    }

    fn setup(&self, _token: &CancelToken, samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        match &self.setup_fn {
            Some(f) => f(samples_out),
            None => Ok(()),
        }
    }

    fn teardown(
        &self,
        _token: &CancelToken,
        samples_out: &Sender<Samples>,
    ) -> Result<(), ExecError> {
        match &self.teardown_fn {
            Some(f) => f(samples_out),
            None => Ok(()),
        }
    }

    fn handle_summary(
        &self,
        _token: &CancelToken,
        _summary: &Summary,
    ) -> Result<HashMap<String, String>, ExecError> {
        Ok(HashMap::new())
    }

    fn options(&self) -> Options {
        self.options.clone()
    }
}

pub struct MiniVU {
    id_local: u64,
    id_global: u64,
    samples: Sender<Samples>,
    event_loop: Arc<EventLoop>,
    vu_fn: Option<IterFn>,
}

impl InitializedVU for MiniVU {
    fn activate(self: Box<Self>, params: ActivationParams) -> Box<dyn ActiveVU> {
        Box::new(ActiveMiniVU { vu: *self, params })
    }

    fn id_local(&self) -> u64 {
        self.id_local
    }

    fn id_global(&self) -> u64 {
        self.id_global
    }
}

pub struct ActiveMiniVU {
    vu: MiniVU,
    params: ActivationParams,
}

impl ActiveVU for ActiveMiniVU {
    fn run_once(&mut self) -> Result<(), ExecError> {
        if self.params.run_token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let result = match &self.vu.vu_fn {
            Some(f) => {
                let ctx = VuContext {
                    id_local: self.vu.id_local,
                    id_global: self.vu.id_global,
                    params: &self.params,
                    samples: &self.vu.samples,
                    event_loop: &self.vu.event_loop,
                };
                f(&ctx)
            }
            None => Ok(()),
        };
        // Iteration boundary: deferred work must not leak into the next
        // iteration or survive the handback to the pool.
        self.vu.event_loop.start(&self.params.run_token);
        if self.params.run_token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        result
    }

    fn deactivate(self: Box<Self>) -> Box<dyn InitializedVU> {
        Box::new(self.vu)
    }
}
