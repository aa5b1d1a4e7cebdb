//! Script-engine backed [`Runner`]: the user script is compiled and evaluated
//! once per VU in an isolated QuickJS context, and the exported `default`
//! function runs once per iteration. Setup, teardown and summary handling get
//! transient contexts that are torn down immediately after use.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use rquickjs::loader::{FileResolver, ScriptLoader};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Module, Object, Runtime, Value};
use tracing::debug;

use crate::cli::config::Options;
use crate::exec::cancel::CancelToken;
use crate::exec::eventloop::EventLoop;
use crate::exec::tags::TagMap;
use crate::exec::vu::{ActivationParams, ActiveVU, InitializedVU, Runner, Summary};
use crate::exec::ExecError;
use crate::stats::{MetricKind, Sample, Samples};

/// Per-VU JS heap cap; scripts that need more are doing something a load
/// generator should not.
const VU_MEMORY_LIMIT: usize = 8 * 1024 * 1024;

fn js_err(err: rquickjs::Error) -> ExecError {
    ExecError::Script(err.to_string())
}

fn json_stringify<'js>(ctx: Ctx<'js>, value: Value<'js>) -> Result<String, rquickjs::Error> {
    let json_obj: Object = ctx.globals().get("JSON")?;
    let stringify: Function = json_obj.get("stringify")?;
    let json_str: String = stringify.call((value,))?;
    Ok(json_str)
}

fn json_parse<'js>(ctx: Ctx<'js>, json: &str) -> Result<Value<'js>, rquickjs::Error> {
    let json_obj: Object = ctx.globals().get("JSON")?;
    let parse: Function = json_obj.get("parse")?;
    parse.call((json,))
}

/// Runs user scripts. The source is read once and shared read-only across
/// VUs; every VU instantiates its own interpreter from it.
pub struct ScriptRunner {
    path: PathBuf,
    source: Arc<str>,
    options: Options,
    /// Exported functions every VU captures at init: the lifecycle hooks plus
    /// each scenario's `exec` target.
    wanted_exports: Vec<String>,
    setup_data: Arc<RwLock<Option<String>>>,
}

impl ScriptRunner {
    /// Evaluates the script once in a throwaway context to pull out the
    /// exported `options`, then keeps only the source around.
    pub fn new(path: impl Into<PathBuf>, source: String) -> Result<Self, ExecError> {
        let path = path.into();
        let (runtime, context) = Self::create_runtime()?;
        let module_name = path.to_string_lossy().to_string();
        let src = source.clone();
        let options = context.with(|ctx| -> Result<Options, ExecError> {
            register_base_globals(&ctx, 0, 0).map_err(js_err)?;
            let module = Module::declare(ctx.clone(), module_name, src)
                .map_err(js_err)?;
            let (module, _) = module
                .eval()
                .catch(&ctx)
                .map_err(|err| ExecError::Config(format!("script failed to evaluate: {err}")))?;
            if let Ok(exported) = module.get::<_, Value>("options") {
                if exported.is_object() {
                    let json = json_stringify(ctx.clone(), exported).map_err(js_err)?;
                    let options: Options = serde_json::from_str(&json).map_err(|err| {
                        ExecError::Config(format!("invalid exported options: {err}"))
                    })?;
                    return Ok(options);
                }
            }
            Ok(Options::default())
        })?;
        runtime.run_gc();
        drop(context);
        drop(runtime);

        let mut wanted: HashSet<String> = ["default", "setup", "teardown", "handleSummary"]
            .into_iter()
            .map(str::to_string)
            .collect();
        for (_, scenario) in options.effective_scenarios() {
            wanted.insert(
                scenario.exec.clone().unwrap_or_else(|| "default".to_string()),
            );
        }

        Ok(Self {
            path,
            source: source.into(),
            options,
            wanted_exports: wanted.into_iter().collect(),
            setup_data: Arc::new(RwLock::new(None)),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ExecError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| ExecError::Config(format!("could not read {}: {err}", path.display())))?;
        Self::new(path, source)
    }

    fn create_runtime() -> Result<(Runtime, Context), ExecError> {
        let runtime = Runtime::new().map_err(js_err)?;
        let resolver = FileResolver::default().with_path("./");
        let loader = ScriptLoader::default();
        runtime.set_loader(resolver, loader);
        runtime.set_memory_limit(VU_MEMORY_LIMIT);
        let context = Context::full(&runtime).map_err(js_err)?;
        Ok((runtime, context))
    }

    /// Transient context for setup/teardown/summary: evaluate the module, run
    /// `body` against it, tear everything down.
    fn with_transient_context<T>(
        &self,
        body: impl for<'js> FnOnce(&Ctx<'js>, &Module<'js, rquickjs::module::Evaluated>) -> Result<T, ExecError>,
    ) -> Result<T, ExecError> {
        let (runtime, context) = Self::create_runtime()?;
        let module_name = self.path.to_string_lossy().to_string();
        let source = self.source.to_string();
        let result = context.with(|ctx| -> Result<T, ExecError> {
            register_base_globals(&ctx, 0, 0).map_err(js_err)?;
            let module = Module::declare(ctx.clone(), module_name, source).map_err(js_err)?;
            let (module, _) = module
                .eval()
                .catch(&ctx)
                .map_err(|err| ExecError::Script(err.to_string()))?;
            body(&ctx, &module)
        });
        runtime.run_gc();
        drop(context);
        drop(runtime);
        result
    }
}

impl Runner for ScriptRunner {
    fn new_vu(
        &self,
        id_local: u64,
        id_global: u64,
        samples_out: Sender<Samples>,
    ) -> Result<Box<dyn InitializedVU>, ExecError> {
        debug!(id_local, id_global, "constructing script VU");
        let (runtime, context) = Self::create_runtime()?;
        let event_loop = Arc::new(EventLoop::new());
        let tags = Arc::new(TagMap::new());

        let module_name = self.path.to_string_lossy().to_string();
        let source = self.source.to_string();
        let wanted = self.wanted_exports.clone();
        context.with(|ctx| -> Result<(), ExecError> {
            register_base_globals(&ctx, id_local, id_global).map_err(js_err)?;
            register_vu_globals(
                &ctx,
                samples_out.clone(),
                Arc::clone(&event_loop),
                Arc::clone(&tags),
            )
            .map_err(js_err)?;

            let module = Module::declare(ctx.clone(), module_name, source).map_err(js_err)?;
            let (module, _) = module
                .eval()
                .catch(&ctx)
                .map_err(|err| ExecError::VuConstruction(format!("script init failed: {err}")))?;

            // Module exports are not reachable from later entries into the
            // context, so the functions iterations need are pinned to a
            // global while the module is still in scope.
            let exports = Object::new(ctx.clone()).map_err(js_err)?;
            for name in &wanted {
                if let Ok(func) = module.get::<_, Function>(name.as_str()) {
                    exports.set(name.as_str(), func).map_err(js_err)?;
                }
            }
            ctx.globals().set("__EXPORTS", exports).map_err(js_err)?;
            Ok(())
        })?;
        // Deferred init-context work (reservations, queued tasks) finishes
        // before the VU is considered initialized.
        event_loop.start(&CancelToken::never());

        Ok(Box::new(ScriptVU {
            id_local,
            id_global,
            runtime,
            context,
            event_loop,
            tags,
            setup_data: Arc::clone(&self.setup_data),
        }))
    }

    fn setup(&self, token: &CancelToken, _samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        if token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let data = self.with_transient_context(|ctx, module| {
            let setup_fn = match module.get::<_, Function>("setup") {
                Ok(func) => func,
                Err(_) => return Ok(None),
            };
            let result: Value = setup_fn
                .call(())
                .catch(ctx)
                .map_err(|err| ExecError::Script(format!("setup: {err}")))?;
            if result.is_undefined() {
                Ok(None)
            } else {
                Ok(Some(json_stringify(ctx.clone(), result).map_err(js_err)?))
            }
        })?;
        *self.setup_data.write() = data;
        Ok(())
    }

    fn teardown(&self, token: &CancelToken, _samples_out: &Sender<Samples>) -> Result<(), ExecError> {
        if token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let setup_data = self.setup_data.read().clone();
        self.with_transient_context(|ctx, module| {
            let teardown_fn = match module.get::<_, Function>("teardown") {
                Ok(func) => func,
                Err(_) => return Ok(()),
            };
            let data = match &setup_data {
                Some(json) => json_parse(ctx.clone(), json)
                    .unwrap_or_else(|_| Value::new_undefined(ctx.clone())),
                None => Value::new_undefined(ctx.clone()),
            };
            teardown_fn
                .call::<_, ()>((data,))
                .catch(ctx)
                .map_err(|err| ExecError::Script(format!("teardown: {err}")))
        })
    }

    fn handle_summary(
        &self,
        token: &CancelToken,
        summary: &Summary,
    ) -> Result<HashMap<String, String>, ExecError> {
        if token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let payload = serde_json::json!({
            "testRunDurationMs": summary.test_run_duration.as_millis() as u64,
            "fullIterations": summary.full_iterations,
            "interruptedIterations": summary.interrupted_iterations,
            "metrics": summary.report,
        })
        .to_string();

        self.with_transient_context(|ctx, module| {
            let handler = match module.get::<_, Function>("handleSummary") {
                Ok(func) => func,
                Err(_) => return Ok(HashMap::new()),
            };
            let data = json_parse(ctx.clone(), &payload).map_err(js_err)?;
            let result: Value = handler
                .call((data,))
                .catch(ctx)
                .map_err(|err| ExecError::Script(format!("handleSummary: {err}")))?;
            if !result.is_object() {
                return Ok(HashMap::new());
            }
            let json = json_stringify(ctx.clone(), result).map_err(js_err)?;
            let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&json)
                .map_err(|err| ExecError::Script(format!("handleSummary result: {err}")))?;
            Ok(raw
                .into_iter()
                .map(|(file, content)| {
                    let content = match content {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (file, content)
                })
                .collect())
        })
    }

    fn options(&self) -> Options {
        self.options.clone()
    }
}

/// Globals available in every context, including the throwaway ones.
fn register_base_globals(ctx: &Ctx, id_local: u64, id_global: u64) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set(
        "print",
        Function::new(ctx.clone(), move |msg: String| {
            println!("{msg}");
        }),
    )?;
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), move |msg: String| {
            println!("{msg}");
        }),
    )?;
    globals.set("console", console)?;
    globals.set(
        "sleep",
        Function::new(ctx.clone(), move |secs: f64| {
            std::thread::sleep(Duration::from_secs_f64(secs.max(0.0)));
        }),
    )?;
    globals.set("__VU", id_local as f64)?;
    globals.set("__VU_GLOBAL", id_global as f64)?;
    globals.set("__ITER", 0.0f64)?;

    let env_obj = Object::new(ctx.clone())?;
    for (key, value) in std::env::vars() {
        env_obj.set(key, value)?;
    }
    globals.set("__ENV", env_obj)?;
    Ok(())
}

/// Extras only live VUs get: run-time tags and deferred metric emission.
fn register_vu_globals(
    ctx: &Ctx,
    samples_out: Sender<Samples>,
    event_loop: Arc<EventLoop>,
    tags: Arc<TagMap>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let t = Arc::clone(&tags);
    globals.set(
        "tagsSet",
        Function::new(ctx.clone(), move |key: String, value: String| {
            t.set(key, value);
        }),
    )?;
    let t = Arc::clone(&tags);
    globals.set(
        "tagsGet",
        Function::new(ctx.clone(), move |key: String| -> Option<String> {
            t.get(&key)
        }),
    )?;
    let t = Arc::clone(&tags);
    globals.set(
        "tagsDelete",
        Function::new(ctx.clone(), move |key: String| {
            t.delete(&key);
        }),
    )?;

    // Metric emission is deferred through the VU's event loop, so a sync
    // script burst cannot block on the sample channel mid-iteration.
    globals.set(
        "metric",
        Function::new(ctx.clone(), move |name: String, value: f64| {
            let tx = samples_out.clone();
            let tag_snapshot = tags.clone_map();
            event_loop.run_on_loop(move || {
                let _ = tx.send(
                    Sample::new(name, MetricKind::Trend, value)
                        .with_tags(tag_snapshot)
                        .into(),
                );
            });
        }),
    )?;
    Ok(())
}

/// One pooled script VU: its own interpreter, event loop and tag map.
pub struct ScriptVU {
    id_local: u64,
    id_global: u64,
    // Declaration order doubles as drop order: context before runtime.
    context: Context,
    runtime: Runtime,
    event_loop: Arc<EventLoop>,
    tags: Arc<TagMap>,
    setup_data: Arc<RwLock<Option<String>>>,
}

impl InitializedVU for ScriptVU {
    fn activate(self: Box<Self>, params: ActivationParams) -> Box<dyn ActiveVU> {
        for (key, value) in &params.tags {
            self.tags.set(key.clone(), value.clone());
        }
        Box::new(ActiveScriptVU {
            vu: *self,
            params,
            iteration: 0,
        })
    }

    fn id_local(&self) -> u64 {
        self.id_local
    }

    fn id_global(&self) -> u64 {
        self.id_global
    }
}

impl Drop for ScriptVU {
    fn drop(&mut self) {
        self.runtime.run_gc();
    }
}

pub struct ActiveScriptVU {
    vu: ScriptVU,
    params: ActivationParams,
    iteration: u64,
}

impl ActiveVU for ActiveScriptVU {
    fn run_once(&mut self) -> Result<(), ExecError> {
        if self.params.run_token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let exec = self.params.exec.clone();
        let setup_data = self.vu.setup_data.read().clone();
        let iteration = self.iteration;

        let result = self.vu.context.with(|ctx| -> Result<(), ExecError> {
            ctx.globals()
                .set("__ITER", iteration as f64)
                .map_err(js_err)?;
            let exports: Object = ctx.globals().get("__EXPORTS").map_err(js_err)?;
            let func: Function = exports.get(exec.as_str()).map_err(|_| {
                ExecError::Script(format!("exported function {exec:?} not found"))
            })?;
            let data = match &setup_data {
                Some(json) => json_parse(ctx.clone(), json)
                    .unwrap_or_else(|_| Value::new_undefined(ctx.clone())),
                None => Value::new_undefined(ctx.clone()),
            };
            func.call::<_, ()>((data,))
                .catch(&ctx)
                .map_err(|err| ExecError::Script(err.to_string()))
        });
        self.iteration += 1;

        // Iteration boundary: drain deferred callbacks and reservations
        // before the VU can be handed back.
        self.vu.event_loop.start(&self.params.run_token);
        if self.params.run_token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        result
    }

    fn deactivate(self: Box<Self>) -> Box<dyn InitializedVU> {
        for key in self.params.tags.keys() {
            self.vu.tags.delete(key);
        }
        Box::new(self.vu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::sample_channel;

    const SCRIPT: &str = r#"
export const options = { vus: 2, duration: "1s" };

let initCount = 0;
initCount += 1;

export function setup() {
    return { seeded: 41 };
}

export default function (data) {
    if (data && data.seeded !== 41) {
        throw new Error("setup data did not arrive");
    }
    metric("custom_metric", 12.5);
}

export function teardown(data) {
    print("teardown ran");
}

export function handleSummary(data) {
    return { "summary.txt": "iterations: " + data.fullIterations };
}
"#;

    fn runner() -> ScriptRunner {
        ScriptRunner::new("test_script.js", SCRIPT.to_string()).unwrap()
    }

    #[test]
    fn test_options_extraction() {
        let runner = runner();
        let options = runner.options();
        assert_eq!(options.vus, Some(2));
        assert_eq!(options.duration, Some("1s".to_string()));
    }

    #[test]
    fn test_iteration_with_setup_data_and_metrics() {
        let runner = runner();
        let (tx, rx) = sample_channel(64);
        let token = CancelToken::never();
        runner.setup(&token, &tx).unwrap();

        let vu = runner.new_vu(1, 1, tx.clone()).unwrap();
        let mut active = vu.activate(ActivationParams::new(token.clone(), "test"));
        active.run_once().unwrap();
        active.run_once().unwrap();
        let vu = active.deactivate();
        assert_eq!(vu.id_local(), 1);

        // The deferred metric emissions drained at each iteration boundary.
        let received: Vec<Samples> = rx.try_iter().collect();
        let count: usize = received.iter().map(|s| s.0.len()).sum();
        assert_eq!(count, 2);
        assert_eq!(received[0].0[0].metric, "custom_metric");
    }

    #[test]
    fn test_script_error_is_reported() {
        let bad = r#"
export default function () {
    throw new Error("boom");
}
"#;
        let runner = ScriptRunner::new("bad.js", bad.to_string()).unwrap();
        let (tx, _rx) = sample_channel(16);
        let vu = runner.new_vu(1, 1, tx).unwrap();
        let mut active = vu.activate(ActivationParams::new(CancelToken::never(), "test"));
        let err = active.run_once().unwrap_err();
        assert!(matches!(err, ExecError::Script(_)));
        // A failed iteration does not poison the VU.
        assert!(active.run_once().is_err());
    }

    #[test]
    fn test_missing_exec_function() {
        let runner = runner();
        let (tx, _rx) = sample_channel(16);
        let vu = runner.new_vu(1, 1, tx).unwrap();
        let params = ActivationParams::new(CancelToken::never(), "test").with_exec("nope");
        let mut active = vu.activate(params);
        assert!(matches!(active.run_once(), Err(ExecError::Script(_))));
    }

    #[test]
    fn test_handle_summary_artifacts() {
        let runner = runner();
        let token = CancelToken::never();
        let summary = Summary {
            test_run_duration: Duration::from_secs(3),
            full_iterations: 17,
            interrupted_iterations: 0,
            report: Default::default(),
        };
        let artifacts = runner.handle_summary(&token, &summary).unwrap();
        assert_eq!(
            artifacts.get("summary.txt").map(String::as_str),
            Some("iterations: 17")
        );
    }

    #[test]
    fn test_invalid_script_rejected() {
        assert!(ScriptRunner::new("broken.js", "this is not javascript {{{".to_string()).is_err());
    }
}
