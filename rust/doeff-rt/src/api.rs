//! Public run API.
//!
//! `run` drives a program to completion on the calling thread; `async_run`
//! does the same on a worker thread and hands back a joinable handle.
//! `run_program` layers env merging on top (explicit envs plus the user's
//! default env from `~/.doeff.toml`), mirroring how the CLI prepares a
//! run.

use crate::trace::{EffectTrace, Failure, RunError};
use crate::vm::sched::PromiseState;
use crate::vm::Machine;

use doeff_core::effects::local;
use doeff_core::errors::EffectError;
use doeff_core::expr::{Expr, Handler};
use doeff_core::values::Value;

use crossbeam_channel::{bounded, Receiver};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// The handler stack installed by default, outermost first: state,
/// reader (with lazy program-valued env entries), writer, result,
/// scheduler primitives, and the synchronous await bridge.
pub fn default_handlers() -> Vec<Handler> {
    vec![
        Handler::State,
        Handler::Reader,
        Handler::Writer,
        Handler::Result,
        Handler::Scheduler,
        Handler::SyncAwait,
    ]
}

// ---------------------------------------------------------------------------
// RunConfig / RunResult
// ---------------------------------------------------------------------------

/// Configuration for one run.
pub struct RunConfig {
    /// Handler stack, outermost first. Empty means no handlers at all;
    /// use [`default_handlers`] for the standard stack.
    pub handlers: Vec<Handler>,
    pub env: BTreeMap<String, Value>,
    pub store: BTreeMap<String, Value>,
    /// Render the failure trace to stderr when the run errors.
    pub print_trace: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            handlers: default_handlers(),
            env: BTreeMap::new(),
            store: BTreeMap::new(),
            print_trace: false,
        }
    }
}

/// Outcome of a run: final value or traced error, plus the final store
/// and writer log.
#[derive(Debug)]
pub struct RunResult {
    result: Result<Value, RunError>,
    pub store: BTreeMap<String, Value>,
    pub log: Vec<Value>,
    /// The failure trace, when the run errored.
    pub trace: Option<EffectTrace>,
    /// Spawned tasks whose result no one ever waited on (and that were
    /// not marked fire-and-forget).
    pub unjoined_tasks: usize,
}

impl RunResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.result.is_err()
    }

    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RunError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value, RunError> {
        self.result
    }

    /// The success value; panics with the rendered trace on failure.
    pub fn unwrap_value(self) -> Value {
        match self.result {
            Ok(v) => v,
            Err(e) => panic!("run failed: {}\n{}", e, e.render_trace()),
        }
    }
}

/// Winner of a `race`, decoded from its map value.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceResult {
    pub index: usize,
    pub value: Value,
}

impl RaceResult {
    pub fn from_value(v: &Value) -> Option<RaceResult> {
        let map = v.as_map()?;
        let index = map.get("index")?.as_int()?;
        let value = map.get("value")?.clone();
        Some(RaceResult { index: index as usize, value })
    }
}

// ---------------------------------------------------------------------------
// run / async_run
// ---------------------------------------------------------------------------

/// Run a program to completion on the calling thread.
pub fn run(program: impl Into<Expr>, config: RunConfig) -> RunResult {
    let mut machine = Machine::new(
        program.into(),
        config.handlers,
        config.env,
        config.store,
    );
    let run_id = machine.run_id;
    let unjoined_tasks = machine.run_to_completion();

    let fatal = machine.fatal.take();
    let main = machine.main;
    let main_task = &machine.tasks[main.0 as usize];
    let store: BTreeMap<String, Value> = main_task
        .store
        .iter()
        .map(|(k, e)| (k.clone(), e.value.clone()))
        .collect();
    let log = main_task.log.clone();

    let outcome: Result<Value, Failure> = match fatal {
        Some(f) => Err(f),
        None => {
            let promise = main_task.result;
            match machine.promises[promise.0 as usize].state.clone() {
                PromiseState::Resolved(v) => Ok(v),
                PromiseState::Rejected(f) => Err(f),
                PromiseState::Pending => Err(Failure::new(EffectError::Deadlock)),
            }
        }
    };

    let result = outcome.map_err(|f| RunError { error: f.error, trace: f.trace, run_id });
    let trace = result.as_ref().err().map(|e| e.trace.clone());
    if config.print_trace {
        if let Err(e) = &result {
            eprintln!("{}", e.render_trace());
        }
    }
    RunResult { result, store, log, trace, unjoined_tasks }
}

/// Handle to a run executing on a worker thread.
pub struct RunHandle {
    rx: Receiver<RunResult>,
}

impl RunHandle {
    /// Block until the run finishes.
    pub fn join(self) -> RunResult {
        self.rx.recv().unwrap_or_else(|_| RunResult {
            result: Err(RunError {
                error: EffectError::failure("run worker thread panicked"),
                trace: EffectTrace::default(),
                run_id: Uuid::nil(),
            }),
            store: BTreeMap::new(),
            log: Vec::new(),
            trace: None,
            unjoined_tasks: 0,
        })
    }

    /// Non-blocking poll.
    pub fn try_join(&self) -> Option<RunResult> {
        self.rx.try_recv().ok()
    }
}

/// Run a program on a worker thread; the caller keeps going and joins
/// later.
pub fn async_run(program: impl Into<Expr>, config: RunConfig) -> RunHandle {
    let program = program.into();
    let (tx, rx) = bounded(1);
    std::thread::Builder::new()
        .name("doeff-run".to_string())
        .spawn(move || {
            let _ = tx.send(run(program, config));
        })
        .expect("spawn run worker");
    RunHandle { rx }
}

// ---------------------------------------------------------------------------
// run_program — env merging and the default env file
// ---------------------------------------------------------------------------

/// One environment source for [`run_program`].
pub enum EnvSource {
    /// Literal key/value overlay.
    Map(BTreeMap<String, Value>),
    /// A program that evaluates to a map of env entries.
    Program(Expr),
    /// A TOML file of env entries.
    File(PathBuf),
}

/// Options for [`run_program`].
pub struct RunProgramOptions {
    pub handlers: Vec<Handler>,
    pub envs: Vec<EnvSource>,
    /// Load `~/.doeff.toml` first (suppressed by
    /// `DOEFF_DISABLE_DEFAULT_ENV=1`).
    pub load_default_env: bool,
    pub print_trace: bool,
}

impl Default for RunProgramOptions {
    fn default() -> Self {
        Self {
            handlers: default_handlers(),
            envs: Vec::new(),
            load_default_env: true,
            print_trace: false,
        }
    }
}

/// Result of [`run_program`]: the run outcome plus where the env came
/// from.
pub struct ProgramRunResult {
    pub run_result: RunResult,
    pub env_sources: Vec<String>,
}

/// Convert a parsed TOML document into env values.
pub fn toml_to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::Str(s.clone()),
        toml::Value::Integer(n) => Value::Int(*n),
        toml::Value::Float(n) => Value::Float(*n),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::Str(dt.to_string()),
        toml::Value::Array(items) => {
            Value::List(items.iter().map(toml_to_value).collect())
        }
        toml::Value::Table(table) => Value::Map(
            table.iter().map(|(k, v)| (k.clone(), toml_to_value(v))).collect(),
        ),
    }
}

fn load_env_file(path: &PathBuf) -> Result<BTreeMap<String, Value>, EffectError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EffectError::failure(format!("cannot read env file {}: {}", path.display(), e))
    })?;
    let table: toml::Value = toml::from_str(&text).map_err(|e| {
        EffectError::failure(format!("cannot parse env file {}: {}", path.display(), e))
    })?;
    match toml_to_value(&table) {
        Value::Map(entries) => Ok(entries),
        _ => Err(EffectError::failure(format!(
            "env file {} is not a table",
            path.display()
        ))),
    }
}

fn default_env_path() -> Option<PathBuf> {
    if std::env::var("DOEFF_DISABLE_DEFAULT_ENV").as_deref() == Ok("1") {
        return None;
    }
    let home = std::env::var_os("HOME")?;
    let path = PathBuf::from(home).join(".doeff.toml");
    path.exists().then_some(path)
}

/// Run a program with merged environment sources applied via `Local`.
///
/// Sources merge in order (later wins): the default env file, then each
/// entry of `options.envs`. Env programs run against the same handler
/// stack before the main program starts.
pub fn run_program(
    program: impl Into<Expr>,
    options: RunProgramOptions,
) -> ProgramRunResult {
    let mut merged: BTreeMap<String, Value> = BTreeMap::new();
    let mut env_sources: Vec<String> = Vec::new();

    if options.load_default_env {
        if let Some(path) = default_env_path() {
            match load_env_file(&path) {
                Ok(entries) => {
                    merged.extend(entries);
                    env_sources.push(format!("{}", path.display()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load default env file");
                }
            }
        }
    }

    for source in options.envs {
        match source {
            EnvSource::Map(entries) => {
                merged.extend(entries);
                env_sources.push("<map>".to_string());
            }
            EnvSource::File(path) => match load_env_file(&path) {
                Ok(entries) => {
                    merged.extend(entries);
                    env_sources.push(format!("{}", path.display()));
                }
                Err(e) => {
                    let run_result = RunResult {
                        result: Err(RunError {
                            error: e,
                            trace: EffectTrace::default(),
                            run_id: Uuid::nil(),
                        }),
                        store: BTreeMap::new(),
                        log: Vec::new(),
                        trace: None,
                        unjoined_tasks: 0,
                    };
                    return ProgramRunResult { run_result, env_sources };
                }
            },
            EnvSource::Program(expr) => {
                let env_run = run(
                    expr,
                    RunConfig { handlers: options.handlers.clone(), ..Default::default() },
                );
                match env_run.into_result() {
                    Ok(Value::Map(entries)) => {
                        merged.extend(entries);
                        env_sources.push("<program>".to_string());
                    }
                    Ok(other) => {
                        let run_result = RunResult {
                            result: Err(RunError {
                                error: EffectError::type_error(format!(
                                    "environment program must yield a map, got {}",
                                    other.type_name()
                                )),
                                trace: EffectTrace::default(),
                                run_id: Uuid::nil(),
                            }),
                            store: BTreeMap::new(),
                            log: Vec::new(),
                            trace: None,
                            unjoined_tasks: 0,
                        };
                        return ProgramRunResult { run_result, env_sources };
                    }
                    Err(e) => {
                        let run_result = RunResult {
                            result: Err(e),
                            store: BTreeMap::new(),
                            log: Vec::new(),
                            trace: None,
                            unjoined_tasks: 0,
                        };
                        return ProgramRunResult { run_result, env_sources };
                    }
                }
            }
        }
    }

    let mut body = program.into();
    if !merged.is_empty() {
        body = local(merged, body);
    }
    let run_result = run(
        body,
        RunConfig {
            handlers: options.handlers,
            print_trace: options.print_trace,
            ..Default::default()
        },
    );
    ProgramRunResult { run_result, env_sources }
}
