use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::{Map as JsonMap, Value};
use sisypho_core::config::SkillsConfig;
use sisypho_core::{Error, Result};
use sisypho_tools::capabilities::Capabilities;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::namespace::{dynamic_to_json, json_to_dynamic, register_capabilities, register_helpers};

/// Name of the function every skill must define.
pub const ENTRY_POINT: &str = "run";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 0 = no operation budget.
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_stack_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_stack_depth: 64,
        }
    }
}

impl From<&SkillsConfig> for EngineConfig {
    fn from(config: &SkillsConfig) -> Self {
        Self {
            max_operations: config.max_operations,
            ..Default::default()
        }
    }
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// `run` returned; its value converted to JSON.
    Completed(Value),
    /// The deadline passed first. The script was told to stop but may still
    /// be inside a capability call.
    TimedOut,
}

/// Runs skill source against the capability allow-list.
///
/// This is isolation of convenience: scripts get no module loading and no
/// `eval`, but they share the process with everything else.
pub struct SkillSandbox {
    config: EngineConfig,
    capabilities: Capabilities,
}

impl SkillSandbox {
    pub fn new(config: EngineConfig, capabilities: Capabilities) -> Self {
        Self { config, capabilities }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn create_engine(&self) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_string_size(self.config.max_string_size);
        engine.set_max_array_size(self.config.max_array_size);
        engine.set_max_map_size(self.config.max_map_size);
        engine.set_max_call_levels(self.config.max_call_stack_depth);
        engine.set_max_expr_depths(64, 64);

        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.disable_symbol("eval");

        register_helpers(&mut engine);
        engine
    }

    fn create_engine_with_limits(&self, cancel: Arc<AtomicBool>, handle: Handle) -> Engine {
        let mut engine = self.create_engine();
        register_capabilities(&mut engine, &self.capabilities, handle);

        let max_ops = self.config.max_operations;
        engine.on_progress(move |ops| {
            if cancel.load(Ordering::Relaxed) {
                return Some(Dynamic::from("deadline exceeded".to_string()));
            }
            if max_ops > 0 && ops > max_ops {
                return Some(Dynamic::from(format!(
                    "Operation limit exceeded: {} operations",
                    max_ops
                )));
            }
            None
        });
        engine
    }

    pub fn compile(&self, source: &str) -> Result<AST> {
        self.create_engine()
            .compile(source)
            .map_err(|e| Error::Skill(format!("Compilation error: {}", e)))
    }

    /// Compile `source`, bind `params` by name to `run`'s parameters and call
    /// it on a blocking thread, waiting at most `timeout`.
    pub async fn run(&self, source: &str, params: &JsonMap<String, Value>, timeout: Duration) -> Result<RunOutcome> {
        let cancel = Arc::new(AtomicBool::new(false));
        let engine = self.create_engine_with_limits(cancel.clone(), Handle::current());
        let ast = engine
            .compile(source)
            .map_err(|e| Error::Skill(format!("Compilation error: {}", e)))?;

        let param_names: Vec<String> = ast
            .iter_functions()
            .find(|f| f.name == ENTRY_POINT)
            .map(|f| f.params.iter().map(|p| p.to_string()).collect())
            .ok_or_else(|| Error::Skill(format!("skill defines no `{}` function", ENTRY_POINT)))?;
        let args = bind_params(&param_names, params)?;

        debug!(params = ?param_names, timeout_ms = timeout.as_millis() as u64, "Starting skill");
        let start = Instant::now();
        let task = tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            engine.call_fn::<Dynamic>(&mut scope, &ast, ENTRY_POINT, args)
        });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(timeout_ms = timeout.as_millis() as u64, "Skill timed out");
                Ok(RunOutcome::TimedOut)
            }
            Ok(Err(join)) => Err(Error::Skill(format!("skill thread failed: {}", join))),
            Ok(Ok(Err(e))) => Err(script_error(*e)),
            Ok(Ok(Ok(value))) => {
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "Skill finished");
                Ok(RunOutcome::Completed(dynamic_to_json(&value)))
            }
        }
    }
}

/// Arguments for `run`, in declaration order. Every declared parameter must
/// be supplied and nothing else may be.
fn bind_params(names: &[String], params: &JsonMap<String, Value>) -> Result<Vec<Dynamic>> {
    if let Some(extra) = params.keys().find(|k| !names.contains(k)) {
        return Err(Error::Skill(format!("unexpected parameter '{}'", extra)));
    }
    names
        .iter()
        .map(|name| {
            params
                .get(name)
                .map(json_to_dynamic)
                .ok_or_else(|| Error::Skill(format!("missing parameter '{}'", name)))
        })
        .collect()
}

fn script_error(e: EvalAltResult) -> Error {
    if let EvalAltResult::ErrorTerminated(ref reason, _) = e {
        warn!(reason = %reason, "Script terminated");
        return Error::Skill(format!("Script terminated: {}", reason));
    }
    Error::Skill(format!("Runtime error: {}", e))
}
