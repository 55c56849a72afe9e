//! Process-wide name registries for executors and step compilers.
//!
//! Both tables have the same lifecycle: populated by registration calls at
//! startup, read-only lookups thereafter, no unregistration. Registering a
//! name twice replaces the previous entry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::compile::TrainStepCompiler;
use crate::graph::{GraphExecutor, Interpreter};

static EXECUTORS: OnceLock<RwLock<HashMap<String, Arc<dyn GraphExecutor>>>> = OnceLock::new();
static COMPILERS: OnceLock<RwLock<HashMap<String, Arc<TrainStepCompiler>>>> = OnceLock::new();

fn executors() -> &'static RwLock<HashMap<String, Arc<dyn GraphExecutor>>> {
    EXECUTORS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn compilers() -> &'static RwLock<HashMap<String, Arc<TrainStepCompiler>>> {
    COMPILERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers a graph-level executor strategy under a symbolic name.
pub fn register_executor(name: impl Into<String>, executor: Arc<dyn GraphExecutor>) {
    executors().write().unwrap().insert(name.into(), executor);
}

/// Resolves an executor strategy by name.
pub fn lookup_executor(name: &str) -> Option<Arc<dyn GraphExecutor>> {
    executors().read().unwrap().get(name).cloned()
}

/// All registered executor names.
pub fn list_executors() -> Vec<String> {
    executors().read().unwrap().keys().cloned().collect()
}

/// Installs a train-step compiler under a symbolic name.
pub fn register_compiler(name: impl Into<String>, compiler: Arc<TrainStepCompiler>) {
    compilers().write().unwrap().insert(name.into(), compiler);
}

/// Resolves a train-step compiler by name.
pub fn lookup_compiler(name: &str) -> Option<Arc<TrainStepCompiler>> {
    compilers().read().unwrap().get(name).cloned()
}

/// All registered compiler names.
pub fn list_compilers() -> Vec<String> {
    compilers().read().unwrap().keys().cloned().collect()
}

/// Registers the built-in entries: the `"eager"` interpreter, and the
/// `"train_step_eager"` compiler wired to it by name lookup. Safe to call
/// more than once.
pub fn register_default_backends() {
    register_executor("eager", Arc::new(Interpreter));
    let eager = lookup_executor("eager").expect("eager executor registered above");
    register_compiler("train_step_eager", Arc::new(TrainStepCompiler::new(eager)));
}
