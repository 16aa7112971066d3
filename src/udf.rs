//! Registry of stream modules. Registration stores the source and compiles
//! it on a background thread; callers poll the module status until ready.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

use crate::error::{DbError, Result};
use crate::models::{Record, TaskStatus, UdfCall, Value};
use crate::script::{parse_module, Module};
use crate::storage::{Storage, StoredModule};

#[derive(Debug, Clone)]
pub enum ModuleState {
    Compiling,
    Ready(Arc<Module>),
    Failed(String),
}

impl ModuleState {
    fn as_task_status(&self) -> TaskStatus {
        match self {
            ModuleState::Compiling => TaskStatus::InProgress,
            ModuleState::Ready(_) => TaskStatus::Complete,
            ModuleState::Failed(reason) => TaskStatus::Failed(reason.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct ModuleEntry {
    file_name: String,
    generation: u64,
    state: ModuleState,
}

/// Summary row for `udf-list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub file_name: String,
    pub generation: u64,
    pub status: TaskStatus,
}

/// Module name of a registered file: its base name without extension.
pub fn module_name(file_name: &str) -> &str {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
}

pub struct ModuleRegistry {
    storage: Storage,
    modules: Arc<RwLock<HashMap<String, ModuleEntry>>>,
    generations: AtomicU64,
}

impl ModuleRegistry {
    /// Load persisted sources, compiling them before returning.
    pub fn load(storage: Storage) -> Result<Self> {
        let registry = Self {
            storage: storage.clone(),
            modules: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(1),
        };
        for stored in storage.load_modules()? {
            let name = module_name(&stored.file_name).to_string();
            let state = compile(&name, &stored.source);
            let generation = registry.generations.fetch_add(1, Ordering::SeqCst);
            registry.modules.write().insert(
                name,
                ModuleEntry {
                    file_name: stored.file_name,
                    generation,
                    state,
                },
            );
        }
        Ok(registry)
    }

    /// Store a module source and start compiling it. Registering a file name
    /// again replaces the previous module.
    pub fn register(&self, file_name: &str, source: &str) -> Result<()> {
        if file_name.is_empty() || file_name.contains('/') || file_name.contains('\\') {
            return Err(DbError::InvalidCommand(format!(
                "udf file name must be a bare file name, got {file_name:?}"
            )));
        }
        let name = module_name(file_name).to_string();

        let replaced = self.modules.read().get(&name).map(|e| e.file_name.clone());
        if let Some(old) = replaced.filter(|old| old != file_name) {
            self.storage.remove_module(&old)?;
        }
        self.storage.save_module(&StoredModule {
            file_name: file_name.to_string(),
            source: source.to_string(),
            registered_at: Utc::now(),
        })?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        self.modules.write().insert(
            name.clone(),
            ModuleEntry {
                file_name: file_name.to_string(),
                generation,
                state: ModuleState::Compiling,
            },
        );
        info!(module = %name, generation, "udf registered, compiling");

        let modules = self.modules.clone();
        let source = source.to_string();
        let worker_name = name.clone();
        let spawned = thread::Builder::new()
            .name(format!("udf-compile-{name}"))
            .spawn(move || {
                let state = compile(&worker_name, &source);
                let mut modules = modules.write();
                // A newer registration owns the entry now.
                if let Some(entry) = modules.get_mut(&worker_name) {
                    if entry.generation == generation {
                        entry.state = state;
                    }
                }
            });
        if let Err(err) = spawned {
            if let Some(entry) = self.modules.write().get_mut(&name) {
                entry.state = ModuleState::Failed(format!("could not start compile: {err}"));
            }
        }
        Ok(())
    }

    /// Status by file name or module name.
    pub fn status(&self, name: &str) -> Result<TaskStatus> {
        self.modules
            .read()
            .get(module_name(name))
            .map(|entry| entry.state.as_task_status())
            .ok_or_else(|| DbError::UdfNotFound(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let entry = self
            .modules
            .write()
            .remove(module_name(name))
            .ok_or_else(|| DbError::UdfNotFound(name.to_string()))?;
        self.storage.remove_module(&entry.file_name)?;
        info!(module = %module_name(name), "udf removed");
        Ok(())
    }

    fn ready_module(&self, name: &str) -> Result<Arc<Module>> {
        let modules = self.modules.read();
        let entry = modules
            .get(name)
            .ok_or_else(|| DbError::UdfNotFound(name.to_string()))?;
        match &entry.state {
            ModuleState::Ready(module) => Ok(module.clone()),
            ModuleState::Compiling => Err(DbError::UdfNotReady(name.to_string())),
            ModuleState::Failed(reason) => Err(DbError::UdfCompile {
                module: name.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Check that a call names a ready module and a function of matching arity.
    pub fn check_call(&self, call: &UdfCall) -> Result<()> {
        let module = self.ready_module(&call.module)?;
        let function = module
            .function(&call.function)
            .ok_or_else(|| DbError::UdfNotFound(format!("{}.{}", call.module, call.function)))?;
        if function.arity() != call.args.len() {
            return Err(DbError::UdfArity {
                function: format!("{}.{}", call.module, call.function),
                expected: function.arity(),
                got: call.args.len(),
            });
        }
        Ok(())
    }

    /// Run a stream function over a record stream.
    pub fn invoke<I>(&self, call: &UdfCall, records: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Record>,
    {
        self.check_call(call)?;
        let module = self.ready_module(&call.module)?;
        let function = module
            .function(&call.function)
            .ok_or_else(|| DbError::UdfNotFound(format!("{}.{}", call.module, call.function)))?;
        function
            .apply(records, &call.args)
            .map_err(|msg| DbError::UdfRuntime(format!("{}.{}: {msg}", call.module, call.function)))
    }

    pub fn list(&self) -> Vec<ModuleInfo> {
        let mut all: Vec<ModuleInfo> = self
            .modules
            .read()
            .values()
            .map(|entry| ModuleInfo {
                file_name: entry.file_name.clone(),
                generation: entry.generation,
                status: entry.state.as_task_status(),
            })
            .collect();
        all.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        all
    }
}

fn compile(name: &str, source: &str) -> ModuleState {
    match parse_module(name, source) {
        Ok(module) => {
            info!(module = %name, functions = ?module.function_names(), "udf compiled");
            ModuleState::Ready(Arc::new(module))
        }
        Err(err) => {
            warn!(module = %name, error = %err, "udf compile failed");
            ModuleState::Failed(err.to_string())
        }
    }
}
