//! Build / export / initializer callbacks
//!
//! A builder is configured with [`FnRef`]s: either a direct reference to a
//! closure, or the name of a function in the process-wide registry. Names are
//! resolved once per worker, right after the worker's initializer has run,
//! so an initializer can register functions that only exist in workers.
//!
//! Workers are forked without exec, so a worker must never touch the parent's
//! registry lock: another parent thread may have held it at fork time. The
//! parent snapshots the registry before forking and the worker installs that
//! copy behind a lock of its own.

use crate::error::{BuilderError, Result};
use autotune_ir::{BuildParams, CompiledModule, IRModule, Target};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// `(program, target, params) -> in-memory compiled module`
pub type BuildFn =
    dyn Fn(&IRModule, &Target, Option<&BuildParams>) -> anyhow::Result<CompiledModule> + Send + Sync;

/// `(module) -> artifact path`
pub type ExportFn = dyn Fn(&CompiledModule) -> anyhow::Result<PathBuf> + Send + Sync;

/// One-time per-worker setup
pub type Initializer = dyn Fn() -> anyhow::Result<()> + Send + Sync;

pub const DEFAULT_BUILD_FN: &str = "autotune.builder.default_build";
pub const DEFAULT_EXPORT_FN: &str = "autotune.builder.default_export";

/// Which callback a reference designates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Build,
    Export,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Build => "build",
            CallbackKind::Export => "export",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to a callback
pub enum FnRef<F: ?Sized> {
    /// The standard routine
    Default,
    /// A function registered under this name
    Named(String),
    /// Injected directly
    Direct(Arc<F>),
}

impl<F: ?Sized> FnRef<F> {
    pub fn named(name: impl Into<String>) -> Self {
        FnRef::Named(name.into())
    }

    /// Human-readable description for logs
    pub fn describe(&self) -> String {
        match self {
            FnRef::Default => "<default>".to_string(),
            FnRef::Named(name) => name.clone(),
            FnRef::Direct(_) => "<direct>".to_string(),
        }
    }
}

impl FnRef<BuildFn> {
    pub fn direct<G>(f: G) -> Self
    where
        G: Fn(&IRModule, &Target, Option<&BuildParams>) -> anyhow::Result<CompiledModule>
            + Send
            + Sync
            + 'static,
    {
        FnRef::Direct(Arc::new(f))
    }

    pub fn resolve(&self) -> Result<Arc<BuildFn>> {
        let name = match self {
            FnRef::Direct(f) => return Ok(Arc::clone(f)),
            FnRef::Default => DEFAULT_BUILD_FN,
            FnRef::Named(name) => name.as_str(),
        };
        lookup_build_fn(name).ok_or_else(|| BuilderError::UnresolvedCallback {
            kind: CallbackKind::Build,
            name: name.to_string(),
        })
    }
}

impl FnRef<ExportFn> {
    pub fn direct<G>(f: G) -> Self
    where
        G: Fn(&CompiledModule) -> anyhow::Result<PathBuf> + Send + Sync + 'static,
    {
        FnRef::Direct(Arc::new(f))
    }

    pub fn resolve(&self) -> Result<Arc<ExportFn>> {
        let name = match self {
            FnRef::Direct(f) => return Ok(Arc::clone(f)),
            FnRef::Default => DEFAULT_EXPORT_FN,
            FnRef::Named(name) => name.as_str(),
        };
        lookup_export_fn(name).ok_or_else(|| BuilderError::UnresolvedCallback {
            kind: CallbackKind::Export,
            name: name.to_string(),
        })
    }
}

impl<F: ?Sized> Clone for FnRef<F> {
    fn clone(&self) -> Self {
        match self {
            FnRef::Default => FnRef::Default,
            FnRef::Named(name) => FnRef::Named(name.clone()),
            FnRef::Direct(f) => FnRef::Direct(Arc::clone(f)),
        }
    }
}

impl<F: ?Sized> Default for FnRef<F> {
    fn default() -> Self {
        FnRef::Default
    }
}

impl<F: ?Sized> fmt::Debug for FnRef<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnRef({})", self.describe())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Registry {
    build: HashMap<String, Arc<BuildFn>>,
    export: HashMap<String, Arc<ExportFn>>,
}

/// Copy of the registry handed to a forked worker
pub(crate) struct RegistrySnapshot(Registry);

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    let mut build: HashMap<String, Arc<BuildFn>> = HashMap::new();
    build.insert(
        DEFAULT_BUILD_FN.to_string(),
        Arc::new(
            |module: &IRModule,
             target: &Target,
             params: Option<&BuildParams>|
             -> anyhow::Result<CompiledModule> {
                Ok(autotune_ir::default_build(module, target, params)?)
            },
        ),
    );

    let mut export: HashMap<String, Arc<ExportFn>> = HashMap::new();
    export.insert(
        DEFAULT_EXPORT_FN.to_string(),
        Arc::new(|module: &CompiledModule| -> anyhow::Result<PathBuf> {
            Ok(autotune_ir::default_export(module)?)
        }),
    );

    RwLock::new(Registry { build, export })
});

/// Set only inside a forked worker
static WORKER_REGISTRY: OnceCell<RwLock<Registry>> = OnceCell::new();

fn registry() -> &'static RwLock<Registry> {
    WORKER_REGISTRY.get().unwrap_or(&*REGISTRY)
}

/// Taken by the parent right before forking a worker
pub(crate) fn snapshot_registry() -> RegistrySnapshot {
    RegistrySnapshot(registry().read().clone())
}

/// Called once in a freshly forked worker, before any callback runs
pub(crate) fn install_worker_registry(snapshot: RegistrySnapshot) {
    let _ = WORKER_REGISTRY.set(RwLock::new(snapshot.0));
}

/// Hold the registry write lock for `duration`, signalling once it is taken
#[cfg(test)]
pub(crate) fn hold_registry_lock(duration: std::time::Duration, locked: std::sync::mpsc::Sender<()>) {
    let _guard = REGISTRY.write();
    let _ = locked.send(());
    std::thread::sleep(duration);
}

/// Register (or replace) a named build function
pub fn register_build_fn<G>(name: impl Into<String>, f: G)
where
    G: Fn(&IRModule, &Target, Option<&BuildParams>) -> anyhow::Result<CompiledModule>
        + Send
        + Sync
        + 'static,
{
    registry().write().build.insert(name.into(), Arc::new(f));
}

/// Register (or replace) a named export function
pub fn register_export_fn<G>(name: impl Into<String>, f: G)
where
    G: Fn(&CompiledModule) -> anyhow::Result<PathBuf> + Send + Sync + 'static,
{
    registry().write().export.insert(name.into(), Arc::new(f));
}

pub fn lookup_build_fn(name: &str) -> Option<Arc<BuildFn>> {
    registry().read().build.get(name).cloned()
}

pub fn lookup_export_fn(name: &str) -> Option<Arc<ExportFn>> {
    registry().read().export.get(name).cloned()
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker-side bundle
// ═══════════════════════════════════════════════════════════════════════════

/// Everything a worker needs to set itself up
#[derive(Clone)]
pub(crate) struct WorkerCallbacks {
    pub build: FnRef<BuildFn>,
    pub export: FnRef<ExportFn>,
    pub initializer: Option<Arc<Initializer>>,
}

/// Callbacks resolved to concrete handles, held by a worker for its lifetime
pub(crate) struct ResolvedCallbacks {
    pub build: Arc<BuildFn>,
    pub export: Arc<ExportFn>,
}

impl WorkerCallbacks {
    pub fn resolve(&self) -> Result<ResolvedCallbacks> {
        Ok(ResolvedCallbacks {
            build: self.build.resolve()?,
            export: self.export.resolve()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotune_ir::{Buffer, PrimFunc};

    fn module() -> IRModule {
        IRModule::from_func(
            "main",
            PrimFunc::new().with_param("a", Buffer::new("A", "float32", [4])),
        )
    }

    #[test]
    fn test_default_refs_resolve() {
        let build = FnRef::<BuildFn>::Default.resolve().unwrap();
        let export = FnRef::<ExportFn>::Default.resolve().unwrap();

        let compiled = build(&module(), &Target::new("llvm"), None).unwrap();
        let path = export(&compiled).unwrap();
        assert!(path.is_file());
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_unknown_name_is_unresolved() {
        let err = FnRef::<BuildFn>::named("wrong-name").resolve().err().unwrap();
        match err {
            BuilderError::UnresolvedCallback { kind, name } => {
                assert_eq!(kind, CallbackKind::Build);
                assert_eq!(name, "wrong-name");
            }
            other => panic!("Expected UnresolvedCallback, got {:?}", other),
        }
        assert!(FnRef::<ExportFn>::named("wrong-name").resolve().is_err());
    }

    #[test]
    fn test_registered_name_resolves() {
        register_build_fn("callbacks.test.failing_build", |_, _, _| {
            anyhow::bail!("intended failure")
        });
        let build = FnRef::<BuildFn>::named("callbacks.test.failing_build")
            .resolve()
            .unwrap();
        let err = build(&module(), &Target::new("llvm"), None).unwrap_err();
        assert_eq!(err.to_string(), "intended failure");
    }

    #[test]
    fn test_snapshot_carries_registered_names() {
        register_export_fn("callbacks.test.snapshot_export", |_| {
            Ok(PathBuf::from("/nonexistent/snapshot"))
        });
        let snapshot = snapshot_registry();
        assert!(snapshot.0.export.contains_key("callbacks.test.snapshot_export"));
        assert!(snapshot.0.build.contains_key(DEFAULT_BUILD_FN));
    }

    #[test]
    fn test_direct_ref_resolves_to_same_closure() {
        let export = FnRef::<ExportFn>::direct(|_| Ok(PathBuf::from("/nonexistent/artifact")));
        let resolved = export.resolve().unwrap();
        let compiled = autotune_ir::default_build(&module(), &Target::new("c"), None).unwrap();
        assert_eq!(resolved(&compiled).unwrap(), PathBuf::from("/nonexistent/artifact"));
        assert_eq!(export.describe(), "<direct>");
    }
}
