/*
 * Autotune Orchestration - Build Orchestration for Kernel Auto-Tuning
 *
 * Compiles batches of candidate programs in isolated worker processes.
 *
 * Architecture:
 * - Builder contract (ordered batch in, ordered results out)
 * - Local process-pool builder (fork, timeouts, kill-and-replace)
 * - Pluggable builder (caller-supplied logic)
 * - Task State Machine (queued / running / terminal)
 * - Callback registry (named build / export functions)
 * - Observability (tracing, optional prometheus metrics)
 */

// Public modules
pub mod builder;
pub mod callbacks;
pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod task;

mod pool;

// Re-exports
pub use builder::{BuildInput, BuildResult, Builder, FnBuilder, LocalBuilder};
pub use callbacks::{
    lookup_build_fn, lookup_export_fn, register_build_fn, register_export_fn, BuildFn,
    CallbackKind, ExportFn, FnRef, Initializer, DEFAULT_BUILD_FN, DEFAULT_EXPORT_FN,
};
pub use config::{BuilderSettings, LocalBuilderConfig};
pub use error::{
    exception_message, timeout_message, BuilderError, FailureKind, Result, EXCEPTION_PREFIX,
    TIMEOUT_PREFIX,
};
#[cfg(feature = "metrics")]
pub use metrics::BuilderMetrics;
pub use task::{TaskState, TaskStateMachine};

// Program-side types callers need to fill a BuildInput
pub use autotune_ir::{ArgInfo, BuildParams, CompiledModule, IRModule, Target, TensorInfo};
