//! autotune-ir: program representation and signature introspection
//!
//! The data side of the tuning build pipeline:
//!
//! - [`program`]: structured candidate programs (modules of primitive functions)
//! - [`target`]: target platform descriptors
//! - [`arg_info`]: `TensorInfo` / `ArgInfo`, the parameter signature of a
//!   program's entry function and its wire/text forms
//! - [`codegen`]: the default compile and export routines used by builders
//!
//! ```rust
//! use autotune_ir::{ArgInfo, Buffer, IRModule, PrimFunc};
//!
//! let func = PrimFunc::new()
//!     .with_param("a", Buffer::new("A", "float32", [128, 256]))
//!     .with_global_symbol("main");
//! let args = ArgInfo::from_entry_func(&IRModule::from_func("main", func)).unwrap();
//! assert_eq!(args[0].to_string(), r#"TensorInfo("float32", [128, 256])"#);
//! ```

pub mod arg_info;
pub mod codegen;
pub mod errors;
pub mod program;
pub mod target;

pub use arg_info::{ArgInfo, TensorInfo, TENSOR_TAG};
pub use codegen::{
    default_build, default_export, load_artifact, BuildParams, CompiledFunction, CompiledModule,
};
pub use errors::{IrError, Result};
pub use program::{Block, Buffer, FuncAttrs, IRModule, IterKind, IterVar, PrimFunc};
pub use target::Target;
