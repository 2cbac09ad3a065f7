//! Default compile and export routines
//!
//! These stand at the backend boundary of the build pipeline: `default_build`
//! turns a program into an in-memory [`CompiledModule`], `default_export`
//! materializes it as an artifact file in a fresh directory.

mod export;
mod lower;

pub use export::{default_export, load_artifact, ARTIFACT_FILE_NAME, ARTIFACT_FORMAT};
pub use lower::{default_build, SUPPORTED_TARGET_KINDS};

use crate::arg_info::ArgInfo;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extra build parameters attached to a build request
pub type BuildParams = BTreeMap<String, serde_json::Value>;

/// A lowered function and the signature callers must honor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub symbol: String,
    pub args: ArgInfo,
}

/// In-memory result of compiling a program for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledModule {
    pub target: Target,
    pub functions: Vec<CompiledFunction>,
    pub source: String,
    /// Hex SHA-256 of `source`
    pub fingerprint: String,
    #[serde(default)]
    pub params: BuildParams,
}

impl CompiledModule {
    pub fn function(&self, symbol: &str) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }
}
