//! Builder abstraction
//!
//! A [`Builder`] turns an ordered batch of [`BuildInput`]s into a batch of
//! [`BuildResult`]s of the same length and order. Per-input failures are
//! encoded in the results, never raised.

mod local;
mod pluggable;

pub use local::LocalBuilder;
pub use pluggable::FnBuilder;

use async_trait::async_trait;
use autotune_ir::{BuildParams, IRModule, Target};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A build request: program, target, optional extra parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    pub program: IRModule,
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BuildParams>,
}

impl BuildInput {
    pub fn new(program: IRModule, target: Target) -> Self {
        Self {
            program,
            target,
            params: None,
        }
    }

    pub fn with_params(mut self, params: BuildParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// Outcome of one build request
///
/// Exactly one of `artifact_path` / `error_msg` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    artifact_path: Option<PathBuf>,
    error_msg: Option<String>,
}

impl BuildResult {
    /// # Panics
    ///
    /// Panics unless exactly one of the two fields is `Some`.
    pub fn new(artifact_path: Option<PathBuf>, error_msg: Option<String>) -> Self {
        assert!(
            artifact_path.is_some() != error_msg.is_some(),
            "BuildResult requires exactly one of artifact_path / error_msg, got artifact_path={:?}, error_msg={:?}",
            artifact_path,
            error_msg
        );
        Self {
            artifact_path,
            error_msg,
        }
    }

    pub fn success(artifact_path: impl Into<PathBuf>) -> Self {
        Self::new(Some(artifact_path.into()), None)
    }

    pub fn failure(error_msg: impl Into<String>) -> Self {
        Self::new(None, Some(error_msg.into()))
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    pub fn error_msg(&self) -> Option<&str> {
        self.error_msg.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.artifact_path.is_some()
    }
}

/// Build orchestration contract
///
/// `build(inputs)[i]` is the outcome of `inputs[i]`. Implementations may
/// parallelize internally but must return results positionally.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, inputs: &[BuildInput]) -> Vec<BuildResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_result_success() {
        let result = BuildResult::success("/tmp/x/tmp_mod.json");
        assert!(result.is_success());
        assert_eq!(result.artifact_path(), Some(Path::new("/tmp/x/tmp_mod.json")));
        assert_eq!(result.error_msg(), None);
    }

    #[test]
    fn test_build_result_failure() {
        let result = BuildResult::failure("error");
        assert!(!result.is_success());
        assert_eq!(result.artifact_path(), None);
        assert_eq!(result.error_msg(), Some("error"));
    }

    #[test]
    #[should_panic(expected = "exactly one")]
    fn test_build_result_rejects_both() {
        BuildResult::new(Some(PathBuf::from("/tmp/a")), Some("error".to_string()));
    }

    #[test]
    #[should_panic(expected = "exactly one")]
    fn test_build_result_rejects_neither() {
        BuildResult::new(None, None);
    }

    #[test]
    fn test_build_input_serde() {
        let input = BuildInput::new(IRModule::new(), Target::new("llvm"));
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["target"]["kind"], "llvm");
        assert!(json.get("params").is_none());

        let back: BuildInput = serde_json::from_value(json).unwrap();
        assert_eq!(back, input);
    }
}
