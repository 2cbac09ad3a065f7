use super::CompiledModule;
use crate::errors::{IrError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the artifact inside its scratch directory
pub const ARTIFACT_FILE_NAME: &str = "tmp_mod.json";

/// Format tag written into every artifact manifest
pub const ARTIFACT_FORMAT: &str = "autotune-module/v1";

#[derive(Serialize, Deserialize)]
struct ArtifactManifest {
    format: String,
    #[serde(flatten)]
    module: CompiledModule,
}

/// Standard artifact-export routine
///
/// Writes the module into a freshly created temporary directory and returns
/// the artifact path. The directory belongs to the caller from then on; it is
/// removed again if writing fails.
pub fn default_export(module: &CompiledModule) -> Result<PathBuf> {
    let dir = tempfile::Builder::new().prefix("autotune-").tempdir()?;
    let path = dir.path().join(ARTIFACT_FILE_NAME);

    let manifest = ArtifactManifest {
        format: ARTIFACT_FORMAT.to_string(),
        module: module.clone(),
    };
    fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;

    let _ = dir.keep();
    Ok(path)
}

/// Read an artifact written by [`default_export`]
pub fn load_artifact(path: impl AsRef<Path>) -> Result<CompiledModule> {
    let bytes = fs::read(path.as_ref())?;
    let manifest: ArtifactManifest = serde_json::from_slice(&bytes)?;
    if manifest.format != ARTIFACT_FORMAT {
        return Err(IrError::format(format!(
            "{}: unknown artifact format '{}'",
            path.as_ref().display(),
            manifest.format
        )));
    }
    Ok(manifest.module)
}
