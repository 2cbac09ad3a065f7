//! Parent/worker wire protocol
//!
//! One JSON object per line in each direction.

use crate::builder::BuildInput;
use crate::callbacks::CallbackKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Parent → worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerRequest {
    Build { task_id: u64, input: BuildInput },
    Shutdown,
}

/// Worker → parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerMessage {
    /// Handshake: initializer ran and callbacks resolved
    Ready { pid: u32 },
    /// Handshake: this worker cannot serve tasks
    Rejected { reason: Rejection },
    Built { task_id: u64, artifact_path: PathBuf },
    Failed {
        task_id: u64,
        stage: TaskStage,
        error: String,
    },
}

/// Why a worker refused to start serving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Rejection {
    Initializer { error: String },
    UnresolvedCallback { callback: CallbackKind, name: String },
}

/// Step of a task that raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TaskStage {
    /// The worker could not decode the request
    Decode,
    Build,
    Export,
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStage::Decode => write!(f, "request decoding"),
            TaskStage::Build => write!(f, "build"),
            TaskStage::Export => write!(f, "export"),
        }
    }
}

pub(crate) fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let json = serde_json::to_string(frame).map_err(io::Error::from)?;
    writeln!(writer, "{}", json)?;
    writer.flush()
}

/// `Ok(None)` on clean EOF
pub(crate) fn read_frame<R: BufRead, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> io::Result<Option<T>> {
    read_value(reader)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(io::Error::from)
}

/// Next frame as untyped JSON; only a line that is not JSON at all is an error
pub(crate) fn read_value<R: BufRead>(reader: &mut R) -> io::Result<Option<serde_json::Value>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(io::Error::from)
}
