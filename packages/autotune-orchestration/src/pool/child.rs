//! Worker main loop (child side of the fork)
//!
//! Runs the initializer, resolves callbacks, reports the handshake, then
//! serves one task at a time until asked to stop or the parent goes away.
//! Never returns: the child always leaves through `_exit`, so no parent state
//! (destructors, atexit handlers, buffered output) runs twice.

use super::protocol::{read_value, write_frame, Rejection, TaskStage, WorkerMessage, WorkerRequest};
use crate::builder::BuildInput;
use crate::callbacks::{install_worker_registry, RegistrySnapshot, ResolvedCallbacks, WorkerCallbacks};
use crate::error::BuilderError;
use anyhow::Context;
use std::any::Any;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

const EXIT_OK: libc::c_int = 0;
const EXIT_IO: libc::c_int = 1;
const EXIT_PANIC: libc::c_int = 101;

pub(crate) fn run(
    requests: RawFd,
    messages: RawFd,
    scratch: &Path,
    callbacks: &WorkerCallbacks,
    registry: RegistrySnapshot,
) -> ! {
    let code = match panic::catch_unwind(AssertUnwindSafe(|| {
        install_worker_registry(registry);
        serve(requests, messages, scratch, callbacks)
    })) {
        Ok(Ok(())) => EXIT_OK,
        Ok(Err(_)) => EXIT_IO,
        Err(_) => EXIT_PANIC,
    };
    // SAFETY: terminates this process only
    unsafe { libc::_exit(code) }
}

fn serve(
    requests: RawFd,
    messages: RawFd,
    scratch: &Path,
    callbacks: &WorkerCallbacks,
) -> io::Result<()> {
    // Panics are reported as task failures; keep stderr clean
    panic::set_hook(Box::new(|_| {}));
    // No logging from workers
    let _quiet = tracing::dispatcher::set_default(&tracing::Dispatch::none());

    // SAFETY: both fds were handed over by the fork and are owned here
    let mut reader = BufReader::new(unsafe { File::from_raw_fd(requests) });
    let mut writer = unsafe { File::from_raw_fd(messages) };

    std::env::set_current_dir(scratch)?;

    let resolved = match start(callbacks) {
        Ok(resolved) => resolved,
        Err(reason) => {
            return write_frame(&mut writer, &WorkerMessage::Rejected { reason });
        }
    };
    write_frame(
        &mut writer,
        &WorkerMessage::Ready {
            pid: std::process::id(),
        },
    )?;

    serve_requests(&mut reader, &mut writer, &resolved, scratch)
}

/// Answer requests until shutdown or EOF
///
/// A build request that does not decode is answered as a failed task; only a
/// frame that cannot be attributed to a task ends the worker.
fn serve_requests<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    resolved: &ResolvedCallbacks,
    scratch: &Path,
) -> io::Result<()> {
    while let Some(frame) = read_value(reader)? {
        let task_id = frame.get("task_id").and_then(serde_json::Value::as_u64);
        let request = match (serde_json::from_value::<WorkerRequest>(frame), task_id) {
            (Ok(request), _) => request,
            (Err(e), Some(task_id)) => {
                let message = WorkerMessage::Failed {
                    task_id,
                    stage: TaskStage::Decode,
                    error: e.to_string(),
                };
                write_frame(writer, &message)?;
                continue;
            }
            (Err(e), None) => return Err(io::Error::from(e)),
        };
        match request {
            WorkerRequest::Build { task_id, input } => {
                let message = execute(task_id, &input, resolved, scratch);
                write_frame(writer, &message)?;
            }
            WorkerRequest::Shutdown => break,
        }
    }
    Ok(())
}

/// Initializer first, then callback resolution
fn start(callbacks: &WorkerCallbacks) -> Result<ResolvedCallbacks, Rejection> {
    if let Some(initializer) = &callbacks.initializer {
        guarded(|| initializer()).map_err(|error| Rejection::Initializer { error })?;
    }
    callbacks.resolve().map_err(|e| match e {
        BuilderError::UnresolvedCallback { kind, name } => Rejection::UnresolvedCallback {
            callback: kind,
            name,
        },
        other => Rejection::Initializer {
            error: other.to_string(),
        },
    })
}

fn execute(
    task_id: u64,
    input: &BuildInput,
    callbacks: &ResolvedCallbacks,
    scratch: &Path,
) -> WorkerMessage {
    let failed = |stage, error| WorkerMessage::Failed {
        task_id,
        stage,
        error,
    };

    let module = match guarded(|| {
        (callbacks.build)(&input.program, &input.target, input.params.as_ref())
    }) {
        Ok(module) => module,
        Err(error) => return failed(TaskStage::Build, error),
    };

    let exported = guarded(|| {
        let path = (callbacks.export)(&module)?;
        if path.is_relative() {
            persist_artifact(scratch, &path)
        } else {
            Ok(path)
        }
    });
    match exported {
        Ok(artifact_path) => WorkerMessage::Built {
            task_id,
            artifact_path,
        },
        Err(error) => failed(TaskStage::Export, error),
    }
}

/// Move an artifact out of the scratch directory into a directory of its own
///
/// The scratch directory goes away with the worker; the returned path belongs
/// to the caller.
fn persist_artifact(scratch: &Path, relative: &Path) -> anyhow::Result<PathBuf> {
    let name = relative.file_name().with_context(|| {
        format!("artifact path '{}' does not name a file", relative.display())
    })?;
    let dir = tempfile::Builder::new()
        .prefix("autotune-")
        .tempdir()
        .context("creating artifact directory")?;
    let destination = dir.path().join(name);
    fs::rename(scratch.join(relative), &destination).with_context(|| {
        format!("moving artifact '{}' out of the worker directory", relative.display())
    })?;
    let _ = dir.keep();
    Ok(destination)
}

/// Run a callback, turning both errors and panics into the error text
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::protocol::read_frame;
    use crate::callbacks::{BuildFn, ExportFn, FnRef};
    use autotune_ir::{IRModule, Target};
    use std::io::Cursor;
    use std::sync::Arc;

    fn resolved(callbacks: WorkerCallbacks) -> ResolvedCallbacks {
        match start(&callbacks) {
            Ok(resolved) => resolved,
            Err(reason) => panic!("Expected callbacks to resolve, got {:?}", reason),
        }
    }

    fn input() -> BuildInput {
        BuildInput::new(IRModule::new(), Target::new("llvm"))
    }

    #[test]
    fn test_guarded_captures_errors_and_panics() {
        assert_eq!(guarded(|| Ok(7)), Ok(7));

        let err = guarded::<()>(|| Err(anyhow::anyhow!("inner").context("outer"))).unwrap_err();
        assert_eq!(err, "outer: inner");

        let err = guarded::<()>(|| panic!("kaboom")).unwrap_err();
        assert_eq!(err, "panicked: kaboom");
    }

    #[test]
    fn test_execute_reports_build_stage() {
        let callbacks = resolved(WorkerCallbacks {
            build: FnRef::<BuildFn>::direct(|_, _, _| anyhow::bail!("no schedule")),
            export: FnRef::Default,
            initializer: None,
        });
        let message = execute(5, &input(), &callbacks, Path::new("/tmp"));
        assert_eq!(
            message,
            WorkerMessage::Failed {
                task_id: 5,
                stage: TaskStage::Build,
                error: "no schedule".to_string(),
            }
        );
    }

    fn default_build() -> FnRef<BuildFn> {
        FnRef::<BuildFn>::direct(|_, target: &Target, _| {
            autotune_ir::default_build(
                &IRModule::from_func("main", autotune_ir::PrimFunc::new()),
                target,
                None,
            )
            .map_err(Into::into)
        })
    }

    #[test]
    fn test_execute_reports_export_stage() {
        let callbacks = resolved(WorkerCallbacks {
            build: default_build(),
            export: FnRef::<ExportFn>::direct(|_| anyhow::bail!("disk full")),
            initializer: None,
        });
        match execute(2, &input(), &callbacks, Path::new("/scratch")) {
            WorkerMessage::Failed { stage, error, .. } => {
                assert_eq!(stage, TaskStage::Export);
                assert_eq!(error, "disk full");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_relative_artifact_outlives_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        fs::create_dir(scratch.path().join("out")).unwrap();
        fs::write(scratch.path().join("out/mod.json"), b"{}").unwrap();

        let callbacks = resolved(WorkerCallbacks {
            build: default_build(),
            export: FnRef::<ExportFn>::direct(|_| Ok(PathBuf::from("out/mod.json"))),
            initializer: None,
        });
        let artifact = match execute(1, &input(), &callbacks, scratch.path()) {
            WorkerMessage::Built { artifact_path, .. } => artifact_path,
            other => panic!("Expected Built, got {:?}", other),
        };
        assert!(!artifact.starts_with(scratch.path()));
        assert_eq!(artifact.file_name().unwrap(), "mod.json");

        drop(scratch);
        assert_eq!(fs::read(&artifact).unwrap(), b"{}");
        fs::remove_dir_all(artifact.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_missing_relative_artifact_is_export_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let callbacks = resolved(WorkerCallbacks {
            build: default_build(),
            export: FnRef::<ExportFn>::direct(|_| Ok(PathBuf::from("never-written.json"))),
            initializer: None,
        });
        match execute(4, &input(), &callbacks, scratch.path()) {
            WorkerMessage::Failed { stage, error, .. } => {
                assert_eq!(stage, TaskStage::Export);
                assert!(error.starts_with("moving artifact 'never-written.json'"), "{}", error);
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_build_request_fails_only_that_task() {
        let callbacks = resolved(WorkerCallbacks {
            build: FnRef::<BuildFn>::direct(|_, _, _| anyhow::bail!("no schedule")),
            export: FnRef::Default,
            initializer: None,
        });
        let good = serde_json::to_string(&WorkerRequest::Build {
            task_id: 8,
            input: input(),
        })
        .unwrap();
        let requests = format!(
            "{}\n{}\n{}\n",
            r#"{"type":"build","task_id":7,"input":{"program":5}}"#,
            good,
            r#"{"type":"shutdown"}"#
        );

        let mut reader = Cursor::new(requests.into_bytes());
        let mut replies = Vec::new();
        serve_requests(&mut reader, &mut replies, &callbacks, Path::new("/scratch")).unwrap();

        let mut replies = Cursor::new(replies);
        match read_frame::<_, WorkerMessage>(&mut replies).unwrap() {
            Some(WorkerMessage::Failed { task_id, stage, .. }) => {
                assert_eq!(task_id, 7);
                assert_eq!(stage, TaskStage::Decode);
            }
            other => panic!("Expected decode failure, got {:?}", other),
        }
        match read_frame::<_, WorkerMessage>(&mut replies).unwrap() {
            Some(WorkerMessage::Failed { task_id, stage, .. }) => {
                assert_eq!(task_id, 8);
                assert_eq!(stage, TaskStage::Build);
            }
            other => panic!("Expected build failure, got {:?}", other),
        }
        assert_eq!(read_frame::<_, WorkerMessage>(&mut replies).unwrap(), None);
    }

    #[test]
    fn test_unattributable_frame_ends_worker() {
        let callbacks = resolved(WorkerCallbacks {
            build: FnRef::Default,
            export: FnRef::Default,
            initializer: None,
        });
        let mut reader = Cursor::new(br#"{"type":"bogus"}"#.to_vec());
        let mut replies = Vec::new();
        let res = serve_requests(&mut reader, &mut replies, &callbacks, Path::new("/scratch"));
        assert!(res.is_err());
        assert!(replies.is_empty());
    }

    #[test]
    fn test_start_rejections() {
        let callbacks = WorkerCallbacks {
            build: FnRef::named("child.test.missing"),
            export: FnRef::Default,
            initializer: None,
        };
        match start(&callbacks) {
            Err(Rejection::UnresolvedCallback { name, .. }) => {
                assert_eq!(name, "child.test.missing")
            }
            other => panic!("Expected UnresolvedCallback, got {:?}", other.err()),
        }

        let callbacks = WorkerCallbacks {
            build: FnRef::Default,
            export: FnRef::Default,
            initializer: Some(Arc::new(|| anyhow::bail!("no device"))),
        };
        match start(&callbacks) {
            Err(Rejection::Initializer { error }) => assert_eq!(error, "no device"),
            other => panic!("Expected Initializer rejection, got {:?}", other.err()),
        }
    }
}
