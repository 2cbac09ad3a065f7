//! Forked worker processes (parent side)
//!
//! Each worker is a `fork()`ed copy of the current process connected by two
//! pipes. The parent-side pipe ends of every live worker are tracked in a
//! process-wide ledger; a freshly forked child closes all of them, so the
//! only holder of a worker's message pipe write end is that worker, and EOF
//! on it means the worker is gone.
//!
//! Pipe I/O never happens on the async task: a reader thread forwards
//! messages and a writer thread drains queued requests, so a large request
//! cannot stall the lanes driving other workers.

use super::child;
use super::protocol::{read_frame, write_frame, WorkerMessage, WorkerRequest};
use crate::callbacks::{snapshot_registry, RegistrySnapshot, WorkerCallbacks};
use crate::error::{BuilderError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Parent-side pipe ends of all live workers
static FD_LEDGER: Lazy<Mutex<HashSet<RawFd>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Parent-side pipe end registered in the ledger
///
/// Deregistration and `close` happen under the ledger lock, so a concurrent
/// fork never sees a stale descriptor number.
struct PipeEnd {
    file: ManuallyDrop<File>,
}

impl PipeEnd {
    /// Caller holds the ledger lock and has inserted `fd`
    unsafe fn registered(fd: RawFd) -> Self {
        Self {
            file: ManuallyDrop::new(File::from_raw_fd(fd)),
        }
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let mut ledger = FD_LEDGER.lock();
        ledger.remove(&self.file.as_raw_fd());
        // SAFETY: dropped exactly once, here
        unsafe { ManuallyDrop::drop(&mut self.file) };
    }
}

fn pipe_cloexec() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid two-element buffer
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn close_all(fds: &[RawFd]) {
    for &fd in fds {
        // SAFETY: fds are owned by the caller and not used afterwards
        unsafe { libc::close(fd) };
    }
}

/// What the reader thread forwards to the orchestrator
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message(WorkerMessage),
    /// Message pipe closed or unreadable: the worker is gone
    Disconnected,
}

/// Handle on one live worker process
pub(crate) struct WorkerProcess {
    id: String,
    pid: libc::pid_t,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    reaped: bool,
    // Removed after the process is reaped (fields drop after `Drop::drop`)
    scratch: TempDir,
}

impl WorkerProcess {
    /// Fork a worker; its handshake message is the first event it sends
    pub fn spawn(callbacks: &WorkerCallbacks) -> Result<Self> {
        Self::spawn_with(callbacks, snapshot_registry())
    }

    fn spawn_with(callbacks: &WorkerCallbacks, registry: RegistrySnapshot) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("autotune-worker-")
            .tempdir()?;

        let mut ledger = FD_LEDGER.lock();
        let (req_read, req_write) = pipe_cloexec().map_err(BuilderError::spawn)?;
        let (msg_read, msg_write) = match pipe_cloexec() {
            Ok(fds) => fds,
            Err(e) => {
                close_all(&[req_read, req_write]);
                return Err(BuilderError::spawn(e));
            }
        };
        let inherited: Vec<RawFd> = ledger.iter().copied().collect();

        // SAFETY: the child only touches memory it owns and leaves via _exit
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = io::Error::last_os_error();
            close_all(&[req_read, req_write, msg_read, msg_write]);
            return Err(BuilderError::spawn(err));
        }
        if pid == 0 {
            close_all(&inherited);
            close_all(&[req_write, msg_read]);
            child::run(req_read, msg_write, scratch.path(), callbacks, registry);
        }

        close_all(&[req_read, msg_write]);
        ledger.insert(req_write);
        ledger.insert(msg_read);
        // SAFETY: both fds were just registered while holding the lock
        let (request_pipe, messages) =
            unsafe { (PipeEnd::registered(req_write), PipeEnd::registered(msg_read)) };
        drop(ledger);

        let id = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (requests, request_rx) = mpsc::unbounded_channel();
        let mut worker = Self {
            id,
            pid,
            requests,
            events,
            reaped: false,
            scratch,
        };

        let reader_id = worker.id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-reader", worker.id))
            .spawn(move || forward_messages(reader_id, messages, event_tx));
        if let Err(e) = spawned {
            worker.kill();
            return Err(BuilderError::spawn(e));
        }
        let writer_id = worker.id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-writer", worker.id))
            .spawn(move || write_requests(writer_id, request_pipe, request_rx));
        if let Err(e) = spawned {
            worker.kill();
            return Err(BuilderError::spawn(e));
        }

        debug!(worker = %worker.id, pid = worker.pid, scratch = ?worker.scratch.path(), "Forked worker");
        Ok(worker)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Queue a request for the writer thread
    ///
    /// Fails once the writer has stopped, i.e. the worker no longer reads.
    pub fn send(&mut self, request: WorkerRequest) -> io::Result<()> {
        self.requests.send(request).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "worker stopped reading requests")
        })
    }

    /// Next event, or `None` once `deadline` passes
    pub async fn recv_until(&mut self, deadline: Instant) -> Option<WorkerEvent> {
        match tokio::time::timeout_at(deadline, self.events.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => Some(WorkerEvent::Disconnected),
            Err(_) => None,
        }
    }

    /// SIGKILL and reap; returns the exit description
    pub fn kill(&mut self) -> String {
        if self.reaped {
            return "already reaped".to_string();
        }
        // SAFETY: pid is our unreaped child, so it cannot have been recycled
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        self.wait(0).unwrap_or_else(|| "unknown exit status".to_string())
    }

    /// Reap a worker whose pipe closed, giving it a moment to finish exiting
    pub async fn reap_disconnected(&mut self) -> String {
        for _ in 0..50 {
            if let Some(status) = self.wait(libc::WNOHANG) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.kill()
    }

    /// Ask the worker to exit, then reclaim it
    pub async fn shutdown(mut self, grace: Duration) {
        if self.send(WorkerRequest::Shutdown).is_ok() {
            let deadline = Instant::now() + grace;
            while let Some(event) = self.recv_until(deadline).await {
                if matches!(event, WorkerEvent::Disconnected) {
                    break;
                }
            }
        }
        let status = self.kill();
        debug!(worker = %self.id, %status, "Worker shut down");
    }

    fn wait(&mut self, flags: libc::c_int) -> Option<String> {
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: status is a valid out pointer
            let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if rc == self.pid {
                self.reaped = true;
                return Some(describe_status(status));
            }
            if rc == 0 {
                return None;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            self.reaped = true;
            warn!(worker = %self.id, pid = self.pid, error = %err, "waitpid failed");
            return Some(format!("waitpid failed: {}", err));
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let status = self.kill();
            debug!(worker = %self.id, %status, "Reclaimed worker");
        }
    }
}

fn describe_status(status: libc::c_int) -> String {
    if libc::WIFEXITED(status) {
        format!("exit code {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("wait status {}", status)
    }
}

fn write_requests(
    worker_id: String,
    mut pipe: PipeEnd,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
) {
    while let Some(request) = requests.blocking_recv() {
        if let Err(e) = write_frame(&mut pipe, &request) {
            debug!(worker = %worker_id, error = %e, "Worker request pipe closed");
            break;
        }
    }
}

fn forward_messages(
    worker_id: String,
    messages: PipeEnd,
    tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut reader = BufReader::new(messages);
    loop {
        match read_frame::<_, WorkerMessage>(&mut reader) {
            Ok(Some(message)) => {
                if tx.send(WorkerEvent::Message(message)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "Unreadable worker message");
                break;
            }
        }
    }
    let _ = tx.send(WorkerEvent::Disconnected);
}
