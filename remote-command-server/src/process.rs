//! Child process supervision: at most one live child whose stdout and stderr
//! are forwarded as framed chunks over the stream channel.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use remote_command_proto::{StreamHeader, StreamKind};

/// Token handed out for a live child. The token space is not meaningful
/// beyond "a process exists".
pub(crate) const PROCESS_TOKEN: i32 = 1;

/// Token meaning no process (spawn rejected or failed).
pub(crate) const NO_PROCESS: i32 = -1;

const READ_BUFFER_SIZE: usize = 4096;

/// Current stream sink, shared between the two pipe readers and the stream
/// acceptor. `None` means "discard output".
type StreamSink = Arc<Mutex<Option<TcpStream>>>;

struct RunningChild {
    child: Child,
    /// Held open and never written: the child keeps a valid stdin that never
    /// reaches EOF, which interactive commands require.
    _stdin: ChildStdin,
    stdout_reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
}

/// Owns the single child process slot and the stream sink.
///
/// Only the dispatcher thread drives `execute`/`await_process`/`close`; the
/// stream acceptor and the pipe readers touch nothing but the sink.
pub(crate) struct ProcessSupervisor {
    sink: StreamSink,
    slot: Mutex<Option<RunningChild>>,
}

impl ProcessSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
            slot: Mutex::new(None),
        }
    }

    /// Installs `new` as the stream sink and returns the previous socket for
    /// the caller to close.
    pub(crate) fn set_stream_socket(&self, new: Option<TcpStream>) -> Option<TcpStream> {
        std::mem::replace(&mut *self.sink.lock(), new)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Spawns a shell-wrapped child in `cwd` with piped stdio and starts one
    /// reader thread per output pipe. Rejected with [`NO_PROCESS`] while a
    /// child is already live, or when the spawn fails.
    pub(crate) fn execute(&self, cwd: &Path, command_line: &str) -> i32 {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            debug!(command_line, "Rejecting execute: a child process is already live");
            return NO_PROCESS;
        }

        let mut child = match spawn_shell(cwd, command_line) {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, command_line, "Failed to spawn child process");
                return NO_PROCESS;
            }
        };

        let stdin = child.stdin.take().expect("BUG: stdin is piped");
        let stdout = child.stdout.take().expect("BUG: stdout is piped");
        let stderr = child.stderr.take().expect("BUG: stderr is piped");

        let stdout_reader = spawn_reader("rc-stdout", stdout, StreamKind::Output, Arc::clone(&self.sink));
        let stderr_reader = spawn_reader("rc-stderr", stderr, StreamKind::Error, Arc::clone(&self.sink));

        info!(pid = child.id(), command_line, "Child process started");

        *slot = Some(RunningChild {
            child,
            _stdin: stdin,
            stdout_reader,
            stderr_reader,
        });

        PROCESS_TOKEN
    }

    /// Waits for the child to exit and both pipes to drain, then reaps.
    /// Idempotent: a no-op without a live child.
    pub(crate) fn await_process(&self, _token: i32) {
        let Some(mut running) = self.slot.lock().take() else {
            return;
        };

        // The readers exit on pipe EOF once the child stops writing.
        let _ = running.stdout_reader.join();
        let _ = running.stderr_reader.join();

        reap(&mut running.child);
    }

    /// Terminates the child, then joins the readers and reaps. A no-op
    /// without a live child.
    pub(crate) fn close(&self, _token: i32) {
        let Some(mut running) = self.slot.lock().take() else {
            return;
        };

        terminate(&mut running);

        let _ = running.stdout_reader.join();
        let _ = running.stderr_reader.join();

        reap(&mut running.child);
        info!("Child process closed");
    }
}

fn spawn_shell(cwd: &Path, command_line: &str) -> std::io::Result<Child> {
    let mut command = shell_command(command_line);
    command
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.spawn()
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    use std::os::unix::process::CommandExt as _;

    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);

    // The child becomes a process group leader so `close` can signal the
    // whole subtree through the negative pgid.
    // SAFETY: setpgid is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

/// Sends SIGTERM to the child's process group. Child death closes the write
/// ends of the pipes, which is the only reliable way to wake a reader blocked
/// in `read` on POSIX.
#[cfg(unix)]
fn terminate(running: &mut RunningChild) {
    let pgid = running.child.id() as i32;

    // SAFETY: no preconditions; a stale pgid at worst targets nothing.
    let _ = unsafe { libc::kill(-pgid, libc::SIGTERM) };
}

/// Terminates the child, then cancels the readers' pending synchronous reads.
/// Closing a pipe handle while a `ReadFile` is in flight can deadlock, so the
/// reads are cancelled first and the handles only drop after the joins.
#[cfg(windows)]
fn terminate(running: &mut RunningChild) {
    use std::os::windows::io::AsRawHandle as _;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::IO::CancelSynchronousIo;

    if let Err(error) = running.child.kill() {
        warn!(%error, "Failed to terminate child process");
    }

    for handle in [
        running.stdout_reader.as_raw_handle(),
        running.stderr_reader.as_raw_handle(),
    ] {
        // SAFETY: the thread handles stay alive until the joins below.
        if let Err(error) = unsafe { CancelSynchronousIo(HANDLE(handle)) } {
            debug!(%error, "CancelSynchronousIo reported no pending read");
        }
    }
}

fn reap(child: &mut Child) {
    match child.wait() {
        Ok(status) => debug!(%status, "Child process reaped"),
        Err(error) => warn!(%error, "Failed to reap child process"),
    }
}

fn spawn_reader(
    name: &str,
    mut pipe: impl Read + Send + 'static,
    kind: StreamKind,
    sink: StreamSink,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                // The sink mutex is never held across this read.
                let n = match pipe.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                };

                forward_chunk(&sink, kind, &buffer[..n]);
            }
        })
        .expect("BUG: failed to spawn pipe reader thread")
}

/// Writes one framed chunk to the current stream sink, if any. The lock spans
/// exactly the two writes, so chunks from the two readers never interleave
/// mid-frame. Write failures drop the chunk; a replacement sink may be
/// installed later.
fn forward_chunk(sink: &StreamSink, kind: StreamKind, chunk: &[u8]) {
    let mut guard = sink.lock();
    let Some(socket) = guard.as_mut() else {
        return;
    };

    let mut header = BytesMut::with_capacity(StreamHeader::SIZE);
    StreamHeader::new(kind, chunk.len() as u32).encode(&mut header);

    let sent = socket.write_all(&header).and_then(|()| socket.write_all(chunk));
    if let Err(error) = sent {
        debug!(%error, "Stream chunk dropped");
    }
}
