//! Pseudo-terminal process handling.
//!
//! A [`PtyProcess`] owns one child process attached to a fresh
//! pseudo-terminal. Reads, writes and waits are blocking at the OS level,
//! so they run on tokio's blocking pool and never stall the async workers.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use webshell_protocol::TerminalSize;

/// Buffer size for reading from the PTY.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The process could not be started.
    #[error("failed to spawn PTY process: {0}")]
    SpawnFailed(String),

    /// The PTY handle has already been released.
    #[error("PTY is closed")]
    Closed,

    /// I/O error on the PTY.
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run inside the pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory, the daemon's own when `None`.
    pub cwd: Option<PathBuf>,
    /// Geometry before the first resize.
    pub size: TerminalSize,
}

impl PtyCommand {
    /// A command with no arguments and the default 24x80 geometry.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            size: TerminalSize::default(),
        }
    }
}

/// A child process attached to a pseudo-terminal.
pub struct PtyProcess {
    /// The PTY master handle, `None` once closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// Input side of the PTY, `None` once closed. Held by a blocking write
    /// for as long as the write takes.
    writer: Arc<AsyncMutex<Option<Box<dyn Write + Send>>>>,

    /// Set by [`PtyProcess::close`]; a write that finishes afterwards drops
    /// the input handle itself.
    input_closed: Arc<AtomicBool>,

    /// Output side of the PTY.
    reader: Arc<Mutex<Box<dyn Read + Send>>>,

    /// The child, taken by [`PtyProcess::wait`].
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,

    /// Kills the child without holding the `child` lock.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Set once the child has been reaped.
    exited: Arc<AtomicBool>,

    /// Set once a kill has been sent.
    terminated: AtomicBool,

    /// Current terminal size.
    size: Mutex<TerminalSize>,

    /// Process ID.
    pid: Option<u32>,
}

/// Locks a std mutex, recovering the guard if a previous holder panicked.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyProcess {
    /// Starts `command` on a new pseudo-terminal, inheriting the environment.
    pub fn spawn(command: &PtyCommand) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(command.size))
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);

        // portable-pty defaults to $HOME, not the caller's directory
        let cwd = command
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok());
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // The master only sees EOF once every slave handle is gone
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        tracing::debug!(
            program = %command.program,
            pid = ?pid,
            rows = command.size.rows,
            cols = command.size.cols,
            "Spawned PTY process"
        );

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            writer: Arc::new(AsyncMutex::new(Some(writer))),
            input_closed: Arc::new(AtomicBool::new(false)),
            reader: Arc::new(Mutex::new(reader)),
            child: Arc::new(Mutex::new(Some(child))),
            killer: Mutex::new(killer),
            exited: Arc::new(AtomicBool::new(false)),
            terminated: AtomicBool::new(false),
            size: Mutex::new(command.size),
            pid,
        })
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    /// Returns whether the child has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Reads the next chunk of terminal output.
    ///
    /// Returns `Ok(None)` at end of file, which is how the PTY reports that
    /// the child and every other slave handle are gone.
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>, PtyError> {
        let reader = Arc::clone(&self.reader);

        let result = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let mut reader = lock(&reader);
            match reader.read(&mut buffer) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(Some(buffer))
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))?;

        match result {
            Ok(chunk) => Ok(chunk),
            // Linux reports a hung-up slave as EIO instead of EOF
            Err(e) if e.raw_os_error() == Some(5) => Ok(None),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Writes input to the child.
    ///
    /// Blocks (off the async workers) while the child is not reading and the
    /// terminal input queue is full. Killing the child makes such a write fail.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut guard = Arc::clone(&self.writer).lock_owned().await;
        let input_closed = Arc::clone(&self.input_closed);
        if input_closed.load(Ordering::SeqCst) {
            guard.take();
            return Err(PtyError::Closed);
        }
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            let writer = guard.as_mut().ok_or(PtyError::Closed)?;
            let result = writer.write_all(&data).and_then(|()| writer.flush());
            if input_closed.load(Ordering::SeqCst) {
                guard.take();
            }
            result?;
            Ok::<_, PtyError>(())
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))?
    }

    /// Changes the terminal geometry.
    pub fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(PtyError::Closed)?;

        master
            .resize(pty_size(size))
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;

        *lock(&self.size) = size;

        tracing::debug!(rows = size.rows, cols = size.cols, "Resized PTY");
        Ok(())
    }

    /// Sends the child a kill signal if it is still running.
    ///
    /// Safe to call any number of times; only the first call signals.
    pub fn terminate(&self) {
        if self.has_exited() || self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = lock(&self.killer).kill() {
            // The child usually exited on its own between the check and the kill
            tracing::trace!(pid = ?self.pid, error = %e, "Kill failed");
        } else {
            tracing::debug!(pid = ?self.pid, "Sent kill to PTY process");
        }
    }

    /// Waits for the child to exit and returns its exit code.
    ///
    /// Only the first caller waits; later calls fail with [`PtyError::Closed`].
    pub async fn wait(&self) -> Result<u32, PtyError> {
        let child = lock(&self.child).take().ok_or(PtyError::Closed)?;
        let exited = Arc::clone(&self.exited);

        tokio::task::spawn_blocking(move || {
            let mut child = child;
            let status = child.wait()?;
            exited.store(true, Ordering::SeqCst);
            Ok::<_, PtyError>(status.exit_code())
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))?
    }

    /// Releases the PTY master and input handles.
    ///
    /// Further writes and resizes fail with [`PtyError::Closed`]. Never waits:
    /// an input handle held by an in-flight write is left to that write, which
    /// fails once the child is gone. Idempotent.
    pub fn close(&self) {
        self.input_closed.store(true, Ordering::SeqCst);
        let master = lock(&self.master).take();
        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                tracing::trace!(pid = ?self.pid, "PTY input busy, leaving it to the pending write");
                None
            }
        };
        if master.is_some() || writer.is_some() {
            tracing::trace!(pid = ?self.pid, "Released PTY handles");
        }
    }

    /// Whether the input handle has been released.
    pub async fn is_input_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}
