//! Child process attached to a pseudo-terminal.
//!
//! [`PtyProcess::spawn`] owns everything it creates: the PTY pair, the child,
//! and three blocking threads (reader, writer, waiter). On any failure after
//! the child started, the child is killed and reaped before the error is
//! returned; file handles close when their owners drop.

use std::{
    io::{Read, Write},
    path::PathBuf,
    thread,
};

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const PTY_OUTPUT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("failed to set up pty i/o: {0}")]
    Io(String),

    #[error("failed to resize pty: {0}")]
    Resize(String),

    #[error("pty input closed")]
    InputClosed,
}

/// What to run inside the terminal.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Capability flags passed to the child at spawn time.
#[derive(Debug, Clone)]
pub struct TerminalCaps {
    pub rows: u16,
    pub cols: u16,
    pub term: String,
    pub lang: String,
    pub truecolor: bool,
}

impl TerminalCaps {
    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn pty_size(&self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<u32>,
    pub success: bool,
}

impl ProcessExit {
    /// Exit status could not be collected.
    pub const UNKNOWN: ProcessExit = ProcessExit {
        code: None,
        success: false,
    };
}

/// Kills and reaps the child if it is dropped while still armed.
struct ChildGuard(Option<Box<dyn Child + Send>>);

impl ChildGuard {
    fn take(&mut self) -> Option<Box<dyn Child + Send>> {
        self.0.take()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub struct PtyProcess {
    label: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    size: Mutex<(u16, u16)>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("size", &*self.size.lock())
            .finish()
    }
}

impl PtyProcess {
    /// Allocates a PTY sized from `caps`, starts `spec` on it and wires up
    /// the I/O threads. `label` only prefixes log lines.
    pub fn spawn(label: &str, spec: &ProcessSpec, caps: &TerminalCaps) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(caps.pty_size())
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", &caps.term);
        cmd.env("LANG", &caps.lang);
        cmd.env("LC_ALL", &caps.lang);
        if caps.truecolor {
            cmd.env("COLORTERM", "truecolor");
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| PtyError::Spawn {
            command: spec.command.clone(),
            reason: e.to_string(),
        })?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let mut guard = ChildGuard(Some(child));
        let pid = guard.0.as_ref().and_then(|child| child.process_id());
        let killer = match guard.0.as_ref() {
            Some(child) => child.clone_killer(),
            None => return Err(PtyError::Io("child handle missing".to_string())),
        };

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Io(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Io(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(PTY_OUTPUT_CHANNEL_SIZE);
        let (input_tx, input_rx) = mpsc::channel(PTY_INPUT_CHANNEL_SIZE);
        let (exit_tx, exit_rx) = watch::channel(None);

        spawn_reader_thread(label, reader, output_tx)?;
        spawn_writer_thread(label, writer, input_rx)?;

        // The guard moves into the waiter; if the thread cannot start, the
        // closure drops and the guard kills the child.
        let waiter_label = label.to_string();
        thread::Builder::new()
            .name(format!("pty-wait-{}", label))
            .spawn(move || {
                let Some(mut child) = guard.take() else {
                    return;
                };
                let exit = match child.wait() {
                    Ok(status) => ProcessExit {
                        code: Some(status.exit_code()),
                        success: status.success(),
                    },
                    Err(e) => {
                        error!("[pty:{}] Failed to wait for child: {}", waiter_label, e);
                        ProcessExit::UNKNOWN
                    }
                };
                info!(
                    "[pty:{}] Process exited (code: {:?})",
                    waiter_label, exit.code
                );
                exit_tx.send_replace(Some(exit));
            })
            .map_err(|e| PtyError::Io(e.to_string()))?;

        info!(
            "[pty:{}] Spawned '{}' (pid: {:?}, size: {}x{})",
            label, spec.command, pid, caps.cols, caps.rows
        );

        Ok(Self {
            label: label.to_string(),
            pid,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            output_rx: Mutex::new(Some(output_rx)),
            exit_rx,
            size: Mutex::new((caps.rows, caps.cols)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues input for the writer thread, waiting while the queue is full.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| PtyError::InputClosed)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        *self.size.lock() = (rows, cols);
        debug!("[pty:{}] Resized to {}x{}", self.label, cols, rows);
        Ok(())
    }

    /// Last applied size as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    /// Hands out the output receiver. Only the first call gets it.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.lock().take()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves once the process has terminated.
    pub async fn wait_exit(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit::UNKNOWN),
            Err(_) => ProcessExit::UNKNOWN,
        };
        exit
    }

    pub fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = self.killer.lock().kill() {
            debug!("[pty:{}] Kill failed (already gone?): {}", self.label, e);
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_reader_thread(
    label: &str,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Bytes>,
) -> Result<(), PtyError> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("pty-read-{}", label))
        .spawn(move || {
            let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
            let mut total_bytes: usize = 0;
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        total_bytes += n;
                        if output_tx
                            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is the normal end of a PTY once the child is gone.
                        debug!("[reader:{}] Read ended: {}", label, e);
                        break;
                    }
                }
            }
            debug!(
                "[reader:{}] Reader thread finished ({} bytes)",
                label, total_bytes
            );
        })
        .map(|_| ())
        .map_err(|e| PtyError::Io(e.to_string()))
}

fn spawn_writer_thread(
    label: &str,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) -> Result<(), PtyError> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("pty-write-{}", label))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                    if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                        warn!(
                            "[writer:{}] Write error: {} (errno: {:?})",
                            label,
                            e,
                            e.raw_os_error()
                        );
                        return;
                    }
                    // Let the PTY drain between chunks.
                    thread::yield_now();
                }
            }
            debug!("[writer:{}] Writer thread finished (channel closed)", label);
        })
        .map(|_| ())
        .map_err(|e| PtyError::Io(e.to_string()))
}
