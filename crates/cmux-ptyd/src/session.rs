//! One PTY process, its replay buffer and its attachment state.
//!
//! Sessions live inside the registry and are only mutated under its lock.
//! The pieces a connection needs while it runs (input, resize, output) are
//! exposed through a cloneable [`SessionHandle`] so no registry reference is
//! held across awaits.

use std::{
    net::IpAddr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    metrics::Metrics,
    pty::{ProcessExit, PtyError, PtyProcess},
    ring::{Catchup, OutputFrame, RingBuffer, RingStats},
};

pub type SessionId = Uuid;

/// Identifies one client connection over the life of the process.
pub type ConnectionId = u64;

/// After the process exits, how long to keep draining output that was
/// already read from the PTY.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// `since` is the moment the client went away.
    Disconnected { since: Instant },
    /// Past the disconnect grace; `since` is still the disconnect time.
    Idle { since: Instant },
    Reaping,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Disconnected { .. } => "disconnected",
            SessionState::Idle { .. } => "idle",
            SessionState::Reaping => "reaping",
        }
    }

    pub fn disconnected_since(&self) -> Option<Instant> {
        match self {
            SessionState::Disconnected { since } | SessionState::Idle { since } => Some(*since),
            _ => None,
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.disconnected_since().is_some() || *self == SessionState::Connected
    }
}

/// Watermark published by the output pump after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState {
    pub next_seq: u64,
    /// Set once the process has exited and its output is fully buffered.
    pub exit: Option<ProcessExit>,
}

/// Replay buffer plus a watch channel announcing new frames.
///
/// Replay and live delivery both read from the ring by sequence number, so a
/// reader that starts from the `next_seq` returned by [`replay`] sees every
/// later frame exactly once.
///
/// [`replay`]: OutputStream::replay
#[derive(Debug)]
pub struct OutputStream {
    ring: Mutex<RingBuffer>,
    state_tx: watch::Sender<StreamState>,
}

impl OutputStream {
    pub fn new(max_bytes: usize, max_frames: usize) -> Self {
        let (state_tx, _) = watch::channel(StreamState::default());
        Self {
            ring: Mutex::new(RingBuffer::new(max_bytes, max_frames)),
            state_tx,
        }
    }

    pub fn publish(&self, data: Bytes) -> crate::ring::Eviction {
        let (next_seq, eviction) = {
            let mut ring = self.ring.lock();
            let (_, eviction) = ring.append(data);
            (ring.next_seq(), eviction)
        };
        self.state_tx.send_modify(|state| state.next_seq = next_seq);
        eviction
    }

    pub fn finish(&self, exit: ProcessExit) {
        self.state_tx.send_modify(|state| state.exit = Some(exit));
    }

    /// Everything buffered, plus the sequence number live delivery resumes at.
    pub fn replay(&self) -> (Vec<OutputFrame>, u64) {
        let ring = self.ring.lock();
        (ring.drain_for_replay(), ring.next_seq())
    }

    pub fn since(&self, next_seq: u64) -> Catchup {
        self.ring.lock().since(next_seq)
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn stats(&self) -> RingStats {
        self.ring.lock().stats()
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
    }
}

/// The parts of a session a connection worker uses.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub read_only: bool,
    pty: Arc<PtyProcess>,
    output: Arc<OutputStream>,
}

impl SessionHandle {
    pub async fn write_input(&self, data: Vec<u8>) -> Result<(), PtyError> {
        self.pty.write(data).await
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty.resize(rows, cols)
    }

    pub fn size(&self) -> (u16, u16) {
        self.pty.size()
    }

    pub fn output(&self) -> &OutputStream {
        &self.output
    }
}

/// Current client of a session. Cancelling `evict` tells that client's worker
/// to stop.
#[derive(Debug)]
pub(crate) struct Attachment {
    pub(crate) conn: ConnectionId,
    pub(crate) evict: CancellationToken,
}

#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) origin: IpAddr,
    pub(crate) read_only: bool,
    pub(crate) state: SessionState,
    pub(crate) created_at: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) attachment: Option<Attachment>,
    pub(crate) pty: Arc<PtyProcess>,
    pub(crate) output: Arc<OutputStream>,
    pub(crate) pump: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        origin: IpAddr,
        read_only: bool,
        pty: PtyProcess,
        output: OutputStream,
        now: Instant,
    ) -> Self {
        Self {
            id,
            origin,
            read_only,
            state: SessionState::Connected,
            created_at: now,
            last_activity: now,
            attachment: None,
            pty: Arc::new(pty),
            output: Arc::new(output),
            pump: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            read_only: self.read_only,
            pty: Arc::clone(&self.pty),
            output: Arc::clone(&self.output),
        }
    }

    /// Binds a connection and returns the token its worker watches for
    /// eviction. Any previous attachment is evicted.
    pub(crate) fn attach(&mut self, conn: ConnectionId, now: Instant) -> CancellationToken {
        if let Some(previous) = self.attachment.take() {
            previous.evict.cancel();
        }
        let evict = CancellationToken::new();
        self.attachment = Some(Attachment {
            conn,
            evict: evict.clone(),
        });
        self.state = SessionState::Connected;
        self.last_activity = now;
        evict
    }

    /// Unbinds `conn` if it is still the attached connection.
    pub(crate) fn detach(&mut self, conn: ConnectionId, now: Instant) -> bool {
        match &self.attachment {
            Some(attachment) if attachment.conn == conn => {
                self.attachment = None;
                self.state = SessionState::Disconnected { since: now };
                self.last_activity = now;
                true
            }
            _ => false,
        }
    }

    /// Stops the attached worker (if any) and the process. Buffered output
    /// is dropped unless `keep_output` is set, which lets an attached worker
    /// flush the final output of an exited process.
    pub(crate) fn teardown(&mut self, keep_output: bool) {
        self.state = SessionState::Reaping;
        if let Some(attachment) = self.attachment.take() {
            attachment.evict.cancel();
        }
        self.pty.terminate();
        if !keep_output {
            self.output.clear();
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let (rows, cols) = self.pty.size();
        SessionSummary {
            id: self.id.to_string(),
            state: self.state.label(),
            origin: self.origin.to_string(),
            read_only: self.read_only,
            pid: self.pty.pid(),
            rows,
            cols,
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.last_activity.elapsed().as_secs(),
            ring: self.output.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: &'static str,
    pub origin: String,
    pub read_only: bool,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub ring: RingStats,
}

/// Receives the notification that a session's process exited.
pub(crate) trait ExitSink: Send + Sync + 'static {
    fn process_exited(&self, id: SessionId, exit: ProcessExit);
}

/// Moves PTY output into the session's ring until the process exits, then
/// tells `sink` (held weakly so a dropped registry does not stay alive).
pub(crate) fn spawn_output_pump<S: ExitSink>(
    id: SessionId,
    mut output_rx: mpsc::Receiver<Bytes>,
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
    output: Arc<OutputStream>,
    metrics: Arc<Metrics>,
    sink: Weak<S>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("[session:{}] Output pump started", id);
        let mut exit = None;

        loop {
            tokio::select! {
                chunk = output_rx.recv() => match chunk {
                    Some(data) => {
                        let len = data.len();
                        let eviction = output.publish(data);
                        metrics.record_output(len, eviction);
                    }
                    None => break,
                },
                changed = exit_rx.changed(), if exit.is_none() => {
                    if changed.is_err() {
                        exit = Some(ProcessExit::UNKNOWN);
                    } else {
                        exit = *exit_rx.borrow();
                    }
                    if exit.is_some() {
                        break;
                    }
                }
            }
        }

        // Output read before the exit may still be queued.
        let drain = async {
            while let Some(data) = output_rx.recv().await {
                let len = data.len();
                let eviction = output.publish(data);
                metrics.record_output(len, eviction);
            }
        };
        let _ = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain).await;

        let exit = match exit {
            Some(exit) => exit,
            None => match exit_rx.wait_for(Option::is_some).await {
                Ok(exit) => (*exit).unwrap_or(ProcessExit::UNKNOWN),
                Err(_) => ProcessExit::UNKNOWN,
            },
        };

        info!(
            "[session:{}] Process finished (code: {:?}), output closed",
            id, exit.code
        );
        output.finish(exit);
        if let Some(sink) = sink.upgrade() {
            sink.process_exited(id, exit);
        }
    })
}
