//! Table of live sessions, admission accounting and the idle sweep.
//!
//! Every mutation happens under one `parking_lot::Mutex` that is never held
//! across an await. Admission counters change only when a session enters or
//! leaves the table, so each session is counted and uncounted exactly once.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{SessionError, SessionResult},
    metrics::{Metrics, SessionGauges},
    pty::{ProcessExit, ProcessSpec, PtyProcess, TerminalCaps},
    session::{
        spawn_output_pump, ConnectionId, ExitSink, OutputStream, Session, SessionHandle,
        SessionId, SessionState, SessionSummary,
    },
    token::{ReconnectToken, TokenIssuer},
};

/// How many reaped session ids are remembered for `session_reaped` replies.
const REAPED_MEMORY: usize = 4096;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub per_origin_cap: usize,
    pub global_cap: usize,
    pub ring_max_bytes: usize,
    pub ring_max_frames: usize,
    pub disconnect_grace: Duration,
    pub idle_threshold: Duration,
    pub token_ttl: Duration,
    pub read_only: bool,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            per_origin_cap: config.per_origin_cap,
            global_cap: config.global_cap,
            ring_max_bytes: config.ring_max_bytes,
            ring_max_frames: config.ring_max_frames,
            disconnect_grace: config.disconnect_grace,
            idle_threshold: config.idle_threshold,
            token_ttl: config.token_ttl,
            read_only: config.read_only,
        }
    }
}

/// What every session runs.
#[derive(Debug, Clone)]
pub struct Launch {
    pub spec: ProcessSpec,
    pub caps: TerminalCaps,
}

impl Launch {
    pub fn from_config(config: &Config) -> Self {
        Self {
            spec: config.process_spec(),
            caps: config.terminal_caps(),
        }
    }
}

/// Result of a successful create or resume.
#[derive(Debug)]
pub struct Attached {
    pub handle: SessionHandle,
    pub conn: ConnectionId,
    /// Cancelled when this connection must stop serving the session.
    pub evicted: CancellationToken,
    pub token: ReconnectToken,
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Exited,
    Closed,
    Reaped,
    Shutdown,
}

impl EndReason {
    fn label(&self) -> &'static str {
        match self {
            EndReason::Exited => "process exited",
            EndReason::Closed => "closed",
            EndReason::Reaped => "reaped",
            EndReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub idled: usize,
    pub reaped: usize,
    pub remaining: usize,
    pub tokens_pruned: usize,
}

/// Bounded memory of reaped ids, oldest forgotten first.
#[derive(Debug, Default)]
struct ReapedLog {
    order: VecDeque<SessionId>,
    ids: HashSet<SessionId>,
}

impl ReapedLog {
    fn insert(&mut self, id: SessionId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > REAPED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &SessionId) -> bool {
        self.ids.contains(id)
    }
}

/// Admission slot held across a spawn. Dropping it without `commit`
/// gives the slot back.
struct Reservation {
    shared: Arc<Shared>,
    origin: IpAddr,
    held: bool,
}

impl Reservation {
    /// Hands the origin slot over to the registered session.
    fn commit(mut self, inner: &mut Inner) {
        inner.pending = inner.pending.saturating_sub(1);
        self.held = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let mut inner = self.shared.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
        release_origin(&mut inner.per_origin, self.origin);
    }
}

/// Decrements the admission count of `origin`. Returns `false` if there was
/// nothing to release.
fn release_origin(per_origin: &mut HashMap<IpAddr, usize>, origin: IpAddr) -> bool {
    match per_origin.get_mut(&origin) {
        Some(count) if *count > 0 => {
            *count -= 1;
            if *count == 0 {
                per_origin.remove(&origin);
            }
            true
        }
        _ => false,
    }
}

#[derive(Debug)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    per_origin: HashMap<IpAddr, usize>,
    tokens: TokenIssuer,
    reaped: ReapedLog,
    /// Slots reserved by creates whose process is still being spawned.
    pending: usize,
}

#[derive(Debug)]
struct Shared {
    settings: RegistrySettings,
    launch: Launch,
    metrics: Arc<Metrics>,
    next_conn: AtomicU64,
    inner: Mutex<Inner>,
}

/// Cloneable handle to the session table.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

fn short_id(id: &SessionId) -> String {
    id.simple().to_string()[..8].to_string()
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings, launch: Launch, metrics: Arc<Metrics>) -> Self {
        let tokens = TokenIssuer::new(settings.token_ttl);
        Self {
            shared: Arc::new(Shared {
                settings,
                launch,
                metrics,
                next_conn: AtomicU64::new(1),
                inner: Mutex::new(Inner {
                    sessions: HashMap::new(),
                    per_origin: HashMap::new(),
                    tokens,
                    reaped: ReapedLog::default(),
                    pending: 0,
                }),
            }),
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::new(
            RegistrySettings::from_config(config),
            Launch::from_config(config),
            metrics,
        )
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.shared.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    fn next_conn(&self) -> ConnectionId {
        self.shared.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Admits a new session for `origin` and attaches the caller to it.
    ///
    /// The admission slot is reserved under the lock, the process is spawned
    /// on the blocking pool without it, and the session is registered under
    /// the lock again. If anything fails in between the reservation is
    /// released, so either the session is fully registered or nothing changes.
    pub async fn create_session(
        &self,
        origin: IpAddr,
        size: Option<(u16, u16)>,
    ) -> SessionResult<Attached> {
        let shared = &self.shared;
        let settings = &shared.settings;
        let reservation = self.reserve(origin)?;

        let id = Uuid::new_v4();
        let caps = match size {
            Some((rows, cols)) if rows > 0 && cols > 0 => {
                shared.launch.caps.clone().with_size(rows, cols)
            }
            _ => shared.launch.caps.clone(),
        };
        let spec = shared.launch.spec.clone();
        let label = short_id(&id);
        let spawned =
            tokio::task::spawn_blocking(move || PtyProcess::spawn(&label, &spec, &caps)).await;
        let pty = match spawned {
            Ok(Ok(pty)) => pty,
            Ok(Err(e)) => {
                shared.metrics.spawn_failed();
                error!("[registry] Failed to spawn session for {}: {}", origin, e);
                return Err(e.into());
            }
            Err(e) => {
                error!("[registry] Spawn task for {} failed: {}", origin, e);
                return Err(SessionError::Internal(format!("spawn task failed: {}", e)));
            }
        };
        let Some(output_rx) = pty.take_output() else {
            return Err(SessionError::Internal(
                "pty output already taken".to_string(),
            ));
        };
        let exit_rx = pty.exit_watch();

        let now = Instant::now();
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;
        if inner.sessions.contains_key(&id) {
            error!("[registry] Session id collision for {}", id);
            return Err(SessionError::Internal(format!(
                "session {} already registered",
                id
            )));
        }

        let output = OutputStream::new(settings.ring_max_bytes, settings.ring_max_frames);
        let mut session = Session::new(id, origin, settings.read_only, pty, output, now);
        let conn = self.next_conn();
        let evicted = session.attach(conn, now);
        session.pump = Some(spawn_output_pump(
            id,
            output_rx,
            exit_rx,
            Arc::clone(&session.output),
            Arc::clone(&shared.metrics),
            Arc::downgrade(shared),
        ));
        let handle = session.handle();
        let token = inner.tokens.issue(id);

        reservation.commit(inner);
        inner.sessions.insert(id, session);
        shared.metrics.session_created();
        shared.publish_gauges(inner);

        info!(
            "[registry] Created session {} for {} ({}/{} from origin, {}/{} total)",
            id,
            origin,
            inner.per_origin.get(&origin).copied().unwrap_or(0),
            settings.per_origin_cap,
            inner.sessions.len(),
            settings.global_cap
        );

        Ok(Attached {
            handle,
            conn,
            evicted,
            token,
            resumed: false,
        })
    }

    /// Checks both caps and holds a slot for `origin` until the session is
    /// registered or the reservation is dropped.
    fn reserve(&self, origin: IpAddr) -> SessionResult<Reservation> {
        let shared = &self.shared;
        let settings = &shared.settings;
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        if inner.sessions.len() + inner.pending >= settings.global_cap {
            shared.metrics.admission_rejected();
            warn!(
                "[registry] Rejecting session for {}: global cap {} reached",
                origin, settings.global_cap
            );
            return Err(SessionError::GlobalCapReached {
                cap: settings.global_cap,
            });
        }
        let origin_count = inner.per_origin.get(&origin).copied().unwrap_or(0);
        if origin_count >= settings.per_origin_cap {
            shared.metrics.admission_rejected();
            warn!(
                "[registry] Rejecting session for {}: per-origin cap {} reached",
                origin, settings.per_origin_cap
            );
            return Err(SessionError::OriginCapReached {
                origin,
                cap: settings.per_origin_cap,
            });
        }

        inner.pending += 1;
        *inner.per_origin.entry(origin).or_insert(0) += 1;
        Ok(Reservation {
            shared: Arc::clone(shared),
            origin,
            held: true,
        })
    }

    /// Reattaches to `session_id` with a reconnect token. The token is spent
    /// whatever the outcome. A session that is still attached is taken over
    /// and its old connection evicted.
    pub fn resume(&self, session_id: SessionId, token: &str) -> SessionResult<Attached> {
        let result = self.resume_inner(session_id, token);
        if let Err(e) = &result {
            self.shared.metrics.resume_failed();
            info!("[registry] Resume of {} rejected: {}", session_id, e);
        }
        result
    }

    fn resume_inner(&self, session_id: SessionId, token: &str) -> SessionResult<Attached> {
        let shared = &self.shared;
        let now = Instant::now();
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        if inner.reaped.contains(&session_id) {
            return Err(SessionError::SessionReaped(session_id));
        }
        let state = match inner.sessions.get(&session_id) {
            Some(session) => session.state,
            None => return Err(SessionError::UnknownSession(session_id)),
        };
        if !state.is_resumable() {
            return Err(SessionError::SessionReaped(session_id));
        }
        // Past the idle threshold the session is as good as reaped, even if
        // the sweep has not run yet.
        if let Some(since) = state.disconnected_since() {
            if now.saturating_duration_since(since) >= shared.settings.idle_threshold {
                shared.destroy(inner, session_id, EndReason::Reaped);
                return Err(SessionError::SessionReaped(session_id));
            }
        }

        inner.tokens.redeem(session_id, token, now)?;

        let conn = self.next_conn();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;
        if state == SessionState::Connected {
            info!(
                "[registry] Session {} taken over by a newer connection",
                session_id
            );
        }
        let evicted = session.attach(conn, now);
        let handle = session.handle();
        let token = inner.tokens.issue(session_id);

        shared.metrics.session_resumed();
        shared.publish_gauges(inner);
        info!("[registry] Session {} resumed ({})", session_id, state.label());

        Ok(Attached {
            handle,
            conn,
            evicted,
            token,
            resumed: true,
        })
    }

    /// Marks the session disconnected if `conn` is still its client and arms
    /// the reconnect token. Stale connections are ignored.
    pub fn disconnect(&self, session_id: SessionId, conn: ConnectionId) -> bool {
        let shared = &self.shared;
        let now = Instant::now();
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return false;
        };
        if !session.detach(conn, now) {
            return false;
        }
        inner.tokens.arm(session_id, now);
        shared.publish_gauges(inner);
        info!("[registry] Session {} disconnected", session_id);
        true
    }

    pub fn touch(&self, session_id: SessionId) {
        if let Some(session) = self.shared.inner.lock().sessions.get_mut(&session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Ends a session on request.
    pub fn close(&self, session_id: SessionId) -> SessionResult<()> {
        let mut guard = self.shared.inner.lock();
        if self
            .shared
            .destroy(&mut guard, session_id, EndReason::Closed)
        {
            Ok(())
        } else {
            Err(SessionError::UnknownSession(session_id))
        }
    }

    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Instant::now())
    }

    /// Moves disconnected sessions to idle after the grace period and reaps
    /// them once the idle threshold has passed since disconnect.
    pub fn sweep_at(&self, now: Instant) -> SweepStats {
        let shared = &self.shared;
        let settings = &shared.settings;
        let mut guard = shared.inner.lock();
        let mut stats = SweepStats::default();
        let mut doomed = Vec::new();

        for session in guard.sessions.values_mut() {
            let Some(since) = session.state.disconnected_since() else {
                continue;
            };
            let idle_for = now.saturating_duration_since(since);
            if idle_for >= settings.idle_threshold {
                session.state = SessionState::Reaping;
                doomed.push(session.id);
            } else if idle_for >= settings.disconnect_grace
                && matches!(session.state, SessionState::Disconnected { .. })
            {
                session.state = SessionState::Idle { since };
                stats.idled += 1;
                debug!("[sweep] Session {} is idle", session.id);
            }
        }

        for id in doomed {
            if shared.destroy(&mut guard, id, EndReason::Reaped) {
                stats.reaped += 1;
            }
        }
        stats.tokens_pruned = guard.tokens.prune(now);
        stats.remaining = guard.sessions.len();
        shared.publish_gauges(&guard);
        stats
    }

    /// Destroys every session.
    pub fn shutdown(&self) {
        let mut guard = self.shared.inner.lock();
        let ids: Vec<SessionId> = guard.sessions.keys().copied().collect();
        for id in ids {
            self.shared.destroy(&mut guard, id, EndReason::Shutdown);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, session_id: SessionId) -> Option<SessionState> {
        self.shared
            .inner
            .lock()
            .sessions
            .get(&session_id)
            .map(Session::state)
    }

    pub fn origin_count(&self, origin: IpAddr) -> usize {
        self.shared
            .inner
            .lock()
            .per_origin
            .get(&origin)
            .copied()
            .unwrap_or(0)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let guard = self.shared.inner.lock();
        let mut sessions: Vec<SessionSummary> =
            guard.sessions.values().map(Session::summary).collect();
        sessions.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then(a.id.cmp(&b.id)));
        sessions
    }
}

impl Shared {
    /// Removes a session and releases everything it holds. Returns `false`
    /// if it was already gone, in which case nothing is counted.
    fn destroy(&self, inner: &mut Inner, id: SessionId, reason: EndReason) -> bool {
        let Some(mut session) = inner.sessions.remove(&id) else {
            return false;
        };
        session.teardown(reason == EndReason::Exited);

        if !release_origin(&mut inner.per_origin, session.origin) {
            error!(
                "[registry] Admission counter for {} missing while destroying {}",
                session.origin, id
            );
        }
        inner.tokens.revoke(id);

        match reason {
            EndReason::Reaped => {
                inner.reaped.insert(id);
                self.metrics.session_reaped();
            }
            EndReason::Exited => self.metrics.session_exited(),
            EndReason::Closed | EndReason::Shutdown => {}
        }
        self.publish_gauges(inner);
        info!(
            "[registry] Session {} destroyed ({}), {} remaining",
            id,
            reason.label(),
            inner.sessions.len()
        );
        true
    }

    fn publish_gauges(&self, inner: &Inner) {
        let mut gauges = SessionGauges {
            active: inner.sessions.len() as u64,
            ..SessionGauges::default()
        };
        for session in inner.sessions.values() {
            match session.state {
                SessionState::Connected => gauges.connected += 1,
                SessionState::Disconnected { .. } => gauges.disconnected += 1,
                SessionState::Idle { .. } => gauges.idle += 1,
                SessionState::Reaping => {}
            }
        }
        self.metrics.set_sessions(gauges);
    }
}

impl ExitSink for Shared {
    fn process_exited(&self, id: SessionId, exit: ProcessExit) {
        let mut guard = self.inner.lock();
        if self.destroy(&mut guard, id, EndReason::Exited) {
            debug!(
                "[registry] Session {} ended with exit code {:?}",
                id, exit.code
            );
        }
    }
}

/// Runs [`SessionRegistry::sweep`] every `interval` until `cancel` fires.
pub fn spawn_sweeper(
    registry: SessionRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!("[sweep] Started (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = registry.sweep();
                    if stats.reaped > 0 || stats.idled > 0 {
                        info!(
                            "[sweep] reaped={} idled={} remaining={}",
                            stats.reaped, stats.idled, stats.remaining
                        );
                    } else {
                        debug!("[sweep] remaining={}", stats.remaining);
                    }
                }
            }
        }
        info!("[sweep] Stopped");
    })
}
