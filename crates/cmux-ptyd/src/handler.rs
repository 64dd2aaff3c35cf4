//! WebSocket endpoint: fault injection, auth, session binding and the
//! per-connection loop.
//!
//! Each connection is served by one task. Output is pulled from the bound
//! session's ring by sequence number whenever its watch channel reports new
//! frames, so replay and live output never overlap.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::presented_credential,
    error::SessionError,
    fault::FaultMode,
    input::{classify, InputClass, NoticeLimiter, READ_ONLY_CLOSE_NOTICE, READ_ONLY_NOTICE},
    protocol::{
        decode_client, encode_output, encode_server, ErrorCode, Inbound, ServerMessage, WireFrame,
    },
    pty::{ProcessExit, PtyError},
    registry::Attached,
    server::AppState,
    session::{ConnectionId, SessionHandle, SessionId, SessionState, StreamState},
};

/// Per-request fault override header, honored only when overrides are enabled.
pub const FAULT_HEADER: &str = "x-ptyd-fault";
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub session: Option<String>,
    pub token: Option<String>,
    pub auth: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub fault: Option<String>,
}

#[derive(Debug)]
enum Target {
    New { size: Option<(u16, u16)> },
    Resume { session: String, token: String },
    Invalid(&'static str),
}

impl Target {
    fn from_params(params: ConnectParams) -> Self {
        match (params.session, params.token) {
            (Some(session), Some(token)) => Target::Resume { session, token },
            (Some(_), None) | (None, Some(_)) => {
                Target::Invalid("resuming requires both session and token")
            }
            (None, None) => Target::New {
                size: params.rows.zip(params.cols),
            },
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let origin = client_origin(&headers, peer, state.config.trust_forwarded_for);
    let requested_fault = headers
        .get(FAULT_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(params.fault.as_deref());
    let fault = state.fault.resolve(requested_fault);
    let authorized = state
        .auth
        .authenticate(presented_credential(&headers, params.auth.as_deref()));
    let target = Target::from_params(params);

    debug!("[ws:{}] Upgrade request (peer: {})", origin, peer);
    ws.on_upgrade(move |socket| handle_socket(socket, state, origin, fault, authorized, target))
}

/// The first `X-Forwarded-For` hop when trusted, otherwise the peer address.
pub fn client_origin(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    origin: IpAddr,
    fault: FaultMode,
    authorized: bool,
    target: Target,
) {
    let (sender, receiver) = socket.split();
    let limiter = NoticeLimiter::new(state.config.notice_interval);
    let mut conn = Connection {
        state,
        origin,
        sender,
        receiver,
        limiter,
    };

    if let Err(refusal) = fault.admit().await {
        conn.state.metrics.fault_refused();
        info!("[ws:{}] {}", origin, refusal);
        conn.reject(ErrorCode::Unavailable, refusal.to_string()).await;
        return;
    }

    if !authorized {
        conn.state.metrics.auth_failed();
        warn!("[ws:{}] Authentication failed", origin);
        conn.reject(ErrorCode::AuthFailed, "authentication failed").await;
        return;
    }

    let attached = match conn.establish(target).await {
        Ok(attached) => attached,
        Err((code, message)) => {
            conn.reject(code, message).await;
            return;
        }
    };

    conn.serve(attached).await;
}

/// The session a connection is currently serving.
struct Binding {
    handle: SessionHandle,
    conn: ConnectionId,
    evicted: CancellationToken,
    stream: watch::Receiver<StreamState>,
    next_seq: u64,
}

impl Binding {
    fn id(&self) -> SessionId {
        self.handle.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    ClientGone,
    Evicted,
    Exited,
    Closed,
    Shutdown,
    KeepaliveTimeout,
}

enum Flow {
    Continue,
    End(Ended),
}

struct Connection {
    state: Arc<AppState>,
    origin: IpAddr,
    sender: SplitSink<WebSocket, Message>,
    receiver: SplitStream<WebSocket>,
    limiter: NoticeLimiter,
}

impl Connection {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), axum::Error> {
        self.send_frame(encode_server(message)).await
    }

    async fn send_frame(&mut self, frame: WireFrame) -> Result<(), axum::Error> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data),
        };
        self.sender.send(message).await
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = self.sender.send(Message::Close(Some(frame))).await;
    }

    /// Sends an error and closes the socket.
    async fn reject(&mut self, code: ErrorCode, message: impl Into<String>) {
        let _ = self.send(&ServerMessage::error(code, message)).await;
        let close = match code {
            ErrorCode::Unavailable | ErrorCode::AdmissionRejected => close_code::AGAIN,
            ErrorCode::Internal | ErrorCode::SpawnFailed => close_code::ERROR,
            _ => close_code::POLICY,
        };
        self.close(close, code.as_str()).await;
    }

    async fn establish(&self, target: Target) -> Result<Attached, (ErrorCode, String)> {
        let registry = &self.state.registry;
        let result = match target {
            Target::New { size } => registry.create_session(self.origin, size).await,
            Target::Resume { session, token } => {
                parse_session_id(&session).and_then(|id| registry.resume(id, &token))
            }
            Target::Invalid(reason) => {
                return Err((ErrorCode::BadRequest, reason.to_string()));
            }
        };
        result.map_err(|e| {
            if e.is_internal() {
                error!("[ws:{}] {}", self.origin, e);
            }
            (e.code(), e.to_string())
        })
    }

    /// Announces the session and replays its buffer. If the client goes
    /// away meanwhile the session is detached again.
    async fn bind(&mut self, attached: Attached) -> Result<Binding, axum::Error> {
        let (id, conn) = (attached.handle.id, attached.conn);
        let result = self.announce(attached).await;
        if result.is_err() {
            self.state.registry.disconnect(id, conn);
        }
        result
    }

    async fn announce(&mut self, attached: Attached) -> Result<Binding, axum::Error> {
        let Attached {
            handle,
            conn,
            evicted,
            token,
            resumed,
        } = attached;
        let stream = handle.output().subscribe();
        let (rows, cols) = handle.size();

        self.send(&ServerMessage::Session {
            session_id: handle.id.to_string(),
            reconnect_token: token.into_string(),
            resumed,
            rows,
            cols,
        })
        .await?;

        let (frames, next_seq) = handle.output().replay();
        let bytes = frames.iter().map(|frame| frame.len()).sum();
        self.send(&ServerMessage::ReplayBegin {
            frames: frames.len(),
            bytes,
        })
        .await?;
        for frame in &frames {
            self.send_frame(encode_output(frame)).await?;
        }
        self.send(&ServerMessage::ReplayEnd { next_seq }).await?;

        info!(
            "[ws:{}] Bound to session {} (resumed: {}, replayed {} frames / {} bytes)",
            self.origin,
            handle.id,
            resumed,
            frames.len(),
            bytes
        );

        Ok(Binding {
            handle,
            conn,
            evicted,
            stream,
            next_seq,
        })
    }

    async fn serve(&mut self, attached: Attached) {
        let mut binding = match self.bind(attached).await {
            Ok(binding) => binding,
            Err(e) => {
                debug!("[ws:{}] Client gone during replay: {}", self.origin, e);
                return;
            }
        };

        let keepalive_interval = self.state.config.keepalive_interval;
        let keepalive_timeout = self.state.config.keepalive_timeout;
        let mut ping_ticker =
            time::interval_at(time::Instant::now() + keepalive_interval, keepalive_interval);
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<time::Instant> = None;
        let shutdown = self.state.shutdown.clone();

        // Output may have arrived between replay and subscription.
        let mut flow = self.flush(&mut binding).await;

        let ended = loop {
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::End(ended)) => break ended,
                Err(e) => {
                    debug!("[ws:{}] Send failed: {}", self.origin, e);
                    break Ended::ClientGone;
                }
            }

            flow = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.reject(ErrorCode::Unavailable, "server shutting down").await;
                    Ok(Flow::End(Ended::Shutdown))
                }
                _ = binding.evicted.cancelled() => self.on_evicted(&mut binding).await,
                changed = binding.stream.changed() => match changed {
                    Ok(()) => self.flush(&mut binding).await,
                    Err(_) => Ok(Flow::End(Ended::Exited)),
                },
                message = self.receiver.next() => match message {
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                        Ok(Flow::Continue)
                    }
                    Some(Ok(Message::Ping(_))) => Ok(Flow::Continue),
                    Some(Ok(Message::Text(text))) => {
                        self.on_inbound(&mut binding, decode_client(WireFrame::Text(text))).await
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.on_inbound(&mut binding, decode_client(WireFrame::Binary(data))).await
                    }
                    Some(Ok(Message::Close(reason))) => {
                        debug!("[ws:{}] Client sent close frame: {:?}", self.origin, reason);
                        Ok(Flow::End(Ended::ClientGone))
                    }
                    Some(Err(e)) => {
                        debug!("[ws:{}] WebSocket receive error: {}", self.origin, e);
                        Ok(Flow::End(Ended::ClientGone))
                    }
                    None => Ok(Flow::End(Ended::ClientGone)),
                },
                _ = ping_ticker.tick(), if pong_deadline.is_none() => {
                    pong_deadline = Some(time::Instant::now() + keepalive_timeout);
                    self.sender
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map(|_| Flow::Continue)
                }
                _ = time::sleep_until(pong_deadline.unwrap_or_else(time::Instant::now)),
                    if pong_deadline.is_some() =>
                {
                    self.state.metrics.keepalive_timed_out();
                    warn!(
                        "[ws:{}] No pong within {:?}, dropping connection",
                        self.origin, keepalive_timeout
                    );
                    Ok(Flow::End(Ended::KeepaliveTimeout))
                }
            };
        };

        if self.state.registry.disconnect(binding.id(), binding.conn) {
            info!(
                "[ws:{}] Session {} detached ({:?})",
                self.origin,
                binding.id(),
                ended
            );
        } else {
            debug!(
                "[ws:{}] Connection for session {} ended ({:?})",
                self.origin,
                binding.id(),
                ended
            );
        }
    }

    /// Sends every frame newer than the binding's watermark. Ends the
    /// connection once the process has exited and its output is sent.
    async fn flush(&mut self, binding: &mut Binding) -> Result<Flow, axum::Error> {
        let stream = *binding.stream.borrow_and_update();
        if stream.next_seq > binding.next_seq {
            let catchup = binding.handle.output().since(binding.next_seq);
            if catchup.missed > 0 {
                warn!(
                    "[ws:{}] Session {} fell behind, {} frames dropped",
                    self.origin,
                    binding.id(),
                    catchup.missed
                );
                self.send(&ServerMessage::BufferTruncated {
                    frames_dropped: catchup.missed,
                })
                .await?;
            }
            for frame in &catchup.frames {
                self.send_frame(encode_output(frame)).await?;
            }
            binding.next_seq = catchup.next_seq;
        }

        match stream.exit {
            Some(exit) => self.on_exit(binding, exit).await,
            None => Ok(Flow::Continue),
        }
    }

    async fn on_exit(&mut self, binding: &Binding, exit: ProcessExit) -> Result<Flow, axum::Error> {
        info!(
            "[ws:{}] Session {} process exited (code: {:?})",
            self.origin,
            binding.id(),
            exit.code
        );
        self.send(&ServerMessage::Exit { code: exit.code }).await?;
        self.close(close_code::NORMAL, "process exited").await;
        Ok(Flow::End(Ended::Exited))
    }

    async fn on_evicted(&mut self, binding: &mut Binding) -> Result<Flow, axum::Error> {
        // An exited process also evicts; its final output goes out first.
        let exited = binding.stream.borrow().exit.is_some();
        if exited {
            return self.flush(binding).await;
        }
        let message = match self.state.registry.state_of(binding.id()) {
            Some(SessionState::Connected) => "session attached from another connection",
            _ => "session ended",
        };
        info!(
            "[ws:{}] Session {}: {}",
            self.origin,
            binding.id(),
            message
        );
        self.send(&ServerMessage::Notice {
            message: message.to_string(),
        })
        .await?;
        self.close(close_code::NORMAL, "evicted").await;
        Ok(Flow::End(Ended::Evicted))
    }

    async fn on_inbound(
        &mut self,
        binding: &mut Binding,
        inbound: Inbound,
    ) -> Result<Flow, axum::Error> {
        match inbound {
            Inbound::Input(data) => self.on_input(binding, data).await,
            Inbound::Resize { rows, cols } => {
                if rows == 0 || cols == 0 {
                    self.send(&ServerMessage::error(
                        ErrorCode::BadRequest,
                        "rows and cols must be greater than zero",
                    ))
                    .await?;
                    return Ok(Flow::Continue);
                }
                match binding.handle.resize(rows, cols) {
                    Ok(()) => {
                        debug!("[ws:{}] Resize: {}x{}", self.origin, cols, rows);
                        self.send(&ServerMessage::ResizeAck { rows, cols }).await?;
                    }
                    Err(e) => {
                        error!("[ws:{}] Failed to resize PTY: {}", self.origin, e);
                        self.send(&ServerMessage::error(ErrorCode::Internal, e.to_string()))
                            .await?;
                    }
                }
                Ok(Flow::Continue)
            }
            Inbound::Ping => {
                self.send(&ServerMessage::Pong).await?;
                Ok(Flow::Continue)
            }
            Inbound::Resume { session, token } => {
                self.switch(binding, Target::Resume { session, token })
                    .await
            }
            Inbound::Close if binding.handle.read_only => {
                self.state.metrics.readonly_blocked();
                self.send(&ServerMessage::Notice {
                    message: READ_ONLY_CLOSE_NOTICE.to_string(),
                })
                .await?;
                Ok(Flow::Continue)
            }
            Inbound::Close => {
                let id = binding.id();
                if let Err(e) = self.state.registry.close(id) {
                    debug!("[ws:{}] Close of {}: {}", self.origin, id, e);
                }
                self.close(close_code::NORMAL, "session closed").await;
                Ok(Flow::End(Ended::Closed))
            }
        }
    }

    async fn on_input(&mut self, binding: &Binding, data: Vec<u8>) -> Result<Flow, axum::Error> {
        if data.is_empty() {
            return Ok(Flow::Continue);
        }
        if binding.handle.read_only && classify(&data) == InputClass::Mutating {
            self.state.metrics.readonly_blocked();
            if self.limiter.should_notify(Instant::now()) {
                self.send(&ServerMessage::Notice {
                    message: READ_ONLY_NOTICE.to_string(),
                })
                .await?;
            }
            return Ok(Flow::Continue);
        }

        match binding.handle.write_input(data).await {
            Ok(()) => self.state.registry.touch(binding.id()),
            // The process is exiting; the exit message follows.
            Err(PtyError::InputClosed) => {}
            Err(e) => error!("[ws:{}] Failed to write to PTY: {}", self.origin, e),
        }
        Ok(Flow::Continue)
    }

    /// Moves this connection to another session. On failure the current
    /// binding is kept.
    async fn switch(&mut self, binding: &mut Binding, target: Target) -> Result<Flow, axum::Error> {
        let attached = match self.establish(target).await {
            Ok(attached) => attached,
            Err((code, message)) => {
                self.send(&ServerMessage::error(code, message)).await?;
                return Ok(Flow::Continue);
            }
        };

        let previous = (binding.id(), binding.conn);
        if previous.0 != attached.handle.id {
            self.state.registry.disconnect(previous.0, previous.1);
        }
        // Resuming the session already bound cancelled the old binding's
        // eviction token; it is dropped here with the old binding.
        *binding = self.bind(attached).await?;
        Ok(Flow::Continue)
    }
}

fn parse_session_id(value: &str) -> Result<SessionId, SessionError> {
    Uuid::parse_str(value.trim()).map_err(|_| SessionError::InvalidSessionId(value.to_string()))
}
