//! Resumable PTY sessions streamed over WebSocket.
//!
//! Each client connection is bound to a session: a child process on a
//! pseudo-terminal plus a bounded replay buffer of its output. Sessions
//! survive client disconnects and can be resumed with a single-use reconnect
//! token until the idle sweep reaps them.

pub mod auth;
pub mod config;
pub mod error;
pub mod fault;
pub mod handler;
pub mod input;
pub mod metrics;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod ring;
pub mod server;
pub mod session;
pub mod token;

pub use config::Config;
pub use error::{SessionError, SessionResult};
pub use metrics::Metrics;
pub use registry::{RegistrySettings, SessionRegistry};
pub use ring::RingBuffer;
pub use server::{build_metrics_router, build_router, run, serve, AppState};
pub use session::{SessionId, SessionState};
