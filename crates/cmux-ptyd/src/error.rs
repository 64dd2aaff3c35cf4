use std::net::IpAddr;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{protocol::ErrorCode, pty::PtyError, session::SessionId, token::TokenError};

/// Failures of registry operations. Each maps onto one wire [`ErrorCode`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("global session cap reached ({cap})")]
    GlobalCapReached { cap: usize },

    #[error("session cap for {origin} reached ({cap})")]
    OriginCapReached { origin: IpAddr, cap: usize },

    #[error("session not found: {0}")]
    UnknownSession(SessionId),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("reconnect token does not match session")]
    TokenMismatch,

    #[error("reconnect token already used")]
    TokenReused,

    #[error("reconnect token expired")]
    TokenExpired,

    #[error("session {0} was reaped after idling")]
    SessionReaped(SessionId),

    #[error(transparent)]
    Spawn(#[from] PtyError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for SessionError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Mismatch => SessionError::TokenMismatch,
            TokenError::AlreadyUsed => SessionError::TokenReused,
            TokenError::Expired => SessionError::TokenExpired,
        }
    }
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::GlobalCapReached { .. } | SessionError::OriginCapReached { .. } => {
                ErrorCode::AdmissionRejected
            }
            SessionError::UnknownSession(_) => ErrorCode::SessionNotFound,
            SessionError::InvalidSessionId(_) => ErrorCode::BadRequest,
            SessionError::TokenMismatch => ErrorCode::TokenMismatch,
            SessionError::TokenReused => ErrorCode::TokenReused,
            SessionError::TokenExpired => ErrorCode::TokenExpired,
            SessionError::SessionReaped(_) => ErrorCode::SessionReaped,
            SessionError::Spawn(_) => ErrorCode::SpawnFailed,
            SessionError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Only internal errors end the affected connection for reasons other
    /// than the client's request.
    pub fn is_internal(&self) -> bool {
        matches!(self, SessionError::Internal(_))
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::SessionNotFound | ErrorCode::SessionReaped => StatusCode::NOT_FOUND,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::TokenMismatch | ErrorCode::TokenReused | ErrorCode::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: ErrorCode,
    message: String,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
