//! Wire messages between clients and the server.
//!
//! Raw terminal bytes travel in binary frames. Control messages are JSON text
//! frames tagged by `type`. Text that does not parse as a control message is
//! treated as raw input, matching what terminal front ends send when typing.

use serde::{Deserialize, Serialize};

use crate::ring::OutputFrame;

/// Transport-neutral frame; the handler maps it onto WebSocket messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Resume { session: String, token: String },
    Ping,
    /// Ends the session and its process.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    AdmissionRejected,
    SessionNotFound,
    TokenMismatch,
    TokenReused,
    TokenExpired,
    SessionReaped,
    SpawnFailed,
    Unavailable,
    BadRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::AdmissionRejected => "admission_rejected",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::TokenMismatch => "token_mismatch",
            ErrorCode::TokenReused => "token_reused",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::SessionReaped => "session_reaped",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Internal => "internal",
        }
    }

    /// The presented reconnect token cannot be used again.
    pub fn is_token_invalid(&self) -> bool {
        matches!(
            self,
            ErrorCode::TokenMismatch | ErrorCode::TokenReused | ErrorCode::TokenExpired
        )
    }

    /// The session is gone; the client should start a new one.
    pub fn needs_new_session(&self) -> bool {
        matches!(self, ErrorCode::SessionNotFound | ErrorCode::SessionReaped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Session {
        session_id: String,
        reconnect_token: String,
        resumed: bool,
        rows: u16,
        cols: u16,
    },
    ReplayBegin {
        frames: usize,
        bytes: usize,
    },
    ReplayEnd {
        next_seq: u64,
    },
    ResizeAck {
        rows: u16,
        cols: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
    Notice {
        message: String,
    },
    BufferTruncated {
        frames_dropped: u64,
    },
    Exit {
        code: Option<u32>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Input(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Resume { session: String, token: String },
    Ping,
    Close,
}

pub fn decode_client(frame: WireFrame) -> Inbound {
    match frame {
        WireFrame::Binary(data) => Inbound::Input(data),
        WireFrame::Text(text) => {
            if text.starts_with('{') {
                if let Ok(message) = serde_json::from_str::<ClientMessage>(&text) {
                    return match message {
                        ClientMessage::Input { data } => Inbound::Input(data.into_bytes()),
                        ClientMessage::Resize { rows, cols } => Inbound::Resize { rows, cols },
                        ClientMessage::Resume { session, token } => {
                            Inbound::Resume { session, token }
                        }
                        ClientMessage::Ping => Inbound::Ping,
                        ClientMessage::Close => Inbound::Close,
                    };
                }
            }
            Inbound::Input(text.into_bytes())
        }
    }
}

pub fn encode_server(message: &ServerMessage) -> WireFrame {
    // Every variant holds plain strings and integers, so this cannot fail.
    let json = serde_json::to_string(message).unwrap_or_else(|_| {
        r#"{"type":"error","code":"internal","message":"encode failed"}"#.to_string()
    });
    WireFrame::Text(json)
}

pub fn encode_output(frame: &OutputFrame) -> WireFrame {
    WireFrame::Binary(frame.data.to_vec())
}

/// Parses a server text frame. Used by clients and tests.
pub fn decode_server(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn test_binary_is_raw_input() {
        assert_eq!(
            decode_client(WireFrame::Binary(vec![0x1b, b'[', b'A'])),
            Inbound::Input(vec![0x1b, b'[', b'A'])
        );
    }

    #[test]
    fn test_control_messages() {
        let resize = json!({"type": "resize", "rows": 30, "cols": 100}).to_string();
        assert_eq!(
            decode_client(WireFrame::Text(resize)),
            Inbound::Resize { rows: 30, cols: 100 }
        );

        let input = json!({"type": "input", "data": "ls\r"}).to_string();
        assert_eq!(
            decode_client(WireFrame::Text(input)),
            Inbound::Input(b"ls\r".to_vec())
        );

        let resume = json!({"type": "resume", "session": "abc", "token": "t"}).to_string();
        assert_eq!(
            decode_client(WireFrame::Text(resume)),
            Inbound::Resume {
                session: "abc".to_string(),
                token: "t".to_string()
            }
        );

        assert_eq!(
            decode_client(WireFrame::Text(r#"{"type":"ping"}"#.to_string())),
            Inbound::Ping
        );
        assert_eq!(
            decode_client(WireFrame::Text(r#"{"type":"close"}"#.to_string())),
            Inbound::Close
        );
    }

    #[test]
    fn test_unparsable_text_is_raw_input() {
        assert_eq!(
            decode_client(WireFrame::Text("echo hi\r".to_string())),
            Inbound::Input(b"echo hi\r".to_vec())
        );
        // Looks like JSON but is not a control message.
        assert_eq!(
            decode_client(WireFrame::Text("{\"a\":1}".to_string())),
            Inbound::Input(b"{\"a\":1}".to_vec())
        );
    }

    #[test]
    fn test_error_shape() {
        let WireFrame::Text(text) = encode_server(&ServerMessage::error(
            ErrorCode::SessionReaped,
            "session was reaped",
        )) else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "session_reaped");
        assert_eq!(value["message"], "session was reaped");
    }

    #[test]
    fn test_as_str_matches_serde() {
        for code in [
            ErrorCode::AuthFailed,
            ErrorCode::AdmissionRejected,
            ErrorCode::TokenReused,
            ErrorCode::Unavailable,
        ] {
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, code.as_str());
        }
    }

    #[test]
    fn test_code_families() {
        assert!(ErrorCode::TokenReused.is_token_invalid());
        assert!(!ErrorCode::SessionReaped.is_token_invalid());
        assert!(ErrorCode::SessionReaped.needs_new_session());
        assert!(!ErrorCode::TokenExpired.needs_new_session());
    }

    #[test]
    fn test_output_is_binary() {
        let frame = OutputFrame {
            seq: 7,
            data: Bytes::from_static(b"out"),
        };
        assert_eq!(encode_output(&frame), WireFrame::Binary(b"out".to_vec()));
    }

    #[test]
    fn test_server_messages_parse_back() {
        let message = ServerMessage::Session {
            session_id: "id".to_string(),
            reconnect_token: "tok".to_string(),
            resumed: true,
            rows: 24,
            cols: 80,
        };
        let WireFrame::Text(text) = encode_server(&message) else {
            panic!("expected text frame");
        };
        assert!(text.contains(r#""type":"session""#));
        assert_eq!(decode_server(&text).unwrap(), message);
    }
}
