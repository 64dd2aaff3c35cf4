#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use cmux_ptyd::{
    build_metrics_router, build_router,
    protocol::{decode_server, ErrorCode, ServerMessage},
    serve, AppState, Config,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub async fn start(args: &[&str]) -> Self {
        let mut argv = vec!["cmux-ptyd"];
        if !args.contains(&"--command") {
            argv.extend_from_slice(&["--command", "/bin/cat"]);
        }
        argv.extend_from_slice(args);
        let config = Config::try_parse_from(argv).unwrap();
        let state = AppState::new(config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let metrics_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics_addr = metrics_listener.local_addr().unwrap();

        tokio::spawn(serve(
            listener,
            build_router(Arc::clone(&state)),
            state.shutdown.clone(),
        ));
        tokio::spawn(serve(
            metrics_listener,
            build_metrics_router(Arc::clone(&state)),
            state.shutdown.clone(),
        ));

        Self {
            addr,
            metrics_addr,
            state,
        }
    }

    pub fn ws_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("ws://{}/ws", self.addr)
        } else {
            format!("ws://{}/ws?{}", self.addr, query)
        }
    }

    pub async fn connect(&self, query: &str) -> Ws {
        let (ws, _resp) = tokio::time::timeout(WAIT, connect_async(self.ws_url(query)))
            .await
            .expect("ws connect timed out")
            .unwrap();
        ws
    }

    pub async fn metrics_text(&self) -> String {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let resp = tokio::time::timeout(
            WAIT,
            client
                .get(format!("http://{}/metrics", self.metrics_addr))
                .send(),
        )
        .await
        .expect("metrics request timed out")
        .unwrap();
        assert!(resp.status().is_success());
        resp.text().await.unwrap()
    }

    /// Polls until `check` holds or the wait elapses.
    pub async fn wait_for(&self, what: &str, check: impl Fn(&AppState) -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check(&self.state) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self.state.registry.shutdown();
    }
}

pub fn metric(text: &str, name: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(' ')?.parse().ok())
}

/// Next control message, skipping output frames and transport pings.
pub async fn next_control(ws: &mut Ws) -> ServerMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return decode_server(&text).unwrap(),
                Some(Ok(Message::Close(frame))) => panic!("socket closed: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("ws error: {}", e),
                None => panic!("socket ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for a control message")
}

pub async fn expect_error(ws: &mut Ws) -> ErrorCode {
    match next_control(ws).await {
        ServerMessage::Error { code, .. } => code,
        other => panic!("expected error, got {:?}", other),
    }
}

/// Session announced by the server after connect or resume.
#[derive(Debug, Clone)]
pub struct Opened {
    pub session_id: String,
    pub token: String,
    pub resumed: bool,
    /// Raw output received between `replay_begin` and `replay_end`.
    pub replay: Vec<u8>,
    pub replay_frames: usize,
}

pub async fn expect_session(ws: &mut Ws) -> Opened {
    let (session_id, token, resumed) = match next_control(ws).await {
        ServerMessage::Session {
            session_id,
            reconnect_token,
            resumed,
            ..
        } => (session_id, reconnect_token, resumed),
        other => panic!("expected session message, got {:?}", other),
    };
    let announced = match next_control(ws).await {
        ServerMessage::ReplayBegin { frames, .. } => frames,
        other => panic!("expected replay_begin, got {:?}", other),
    };

    let mut replay = Vec::new();
    let mut replay_frames = 0;
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    replay_frames += 1;
                    replay.extend_from_slice(&data);
                }
                Some(Ok(Message::Text(text))) => match decode_server(&text).unwrap() {
                    ServerMessage::ReplayEnd { .. } => break,
                    other => panic!("unexpected message during replay: {:?}", other),
                },
                Some(Ok(_)) => continue,
                other => panic!("replay interrupted: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out during replay");
    assert_eq!(announced, replay_frames);

    Opened {
        session_id,
        token,
        resumed,
        replay,
        replay_frames,
    }
}

/// Reads output until it contains `needle`, returning everything seen.
/// Control messages are collected alongside.
pub async fn read_output_until(ws: &mut Ws, needle: &str) -> (String, Vec<ServerMessage>) {
    let mut seen = Vec::new();
    let mut controls = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    seen.extend_from_slice(&data);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => controls.push(decode_server(&text).unwrap()),
                Some(Ok(_)) => continue,
                other => panic!("output interrupted: {:?}", other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for output {:?}", needle));
    (String::from_utf8_lossy(&seen).into_owned(), controls)
}

pub async fn send_input(ws: &mut Ws, data: &str) {
    ws.send(Message::Binary(data.as_bytes().to_vec()))
        .await
        .unwrap();
}

pub async fn send_control(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Waits for the server to close the socket.
pub async fn expect_closed(ws: &mut Ws) {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("socket was not closed");
}
