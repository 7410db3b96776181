//! Shared helpers for integration tests: an in-process WebSocket server on
//! an ephemeral port plus small frame utilities.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async, accept_hdr_async,
    tungstenite::handshake::server::{Request, Response},
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    WebSocketStream,
};

pub type ServerWs = WebSocketStream<TcpStream>;

/// Route `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Minimal in-process WebSocket server bound to an ephemeral port.
pub struct MockServer {
    listener: TcpListener,
    port: u16,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub fn base_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Accept the next client connection and complete the WS handshake.
    pub async fn accept(&self) -> ServerWs {
        let (stream, _) = self.listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    /// Accept and return the request URI the client dialed with.
    pub async fn accept_capturing_uri(&self) -> (ServerWs, String) {
        let (stream, _) = self.listener.accept().await.unwrap();
        let uri = Arc::new(Mutex::new(String::new()));
        let sink = uri.clone();
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            *sink.lock().unwrap() = req.uri().to_string();
            Ok(resp)
        })
        .await
        .unwrap();
        let uri = uri.lock().unwrap().clone();
        (ws, uri)
    }

    /// Accept with a deadline; `None` means no client connected in time.
    pub async fn try_accept(&self, deadline: Duration) -> Option<ServerWs> {
        tokio::time::timeout(deadline, self.accept()).await.ok()
    }

    /// Accept connections until one completes the handshake (tolerates
    /// half-open sockets left behind by timed-out clients).
    pub async fn accept_lenient(&self) -> ServerWs {
        loop {
            let (stream, _) = self.listener.accept().await.unwrap();
            if let Ok(ws) = accept_async(stream).await {
                return ws;
            }
        }
    }
}

/// Read frames until the next text frame and parse it as JSON.
pub async fn recv_json(ws: &mut ServerWs) -> JsonValue {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("websocket stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            _ => {}
        }
    }
}

/// Assert that no text frame arrives within the window.
pub async fn expect_no_text_frame(ws: &mut ServerWs, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(text) = result {
        panic!("unexpected text frame: {}", text);
    }
}

/// Send an enveloped event to the client.
pub async fn send_event(ws: &mut ServerWs, event_type: &str, payload: JsonValue) {
    let frame = json!({
        "type": event_type,
        "payload": payload,
        "timestamp": "2025-03-01T12:00:00Z",
    });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Send a raw text frame (for malformed-input tests).
pub async fn send_raw(ws: &mut ServerWs, raw: &str) {
    ws.send(Message::Text(raw.to_string())).await.unwrap();
}

/// Close the connection with an explicit close code.
pub async fn close_with_code(mut ws: ServerWs, code: CloseCode, reason: &'static str) {
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
    // Drain until the peer acknowledges or the stream ends.
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(200), ws.next()).await {}
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(deadline, async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("timed out waiting for: {}", what));
}
