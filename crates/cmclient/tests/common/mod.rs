//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//

//! A mock notebook server for integration tests: a raw-HTTP kernel REST
//! surface plus a websocket acceptor for kernel channels.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cmclient::ServerSettings;
use cmshared::jupyter_message::{JupyterChannel, JupyterMessage, MessageOptions};
use cmshared::models::KernelModel;
use cmshared::wire;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// A mock notebook server. Kernel REST endpoints answer from an in-memory
/// kernel list; websocket upgrades surface as `KernelSocket`s on the
/// `sockets` channel, one per connection, in accept order.
pub struct MockKernelServer {
    addr: std::net::SocketAddr,
    sockets: async_channel::Receiver<KernelSocket>,
    kernels: Arc<Mutex<Vec<KernelModel>>>,
    specs_payload: Arc<Mutex<serde_json::Value>>,
}

impl MockKernelServer {
    pub async fn start() -> MockKernelServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (socket_tx, socket_rx) = async_channel::unbounded();
        let kernels = Arc::new(Mutex::new(Vec::new()));
        let specs_payload = Arc::new(Mutex::new(default_specs_payload()));

        let accept_kernels = kernels.clone();
        let accept_specs = specs_payload.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let socket_tx = socket_tx.clone();
                let kernels = accept_kernels.clone();
                let specs = accept_specs.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, socket_tx, kernels, specs).await;
                });
            }
        });

        MockKernelServer {
            addr,
            sockets: socket_rx,
            kernels,
            specs_payload,
        }
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings::new(&format!("http://{}", self.addr))
    }

    /// The next websocket connection accepted by the server.
    pub async fn next_socket(&self) -> KernelSocket {
        self.sockets.recv().await.expect("server stopped")
    }

    /// Replace the kernelspecs payload the server answers with.
    pub fn set_specs_payload(&self, payload: serde_json::Value) {
        *self.specs_payload.lock().unwrap() = payload;
    }

    /// The kernels currently known to the mock server.
    pub fn kernels(&self) -> Vec<KernelModel> {
        self.kernels.lock().unwrap().clone()
    }
}

fn default_specs_payload() -> serde_json::Value {
    serde_json::json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "spec": {
                    "display_name": "Python 3",
                    "language": "python",
                    "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"]
                },
                "resources": {}
            }
        }
    })
}

async fn handle_connection(
    mut stream: TcpStream,
    socket_tx: async_channel::Sender<KernelSocket>,
    kernels: Arc<Mutex<Vec<KernelModel>>>,
    specs: Arc<Mutex<serde_json::Value>>,
) -> anyhow::Result<()> {
    // Read the request head
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let path = target.split('?').next().unwrap_or_default().to_string();

    // Websocket upgrade for kernel channels
    if headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        let key = headers
            .get("sec-websocket-key")
            .ok_or_else(|| anyhow::anyhow!("missing websocket key"))?;
        let accept = derive_accept_key(key.as_bytes());
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        stream.write_all(response.as_bytes()).await?;
        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        let session_id = target
            .split("session_id=")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        let _ = socket_tx.send(KernelSocket { ws, session_id }).await;
        return Ok(());
    }

    // Read the body, if any
    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let (status, reason, payload) = route(&method, &path, &body, &kernels, &specs);
    let response = match payload {
        Some(json) => format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            status,
            reason,
            json.len(),
            json
        ),
        None => format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status, reason
        ),
    };
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn route(
    method: &str,
    path: &str,
    body: &str,
    kernels: &Arc<Mutex<Vec<KernelModel>>>,
    specs: &Arc<Mutex<serde_json::Value>>,
) -> (u16, &'static str, Option<String>) {
    match (method, path) {
        ("POST", "/api/kernels") => {
            let name = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(String::from))
                .unwrap_or_else(|| "python3".to_string());
            let model = KernelModel {
                id: format!("k-{}", uuid::Uuid::new_v4()),
                name,
            };
            kernels.lock().unwrap().push(model.clone());
            (
                201,
                "Created",
                Some(serde_json::to_string(&model).unwrap()),
            )
        }
        ("GET", "/api/kernels") => {
            let list = kernels.lock().unwrap().clone();
            (200, "OK", Some(serde_json::to_string(&list).unwrap()))
        }
        ("GET", "/api/kernelspecs") => {
            let payload = specs.lock().unwrap().clone();
            (200, "OK", Some(payload.to_string()))
        }
        _ => {
            let Some(rest) = path.strip_prefix("/api/kernels/") else {
                return (404, "Not Found", None);
            };
            let find = |id: &str| {
                kernels
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|k| k.id == id)
                    .cloned()
            };
            if let Some(id) = rest.strip_suffix("/interrupt") {
                if method == "POST" && find(id).is_some() {
                    return (204, "No Content", None);
                }
                return (404, "Not Found", None);
            }
            if let Some(id) = rest.strip_suffix("/restart") {
                if method == "POST" {
                    if let Some(model) = find(id) {
                        return (200, "OK", Some(serde_json::to_string(&model).unwrap()));
                    }
                }
                return (404, "Not Found", None);
            }
            match (method, find(rest)) {
                ("GET", Some(model)) => {
                    (200, "OK", Some(serde_json::to_string(&model).unwrap()))
                }
                ("DELETE", Some(model)) => {
                    kernels.lock().unwrap().retain(|k| k.id != model.id);
                    (204, "No Content", None)
                }
                _ => (404, "Not Found", None),
            }
        }
    }
}

/// The server side of one kernel channels websocket.
pub struct KernelSocket {
    ws: WebSocketStream<TcpStream>,
    pub session_id: String,
}

impl KernelSocket {
    /// Receive the next message from the client. `None` once the socket is
    /// closed.
    pub async fn recv(&mut self) -> Option<JupyterMessage> {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    return Some(wire::from_frame(&data).expect("client sent invalid frame"))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    /// Send a message to the client.
    pub async fn send(&mut self, msg: &JupyterMessage) {
        let frame = wire::to_frame(msg).unwrap();
        self.ws
            .send(Message::Binary(frame))
            .await
            .expect("failed to send to client");
    }

    /// Close the connection from the server side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Build a kernel-originated message.
    pub fn kernel_message(
        msg_type: &str,
        channel: JupyterChannel,
        parent: Option<&JupyterMessage>,
        content: serde_json::Value,
    ) -> JupyterMessage {
        let mut msg = JupyterMessage::create(
            MessageOptions {
                msg_type: msg_type.to_string(),
                channel,
                username: "kernel".to_string(),
                session: "mock-kernel".to_string(),
                msg_id: None,
            },
            content,
            serde_json::json!({}),
            vec![],
        );
        msg.parent_header = parent.map(|p| p.header.clone());
        msg
    }

    /// An iopub status message.
    pub fn status(parent: Option<&JupyterMessage>, state: &str) -> JupyterMessage {
        Self::kernel_message(
            "status",
            JupyterChannel::IOPub,
            parent,
            serde_json::json!({"execution_state": state}),
        )
    }

    /// A shell reply to the given request.
    pub fn reply_to(
        parent: &JupyterMessage,
        msg_type: &str,
        content: serde_json::Value,
    ) -> JupyterMessage {
        Self::kernel_message(msg_type, JupyterChannel::Shell, Some(parent), content)
    }

    /// Answer the next kernel_info_request like a freshly attached kernel:
    /// busy, the reply, then idle. Returns the request.
    pub async fn serve_kernel_info(&mut self) -> JupyterMessage {
        loop {
            let msg = self
                .recv()
                .await
                .expect("socket closed awaiting kernel_info_request");
            if msg.header.msg_type == "kernel_info_request" {
                self.send(&Self::status(Some(&msg), "busy")).await;
                self.send(&Self::reply_to(
                    &msg,
                    "kernel_info_reply",
                    serde_json::json!({
                        "status": "ok",
                        "protocol_version": "5.3",
                        "implementation": "mock",
                        "banner": "mock kernel"
                    }),
                ))
                .await;
                self.send(&Self::status(Some(&msg), "idle")).await;
                return msg;
            }
        }
    }
}

/// Poll until the condition holds or a generous timeout elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("condition not reached within timeout");
}
