//
// socket.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Websocket lifecycle for a kernel session.
//!
//! One supervisor task per session owns the socket. Outbound messages reach
//! it through the session's ordered outbound channel and leave the socket
//! from this task alone, so wire order matches send order. On
//! disconnection the supervisor either backs off and reconnects (2^attempt
//! seconds, up to the attempt limit) or declares the session dead.

use std::time::Duration;

use cmshared::jupyter_message::{JupyterChannel, JupyterMessage};
use cmshared::models::Status;
use cmshared::wire;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::CmError;
use crate::future::{FutureShared, ShellFuture};
use crate::kernel_session::{dispatch, KernelSession};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Disposition {
    /// The session is disposed; stop the supervisor
    Stop,

    /// A manual reconnect was requested; reconnect without delay
    Immediate,

    /// Reconnect after a backoff delay
    Backoff(Duration),

    /// The attempt limit is exhausted; the kernel is dead
    Dead,
}

/// Frame and transmit one message on the socket.
pub(crate) async fn transmit(ws: &mut WsStream, msg: &JupyterMessage) -> Result<(), CmError> {
    let frame = wire::to_frame(msg).map_err(CmError::Serialization)?;
    ws.send(Message::Binary(frame))
        .await
        .map_err(|e| CmError::WebSocket(anyhow::anyhow!(e)))
}

/// The socket supervisor. Runs until the session is disposed or declared
/// dead.
pub(crate) async fn run(session: KernelSession) {
    let client_id = session.client_id().to_string();
    let outbound = session.outbound_receiver();
    loop {
        if session.is_disposed() {
            break;
        }

        let url = session.settings().channels_url(session.id(), &client_id);
        log::debug!("[session {}] Connecting to {}", client_id, url);
        match connect_async(url.as_str()).await {
            Ok((mut ws, _response)) => {
                log::info!("[session {}] Websocket connected", client_id);
                {
                    let mut state = session.lock_state();
                    state.reconnect_attempt = 0;
                    state.manual_reconnect = false;
                    // The transport is writable the moment the socket opens,
                    // until the handshake request has gone out
                    state.ready = true;
                }

                // Flush everything buffered while disconnected, chase it
                // with a kernel_info_request, then gate on the kernel's
                // first status broadcast. The info reply completes the
                // connection handshake.
                let flushed = flush_outbound(&session, &outbound, &mut ws).await;
                let handshake = if flushed {
                    request_kernel_info(&session, &mut ws).await
                } else {
                    Err(CmError::WebSocket(anyhow::anyhow!(
                        "socket failed during flush"
                    )))
                };
                session.lock_state().ready = false;

                match handshake {
                    Ok(()) => socket_loop(&session, &outbound, &mut ws).await,
                    Err(e) => {
                        log::error!(
                            "[session {}] Failed to send kernel info request: {}",
                            client_id,
                            e
                        );
                    }
                }

                let mut state = session.lock_state();
                state.ready = false;
                state.connection_ready = false;
            }
            Err(e) => {
                log::error!("[session {}] Websocket connection failed: {}", client_id, e);
            }
        }

        let disposition = {
            let mut state = session.lock_state();
            if state.disposed {
                Disposition::Stop
            } else if state.manual_reconnect {
                state.manual_reconnect = false;
                Disposition::Immediate
            } else if state.reconnect_attempt < state.reconnect_limit {
                let delay = Duration::from_secs(1u64 << state.reconnect_attempt);
                state.reconnect_attempt += 1;
                Disposition::Backoff(delay)
            } else {
                Disposition::Dead
            }
        };

        match disposition {
            Disposition::Stop => break,
            Disposition::Immediate => {
                session.set_status(Status::Reconnecting);
            }
            Disposition::Backoff(delay) => {
                session.set_status(Status::Reconnecting);
                log::info!(
                    "[session {}] Websocket disconnected; reconnecting in {:?}",
                    client_id,
                    delay
                );
                let exit = session.exit_listener();
                let reconnect = session.reconnect_listener();
                tokio::select! {
                    _ = exit => break,
                    // A manual reconnect skips the rest of the backoff
                    _ = reconnect => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Disposition::Dead => {
                log::error!(
                    "[session {}] Connection lost; giving up after {} attempts",
                    client_id,
                    session.lock_state().reconnect_limit
                );
                session.set_status(Status::Dead);
                break;
            }
        }
    }

    session.lock_state().supervisor_running = false;
    log::debug!("[session {}] Socket supervisor exited", client_id);
}

/// Send the handshake kernel_info_request on a freshly opened socket. Its
/// future resolves the session's connection promise when the reply arrives.
async fn request_kernel_info(session: &KernelSession, ws: &mut WsStream) -> Result<(), CmError> {
    let msg = session.build_message(
        "kernel_info_request",
        JupyterChannel::Shell,
        serde_json::json!({}),
        serde_json::json!({}),
        vec![],
    );
    let shared = {
        let mut state = session.lock_state();
        if state.disposed {
            return Err(CmError::Disposed);
        }
        let shared = FutureShared::new(msg.clone(), true, true, session.downgrade());
        state
            .futures
            .insert(msg.header.msg_id.clone(), shared.clone());
        shared
    };
    let future = ShellFuture::from_shared(shared);
    let weak = session.downgrade();
    future.on_reply(move |reply| {
        if let Some(session) = weak.upgrade() {
            session.finish_connection(reply);
        }
    });
    transmit(ws, &msg).await
}

/// Transmit any messages retained from a failed or deferred send, oldest
/// first. Each message is removed only once its transmit returns, so a
/// transport failure leaves it at the head for the next attempt. Returns
/// whether the socket survived.
async fn drain_retained(session: &KernelSession, ws: &mut WsStream) -> bool {
    loop {
        let msg = {
            let state = session.lock_state();
            state.pending.front().cloned()
        };
        let Some(msg) = msg else { return true };
        match transmit(ws, &msg).await {
            Ok(()) => {
                session.lock_state().pending.pop_front();
            }
            Err(e) => {
                log::error!(
                    "[session {}] Failed to send retained message {}: {}",
                    session.client_id(),
                    msg.header.msg_id,
                    e
                );
                // An unframeable message would block the queue forever
                if matches!(e, CmError::Serialization(_)) {
                    session.lock_state().pending.pop_front();
                    continue;
                }
                return false;
            }
        }
    }
}

/// Drain everything queued for transmission: first any retained message,
/// then the outbound channel, in order. Returns whether the socket
/// survived.
async fn flush_outbound(
    session: &KernelSession,
    outbound: &async_channel::Receiver<JupyterMessage>,
    ws: &mut WsStream,
) -> bool {
    if !drain_retained(session, ws).await {
        return false;
    }

    while let Ok(msg) = outbound.try_recv() {
        if let Err(e) = transmit(ws, &msg).await {
            log::error!(
                "[session {}] Failed to flush queued message {}: {}",
                session.client_id(),
                msg.header.msg_id,
                e
            );
            if matches!(e, CmError::Serialization(_)) {
                continue;
            }
            session.lock_state().pending.push_back(msg);
            return false;
        }
    }
    true
}

/// The connected-socket loop: reads and dispatches inbound frames, and is
/// the sole writer of outbound messages, which it takes from the session's
/// channel in send order whenever the kernel's status permits.
async fn socket_loop(
    session: &KernelSession,
    outbound: &async_channel::Receiver<JupyterMessage>,
    ws: &mut WsStream,
) {
    let client_id = session.client_id().to_string();
    loop {
        let exit = session.exit_listener();
        let reconnect = session.reconnect_listener();
        if session.is_disposed() {
            break;
        }
        let writable = session.lock_state().ready;
        if writable && !drain_retained(session, ws).await {
            break;
        }
        tokio::select! {
            _ = exit => break,
            _ = reconnect => {
                log::debug!("[session {}] Reconnect requested; closing socket", client_id);
                break;
            }
            msg = outbound.recv(), if writable => {
                let Ok(msg) = msg else { break };
                // Readiness may have flipped since this select round began
                // (a restart, for instance); hold the message if so
                let deferred = {
                    let mut state = session.lock_state();
                    if state.ready {
                        false
                    } else {
                        state.pending.push_back(msg.clone());
                        true
                    }
                };
                if !deferred {
                    match transmit(ws, &msg).await {
                        Ok(()) => {}
                        Err(CmError::Serialization(e)) => {
                            log::error!(
                                "[session {}] Dropping unframeable message {}: {}",
                                client_id,
                                msg.header.msg_id,
                                e
                            );
                        }
                        Err(e) => {
                            log::error!(
                                "[session {}] Failed to send message {}: {}",
                                client_id,
                                msg.header.msg_id,
                                e
                            );
                            // Retained for the next socket
                            session.lock_state().pending.push_back(msg);
                            break;
                        }
                    }
                }
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        dispatch::handle_frame(session, &data);
                    }
                    Some(Ok(Message::Text(text))) => {
                        log::warn!(
                            "[session {}] Ignoring unexpected text frame ({} bytes)",
                            client_id,
                            text.len()
                        );
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::info!("[session {}] Websocket closed by server", client_id);
                        break;
                    }
                    // Tungstenite answers pings itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("[session {}] Websocket read failed: {}", client_id, e);
                        break;
                    }
                    None => {
                        log::info!("[session {}] Websocket stream ended", client_id);
                        break;
                    }
                }
            }
        }
    }
}
