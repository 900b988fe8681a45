//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Kernel sessions.
//!
//! A `KernelSession` is one websocket attachment to a kernel from this
//! client, identified by a client ID. It owns the socket lifecycle (connect,
//! reconnect with exponential backoff, dispose), the registries of
//! outstanding shell exchanges and live comms, and inbound message
//! dispatch. Outbound messages enter an ordered channel that the socket
//! task alone drains, so frames leave the wire in send order.

pub(crate) mod dispatch;
pub(crate) mod socket;
pub(crate) mod state;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use cmshared::jupyter_message::{JupyterChannel, JupyterMessage, MessageOptions};
use cmshared::models::{KernelModel, KernelSpecModel, Status};
use event_listener::{Event, EventListener};

use crate::error::CmError;
use crate::future::{FutureShared, IOPubHook, ShellFuture};
use crate::rest;
use crate::rest::ServerSettings;
use crate::session_registry;
use crate::signal::Signal;
use crate::comm::Comm;

pub use state::{CommTargetHandler, CommTargetResolver};
use state::SessionState;

/// Events published by a session.
pub struct SessionEvents {
    /// Fires on each actual status change
    pub status_changed: Signal<Status>,

    /// Fires for every inbound iopub message
    pub iopub_message: Signal<JupyterMessage>,

    /// Fires for replies addressed to this client that have no outstanding
    /// request, including replies whose request was disposed before the
    /// reply arrived
    pub unhandled_message: Signal<JupyterMessage>,
}

pub(crate) struct SessionInner {
    client_id: String,
    username: String,
    kernel: KernelModel,
    settings: ServerSettings,
    state: Mutex<SessionState>,
    events: SessionEvents,
    exit_event: Event,
    reconnect_event: Event,
    connected_event: Event,

    /// The channel to send messages to the socket task
    outbound_tx: async_channel::Sender<JupyterMessage>,

    /// The channel the socket task drains, in send order
    outbound_rx: async_channel::Receiver<JupyterMessage>,
}

/// A weak back-reference to a session, held by futures and comms.
#[derive(Clone)]
pub(crate) struct SessionRef {
    inner: Weak<SessionInner>,
}

impl SessionRef {
    pub(crate) fn detached() -> Self {
        SessionRef { inner: Weak::new() }
    }

    pub(crate) fn upgrade(&self) -> Option<KernelSession> {
        self.inner.upgrade().map(|inner| KernelSession { inner })
    }
}

/// A handle to a kernel session. Clones share the same session; use
/// `clone_session` for a second attachment to the same kernel.
#[derive(Clone)]
pub struct KernelSession {
    inner: Arc<SessionInner>,
}

/// Deregistration handle for a comm target.
pub struct CommTargetRegistration {
    target_name: String,
    session: SessionRef,
}

impl CommTargetRegistration {
    /// Remove the target from the session's registry.
    pub fn unregister(&self) {
        if let Some(session) = self.session.upgrade() {
            session
                .lock_state()
                .targets
                .remove(&self.target_name);
        }
    }
}

/// Deregistration handle for a message hook. Inert when the hook's request
/// was already gone at registration time.
pub struct MessageHookRegistration {
    msg_id: String,
    hook_id: Option<u64>,
    session: SessionRef,
}

impl MessageHookRegistration {
    /// Remove the hook from its future's stack.
    pub fn remove(&self) {
        let Some(hook_id) = self.hook_id else {
            return;
        };
        if let Some(session) = self.session.upgrade() {
            let future = session.lock_state().futures.get(&self.msg_id).cloned();
            if let Some(future) = future {
                future.remove_hook(hook_id);
            }
        }
    }
}

impl KernelSession {
    /// Create a session for the given kernel. The session registers itself
    /// in the process-wide registry; call `connect` to open its websocket.
    pub fn new(settings: ServerSettings, kernel: KernelModel, username: String) -> KernelSession {
        let (outbound_tx, outbound_rx) = async_channel::unbounded::<JupyterMessage>();
        let session = KernelSession {
            inner: Arc::new(SessionInner {
                client_id: uuid::Uuid::new_v4().to_string(),
                username,
                kernel,
                settings,
                state: Mutex::new(SessionState::new()),
                events: SessionEvents {
                    status_changed: Signal::new(),
                    iopub_message: Signal::new(),
                    unhandled_message: Signal::new(),
                },
                exit_event: Event::new(),
                reconnect_event: Event::new(),
                connected_event: Event::new(),
                outbound_tx,
                outbound_rx,
            }),
        };
        session_registry::insert(&session);
        session
    }

    /// The server-assigned kernel ID.
    pub fn id(&self) -> &str {
        &self.inner.kernel.id
    }

    /// The kernel spec name the kernel was started from.
    pub fn name(&self) -> &str {
        &self.inner.kernel.name
    }

    /// The kernel model for this session.
    pub fn model(&self) -> KernelModel {
        self.inner.kernel.clone()
    }

    /// The client ID identifying this attachment.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    /// The session's event signals.
    pub fn events(&self) -> &SessionEvents {
        &self.inner.events
    }

    /// The cached kernel_info_reply content from the most recent handshake.
    pub fn kernel_info_cache(&self) -> Option<serde_json::Value> {
        self.lock_state().kernel_info.clone()
    }

    /// Open the websocket and wait until the connection handshake completes.
    pub async fn connect(&self) -> Result<(), CmError> {
        let spawn = {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(CmError::KernelDead);
            }
            if state.supervisor_running {
                false
            } else {
                state.supervisor_running = true;
                true
            }
        };
        if spawn {
            tokio::spawn(socket::run(self.clone()));
        }
        self.wait_connected().await
    }

    /// Close the current socket (if any) and open a new one. Resolves when
    /// the kernel_info handshake completes on the new socket.
    pub async fn reconnect(&self) -> Result<(), CmError> {
        let spawn = {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(CmError::KernelDead);
            }
            state.connection_ready = false;
            state.reconnect_attempt = 0;
            state.manual_reconnect = true;
            if state.supervisor_running {
                false
            } else {
                state.supervisor_running = true;
                true
            }
        };
        self.set_status(Status::Reconnecting);
        if spawn {
            tokio::spawn(socket::run(self.clone()));
        } else {
            self.inner.reconnect_event.notify(usize::MAX);
        }
        self.wait_connected().await
    }

    async fn wait_connected(&self) -> Result<(), CmError> {
        loop {
            let listener = self.inner.connected_event.listen();
            {
                let state = self.lock_state();
                if state.connection_ready {
                    return Ok(());
                }
                if state.disposed || state.status == Status::Dead {
                    return Err(CmError::KernelDead);
                }
            }
            listener.await;
        }
    }

    /// Send a shell message and return the future tracking its exchange.
    ///
    /// The message joins the session's outbound channel in call order; the
    /// socket task transmits from the channel whenever the transport is
    /// ready, so wire order matches send order.
    pub fn send_shell_message(
        &self,
        msg: JupyterMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<ShellFuture, CmError> {
        let shared = {
            let mut state = self.lock_state();
            if state.disposed || state.status == Status::Dead {
                return Err(CmError::KernelDead);
            }
            let shared =
                FutureShared::new(msg.clone(), expect_reply, dispose_on_done, self.downgrade());
            state
                .futures
                .insert(msg.header.msg_id.clone(), shared.clone());
            // Enqueued under the state lock so concurrent senders keep a
            // well-defined order
            let _ = self.inner.outbound_tx.try_send(msg);
            shared
        };
        Ok(ShellFuture::from_shared(shared))
    }

    /// Send an input_reply on the stdin channel.
    pub fn send_input_reply(&self, content: serde_json::Value) -> Result<(), CmError> {
        let msg = self.build_message(
            "input_reply",
            JupyterChannel::Stdin,
            content,
            serde_json::json!({}),
            vec![],
        );
        let state = self.lock_state();
        if state.disposed || state.status == Status::Dead {
            return Err(CmError::KernelDead);
        }
        let _ = self.inner.outbound_tx.try_send(msg);
        Ok(())
    }

    /// Request kernel info. Updates the session's info cache.
    pub async fn kernel_info(&self) -> Result<serde_json::Value, CmError> {
        let reply = self.shell_request("kernel_info_request", serde_json::json!({})).await?;
        let mut state = self.lock_state();
        state.kernel_info = Some(reply.content.clone());
        Ok(reply.content)
    }

    /// Request code completions.
    pub async fn complete(&self, content: serde_json::Value) -> Result<serde_json::Value, CmError> {
        Ok(self.shell_request("complete_request", content).await?.content)
    }

    /// Request object introspection.
    pub async fn inspect(&self, content: serde_json::Value) -> Result<serde_json::Value, CmError> {
        Ok(self.shell_request("inspect_request", content).await?.content)
    }

    /// Request execution history.
    pub async fn history(&self, content: serde_json::Value) -> Result<serde_json::Value, CmError> {
        Ok(self.shell_request("history_request", content).await?.content)
    }

    /// Ask the kernel whether code is complete.
    pub async fn is_complete(
        &self,
        content: serde_json::Value,
    ) -> Result<serde_json::Value, CmError> {
        Ok(self
            .shell_request("is_complete_request", content)
            .await?
            .content)
    }

    /// Request info about the kernel's open comms.
    pub async fn comm_info(&self, content: serde_json::Value) -> Result<serde_json::Value, CmError> {
        Ok(self.shell_request("comm_info_request", content).await?.content)
    }

    /// Execute code. Default content fields are merged under the caller's:
    /// `{silent: false, store_history: true, user_expressions: {},
    /// allow_stdin: true, stop_on_error: false}`.
    pub fn execute(
        &self,
        content: serde_json::Value,
        dispose_on_done: bool,
    ) -> Result<ShellFuture, CmError> {
        let msg = self.build_message(
            "execute_request",
            JupyterChannel::Shell,
            merge_execute_defaults(content),
            serde_json::json!({}),
            vec![],
        );
        self.send_shell_message(msg, true, dispose_on_done)
    }

    /// Interrupt the kernel.
    pub async fn interrupt(&self) -> Result<(), CmError> {
        if self.is_disposed() || self.status() == Status::Dead {
            return Err(CmError::KernelDead);
        }
        rest::interrupt_kernel(&self.inner.settings, self.id()).await
    }

    /// Restart the kernel. Outstanding futures and comms are disposed and
    /// the pending queue cleared before the server is asked to restart; the
    /// status returns to idle via a subsequent iopub status message.
    pub async fn restart(&self) -> Result<(), CmError> {
        if self.is_disposed() || self.status() == Status::Dead {
            return Err(CmError::KernelDead);
        }
        self.clear_requests();
        self.set_status(Status::Restarting);
        rest::restart_kernel(&self.inner.settings, self.id()).await?;
        Ok(())
    }

    /// Shut down the kernel on the server and dispose the session.
    pub async fn shutdown(&self) -> Result<(), CmError> {
        if self.is_disposed() || self.status() == Status::Dead {
            return Err(CmError::KernelDead);
        }
        self.clear_requests();
        rest::shutdown_kernel(&self.inner.settings, self.id()).await?;
        self.dispose();
        Ok(())
    }

    /// Register a handler for kernel-initiated comm opens against the named
    /// target.
    pub fn register_comm_target(
        &self,
        target_name: &str,
        handler: CommTargetHandler,
    ) -> CommTargetRegistration {
        self.lock_state()
            .targets
            .insert(target_name.to_string(), handler);
        CommTargetRegistration {
            target_name: target_name.to_string(),
            session: self.downgrade(),
        }
    }

    /// Install a fallback resolver consulted when a comm_open names a target
    /// absent from the registry.
    pub fn set_comm_target_resolver(&self, resolver: CommTargetResolver) {
        self.lock_state().target_resolver = Some(resolver);
    }

    /// Register an iopub hook against the future for the given request.
    /// Silently inert when no such future exists.
    pub fn register_message_hook(
        &self,
        msg_id: &str,
        hook: impl FnMut(&JupyterMessage) -> Result<bool, anyhow::Error> + Send + 'static,
    ) -> MessageHookRegistration {
        let future = self.lock_state().futures.get(msg_id).cloned();
        let hook_id = future.map(|future| future.add_hook(Box::new(hook) as IOPubHook));
        MessageHookRegistration {
            msg_id: msg_id.to_string(),
            hook_id,
            session: self.downgrade(),
        }
    }

    /// Connect to a comm, reusing the existing comm when the ID is already
    /// known. The comm is not opened on the kernel side until `open`.
    pub fn connect_to_comm(&self, target_name: &str, comm_id: Option<String>) -> Comm {
        let id = comm_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut state = self.lock_state();
        if let Some(existing) = state.comms.get(&id) {
            return existing.clone();
        }
        let comm = Comm::new(self.downgrade(), id.clone(), target_name.to_string());
        state.comms.insert(id, comm.clone());
        comm
    }

    /// Fetch the kernel's spec, cached after the first call.
    pub async fn get_kernel_spec(&self) -> Result<KernelSpecModel, CmError> {
        if let Some(spec) = self.lock_state().kernel_spec.clone() {
            return Ok(spec);
        }
        let spec = rest::get_kernel_spec(&self.inner.settings, self.name()).await?;
        self.lock_state().kernel_spec = Some(spec.clone());
        Ok(spec)
    }

    /// Create a second attachment to the same kernel: identical kernel ID
    /// and name, fresh client ID, its own websocket.
    pub async fn clone_session(&self) -> Result<KernelSession, CmError> {
        let session = KernelSession::new(
            self.inner.settings.clone(),
            self.model(),
            self.inner.username.clone(),
        );
        session.connect().await?;
        Ok(session)
    }

    /// Dispose the session: terminal status, socket closed, all futures and
    /// comms disposed, subscribers dropped, registry entry removed.
    /// Idempotent.
    pub fn dispose(&self) {
        let (futures, comms, changed) = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let changed = state.status != Status::Dead;
            state.status = Status::Dead;
            state.ready = false;
            state.connection_ready = false;
            state.pending.clear();
            state.comm_opens.clear();
            state.targets.clear();
            state.target_resolver = None;
            let futures: Vec<_> = state.futures.drain().map(|(_, v)| v).collect();
            let comms: Vec<_> = state.comms.drain().map(|(_, v)| v).collect();
            (futures, comms, changed)
        };
        self.clear_outbound();
        for future in &futures {
            future.dispose();
        }
        for comm in &comms {
            comm.dispose();
        }
        if changed {
            self.inner.events.status_changed.emit(Status::Dead);
        }
        self.inner.events.status_changed.clear();
        self.inner.events.iopub_message.clear();
        self.inner.events.unhandled_message.clear();
        self.inner.exit_event.notify(usize::MAX);
        self.inner.connected_event.notify(usize::MAX);
        session_registry::remove(&self.inner.client_id);
    }

    // Internal plumbing

    pub(crate) fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    pub(crate) fn downgrade(&self) -> SessionRef {
        SessionRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap()
    }

    pub(crate) fn outbound_receiver(&self) -> async_channel::Receiver<JupyterMessage> {
        self.inner.outbound_rx.clone()
    }

    /// Discard everything queued for transmission.
    fn clear_outbound(&self) {
        while self.inner.outbound_rx.try_recv().is_ok() {}
    }

    pub(crate) fn exit_listener(&self) -> EventListener {
        self.inner.exit_event.listen()
    }

    pub(crate) fn reconnect_listener(&self) -> EventListener {
        self.inner.reconnect_event.listen()
    }

    /// Apply a status reported by the kernel (or a local transition).
    /// Returns whether the status actually changed; entering `Dead` disposes
    /// the session.
    pub(crate) fn set_status(&self, status: Status) -> bool {
        let changed = {
            let mut state = self.lock_state();
            if state.disposed && status != Status::Dead {
                return false;
            }
            if state.status == status {
                false
            } else {
                state.status = status;
                state.ready = status.is_active();
                true
            }
        };
        if changed {
            log::trace!(
                "[session {}] Kernel status: {}",
                self.inner.client_id,
                status
            );
            self.inner.events.status_changed.emit(status);
            if status == Status::Dead {
                self.dispose();
            }
        }
        changed
    }

    /// Record a completed kernel_info handshake for the current socket.
    pub(crate) fn finish_connection(&self, reply: &JupyterMessage) {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.kernel_info = Some(reply.content.clone());
            state.connection_ready = true;
        }
        log::debug!(
            "[session {}] Connection handshake complete",
            self.inner.client_id
        );
        self.inner.connected_event.notify(usize::MAX);
    }

    pub(crate) fn unregister_future(&self, msg_id: &str) {
        self.lock_state().futures.remove(msg_id);
    }

    pub(crate) fn unregister_comm(&self, comm_id: &str) {
        self.lock_state().comms.remove(comm_id);
    }

    /// Construct a message stamped with this session's identity.
    pub(crate) fn build_message(
        &self,
        msg_type: &str,
        channel: JupyterChannel,
        content: serde_json::Value,
        metadata: serde_json::Value,
        buffers: Vec<Vec<u8>>,
    ) -> JupyterMessage {
        JupyterMessage::create(
            MessageOptions {
                msg_type: msg_type.to_string(),
                channel,
                username: self.inner.username.clone(),
                session: self.inner.client_id.clone(),
                msg_id: None,
            },
            content,
            metadata,
            buffers,
        )
    }

    async fn shell_request(
        &self,
        msg_type: &str,
        content: serde_json::Value,
    ) -> Result<JupyterMessage, CmError> {
        let msg = self.build_message(
            msg_type,
            JupyterChannel::Shell,
            content,
            serde_json::json!({}),
            vec![],
        );
        let future = self.send_shell_message(msg, true, true)?;
        future.reply().await
    }

    /// Dispose all outstanding futures and comms and clear everything
    /// queued for transmission; used by restart and shutdown.
    fn clear_requests(&self) {
        self.clear_outbound();
        let (futures, comms) = {
            let mut state = self.lock_state();
            state.pending.clear();
            state.comm_opens.clear();
            let futures: Vec<_> = state.futures.drain().map(|(_, v)| v).collect();
            let comms: Vec<_> = state.comms.drain().map(|(_, v)| v).collect();
            (futures, comms)
        };
        for future in &futures {
            future.dispose();
        }
        for comm in &comms {
            comm.dispose();
        }
    }
}

fn merge_execute_defaults(content: serde_json::Value) -> serde_json::Value {
    let mut merged = serde_json::json!({
        "silent": false,
        "store_history": true,
        "user_expressions": {},
        "allow_stdin": true,
        "stop_on_error": false,
    });
    if let (Some(base), Some(user)) = (merged.as_object_mut(), content.as_object()) {
        for (key, value) in user {
            base.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_registry;

    fn offline_session() -> KernelSession {
        KernelSession::new(
            ServerSettings::new("http://localhost:9"),
            KernelModel {
                id: uuid::Uuid::new_v4().to_string(),
                name: "python3".to_string(),
            },
            "testuser".to_string(),
        )
    }

    #[test]
    fn test_execute_defaults_merge_under_caller() {
        let merged = merge_execute_defaults(serde_json::json!({
            "code": "print(1)",
            "silent": true,
        }));
        assert_eq!(merged["code"], "print(1)");
        assert_eq!(merged["silent"], true);
        assert_eq!(merged["store_history"], true);
        assert_eq!(merged["allow_stdin"], true);
        assert_eq!(merged["stop_on_error"], false);
        assert_eq!(merged["user_expressions"], serde_json::json!({}));
    }

    #[test]
    fn test_sends_queue_while_not_ready() {
        let session = offline_session();
        let msg = session.build_message(
            "kernel_info_request",
            JupyterChannel::Shell,
            serde_json::json!({}),
            serde_json::json!({}),
            vec![],
        );
        let msg_id = msg.header.msg_id.clone();
        let future = session.send_shell_message(msg, true, false).unwrap();
        assert!(!future.is_done());
        // With no socket the message waits in the outbound channel
        assert_eq!(session.inner.outbound_rx.len(), 1);
        assert!(session.lock_state().futures.contains_key(&msg_id));
        session.dispose();
        assert_eq!(session.inner.outbound_rx.len(), 0);
    }

    #[test]
    fn test_send_fails_when_dead() {
        let session = offline_session();
        session.dispose();
        let msg = session.build_message(
            "kernel_info_request",
            JupyterChannel::Shell,
            serde_json::json!({}),
            serde_json::json!({}),
            vec![],
        );
        let result = session.send_shell_message(msg, true, false);
        assert!(matches!(result, Err(CmError::KernelDead)));
        assert!(matches!(
            session.send_input_reply(serde_json::json!({"value": "x"})),
            Err(CmError::KernelDead)
        ));
    }

    #[test]
    fn test_dispose_is_idempotent_and_unregisters() {
        let session = offline_session();
        let client_id = session.client_id().to_string();
        assert!(session_registry::contains(&client_id));

        session.dispose();
        assert!(!session_registry::contains(&client_id));
        assert_eq!(session.status(), Status::Dead);

        session.dispose();
        assert_eq!(session.status(), Status::Dead);
    }

    #[tokio::test]
    async fn test_dispose_disposes_outstanding_futures() {
        let session = offline_session();
        let msg = session.build_message(
            "execute_request",
            JupyterChannel::Shell,
            serde_json::json!({"code": "1"}),
            serde_json::json!({}),
            vec![],
        );
        let future = session.send_shell_message(msg, true, false).unwrap();
        session.dispose();
        assert!(matches!(future.reply().await, Err(CmError::Disposed)));
    }

    #[test]
    fn test_connect_to_comm_reuses_existing() {
        let session = offline_session();
        let comm = session.connect_to_comm("echo", Some("c-1".to_string()));
        let again = session.connect_to_comm("echo", Some("c-1".to_string()));
        assert_eq!(comm.comm_id(), again.comm_id());
        assert_eq!(session.lock_state().comms.len(), 1);

        let fresh = session.connect_to_comm("echo", None);
        assert_ne!(fresh.comm_id(), comm.comm_id());
        session.dispose();
    }

    #[test]
    fn test_message_hook_on_missing_future_is_inert() {
        let session = offline_session();
        let registration = session.register_message_hook("no-such-id", |_| Ok(true));
        // Removing an inert registration is a no-op
        registration.remove();
        session.dispose();
    }

    #[test]
    fn test_status_fires_only_on_change() {
        let session = offline_session();
        let statuses = session.events().status_changed.connect();
        assert!(session.set_status(Status::Idle));
        assert!(!session.set_status(Status::Idle));
        assert!(session.set_status(Status::Busy));
        assert_eq!(statuses.try_recv().unwrap(), Status::Idle);
        assert_eq!(statuses.try_recv().unwrap(), Status::Busy);
        assert!(statuses.try_recv().is_err());
        session.dispose();
    }

    #[test]
    fn test_dead_is_terminal() {
        let session = offline_session();
        session.set_status(Status::Dead);
        assert!(session.is_disposed());
        assert!(!session.set_status(Status::Idle));
        assert_eq!(session.status(), Status::Dead);
    }
}
