//
// comm.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Client-side comm channels.
//!
//! A comm is a long-lived logical channel between the kernel and a client
//! target, multiplexed over the shell and iopub channels and identified by a
//! comm ID. The session owns its comms; a comm holds only a weak reference
//! back to the session and never outlives it.

use std::sync::{Arc, Mutex};

use cmshared::jupyter_message::{JupyterChannel, JupyterMessage};

use crate::error::CmError;
use crate::future::{MessageCallback, ShellFuture};
use crate::kernel_session::{KernelSession, SessionRef};

struct CommInner {
    comm_id: String,
    target_name: String,
    // None once disposed
    session: Mutex<Option<SessionRef>>,
    on_msg: Mutex<Option<MessageCallback>>,
    on_close: Mutex<Option<MessageCallback>>,
}

/// A handle to one comm channel.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<CommInner>,
}

impl Comm {
    pub(crate) fn new(session: SessionRef, comm_id: String, target_name: String) -> Comm {
        Comm {
            inner: Arc::new(CommInner {
                comm_id,
                target_name,
                session: Mutex::new(Some(session)),
                on_msg: Mutex::new(None),
                on_close: Mutex::new(None),
            }),
        }
    }

    pub fn comm_id(&self) -> &str {
        &self.inner.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.inner.target_name
    }

    /// Whether the comm (or its session) has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.session().is_none()
    }

    /// Set the callback invoked with each comm_msg from the kernel.
    pub fn on_msg(&self, callback: impl FnMut(&JupyterMessage) + Send + 'static) {
        *self.inner.on_msg.lock().unwrap() = Some(Box::new(callback));
    }

    /// Set the callback invoked when the comm is closed, by either side.
    pub fn on_close(&self, callback: impl FnMut(&JupyterMessage) + Send + 'static) {
        *self.inner.on_close.lock().unwrap() = Some(Box::new(callback));
    }

    /// Open the comm on the kernel side. No-op when the comm or its kernel
    /// has been disposed.
    pub fn open(
        &self,
        data: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<Option<ShellFuture>, CmError> {
        let Some(session) = self.session() else {
            return Ok(None);
        };
        let content = serde_json::json!({
            "comm_id": self.inner.comm_id,
            "target_name": self.inner.target_name,
            "data": data,
        });
        let msg = session.build_message("comm_open", JupyterChannel::Shell, content, metadata, vec![]);
        let future = session.send_shell_message(msg, false, true)?;
        Ok(Some(future))
    }

    /// Send a comm_msg over the comm. No-op when disposed.
    pub fn send(
        &self,
        data: serde_json::Value,
        metadata: serde_json::Value,
        buffers: Vec<Vec<u8>>,
        dispose_on_done: bool,
    ) -> Result<Option<ShellFuture>, CmError> {
        let Some(session) = self.session() else {
            return Ok(None);
        };
        let content = serde_json::json!({
            "comm_id": self.inner.comm_id,
            "data": data,
        });
        let msg = session.build_message("comm_msg", JupyterChannel::Shell, content, metadata, buffers);
        let future = session.send_shell_message(msg, false, dispose_on_done)?;
        Ok(Some(future))
    }

    /// Close the comm from this side: tell the kernel, deliver a synthetic
    /// close to the local close callback, then dispose. Idempotent.
    pub fn close(
        &self,
        data: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<Option<ShellFuture>, CmError> {
        let Some(session) = self.session() else {
            return Ok(None);
        };
        let content = serde_json::json!({
            "comm_id": self.inner.comm_id,
            "data": data,
        });
        let msg = session.build_message(
            "comm_close",
            JupyterChannel::Shell,
            content.clone(),
            metadata.clone(),
            vec![],
        );
        let future = session.send_shell_message(msg, false, true)?;

        // The local close notification is iopub-shaped, with the channel and
        // message type set explicitly rather than inherited from the request.
        let synthetic =
            session.build_message("comm_close", JupyterChannel::IOPub, content, metadata, vec![]);
        self.invoke_on_close(&synthetic);
        self.dispose();
        Ok(Some(future))
    }

    /// Dispose the comm: clear callbacks, drop the session back-reference,
    /// and unregister from the session. Idempotent.
    pub fn dispose(&self) {
        let session = {
            let mut slot = self.inner.session.lock().unwrap();
            slot.take()
        };
        let Some(session) = session else {
            return;
        };
        *self.inner.on_msg.lock().unwrap() = None;
        *self.inner.on_close.lock().unwrap() = None;
        if let Some(session) = session.upgrade() {
            session.unregister_comm(&self.inner.comm_id);
        }
    }

    pub(crate) fn invoke_on_msg(&self, msg: &JupyterMessage) {
        let callback = self.inner.on_msg.lock().unwrap().take();
        if let Some(mut callback) = callback {
            callback(msg);
            let mut slot = self.inner.on_msg.lock().unwrap();
            if slot.is_none() && !self.is_disposed() {
                *slot = Some(callback);
            }
        }
    }

    pub(crate) fn invoke_on_close(&self, msg: &JupyterMessage) {
        let callback = self.inner.on_close.lock().unwrap().take();
        if let Some(mut callback) = callback {
            callback(msg);
        }
    }

    fn session(&self) -> Option<KernelSession> {
        let slot = self.inner.session.lock().unwrap();
        slot.as_ref().and_then(|session| session.upgrade())
    }
}
