//
// future.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Per-request state machines for shell exchanges.
//!
//! A `ShellFuture` tracks one shell request through its shell reply and the
//! iopub status message that marks the kernel idle again. The future is done
//! once both have arrived (or just the idle, when no reply is expected); the
//! done callback fires exactly once.

use std::sync::{Arc, Mutex};

use cmshared::jupyter_message::{JupyterChannel, JupyterMessage};
use event_listener::Event;

use crate::error::CmError;
use crate::kernel_session::SessionRef;

/// A callback invoked with an inbound message.
pub type MessageCallback = Box<dyn FnMut(&JupyterMessage) + Send>;

/// A preemptive filter over iopub delivery. Returning `Ok(false)` suppresses
/// the remaining hooks and the iopub callback for that message; an error is
/// logged and iteration continues.
pub type IOPubHook = Box<dyn FnMut(&JupyterMessage) -> Result<bool, anyhow::Error> + Send>;

struct HookEntry {
    id: u64,
    // Empty while the hook is being invoked
    hook: Option<IOPubHook>,
}

struct FutureState {
    dispose_on_done: bool,
    got_reply: bool,
    got_idle: bool,
    done: bool,
    disposed: bool,
    reply: Option<JupyterMessage>,
    on_reply: Option<MessageCallback>,
    on_iopub: Option<MessageCallback>,
    on_stdin: Option<MessageCallback>,
    on_done: Option<Box<dyn FnOnce() + Send>>,
    hooks: Vec<HookEntry>,
    next_hook_id: u64,
}

pub(crate) struct FutureShared {
    msg: JupyterMessage,
    state: Mutex<FutureState>,
    reply_event: Event,
    done_event: Event,
    session: SessionRef,
}

impl FutureShared {
    pub(crate) fn new(
        msg: JupyterMessage,
        expect_reply: bool,
        dispose_on_done: bool,
        session: SessionRef,
    ) -> Arc<FutureShared> {
        Arc::new(FutureShared {
            msg,
            state: Mutex::new(FutureState {
                dispose_on_done,
                got_reply: !expect_reply,
                got_idle: false,
                done: false,
                disposed: false,
                reply: None,
                on_reply: None,
                on_iopub: None,
                on_stdin: None,
                on_done: None,
                hooks: Vec::new(),
                next_hook_id: 0,
            }),
            reply_event: Event::new(),
            done_event: Event::new(),
            session,
        })
    }

    pub(crate) fn msg_id(&self) -> &str {
        &self.msg.header.msg_id
    }

    /// Route an inbound message with this future's parent msg_id.
    pub(crate) fn handle_message(&self, msg: &JupyterMessage) {
        match msg.channel {
            JupyterChannel::Shell => self.handle_reply(msg),
            JupyterChannel::Stdin => self.handle_stdin(msg),
            JupyterChannel::IOPub => self.handle_iopub(msg),
            // Shell futures do not track control exchanges
            JupyterChannel::Control => {}
        }
    }

    fn handle_reply(&self, msg: &JupyterMessage) {
        let callback = self.state.lock().unwrap().on_reply.take();
        if let Some(mut callback) = callback {
            callback(msg);
            let mut state = self.state.lock().unwrap();
            if !state.disposed && state.on_reply.is_none() {
                state.on_reply = Some(callback);
            }
        }

        let done = {
            let mut state = self.state.lock().unwrap();
            state.got_reply = true;
            state.reply = Some(msg.clone());
            state.got_idle && !state.done
        };
        self.reply_event.notify(usize::MAX);
        if done {
            self.mark_done();
        }
    }

    fn handle_stdin(&self, msg: &JupyterMessage) {
        let callback = self.state.lock().unwrap().on_stdin.take();
        if let Some(mut callback) = callback {
            callback(msg);
            let mut state = self.state.lock().unwrap();
            if !state.disposed && state.on_stdin.is_none() {
                state.on_stdin = Some(callback);
            }
        }
    }

    fn handle_iopub(&self, msg: &JupyterMessage) {
        let suppressed = self.run_hooks(msg);
        if !suppressed {
            let callback = self.state.lock().unwrap().on_iopub.take();
            if let Some(mut callback) = callback {
                callback(msg);
                let mut state = self.state.lock().unwrap();
                if !state.disposed && state.on_iopub.is_none() {
                    state.on_iopub = Some(callback);
                }
            }
        }

        if msg.execution_state() == Some("idle") {
            let done = {
                let mut state = self.state.lock().unwrap();
                state.got_idle = true;
                state.got_reply && !state.done
            };
            if done {
                self.mark_done();
            }
        }
    }

    /// Run the hook stack, most recently registered first. Returns whether a
    /// hook suppressed delivery. Hooks registered during iteration are
    /// deferred to the next message; hooks removed during iteration are
    /// skipped.
    fn run_hooks(&self, msg: &JupyterMessage) -> bool {
        let ids: Vec<u64> = {
            let state = self.state.lock().unwrap();
            state.hooks.iter().map(|entry| entry.id).collect()
        };

        for id in ids.into_iter().rev() {
            let hook = {
                let mut state = self.state.lock().unwrap();
                match state.hooks.iter_mut().find(|entry| entry.id == id) {
                    Some(entry) => entry.hook.take(),
                    None => continue,
                }
            };
            let Some(mut hook) = hook else { continue };
            let result = hook(msg);
            {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.hooks.iter_mut().find(|entry| entry.id == id) {
                    if entry.hook.is_none() {
                        entry.hook = Some(hook);
                    }
                }
            }
            match result {
                Ok(true) => {}
                Ok(false) => return true,
                Err(e) => {
                    log::error!(
                        "IOPub hook for request {} failed: {}",
                        self.msg.header.msg_id,
                        e
                    );
                }
            }
        }
        false
    }

    fn mark_done(&self) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            if state.done {
                return;
            }
            state.done = true;
            state.on_done.take()
        };
        if let Some(callback) = callback {
            callback();
        }
        self.done_event.notify(usize::MAX);

        let dispose = self.state.lock().unwrap().dispose_on_done;
        if dispose {
            self.dispose();
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    pub(crate) fn add_hook(&self, hook: IOPubHook) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_hook_id;
        state.next_hook_id += 1;
        state.hooks.push(HookEntry {
            id,
            hook: Some(hook),
        });
        id
    }

    pub(crate) fn remove_hook(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.hooks.retain(|entry| entry.id != id);
    }

    /// Dispose the future: clear callbacks and hooks, wake any waiters, and
    /// remove it from the owning session's map. Idempotent.
    pub(crate) fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.on_reply = None;
            state.on_iopub = None;
            state.on_stdin = None;
            state.on_done = None;
            state.hooks.clear();
        }
        self.reply_event.notify(usize::MAX);
        self.done_event.notify(usize::MAX);
        if let Some(session) = self.session.upgrade() {
            session.unregister_future(&self.msg.header.msg_id);
        }
    }
}

/// A handle to the state machine tracking one shell exchange.
#[derive(Clone)]
pub struct ShellFuture {
    shared: Arc<FutureShared>,
}

impl ShellFuture {
    pub(crate) fn from_shared(shared: Arc<FutureShared>) -> Self {
        ShellFuture { shared }
    }

    /// The request message this future is tracking.
    pub fn message(&self) -> &JupyterMessage {
        &self.shared.msg
    }

    /// Set the callback invoked with the shell reply.
    pub fn on_reply(&self, callback: impl FnMut(&JupyterMessage) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.disposed {
            state.on_reply = Some(Box::new(callback));
        }
    }

    /// Set the callback invoked with each iopub message for this request.
    pub fn on_iopub(&self, callback: impl FnMut(&JupyterMessage) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.disposed {
            state.on_iopub = Some(Box::new(callback));
        }
    }

    /// Set the callback invoked with stdin-channel messages (input requests).
    pub fn on_stdin(&self, callback: impl FnMut(&JupyterMessage) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.disposed {
            state.on_stdin = Some(Box::new(callback));
        }
    }

    /// Set the callback invoked once when the exchange completes.
    pub fn on_done(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.disposed && !state.done {
            state.on_done = Some(Box::new(callback));
        }
    }

    /// Register an iopub hook. The most recently registered hook runs first.
    /// Returns an ID usable with `remove_iopub_hook`.
    pub fn add_iopub_hook(
        &self,
        hook: impl FnMut(&JupyterMessage) -> Result<bool, anyhow::Error> + Send + 'static,
    ) -> u64 {
        self.shared.add_hook(Box::new(hook))
    }

    /// Remove a previously registered iopub hook. Takes effect immediately,
    /// even mid-iteration.
    pub fn remove_iopub_hook(&self, id: u64) {
        self.shared.remove_hook(id)
    }

    /// Whether the exchange has completed.
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Wait for the shell reply.
    pub async fn reply(&self) -> Result<JupyterMessage, CmError> {
        loop {
            let listener = self.shared.reply_event.listen();
            {
                let state = self.shared.state.lock().unwrap();
                if let Some(reply) = &state.reply {
                    return Ok(reply.clone());
                }
                if state.disposed {
                    return Err(CmError::Disposed);
                }
            }
            listener.await;
        }
    }

    /// Wait until the exchange completes (or the future is disposed).
    pub async fn done(&self) {
        loop {
            let listener = self.shared.done_event.listen();
            {
                let state = self.shared.state.lock().unwrap();
                if state.done || state.disposed {
                    return;
                }
            }
            listener.await;
        }
    }

    /// Dispose the future. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose()
    }
}
