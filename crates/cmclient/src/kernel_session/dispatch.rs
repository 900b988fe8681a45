//
// dispatch.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Inbound message dispatch.
//!
//! Messages route first to the future tracking their parent request, then —
//! on iopub — through the status machine and the comm protocol. Dispatch
//! errors never propagate; they are logged and the session keeps going.

use cmshared::jupyter_message::{JupyterChannel, JupyterMessage};
use cmshared::models::Status;
use cmshared::wire;

use crate::comm::Comm;
use crate::jupyter_messages::{CommCloseContent, CommMsgContent, CommOpenContent, JupyterMsg};
use crate::kernel_session::state::InFlightCommOpen;
use crate::kernel_session::KernelSession;

/// Decode one inbound frame and dispatch it. A frame that fails to decode is
/// logged and dropped.
pub(crate) fn handle_frame(session: &KernelSession, data: &[u8]) {
    let msg = match wire::from_frame(data) {
        Ok(msg) => msg,
        Err(e) => {
            log::error!(
                "[session {}] Discarding undecodable frame: {}",
                session.client_id(),
                e
            );
            return;
        }
    };
    handle_message(session, msg);
}

/// Dispatch one inbound message.
pub(crate) fn handle_message(session: &KernelSession, msg: JupyterMessage) {
    // Route to the future tracking the parent request, whatever the channel.
    if let Some(parent) = msg.parent_header.clone() {
        let future = session.lock_state().futures.get(&parent.msg_id).cloned();
        match future {
            Some(future) => future.handle_message(&msg),
            None => {
                // An orphaned reply: one of our requests, but its future is
                // gone (or never existed)
                if msg.channel != JupyterChannel::IOPub && parent.session == session.client_id() {
                    log::trace!(
                        "[session {}] No outstanding request for reply {} (parent {})",
                        session.client_id(),
                        msg.header.msg_id,
                        parent.msg_id
                    );
                    session.events().unhandled_message.emit(msg.clone());
                }
            }
        }
    }

    if msg.channel == JupyterChannel::IOPub {
        match JupyterMsg::from(&msg) {
            JupyterMsg::Status(status) => {
                // Readiness is derived from the status; the socket task's
                // writer re-checks it on its next turn
                match Status::from_execution_state(&status.execution_state) {
                    Some(new_status) => {
                        session.set_status(new_status);
                    }
                    None => {
                        log::warn!(
                            "[session {}] Ignoring unknown execution state '{}'",
                            session.client_id(),
                            status.execution_state
                        );
                    }
                }
            }
            JupyterMsg::CommOpen(content) => handle_comm_open(session, &msg, content),
            JupyterMsg::CommMsg(content) => handle_comm_msg(session, &msg, content),
            JupyterMsg::CommClose(content) => handle_comm_close(session, &msg, content),
            JupyterMsg::Other => {}
        }
        session.events().iopub_message.emit(msg);
    }
}

/// Handle a kernel-initiated comm_open.
///
/// The comm is constructed immediately and the target handler invoked with
/// it; the comm goes live once the handler's future resolves. Messages for
/// the comm that arrive in the meantime are queued on the in-flight entry
/// and delivered in arrival order.
fn handle_comm_open(session: &KernelSession, msg: &JupyterMessage, content: CommOpenContent) {
    let (registered, resolver) = {
        let state = session.lock_state();
        (
            state.targets.get(&content.target_name).cloned(),
            state.target_resolver.clone(),
        )
    };
    // Registry entries win over the fallback resolver
    let handler = registered.or_else(|| {
        resolver
            .and_then(|resolver| resolver(&content.target_name, content.target_module.as_deref()))
    });

    let comm = Comm::new(
        session.downgrade(),
        content.comm_id.clone(),
        content.target_name.clone(),
    );

    let Some(handler) = handler else {
        log::error!(
            "[session {}] No handler for comm target '{}'; closing comm {}",
            session.client_id(),
            content.target_name,
            content.comm_id
        );
        if let Err(e) = comm.close(serde_json::json!({}), serde_json::json!({})) {
            e.log();
        }
        return;
    };

    {
        let mut state = session.lock_state();
        if state.disposed {
            return;
        }
        state
            .comm_opens
            .insert(content.comm_id.clone(), InFlightCommOpen { queued: Vec::new() });
    }

    let handler_future = handler(comm.clone(), msg.clone());
    let session = session.clone();
    let comm_id = content.comm_id;
    tokio::spawn(async move {
        let result = handler_future.await;
        finish_comm_open(&session, &comm_id, comm, result);
    });
}

/// Complete an in-flight comm_open: deliver queued messages in order, then
/// move the comm into the live map. A failed handler closes the comm
/// instead.
fn finish_comm_open(
    session: &KernelSession,
    comm_id: &str,
    comm: Comm,
    result: Result<(), anyhow::Error>,
) {
    if let Err(e) = result {
        log::error!(
            "[session {}] Handler for comm target '{}' failed: {}",
            session.client_id(),
            comm.target_name(),
            e
        );
        let dropped = {
            let mut state = session.lock_state();
            state
                .comm_opens
                .remove(comm_id)
                .map(|entry| entry.queued.len())
                .unwrap_or(0)
        };
        if dropped > 0 {
            log::warn!(
                "[session {}] Dropping {} queued messages for failed comm {}",
                session.client_id(),
                dropped,
                comm_id
            );
        }
        if let Err(e) = comm.close(serde_json::json!({}), serde_json::json!({})) {
            e.log();
        }
        return;
    }

    loop {
        let batch = {
            let mut state = session.lock_state();
            if state.disposed {
                return;
            }
            let Some(entry) = state.comm_opens.get_mut(comm_id) else {
                return;
            };
            if entry.queued.is_empty() {
                state.comm_opens.remove(comm_id);
                state.comms.insert(comm_id.to_string(), comm.clone());
                return;
            }
            std::mem::take(&mut entry.queued)
        };
        let mut batch = batch.into_iter();
        while let Some(queued) = batch.next() {
            match queued.header.msg_type.as_str() {
                "comm_msg" => comm.invoke_on_msg(&queued),
                "comm_close" => {
                    session.lock_state().comm_opens.remove(comm_id);
                    comm.invoke_on_close(&queued);
                    comm.dispose();
                    let remaining = batch.by_ref().count();
                    if remaining > 0 {
                        log::warn!(
                            "[session {}] Dropping {} messages queued after close of comm {}",
                            session.client_id(),
                            remaining,
                            comm_id
                        );
                    }
                    return;
                }
                other => {
                    log::warn!(
                        "[session {}] Unexpected queued message type '{}' for comm {}",
                        session.client_id(),
                        other,
                        comm_id
                    );
                }
            }
        }
    }
}

fn handle_comm_msg(session: &KernelSession, msg: &JupyterMessage, content: CommMsgContent) {
    let comm = {
        let mut state = session.lock_state();
        if let Some(entry) = state.comm_opens.get_mut(&content.comm_id) {
            // The open is still resolving; deliver once it completes
            entry.queued.push(msg.clone());
            return;
        }
        state.comms.get(&content.comm_id).cloned()
    };
    match comm {
        Some(comm) => comm.invoke_on_msg(msg),
        None => {
            log::warn!(
                "[session {}] Message for unknown comm {}",
                session.client_id(),
                content.comm_id
            );
        }
    }
}

fn handle_comm_close(session: &KernelSession, msg: &JupyterMessage, content: CommCloseContent) {
    let comm = {
        let mut state = session.lock_state();
        if let Some(entry) = state.comm_opens.get_mut(&content.comm_id) {
            entry.queued.push(msg.clone());
            return;
        }
        state.comms.remove(&content.comm_id)
    };
    match comm {
        Some(comm) => {
            comm.invoke_on_close(msg);
            comm.dispose();
        }
        None => {
            log::warn!(
                "[session {}] Close for unknown comm {}",
                session.client_id(),
                content.comm_id
            );
        }
    }
}
