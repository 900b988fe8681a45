//
// state.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cmshared::jupyter_message::JupyterMessage;
use cmshared::models::{KernelSpecModel, Status};
use futures::future::BoxFuture;

use crate::comm::Comm;
use crate::future::FutureShared;

/// The default number of consecutive reconnect attempts before a session is
/// declared dead.
pub(crate) const RECONNECT_LIMIT: u32 = 7;

/// A handler invoked when the kernel opens a comm against a registered
/// target. The handler runs with a freshly constructed comm and the original
/// comm_open message; the comm goes live once the returned future resolves.
pub type CommTargetHandler =
    Arc<dyn Fn(Comm, JupyterMessage) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

/// A pluggable fallback resolver consulted when a comm_open names a target
/// that is not in the registry. Receives the target name and the optional
/// target module from the message. Registry entries always win.
pub type CommTargetResolver =
    Arc<dyn Fn(&str, Option<&str>) -> Option<CommTargetHandler> + Send + Sync>;

/// A comm_open whose target handler has not yet resolved. Messages for the
/// comm that race the open are queued here and delivered in arrival order
/// once the handler completes.
pub(crate) struct InFlightCommOpen {
    pub queued: Vec<JupyterMessage>,
}

/// The mutable state of a kernel session.
pub(crate) struct SessionState {
    /// The kernel's current status
    pub status: Status,

    /// Whether the transport will accept messages (derived from status)
    pub ready: bool,

    /// Whether the current socket has completed its kernel_info handshake
    pub connection_ready: bool,

    /// Whether the session has been disposed; terminal
    pub disposed: bool,

    /// Set by a manual reconnect request to skip the backoff delay
    pub manual_reconnect: bool,

    /// Whether the socket supervisor task is running
    pub supervisor_running: bool,

    /// Consecutive failed connection attempts
    pub reconnect_attempt: u32,

    /// Attempt limit before the session is declared dead
    pub reconnect_limit: u32,

    /// Messages pulled from the outbound channel but not yet transmitted
    /// (the send failed, or readiness lapsed first); sent ahead of the
    /// channel at the next writable opportunity
    pub pending: VecDeque<JupyterMessage>,

    /// Outstanding shell exchanges, keyed by request msg_id
    pub futures: HashMap<String, Arc<FutureShared>>,

    /// Live comms, keyed by comm_id
    pub comms: HashMap<String, Comm>,

    /// comm_opens whose target handler is still resolving, keyed by comm_id
    pub comm_opens: HashMap<String, InFlightCommOpen>,

    /// Registered comm targets, keyed by target name
    pub targets: HashMap<String, CommTargetHandler>,

    /// Fallback target resolver, consulted after the registry
    pub target_resolver: Option<CommTargetResolver>,

    /// Cached kernel_info_reply content from the most recent handshake
    pub kernel_info: Option<serde_json::Value>,

    /// Cached kernel spec, fetched at most once
    pub kernel_spec: Option<KernelSpecModel>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        SessionState {
            status: Status::Unknown,
            ready: false,
            connection_ready: false,
            disposed: false,
            manual_reconnect: false,
            supervisor_running: false,
            reconnect_attempt: 0,
            reconnect_limit: RECONNECT_LIMIT,
            pending: VecDeque::new(),
            futures: HashMap::new(),
            comms: HashMap::new(),
            comm_opens: HashMap::new(),
            targets: HashMap::new(),
            target_resolver: None,
            kernel_info: None,
            kernel_spec: None,
        }
    }
}
