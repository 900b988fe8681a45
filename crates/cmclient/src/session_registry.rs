//
// session_registry.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The process-wide registry of live kernel sessions.
//!
//! A session inserts itself at construction and removes itself at dispose.
//! `find_by_kernel` powers the fast paths in the manager: looking up a
//! running kernel or connecting to one can be answered from here without a
//! network round trip.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::kernel_session::KernelSession;

static LIVE_SESSIONS: OnceLock<Mutex<HashMap<String, KernelSession>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, KernelSession>> {
    LIVE_SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record a newly constructed session.
pub(crate) fn insert(session: &KernelSession) {
    registry()
        .lock()
        .unwrap()
        .insert(session.client_id().to_string(), session.clone());
}

/// Remove a session at dispose time.
pub(crate) fn remove(client_id: &str) {
    registry().lock().unwrap().remove(client_id);
}

/// Find a live session attached to the given kernel, if any.
pub(crate) fn find_by_kernel(kernel_id: &str) -> Option<KernelSession> {
    registry()
        .lock()
        .unwrap()
        .values()
        .find(|session| session.id() == kernel_id)
        .cloned()
}

/// Whether a session with the given client ID is registered.
#[cfg(test)]
pub(crate) fn contains(client_id: &str) -> bool {
    registry().lock().unwrap().contains_key(client_id)
}
