//
// models.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A kernel as reported by the notebook server. Immutable for a live kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelModel {
    /// The server-assigned kernel ID
    pub id: String,

    /// The name of the kernel spec the kernel was started from
    pub name: String,
}

/// The command and environment needed to launch a kernel.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelSpec {
    /// The name to display for the kernel in user interfaces
    pub display_name: String,

    /// The language the kernel implements
    pub language: String,

    /// The command line used to start the kernel
    pub argv: Vec<String>,

    /// Environment variables to set when starting the kernel
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Additional spec metadata
    pub metadata: Option<serde_json::Value>,
}

/// One entry in the server's kernel spec collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelSpecModel {
    /// The name of the kernel spec
    pub name: String,

    /// The launch description for the kernel
    pub spec: KernelSpec,

    /// Resource files (icons, etc.) keyed by name
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

/// The full kernel spec collection reported by the server.
///
/// The map is ordered by spec name so that fallback selection of a default is
/// deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelSpecs {
    /// The name of the default kernel spec
    pub default: String,

    /// All valid kernel specs, keyed by name
    pub kernelspecs: BTreeMap<String, KernelSpecModel>,
}

/// The coarse lifecycle status of a kernel session, shared between the
/// transport and the kernel itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The kernel's status is not yet known
    Unknown,

    /// The kernel is starting up
    Starting,

    /// The kernel is idle and ready for requests
    Idle,

    /// The kernel is processing a request
    Busy,

    /// The kernel is restarting
    Restarting,

    /// The websocket connection is being re-established
    Reconnecting,

    /// The kernel is gone; terminal
    Dead,
}

impl Status {
    /// Whether the session can transmit messages in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Starting | Status::Idle | Status::Busy)
    }

    /// Whether this status is terminal.
    pub fn is_final(&self) -> bool {
        matches!(self, Status::Dead)
    }

    /// Map an iopub `execution_state` value onto a status. Returns `None` for
    /// values this client does not recognize.
    pub fn from_execution_state(state: &str) -> Option<Status> {
        match state {
            "starting" => Some(Status::Starting),
            "idle" => Some(Status::Idle),
            "busy" => Some(Status::Busy),
            "restarting" => Some(Status::Restarting),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Unknown => write!(f, "unknown"),
            Status::Starting => write!(f, "starting"),
            Status::Idle => write!(f, "idle"),
            Status::Busy => write!(f, "busy"),
            Status::Restarting => write!(f, "restarting"),
            Status::Reconnecting => write!(f, "reconnecting"),
            Status::Dead => write!(f, "dead"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_readiness() {
        assert!(Status::Starting.is_active());
        assert!(Status::Idle.is_active());
        assert!(Status::Busy.is_active());
        assert!(!Status::Restarting.is_active());
        assert!(!Status::Reconnecting.is_active());
        assert!(!Status::Dead.is_active());
        assert!(Status::Dead.is_final());
    }

    #[test]
    fn test_execution_state_mapping() {
        assert_eq!(Status::from_execution_state("idle"), Some(Status::Idle));
        assert_eq!(Status::from_execution_state("busy"), Some(Status::Busy));
        assert_eq!(
            Status::from_execution_state("starting"),
            Some(Status::Starting)
        );
        assert_eq!(Status::from_execution_state("daydreaming"), None);
    }

    #[test]
    fn test_kernel_spec_model_requires_spec_fields() {
        let valid = serde_json::json!({
            "name": "python3",
            "spec": {
                "display_name": "Python 3",
                "language": "python",
                "argv": ["python", "-m", "ipykernel", "-f", "{connection_file}"]
            },
            "resources": {}
        });
        assert!(serde_json::from_value::<KernelSpecModel>(valid).is_ok());

        let missing_language = serde_json::json!({
            "name": "broken",
            "spec": {
                "display_name": "Broken",
                "argv": ["broken"]
            }
        });
        assert!(serde_json::from_value::<KernelSpecModel>(missing_language).is_err());
    }
}
