//
// error.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::fmt;

use log::error;

/// Errors surfaced to callers of the client runtime.
///
/// Conditions that are logged but never surfaced (messages for unknown comms,
/// undecodable inbound frames, failures inside user callbacks) do not appear
/// here; the session logs them and keeps going.
#[repr(u8)]
pub enum CmError {
    /// The HTTP or websocket transport failed outright
    Network(anyhow::Error),

    /// The server answered with an unexpected HTTP status
    BadStatus {
        url: String,
        expected: u16,
        actual: u16,
    },

    /// The server's response did not match the expected schema
    InvalidResponse(String),

    /// The operation was attempted against a dead kernel
    KernelDead,

    /// No kernel with the given ID is known to the server
    NoSuchKernel(String),

    /// The object backing the operation has been disposed
    Disposed,

    /// The websocket connection failed while sending
    WebSocket(anyhow::Error),

    /// An outbound message could not be framed
    Serialization(anyhow::Error),
}

impl fmt::Display for CmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error CM-{}: ", self.discriminant())?;
        match self {
            CmError::Network(err) => {
                write!(f, "Network request failed: {}", err)
            }
            CmError::BadStatus {
                url,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Unexpected status {} from {} (expected {})",
                    actual, url, expected
                )
            }
            CmError::InvalidResponse(what) => {
                write!(f, "Invalid server response: {}", what)
            }
            CmError::KernelDead => {
                write!(f, "The kernel is dead")
            }
            CmError::NoSuchKernel(id) => {
                write!(f, "No kernel with ID {}", id)
            }
            CmError::Disposed => {
                write!(f, "The object has been disposed")
            }
            CmError::WebSocket(err) => {
                write!(f, "Websocket send failed: {}", err)
            }
            CmError::Serialization(err) => {
                write!(f, "Failed to serialize message: {}", err)
            }
        }
    }
}

impl fmt::Debug for CmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for CmError {}

impl CmError {
    #[allow(unsafe_code, trivial_casts)]
    fn discriminant(&self) -> u8 {
        unsafe { *(self as *const Self as *const u8) }
    }

    pub fn log(&self) {
        error!("{}", self.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_error_code() {
        let err = CmError::KernelDead;
        assert!(err.to_string().starts_with("Error CM-"));
        assert!(err.to_string().contains("dead"));
    }
}
