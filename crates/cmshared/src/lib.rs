//! Shared protocol types for the Carme kernel client.

/// Jupyter message types and the message factory
pub mod jupyter_message;

/// Kernel and kernel spec models returned by the notebook server
pub mod models;

/// Binary websocket framing for Jupyter messages
pub mod wire;
