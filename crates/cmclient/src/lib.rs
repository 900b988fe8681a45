//! Client runtime for Jupyter-style kernel messaging.
//!
//! This crate manages kernels on a notebook server over REST and speaks the
//! Jupyter messaging protocol to them over a multiplexed websocket: one
//! session per kernel attachment, shell request futures, comm channels, and
//! automatic reconnection with exponential backoff.

pub mod comm;
pub mod error;
pub mod future;
mod jupyter_messages;
pub mod kernel_session;
pub mod manager;
pub mod rest;
mod session_registry;
pub mod signal;

pub use comm::Comm;
pub use error::CmError;
pub use future::ShellFuture;
pub use kernel_session::{
    CommTargetHandler, CommTargetRegistration, CommTargetResolver, KernelSession,
    MessageHookRegistration, SessionEvents,
};
pub use manager::KernelManager;
pub use rest::{ServerSettings, SettingsOverrides};
