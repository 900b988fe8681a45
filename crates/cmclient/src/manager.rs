//
// manager.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Kernel management against a notebook server.
//!
//! The manager caches default connection settings and the most recently
//! observed running-kernel and kernel-spec payloads; the corresponding
//! signals fire only when an observed payload actually differs from the
//! cached one.

use std::sync::Mutex;

use cmshared::models::{KernelModel, KernelSpecs};

use crate::error::CmError;
use crate::kernel_session::KernelSession;
use crate::rest;
use crate::rest::{ServerSettings, SettingsOverrides};
use crate::session_registry;
use crate::signal::Signal;

pub struct KernelManager {
    settings: ServerSettings,
    running: Mutex<Option<Vec<KernelModel>>>,
    specs: Mutex<Option<KernelSpecs>>,

    /// Fires when the observed set of running kernels changes
    pub running_changed: Signal<Vec<KernelModel>>,

    /// Fires when the observed kernel spec collection changes
    pub specs_changed: Signal<KernelSpecs>,
}

impl KernelManager {
    pub fn new(settings: ServerSettings) -> Self {
        KernelManager {
            settings,
            running: Mutex::new(None),
            specs: Mutex::new(None),
            running_changed: Signal::new(),
            specs_changed: Signal::new(),
        }
    }

    /// The manager's default connection settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn effective(&self, overrides: Option<&SettingsOverrides>) -> ServerSettings {
        match overrides {
            Some(overrides) => self.settings.with_overrides(overrides),
            None => self.settings.clone(),
        }
    }

    /// Start a kernel from the named spec and open a session to it.
    pub async fn start_kernel(
        &self,
        name: &str,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<KernelSession, CmError> {
        let settings = self.effective(overrides);
        let model = rest::start_kernel(&settings, name).await?;
        log::debug!("Started kernel {} ({})", model.id, model.name);
        let session = KernelSession::new(settings, model, default_username());
        session.connect().await?;
        Ok(session)
    }

    /// List the kernels running on the server.
    pub async fn list_kernels(
        &self,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<Vec<KernelModel>, CmError> {
        let settings = self.effective(overrides);
        let kernels = rest::list_kernels(&settings).await?;
        let changed = {
            let mut cached = self.running.lock().unwrap();
            let changed = cached.as_ref() != Some(&kernels);
            *cached = Some(kernels.clone());
            changed
        };
        if changed {
            self.running_changed.emit(kernels.clone());
        }
        Ok(kernels)
    }

    /// Find a kernel by ID. Live sessions are consulted before the server;
    /// a miss on both sides is `Ok(None)`.
    pub async fn find_by_id(
        &self,
        id: &str,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<Option<KernelModel>, CmError> {
        if let Some(session) = session_registry::find_by_kernel(id) {
            return Ok(Some(session.model()));
        }
        let settings = self.effective(overrides);
        match rest::get_kernel(&settings, id).await {
            Ok(model) => Ok(Some(model)),
            Err(CmError::NoSuchKernel(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Connect to a running kernel. When a live session for the kernel
    /// already exists, the new session is a clone of it: same kernel ID and
    /// name, fresh client ID. Otherwise the kernel is confirmed with the
    /// server first.
    pub async fn connect_to(
        &self,
        id: &str,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<KernelSession, CmError> {
        if let Some(existing) = session_registry::find_by_kernel(id) {
            return existing.clone_session().await;
        }
        let settings = self.effective(overrides);
        let model = rest::get_kernel(&settings, id).await?;
        let session = KernelSession::new(settings, model, default_username());
        session.connect().await?;
        Ok(session)
    }

    /// Interrupt a kernel by ID.
    pub async fn interrupt_kernel(
        &self,
        id: &str,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<(), CmError> {
        rest::interrupt_kernel(&self.effective(overrides), id).await
    }

    /// Restart a kernel by ID.
    pub async fn restart_kernel(
        &self,
        id: &str,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<KernelModel, CmError> {
        rest::restart_kernel(&self.effective(overrides), id).await
    }

    /// Shut down a kernel by ID, disposing any live session attached to it.
    pub async fn shutdown_kernel(
        &self,
        id: &str,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<(), CmError> {
        let settings = self.effective(overrides);
        rest::shutdown_kernel(&settings, id).await?;
        if let Some(session) = session_registry::find_by_kernel(id) {
            session.dispose();
        }
        Ok(())
    }

    /// Fetch the server's kernel specs.
    pub async fn kernel_specs(
        &self,
        overrides: Option<&SettingsOverrides>,
    ) -> Result<KernelSpecs, CmError> {
        let settings = self.effective(overrides);
        let specs = rest::get_kernel_specs(&settings).await?;
        let changed = {
            let mut cached = self.specs.lock().unwrap();
            let changed = cached.as_ref() != Some(&specs);
            *cached = Some(specs.clone());
            changed
        };
        if changed {
            self.specs_changed.emit(specs.clone());
        }
        Ok(specs)
    }
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
