// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime: the per-process entry point that attaches both tables, starts
//! the Heartbeat Monitor, and exposes the register/find/unregister surface
//! to application code (spec.md §4.8).

use crate::config::RuntimeConfig;
use crate::error::{RegistryError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::ipc::TableClient;
use crate::registry::{DualRegistry, ServiceRegistration};
use crate::slot::SlotSnapshot;
use std::sync::{Arc, Mutex};

/// Per-process runtime handle.
///
/// Unlike the original's function-local singleton (`Runtime::GetInstance`),
/// this is an explicit value type: applications construct one, call
/// [`Runtime::initialize`], use it, and drop it (or call
/// [`Runtime::deinitialize`]) when done. Nothing here relies on process-wide
/// global state, which makes multiple independent runtimes in one process —
/// and deterministic tests — possible.
pub struct Runtime {
    config: RuntimeConfig,
    state: Option<RuntimeState>,
}

struct RuntimeState {
    registry: Arc<DualRegistry>,
    owned_service_ids: Arc<Mutex<Vec<u16>>>,
    heartbeat: HeartbeatMonitor,
}

impl Runtime {
    /// Build a not-yet-initialized runtime from configuration.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config, state: None }
    }

    /// Attach to both the QM and ASIL initializer sockets and start the
    /// Heartbeat Monitor (spec.md §4.8 step list). Calling this twice
    /// without an intervening [`Runtime::deinitialize`] is an
    /// `InvalidState` error.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(RegistryError::InvalidState(
                "initialize() called while already initialized".to_string(),
            ));
        }

        let qm_client = TableClient::attach(&self.config.qm_socket_path)?;
        let asil_client = match TableClient::attach(&self.config.asil_socket_path) {
            Ok(client) => client,
            Err(e) if self.config.allow_qm_only_degraded_mode => {
                log::warn!(
                    "[runtime] ASIL attach failed ({e}); continuing in QM-only degraded mode"
                );
                return self.initialize_qm_only(qm_client.into_table());
            }
            Err(e) => return Err(e),
        };

        let registry = Arc::new(DualRegistry::new(qm_client.into_table(), asil_client.into_table()));
        let owned_service_ids = Arc::new(Mutex::new(Vec::new()));
        let heartbeat = HeartbeatMonitor::spawn(
            Arc::clone(&registry),
            Arc::clone(&owned_service_ids),
            self.config.heartbeat_interval_ms,
            self.config.enable_reaper,
            self.config.reaper_stale_multiplier,
        );

        self.state = Some(RuntimeState {
            registry,
            owned_service_ids,
            heartbeat,
        });
        Ok(())
    }

    /// Degraded-mode initialization path: QM table only, ASIL calls return
    /// `InvalidArgument` as if routed to an unpopulated table (spec.md §7
    /// `PermissionDenied` discussion — this is the explicit opt-in escape
    /// hatch, not the default).
    fn initialize_qm_only(&mut self, qm_table: crate::table::Table) -> Result<()> {
        let asil_placeholder = crate::table::Table::create(&format!(
            "/lap_degraded_unused_{}",
            std::process::id()
        ))?;
        let registry = Arc::new(DualRegistry::new(qm_table, asil_placeholder));
        let owned_service_ids = Arc::new(Mutex::new(Vec::new()));
        let heartbeat = HeartbeatMonitor::spawn(
            Arc::clone(&registry),
            Arc::clone(&owned_service_ids),
            self.config.heartbeat_interval_ms,
            self.config.enable_reaper,
            self.config.reaper_stale_multiplier,
        );
        self.state = Some(RuntimeState {
            registry,
            owned_service_ids,
            heartbeat,
        });
        Ok(())
    }

    /// Stop the Heartbeat Monitor and drop both table mappings. Safe to
    /// call when not initialized (no-op).
    pub fn deinitialize(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.heartbeat.shutdown();
        }
    }

    fn state(&self) -> Result<&RuntimeState> {
        self.state.as_ref().ok_or(RegistryError::NotInitialized)
    }

    /// Register a service and remember it as owned by this process for the
    /// Heartbeat Monitor's refresh cycle.
    pub fn register_service(
        &self,
        service_id: u16,
        registration: &ServiceRegistration,
    ) -> Result<()> {
        let state = self.state()?;
        state.registry.register_service(service_id, registration)?;
        let mut owned = state.owned_service_ids.lock().unwrap_or_else(|e| e.into_inner());
        if !owned.contains(&service_id) {
            owned.push(service_id);
        }
        Ok(())
    }

    /// Look up a service's current published state.
    pub fn find_service(&self, service_id: u16) -> Result<Option<SlotSnapshot>> {
        self.state()?.registry.find_service(service_id)
    }

    /// Unregister a service and drop it from this process's owned set.
    pub fn unregister_service(&self, service_id: u16) -> Result<()> {
        let state = self.state()?;
        state.registry.unregister_service(service_id)?;
        let mut owned = state.owned_service_ids.lock().unwrap_or_else(|e| e.into_inner());
        owned.retain(|&id| id != service_id);
        Ok(())
    }

    /// Direct access to the underlying dual registry, for callers (such as
    /// a binding implementation) that need table-level operations this
    /// facade does not expose.
    pub fn registry(&self) -> Result<&Arc<DualRegistry>> {
        Ok(&self.state()?.registry)
    }

    /// Whether `initialize()` has succeeded and `deinitialize()` has not
    /// since been called.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
