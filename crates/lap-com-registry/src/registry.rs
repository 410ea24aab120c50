// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dual Registry: composes the QM and ASIL tables and routes by
//! service-ID range (spec.md §4.5, §4.6).

use crate::error::{RegistryError, Result};
use crate::slot::{SlotSnapshot, SlotStatus};
use crate::table::{slot_for_service_id, Table, BROADCAST_SLOT};
use crate::{ASIL_SERVICE_ID_RANGE, BROADCAST_SERVICE_ID, QM_SERVICE_ID_RANGE};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which table (or tables) a service ID routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Qm,
    Asil,
    /// `0xFFFF` — written to slot 1023 of both tables.
    Broadcast,
}

/// Classify a service ID per spec.md §3.4. `Err(InvalidArgument)` for
/// anything outside the three named ranges.
pub fn route_service_id(service_id: u16) -> Result<Route> {
    if service_id == BROADCAST_SERVICE_ID {
        Ok(Route::Broadcast)
    } else if QM_SERVICE_ID_RANGE.contains(&service_id) {
        Ok(Route::Qm)
    } else if ASIL_SERVICE_ID_RANGE.contains(&service_id) {
        Ok(Route::Asil)
    } else {
        Err(RegistryError::InvalidArgument(format!(
            "service_id 0x{service_id:04x} is outside the QM (0x0001-0x03FF), \
             ASIL (0xF001-0xF3FE) and broadcast (0xFFFF) ranges"
        )))
    }
}

/// A fully-populated service registration, as passed to
/// [`DualRegistry::register_service`].
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub instance_id: u64,
    pub major_version: u32,
    pub minor_version: u32,
    pub binding_type: String,
    pub endpoint: String,
    pub heartbeat_interval_ms: u32,
    pub metadata: String,
}

/// The QM/ASIL dual registry: the public surface the Runtime delegates to
/// (spec.md §4.5).
pub struct DualRegistry {
    qm: Table,
    asil: Table,
}

impl DualRegistry {
    /// Compose a registry from two already-attached (or freshly created)
    /// tables.
    #[must_use]
    pub fn new(qm: Table, asil: Table) -> Self {
        Self { qm, asil }
    }

    #[must_use]
    pub fn qm_table(&self) -> &Table {
        &self.qm
    }

    #[must_use]
    pub fn asil_table(&self) -> &Table {
        &self.asil
    }

    /// `register_service` (spec.md §4.5). Fails with `SlotOccupied` unless
    /// the routed slot is currently `IDLE`; broadcast succeeds if at least
    /// one of the two tables accepts the claim, logging a warning for the
    /// other.
    pub fn register_service(
        &self,
        service_id: u16,
        registration: &ServiceRegistration,
    ) -> Result<()> {
        match route_service_id(service_id)? {
            Route::Qm => self.register_in(&self.qm, service_id, registration),
            Route::Asil => self.register_in(&self.asil, service_id, registration),
            Route::Broadcast => {
                let qm_result = self.register_in(&self.qm, service_id, registration);
                let asil_result = self.register_in(&self.asil, service_id, registration);
                match (&qm_result, &asil_result) {
                    (Ok(()), Ok(())) => Ok(()),
                    (Ok(()), Err(e)) => {
                        log::warn!("[registry] broadcast partial failure on ASIL table: {e}");
                        Ok(())
                    }
                    (Err(e), Ok(())) => {
                        log::warn!("[registry] broadcast partial failure on QM table: {e}");
                        Ok(())
                    }
                    (Err(_), Err(_)) => qm_result,
                }
            }
        }
    }

    fn register_in(
        &self,
        table: &Table,
        service_id: u16,
        registration: &ServiceRegistration,
    ) -> Result<()> {
        let idx = slot_for_service_id(u64::from(service_id));
        let now = now_ns();
        let pid = std::process::id() as i32;

        let claimed = table.try_register_slot(idx, |f| {
            f.set_service_id(u64::from(service_id));
            f.set_instance_id(registration.instance_id);
            f.set_major_version(registration.major_version);
            f.set_minor_version(registration.minor_version);
            f.set_binding_type(&registration.binding_type);
            f.set_endpoint(&registration.endpoint);
            f.set_last_heartbeat_ns(now);
            f.set_heartbeat_interval_ms(registration.heartbeat_interval_ms);
            f.set_owner_pid(pid);
            f.set_metadata(&registration.metadata);
            f.set_status(SlotStatus::Active);
        })?;

        if claimed {
            Ok(())
        } else {
            Err(RegistryError::SlotOccupied {
                service_id: u64::from(service_id),
                slot: idx,
            })
        }
    }

    /// `find_service` (spec.md §4.5, §4.6). Returns `None` for an unstable
    /// read, an `IDLE`/mismatched slot, or an invalid service ID's range
    /// error propagated as `None` is *not* done here — callers that pass
    /// an invalid ID still get `Err(InvalidArgument)`.
    pub fn find_service(&self, service_id: u16) -> Result<Option<SlotSnapshot>> {
        match route_service_id(service_id)? {
            Route::Qm => Ok(self.find_in(&self.qm, service_id)),
            Route::Asil => Ok(self.find_in(&self.asil, service_id)),
            Route::Broadcast => {
                // spec.md §4.6: convention reads QM's slot 1023, but prefer
                // ASIL if both are populated.
                let asil = self.find_in(&self.asil, service_id);
                if asil.is_some() {
                    Ok(asil)
                } else {
                    Ok(self.find_in(&self.qm, service_id))
                }
            }
        }
    }

    fn find_in(&self, table: &Table, service_id: u16) -> Option<SlotSnapshot> {
        let idx = slot_for_service_id(u64::from(service_id));
        let snap = match table.read_slot(idx) {
            Ok(snap) => snap,
            Err(RegistryError::Unstable) => return None,
            Err(_) => return None,
        };
        if snap.status != SlotStatus::Active || snap.service_id != u64::from(service_id) {
            return None;
        }
        Some(snap)
    }

    /// `unregister_service` (spec.md §4.5). Idempotent: unregistering an
    /// already-`IDLE` slot is a no-op success. Non-owners are not
    /// cryptographically prevented from calling this.
    pub fn unregister_service(&self, service_id: u16) -> Result<()> {
        match route_service_id(service_id)? {
            Route::Qm => self.qm.reset_slot(slot_for_service_id(u64::from(service_id))),
            Route::Asil => self
                .asil
                .reset_slot(slot_for_service_id(u64::from(service_id))),
            Route::Broadcast => {
                let qm_result = self.qm.reset_slot(BROADCAST_SLOT);
                let asil_result = self.asil.reset_slot(BROADCAST_SLOT);
                qm_result.and(asil_result)
            }
        }
    }

    /// `update_heartbeat` (spec.md §4.5): a seqlock write of only
    /// `last_heartbeat_ns` on the routed slot(s).
    pub fn update_heartbeat(&self, service_id: u16, now_ns: u64) -> Result<()> {
        match route_service_id(service_id)? {
            Route::Qm => self.heartbeat_in(&self.qm, service_id, now_ns),
            Route::Asil => self.heartbeat_in(&self.asil, service_id, now_ns),
            Route::Broadcast => {
                let qm_result = self.heartbeat_in(&self.qm, service_id, now_ns);
                let asil_result = self.heartbeat_in(&self.asil, service_id, now_ns);
                qm_result.and(asil_result)
            }
        }
    }

    fn heartbeat_in(&self, table: &Table, service_id: u16, now_ns: u64) -> Result<()> {
        let idx = slot_for_service_id(u64::from(service_id));
        table.write_slot(idx, |f| f.set_last_heartbeat_ns(now_ns))
    }
}

/// Current monotonic-ish timestamp in nanoseconds (wall clock; good enough
/// for the heartbeat freshness comparisons this registry makes — the core
/// never compares timestamps across host reboots).
pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> ServiceRegistration {
        ServiceRegistration {
            instance_id: 0x0001,
            major_version: 1,
            minor_version: 0,
            binding_type: "iceoryx2".to_string(),
            endpoint: "shm://svc_a".to_string(),
            heartbeat_interval_ms: 100,
            metadata: String::new(),
        }
    }

    fn fresh_registry(tag: &str) -> DualRegistry {
        let qm = Table::create(&format!("/lap_test_reg_qm_{tag}")).expect("qm");
        let asil = Table::create(&format!("/lap_test_reg_asil_{tag}")).expect("asil");
        DualRegistry::new(qm, asil)
    }

    #[test]
    fn routes_reject_out_of_range_ids() {
        assert!(route_service_id(0x0000).is_err());
        assert!(route_service_id(0xF000).is_err());
        assert!(route_service_id(0x0400).is_err());
        assert!(route_service_id(0x4000).is_err());
        assert!(route_service_id(0xF3FF).is_err());
        assert!(route_service_id(0x0001).is_ok());
        assert!(route_service_id(0xF3FE).is_ok());
        assert!(route_service_id(0xFFFF).is_ok());
    }

    #[test]
    fn s1_qm_happy_path() {
        let registry = fresh_registry("s1");
        registry
            .register_service(0x0010, &registration())
            .expect("register");

        let found = registry.find_service(0x0010).expect("find").expect("present");
        assert_eq!(found.instance_id, 0x0001);
        assert_eq!(found.major_version, 1);
        assert_eq!(found.binding_type, "iceoryx2");
        assert_eq!(found.endpoint, "shm://svc_a");
        assert!(found.last_heartbeat_ns > 0);
        assert_eq!(slot_for_service_id(0x0010), 16);

        // ASIL table must not see it.
        assert_eq!(registry.asil.read_slot(16).unwrap().status, SlotStatus::Idle);
    }

    #[test]
    fn s2_asil_happy_path_isolated_from_qm() {
        let registry = fresh_registry("s2");
        let mut reg = registration();
        reg.binding_type = "dds".to_string();
        reg.endpoint = "topic://a".to_string();
        registry.register_service(0xF010, &reg).expect("register");

        let found = registry.find_service(0xF010).expect("find").expect("present");
        assert_eq!(found.binding_type, "dds");

        let idx = slot_for_service_id(0xF010);
        assert_eq!(registry.qm.read_slot(idx).unwrap().status, SlotStatus::Idle);
    }

    #[test]
    fn s3_broadcast_populates_both_tables_and_unregister_clears_both() {
        let registry = fresh_registry("s3");
        let mut reg = registration();
        reg.binding_type = "dbus".to_string();
        reg.endpoint = "unix:/tmp/bus".to_string();
        registry
            .register_service(BROADCAST_SERVICE_ID, &reg)
            .expect("register broadcast");

        assert_eq!(
            registry.qm.read_slot(BROADCAST_SLOT).unwrap().status,
            SlotStatus::Active
        );
        assert_eq!(
            registry.asil.read_slot(BROADCAST_SLOT).unwrap().status,
            SlotStatus::Active
        );

        registry
            .unregister_service(BROADCAST_SERVICE_ID)
            .expect("unregister");
        assert_eq!(
            registry.qm.read_slot(BROADCAST_SLOT).unwrap().status,
            SlotStatus::Idle
        );
        assert_eq!(
            registry.asil.read_slot(BROADCAST_SLOT).unwrap().status,
            SlotStatus::Idle
        );
    }

    #[test]
    fn s4_registration_collision_then_retry_after_unregister() {
        let registry = fresh_registry("s4");
        let reg_a = registration();
        registry.register_service(0x0020, &reg_a).expect("first register");

        let mut reg_b = registration();
        reg_b.instance_id = 0x0002;
        let collision = registry.register_service(0x0020, &reg_b);
        assert!(matches!(collision, Err(RegistryError::SlotOccupied { .. })));

        registry.unregister_service(0x0020).expect("unregister");
        registry
            .register_service(0x0020, &reg_b)
            .expect("retry succeeds");
        let found = registry.find_service(0x0020).unwrap().unwrap();
        assert_eq!(found.instance_id, 0x0002);
    }

    #[test]
    fn s5_invalid_range_is_invalid_argument() {
        let registry = fresh_registry("s5");
        assert!(matches!(
            registry.register_service(0x4000, &registration()),
            Err(RegistryError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.find_service(0x0000),
            Err(RegistryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = fresh_registry("idem");
        registry.register_service(0x0030, &registration()).expect("register");
        registry.unregister_service(0x0030).expect("first unregister");
        registry.unregister_service(0x0030).expect("second unregister is a no-op");
        assert!(registry.find_service(0x0030).unwrap().is_none());
    }

    #[test]
    fn find_on_empty_slot_returns_none_not_error() {
        let registry = fresh_registry("empty");
        assert!(registry.find_service(0x0040).unwrap().is_none());
    }

    #[test]
    fn qm_and_asil_segments_are_physically_distinct_objects() {
        // spec.md §8 item 7: the memfds backing the two tables must be
        // different kernel objects, not two mappings of the same one.
        use std::os::unix::io::AsRawFd;

        let registry = fresh_registry("isolation");
        let qm_fd = registry.qm.try_clone_fd().expect("dup qm fd");
        let asil_fd = registry.asil.try_clone_fd().expect("dup asil fd");

        // SAFETY: both fds are valid, freshly duplicated descriptors; this
        // call is read-only and doesn't affect process state.
        let inode_of = |fd: std::os::unix::io::RawFd| -> u64 {
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            let ret = unsafe { libc::fstat(fd, &mut stat) };
            assert_eq!(ret, 0, "fstat should succeed on a valid memfd");
            stat.st_ino
        };

        let qm_inode = inode_of(qm_fd.as_raw_fd());
        let asil_inode = inode_of(asil_fd.as_raw_fd());
        assert_ne!(qm_inode, asil_inode, "QM and ASIL tables must back distinct memfds");
    }
}
