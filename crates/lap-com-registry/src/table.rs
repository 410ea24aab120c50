// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-slot table: 1024 [`ServiceSlot`] records packed into one
//! contiguous shared memory region (spec.md §3.2, §4.2).

use crate::error::{RegistryError, Result};
use crate::segment::MemSegment;
use crate::slot::{ClaimOutcome, ServiceSlot, SlotFieldsMut, SlotSnapshot, SlotStatus};
use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::Mutex;

/// Number of slots in a table.
pub const SLOT_COUNT: usize = 1024;
/// Reserved broadcast slot — addressed by service ID `0xFFFF` in both
/// tables (spec.md §5.3).
pub const BROADCAST_SLOT: usize = SLOT_COUNT - 1;
/// Byte size of one slot record.
pub const SLOT_BYTES: usize = ServiceSlot::SIZE;
/// Total byte size of a table's backing memory object.
pub const TABLE_BYTES: usize = SLOT_COUNT * SLOT_BYTES;

/// Map a service ID onto its home slot: `slot = service_id & 1023`
/// (spec.md §4.2 step 1).
#[inline]
#[must_use]
pub fn slot_for_service_id(service_id: u64) -> usize {
    (service_id & (SLOT_COUNT as u64 - 1)) as usize
}

/// A fixed-slot table backing either the QM or the ASIL registry. Owns the
/// shared memory mapping — created fresh by an Initializer Server, or
/// attached to an existing, already-sealed mapping by a Table Client.
pub struct Table {
    segment: MemSegment,
    /// Serializes ordinary writes from multiple threads in this process
    /// (spec.md §4.1 invariant: "a simple per-table write mutex suffices
    /// since slot contention is rare"). Cross-process registration
    /// collisions are arbitrated by [`ServiceSlot::try_register`]'s CAS,
    /// not by this lock.
    write_lock: Mutex<()>,
}

impl Table {
    /// Create a brand-new, zero-initialized, sealed table (server side).
    pub fn create(name: &str) -> Result<Self> {
        let segment = MemSegment::create(name, TABLE_BYTES)?;
        Ok(Self {
            segment,
            write_lock: Mutex::new(()),
        })
    }

    /// Attach to an existing table mapping received over the FD-passing
    /// socket (client side).
    pub fn attach(fd: OwnedFd) -> Result<Self> {
        let segment = MemSegment::from_received_fd(fd, TABLE_BYTES)?;
        Ok(Self {
            segment,
            write_lock: Mutex::new(()),
        })
    }

    /// Duplicate the underlying descriptor for handing to a newly accepted
    /// client connection.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.segment.try_clone_fd()
    }

    /// Number of addressable slots (always [`SLOT_COUNT`]).
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        SLOT_COUNT
    }

    /// Mutate the slot at `index` under the seqlock write protocol.
    pub fn write_slot<F>(&self, index: usize, f: F) -> Result<()>
    where
        F: FnOnce(&SlotFieldsMut<'_>),
    {
        validate_write_index(index)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.slot(index).write(f);
        Ok(())
    }

    /// Atomically claim an `IDLE` slot for a new registration (spec.md
    /// §4.5). Returns `Ok(true)` if this call's mutation won the claim,
    /// `Ok(false)` if the slot was already occupied or a concurrent
    /// claimant won the race.
    pub fn try_register_slot<F>(&self, index: usize, f: F) -> Result<bool>
    where
        F: FnOnce(&SlotFieldsMut<'_>),
    {
        validate_write_index(index)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.slot(index).try_register(f) == ClaimOutcome::Claimed)
    }

    /// Take a consistent value-copy snapshot of the slot at `index`.
    pub fn read_slot(&self, index: usize) -> Result<SlotSnapshot> {
        validate_index(index)?;
        self.slot(index).read().ok_or(RegistryError::Unstable)
    }

    /// Fast liveness-only read used by the heartbeat monitor and reaper.
    pub fn read_liveness(&self, index: usize) -> Result<(SlotStatus, i32, u64, u32)> {
        validate_index(index)?;
        self.slot(index).read_liveness().ok_or(RegistryError::Unstable)
    }

    /// Reset the slot at `index` back to `IDLE` (spec.md §4.2's
    /// `reset_slot`).
    pub fn reset_slot(&self, index: usize) -> Result<()> {
        validate_write_index(index)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.slot(index).reset();
        Ok(())
    }

    fn slot(&self, index: usize) -> &ServiceSlot {
        // SAFETY: index was validated against SLOT_COUNT by the caller;
        // the segment backing this table is exactly TABLE_BYTES long and
        // page-aligned, so `index * SLOT_BYTES` is a valid, 64-byte-aligned
        // offset for a `ServiceSlot` within the mapping.
        unsafe {
            let base = self.segment.as_ptr();
            &*(base.add(index * SLOT_BYTES).cast::<ServiceSlot>())
        }
    }
}

/// Precondition for reads (spec.md §4.2: `read_slot` requires `0 ≤ idx <
/// 1024`) — slot 0 is readable since it always reports `IDLE`.
fn validate_index(index: usize) -> Result<()> {
    if index >= SLOT_COUNT {
        Err(RegistryError::InvalidArgument(format!(
            "slot index {index} out of range [0, {SLOT_COUNT})"
        )))
    } else {
        Ok(())
    }
}

/// Precondition for writes (spec.md §4.2: `write_slot` requires `0 < idx <
/// 1024`) — slot 0 is reserved and must remain `IDLE` (spec.md §3.2), so
/// every mutating operation rejects it in addition to the usual bounds
/// check `read_slot` applies.
fn validate_write_index(index: usize) -> Result<()> {
    if index == 0 {
        Err(RegistryError::InvalidArgument(
            "slot index 0 is reserved and must remain IDLE".to_string(),
        ))
    } else {
        validate_index(index)
    }
}
