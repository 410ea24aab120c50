// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-layout service slot with seqlock synchronization.
//!
//! Every slot is exactly 256 bytes, 64-byte aligned, and lives inside a
//! shared memory mapping visible to every process attached to a [`Table`](crate::table::Table).
//! Mutation goes through the seqlock protocol in this module: writers bump
//! an even/odd sequence counter around their mutation, readers retry until
//! they observe a stable, matching counter on both sides of their copy.
//!
//! # Memory ordering
//!
//! - **Release** on the write-side sequence bump after mutation: guarantees
//!   every payload write is visible before the counter goes even again.
//! - **Acquire** on the read-side sequence loads: pairs with the writer's
//!   Release so a reader that sees an even, unchanged sequence also sees
//!   the payload the writer committed.
//! - The odd-sequence "write in progress" flag itself needs no ordering
//!   beyond Relaxed — any reader that observes it simply retries.
//!
//! # Torn-read avoidance
//!
//! 1. Writer: `sequence.fetch_add(1, Acquire)` — now odd.
//! 2. Writer: mutate payload fields in any order.
//! 3. Writer: `sequence.fetch_add(1, Release)` — now even.
//! 4. Reader: loop until it reads the same even sequence before and after
//!    copying the payload; give up as "unstable" past [`MAX_READ_RETRIES`].

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Maximum seqlock read retries before giving up (spec.md §4.1 step 6).
pub const MAX_READ_RETRIES: u32 = 1000;

/// Slot status (spec.md §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotStatus {
    /// Available; all content is ignored.
    Idle = 0,
    /// Published by a live owner.
    Active = 1,
    /// Transient state set briefly before returning to `Idle`.
    Unregistering = 2,
}

impl SlotStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => SlotStatus::Active,
            2 => SlotStatus::Unregistering,
            _ => SlotStatus::Idle,
        }
    }
}

const BINDING_TYPE_LEN: usize = 16;
const ENDPOINT_LEN: usize = 80;
const METADATA_LEN: usize = 64;

/// Owned, value-copy view of a slot's payload, returned by a seqlock read.
///
/// This is what callers of [`Table::read_slot`](crate::table::Table::read_slot)
/// and [`DualRegistry::find_service`](crate::registry::DualRegistry::find_service)
/// actually see — never a reference into shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub service_id: u64,
    pub instance_id: u64,
    pub major_version: u32,
    pub minor_version: u32,
    pub binding_type: String,
    pub endpoint: String,
    pub last_heartbeat_ns: u64,
    pub heartbeat_interval_ms: u32,
    pub status: SlotStatus,
    pub owner_pid: i32,
    pub metadata: String,
}

/// A single 256-byte, 64-byte-aligned slot record.
///
/// Field order and widths follow spec.md §3.1 exactly; padding fills the
/// remainder to 256 bytes. `sequence` must only ever be mutated through
/// [`ServiceSlot::write`] / the read loop in [`ServiceSlot::read`] — never
/// written directly.
#[repr(C, align(64))]
pub struct ServiceSlot {
    sequence: AtomicU64,
    service_id: AtomicU64,
    instance_id: AtomicU64,
    major_version: AtomicU32,
    minor_version: AtomicU32,
    binding_type: [u8; BINDING_TYPE_LEN],
    endpoint: [u8; ENDPOINT_LEN],
    last_heartbeat_ns: AtomicU64,
    heartbeat_interval_ms: AtomicU32,
    status: AtomicU32,
    owner_pid: AtomicI32,
    metadata: [u8; METADATA_LEN],
    _padding: [u8; 32],
}

// SAFETY: ServiceSlot is designed for concurrent cross-process access.
// All payload fields are either atomics or fixed-size byte arrays mutated
// only while the writer holds the slot's odd sequence number; readers only
// ever take value copies via the seqlock read loop.
unsafe impl Send for ServiceSlot {}
unsafe impl Sync for ServiceSlot {}

impl ServiceSlot {
    /// Byte size of one slot — must stay exactly 256 (enforced by the test
    /// below and by [`crate::table::SLOT_BYTES`]).
    pub const SIZE: usize = 256;

    /// Result of a seqlock write attempt: `None` only if the mutation
    /// closure itself signals failure (e.g. a name too long to encode).
    pub fn write<F>(&self, f: F)
    where
        F: FnOnce(&SlotFieldsMut<'_>),
    {
        // Odd: write in progress. Relaxed suffices — the odd value alone
        // tells readers to retry; happens-before is established by the
        // Release bump below.
        self.sequence.fetch_add(1, Ordering::Relaxed);
        let fields = SlotFieldsMut { slot: self };
        f(&fields);
        // Release: publish payload writes before the counter goes even.
        self.sequence.fetch_add(1, Ordering::Release);
    }

    /// Reset the slot to `IDLE` and zero its payload (sequence untouched
    /// beyond the write protocol itself). Mirrors `reset_slot` in spec.md
    /// §4.2.
    pub fn reset(&self) {
        self.write(|f| {
            f.set_service_id(0);
            f.set_instance_id(0);
            f.set_major_version(0);
            f.set_minor_version(0);
            f.set_binding_type("");
            f.set_endpoint("");
            f.set_last_heartbeat_ns(0);
            f.set_heartbeat_interval_ms(0);
            f.set_owner_pid(0);
            f.set_metadata("");
            f.set_status(SlotStatus::Idle);
        });
    }

    /// Seqlock read: returns `Some(snapshot)` on a stable read, `None`
    /// ("unstable") if [`MAX_READ_RETRIES`] is exceeded under contention.
    pub fn read(&self) -> Option<SlotSnapshot> {
        let mut retries = 0u32;
        loop {
            let seq1 = self.sequence.load(Ordering::Acquire);
            if seq1 & 1 != 0 {
                std::hint::spin_loop();
                retries += 1;
                if retries > MAX_READ_RETRIES {
                    return None;
                }
                continue;
            }

            let snapshot = self.copy_payload();

            let seq2 = self.sequence.load(Ordering::Acquire);
            if seq1 == seq2 {
                return Some(snapshot);
            }

            std::hint::spin_loop();
            retries += 1;
            if retries > MAX_READ_RETRIES {
                return None;
            }
        }
    }

    /// Read-only fast path used by the heartbeat monitor and reaper: just
    /// the status/owner/heartbeat fields, without copying strings.
    pub fn read_liveness(&self) -> Option<(SlotStatus, i32, u64, u32)> {
        let mut retries = 0u32;
        loop {
            let seq1 = self.sequence.load(Ordering::Acquire);
            if seq1 & 1 != 0 {
                std::hint::spin_loop();
                retries += 1;
                if retries > MAX_READ_RETRIES {
                    return None;
                }
                continue;
            }

            let status = SlotStatus::from_u32(self.status.load(Ordering::Relaxed));
            let owner_pid = self.owner_pid.load(Ordering::Relaxed);
            let last_heartbeat_ns = self.last_heartbeat_ns.load(Ordering::Relaxed);
            let heartbeat_interval_ms = self.heartbeat_interval_ms.load(Ordering::Relaxed);

            let seq2 = self.sequence.load(Ordering::Acquire);
            if seq1 == seq2 {
                return Some((status, owner_pid, last_heartbeat_ns, heartbeat_interval_ms));
            }

            std::hint::spin_loop();
            retries += 1;
            if retries > MAX_READ_RETRIES {
                return None;
            }
        }
    }

    fn copy_payload(&self) -> SlotSnapshot {
        SlotSnapshot {
            service_id: self.service_id.load(Ordering::Relaxed),
            instance_id: self.instance_id.load(Ordering::Relaxed),
            major_version: self.major_version.load(Ordering::Relaxed),
            minor_version: self.minor_version.load(Ordering::Relaxed),
            binding_type: read_fixed_str(&self.binding_type),
            endpoint: read_fixed_str(&self.endpoint),
            last_heartbeat_ns: self.last_heartbeat_ns.load(Ordering::Relaxed),
            heartbeat_interval_ms: self.heartbeat_interval_ms.load(Ordering::Relaxed),
            status: SlotStatus::from_u32(self.status.load(Ordering::Relaxed)),
            owner_pid: self.owner_pid.load(Ordering::Relaxed),
            metadata: read_fixed_str(&self.metadata),
        }
    }
}

/// Outcome of [`ServiceSlot::try_register`]'s atomic IDLE-to-ACTIVE claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The slot was IDLE and this call's mutation committed.
    Claimed,
    /// The slot was already occupied by an `ACTIVE` (or transitioning)
    /// owner.
    Occupied,
    /// A concurrent writer raced the same claim attempt; the caller may
    /// retry or treat this the same as `Occupied`.
    Contended,
}

impl ServiceSlot {
    /// Atomically claim an `IDLE` slot and populate it, or report why the
    /// claim failed (spec.md §4.5 registration pre-condition).
    ///
    /// Unlike [`Self::write`], this does not unconditionally bump the
    /// sequence counter: it first checks `status`, then stakes its claim
    /// with a compare-exchange on `sequence` itself. Two processes racing
    /// to claim the same even sequence value can only have one CAS
    /// succeed — that caller alone proceeds into the mutation closure and
    /// the matching `Release` bump; the other observes `Contended`.
    pub fn try_register<F>(&self, f: F) -> ClaimOutcome
    where
        F: FnOnce(&SlotFieldsMut<'_>),
    {
        let seq = self.sequence.load(Ordering::Acquire);
        if seq & 1 != 0 {
            return ClaimOutcome::Contended;
        }
        if SlotStatus::from_u32(self.status.load(Ordering::Relaxed)) != SlotStatus::Idle {
            return ClaimOutcome::Occupied;
        }
        if self
            .sequence
            .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return ClaimOutcome::Contended;
        }
        let fields = SlotFieldsMut { slot: self };
        f(&fields);
        self.sequence.fetch_add(1, Ordering::Release);
        ClaimOutcome::Claimed
    }
}

/// Mutation handle passed into [`ServiceSlot::write`]'s closure. Exists so
/// the odd/even sequence bump always brackets every field write — there is
/// no way to reach the raw atomics without going through `write()`.
pub struct SlotFieldsMut<'a> {
    slot: &'a ServiceSlot,
}

impl SlotFieldsMut<'_> {
    pub fn set_service_id(&self, v: u64) {
        self.slot.service_id.store(v, Ordering::Relaxed);
    }
    pub fn set_instance_id(&self, v: u64) {
        self.slot.instance_id.store(v, Ordering::Relaxed);
    }
    pub fn set_major_version(&self, v: u32) {
        self.slot.major_version.store(v, Ordering::Relaxed);
    }
    pub fn set_minor_version(&self, v: u32) {
        self.slot.minor_version.store(v, Ordering::Relaxed);
    }
    pub fn set_binding_type(&self, v: &str) {
        // SAFETY: UnsafeCell-free here; the field is a plain byte array and
        // we only ever reach it from inside the writer's odd-sequence
        // window, so this bypasses borrow checking for a raw pointer write
        // but not synchronization safety.
        write_fixed_str(unsafe { as_mut(&self.slot.binding_type) }, v);
    }
    pub fn set_endpoint(&self, v: &str) {
        write_fixed_str(unsafe { as_mut(&self.slot.endpoint) }, v);
    }
    pub fn set_last_heartbeat_ns(&self, v: u64) {
        self.slot.last_heartbeat_ns.store(v, Ordering::Relaxed);
    }
    pub fn set_heartbeat_interval_ms(&self, v: u32) {
        self.slot.heartbeat_interval_ms.store(v, Ordering::Relaxed);
    }
    pub fn set_status(&self, v: SlotStatus) {
        self.slot.status.store(v as u32, Ordering::Relaxed);
    }
    pub fn set_owner_pid(&self, v: i32) {
        self.slot.owner_pid.store(v, Ordering::Relaxed);
    }
    pub fn set_metadata(&self, v: &str) {
        write_fixed_str(unsafe { as_mut(&self.slot.metadata) }, v);
    }
}

/// Cast a shared byte-array reference to a mutable one.
///
/// # Safety
/// Caller must guarantee exclusive access for the duration of the write —
/// true here because this is only reachable from inside
/// [`ServiceSlot::write`]'s odd-sequence window, and higher layers
/// guarantee a single writer per slot (spec.md §4.1 invariants).
unsafe fn as_mut<const N: usize>(arr: &[u8; N]) -> &mut [u8; N] {
    #[allow(invalid_reference_casting)]
    &mut *(arr as *const [u8; N] as *mut [u8; N])
}

fn write_fixed_str<const N: usize>(dst: &mut [u8; N], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    dst.fill(0);
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn read_fixed_str<const N: usize>(src: &[u8; N]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(N);
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_slot() -> ServiceSlot {
        ServiceSlot {
            sequence: AtomicU64::new(0),
            service_id: AtomicU64::new(0),
            instance_id: AtomicU64::new(0),
            major_version: AtomicU32::new(0),
            minor_version: AtomicU32::new(0),
            binding_type: [0u8; BINDING_TYPE_LEN],
            endpoint: [0u8; ENDPOINT_LEN],
            last_heartbeat_ns: AtomicU64::new(0),
            heartbeat_interval_ms: AtomicU32::new(0),
            status: AtomicU32::new(0),
            owner_pid: AtomicI32::new(0),
            metadata: [0u8; METADATA_LEN],
            _padding: [0u8; 32],
        }
    }

    #[test]
    fn slot_size_and_alignment() {
        assert_eq!(std::mem::size_of::<ServiceSlot>(), 256);
        assert_eq!(std::mem::align_of::<ServiceSlot>(), 64);
    }

    #[test]
    fn idle_slot_reads_as_idle() {
        let slot = zeroed_slot();
        let snap = slot.read().expect("stable read");
        assert_eq!(snap.status, SlotStatus::Idle);
    }

    #[test]
    fn write_then_read_round_trips() {
        let slot = zeroed_slot();
        slot.write(|f| {
            f.set_service_id(0x0010);
            f.set_instance_id(0x0001);
            f.set_major_version(1);
            f.set_minor_version(0);
            f.set_binding_type("iceoryx2");
            f.set_endpoint("shm://svc_a");
            f.set_owner_pid(4242);
            f.set_status(SlotStatus::Active);
        });

        let snap = slot.read().expect("stable read");
        assert_eq!(snap.service_id, 0x0010);
        assert_eq!(snap.instance_id, 0x0001);
        assert_eq!(snap.major_version, 1);
        assert_eq!(snap.binding_type, "iceoryx2");
        assert_eq!(snap.endpoint, "shm://svc_a");
        assert_eq!(snap.owner_pid, 4242);
        assert_eq!(snap.status, SlotStatus::Active);
    }

    #[test]
    fn reset_clears_to_idle() {
        let slot = zeroed_slot();
        slot.write(|f| {
            f.set_service_id(7);
            f.set_status(SlotStatus::Active);
        });
        slot.reset();
        let snap = slot.read().expect("stable read");
        assert_eq!(snap.status, SlotStatus::Idle);
        assert_eq!(snap.service_id, 0);
    }

    #[test]
    fn try_register_claims_idle_slot_once() {
        let slot = zeroed_slot();
        let outcome = slot.try_register(|f| {
            f.set_service_id(9);
            f.set_status(SlotStatus::Active);
        });
        assert_eq!(outcome, ClaimOutcome::Claimed);
        assert_eq!(slot.read().unwrap().status, SlotStatus::Active);

        let second = slot.try_register(|f| {
            f.set_service_id(10);
        });
        assert_eq!(second, ClaimOutcome::Occupied);
        assert_eq!(slot.read().unwrap().service_id, 9, "loser must not mutate the slot");
    }

    #[test]
    fn concurrent_claims_on_same_slot_yield_exactly_one_winner() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let slot = Arc::new(zeroed_slot());
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let slot = Arc::clone(&slot);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    let outcome = slot.try_register(|f| {
                        f.set_service_id(i);
                        f.set_status(SlotStatus::Active);
                    });
                    if outcome == ClaimOutcome::Claimed {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::Relaxed), 1, "exactly one claim must win");
    }

    #[test]
    fn concurrent_writer_never_yields_torn_read() {
        use std::sync::Arc;
        use std::thread;

        let slot = Arc::new(zeroed_slot());
        let writer_slot = Arc::clone(&slot);

        let writer = thread::spawn(move || {
            for i in 0..20_000u64 {
                writer_slot.write(|f| {
                    f.set_service_id(i);
                    f.set_last_heartbeat_ns(i * 2);
                    f.set_status(SlotStatus::Active);
                });
            }
        });

        let mut torn = 0;
        let mut unstable = 0;
        for _ in 0..200_000 {
            match slot.read() {
                Some(snap) => {
                    if snap.last_heartbeat_ns != snap.service_id * 2 {
                        torn += 1;
                    }
                }
                None => unstable += 1,
            }
        }

        writer.join().unwrap();
        assert_eq!(torn, 0, "seqlock reader observed a torn payload");
        assert!(unstable < 200_000, "reader never observed a stable value");
    }
}
