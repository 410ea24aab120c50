// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Heartbeat Monitor: the owner-side periodic refresh task, plus an
//! optional stale-slot reaper (spec.md §4.7).

use crate::registry::{now_ns, DualRegistry};
use crate::slot::SlotStatus;
use crate::table::{Table, BROADCAST_SLOT, SLOT_COUNT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A background thread that periodically refreshes `last_heartbeat_ns` for
/// every service ID this process owns, and — if enabled — reaps slots whose
/// owner process has died or gone silent.
///
/// Mirrors the owner-side `HeartbeatThread` the original runtime starts
/// from `Runtime::Initialize`, generalized to the dual-table split.
pub struct HeartbeatMonitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Spawn the monitor thread. `owned_service_ids` is refreshed by the
    /// caller (the `Runtime`) under its own lock before being read here on
    /// each tick — see [`crate::runtime::Runtime`].
    pub fn spawn(
        registry: Arc<DualRegistry>,
        owned_service_ids: Arc<std::sync::Mutex<Vec<u16>>>,
        interval_ms: u32,
        enable_reaper: bool,
        reaper_stale_multiplier: u32,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let interval = Duration::from_millis(u64::from(interval_ms.max(1)));

        let handle = thread::Builder::new()
            .name("lap-heartbeat".to_string())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }

                    let ids: Vec<u16> = owned_service_ids
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    let now = now_ns();
                    for service_id in ids {
                        if let Err(e) = registry.update_heartbeat(service_id, now) {
                            log::warn!(
                                "[heartbeat] failed to refresh service_id=0x{service_id:04x}: {e}"
                            );
                        }
                    }

                    if enable_reaper {
                        reap_stale_slots(registry.qm_table(), reaper_stale_multiplier);
                        reap_stale_slots(registry.asil_table(), reaper_stale_multiplier);
                    }
                }
            })
            .expect("failed to spawn heartbeat thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Signal the monitor thread to stop and join it.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scan every slot (including the broadcast slot) for owners that are dead
/// (no process at `owner_pid` any more) or silent past the stale threshold,
/// and reset them to `IDLE`. Off by default (spec.md §4.7 Open Question:
/// the original always reaps; this port makes it opt-in since a dead owner
/// PID can be legitimately reused by an unrelated process).
///
/// Staleness is judged per-owner (spec.md §4.7: "older than three heartbeat
/// intervals, using the owner's advertised `heartbeat_interval_ms`") — each
/// slot records its own registrant's cadence, and different owners may
/// register with different cadences, so the threshold is computed from each
/// slot's own `heartbeat_interval_ms`, not a single table-wide figure.
fn reap_stale_slots(table: &Table, reaper_stale_multiplier: u32) {
    for idx in 0..SLOT_COUNT {
        if idx == BROADCAST_SLOT {
            // the broadcast slot has no single owner process; never reaped.
            continue;
        }
        let Ok((status, owner_pid, last_heartbeat_ns, interval_ms)) = table.read_liveness(idx)
        else {
            continue;
        };
        if status != SlotStatus::Active {
            continue;
        }

        let stale_threshold_ms = u64::from(interval_ms) * u64::from(reaper_stale_multiplier);
        let owner_dead = !process_is_alive(owner_pid);
        let stale = heartbeat_age_ms(last_heartbeat_ns) > stale_threshold_ms;

        if owner_dead || stale {
            log::info!(
                "[reaper] resetting slot {idx} (owner_pid={owner_pid}, dead={owner_dead}, stale={stale})"
            );
            if let Err(e) = table.reset_slot(idx) {
                log::warn!("[reaper] failed to reset slot {idx}: {e}");
            }
        }
    }
}

fn heartbeat_age_ms(last_heartbeat_ns: u64) -> u64 {
    let now = now_ns();
    now.saturating_sub(last_heartbeat_ns) / 1_000_000
}

/// Null-signal liveness probe (`kill(pid, 0)`), matching the original's
/// `ProcessExists` helper.
fn process_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checking; `pid` is a plain integer argument.
    unsafe { libc::kill(pid, 0) == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) }
}
