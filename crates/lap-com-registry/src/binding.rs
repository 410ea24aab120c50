// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Binding Selector contract (spec.md §4.9, §6.3) — interface only.
//!
//! The core never loads, configures, or drives a transport binding itself;
//! it only defines the shape a binding presents and the rule used to pick
//! one for a given service ID. The original's `BindingManager` dynamically
//! `dlopen`s `.so` plugins and parses a YAML priority list
//! (`BindingManager.hpp`); this port keeps the static-override-then-priority
//! selection rule but drops the plugin loader per spec.md's scope note —
//! callers register a fixed set of `Box<dyn TransportBinding>` values
//! instead of shared libraries.

use std::collections::HashMap;

/// Fixed selection priorities, higher wins (spec.md §4.9; mirrors the
/// original's `BindingPriority` enum).
pub mod priority {
    pub const ICEORYX2: u32 = 100;
    pub const DDS: u32 = 80;
    pub const SOMEIP: u32 = 60;
    pub const SOCKET: u32 = 40;
    pub const DBUS: u32 = 20;
    pub const CUSTOM: u32 = 10;
}

/// Capability queries and lifecycle every binding must answer (spec.md
/// §6.3). The core consumes only these signatures — it never calls
/// `send_event`/`call`/etc. itself; that is the data plane, owned entirely
/// by whatever layer sits above this crate.
pub trait TransportBinding: Send + Sync {
    /// Stable binding name, matching a [`crate::slot::ServiceSlot`]'s
    /// `binding_type` field ("iceoryx2", "dds", "someip", "socket", "dbus").
    fn name(&self) -> &str;
    /// Fixed selection priority; ties broken by registration order.
    fn priority(&self) -> u32;
    /// Whether this binding can offer zero-copy transport for its payloads.
    fn supports_zero_copy(&self) -> bool;
    /// Capability predicate: can this binding carry `service_id` at all?
    /// A binding that is network-only, for instance, may refuse a
    /// QM-domain-only service.
    fn supports_service(&self, service_id: u16) -> bool;
}

/// A registered binding's static-override target or priority-ranked
/// candidacy (spec.md §4.9 selection rule).
pub struct BindingSelector {
    /// `(service_id, instance_id)` → forced binding name; `instance_id ==
    /// None` matches any instance (mirrors the original's
    /// `StaticBindingMapping` with `instance_id == 0` meaning "all").
    overrides: HashMap<(u16, Option<u64>), String>,
    bindings: Vec<Box<dyn TransportBinding>>,
}

impl Default for BindingSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingSelector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
            bindings: Vec::new(),
        }
    }

    /// Register a binding. Order does not matter for selection — bindings
    /// are always walked in descending-priority order at selection time —
    /// but registration order breaks ties between equal-priority bindings.
    pub fn register(&mut self, binding: Box<dyn TransportBinding>) {
        self.bindings.push(binding);
    }

    /// Force `service_id` (optionally scoped to one `instance_id`) onto a
    /// named binding regardless of priority, e.g. "ASIL-D always uses
    /// iceoryx2".
    pub fn set_override(&mut self, service_id: u16, instance_id: Option<u64>, binding_name: &str) {
        self.overrides
            .insert((service_id, instance_id), binding_name.to_string());
    }

    /// Select a binding for `service_id` (spec.md §4.9 selection rule):
    /// consult the static override map first, then fall back to the
    /// highest-priority registered binding whose `supports_service`
    /// predicate accepts this service ID.
    #[must_use]
    pub fn select(&self, service_id: u16, instance_id: Option<u64>) -> Option<&dyn TransportBinding> {
        if let Some(name) = self
            .overrides
            .get(&(service_id, instance_id))
            .or_else(|| self.overrides.get(&(service_id, None)))
        {
            if let Some(binding) = self.bindings.iter().find(|b| b.name() == name) {
                return Some(binding.as_ref());
            }
            log::warn!(
                "[binding] override for service_id=0x{service_id:04x} names \
                 unregistered binding {name:?}; falling back to priority order"
            );
        }

        self.bindings
            .iter()
            .filter(|b| b.supports_service(service_id))
            .max_by_key(|b| b.priority())
            .map(|b| b.as_ref())
    }
}
