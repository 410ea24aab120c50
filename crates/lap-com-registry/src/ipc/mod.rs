// SPDX-License-Identifier: Apache-2.0 OR MIT

//! FD-passing IPC: the Initializer Server's client-facing half (spec.md
//! §4.3, §4.4, §6.2).

pub mod client;
pub mod message;
pub mod server;

pub use client::TableClient;
pub use server::InitializerServer;
