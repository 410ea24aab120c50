// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Initializer Server: creates a table's sealed memory segment and serves
//! its file descriptor to connecting clients (spec.md §4.3).

use crate::error::{RegistryError, Result};
use crate::ipc::message;
use crate::table::Table;
use std::ffi::CString;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A one-shot, per-table Initializer Server (spec.md §4.3).
///
/// Owns the table's shared memory segment and a listening Unix socket.
/// `run()` blocks, accepting connections and handing each one a duplicate
/// of the sealed memory file descriptor; `shutdown()` may be called from
/// another thread (including a signal handler's delegate) to unblock it.
pub struct InitializerServer {
    table: Table,
    listener: UnixListener,
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    clients_served: AtomicU64,
}

impl InitializerServer {
    /// Create the table's memory segment and bind the listening socket at
    /// `socket_path`, applying `socket_mode` permission bits (spec.md §4.3
    /// steps 1-5). `name` is the memfd's diagnostic name.
    pub fn bind(name: &str, socket_path: impl AsRef<Path>, socket_mode: u32) -> Result<Self> {
        let table = Table::create(name)?;
        let socket_path = socket_path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(RegistryError::SocketBindFailed)?;
            }
        }
        // Remove a stale socket file left behind by a prior, uncleanly
        // terminated server instance (spec.md §4.3 step 5).
        let _ = std::fs::remove_file(&socket_path);

        let listener =
            UnixListener::bind(&socket_path).map_err(RegistryError::SocketBindFailed)?;

        chmod(&socket_path, socket_mode)?;

        Ok(Self {
            table,
            listener,
            socket_path,
            running: Arc::new(AtomicBool::new(false)),
            clients_served: AtomicU64::new(0),
        })
    }

    /// The underlying table, for local inspection (tests, the daemon's
    /// own diagnostics).
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// A cloneable shutdown handle: `shutdown()` may be called from a
    /// different thread than the one blocked in [`Self::run`].
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serve loop (spec.md §4.3 "Serve loop"): accept a connection, send
    /// one FD-passing message, close the connection, repeat until
    /// [`Self::shutdown`] is called.
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        log::info!(
            "[registryd] listening on {} (table size {} bytes)",
            self.socket_path.display(),
            crate::table::TABLE_BYTES
        );

        loop {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let served = self.clients_served.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Err(e) = self.serve_one(&stream) {
                        log::warn!("[registryd] client #{served} handoff failed: {e}");
                    } else {
                        log::debug!("[registryd] client #{served} served");
                    }
                }
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    log::error!("[registryd] accept() failed: {e}");
                }
            }
        }

        log::info!(
            "[registryd] stopped, served {} clients",
            self.clients_served.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn serve_one(&self, stream: &UnixStream) -> Result<()> {
        let fd = self
            .table
            .try_clone_fd()
            .map_err(RegistryError::FdPassingFailed)?;
        message::send_fd(stream, fd.as_raw_fd())
    }

    /// Stop the accept loop and unlink the socket path (spec.md §4.3
    /// "Shutdown"). Safe to call more than once, and from any thread.
    pub fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            // SAFETY: self.listener's fd is valid for the lifetime of
            // self; shutdown(2) on a listening socket is well-defined and
            // wakes a thread blocked in accept().
            unsafe {
                libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for InitializerServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn chmod(path: &Path, mode: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| RegistryError::SocketBindFailed(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: c_path is a valid NUL-terminated path; mode is a plain
    // permission bitmask. Failure here is logged and non-fatal, matching
    // the original daemon's chmod() handling.
    let ret = unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) };
    if ret < 0 {
        log::warn!(
            "[registryd] chmod({}, {mode:#o}) failed: {} (non-critical)",
            path.display(),
            io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::client::TableClient;
    use crate::slot::SlotStatus;
    use std::thread;

    #[test]
    fn accepts_one_client_and_hands_over_fd() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let socket_path = dir.path().join("registry_test.sock");

        let server = Arc::new(
            InitializerServer::bind("/lap_test_srv", &socket_path, 0o666).expect("bind"),
        );

        server
            .table()
            .write_slot(7, |f| {
                f.set_service_id(7);
                f.set_status(SlotStatus::Active);
            })
            .expect("seed slot");

        let server_thread = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };

        // Give the accept loop a moment to start listening.
        thread::sleep(std::time::Duration::from_millis(20));

        let client = TableClient::attach(&socket_path).expect("attach");
        let snap = client.table().read_slot(7).expect("read");
        assert_eq!(snap.status, SlotStatus::Active);
        assert_eq!(snap.service_id, 7);

        server.shutdown();
        server_thread.join().expect("join").expect("run ok");
        assert!(!socket_path.exists(), "socket path should be unlinked");
    }

    #[test]
    fn stale_socket_file_is_replaced_on_bind() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let socket_path = dir.path().join("stale.sock");
        std::fs::write(&socket_path, b"not a socket").expect("seed stale file");

        let server = InitializerServer::bind("/lap_test_stale", &socket_path, 0o666);
        assert!(server.is_ok(), "bind should replace a stale socket file");
    }
}
