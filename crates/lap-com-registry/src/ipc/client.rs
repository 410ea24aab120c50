// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Table Client: attaches to an Initializer Server's socket and maps the
//! table it hands over (spec.md §4.4).

use crate::error::{RegistryError, Result};
use crate::ipc::message;
use crate::table::Table;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// A mapped table obtained from a running [`InitializerServer`](crate::ipc::server::InitializerServer).
pub struct TableClient {
    table: Table,
}

impl TableClient {
    /// Connect to `socket_path`, receive the sealed memory descriptor, map
    /// it, and close the connection (spec.md §4.4 steps 1-4).
    pub fn attach(socket_path: impl AsRef<Path>) -> Result<Self> {
        let stream =
            UnixStream::connect(socket_path.as_ref()).map_err(RegistryError::SocketConnectFailed)?;
        let fd = message::recv_fd(&stream)?;
        let table = Table::attach(fd)?;
        // `stream` closes here, as spec.md §4.4 step 4 requires.
        Ok(Self { table })
    }

    /// The mapped table view.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Consume the client, handing back the owned table mapping.
    #[must_use]
    pub fn into_table(self) -> Table {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::InitializerServer;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn connect_failure_surfaces_socket_connect_failed() {
        let result = TableClient::attach("/nonexistent/path/does/not/exist.sock");
        assert!(matches!(result, Err(RegistryError::SocketConnectFailed(_))));
    }

    #[test]
    fn two_clients_see_the_same_table() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let socket_path = dir.path().join("shared.sock");

        let server = Arc::new(
            InitializerServer::bind("/lap_test_two_clients", &socket_path, 0o666).expect("bind"),
        );
        let server_thread = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };
        thread::sleep(std::time::Duration::from_millis(20));

        let client_a = TableClient::attach(&socket_path).expect("attach a");
        let client_b = TableClient::attach(&socket_path).expect("attach b");

        client_a
            .table()
            .write_slot(11, |f| {
                f.set_service_id(11);
                f.set_status(crate::slot::SlotStatus::Active);
            })
            .expect("write from a");

        let snap = client_b.table().read_slot(11).expect("read from b");
        assert_eq!(snap.service_id, 11);
        assert_eq!(snap.status, crate::slot::SlotStatus::Active);

        server.shutdown();
        server_thread.join().expect("join").expect("run ok");
    }
}
