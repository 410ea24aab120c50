// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cross-process visibility test (spec.md §8 item 9, scenario S1).
//!
//! A writer process registers a service; a reader process attached to the
//! same initializer socket observes it. Both "processes" here are actually
//! the test binary re-invoked via `std::process::Command` with a worker
//! marker environment variable — the standard way to get genuine separate
//! OS processes (and therefore genuinely separate address spaces) out of
//! `cargo test` without a second crate.

use lap_com_registry::config::RuntimeConfig;
use lap_com_registry::ipc::InitializerServer;
use lap_com_registry::registry::ServiceRegistration;
use lap_com_registry::runtime::Runtime;
use std::env;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WORKER_ENV: &str = "LAP_CROSS_PROCESS_WORKER";
const SERVICE_ID: u16 = 0x0010;

fn config_for(qm_socket: &str, asil_socket: &str) -> RuntimeConfig {
    RuntimeConfig {
        qm_socket_path: qm_socket.to_string(),
        asil_socket_path: asil_socket.to_string(),
        heartbeat_interval_ms: 20,
        ..Default::default()
    }
}

/// Entry point for the re-invoked worker process: register `SERVICE_ID` and
/// exit. The harness treats a non-zero exit as a test failure.
fn run_register_worker() -> ! {
    let qm_socket = env::var("LAP_TEST_QM_SOCKET").expect("qm socket path env var");
    let asil_socket = env::var("LAP_TEST_ASIL_SOCKET").expect("asil socket path env var");

    let mut runtime = Runtime::new(config_for(&qm_socket, &asil_socket));
    runtime.initialize().expect("worker initialize");
    runtime
        .register_service(
            SERVICE_ID,
            &ServiceRegistration {
                instance_id: 0x0001,
                major_version: 1,
                minor_version: 0,
                binding_type: "iceoryx2".to_string(),
                endpoint: "shm://svc_a".to_string(),
                heartbeat_interval_ms: 50,
                metadata: String::new(),
            },
        )
        .expect("worker register_service");

    // Exit without calling deinitialize(): the registration must stay
    // visible in shared memory after this process is gone, since the table
    // lives in the Initializer Server's memfd, not in the worker.
    std::process::exit(0);
}

#[test]
fn writer_process_register_is_visible_to_reader_process() {
    if env::var(WORKER_ENV).is_ok() {
        run_register_worker();
    }

    let dir = tempfile::tempdir().expect("tmpdir");
    let qm_socket = dir.path().join("qm.sock");
    let asil_socket = dir.path().join("asil.sock");

    let qm_server = Arc::new(
        InitializerServer::bind("/lap_xproc_qm", &qm_socket, 0o666).expect("bind qm"),
    );
    let asil_server = Arc::new(
        InitializerServer::bind("/lap_xproc_asil", &asil_socket, 0o640).expect("bind asil"),
    );
    let qm_run = Arc::clone(&qm_server);
    thread::spawn(move || qm_run.run());
    let asil_run = Arc::clone(&asil_server);
    thread::spawn(move || asil_run.run());
    thread::sleep(Duration::from_millis(20));

    let exe = env::current_exe().expect("current test binary path");
    let status = Command::new(&exe)
        .arg("--exact")
        .arg("writer_process_register_is_visible_to_reader_process")
        .env(WORKER_ENV, "1")
        .env("LAP_TEST_QM_SOCKET", &qm_socket)
        .env("LAP_TEST_ASIL_SOCKET", &asil_socket)
        .status()
        .expect("spawn worker process");
    assert!(status.success(), "worker process exited with {status}");

    let mut reader = Runtime::new(config_for(
        &qm_socket.to_string_lossy(),
        &asil_socket.to_string_lossy(),
    ));
    reader.initialize().expect("reader initialize");

    let found = reader
        .find_service(SERVICE_ID)
        .expect("find_service")
        .expect("service registered by the worker process must be visible here");
    assert_eq!(found.instance_id, 0x0001);
    assert_eq!(found.binding_type, "iceoryx2");
    assert_eq!(found.endpoint, "shm://svc_a");
    assert_ne!(found.owner_pid, std::process::id() as i32, "owner is the worker, not this process");

    qm_server.shutdown();
    asil_server.shutdown();
}
