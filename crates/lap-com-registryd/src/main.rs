// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `lap-com-registryd` — the one-shot per-table Initializer Server daemon
//! (spec.md §4.3, §6.5).
//!
//! Each instance owns exactly one table (QM or ASIL): it creates the
//! table's sealed memfd, binds the table's Unix domain socket, and serves
//! the memory descriptor to every connecting client until it receives
//! `SIGINT`/`SIGTERM`. A real deployment runs two instances side by side,
//! one per `--type`.
//!
//! ```text
//! lap-com-registryd --type=qm --socket=/run/lap/registry_qm.sock
//! lap-com-registryd --type=asil --socket=/run/lap/registry_asil.sock
//! ```

use clap::Parser;
use lap_com_registry::config::{
    ASIL_SOCKET_MODE, DEFAULT_ASIL_SOCKET_PATH, DEFAULT_QM_SOCKET_PATH, QM_SOCKET_MODE,
};
use lap_com_registry::ipc::InitializerServer;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Which table this instance of the daemon serves (spec.md §6.5
/// `--type={qm|asil}`, mirrors the original daemon's `RegistryType`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum RegistryType {
    Qm,
    Asil,
}

impl RegistryType {
    fn default_socket_path(self) -> &'static str {
        match self {
            RegistryType::Qm => DEFAULT_QM_SOCKET_PATH,
            RegistryType::Asil => DEFAULT_ASIL_SOCKET_PATH,
        }
    }

    fn socket_mode(self) -> u32 {
        match self {
            RegistryType::Qm => QM_SOCKET_MODE,
            RegistryType::Asil => ASIL_SOCKET_MODE,
        }
    }

    fn memfd_name(self) -> &'static str {
        match self {
            RegistryType::Qm => "lap_com_registry_qm",
            RegistryType::Asil => "lap_com_registry_asil",
        }
    }
}

/// Registry Initializer Server — creates the sealed shared-memory table for
/// one safety domain and hands its file descriptor to every client that
/// connects on the configured socket.
#[derive(Parser, Debug)]
#[command(name = "lap-com-registryd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Registry type served by this instance.
    #[arg(long, value_enum, default_value = "qm")]
    r#type: RegistryType,

    /// Unix domain socket path clients attach to. Defaults to the
    /// well-known path for `--type`.
    #[arg(long)]
    socket: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            eprintln!("lap-com-registryd: unknown log level {other:?}, defaulting to info");
            Level::INFO
        }
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("lap-com-registryd: failed to install tracing subscriber");
    }

    // SAFETY: SIG_IGN is a valid disposition for SIGPIPE; this runs once,
    // before any other thread exists, mirroring the original daemon's
    // `signal(SIGPIPE, SIG_IGN)`.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let socket_path = args.socket.clone().unwrap_or_else(|| {
        args.r#type.default_socket_path().to_string()
    });

    info!(
        registry_type = ?args.r#type,
        socket = %socket_path,
        "starting registry initializer"
    );

    let server = match InitializerServer::bind(
        args.r#type.memfd_name(),
        &socket_path,
        args.r#type.socket_mode(),
    ) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("failed to initialize registry: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown_server = Arc::clone(&server);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutdown signal received, stopping server...");
        shutdown_server.shutdown();
    }) {
        error!("failed to install signal handler: {e} (SIGINT/SIGTERM will not stop the daemon cleanly)");
    }

    match server.run() {
        Ok(()) => {
            info!("registry initializer stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server run failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_type_defaults_match_spec_socket_paths() {
        assert_eq!(RegistryType::Qm.default_socket_path(), "/run/lap/registry_qm.sock");
        assert_eq!(RegistryType::Asil.default_socket_path(), "/run/lap/registry_asil.sock");
    }

    #[test]
    fn registry_type_socket_modes_match_spec() {
        assert_eq!(RegistryType::Qm.socket_mode(), 0o666);
        assert_eq!(RegistryType::Asil.socket_mode(), 0o640);
    }
}
