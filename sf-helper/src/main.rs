//! smcfan helper daemon (smcfand)
//!
//! The only process that opens the SMC. Unprivileged clients reach it through
//! a Unix domain socket.
//!
//! # Security Model
//! - **Privilege**: runs as root for the SMC user client only
//! - **Audit**: peer credential logging (UID/GID/PID) for writes
//! - **Limits**: connection limits, message size limits, rate limiting
//! - **Isolation**: restrictive umask, working directory set to /
//! - **Signals**: graceful shutdown with socket and PID file cleanup
//!
//! # Hardening Measures
//! - Environment sanitization (clear dangerous env vars)
//! - Resource limits (RLIMIT_NOFILE, RLIMIT_CORE)
//! - Restrictive umask (0077)
//! - Symlink attack prevention on socket creation

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use sf_core::constants;
use sf_core::smc::{platform_driver, EmulatedSmc, SmcDriver};
use sf_helper::{run_server, HardwareService, ServerConfig};
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Security Hardening
// ============================================================================

fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
        "MALLOC_CHECK_",
        "TMPDIR",
        "IFS",
        "PATH",
    ];

    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
    std::env::set_var("LC_ALL", "C");
}

fn set_resource_limits() {
    set_rlimit(libc::RLIMIT_CORE, 0);
    set_rlimit(libc::RLIMIT_NOFILE, 256);
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

fn set_rlimit<R: TryInto<RlimitResource> + Copy + std::fmt::Debug>(resource: R, value: u64) {
    let Ok(res) = resource.try_into() else {
        warn!("Unknown rlimit resource {:?}", resource);
        return;
    };
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: setrlimit reads a fully initialised rlimit struct and a valid
    // RLIMIT_* resource.
    if unsafe { libc::setrlimit(res, &limit) } != 0 {
        warn!("Failed to set rlimit {:?}", resource);
    }
}

fn set_secure_umask() {
    // SAFETY: umask only replaces the process file creation mask.
    unsafe { libc::umask(0o077) };
}

fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
}

fn verify_privileges() -> anyhow::Result<()> {
    // SAFETY: geteuid and getuid have no preconditions.
    let euid = unsafe { libc::geteuid() };
    let uid = unsafe { libc::getuid() };

    if euid != 0 {
        bail!("smcfand must run as root (euid=0) to open the SMC; use --emulate for development");
    }
    if uid != 0 {
        warn!("Running as setuid root - this is not recommended");
    }
    info!("Running as root (uid={}, euid={})", uid, euid);
    Ok(())
}

fn validate_socket_path(path: &str, emulate: bool) -> anyhow::Result<()> {
    let p = Path::new(path);

    if !p.is_absolute() {
        bail!("Socket path must be absolute");
    }
    if path.contains("..") {
        bail!("Socket path contains path traversal");
    }
    if path.contains('\0') {
        bail!("Socket path contains null byte");
    }

    let safe_dirs = ["/run/", "/var/run/", "/tmp/"];
    if !emulate && !safe_dirs.iter().any(|d| path.starts_with(d)) {
        bail!("Socket path must be under {:?}", safe_dirs);
    }

    match p.parent() {
        Some(parent) if !parent.exists() => {
            bail!("Parent directory does not exist: {}", parent.display())
        }
        _ => {}
    }

    if p.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        bail!("Socket path is a symlink - refusing");
    }
    Ok(())
}

// ============================================================================
// PID File Management
// ============================================================================

fn write_pid_file(path: &str) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: signal 0 only checks that the process exists.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    bail!("Another instance is running (PID {})", old_pid);
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("creating {}", path))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;

    debug!("PID file written: {}", path);
    Ok(())
}

fn cleanup(socket_path: &str, pid_file: Option<&str>) {
    if Path::new(socket_path).exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("Failed to remove socket: {}", e);
        }
    }
    if let Some(pid_file) = pid_file {
        if let Err(e) = std::fs::remove_file(pid_file) {
            warn!("Failed to remove PID file: {}", e);
        }
    }
    info!("Cleanup complete");
}

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("smcfand {} - privileged SMC helper for smcfan", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    smcfand [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -s, --socket PATH   Socket path (default {})", constants::paths::SOCKET_PATH);
    eprintln!("    -g, --group GID     Give this group access to the socket");
    eprintln!("        --allow-uid UID Accept this user (repeatable)");
    eprintln!("        --emulate       Serve an in-memory SMC instead of the hardware");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    SMCFAN_LOG          Log filter (trace, debug, info, warn, error)");
}

struct Options {
    socket_path: String,
    emulate: bool,
    socket_group: Option<u32>,
    allowed_uids: Vec<u32>,
}

fn numeric_arg(args: &[String], i: usize, flag: &str) -> anyhow::Result<u32> {
    let Some(value) = args.get(i) else {
        bail!("{} requires a numeric argument", flag);
    };
    value
        .parse()
        .with_context(|| format!("{} expects a number, got {:?}", flag, value))
}

/// `None` when the process should exit successfully (help, version).
fn parse_args(args: &[String]) -> anyhow::Result<Option<Options>> {
    let mut opts = Options {
        socket_path: constants::paths::SOCKET_PATH.to_string(),
        emulate: false,
        socket_group: None,
        allowed_uids: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("smcfand {}", VERSION);
                return Ok(None);
            }
            "--emulate" => opts.emulate = true,
            "-g" | "--group" => {
                i += 1;
                opts.socket_group = Some(numeric_arg(args, i, "--group")?);
            }
            "--allow-uid" => {
                i += 1;
                opts.allowed_uids.push(numeric_arg(args, i, "--allow-uid")?);
            }
            "-s" | "--socket" => {
                i += 1;
                match args.get(i) {
                    Some(path) => opts.socket_path = path.clone(),
                    None => bail!("--socket requires a path argument"),
                }
            }
            arg => {
                print_help();
                bail!("Unknown argument: {}", arg);
            }
        }
        i += 1;
    }
    Ok(Some(opts))
}

fn init_logging() -> bool {
    use tracing_subscriber::prelude::*;

    let log_level = std::env::var("SMCFAN_LOG").unwrap_or_else(|_| "info".to_string());

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry()
                    .with(journald)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stderr", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(&log_level))
        .init();
    false
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sanitize_environment();
    set_secure_umask();
    set_resource_limits();
    secure_working_directory();

    let args: Vec<String> = std::env::args().collect();
    let Some(opts) = parse_args(&args)? else {
        return Ok(());
    };

    let journald = init_logging();
    info!("STARTUP: smcfand {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stderr" });

    if !opts.emulate {
        verify_privileges()?;
    }
    validate_socket_path(&opts.socket_path, opts.emulate).context("invalid socket path")?;

    let pid_file = if opts.emulate {
        None
    } else {
        write_pid_file(constants::paths::PID_FILE)?;
        Some(constants::paths::PID_FILE)
    };

    let socket_path = opts.socket_path.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - shutting down");
        cleanup(&socket_path, pid_file);
        std::process::exit(0);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let driver: Box<dyn SmcDriver> = if opts.emulate {
        info!("STARTUP: Using emulated SMC");
        Box::new(EmulatedSmc::macbook_pro())
    } else {
        platform_driver()
    };
    let hardware = Arc::new(HardwareService::new(driver));
    info!("STARTUP: Driver: {}", hardware.driver_name());
    info!("STARTUP: Socket path: {}", opts.socket_path);

    let mut allowed_uids = opts.allowed_uids.clone();
    if opts.emulate {
        // the emulated helper serves the user who started it
        // SAFETY: getuid has no preconditions.
        allowed_uids.push(unsafe { libc::getuid() });
    }
    let config = ServerConfig {
        socket_group: opts.socket_group,
        allowed_uids,
        ..ServerConfig::default()
    };
    let result = run_server(Path::new(&opts.socket_path), hardware, config).await;

    cleanup(&opts.socket_path, pid_file);
    if let Err(e) = result {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("smcfand").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn test_parse_socket_and_emulate() {
        let opts = parse_args(&args(&["--emulate", "-s", "/tmp/smc.sock"])).unwrap().unwrap();
        assert!(opts.emulate);
        assert_eq!(opts.socket_path, "/tmp/smc.sock");
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(parse_args(&args(&["--bogus"])).is_err());
        assert!(parse_args(&args(&["--socket"])).is_err());
        assert!(parse_args(&args(&["--foreground"])).is_err());
    }

    #[test]
    fn test_parse_access_options() {
        let opts = parse_args(&args(&["-g", "80", "--allow-uid", "501", "--allow-uid", "502"]))
            .unwrap()
            .unwrap();
        assert_eq!(opts.socket_group, Some(80));
        assert_eq!(opts.allowed_uids, vec![501, 502]);

        assert!(parse_args(&args(&["--group", "staff"])).is_err());
        assert!(parse_args(&args(&["--allow-uid"])).is_err());
    }

    #[test]
    fn test_socket_path_rules() {
        assert!(validate_socket_path("relative.sock", true).is_err());
        assert!(validate_socket_path("/tmp/../etc/x.sock", true).is_err());
        assert!(validate_socket_path("/home/x.sock", false).is_err());
        assert!(validate_socket_path("/tmp/smcfan-test.sock", false).is_ok());
    }
}
