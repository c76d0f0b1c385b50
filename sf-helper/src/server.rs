//! Unix Socket Server (Hardened)
//!
//! Serves the helper protocol to unprivileged clients.
//!
//! # Security Features
//! - **Socket permissions**: explicit mode, symlink attack prevention
//! - **Peer credentials**: UID/GID/PID audit logging for every connection
//! - **Client authorization**: root, listed UIDs, executable path check on
//!   Linux; a world-accessible socket admits nobody else
//! - **Connection limits**: maximum concurrent connections enforced
//! - **Rate limiting**: per-UID request budget per window
//! - **Timeouts**: read/write timeouts prevent resource exhaustion
//! - **Message limits**: bounded line reader, nothing past the maximum is buffered
//! - **Input validation**: every request is re-validated before touching hardware

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sf_core::constants;
use sf_core::error::to_wire;
use sf_core::{Result, SmcError};
use sf_protocol::{
    ErrorCode, Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope,
    MAX_MESSAGE_SIZE,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::hardware::HardwareService;

/// Rate limit window duration
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// Owner and group only; pair with `socket_group` to admit a group of users.
const SOCKET_MODE: u32 = 0o660;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub max_message_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Requests per UID per window
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub socket_mode: u32,
    /// Group given ownership of the socket file
    pub socket_group: Option<u32>,
    /// Non-root UIDs accepted regardless of socket permissions
    pub allowed_uids: Vec<u32>,
    /// Only accept clients whose executable looks like an smcfan binary
    pub verify_client_exe: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: constants::ipc::MAX_CONNECTIONS,
            max_message_size: MAX_MESSAGE_SIZE,
            read_timeout: constants::ipc::READ_TIMEOUT,
            write_timeout: constants::ipc::WRITE_TIMEOUT,
            rate_limit: constants::ipc::SERVER_RATE_LIMIT,
            rate_window: RATE_LIMIT_WINDOW,
            socket_mode: SOCKET_MODE,
            socket_group: None,
            allowed_uids: Vec::new(),
            verify_client_exe: true,
        }
    }
}

// ============================================================================
// Bounded reads
// ============================================================================

async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

struct ClientState {
    request_count: u32,
    window_start: Instant,
}

/// Per-UID request budget
struct RateLimiter {
    clients: HashMap<u32, ClientState>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Returns true if allowed, false if limited.
    fn check_and_increment(&mut self, uid: u32) -> bool {
        let now = Instant::now();
        let state = self.clients.entry(uid).or_insert(ClientState {
            request_count: 0,
            window_start: now,
        });

        if now.duration_since(state.window_start) > self.window {
            state.request_count = 0;
            state.window_start = now;
        }

        if state.request_count >= self.max_requests {
            return false;
        }
        state.request_count += 1;
        true
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.clients
            .retain(|_, state| now.duration_since(state.window_start) < window * 2);
    }
}

// ============================================================================
// Server
// ============================================================================

/// Create the listening socket, replacing a stale socket file but never a
/// symlink.
pub fn bind(socket_path: &Path, mode: u32) -> Result<UnixListener> {
    if let Ok(metadata) = socket_path.symlink_metadata() {
        if metadata.file_type().is_symlink() {
            return Err(SmcError::config(format!(
                "socket path {} is a symlink - refusing",
                socket_path.display()
            )));
        }
        std::fs::remove_file(socket_path)?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode))?;
    info!("Listening on {} (mode {:o})", socket_path.display(), mode);
    Ok(listener)
}

/// Run until Ctrl-C.
pub async fn run_server(
    socket_path: &Path,
    hardware: Arc<HardwareService>,
    config: ServerConfig,
) -> Result<()> {
    let listener = bind(socket_path, config.socket_mode)?;
    if let Some(gid) = config.socket_group {
        std::os::unix::fs::chown(socket_path, None, Some(gid))?;
        info!("Socket group set to gid={}", gid);
    }
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    serve(listener, hardware, config, shutdown).await;

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// Accept clients on `listener` until `shutdown` completes.
pub async fn serve<S>(
    listener: UnixListener,
    hardware: Arc<HardwareService>,
    config: ServerConfig,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    let config = Arc::new(config);
    info!(
        "Security: max_conn={}, max_msg={}, rate_limit={}/{:?}",
        config.max_connections, config.max_message_size, config.rate_limit, config.rate_window
    );

    let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(config.rate_limit, config.rate_window)));
    let active = Arc::new(AtomicUsize::new(0));
    let total = AtomicU64::new(0);

    let cleanup_limiter = rate_limiter.clone();
    let window = config.rate_window;
    let cleanup_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(window).await;
            cleanup_limiter.lock().cleanup();
        }
    });

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = active.load(Ordering::SeqCst);
                        if current >= config.max_connections {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        active.fetch_add(1, Ordering::SeqCst);
                        total.fetch_add(1, Ordering::Relaxed);
                        let active = active.clone();
                        let rate_limiter = rate_limiter.clone();
                        let hardware = hardware.clone();
                        let config = config.clone();

                        tokio::spawn(async move {
                            handle_client(stream, rate_limiter, hardware, config).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }

    cleanup_task.abort();
    info!("Server stopped (handled {} total connections)", total.load(Ordering::Relaxed));
}

/// Client credentials from Unix socket peer
#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    uid: u32,
    gid: u32,
    pid: i32,
}

async fn handle_client(
    stream: UnixStream,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    hardware: Arc<HardwareService>,
    config: Arc<ServerConfig>,
) {
    let cred = match get_peer_credentials(&stream) {
        Some(c) => c,
        None => {
            error!("Failed to get peer credentials, rejecting connection");
            return;
        }
    };

    let exe = if config.verify_client_exe {
        client_executable(&cred)
    } else {
        None
    };
    if let Err(e) = authorize_peer(&cred, &config, exe.as_deref()) {
        warn!(
            "Rejected client uid={}, gid={}, pid={}: {}",
            cred.uid, cred.gid, cred.pid, e
        );
        let (_, mut writer) = stream.into_split();
        let envelope = ResponseEnvelope::new(
            0,
            Response::error(ErrorCode::PermissionDenied, "Unauthorized client"),
        );
        let _ = send_response(&mut writer, &envelope, config.write_timeout).await;
        return;
    }

    debug!(
        "Connection from uid={}, gid={}, pid={}",
        cred.uid, cred.gid, cred.pid
    );

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(config.max_message_size);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        let read_result = timeout(
            config.read_timeout,
            read_line_bounded(&mut reader, &mut line, config.max_message_size),
        )
        .await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(
                    "Client disconnected: uid={}, pid={}, requests={}, duration={:?}",
                    cred.uid,
                    cred.pid,
                    request_count,
                    connection_start.elapsed()
                );
                break;
            }
            Ok(Ok(n)) => {
                let allowed = rate_limiter.lock().check_and_increment(cred.uid);
                if !allowed {
                    warn!("Rate limit exceeded for uid={}, pid={}", cred.uid, cred.pid);
                    let envelope = ResponseEnvelope::new(
                        request_id_hint(&line),
                        Response::error(ErrorCode::RateLimited, "Rate limit exceeded"),
                    );
                    if send_response(&mut writer, &envelope, config.write_timeout).await.is_err() {
                        break;
                    }
                    continue;
                }

                request_count += 1;
                trace!("Request #{} from uid={}: {} bytes", request_count, cred.uid, n);

                let envelope = match std::str::from_utf8(&line) {
                    Ok(text) => process_request(text, &cred, &hardware).await,
                    Err(e) => {
                        debug!("Non-UTF8 request from uid={}: {}", cred.uid, e);
                        let envelope = ResponseEnvelope::new(
                            0,
                            Response::error(ErrorCode::InvalidRequest, "Invalid request encoding"),
                        );
                        let _ = send_response(&mut writer, &envelope, config.write_timeout).await;
                        break;
                    }
                };

                if send_response(&mut writer, &envelope, config.write_timeout).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(
                        "Message too large (>{} bytes) from uid={}, pid={}",
                        config.max_message_size, cred.uid, cred.pid
                    );
                    let envelope = ResponseEnvelope::new(
                        0,
                        Response::error(ErrorCode::InvalidRequest, "Message too large"),
                    );
                    let _ = send_response(&mut writer, &envelope, config.write_timeout).await;
                } else {
                    error!("Read error from uid={}, pid={}: {}", cred.uid, cred.pid, e);
                }
                break;
            }
            Err(_) => {
                debug!("Read timeout for uid={}, pid={}", cred.uid, cred.pid);
                break;
            }
        }
    }
}

/// Best-effort request id for replies sent before full parsing.
fn request_id_hint(line: &[u8]) -> u64 {
    serde_json::from_slice::<RequestEnvelope>(line)
        .map(|env| env.id)
        .unwrap_or(0)
}

async fn send_response(
    writer: &mut OwnedWriteHalf,
    envelope: &ResponseEnvelope,
    write_timeout: Duration,
) -> std::result::Result<(), ()> {
    let json = serde_json::to_string(envelope).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","code":"internal","message":"Serialization error"}"#
            .to_string()
    });

    let write_result = timeout(write_timeout, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

/// Decide whether a connected peer may issue requests.
///
/// Root and `allowed_uids` always pass. With executable checking on, a
/// known executable must be an smcfan front end (or a development build).
/// Anyone else relies on the kernel having checked the socket permissions
/// at connect time, which only counts when "other" has no access.
fn authorize_peer(
    cred: &PeerCredentials,
    config: &ServerConfig,
    exe: Option<&str>,
) -> std::result::Result<(), String> {
    if cred.uid == 0 || config.allowed_uids.contains(&cred.uid) {
        return Ok(());
    }

    if config.verify_client_exe {
        if let Some(exe) = exe {
            if exe.contains("smcfan") && !exe.ends_with("smcfand") {
                debug!("Validated client: {} (pid={})", exe, cred.pid);
            } else if exe.contains("/target/") {
                debug!("Validated dev client: {} (pid={})", exe, cred.pid);
            } else {
                return Err(format!("Unauthorized client: {}", exe));
            }
        }
    }

    if config.socket_mode & 0o007 != 0 {
        return Err(format!(
            "uid {} is not allowed on a socket with mode {:o}",
            cred.uid, config.socket_mode
        ));
    }
    Ok(())
}

/// Executable of the peer process, where the platform exposes it.
fn client_executable(cred: &PeerCredentials) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_link(format!("/proc/{}/exe", cred.pid)) {
            Ok(exe) => Some(exe.to_string_lossy().into_owned()),
            Err(_) => {
                // process may already have exited
                debug!("Could not read executable path for pid={}", cred.pid);
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        debug!("No executable lookup for pid={} on this platform", cred.pid);
        None
    }
}

fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        // SAFETY: ucred is a plain C struct with no pointers; all-zero is a valid value.
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: fd is a live socket owned by `stream`, and cred/len describe a
        // correctly sized, writable ucred buffer.
        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            return Some(PeerCredentials {
                uid: cred.uid,
                gid: cred.gid,
                pid: cred.pid,
            });
        }
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        // SAFETY: fd is a live socket owned by `stream`; uid and gid are valid
        // writable locations.
        let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };

        if result == 0 {
            return Some(PeerCredentials { uid, gid, pid: 0 });
        }
    }

    None
}

/// Parse, validate and execute one request line.
async fn process_request(
    line: &str,
    cred: &PeerCredentials,
    hardware: &HardwareService,
) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!("Invalid JSON from uid={}: {}", cred.uid, e);
            return ResponseEnvelope::new(
                0,
                Response::error(ErrorCode::InvalidRequest, "Invalid request format"),
            );
        }
    };

    let request_id = envelope.id;
    let request = envelope.request;

    if let Err(e) = request.validate() {
        warn!("Request validation failed from uid={}: {}", cred.uid, e);
        return ResponseEnvelope::new(request_id, Response::error(ErrorCode::InvalidRequest, e));
    }

    if request.is_write() {
        info!(
            "AUDIT: {} from uid={}, pid={}",
            request.type_name(),
            cred.uid,
            cred.pid
        );
    }

    let response = match dispatch(&request, hardware).await {
        Ok(data) => Response::Ok(data),
        Err(e) => {
            debug!("{} failed: {}", request.type_name(), e);
            Response::error(to_wire(&e), e.to_string())
        }
    };
    ResponseEnvelope::new(request_id, response)
}

async fn dispatch(request: &Request, hardware: &HardwareService) -> Result<ResponseData> {
    let data = match request {
        Request::Connect => {
            hardware.connect().await?;
            ResponseData::success(true)
        }
        Request::Disconnect => {
            hardware.disconnect().await?;
            ResponseData::success(true)
        }
        Request::ReadKey { key } => ResponseData::value(hardware.read_key(key).await?),
        Request::ReadAllTemperatureKeys => ResponseData::keys(hardware.temperature_keys().await?),
        Request::GetFanCount => ResponseData::count(hardware.fan_count().await?),
        Request::GetFanInfo { index } => ResponseData::fan(hardware.fan_info(*index).await?),
        Request::SetFanSpeed { index, rpm } => {
            hardware.set_fan_speed(*index, *rpm).await?;
            ResponseData::success(true)
        }
        Request::SetFanAutoMode { index } => {
            hardware.set_fan_auto(*index).await?;
            ResponseData::success(true)
        }
        Request::GetVersion => ResponseData::version(constants::helper::VERSION.to_string()),
        Request::CheckStatus => ResponseData::status(hardware.status().await?),
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::smc::EmulatedSmc;

    fn cred() -> PeerCredentials {
        PeerCredentials { uid: 1000, gid: 1000, pid: 4242 }
    }

    fn hardware() -> HardwareService {
        HardwareService::new(Box::new(EmulatedSmc::macbook_pro()))
    }

    #[test]
    fn test_default_socket_is_not_world_accessible() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_mode & 0o007, 0);
        assert!(authorize_peer(&cred(), &config, None).is_ok());
    }

    #[test]
    fn test_world_accessible_socket_admits_only_listed_uids() {
        let mut config = ServerConfig {
            socket_mode: 0o666,
            verify_client_exe: false,
            ..ServerConfig::default()
        };
        assert!(authorize_peer(&cred(), &config, None).is_err());

        let root = PeerCredentials { uid: 0, gid: 0, pid: 1 };
        assert!(authorize_peer(&root, &config, None).is_ok());

        config.allowed_uids.push(1000);
        assert!(authorize_peer(&cred(), &config, None).is_ok());
    }

    #[test]
    fn test_foreign_executable_rejected() {
        let config = ServerConfig::default();
        assert!(authorize_peer(&cred(), &config, Some("/usr/bin/python3")).is_err());
        assert!(authorize_peer(&cred(), &config, Some("/usr/local/bin/smcfan")).is_ok());
        assert!(authorize_peer(&cred(), &config, Some("/usr/local/bin/smcfand")).is_err());

        let unchecked = ServerConfig {
            verify_client_exe: false,
            ..ServerConfig::default()
        };
        assert!(authorize_peer(&cred(), &unchecked, Some("/usr/bin/python3")).is_ok());
    }

    #[tokio::test]
    async fn test_bounded_read_rejects_oversized_line() {
        let data = vec![b'x'; 100];
        let mut reader = BufReader::new(&data[..]);
        let mut line = Vec::new();
        let err = read_line_bounded(&mut reader, &mut line, 64).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(line.len() <= 64);
    }

    #[tokio::test]
    async fn test_bounded_read_splits_lines() {
        let data = b"{\"a\":1}\n{\"b\":2}\n".to_vec();
        let mut reader = BufReader::new(&data[..]);
        let mut line = Vec::new();
        assert_eq!(read_line_bounded(&mut reader, &mut line, 64).await.unwrap(), 8);
        assert_eq!(line, b"{\"a\":1}\n");
        read_line_bounded(&mut reader, &mut line, 64).await.unwrap();
        assert_eq!(line, b"{\"b\":2}\n");
        assert_eq!(read_line_bounded(&mut reader, &mut line, 64).await.unwrap(), 0);
    }

    #[test]
    fn test_rate_limiter_per_uid() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.check_and_increment(1000));
        assert!(limiter.check_and_increment(1000));
        assert!(!limiter.check_and_increment(1000));
        assert!(limiter.check_and_increment(0));
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let env = process_request("not json", &cred(), &hardware()).await;
        assert_eq!(env.id, 0);
        assert!(matches!(
            env.response,
            Response::Error { code: ErrorCode::InvalidRequest, .. }
        ));
    }

    #[tokio::test]
    async fn test_request_revalidated() {
        let line = r#"{"id":5,"cmd":"SetFanSpeed","data":{"index":0,"rpm":-5.0}}"#;
        let env = process_request(line, &cred(), &hardware()).await;
        assert_eq!(env.id, 5);
        assert!(matches!(
            env.response,
            Response::Error { code: ErrorCode::InvalidRequest, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_key_maps_to_read_failed() {
        let line = r#"{"id":6,"cmd":"ReadKey","data":{"key":"TZ9Z"}}"#;
        let env = process_request(line, &cred(), &hardware()).await;
        assert!(matches!(
            env.response,
            Response::Error { code: ErrorCode::ReadFailed, .. }
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_speed_maps_to_value_out_of_range() {
        let line = r#"{"id":7,"cmd":"SetFanSpeed","data":{"index":0,"rpm":200.0}}"#;
        let env = process_request(line, &cred(), &hardware()).await;
        assert!(matches!(
            env.response,
            Response::Error { code: ErrorCode::ValueOutOfRange, .. }
        ));
    }

    #[tokio::test]
    async fn test_read_key_ok() {
        let line = r#"{"id":8,"cmd":"ReadKey","data":{"key":"TC0P"}}"#;
        let env = process_request(line, &cred(), &hardware()).await;
        assert_eq!(env.id, 8);
        match env.response {
            Response::Ok(data) => assert_eq!(data.value, Some(45.5)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
