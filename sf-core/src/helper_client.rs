//! Helper Client
//!
//! Talks to the privileged `smcfand` helper over its Unix socket. The
//! [`HelperTransport`] trait is the privilege boundary: everything above it
//! works on typed values, everything below it is newline-delimited JSON.
//!
//! Connections are pooled (see [`crate::pool`]); each call carries a request
//! id, a bounded wait and one reconnect-and-retry on a broken connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sf_protocol::{
    FanInfo, HelperStatus, Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope,
    MAX_MESSAGE_SIZE,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::constants;
use crate::error::{from_wire, Result, SmcError};
use crate::pool::{ConnectionPool, Connector, PoolMetrics};
use crate::settings::SmcSettings;

/// Typed operations offered by the helper.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HelperTransport: Send + Sync {
    /// Ask the helper to open the hardware channel.
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn read_key(&self, key: &str) -> Result<f64>;
    async fn read_all_temperature_keys(&self) -> Result<Vec<String>>;
    async fn get_fan_count(&self) -> Result<u8>;
    async fn get_fan_info(&self, index: u8) -> Result<FanInfo>;
    async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()>;
    async fn set_fan_auto_mode(&self, index: u8) -> Result<()>;
    async fn get_version(&self) -> Result<String>;
    async fn check_status(&self) -> Result<HelperStatus>;
}

// ============================================================================
// Pooled socket connections
// ============================================================================

/// One connection to the helper socket.
pub struct HelperConnection {
    writer: OwnedWriteHalf,
    reader: BufReader<OwnedReadHalf>,
}

impl HelperConnection {
    async fn send(&mut self, envelope: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let mut json = serde_json::to_vec(envelope)?;
        json.push(b'\n');

        if json.len() > MAX_MESSAGE_SIZE {
            return Err(SmcError::MessageTooLarge {
                size: json.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        self.writer.write_all(&json).await?;
        self.writer.flush().await?;

        let mut buf = Vec::with_capacity(512);
        let n = (&mut self.reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;

        if n == 0 {
            return Err(SmcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "helper closed connection",
            )));
        }
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(SmcError::MessageTooLarge {
                size: buf.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }

        Ok(serde_json::from_slice(&buf)?)
    }
}

/// Opens connections to the helper socket.
pub struct SocketConnector {
    path: PathBuf,
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for SocketConnector {
    type Conn = HelperConnection;

    async fn connect(&self) -> Result<HelperConnection> {
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| {
                SmcError::Timeout(format!("connecting to helper at {}", self.path.display()))
            })?
            .map_err(|e| {
                SmcError::ConnectionFailed(format!(
                    "helper unreachable at {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        let (read, write) = stream.into_split();
        Ok(HelperConnection {
            writer: write,
            reader: BufReader::new(read),
        })
    }

    /// A connection with unread bytes would hand stale replies to the next caller.
    fn is_healthy(&self, conn: &HelperConnection) -> bool {
        conn.reader.buffer().is_empty()
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

struct ClientRateLimiter {
    limit: u32,
    request_count: u32,
    window_start: Instant,
}

impl ClientRateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            request_count: 0,
            window_start: Instant::now(),
        }
    }

    fn check_and_increment(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= RATE_LIMIT_WINDOW {
            self.request_count = 0;
            self.window_start = now;
        }

        if self.request_count >= self.limit {
            let wait = RATE_LIMIT_WINDOW.saturating_sub(now.duration_since(self.window_start));
            return Err(SmcError::RateLimited(format!(
                "{} requests/s; retry in {:.1}s",
                self.limit,
                wait.as_secs_f32()
            )));
        }

        self.request_count += 1;
        Ok(())
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct HelperClient {
    pool: Arc<ConnectionPool<SocketConnector>>,
    timeout: Duration,
    limiter: Mutex<ClientRateLimiter>,
}

impl HelperClient {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration, pool_size: usize, rate_limit: u32) -> Self {
        Self {
            pool: ConnectionPool::new(SocketConnector::new(socket, timeout), pool_size),
            timeout,
            limiter: Mutex::new(ClientRateLimiter::new(rate_limit.max(1))),
        }
    }

    pub fn from_settings(settings: &SmcSettings) -> Self {
        Self::new(
            settings.socket_path(),
            settings.request_timeout(),
            settings.pool.max_connections,
            settings.ipc.rate_limit,
        )
    }

    /// Client against the platform socket with default limits.
    pub fn with_defaults() -> Self {
        Self::new(
            constants::paths::SOCKET_PATH,
            constants::ipc::REQUEST_TIMEOUT,
            constants::pool::MAX_CONNECTIONS,
            constants::ipc::CLIENT_RATE_LIMIT,
        )
    }

    pub fn socket_path(&self) -> &Path {
        self.pool.connector().path()
    }

    pub fn pool_metrics(&self) -> Arc<dyn PoolMetrics> {
        self.pool.clone()
    }

    /// Send a request and return the reply data, retrying once on a broken
    /// connection.
    pub async fn request(&self, req: Request) -> Result<ResponseData> {
        self.limiter.lock().check_and_increment()?;
        req.validate()
            .map_err(|e| SmcError::IpcProtocol(format!("invalid {}: {}", req.type_name(), e)))?;

        let envelope = RequestEnvelope::new(req.clone());
        let mut attempt = 0;

        let reply = loop {
            attempt += 1;
            let mut conn = self.pool.acquire_within(self.timeout).await?;

            let outcome = tokio::time::timeout(self.timeout, conn.send(&envelope)).await;
            match outcome {
                Ok(Ok(reply)) => break reply,
                Ok(Err(e @ SmcError::Io(_))) if attempt == 1 => {
                    debug!("Helper connection broken ({}), reconnecting", e);
                    conn.discard();
                }
                Ok(Err(e)) => {
                    conn.discard();
                    return Err(e);
                }
                Err(_) => {
                    conn.discard();
                    warn!("{} timed out after {:?}", req.type_name(), self.timeout);
                    return Err(SmcError::Timeout(format!(
                        "{} after {:?}",
                        req.type_name(),
                        self.timeout
                    )));
                }
            }
        };

        if reply.id != envelope.id {
            return Err(SmcError::IpcProtocol(format!(
                "response id mismatch: expected {}, got {}",
                envelope.id, reply.id
            )));
        }

        match reply.response {
            Response::Ok(data) => {
                verify_response_type(&req, &data)?;
                trace!("{} ok", req.type_name());
                Ok(data)
            }
            Response::Error { code, message } => Err(from_wire(code, message, &subject(&req))),
        }
    }
}

/// What a failed request was about, for error messages.
fn subject(req: &Request) -> String {
    match req {
        Request::ReadKey { key } => key.clone(),
        Request::GetFanInfo { index }
        | Request::SetFanSpeed { index, .. }
        | Request::SetFanAutoMode { index } => format!("fan {}", index),
        other => other.type_name().to_string(),
    }
}

fn verify_response_type(req: &Request, data: &ResponseData) -> Result<()> {
    let valid = match req {
        Request::Connect
        | Request::Disconnect
        | Request::SetFanSpeed { .. }
        | Request::SetFanAutoMode { .. } => data.success.is_some(),
        Request::ReadKey { .. } => data.value.is_some(),
        Request::ReadAllTemperatureKeys => data.keys.is_some(),
        Request::GetFanCount => data.count.is_some(),
        Request::GetFanInfo { .. } => data.fan.is_some(),
        Request::GetVersion => data.version.is_some(),
        Request::CheckStatus => data.status.is_some(),
    };

    if valid {
        Ok(())
    } else {
        Err(SmcError::IpcProtocol(format!(
            "response type mismatch: got {:?} for request {}",
            data,
            req.type_name()
        )))
    }
}

fn missing(field: &str) -> SmcError {
    SmcError::IpcProtocol(format!("response missing {}", field))
}

fn expect_success(data: ResponseData, subject: String) -> Result<()> {
    match data.success {
        Some(true) => Ok(()),
        Some(false) => Err(SmcError::write_failed(subject, "helper reported failure")),
        None => Err(missing("success")),
    }
}

#[async_trait]
impl HelperTransport for HelperClient {
    async fn connect(&self) -> Result<()> {
        let data = self.request(Request::Connect).await?;
        match data.success {
            Some(true) => Ok(()),
            Some(false) => Err(SmcError::ConnectionFailed("helper could not open the SMC".into())),
            None => Err(missing("success")),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.request(Request::Disconnect).await.map(|_| ())
    }

    async fn read_key(&self, key: &str) -> Result<f64> {
        self.request(Request::ReadKey { key: key.to_string() })
            .await?
            .value
            .ok_or_else(|| missing("value"))
    }

    async fn read_all_temperature_keys(&self) -> Result<Vec<String>> {
        self.request(Request::ReadAllTemperatureKeys)
            .await?
            .keys
            .ok_or_else(|| missing("keys"))
    }

    async fn get_fan_count(&self) -> Result<u8> {
        self.request(Request::GetFanCount)
            .await?
            .count
            .ok_or_else(|| missing("count"))
    }

    async fn get_fan_info(&self, index: u8) -> Result<FanInfo> {
        self.request(Request::GetFanInfo { index })
            .await?
            .fan
            .ok_or_else(|| missing("fan"))
    }

    async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()> {
        let data = self.request(Request::SetFanSpeed { index, rpm }).await?;
        expect_success(data, format!("fan {}", index))
    }

    async fn set_fan_auto_mode(&self, index: u8) -> Result<()> {
        let data = self.request(Request::SetFanAutoMode { index }).await?;
        expect_success(data, format!("fan {}", index))
    }

    async fn get_version(&self) -> Result<String> {
        self.request(Request::GetVersion)
            .await?
            .version
            .ok_or_else(|| missing("version"))
    }

    async fn check_status(&self) -> Result<HelperStatus> {
        self.request(Request::CheckStatus)
            .await?
            .status
            .ok_or_else(|| missing("status"))
    }
}
