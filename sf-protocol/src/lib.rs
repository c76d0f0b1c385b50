use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Version of the request/response schema below. Bumped on any breaking change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Register keys are FourCC codes
pub const KEY_LENGTH: usize = 4;

/// Fan keys are `F<digit>..`, so only ten fans are addressable
pub const MAX_FAN_INDEX: u8 = 9;

/// Upper bound accepted for a target speed; real fans top out far below this
pub const MAX_FAN_RPM: f64 = 20_000.0;

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    /// Open the helper's SMC connection (idempotent)
    Connect,
    /// Close the helper's SMC connection; the next hardware request reopens it
    Disconnect,
    ReadKey { key: String },
    ReadAllTemperatureKeys,
    GetFanCount,
    GetFanInfo { index: u8 },
    SetFanSpeed { index: u8, rpm: f64 },
    SetFanAutoMode { index: u8 },
    GetVersion,
    CheckStatus,
}

impl Request {
    /// Validate request parameters before sending to the helper
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Connect
            | Request::Disconnect
            | Request::ReadAllTemperatureKeys
            | Request::GetFanCount
            | Request::GetVersion
            | Request::CheckStatus => Ok(()),

            Request::ReadKey { key } => validate_key(key),

            Request::GetFanInfo { index } | Request::SetFanAutoMode { index } => {
                validate_fan_index(*index).map_err(String::from)
            }

            Request::SetFanSpeed { index, rpm } => {
                validate_fan_index(*index)?;
                validate_rpm(*rpm)?;
                Ok(())
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Connect => "Connect",
            Request::Disconnect => "Disconnect",
            Request::ReadKey { .. } => "ReadKey",
            Request::ReadAllTemperatureKeys => "ReadAllTemperatureKeys",
            Request::GetFanCount => "GetFanCount",
            Request::GetFanInfo { .. } => "GetFanInfo",
            Request::SetFanSpeed { .. } => "SetFanSpeed",
            Request::SetFanAutoMode { .. } => "SetFanAutoMode",
            Request::GetVersion => "GetVersion",
            Request::CheckStatus => "CheckStatus",
        }
    }

    /// Whether the request mutates hardware state
    pub fn is_write(&self) -> bool {
        matches!(self, Request::SetFanSpeed { .. } | Request::SetFanAutoMode { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

/// Error kinds that may cross the privilege boundary.
///
/// The helper maps every internal failure onto one of these before replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ServiceNotFound,
    ConnectionFailed,
    NotConnected,
    ReadFailed,
    WriteFailed,
    PermissionDenied,
    Restricted,
    ValueOutOfRange,
    MalformedRecord,
    InvalidRequest,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ServiceNotFound => "service_not_found",
            ErrorCode::ConnectionFailed => "connection_failed",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::ReadFailed => "read_failed",
            ErrorCode::WriteFailed => "write_failed",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Restricted => "restricted",
            ErrorCode::ValueOutOfRange => "value_out_of_range",
            ErrorCode::MalformedRecord => "malformed_record",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

/// Response data - a flat struct, each request fills exactly one field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan: Option<FanInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Serialized as `helper`; `status` is the envelope tag
    #[serde(rename = "helper", skip_serializing_if = "Option::is_none")]
    pub status: Option<HelperStatus>,
}

impl ResponseData {
    pub fn none() -> Self { Self::default() }
    pub fn value(v: f64) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn keys(k: Vec<String>) -> Self { Self { keys: Some(k), ..Self::default() } }
    pub fn count(c: u8) -> Self { Self { count: Some(c), ..Self::default() } }
    pub fn fan(f: FanInfo) -> Self { Self { fan: Some(f), ..Self::default() } }
    pub fn success(s: bool) -> Self { Self { success: Some(s), ..Self::default() } }
    pub fn version(v: String) -> Self { Self { version: Some(v), ..Self::default() } }
    pub fn status(s: HelperStatus) -> Self { Self { status: Some(s), ..Self::default() } }
}

/// Fan descriptor in RPM
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanInfo {
    pub min: f64,
    pub max: f64,
    pub current: f64,
}

impl FanInfo {
    pub fn contains(&self, rpm: f64) -> bool {
        rpm >= self.min && rpm <= self.max
    }
}

/// Snapshot returned by `CheckStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperStatus {
    pub version: String,
    pub protocol_version: u32,
    pub connected: bool,
    /// Seconds since the Unix epoch at the time of the reply
    pub timestamp: u64,
    /// Which SMC driver the helper was started with
    pub driver: String,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_value(v: f64) -> Self {
        Response::Ok(ResponseData::value(v))
    }

    pub fn ok_success(s: bool) -> Self {
        Response::Ok(ResponseData::success(s))
    }

    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

/// Keys are exactly four printable ASCII characters (trailing spaces allowed).
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.len() != KEY_LENGTH {
        return Err(format!(
            "Key must be exactly {} characters, got {}",
            KEY_LENGTH,
            key.len()
        ));
    }

    for c in key.chars() {
        if !(' '..='~').contains(&c) {
            return Err(format!("Key contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

pub fn validate_fan_index(index: u8) -> Result<(), &'static str> {
    if index > MAX_FAN_INDEX {
        return Err("Fan index out of range (0-9)");
    }
    Ok(())
}

pub fn validate_rpm(rpm: f64) -> Result<(), String> {
    if !rpm.is_finite() {
        return Err("RPM must be a finite number".into());
    }
    if rpm < 0.0 {
        return Err("RPM cannot be negative".into());
    }
    if rpm > MAX_FAN_RPM {
        return Err(format!("RPM too high (maximum {})", MAX_FAN_RPM));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let env = RequestEnvelope::with_id(Request::ReadKey { key: "TC0P".into() }, 7);
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"id":7,"cmd":"ReadKey","data":{"key":"TC0P"}}"#);

        let unit = serde_json::to_string(&RequestEnvelope::with_id(Request::GetFanCount, 8)).unwrap();
        assert_eq!(unit, r#"{"id":8,"cmd":"GetFanCount"}"#);
    }

    #[test]
    fn test_response_parses_back() {
        let env = ResponseEnvelope::new(3, Response::ok_value(41.5));
        let json = serde_json::to_string(&env).unwrap();
        let back: ResponseEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
        match back.response {
            Response::Ok(data) => assert_eq!(data.value, Some(41.5)),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_carries_code() {
        let env = ResponseEnvelope::new(
            9,
            Response::error(ErrorCode::ServiceNotFound, "AppleSMC not present"),
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains(r#""code":"service_not_found""#));
        let back: ResponseEnvelope = serde_json::from_str(&json).unwrap();
        match back.response {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::ServiceNotFound);
                assert_eq!(message, "AppleSMC not present");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("TC0P").is_ok());
        assert!(validate_key("FS! ").is_ok());
        assert!(validate_key("TC0").is_err());
        assert!(validate_key("TC0PX").is_err());
        assert!(validate_key("TC\u{0}P").is_err());
        assert!(validate_key("TCé").is_err());
    }

    #[test]
    fn test_validate_fan_requests() {
        assert!(Request::SetFanSpeed { index: 0, rpm: 3000.0 }.validate().is_ok());
        assert!(Request::SetFanSpeed { index: 10, rpm: 3000.0 }.validate().is_err());
        assert!(Request::SetFanSpeed { index: 0, rpm: f64::NAN }.validate().is_err());
        assert!(Request::SetFanSpeed { index: 0, rpm: -1.0 }.validate().is_err());
        assert!(Request::SetFanSpeed { index: 0, rpm: 25_000.0 }.validate().is_err());
        assert!(Request::GetFanInfo { index: 9 }.validate().is_ok());
        assert!(Request::SetFanSpeed { index: 1, rpm: 0.0 }.is_write());
        assert!(!Request::CheckStatus.is_write());
    }

    #[test]
    fn test_fan_info_contains() {
        let fan = FanInfo { min: 1200.0, max: 6000.0, current: 2000.0 };
        assert!(fan.contains(1200.0));
        assert!(fan.contains(6000.0));
        assert!(!fan.contains(200.0));
        assert!(!fan.contains(6000.5));
    }
}
