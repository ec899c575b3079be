use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("i/o error talking to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no response from {target} within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("{target} answered {code}")]
    Status { target: String, code: String },
    #[error("malformed CoAP message: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is neither state JSON ({json}) nor compact CBOR ({cbor})")]
    Unrecognized { json: String, cbor: String },
    #[error("invalid CBOR: {0}")]
    Cbor(String),
    #[error("CBOR root is not a map")]
    NotAMap,
    #[error("compact field {key} is not an integer")]
    Field { key: u8 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("alert queue is full")]
    QueueFull,
    #[error("alert publisher is closed")]
    Closed,
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("failed to serialize alert: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("{action} failed for {endpoint}{}: {source}", .battery.map(|idx| format!(" battery #{idx}")).unwrap_or_default())]
pub struct ControlError {
    pub endpoint: String,
    pub battery: Option<u32>,
    pub action: &'static str,
    #[source]
    pub source: TransportError,
}

/// Failures that abort one endpoint's poll.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.0)
    }
}

impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        tracing::error!(error = %err, "persistence error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
    }
}

pub type AppResult<T> = Result<T, AppError>;
