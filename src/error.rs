use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::gpio::Direction;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Line not found: {0}")]
    LineNotFound(u32),
    #[error("Invalid direction: {0}")]
    DirectionInvalid(String),
    #[error("Line {0} not configured")]
    LineNotConfigured(u32),
    #[error("Line {line_id} is configured as {direction}")]
    WrongDirection { line_id: u32, direction: Direction },
    #[error("Hardware configure failed: {0}")]
    HardwareConfigureFailed(String),
    #[error("Hardware write failed: {0}")]
    HardwareWriteFailed(String),
    #[error("Hardware read failed: {0}")]
    HardwareReadFailed(String),
    #[error("Shutting down, lines are locked low")]
    ShuttingDown,
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure kind as carried in websocket error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LineNotFound,
    DirectionInvalid,
    LineNotConfigured,
    WrongDirection,
    HardwareConfigureFailed,
    HardwareWriteFailed,
    HardwareReadFailed,
    ShuttingDown,
    InvalidFormat,
    Lagged,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::LineNotFound(_) => ErrorKind::LineNotFound,
            AppError::DirectionInvalid(_) => ErrorKind::DirectionInvalid,
            AppError::LineNotConfigured(_) => ErrorKind::LineNotConfigured,
            AppError::WrongDirection { .. } => ErrorKind::WrongDirection,
            AppError::HardwareConfigureFailed(_) => ErrorKind::HardwareConfigureFailed,
            AppError::HardwareWriteFailed(_) => ErrorKind::HardwareWriteFailed,
            AppError::HardwareReadFailed(_) => ErrorKind::HardwareReadFailed,
            AppError::ShuttingDown => ErrorKind::ShuttingDown,
            AppError::InvalidValue(_) => ErrorKind::InvalidFormat,
            AppError::Config(_) => ErrorKind::Internal,
        }
    }
}

/// Errors reported by a hardware line backend.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("unknown line {0}")]
    UnknownLine(u32),
    #[error("{0}")]
    Fault(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::LineNotFound(_) | AppError::LineNotConfigured(_) => StatusCode::NOT_FOUND,
            AppError::DirectionInvalid(_) | AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::WrongDirection { .. } => StatusCode::CONFLICT,
            AppError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AppError::HardwareConfigureFailed(_)
            | AppError::HardwareWriteFailed(_)
            | AppError::HardwareReadFailed(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(json!({ "error": self.to_string(), "kind": self.kind() }))
    }
}
