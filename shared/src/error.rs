//! Crate-wide error taxonomy.
//!
//! Every variant corresponds to one of the error kinds in the core
//! contract (admission, validation, capacity, timing, integrity,
//! discovery, transport, persistence) and renders to the stable string
//! code callers and tests match against.

use thiserror::Error;

/// Errors surfaced across the auth gate, registry, router, planner, and
/// store adapter. The `Display` impl yields the stable code; use
/// `CoreError::code()` when the code is needed as a bare `&'static str`
/// (e.g. for a JSON error body) without allocating.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("INVALID_TOKEN")]
    InvalidToken,
    #[error("INVALID_TOKEN")]
    ExpiredToken,
    #[error("INVALID_TOKEN")]
    RevokedToken,
    #[error("UNAUTHORIZED")]
    Unauthorized,
    #[error("RATE_LIMITED")]
    RateLimited { retry_after_secs: u64 },

    #[error("VALIDATION_FAILED: {0}")]
    MalformedMessage(String),
    #[error("VALIDATION_FAILED: unknown pattern {0}")]
    UnknownPattern(String),
    #[error("PLAN_INVALID: {0}")]
    PlanInvalid(String),
    #[error("DEADLINE_EXCEEDED")]
    DeadlineInPast,

    #[error("QUEUE_FULL")]
    QueueFull,
    #[error("BACKPRESSURE")]
    Backpressure,
    #[error("TRANSPORT_FAILED: circuit open for {target}")]
    CircuitOpen { target: String },

    #[error("DEADLINE_EXCEEDED")]
    DeadlineExceeded,
    #[error("CANCELLED")]
    Cancelled,

    #[error("HMAC_FAILURE")]
    HmacFailure,
    #[error("VALIDATION_FAILED: bad magic/version")]
    MalformedWire,

    #[error("NO_TARGET")]
    NoTarget,
    #[error("NO_TARGET: no agent provides capability {0}")]
    NoCapableAgent(String),

    #[error("TRANSPORT_FAILED")]
    TransportFailed,

    #[error("STORE_UNAVAILABLE")]
    StoreUnavailable,
    #[error("STORE_UNAVAILABLE: constraint violation on {0}")]
    ConstraintViolation(String),

    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("REGISTRY_FULL")]
    RegistryFull,

    #[error("PLAN_CANCELLED")]
    PlanCancelled,
}

impl CoreError {
    /// The stable code tests are expected to match against.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidToken | CoreError::ExpiredToken | CoreError::RevokedToken => {
                "INVALID_TOKEN"
            }
            CoreError::Unauthorized => "UNAUTHORIZED",
            CoreError::RateLimited { .. } => "RATE_LIMITED",
            CoreError::MalformedMessage(_)
            | CoreError::UnknownPattern(_)
            | CoreError::MalformedWire => "VALIDATION_FAILED",
            CoreError::PlanInvalid(_) => "PLAN_INVALID",
            CoreError::DeadlineInPast | CoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            CoreError::QueueFull => "QUEUE_FULL",
            CoreError::Backpressure => "BACKPRESSURE",
            CoreError::CircuitOpen { .. } | CoreError::TransportFailed => "TRANSPORT_FAILED",
            CoreError::Cancelled => "CANCELLED",
            CoreError::HmacFailure => "HMAC_FAILURE",
            CoreError::NoTarget | CoreError::NoCapableAgent(_) => "NO_TARGET",
            CoreError::StoreUnavailable | CoreError::ConstraintViolation(_) => "STORE_UNAVAILABLE",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::RegistryFull => "REGISTRY_FULL",
            CoreError::PlanCancelled => "PLAN_CANCELLED",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
