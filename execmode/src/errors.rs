//! Error types shared by every execmode component.
//!
//! Pipelines carry `ExecError` as their failure value, so the enum must be
//! `Clone`: a recovered failure may be observed by a log tap and a recover
//! stage in the same run.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// Failure propagated from an outbound dependency (transport error,
    /// unexpected status, malformed body).
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// An outbound call or a bounded wait exceeded its limit.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A transform, invoke or recover stage returned an error or panicked.
    #[error("stage failed: {0}")]
    SideEffect(String),

    /// Surfaced to stream consumers and cancelled `Uni` subscriptions.
    #[error("cancelled")]
    Cancelled,

    /// An indefinite wait was attempted on an event-loop thread.
    #[error("illegal blocking call on event-loop thread '{thread}'")]
    IllegalBlockingUse { thread: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target pool no longer accepts work.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Status-like classification used when a failure becomes an error
    /// response.
    pub fn status_code(&self) -> u16 {
        match self {
            ExecError::Upstream(_) => 502,
            ExecError::Timeout(_) => 504,
            ExecError::NotFound(_) => 404,
            ExecError::InvalidArgument(_) => 400,
            ExecError::Rejected(_) => 503,
            ExecError::Cancelled => 499,
            ExecError::SideEffect(_)
            | ExecError::IllegalBlockingUse { .. }
            | ExecError::Config(_)
            | ExecError::Internal(_) => 500,
        }
    }

    pub fn is_illegal_blocking(&self) -> bool {
        matches!(self, ExecError::IllegalBlockingUse { .. })
    }

    /// Build a `SideEffect` failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "stage panicked".to_string()
        };
        ExecError::SideEffect(message)
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(e: serde_json::Error) -> Self {
        ExecError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ExecError::Upstream("x".into()).status_code(), 502);
        assert_eq!(
            ExecError::Timeout(Duration::from_millis(5000)).status_code(),
            504
        );
        assert_eq!(ExecError::NotFound("/nope".into()).status_code(), 404);
        assert_eq!(
            ExecError::IllegalBlockingUse {
                thread: "event-loop-0".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = ExecError::Timeout(Duration::from_millis(5000));
        assert_eq!(err.to_string(), "timed out after 5000ms");
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = ExecError::from_panic(Box::new("boom"));
        assert_eq!(err, ExecError::SideEffect("boom".into()));

        let err = ExecError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err, ExecError::SideEffect("owned boom".into()));

        let err = ExecError::from_panic(Box::new(42_u32));
        assert_eq!(err, ExecError::SideEffect("stage panicked".into()));
    }
}
