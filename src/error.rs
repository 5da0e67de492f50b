// =============================================================================
// EngineError taxonomy
// =============================================================================
//
// Internal plumbing returns `anyhow::Result` and attaches `.context(...)` at
// each hop; at module boundaries that produce a user- or API-facing result,
// the error is narrowed into one of these fixed variants so HTTP handlers and
// the WS push surface can map it to a stable `{kind, message, details}` shape
// without string-matching free-form anyhow text.

use serde::Serialize;
use thiserror::Error;

use crate::types::VetoReason;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("insufficient history: need {need} bars, have {have}")]
    InsufficientHistory { need: usize, have: usize },

    #[error("no signal available")]
    NoSignal,

    #[error("vetoed: {reason}")]
    Veto { reason: VetoReason },

    #[error("position size exceeds configured cap")]
    Oversize,

    #[error("stale data: last update {age_ms}ms ago exceeds {limit_ms}ms")]
    Stale { age_ms: i64, limit_ms: i64 },

    #[error("cancelled")]
    Cancelled,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable tag, stable across releases, used as the `kind`
    /// field of the JSON error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "E_BadInput",
            Self::InsufficientHistory { .. } => "E_InsufficientHistory",
            Self::NoSignal => "E_NoSignal",
            Self::Veto { .. } => "E_Veto",
            Self::Oversize => "E_Oversize",
            Self::Stale { .. } => "E_Stale",
            Self::Cancelled => "E_Cancelled",
            Self::Upstream(_) => "E_Upstream",
            Self::Config(_) => "E_Config",
            Self::Internal(_) => "E_Internal",
        }
    }

    /// HTTP status an axum handler should answer with for this variant.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadInput(_) => 400,
            Self::InsufficientHistory { .. } => 409,
            Self::NoSignal => 200,
            Self::Veto { .. } => 409,
            Self::Oversize => 409,
            Self::Stale { .. } => 503,
            Self::Cancelled => 409,
            Self::Upstream(_) => 503,
            Self::Config(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::InsufficientHistory { need, have } => {
                serde_json::json!({ "need": need, "have": have })
            }
            Self::Veto { reason } => serde_json::json!({ "reason": reason.to_string() }),
            Self::Stale { age_ms, limit_ms } => {
                serde_json::json!({ "age_ms": age_ms, "limit_ms": limit_ms })
            }
            _ => serde_json::Value::Null,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                kind: self.kind().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(EngineError::BadInput("x".into()).kind(), "E_BadInput");
        assert_eq!(
            EngineError::Veto {
                reason: VetoReason::Spread
            }
            .kind(),
            "E_Veto"
        );
    }

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(EngineError::NoSignal.status_code(), 200);
        assert_eq!(
            EngineError::Stale {
                age_ms: 1,
                limit_ms: 1
            }
            .status_code(),
            503
        );
        assert_eq!(EngineError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn insufficient_history_details_carries_counts() {
        let e = EngineError::InsufficientHistory { need: 50, have: 3 };
        assert_eq!(e.details()["need"], 50);
        assert_eq!(e.details()["have"], 3);
    }
}
