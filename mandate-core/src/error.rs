//! Error types for Mandate.
//!
//! Every error belongs to exactly one [`ErrorKind`]. The kind drives
//! propagation: configuration and validation errors fail fast before any
//! network or signing call, transient network errors are absorbed by the
//! [`RetryExecutor`](crate::retry::RetryExecutor), and on-chain reverts are
//! recorded against the agent without being retried.

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for Mandate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy.
///
/// The kind is what callers branch on; the concrete [`Error`] variant carries
/// the details for logs and user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wallet, session or engine configuration is missing or unusable.
    Configuration,
    /// The request violates policy or local state. Rejected before any
    /// network or signing call.
    Validation,
    /// Timeouts, rate limiting, 5xx responses, dropped connections.
    TransientNetwork,
    /// The transaction was included but reverted.
    OnChainRevert,
    /// The signer was cancelled by the user or failed.
    Signature,
    /// Serialization, IO, or unexpected response shapes.
    Internal,
}

impl ErrorKind {
    /// Machine-readable name (kebab-case).
    pub fn name(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::TransientNetwork => "transient-network",
            Self::OnChainRevert => "on-chain-revert",
            Self::Signature => "signature",
            Self::Internal => "internal",
        }
    }

    /// Whether a failure of this kind may succeed when retried unchanged.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::TransientNetwork)
    }
}

/// Errors that can occur in Mandate operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Engine configuration is missing or invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// No agent record exists for the given id.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// A delegation required for the chain is not in the store.
    #[error("delegation not found: {0}")]
    DelegationNotFound(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Generic validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Delegation expiry is outside the allowed policy window.
    #[error("expiry of {days} days is outside the allowed range [{min}, {max}]")]
    ExpiryOutOfBounds { days: u32, min: u32, max: u32 },

    /// Call limit is outside the allowed policy window.
    #[error("call limit {limit} is outside the allowed range [{min}, {max}]")]
    CallLimitOutOfBounds { limit: u64, min: u64, max: u64 },

    /// Value cap must be strictly positive.
    #[error("value cap per call must be greater than zero")]
    InvalidValueCap,

    /// A delegation needs at least one target.
    #[error("target list must not be empty")]
    EmptyTargets,

    /// Root delegation budget exceeds the hard safety ceiling.
    #[error("approximate budget {budget} exceeds safety ceiling {ceiling}")]
    BudgetCeilingExceeded { budget: U256, ceiling: U256 },

    /// Token transfer scopes must pin both recipient and amount.
    #[error("transfer scope on {token} must pin both recipient and amount")]
    IncompleteTransferPin { token: Address },

    /// The agent is not in the running state.
    #[error("agent is {status}, not running")]
    AgentNotRunning { status: String },

    /// The agent's authority has expired.
    #[error("delegation expired at {0}")]
    DelegationExpired(DateTime<Utc>),

    /// The agent has used all of its trades.
    #[error("max trades reached: {executed}/{max_allowed}")]
    MaxTradesReached { executed: u64, max_allowed: u64 },

    /// The local budget ledger cannot cover the requested spend.
    #[error("insufficient budget for {token}: requested {requested}, remaining {remaining}")]
    InsufficientBudget {
        token: Address,
        requested: U256,
        remaining: U256,
    },

    /// Approvals may only target whitelisted spenders.
    #[error("spender {0} is not whitelisted")]
    SpenderNotWhitelisted(Address),

    /// The innermost delegate is not the account that will submit.
    #[error("chain delegate mismatch: expected {expected}, chain starts with {actual}")]
    ChainDelegateMismatch { expected: Address, actual: Address },

    /// The sub-delegation does not point at the stored root.
    #[error("chain broken: {0}")]
    ChainBroken(String),

    /// A cached quote is missing or expired.
    #[error("quote {0} is unavailable or expired, re-quote before trading")]
    QuoteUnavailable(String),

    // =========================================================================
    // Transient Network Errors
    // =========================================================================
    /// Connection reset, DNS failure, request timeout.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP status from an upstream service.
    #[error("upstream returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// JSON-RPC error object returned by a node or bundler.
    #[error("rpc error {code} from {method}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    // =========================================================================
    // On-chain Errors
    // =========================================================================
    /// Transaction or user operation reverted.
    #[error("reverted on-chain{}: {reason}", in_tx(.tx_hash))]
    Reverted { tx_hash: Option<B256>, reason: String },

    // =========================================================================
    // Signature Errors
    // =========================================================================
    /// The user dismissed the signing prompt.
    #[error("signature request cancelled by user")]
    SignatureCancelled,

    /// The signer failed for a reason other than cancellation.
    #[error("signer failed: {0}")]
    SignatureFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(String),

    /// Response was well-formed JSON but not the expected shape.
    #[error("unexpected response from {context}: {detail}")]
    UnexpectedResponse { context: String, detail: String },
}

fn in_tx(tx_hash: &Option<B256>) -> String {
    tx_hash.map(|h| format!(" in {h}")).unwrap_or_default()
}

/// Phrases that mark an otherwise opaque failure as transient.
const TRANSIENT_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "connection reset",
    "econnreset",
    "temporarily unavailable",
    "try again",
];

fn is_transient_phrase(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigurationError(_) | Self::AgentNotFound(_) | Self::DelegationNotFound(_) => {
                ErrorKind::Configuration
            }

            Self::Validation(_)
            | Self::ExpiryOutOfBounds { .. }
            | Self::CallLimitOutOfBounds { .. }
            | Self::InvalidValueCap
            | Self::EmptyTargets
            | Self::BudgetCeilingExceeded { .. }
            | Self::IncompleteTransferPin { .. }
            | Self::AgentNotRunning { .. }
            | Self::DelegationExpired(_)
            | Self::MaxTradesReached { .. }
            | Self::InsufficientBudget { .. }
            | Self::SpenderNotWhitelisted(_)
            | Self::ChainDelegateMismatch { .. }
            | Self::ChainBroken(_)
            | Self::QuoteUnavailable(_) => ErrorKind::Validation,

            Self::Network(_) => ErrorKind::TransientNetwork,
            Self::HttpStatus { status, .. } => match status {
                408 | 429 | 500 | 502 | 503 | 504 => ErrorKind::TransientNetwork,
                _ => ErrorKind::Internal,
            },
            Self::Rpc { message, .. } => {
                if is_transient_phrase(message) {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::Internal
                }
            }

            Self::Reverted { .. } => ErrorKind::OnChainRevert,

            Self::SignatureCancelled | Self::SignatureFailed(_) => ErrorKind::Signature,

            Self::SerializationError(_)
            | Self::DeserializationError(_)
            | Self::Io(_)
            | Self::UnexpectedResponse { .. } => ErrorKind::Internal,
        }
    }

    /// Machine-readable name of this error (kebab-case).
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigurationError(_) => "configuration-error",
            Self::AgentNotFound(_) => "agent-not-found",
            Self::DelegationNotFound(_) => "delegation-not-found",
            Self::Validation(_) => "validation-error",
            Self::ExpiryOutOfBounds { .. } => "expiry-out-of-bounds",
            Self::CallLimitOutOfBounds { .. } => "call-limit-out-of-bounds",
            Self::InvalidValueCap => "invalid-value-cap",
            Self::EmptyTargets => "empty-targets",
            Self::BudgetCeilingExceeded { .. } => "budget-ceiling-exceeded",
            Self::IncompleteTransferPin { .. } => "incomplete-transfer-pin",
            Self::AgentNotRunning { .. } => "agent-not-running",
            Self::DelegationExpired(_) => "delegation-expired",
            Self::MaxTradesReached { .. } => "max-trades-reached",
            Self::InsufficientBudget { .. } => "insufficient-budget",
            Self::SpenderNotWhitelisted(_) => "spender-not-whitelisted",
            Self::ChainDelegateMismatch { .. } => "chain-delegate-mismatch",
            Self::ChainBroken(_) => "chain-broken",
            Self::QuoteUnavailable(_) => "quote-unavailable",
            Self::Network(_) => "network-error",
            Self::HttpStatus { .. } => "http-status",
            Self::Rpc { .. } => "rpc-error",
            Self::Reverted { .. } => "reverted",
            Self::SignatureCancelled => "signature-cancelled",
            Self::SignatureFailed(_) => "signature-failed",
            Self::SerializationError(_) => "serialization-error",
            Self::DeserializationError(_) => "deserialization-error",
            Self::Io(_) => "io-error",
            Self::UnexpectedResponse { .. } => "unexpected-response",
        }
    }

    /// Shorthand for `self.kind().is_retriable()`.
    pub fn is_transient(&self) -> bool {
        self.kind().is_retriable()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Error::HttpStatus {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        if e.is_decode() {
            return Error::DeserializationError(e.to_string());
        }
        Error::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_never_retried() {
        let errors = vec![
            Error::MaxTradesReached {
                executed: 3,
                max_allowed: 3,
            },
            Error::SpenderNotWhitelisted(Address::ZERO),
            Error::DelegationExpired(Utc::now()),
            Error::EmptyTargets,
        ];
        for error in errors {
            assert_eq!(error.kind(), ErrorKind::Validation);
            assert!(!error.is_transient(), "{} must not be retried", error.name());
        }
    }

    #[test]
    fn test_http_status_classification() {
        for status in [429u16, 502, 503, 504] {
            let err = Error::HttpStatus {
                status,
                message: "upstream".into(),
            };
            assert_eq!(err.kind(), ErrorKind::TransientNetwork, "status {status}");
        }

        let err = Error::HttpStatus {
            status: 400,
            message: "bad request".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_rpc_rate_limit_phrasing_is_transient() {
        let err = Error::Rpc {
            method: "eth_call".into(),
            code: -32005,
            message: "Rate limit exceeded, please slow down".into(),
        };
        assert!(err.is_transient());

        let err = Error::Rpc {
            method: "eth_call".into(),
            code: -32000,
            message: "execution reverted".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_signature_errors_are_distinct() {
        assert_eq!(Error::SignatureCancelled.kind(), ErrorKind::Signature);
        assert_eq!(Error::SignatureCancelled.name(), "signature-cancelled");
        assert_eq!(
            Error::SignatureFailed("enclave".into()).kind(),
            ErrorKind::Signature
        );
    }

    #[test]
    fn test_error_name_format() {
        let errors = vec![
            Error::ConfigurationError("x".into()),
            Error::InvalidValueCap,
            Error::Reverted {
                tx_hash: None,
                reason: "x".into(),
            },
            Error::QuoteUnavailable("q".into()),
        ];
        for error in errors {
            let name = error.name();
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '-'),
                "Error name '{}' is not kebab-case",
                name
            );
            assert!(!name.starts_with('-') && !name.ends_with('-'));
        }
    }

    #[test]
    fn test_revert_display_includes_hash() {
        let err = Error::Reverted {
            tx_hash: Some(B256::repeat_byte(0xab)),
            reason: "ValueLteEnforcer:value-too-high".into(),
        };
        let text = err.to_string();
        assert!(text.contains("0xabab"));
        assert!(text.contains("value-too-high"));
    }
}
