//! Error types for the decision and execution path.
//!
//! Every variant of [`EngineError`] is local to one polling cycle: the control
//! loop logs it, reports it through the notifier and carries on.

use thiserror::Error;

use crate::models::Timeframe;

/// Failures raised by a [`crate::exchange::Broker`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// The call did not complete in time; the outcome is unknown.
    #[error("broker call timed out")]
    Timeout,

    /// Transport-level failure (connection refused, reset, DNS, ...).
    #[error("broker connection lost: {0}")]
    Connection(String),

    /// The broker answered and refused the request.
    #[error("broker rejected request (code {code}): {reason}")]
    Rejected {
        code: i64,
        reason: String,
        /// Requotes, price-off and similar transient refusals.
        retryable: bool,
    },

    /// The response could not be understood.
    #[error("unexpected broker response: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Transient failures are retried with backoff; the rest are final.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Timeout | BrokerError::Connection(_) => true,
            BrokerError::Rejected { retryable, .. } => *retryable,
            BrokerError::Protocol(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Snapshot fetch failed or timed out; the cycle is skipped.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// Sizing preconditions violated; the decision is aborted.
    #[error("invalid risk input: {0}")]
    InvalidRiskInput(String),

    /// Timeout or connection loss on an order call.
    #[error("transient broker failure: {0}")]
    BrokerTransient(#[source] BrokerError),

    /// Retries exhausted or hard rejection; the signal is abandoned.
    #[error("order abandoned after {attempts} attempt(s): {reason}")]
    BrokerRejectedFinal { attempts: u32, reason: String },

    /// Broker position state disagreed with local state and local was corrected.
    #[error("reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),
}

impl EngineError {
    pub fn data_timeout(tf: Option<Timeframe>) -> Self {
        match tf {
            Some(tf) => EngineError::DataUnavailable(format!("{} bars timed out", tf)),
            None => EngineError::DataUnavailable("quote timed out".to_string()),
        }
    }

    /// Short machine-friendly label used in journals and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DataUnavailable(_) => "data_unavailable",
            EngineError::InvalidRiskInput(_) => "invalid_risk_input",
            EngineError::BrokerTransient(_) => "broker_transient",
            EngineError::BrokerRejectedFinal { .. } => "broker_rejected_final",
            EngineError::ReconciliationMismatch(_) => "reconciliation_mismatch",
        }
    }
}
