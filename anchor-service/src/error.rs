use std::fmt::Display;

use serde::Serialize;

/// Why the network refused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionFailure {
    /// The signing account cannot pay for gas.
    InsufficientFunds,
    /// The nonce was already used by a mined transaction.
    NonceExpired,
    /// A pending transaction with the same nonce pays a higher fee.
    ReplacementUnderpriced,
    /// Any other rejection by the node.
    Rejected,
}

impl SubmissionFailure {
    /// Classify the error text returned by a node when sending a transaction.
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("insufficient funds") {
            Self::InsufficientFunds
        } else if message.contains("nonce too low")
            || message.contains("nonce has already been used")
            || message.contains("nonce expired")
        {
            Self::NonceExpired
        } else if message.contains("replacement transaction underpriced")
            || message.contains("underpriced")
        {
            Self::ReplacementUnderpriced
        } else {
            Self::Rejected
        }
    }

    /// Stable name used in API error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionFailure::InsufficientFunds => "insufficientFunds",
            SubmissionFailure::NonceExpired => "nonceExpired",
            SubmissionFailure::ReplacementUnderpriced => "replacementUnderpriced",
            SubmissionFailure::Rejected => "rejected",
        }
    }
}

impl Display for SubmissionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
/// The errors surfaced by anchoring operations
pub enum Error {
    #[error("Configuration error: {0}")]
    /// Invalid or missing configuration. Not retried.
    Configuration(String),
    #[error("Invalid argument: {0}")]
    /// The request can never succeed as given.
    InvalidArgument(String),
    #[error("No available RPC endpoint: {0}")]
    /// Every candidate endpoint failed its liveness probe.
    NoAvailableEndpoint(String),
    #[error("Submission failed ({kind}): {detail}")]
    /// The node refused the transaction.
    Submission {
        /// Classified reason
        kind: SubmissionFailure,
        /// Error text from the node
        detail: String,
    },
    #[error("Timed out waiting for confirmation of {tx_hash}: {detail}")]
    /// No receipt within the bounded wait. The transaction may still be mined later.
    ConfirmationTimeout {
        /// Broadcast transaction
        tx_hash: String,
        /// What the wait observed
        detail: String,
    },
    #[error("Transaction {tx_hash} failed on-chain: {detail}")]
    /// The transaction was mined but reverted.
    OnChainFailure {
        /// Reverted transaction
        tx_hash: String,
        /// Failure detail
        detail: String,
    },
    #[error("Verification failed: {0}")]
    /// Querying anchor events failed.
    Verification(anyhow::Error),
    #[error("Network error: {0}")]
    /// Transport level fault talking to an endpoint.
    Network(anyhow::Error),
    #[error("Store error: {0}")]
    /// Persisting or reading jobs and anchoring records failed.
    Store(anyhow::Error),
    #[error("Store temporarily unavailable: {0}")]
    /// The store is busy or unreachable. The same call may succeed later.
    StoreUnavailable(anyhow::Error),
}

impl Error {
    /// Build a submission error by classifying the node's error text.
    pub fn submission(detail: impl Display) -> Self {
        let detail = detail.to_string();
        Self::Submission {
            kind: SubmissionFailure::classify(&detail),
            detail,
        }
    }

    /// Short machine readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::InvalidArgument(_) => "invalidArgument",
            Error::NoAvailableEndpoint(_) => "noAvailableEndpoint",
            Error::Submission { kind, .. } => kind.as_str(),
            Error::ConfirmationTimeout { .. } => "confirmationTimeout",
            Error::OnChainFailure { .. } => "onChainFailure",
            Error::Verification(_) => "verification",
            Error::Network(_) => "network",
            Error::Store(_) => "store",
            Error::StoreUnavailable(_) => "storeUnavailable",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoAvailableEndpoint(_)
                | Error::Network(_)
                | Error::Verification(_)
                | Error::StoreUnavailable(_)
        )
    }
}

impl From<passport_sql::Error> for Error {
    fn from(value: passport_sql::Error) -> Self {
        if value.is_transient() {
            Self::StoreUnavailable(anyhow::Error::new(value))
        } else {
            Self::Store(anyhow::Error::new(value))
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        passport_sql::Error::from(value).into()
    }
}
