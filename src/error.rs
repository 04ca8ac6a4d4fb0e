use crate::primitives::{
    AssertionHash,
    TxHash,
    B256,
};

use alloy_transport::TransportError;

use std::fmt::Debug;
use thiserror::Error;

/// Errors surfaced by a [`ChainBackend`](crate::backend::ChainBackend).
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("execution reverted: {reason}")]
    Reverted { reason: String },
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("transaction queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },
}

impl BackendError {
    /// Connection level failures that did not reach the node's execution layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            Self::Reverted { reason } => Some(reason),
            _ => None,
        }
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ErrorResp(payload) => {
                let reason = payload
                    .as_revert_data()
                    .and_then(|data| alloy_sol_types::decode_revert_reason(&data));
                match reason {
                    Some(reason) => Self::Reverted { reason },
                    None if payload.message.contains("revert") => {
                        Self::Reverted {
                            reason: payload.message.to_string(),
                        }
                    }
                    None => Self::Rpc(payload.message.to_string()),
                }
            }
            TransportError::Transport(kind) => Self::Transport(kind.to_string()),
            other => Self::Rpc(other.to_string()),
        }
    }
}

pub type BackendResult<T = ()> = std::result::Result<T, BackendError>;

/// Semantic classes of ledger reverts this crate knows how to act upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertKind {
    AlreadyExists,
    PrevDoesNotExist,
    TooLate,
    EdgeNotConfirmed,
}

/// Revert reason substrings emitted by the rollup and challenge manager contracts, mapped to
/// the error they represent. This table is the only place coupled to the contracts' revert
/// wording; any upstream rewording must be mirrored here.
pub const REVERT_CLASSIFIERS: &[(&str, RevertKind)] = &[
    ("EXPECTED_ASSERTION_SEEN", RevertKind::AlreadyExists),
    ("already known", RevertKind::AlreadyExists),
    ("Assertion already exists", RevertKind::AlreadyExists),
    ("Assertion does not exist", RevertKind::PrevDoesNotExist),
    ("Too late to create sibling", RevertKind::TooLate),
    ("EdgeNotConfirmed", RevertKind::EdgeNotConfirmed),
    ("Edge not confirmed", RevertKind::EdgeNotConfirmed),
];

/// Confirmation attempts failing with one of these are retried by the confirmation loop.
pub const CONFIRMATION_NOT_READY: &[&str] = &["BEFORE_DEADLINE", "CHALLENGE_GRACE_PERIOD_NOT_PASSED"];

/// The challenge manager refuses a timer update that would not raise the cached timer.
pub const CACHED_TIME_SUFFICIENT: &str = "CachedTimeSufficient";

pub fn classify_revert(reason: &str) -> Option<RevertKind> {
    REVERT_CLASSIFIERS
        .iter()
        .find(|(needle, _)| reason.contains(needle))
        .map(|(_, kind)| *kind)
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("item not found on-chain: {0}")]
    NotFound(String),
    #[error("item already exists on-chain: {0}")]
    AlreadyExists(String),
    #[error("assertion predecessor does not exist")]
    PrevDoesNotExist,
    #[error("too late to create assertion sibling")]
    TooLate,
    #[error("batch not yet found")]
    BatchNotYetFound,
    #[error("edge not confirmed: {0}")]
    EdgeNotConfirmed(String),
    #[error("parent id {parent} is not the latest confirmed assertion {latest_confirmed}")]
    NotLatestConfirmed {
        parent: AssertionHash,
        latest_confirmed: AssertionHash,
    },
    #[error("internal invariant violated: {0}")]
    Internal(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("gas estimation failed: {0}")]
    SimulationFailed(#[source] BackendError),
    #[error("transaction {tx_hash} reverted: {reason}")]
    TxReverted { tx_hash: TxHash, reason: String },
    #[error("transaction {0} was not mined in time")]
    MiningTimeout(TxHash),
    #[error("operation cancelled")]
    Cancelled,
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("abi decoding error: {0}")]
    Decode(#[from] alloy_sol_types::Error),
}

pub type ChainResult<T = ()> = std::result::Result<T, ChainError>;

impl ChainError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Revert reason carried by the error, whether it surfaced during simulation, as a call
    /// failure, or from a mined transaction.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            Self::SimulationFailed(err) | Self::Backend(err) => err.revert_reason(),
            Self::TxReverted { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Maps a revert matching [`REVERT_CLASSIFIERS`] to its semantic variant.
    pub fn classified(self) -> Self {
        let Some(kind) = self.revert_reason().and_then(classify_revert) else {
            return self;
        };
        let reason = self.revert_reason().unwrap_or_default().to_string();
        match kind {
            RevertKind::AlreadyExists => Self::AlreadyExists(reason),
            RevertKind::PrevDoesNotExist => Self::PrevDoesNotExist,
            RevertKind::TooLate => Self::TooLate,
            RevertKind::EdgeNotConfirmed => Self::EdgeNotConfirmed(reason),
        }
    }

    /// Whether a confirmation attempt failed only because it was attempted too early.
    pub fn is_confirmation_not_ready(&self) -> bool {
        if matches!(self, Self::NotLatestConfirmed { .. }) {
            return true;
        }
        self.revert_reason().is_some_and(|reason| {
            CONFIRMATION_NOT_READY
                .iter()
                .any(|needle| reason.contains(needle))
        })
    }

    pub fn is_cached_time_sufficient(&self) -> bool {
        self.revert_reason()
            .is_some_and(|reason| reason.contains(CACHED_TIME_SUFFICIENT))
    }
}

/// Classifies a failed assertion creation. `AlreadyExists` carries the block hash the
/// assertion commits to.
pub fn classify_create_assertion_error(err: ChainError, block_hash: B256) -> ChainError {
    match err.classified() {
        ChainError::AlreadyExists(_) => {
            ChainError::AlreadyExists(format!("commit block hash {block_hash:#x}"))
        }
        other => other,
    }
}
