//! Error taxonomy shared by every enforcer crate.

use crate::operation::Phase;
use std::path::PathBuf;
use thiserror::Error;

pub type EnforcerResult<T> = Result<T, EnforcerError>;

/// Why a token could not be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token already consumed")]
    Consumed,
    #[error("token was issued for a different device")]
    DeviceMismatch,
    #[error("token was issued for a different operation")]
    KindMismatch,
}

#[derive(Debug, Error)]
pub enum EnforcerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse TOML configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to render TOML configuration: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unable to classify {path}: {reason}")]
    Classification { path: String, reason: String },

    #[error("enforcement failed for {path}: {reason}")]
    Enforcement { path: String, reason: String },

    #[error("{phase} phase failed: {message}")]
    Crypto { phase: Phase, message: String },

    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    #[error("secrets channel protocol error: {0}")]
    ChannelProtocol(String),

    #[error("device {0} is not known")]
    DeviceNotFound(String),

    #[error("an operation is already in progress for {0}")]
    OperationInProgress(String),

    #[error("device {path} is not eligible: {reason}")]
    Ineligible { path: String, reason: String },

    #[error("passphrase must be at least {min} characters (got {got})")]
    PassphraseTooShort { min: usize, got: usize },

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("staging area {path} is unusable: {reason}")]
    Staging { path: PathBuf, reason: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("{0}")]
    Privilege(String),
}

impl EnforcerError {
    /// Transient conditions worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, EnforcerError::DeviceBusy(_))
    }

    /// Re-tag any error as a failure of `phase`, keeping crypto errors intact.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            err @ EnforcerError::Crypto { .. } => err,
            other => EnforcerError::Crypto {
                phase,
                message: other.to_string(),
            },
        }
    }
}
