//! In-flight encrypt/unlock bookkeeping.

use crate::error::{EnforcerError, EnforcerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Workflow step currently executing (or that failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validate,
    PreserveData,
    LuksFormat,
    Open,
    MakeFilesystem,
    RestoreData,
    Mount,
    Finalize,
    VerifyFilesystem,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::PreserveData => "preserve-data",
            Phase::LuksFormat => "luks-format",
            Phase::Open => "open",
            Phase::MakeFilesystem => "make-filesystem",
            Phase::RestoreData => "restore-data",
            Phase::Mount => "mount",
            Phase::Finalize => "finalize",
            Phase::VerifyFilesystem => "verify-filesystem",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which workflow an operation (or token) is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Encrypt,
    Unlock,
}

impl OperationKind {
    /// Single-byte code used by the secrets channel.
    pub fn wire_code(&self) -> u8 {
        match self {
            OperationKind::Encrypt => 1,
            OperationKind::Unlock => 2,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationKind::Encrypt),
            2 => Some(OperationKind::Unlock),
            _ => None,
        }
    }

    pub fn first_phase(&self) -> Phase {
        match self {
            OperationKind::Encrypt => Phase::Validate,
            OperationKind::Unlock => Phase::Open,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Encrypt => f.write_str("encrypt"),
            OperationKind::Unlock => f.write_str("unlock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One running workflow. Lives in the [`OperationTable`] until its worker returns.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub path: String,
    pub kind: OperationKind,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub staging: Option<PathBuf>,
    /// Set when the device disappeared mid-flight.
    pub aborted: bool,
}

impl Operation {
    pub fn new(path: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: OperationId::generate(),
            path: path.into(),
            kind,
            phase: kind.first_phase(),
            started_at: Utc::now(),
            staging: None,
            aborted: false,
        }
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id.clone(),
            kind: self.kind,
            phase: self.phase,
            started_at: self.started_at,
            aborted: self.aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub kind: OperationKind,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub aborted: bool,
}

/// Terminal result reported by a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded { mountpoint: Option<String> },
    Failed { phase: Phase, message: String },
}

impl OperationOutcome {
    pub fn from_result(result: &EnforcerResult<PathBuf>, fallback_phase: Phase) -> Self {
        match result {
            Ok(mountpoint) => OperationOutcome::Succeeded {
                mountpoint: Some(mountpoint.display().to_string()),
            },
            Err(EnforcerError::Crypto { phase, message }) => OperationOutcome::Failed {
                phase: *phase,
                message: message.clone(),
            },
            Err(other) => OperationOutcome::Failed {
                phase: fallback_phase,
                message: other.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Succeeded { .. })
    }
}

/// At most one operation per device path.
#[derive(Debug, Default)]
pub struct OperationTable {
    by_path: HashMap<String, Operation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `op`, refusing when its path already has an operation.
    pub fn insert(&mut self, op: Operation) -> EnforcerResult<OperationId> {
        if self.by_path.contains_key(&op.path) {
            return Err(EnforcerError::OperationInProgress(op.path));
        }
        let id = op.id.clone();
        self.by_path.insert(op.path.clone(), op);
        Ok(id)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&Operation> {
        self.by_path.get(path)
    }

    pub fn get_by_id(&self, id: &OperationId) -> Option<&Operation> {
        self.by_path.values().find(|op| &op.id == id)
    }

    fn find_mut(&mut self, id: &OperationId) -> Option<&mut Operation> {
        self.by_path.values_mut().find(|op| &op.id == id)
    }

    /// Record a phase transition; returns the device path when the id is live.
    pub fn set_phase(&mut self, id: &OperationId, phase: Phase) -> Option<String> {
        self.find_mut(id).map(|op| {
            op.phase = phase;
            op.path.clone()
        })
    }

    pub fn set_staging(&mut self, id: &OperationId, staging: Option<PathBuf>) {
        if let Some(op) = self.find_mut(id) {
            op.staging = staging;
        }
    }

    /// Flag the operation on `path` as aborted. The entry stays until its
    /// worker returns.
    pub fn mark_aborted(&mut self, path: &str) -> Option<OperationId> {
        self.by_path.get_mut(path).map(|op| {
            op.aborted = true;
            op.id.clone()
        })
    }

    /// Remove the operation with `id`, returning it.
    pub fn finish(&mut self, id: &OperationId) -> Option<Operation> {
        let path = self
            .by_path
            .iter()
            .find(|(_, op)| &op.id == id)
            .map(|(path, _)| path.clone())?;
        self.by_path.remove(&path)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
