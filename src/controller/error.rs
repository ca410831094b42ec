//! Provisioning errors and their coarse taxonomy

use std::fmt;

use thiserror::Error;

use super::stage::StageId;
use crate::dns::LivenessError;
use crate::gitops::GitError;
use crate::infra::InfraError;
use crate::provider::ProviderError;
use crate::store::StoreError;

/// Why a single stage failed; wraps the collaborator error unchanged
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Liveness(#[from] LivenessError),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Missing run state: {0}")]
    MissingState(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Failure of a provisioning run
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Stage {stage} failed: {source}")]
    Stage { stage: StageId, source: StageError },

    /// The stage failed and clearing `in_progress` failed as well
    #[error("Stage {stage} failed: {source} (resetting in_progress also failed: {reset})")]
    Reset {
        stage: StageId,
        source: StageError,
        reset: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidField,
    InvalidInput,
    ExternalCallFailed,
    DomainNotLive,
    DnsRecordCreateFailed,
    LeaseHeld,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::EnvironmentNotFound(_) => ErrorKind::NotFound,
            StoreError::AlreadyExists(_) | StoreError::EnvironmentExists(_) => {
                ErrorKind::AlreadyExists
            }
            StoreError::InvalidField(_) => ErrorKind::InvalidField,
            StoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            StoreError::LeaseHeld { .. } => ErrorKind::LeaseHeld,
            StoreError::Backend(_) => ErrorKind::ExternalCallFailed,
        }
    }
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Store(e) => e.kind(),
            StageError::Provider(ProviderError::NotFound(_)) => ErrorKind::NotFound,
            StageError::Provider(_) => ErrorKind::ExternalCallFailed,
            StageError::Liveness(e) => match e {
                LivenessError::ExternalCallFailed { .. } => ErrorKind::ExternalCallFailed,
                LivenessError::DnsRecordCreateFailed { .. } => ErrorKind::DnsRecordCreateFailed,
                LivenessError::DomainNotLive { .. } => ErrorKind::DomainNotLive,
                LivenessError::Cancelled => ErrorKind::Cancelled,
            },
            StageError::Infra(_) | StageError::Git(_) => ErrorKind::ExternalCallFailed,
            StageError::MissingState(_) => ErrorKind::NotFound,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl ProvisionError {
    pub fn stage(&self) -> StageId {
        match self {
            ProvisionError::Stage { stage, .. } | ProvisionError::Reset { stage, .. } => *stage,
        }
    }

    /// The error that stopped the run
    pub fn stage_error(&self) -> &StageError {
        match self {
            ProvisionError::Stage { source, .. } | ProvisionError::Reset { source, .. } => source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.stage_error().kind()
    }
}
