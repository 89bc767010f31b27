//! Error taxonomy of the orchestrator.

use std::{fmt, time::Duration};

use alloy_core::primitives::Address;
use thiserror::Error;

use crate::{
    abi::AbiError,
    builder::BuildError,
    deployer::DeployStage,
    layout::LayoutViolation,
    ledger::LedgerError,
    registry::RegistryError,
    types::{DeploymentReceipt, VersionId},
    upgrade::UpgradeStage,
};

/// Stage an operation had reached when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Deploy(DeployStage),
    Upgrade(UpgradeStage),
    Status,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Deploy(stage) => write!(f, "deploy/{stage}"),
            Stage::Upgrade(stage) => write!(f, "upgrade/{stage}"),
            Stage::Status => f.write_str("status"),
        }
    }
}

impl From<DeployStage> for Stage {
    fn from(stage: DeployStage) -> Self {
        Stage::Deploy(stage)
    }
}

impl From<UpgradeStage> for Stage {
    fn from(stage: UpgradeStage) -> Self {
        Stage::Upgrade(stage)
    }
}

/// Coarse classification used to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before anything irreversible happened.
    Validation,
    /// The ledger failed, rejected, or did not confirm a transaction.
    Transport,
    /// The signer lacks admin rights.
    Unauthorized,
    /// Caller bug or local failure.
    Fatal,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("invalid initializer arguments: {0}")]
    InvalidInitArgs(#[from] AbiError),

    #[error("module `{name}` is already deployed behind proxy {proxy}")]
    AlreadyDeployed { name: String, proxy: Address },

    #[error("module `{name}` has not been deployed")]
    NotDeployed { name: String },

    #[error(
        "storage layout of `{name}` version {to} is incompatible with version {from}: {}",
        format_violations(violations)
    )]
    StorageLayoutIncompatible {
        name: String,
        from: VersionId,
        to: VersionId,
        violations: Vec<LayoutViolation>,
    },

    #[error("deployment failed at stage {stage}: {reason}")]
    DeploymentFailed {
        stage: Stage,
        reason: String,
        /// Last receipt obtained before the failure, for manual reconciliation.
        receipt: Option<DeploymentReceipt>,
    },

    #[error("unauthorized at stage {stage}: {reason}")]
    Unauthorized { stage: Stage, reason: String },

    #[error("transaction not confirmed within {timeout:?} at stage {stage}; re-query the ledger before retrying")]
    Unconfirmed {
        stage: Stage,
        timeout: Duration,
        receipt: Option<DeploymentReceipt>,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("ledger state changed at stage {stage} but the registry write failed: {reason}")]
    RecordFailed {
        stage: Stage,
        reason: String,
        /// Receipt of the transaction the registry failed to record.
        receipt: Option<DeploymentReceipt>,
    },

    #[error("registry for `{name}` records implementation {recorded} but the proxy points to {live}")]
    OutOfSync {
        name: String,
        recorded: Address,
        live: Address,
    },

    #[error("another operation on `{name}` is in progress")]
    Busy { name: String },

    #[error("registry error: {0}")]
    Registry(String),
}

impl DeployError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeployError::Build(_)
            | DeployError::InvalidInitArgs(_)
            | DeployError::AlreadyDeployed { .. }
            | DeployError::NotDeployed { .. }
            | DeployError::StorageLayoutIncompatible { .. }
            | DeployError::Busy { .. } => ErrorClass::Validation,
            DeployError::DeploymentFailed { .. }
            | DeployError::Unconfirmed { .. }
            | DeployError::OutOfSync { .. } => ErrorClass::Transport,
            DeployError::Unauthorized { .. } => ErrorClass::Unauthorized,
            DeployError::InvariantViolation(_)
            | DeployError::RecordFailed { .. }
            | DeployError::Registry(_) => ErrorClass::Fatal,
        }
    }

    /// Map a ledger failure at `stage`, attaching the last receipt obtained.
    ///
    /// A ledger-level authorization failure is kept distinct so it is never
    /// reported as a generic deployment failure.
    pub(crate) fn from_ledger(
        stage: Stage,
        err: LedgerError,
        receipt: Option<DeploymentReceipt>,
    ) -> Self {
        match err {
            LedgerError::Unauthorized(reason) => DeployError::Unauthorized { stage, reason },
            other => DeployError::DeploymentFailed {
                stage,
                reason: other.to_string(),
                receipt,
            },
        }
    }

    /// Map a failed registry write made after the ledger already changed.
    pub(crate) fn from_record(
        stage: Stage,
        err: RegistryError,
        receipt: Option<DeploymentReceipt>,
    ) -> Self {
        DeployError::RecordFailed {
            stage,
            reason: err.to_string(),
            receipt,
        }
    }

    /// Stage reached when the error was raised, when it is tied to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            DeployError::DeploymentFailed { stage, .. }
            | DeployError::Unauthorized { stage, .. }
            | DeployError::Unconfirmed { stage, .. }
            | DeployError::RecordFailed { stage, .. } => Some(*stage),
            DeployError::StorageLayoutIncompatible { .. } => {
                Some(Stage::Upgrade(UpgradeStage::Built))
            }
            _ => None,
        }
    }
}

impl From<RegistryError> for DeployError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvariantViolation(msg) => DeployError::InvariantViolation(msg),
            RegistryError::Busy(name) => DeployError::Busy { name },
            other => DeployError::Registry(other.to_string()),
        }
    }
}

fn format_violations(violations: &[LayoutViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(
            Stage::Upgrade(UpgradeStage::Deployed).to_string(),
            "upgrade/deployed"
        );
        assert_eq!(
            Stage::Deploy(DeployStage::ImplementationDeployed).to_string(),
            "deploy/implementation-deployed"
        );
    }

    #[test]
    fn test_registry_errors_keep_their_meaning() {
        let err: DeployError = RegistryError::InvariantViolation("proxy changed".into()).into();
        assert!(matches!(err, DeployError::InvariantViolation(_)));
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err: DeployError = RegistryError::Busy("market".into()).into();
        assert!(matches!(err, DeployError::Busy { ref name } if name == "market"));
    }

    #[test]
    fn test_ledger_unauthorized_is_not_masked() {
        let stage = Stage::Upgrade(UpgradeStage::Deployed);
        let err = DeployError::from_ledger(
            stage,
            LedgerError::Unauthorized("caller is not the admin".into()),
            None,
        );
        assert!(matches!(err, DeployError::Unauthorized { ref reason, .. } if reason == "caller is not the admin"));
        assert_eq!(err.class(), ErrorClass::Unauthorized);
        assert_eq!(err.stage(), Some(stage));

        let err = DeployError::from_ledger(stage, LedgerError::Rejected("out of gas".into()), None);
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[test]
    fn test_record_failure_keeps_stage() {
        let stage = Stage::Upgrade(UpgradeStage::Activated);
        let err = DeployError::from_record(
            stage,
            RegistryError::Busy("market".into()),
            None,
        );
        assert!(matches!(err, DeployError::RecordFailed { .. }));
        assert_eq!(err.stage(), Some(stage));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_incompatible_layout_message_lists_violations() {
        let err = DeployError::StorageLayoutIncompatible {
            name: "market".into(),
            from: VersionId::Number(1),
            to: VersionId::Number(2),
            violations: vec![
                LayoutViolation::Removed { field: "a".into() },
                LayoutViolation::Removed { field: "b".into() },
            ],
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.stage(), Some(Stage::Upgrade(UpgradeStage::Built)));
        assert!(err.to_string().ends_with("field `a` was removed; field `b` was removed"));
    }
}
