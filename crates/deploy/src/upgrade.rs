//! Upgrade of a deployed module to a new implementation.
//!
//! An upgrade walks `Built → Validated → Deployed → Activated`. The storage
//! layout is checked before anything is submitted, the new implementation is
//! recorded as a pending candidate once deployed, and the registry only moves
//! to the new version after the activation is confirmed and the proxy's live
//! implementation has been read back.

use alloy_core::primitives::Address;

use crate::{
    error::{DeployError, Stage},
    layout::check_compatibility,
    ledger::{LedgerClient, LedgerError, Transaction},
    orchestrator::{OperationContext, created_address, require_success},
    reconcile::{Reconciler, Reconciliation},
    registry::ProxyRegistry,
    types::{
        DeploymentReceipt, HistoryEntry, ModuleVersion, PendingActivation, ProxyRecord, VersionId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum UpgradeStage {
    Built,
    Validated,
    Deployed,
    Activated,
    Failed,
}

/// Progress of one upgrade call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeAttempt {
    pub module: String,
    pub from_version: VersionId,
    pub to_version: VersionId,
    stage: UpgradeStage,
}

impl UpgradeAttempt {
    fn new(module: &str, from_version: VersionId, to_version: VersionId) -> Self {
        tracing::info!(
            module = %module,
            from = %from_version,
            to = %to_version,
            stage = %UpgradeStage::Built,
            "Upgrade started"
        );
        Self {
            module: module.to_string(),
            from_version,
            to_version,
            stage: UpgradeStage::Built,
        }
    }

    pub fn stage(&self) -> UpgradeStage {
        self.stage
    }

    fn advance(&mut self, next: UpgradeStage) {
        tracing::info!(
            module = %self.module,
            to = %self.to_version,
            from_stage = %self.stage,
            stage = %next,
            "Upgrade stage reached"
        );
        self.stage = next;
    }

    /// Move to the terminal `Failed` stage.
    fn fail(&mut self, err: &DeployError) {
        tracing::error!(
            module = %self.module,
            from = %self.from_version,
            to = %self.to_version,
            stage = %self.stage,
            error = %err,
            "Upgrade failed"
        );
        self.stage = UpgradeStage::Failed;
    }
}

/// Moves an existing proxy to a new implementation.
#[derive(Debug)]
pub struct UpgradeCoordinator<'a, L, R> {
    ledger: &'a L,
    registry: &'a R,
}

impl<'a, L: LedgerClient, R: ProxyRegistry> UpgradeCoordinator<'a, L, R> {
    pub fn new(ledger: &'a L, registry: &'a R) -> Self {
        Self { ledger, registry }
    }

    /// Upgrade `name` to `version`.
    ///
    /// A retried call first reconciles any candidate left by a previous
    /// attempt, and upgrading to the version that is already active is a no-op.
    /// A candidate still waiting for activation is resumed when it is the
    /// requested version, and blocks any other version.
    pub async fn upgrade(
        &self,
        ctx: &OperationContext,
        name: &str,
        version: &ModuleVersion,
    ) -> Result<ProxyRecord, DeployError> {
        let mut record = self
            .registry
            .lookup(name)?
            .ok_or_else(|| DeployError::NotDeployed {
                name: name.to_string(),
            })?;

        if record.pending.is_some() {
            let (reconciled, outcome) = Reconciler::new(self.ledger, self.registry)
                .reconcile(ctx, Stage::Upgrade(UpgradeStage::Built), record)
                .await?;
            if outcome != Reconciliation::Unchanged {
                tracing::info!(module = %name, outcome = ?outcome, "Reconciled previous attempt");
            }
            record = reconciled;
        }

        let current = record.current_entry().cloned().ok_or_else(|| {
            DeployError::InvariantViolation(format!("record of `{name}` has no history"))
        })?;

        if current.version == version.identifier && current.artifact_digest == version.digest {
            tracing::info!(
                module = %name,
                version = %version.identifier,
                "Version already active, nothing to do"
            );
            return Ok(record);
        }

        let resume = match record.pending.clone() {
            None => None,
            Some(pending)
                if pending.version == version.identifier
                    && pending.artifact_digest == version.digest =>
            {
                tracing::info!(
                    module = %name,
                    version = %pending.version,
                    implementation = %pending.implementation_address,
                    "Resuming activation of the deployed candidate"
                );
                Some(pending)
            }
            Some(pending) => {
                tracing::warn!(
                    module = %name,
                    pending = %pending.version,
                    requested = %version.identifier,
                    implementation = %pending.implementation_address,
                    "A previous activation is still unresolved"
                );
                return Err(DeployError::Unconfirmed {
                    stage: Stage::Upgrade(UpgradeStage::Deployed),
                    timeout: ctx.confirmation_timeout,
                    receipt: None,
                });
            }
        };

        let mut attempt = UpgradeAttempt::new(name, current.version.clone(), version.identifier.clone());
        let result = self
            .run(ctx, &mut attempt, record, &current, version, resume)
            .await;
        if let Err(err) = &result {
            attempt.fail(err);
        }
        result
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        attempt: &mut UpgradeAttempt,
        mut record: ProxyRecord,
        current: &HistoryEntry,
        version: &ModuleVersion,
        resume: Option<PendingActivation>,
    ) -> Result<ProxyRecord, DeployError> {
        let name = attempt.module.clone();

        // Built -> Validated
        let violations = check_compatibility(&current.layout, &version.layout);
        if !violations.is_empty() {
            return Err(DeployError::StorageLayoutIncompatible {
                name,
                from: current.version.clone(),
                to: version.identifier.clone(),
                violations,
            });
        }
        attempt.advance(UpgradeStage::Validated);

        let stage = Stage::Upgrade(UpgradeStage::Validated);
        let account = ctx
            .confirm(stage, None, self.ledger.current_account(&ctx.signer))
            .await?;
        if account != record.admin_address {
            return Err(DeployError::Unauthorized {
                stage,
                reason: format!(
                    "signer {account} is not the admin {} of `{name}`",
                    record.admin_address
                ),
            });
        }

        // Validated -> Deployed
        let (candidate, deploy_receipt) = match resume {
            Some(candidate) => (candidate, None),
            None => {
                let (candidate, receipt) = self.deploy_candidate(ctx, stage, version).await?;
                record.pending = Some(candidate.clone());
                if let Err(err) = self.registry.record(&name, record.clone()) {
                    tracing::warn!(
                        module = %name,
                        orphaned_implementation = %candidate.implementation_address,
                        error = %err,
                        "Could not record the deployed candidate, stopping before activation"
                    );
                    return Err(DeployError::from_record(stage, err, Some(receipt)));
                }
                (candidate, Some(receipt))
            }
        };
        let implementation = candidate.implementation_address;
        attempt.advance(UpgradeStage::Deployed);

        // Deployed -> Activated
        let stage = Stage::Upgrade(UpgradeStage::Deployed);
        let activation_tx = Transaction::UpgradeProxy {
            proxy: record.proxy_address,
            implementation,
        };
        // Only the timeout is mapped here so the ledger error can be told apart below.
        let submitted = ctx
            .confirm(stage, deploy_receipt.as_ref(), async {
                Ok::<_, LedgerError>(self.ledger.submit(&activation_tx, &ctx.signer).await)
            })
            .await;
        let activation = match submitted {
            Ok(Ok(receipt)) => match require_success(stage, receipt) {
                Ok(receipt) => receipt,
                Err(err) => {
                    self.discard_candidate(&name, record, implementation);
                    return Err(err);
                }
            },
            Ok(Err(LedgerError::Transport(reason))) => {
                tracing::warn!(
                    module = %name,
                    implementation = %implementation,
                    error = %reason,
                    "Activation outcome unknown, keeping the candidate for reconciliation"
                );
                return Err(DeployError::DeploymentFailed {
                    stage,
                    reason: format!("activation outcome unknown: {reason}"),
                    receipt: deploy_receipt,
                });
            }
            Ok(Err(err)) => {
                self.discard_candidate(&name, record, implementation);
                return Err(DeployError::from_ledger(stage, err, deploy_receipt));
            }
            Err(err) => {
                tracing::warn!(
                    module = %name,
                    implementation = %implementation,
                    "Activation unconfirmed, keeping the candidate for reconciliation"
                );
                return Err(err);
            }
        };
        attempt.advance(UpgradeStage::Activated);

        // Activated -> done
        let stage = Stage::Upgrade(UpgradeStage::Activated);
        let live = ctx
            .confirm(
                stage,
                Some(&activation),
                self.ledger.implementation_address(record.proxy_address),
            )
            .await?;
        if live != implementation {
            tracing::error!(
                module = %name,
                expected = %implementation,
                live = %live,
                "Proxy does not point to the activated implementation"
            );
            return Err(DeployError::OutOfSync {
                name,
                recorded: implementation,
                live,
            });
        }

        let upgraded =
            record.with_activated(candidate.into_history_entry(Some(activation.transaction_hash)));
        if let Err(err) = self.registry.record(&name, upgraded.clone()) {
            tracing::error!(
                module = %name,
                implementation = %implementation,
                tx_hash = %activation.transaction_hash,
                error = %err,
                "Proxy upgraded but the registry could not record it"
            );
            return Err(DeployError::from_record(stage, err, Some(activation)));
        }

        tracing::info!(
            module = %name,
            proxy = %upgraded.proxy_address,
            implementation = %implementation,
            version = %upgraded.current_version,
            tx_hash = %activation.transaction_hash,
            "Module upgraded"
        );
        Ok(upgraded)
    }

    /// Deploy the new implementation and describe it as a pending candidate.
    async fn deploy_candidate(
        &self,
        ctx: &OperationContext,
        stage: Stage,
        version: &ModuleVersion,
    ) -> Result<(PendingActivation, DeploymentReceipt), DeployError> {
        let deploy_tx = Transaction::DeployImplementation {
            bytecode: version.bytecode.clone(),
        };
        let receipt = ctx
            .confirm(stage, None, self.ledger.submit(&deploy_tx, &ctx.signer))
            .await?;
        let receipt = require_success(stage, receipt)?;
        let implementation = created_address(stage, &receipt)?;

        let candidate = PendingActivation {
            version: version.identifier.clone(),
            implementation_address: implementation,
            artifact_digest: version.digest.clone(),
            layout: version.layout.clone(),
            deployment_receipt_hash: receipt.transaction_hash,
        };
        Ok((candidate, receipt))
    }

    /// Drop the candidate after a definitive activation failure.
    fn discard_candidate(&self, name: &str, mut record: ProxyRecord, implementation: Address) {
        record.pending = None;
        match self.registry.record(name, record) {
            Ok(()) => tracing::warn!(
                module = %name,
                orphaned_implementation = %implementation,
                "Activation failed, implementation left orphaned"
            ),
            Err(err) => tracing::warn!(
                module = %name,
                orphaned_implementation = %implementation,
                error = %err,
                "Activation failed and the candidate could not be cleared"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        abi::InitCall,
        builder::{ArtifactBuilder, ImplementationBuilder, ModuleSource, tests::artifact_json},
        deployer::DeploymentCoordinator,
        ledger::{
            TxKind,
            mock::{MockFailure, MockLedger},
        },
        registry::MemoryRegistry,
        signer::Signer,
    };

    fn context() -> OperationContext {
        OperationContext::new(
            Signer::account(Address::repeat_byte(0xad)),
            Duration::from_secs(5),
        )
    }

    fn build(version: u64, bytecode: &str, fields: &[(&str, &str, u64, u64)]) -> ModuleVersion {
        ArtifactBuilder
            .build(&ModuleSource::from_json(version, artifact_json(bytecode, fields)))
            .unwrap()
    }

    fn v1() -> ModuleVersion {
        build(1, "0x6001", &[("owner", "address", 0, 0), ("fee", "uint256", 1, 0)])
    }

    fn v2_appended() -> ModuleVersion {
        build(
            2,
            "0x6002",
            &[("owner", "address", 0, 0), ("fee", "uint256", 1, 0), ("paused", "bool", 2, 0)],
        )
    }

    async fn deployed() -> (MockLedger, MemoryRegistry, ProxyRecord) {
        let ledger = MockLedger::new();
        let registry = MemoryRegistry::new();
        let record = DeploymentCoordinator::new(&ledger, &registry)
            .deploy(&context(), "market", &v1(), &InitCall::default())
            .await
            .unwrap();
        (ledger, registry, record)
    }

    #[tokio::test]
    async fn test_upgrade_appends_history() {
        let (ledger, registry, record) = deployed().await;
        let upgraded = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&context(), "market", &v2_appended())
            .await
            .unwrap();

        assert_eq!(upgraded.proxy_address, record.proxy_address);
        assert_eq!(upgraded.current_version, VersionId::Number(2));
        assert_eq!(upgraded.history.len(), 2);
        assert!(upgraded.pending.is_none());
        assert_eq!(
            ledger.proxy_implementation(record.proxy_address),
            Some(upgraded.current_implementation_address)
        );
    }

    #[tokio::test]
    async fn test_unknown_module() {
        let ledger = MockLedger::new();
        let registry = MemoryRegistry::new();
        let err = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&context(), "market", &v1())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NotDeployed { .. }));
        assert_eq!(ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_resized_field_is_rejected_before_submission() {
        let (ledger, registry, record) = deployed().await;
        let before = ledger.submission_count();

        let resized = build(2, "0x6002", &[("owner", "address", 0, 0), ("fee", "uint128", 1, 0)]);
        let err = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&context(), "market", &resized)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::StorageLayoutIncompatible { ref violations, .. } if violations.len() == 1));
        assert_eq!(ledger.submission_count(), before);
        assert_eq!(registry.lookup("market").unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_non_admin_signer_is_rejected_before_submission() {
        let (ledger, registry, _) = deployed().await;
        let before = ledger.submission_count();

        let intruder = OperationContext::new(
            Signer::account(Address::repeat_byte(0x66)),
            Duration::from_secs(5),
        );
        let err = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&intruder, "market", &v2_appended())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Unauthorized {
                stage: Stage::Upgrade(UpgradeStage::Validated),
                ..
            }
        ));
        assert_eq!(ledger.submission_count(), before);
    }

    #[tokio::test]
    async fn test_failed_deployment_changes_nothing() {
        let (ledger, registry, record) = deployed().await;
        ledger.fail_next(TxKind::DeployImplementation, MockFailure::Revert);

        let err = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&context(), "market", &v2_appended())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::DeploymentFailed {
                stage: Stage::Upgrade(UpgradeStage::Validated),
                receipt: Some(_),
                ..
            }
        ));
        assert_eq!(registry.lookup("market").unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_reverted_activation_clears_candidate() {
        let (ledger, registry, record) = deployed().await;
        ledger.fail_next(TxKind::UpgradeProxy, MockFailure::Revert);

        let err = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&context(), "market", &v2_appended())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::DeploymentFailed {
                stage: Stage::Upgrade(UpgradeStage::Deployed),
                ..
            }
        ));
        let stored = registry.lookup("market").unwrap().unwrap();
        assert!(stored.pending.is_none());
        assert_eq!(stored.history, record.history);
        assert_eq!(
            ledger.proxy_implementation(record.proxy_address),
            Some(record.current_implementation_address)
        );
    }

    #[tokio::test]
    async fn test_stalled_activation_keeps_candidate() {
        let (ledger, registry, record) = deployed().await;
        ledger.fail_next(TxKind::UpgradeProxy, MockFailure::Stall);

        let ctx = OperationContext::new(
            Signer::account(Address::repeat_byte(0xad)),
            Duration::from_millis(50),
        );
        let err = UpgradeCoordinator::new(&ledger, &registry)
            .upgrade(&ctx, "market", &v2_appended())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Unconfirmed {
                stage: Stage::Upgrade(UpgradeStage::Deployed),
                receipt: Some(_),
                ..
            }
        ));
        let stored = registry.lookup("market").unwrap().unwrap();
        assert_eq!(stored.current_version, record.current_version);
        assert_eq!(
            stored.pending.map(|p| p.version),
            Some(VersionId::Number(2))
        );
    }

    #[tokio::test]
    async fn test_same_version_is_a_no_op() {
        let (ledger, registry, _) = deployed().await;
        let coordinator = UpgradeCoordinator::new(&ledger, &registry);
        let upgraded = coordinator
            .upgrade(&context(), "market", &v2_appended())
            .await
            .unwrap();
        let submitted = ledger.submission_count();

        let again = coordinator
            .upgrade(&context(), "market", &v2_appended())
            .await
            .unwrap();
        assert_eq!(again, upgraded);
        assert_eq!(ledger.submission_count(), submitted);
    }

    #[test]
    fn test_attempt_stages() {
        let mut attempt = UpgradeAttempt::new("market", VersionId::Number(1), VersionId::Number(2));
        assert_eq!(attempt.stage(), UpgradeStage::Built);
        attempt.advance(UpgradeStage::Validated);
        attempt.fail(&DeployError::Busy {
            name: "market".into(),
        });
        assert_eq!(attempt.stage(), UpgradeStage::Failed);
    }
}
