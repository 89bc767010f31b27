//! First-time deployment of a module behind a new proxy.

use alloy_core::primitives::{Address, Bytes};

use crate::{
    abi::InitCall,
    error::{DeployError, Stage},
    ledger::{LedgerClient, Transaction},
    orchestrator::{OperationContext, created_address, require_success},
    registry::ProxyRegistry,
    types::{DeploymentReceipt, HistoryEntry, ModuleVersion, ProxyRecord, now_secs},
};

/// Progress of a first-time deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeployStage {
    /// The name is free and the initializer encodes.
    Checked,
    /// The implementation contract exists on the ledger.
    ImplementationDeployed,
    /// The proxy exists and its initializer ran.
    ProxyCreated,
    /// The record is persisted.
    Recorded,
}

/// Creates the proxy of a module that has never been deployed.
#[derive(Debug)]
pub struct DeploymentCoordinator<'a, L, R> {
    ledger: &'a L,
    registry: &'a R,
}

impl<'a, L: LedgerClient, R: ProxyRegistry> DeploymentCoordinator<'a, L, R> {
    pub fn new(ledger: &'a L, registry: &'a R) -> Self {
        Self { ledger, registry }
    }

    /// Deploy `version` behind a new proxy and run `init` exactly once.
    ///
    /// No transaction is submitted if `name` is already registered or if `init`
    /// does not encode. Failed steps are never retried.
    pub async fn deploy(
        &self,
        ctx: &OperationContext,
        name: &str,
        version: &ModuleVersion,
        init: &InitCall,
    ) -> Result<ProxyRecord, DeployError> {
        if let Some(existing) = self.registry.lookup(name)? {
            return Err(DeployError::AlreadyDeployed {
                name: name.to_string(),
                proxy: existing.proxy_address,
            });
        }
        let init_data = init.encode()?;

        let stage = Stage::Deploy(DeployStage::Checked);
        let admin = ctx
            .confirm(stage, None, self.ledger.current_account(&ctx.signer))
            .await?;

        tracing::info!(
            module = %name,
            version = %version.identifier,
            contract = %version.name,
            admin = %admin,
            initializer = %init.signature,
            "Deploying implementation"
        );

        let deploy_tx = Transaction::DeployImplementation {
            bytecode: version.bytecode.clone(),
        };
        let receipt = ctx
            .confirm(stage, None, self.ledger.submit(&deploy_tx, &ctx.signer))
            .await?;
        let implementation_receipt = require_success(stage, receipt)?;
        let implementation = created_address(stage, &implementation_receipt)?;

        tracing::info!(
            module = %name,
            implementation = %implementation,
            tx_hash = %implementation_receipt.transaction_hash,
            stage = %DeployStage::ImplementationDeployed,
            "Implementation deployed, creating proxy"
        );

        let proxy_receipt = match self
            .create_proxy(ctx, implementation, &implementation_receipt, init_data)
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::warn!(
                    module = %name,
                    orphaned_implementation = %implementation,
                    tx_hash = %implementation_receipt.transaction_hash,
                    error = %err,
                    "Proxy creation failed, implementation left orphaned"
                );
                return Err(err);
            }
        };
        let stage = Stage::Deploy(DeployStage::ProxyCreated);
        let proxy = created_address(stage, &proxy_receipt)?;

        tracing::info!(
            module = %name,
            proxy = %proxy,
            tx_hash = %proxy_receipt.transaction_hash,
            stage = %DeployStage::ProxyCreated,
            "Proxy created and initialized"
        );

        let record = ProxyRecord::initial(
            name,
            proxy,
            admin,
            HistoryEntry {
                version: version.identifier.clone(),
                implementation_address: implementation,
                activation_receipt_hash: Some(proxy_receipt.transaction_hash),
                artifact_digest: version.digest.clone(),
                layout: version.layout.clone(),
                activated_at: now_secs(),
            },
        );

        if let Err(err) = self.registry.record(name, record.clone()) {
            tracing::error!(
                module = %name,
                proxy = %proxy,
                implementation = %implementation,
                error = %err,
                "Proxy is live but could not be recorded"
            );
            return Err(DeployError::DeploymentFailed {
                stage,
                reason: format!("proxy {proxy} is live but was not recorded: {err}"),
                receipt: Some(proxy_receipt),
            });
        }

        tracing::info!(
            module = %name,
            proxy = %proxy,
            version = %record.current_version,
            stage = %DeployStage::Recorded,
            "Module deployed"
        );
        Ok(record)
    }

    /// Submit the proxy creation. Errors carry the implementation receipt.
    async fn create_proxy(
        &self,
        ctx: &OperationContext,
        implementation: Address,
        implementation_receipt: &DeploymentReceipt,
        init_data: Bytes,
    ) -> Result<DeploymentReceipt, DeployError> {
        let stage = Stage::Deploy(DeployStage::ImplementationDeployed);
        let tx = Transaction::CreateProxy {
            implementation,
            init_data,
        };

        let receipt = ctx
            .confirm(
                stage,
                Some(implementation_receipt),
                self.ledger.submit(&tx, &ctx.signer),
            )
            .await?;

        if !receipt.success {
            return Err(DeployError::DeploymentFailed {
                stage,
                reason: format!("proxy creation {} reverted", receipt.transaction_hash),
                receipt: Some(implementation_receipt.clone()),
            });
        }
        if receipt.deployed_address.is_none() {
            return Err(DeployError::DeploymentFailed {
                stage,
                reason: format!(
                    "proxy creation {} reported no contract address",
                    receipt.transaction_hash
                ),
                receipt: Some(implementation_receipt.clone()),
            });
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        builder::{ArtifactBuilder, ImplementationBuilder, ModuleSource, tests::artifact_json},
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

    fn module_v1() -> ModuleVersion {
        let json = artifact_json("0x6080", &[("owner", "address", 0, 0)]);
        ArtifactBuilder
            .build(&ModuleSource::from_json(1u64, json))
            .unwrap()
    }

    #[tokio::test]
    async fn test_deploy_records_proxy() {
        let ledger = MockLedger::new();
        let registry = MemoryRegistry::new();
        let coordinator = DeploymentCoordinator::new(&ledger, &registry);

        let record = coordinator
            .deploy(&context(), "market", &module_v1(), &InitCall::default())
            .await
            .unwrap();

        assert_eq!(record.admin_address, Address::repeat_byte(0xad));
        assert_eq!(record.history.len(), 1);
        assert_eq!(
            ledger.proxy_implementation(record.proxy_address),
            Some(record.current_implementation_address)
        );
        assert_eq!(registry.lookup("market").unwrap(), Some(record));

        let kinds: Vec<_> = ledger.submissions().iter().map(Transaction::kind).collect();
        assert_eq!(kinds, vec![TxKind::DeployImplementation, TxKind::CreateProxy]);
    }

    #[tokio::test]
    async fn test_bad_initializer_submits_nothing() {
        let ledger = MockLedger::new();
        let registry = MemoryRegistry::new();
        let coordinator = DeploymentCoordinator::new(&ledger, &registry);

        let init = InitCall::new("initialize(address)", ["not-an-address"]);
        let err = coordinator
            .deploy(&context(), "market", &module_v1(), &init)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::InvalidInitArgs(_)));
        assert_eq!(ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_reinitialization_is_a_hard_failure() {
        let ledger = MockLedger::new();
        let registry = MemoryRegistry::new();
        ledger.fail_next(TxKind::CreateProxy, MockFailure::AlreadyInitialized);

        let err = DeploymentCoordinator::new(&ledger, &registry)
            .deploy(&context(), "market", &module_v1(), &InitCall::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::DeploymentFailed { ref reason, .. } if reason.contains("initializer")
        ));
        // No retry of the proxy creation.
        assert_eq!(ledger.submission_count(), 2);
        assert!(registry.lookup("market").unwrap().is_none());
    }
}
