//! Repair of the registry from the proxy's live implementation.
//!
//! The registry is only updated after the ledger confirms an activation, so a
//! crash between the two leaves the registry one step behind the ledger. The
//! reconciler reads the EIP-1967 implementation slot and brings the record
//! back in line when the live address can be attributed to a known version.

use serde::Serialize;

use crate::{
    error::{DeployError, Stage},
    ledger::LedgerClient,
    orchestrator::OperationContext,
    registry::ProxyRegistry,
    types::{HistoryEntry, ProxyRecord, VersionId, now_secs},
};

/// What reconciliation changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Reconciliation {
    /// The registry already matched the ledger.
    Unchanged,
    /// A deployed candidate turned out to be active and was recorded.
    PromotedPending { version: VersionId },
    /// The proxy was moved back to an earlier version outside this tool.
    RestoredPrevious { version: VersionId },
}

#[derive(Debug)]
pub struct Reconciler<'a, L, R> {
    ledger: &'a L,
    registry: &'a R,
}

impl<'a, L: LedgerClient, R: ProxyRegistry> Reconciler<'a, L, R> {
    pub fn new(ledger: &'a L, registry: &'a R) -> Self {
        Self { ledger, registry }
    }

    /// Compare `record` with the ledger and persist any repair.
    ///
    /// Fails with [`DeployError::OutOfSync`] when the live implementation is
    /// unknown to the record.
    pub async fn reconcile(
        &self,
        ctx: &OperationContext,
        stage: Stage,
        record: ProxyRecord,
    ) -> Result<(ProxyRecord, Reconciliation), DeployError> {
        let name = record.logical_name.clone();
        let live = ctx
            .confirm(
                stage,
                None,
                self.ledger.implementation_address(record.proxy_address),
            )
            .await?;

        if live == record.current_implementation_address {
            tracing::debug!(module = %name, implementation = %live, "Registry matches ledger");
            return Ok((record, Reconciliation::Unchanged));
        }

        if let Some(pending) = record
            .pending
            .clone()
            .filter(|pending| pending.implementation_address == live)
        {
            let version = pending.version.clone();
            let repaired = record.with_activated(pending.into_history_entry(None));
            self.registry
                .record(&name, repaired.clone())
                .map_err(|err| DeployError::from_record(stage, err, None))?;

            tracing::warn!(
                module = %name,
                implementation = %live,
                version = %version,
                "Registry was behind the ledger, recorded pending activation"
            );
            return Ok((repaired, Reconciliation::PromotedPending { version }));
        }

        if let Some(previous) = record
            .history
            .iter()
            .rev()
            .find(|entry| entry.implementation_address == live)
            .cloned()
        {
            let version = previous.version.clone();
            let repaired = record.with_activated(HistoryEntry {
                activation_receipt_hash: None,
                activated_at: now_secs(),
                ..previous
            });
            self.registry
                .record(&name, repaired.clone())
                .map_err(|err| DeployError::from_record(stage, err, None))?;

            tracing::warn!(
                module = %name,
                implementation = %live,
                version = %version,
                "Proxy was moved back to an earlier version, recorded it as current"
            );
            return Ok((repaired, Reconciliation::RestoredPrevious { version }));
        }

        tracing::error!(
            module = %name,
            recorded = %record.current_implementation_address,
            live = %live,
            "Proxy points to an implementation unknown to the registry"
        );
        Err(DeployError::OutOfSync {
            name,
            recorded: record.current_implementation_address,
            live,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_core::primitives::{Address, B256, Bytes};

    use super::*;
    use crate::{
        abi::InitCall,
        deployer::DeploymentCoordinator,
        layout::StorageLayout,
        ledger::{Transaction, mock::MockLedger},
        registry::{MemoryRegistry, RegistryError},
        signer::Signer,
        types::{ModuleVersion, PendingActivation},
    };

    fn context() -> OperationContext {
        OperationContext::new(
            Signer::account(Address::repeat_byte(0xad)),
            Duration::from_secs(5),
        )
    }

    fn version(n: u64) -> ModuleVersion {
        ModuleVersion {
            name: "Market".to_string(),
            identifier: VersionId::Number(n),
            bytecode: Bytes::from(vec![0x60, n as u8]),
            layout: StorageLayout::default(),
            digest: format!("digest-{n}"),
        }
    }

    /// Deploy v1 and return the ledger, registry and record.
    async fn deployed() -> (MockLedger, MemoryRegistry, ProxyRecord) {
        let ledger = MockLedger::new();
        let registry = MemoryRegistry::new();
        let record = DeploymentCoordinator::new(&ledger, &registry)
            .deploy(&context(), "market", &version(1), &InitCall::default())
            .await
            .unwrap();
        (ledger, registry, record)
    }

    /// Deploy an implementation directly on the mock, outside any coordinator.
    async fn raw_implementation(ledger: &MockLedger, n: u8) -> Address {
        let tx = Transaction::DeployImplementation {
            bytecode: Bytes::from(vec![0x60, n]),
        };
        ledger
            .submit(&tx, &context().signer)
            .await
            .unwrap()
            .deployed_address
            .unwrap()
    }

    #[tokio::test]
    async fn test_unchanged() {
        let (ledger, registry, record) = deployed().await;
        let (after, outcome) = Reconciler::new(&ledger, &registry)
            .reconcile(&context(), Stage::Status, record.clone())
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::Unchanged);
        assert_eq!(after, record);
    }

    #[tokio::test]
    async fn test_promotes_pending_candidate() {
        let (ledger, registry, mut record) = deployed().await;
        let implementation = raw_implementation(&ledger, 2).await;
        record.pending = Some(PendingActivation {
            version: VersionId::Number(2),
            implementation_address: implementation,
            artifact_digest: "digest-2".to_string(),
            layout: StorageLayout::default(),
            deployment_receipt_hash: B256::repeat_byte(0x02),
        });
        registry.record("market", record.clone()).unwrap();
        ledger.force_implementation(record.proxy_address, implementation);

        let (after, outcome) = Reconciler::new(&ledger, &registry)
            .reconcile(&context(), Stage::Status, record)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Reconciliation::PromotedPending {
                version: VersionId::Number(2)
            }
        );
        assert_eq!(after.current_implementation_address, implementation);
        assert_eq!(after.history.len(), 2);
        assert!(after.pending.is_none());
        assert_eq!(after.history[1].activation_receipt_hash, None);
        assert_eq!(registry.lookup("market").unwrap(), Some(after));
    }

    #[tokio::test]
    async fn test_restores_previous_version() {
        let (ledger, registry, record) = deployed().await;
        let v1 = record.current_implementation_address;
        let v2 = raw_implementation(&ledger, 2).await;

        let upgraded = record.with_activated(HistoryEntry {
            version: VersionId::Number(2),
            implementation_address: v2,
            activation_receipt_hash: Some(B256::repeat_byte(0x02)),
            artifact_digest: "digest-2".to_string(),
            layout: StorageLayout::default(),
            activated_at: now_secs(),
        });
        registry.record("market", upgraded.clone()).unwrap();
        // Someone repoints the proxy back to v1 by hand.
        ledger.force_implementation(record.proxy_address, v1);

        let (after, outcome) = Reconciler::new(&ledger, &registry)
            .reconcile(&context(), Stage::Status, upgraded)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Reconciliation::RestoredPrevious {
                version: VersionId::Number(1)
            }
        );
        assert_eq!(after.current_implementation_address, v1);
        assert_eq!(after.current_version, VersionId::Number(1));
        assert_eq!(after.history.len(), 3);
    }

    /// Registry that serves reads but refuses every write.
    struct FrozenRegistry(MemoryRegistry);

    impl ProxyRegistry for FrozenRegistry {
        type Lease = <MemoryRegistry as ProxyRegistry>::Lease;

        fn lease(&self, name: &str) -> Result<Self::Lease, RegistryError> {
            self.0.lease(name)
        }

        fn lookup(&self, name: &str) -> Result<Option<ProxyRecord>, RegistryError> {
            self.0.lookup(name)
        }

        fn record(&self, name: &str, _: ProxyRecord) -> Result<(), RegistryError> {
            Err(RegistryError::Busy(name.to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_repair_write_keeps_stage() {
        let (ledger, registry, record) = deployed().await;
        let v1 = record.current_implementation_address;
        let v2 = raw_implementation(&ledger, 2).await;
        let upgraded = record.with_activated(HistoryEntry {
            version: VersionId::Number(2),
            implementation_address: v2,
            activation_receipt_hash: Some(B256::repeat_byte(0x02)),
            artifact_digest: "digest-2".to_string(),
            layout: StorageLayout::default(),
            activated_at: now_secs(),
        });
        ledger.force_implementation(record.proxy_address, v1);

        let frozen = FrozenRegistry(registry);
        let err = Reconciler::new(&ledger, &frozen)
            .reconcile(&context(), Stage::Status, upgraded)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::RecordFailed { .. }));
        assert_eq!(err.stage(), Some(Stage::Status));
    }

    #[tokio::test]
    async fn test_unknown_implementation_is_out_of_sync() {
        let (ledger, registry, record) = deployed().await;
        let stranger = raw_implementation(&ledger, 9).await;
        ledger.force_implementation(record.proxy_address, stranger);

        let err = Reconciler::new(&ledger, &registry)
            .reconcile(&context(), Stage::Status, record.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::OutOfSync { live, .. } if live == stranger));
        // Nothing was written.
        assert_eq!(registry.lookup("market").unwrap(), Some(record));
    }
}
