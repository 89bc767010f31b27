//! Operator entry point.
//!
//! The [`Orchestrator`] serializes operations per logical module name, first
//! with an in-process async mutex and then with the registry lease, before
//! handing over to the deployment or upgrade coordinator. Operations on
//! distinct modules share nothing but the registry and run in parallel.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use alloy_core::primitives::Address;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    abi::InitCall,
    deployer::DeploymentCoordinator,
    error::{DeployError, Stage},
    ledger::{LedgerClient, LedgerError},
    reconcile::{Reconciler, Reconciliation},
    registry::ProxyRegistry,
    signer::Signer,
    types::{DeploymentReceipt, ModuleVersion, ProxyRecord},
    upgrade::UpgradeCoordinator,
};

/// Per-operation settings, passed explicitly instead of living in global state.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Identity submitting transactions.
    pub signer: Signer,
    /// Bound on every ledger call; exceeding it yields [`DeployError::Unconfirmed`].
    pub confirmation_timeout: Duration,
}

impl OperationContext {
    pub fn new(signer: Signer, confirmation_timeout: Duration) -> Self {
        Self {
            signer,
            confirmation_timeout,
        }
    }

    /// Context for operations that only read from the ledger.
    pub fn read_only(confirmation_timeout: Duration) -> Self {
        Self::new(Signer::account(Address::ZERO), confirmation_timeout)
    }

    /// Await a ledger call under the confirmation timeout.
    ///
    /// `receipt` is the last receipt obtained by the operation, attached to the
    /// error so the operator can reconcile by hand.
    pub(crate) async fn confirm<T>(
        &self,
        stage: Stage,
        receipt: Option<&DeploymentReceipt>,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, DeployError> {
        match tokio::time::timeout(self.confirmation_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DeployError::from_ledger(stage, err, receipt.cloned())),
            Err(_) => {
                tracing::warn!(
                    stage = %stage,
                    timeout = ?self.confirmation_timeout,
                    "Ledger call did not complete in time"
                );
                Err(DeployError::Unconfirmed {
                    stage,
                    timeout: self.confirmation_timeout,
                    receipt: receipt.cloned(),
                })
            }
        }
    }
}

/// Fail with [`DeployError::DeploymentFailed`] if the transaction reverted.
pub(crate) fn require_success(
    stage: Stage,
    receipt: DeploymentReceipt,
) -> Result<DeploymentReceipt, DeployError> {
    if receipt.success {
        return Ok(receipt);
    }
    Err(DeployError::DeploymentFailed {
        stage,
        reason: format!("transaction {} reverted", receipt.transaction_hash),
        receipt: Some(receipt),
    })
}

/// Address of the contract a confirmed receipt created.
pub(crate) fn created_address(
    stage: Stage,
    receipt: &DeploymentReceipt,
) -> Result<Address, DeployError> {
    receipt
        .deployed_address
        .ok_or_else(|| DeployError::DeploymentFailed {
            stage,
            reason: format!(
                "transaction {} reported no contract address",
                receipt.transaction_hash
            ),
            receipt: Some(receipt.clone()),
        })
}

/// In-process async locks keyed by module name.
#[derive(Debug, Default)]
pub struct ModuleLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ModuleLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for exclusive access to `name`.
    pub async fn acquire(&self, name: &str) -> ModuleGuard<'_> {
        let lock = self.map().entry(name.to_string()).or_default().clone();
        ModuleGuard {
            locks: self,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

/// Exclusive access to one module name.
///
/// Dropping the last guard of a name removes its lock, so the map only holds
/// names with an operation in flight or waiting.
#[derive(Debug)]
pub struct ModuleGuard<'a> {
    locks: &'a ModuleLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ModuleGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map entry is the only remaining reference.
        drop(self.guard.take());
        let mut locks = self.locks.map();
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

/// Result of [`Orchestrator::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub record: ProxyRecord,
    /// What reconciliation did, when it was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<Reconciliation>,
}

/// Runs deployments, upgrades and status queries against one ledger and registry.
#[derive(Debug)]
pub struct Orchestrator<L, R> {
    ledger: L,
    registry: R,
    locks: ModuleLocks,
}

impl<L: LedgerClient, R: ProxyRegistry> Orchestrator<L, R> {
    pub fn new(ledger: L, registry: R) -> Self {
        Self {
            ledger,
            registry,
            locks: ModuleLocks::default(),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Deploy a module that has never been deployed under `name`.
    pub async fn deploy_new(
        &self,
        ctx: &OperationContext,
        name: &str,
        version: &ModuleVersion,
        init: &InitCall,
    ) -> Result<ProxyRecord, DeployError> {
        let _guard = self.locks.acquire(name).await;
        let _lease = self.registry.lease(name)?;

        DeploymentCoordinator::new(&self.ledger, &self.registry)
            .deploy(ctx, name, version, init)
            .await
    }

    /// Upgrade the module registered under `name` to `version`.
    pub async fn upgrade(
        &self,
        ctx: &OperationContext,
        name: &str,
        version: &ModuleVersion,
    ) -> Result<ProxyRecord, DeployError> {
        let _guard = self.locks.acquire(name).await;
        let _lease = self.registry.lease(name)?;

        UpgradeCoordinator::new(&self.ledger, &self.registry)
            .upgrade(ctx, name, version)
            .await
    }

    /// Return the record of `name`.
    ///
    /// With a context, the record is first reconciled with the proxy's live
    /// implementation and repaired if the registry fell behind the ledger.
    pub async fn status(
        &self,
        name: &str,
        reconcile: Option<&OperationContext>,
    ) -> Result<StatusReport, DeployError> {
        let Some(ctx) = reconcile else {
            let record = self
                .registry
                .lookup(name)?
                .ok_or_else(|| DeployError::NotDeployed {
                    name: name.to_string(),
                })?;
            return Ok(StatusReport {
                record,
                reconciliation: None,
            });
        };

        let _guard = self.locks.acquire(name).await;
        let _lease = self.registry.lease(name)?;

        let record = self
            .registry
            .lookup(name)?
            .ok_or_else(|| DeployError::NotDeployed {
                name: name.to_string(),
            })?;
        let (record, reconciliation) = Reconciler::new(&self.ledger, &self.registry)
            .reconcile(ctx, Stage::Status, record)
            .await?;

        Ok(StatusReport {
            record,
            reconciliation: Some(reconciliation),
        })
    }
}
