//! Boundary to the ledger: transaction submission and proxy inspection.

use std::future::Future;

use alloy_core::primitives::{Address, Bytes};
use thiserror::Error;

use crate::{signer::Signer, types::DeploymentReceipt};

pub mod mock;
mod rpc;

pub use rpc::{IMPLEMENTATION_SLOT, JsonRpcLedger};

/// Transactions the orchestrator submits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Create a new implementation contract.
    DeployImplementation { bytecode: Bytes },
    /// Create a proxy pointing at `implementation` and run `init_data` against it
    /// in the same transaction.
    CreateProxy {
        implementation: Address,
        init_data: Bytes,
    },
    /// Repoint `proxy` to `implementation`. Admin only.
    UpgradeProxy {
        proxy: Address,
        implementation: Address,
    },
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::DeployImplementation { .. } => TxKind::DeployImplementation,
            Transaction::CreateProxy { .. } => TxKind::CreateProxy,
            Transaction::UpgradeProxy { .. } => TxKind::UpgradeProxy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TxKind {
    DeployImplementation,
    CreateProxy,
    UpgradeProxy,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The endpoint could not be reached or answered garbage.
    #[error("transport error: {0}")]
    Transport(String),
    /// The ledger refused the transaction because the sender lacks rights.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The module's one-time initializer had already run.
    #[error("initializer already executed: {0}")]
    AlreadyInitialized(String),
    /// The ledger rejected the transaction for another reason.
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// A ledger able to execute the orchestrator's transactions.
///
/// Every method may take as long as network and confirmation latency require;
/// callers bound them with a timeout.
pub trait LedgerClient: Send + Sync {
    /// Submit a transaction and wait for its receipt.
    ///
    /// A receipt with `success == false` means the transaction was mined but reverted.
    fn submit(
        &self,
        tx: &Transaction,
        signer: &Signer,
    ) -> impl Future<Output = Result<DeploymentReceipt, LedgerError>> + Send;

    /// Read the implementation address a proxy currently forwards to.
    fn implementation_address(
        &self,
        proxy: Address,
    ) -> impl Future<Output = Result<Address, LedgerError>> + Send;

    /// Account that transactions from `signer` are sent from.
    fn current_account(
        &self,
        signer: &Signer,
    ) -> impl Future<Output = Result<Address, LedgerError>> + Send;
}

/// Classify a ledger error message.
pub(crate) fn classify_error(message: &str) -> LedgerError {
    let lower = message.to_lowercase();
    if lower.contains("already initialized") {
        LedgerError::AlreadyInitialized(message.to_string())
    } else if lower.contains("not the owner")
        || lower.contains("unauthorized")
        || lower.contains("admin")
        || lower.contains("caller is not")
    {
        LedgerError::Unauthorized(message.to_string())
    } else {
        LedgerError::Rejected(message.to_string())
    }
}
