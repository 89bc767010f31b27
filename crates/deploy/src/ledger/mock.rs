//! In-memory ledger for tests and dry runs.
//!
//! The mock keeps just enough chain state to behave like a real ledger for the
//! orchestrator: deployed implementations, proxies with their admin and
//! implementation pointer, and a record of every submitted transaction.
//! Failures can be injected per transaction kind.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_core::primitives::{Address, B256, keccak256};

use super::{LedgerClient, LedgerError, Transaction, TxKind};
use crate::{signer::Signer, types::DeploymentReceipt};

/// Failure injected into the next submission of a given kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// The transaction is mined but reverts.
    Revert,
    /// The endpoint fails before the transaction is accepted.
    Transport(String),
    /// The ledger rejects the sender.
    Unauthorized,
    /// The initializer guard fires.
    AlreadyInitialized,
    /// The transaction is accepted but never confirms.
    Stall,
}

#[derive(Debug, Clone)]
struct MockProxy {
    implementation: Address,
    admin: Address,
}

#[derive(Debug, Default)]
struct MockState {
    nonce: u64,
    block: u64,
    implementations: HashSet<Address>,
    proxies: HashMap<Address, MockProxy>,
    submissions: Vec<Transaction>,
    reads: usize,
    failures: HashMap<TxKind, VecDeque<MockFailure>>,
}

impl MockState {
    fn next_address(&mut self) -> Address {
        self.nonce += 1;
        let hash = keccak256(format!("mock-contract-{}", self.nonce));
        Address::from_slice(&hash[12..])
    }

    fn next_receipt(&mut self, deployed_address: Option<Address>, success: bool) -> DeploymentReceipt {
        self.block += 1;
        DeploymentReceipt {
            transaction_hash: keccak256(format!("mock-tx-{}", self.submissions.len())),
            block_reference: Some(self.block),
            deployed_address,
            success,
        }
    }
}

/// Shared, cloneable in-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct MockLedger {
    state: Arc<Mutex<MockState>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next submission of `kind` fail with `failure`.
    pub fn fail_next(&self, kind: TxKind, failure: MockFailure) {
        self.state()
            .failures
            .entry(kind)
            .or_default()
            .push_back(failure);
    }

    /// Every transaction submitted so far, in order.
    pub fn submissions(&self) -> Vec<Transaction> {
        self.state().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Number of read-only queries served.
    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    /// Implementation a proxy currently forwards to, without counting as a read.
    pub fn proxy_implementation(&self, proxy: Address) -> Option<Address> {
        self.state().proxies.get(&proxy).map(|p| p.implementation)
    }

    /// Change a proxy's admin, as an out-of-band admin transfer would.
    pub fn set_proxy_admin(&self, proxy: Address, admin: Address) {
        if let Some(p) = self.state().proxies.get_mut(&proxy) {
            p.admin = admin;
        }
    }

    /// Repoint a proxy directly, as an out-of-band activation would.
    pub fn force_implementation(&self, proxy: Address, implementation: Address) {
        if let Some(p) = self.state().proxies.get_mut(&proxy) {
            p.implementation = implementation;
        }
    }

    fn execute(&self, tx: &Transaction, from: Address) -> Result<DeploymentReceipt, Outcome> {
        let mut state = self.state();
        state.submissions.push(tx.clone());

        let injected = state
            .failures
            .get_mut(&tx.kind())
            .and_then(VecDeque::pop_front);
        match injected {
            Some(MockFailure::Revert) => return Ok(state.next_receipt(None, false)),
            Some(MockFailure::Transport(msg)) => return Err(Outcome::Error(LedgerError::Transport(msg))),
            Some(MockFailure::Unauthorized) => {
                return Err(Outcome::Error(LedgerError::Unauthorized(format!(
                    "{from} is not the proxy admin"
                ))));
            }
            Some(MockFailure::AlreadyInitialized) => {
                return Err(Outcome::Error(LedgerError::AlreadyInitialized(
                    "Initializable: contract is already initialized".into(),
                )));
            }
            Some(MockFailure::Stall) => return Err(Outcome::Stall),
            None => {}
        }

        match tx {
            Transaction::DeployImplementation { bytecode } => {
                if bytecode.is_empty() {
                    return Ok(state.next_receipt(None, false));
                }
                let address = state.next_address();
                state.implementations.insert(address);
                Ok(state.next_receipt(Some(address), true))
            }
            Transaction::CreateProxy { implementation, .. } => {
                if !state.implementations.contains(implementation) {
                    return Ok(state.next_receipt(None, false));
                }
                let address = state.next_address();
                state.proxies.insert(
                    address,
                    MockProxy {
                        implementation: *implementation,
                        admin: from,
                    },
                );
                Ok(state.next_receipt(Some(address), true))
            }
            Transaction::UpgradeProxy {
                proxy,
                implementation,
            } => {
                let known = state.implementations.contains(implementation);
                let Some(p) = state.proxies.get_mut(proxy) else {
                    return Err(Outcome::Error(LedgerError::Rejected(format!(
                        "{proxy} is not a proxy"
                    ))));
                };
                if p.admin != from {
                    return Err(Outcome::Error(LedgerError::Unauthorized(format!(
                        "{from} is not the proxy admin"
                    ))));
                }
                if !known {
                    return Ok(state.next_receipt(None, false));
                }
                p.implementation = *implementation;
                Ok(state.next_receipt(None, true))
            }
        }
    }
}

enum Outcome {
    Error(LedgerError),
    Stall,
}

impl LedgerClient for MockLedger {
    async fn submit(
        &self,
        tx: &Transaction,
        signer: &Signer,
    ) -> Result<DeploymentReceipt, LedgerError> {
        match self.execute(tx, signer.address()) {
            Ok(receipt) => Ok(receipt),
            Err(Outcome::Error(err)) => Err(err),
            Err(Outcome::Stall) => std::future::pending().await,
        }
    }

    async fn implementation_address(&self, proxy: Address) -> Result<Address, LedgerError> {
        let mut state = self.state();
        state.reads += 1;
        state
            .proxies
            .get(&proxy)
            .map(|p| p.implementation)
            .ok_or_else(|| LedgerError::Rejected(format!("{proxy} is not a proxy")))
    }

    async fn current_account(&self, signer: &Signer) -> Result<Address, LedgerError> {
        Ok(signer.address())
    }
}

/// Transaction hash the mock would assign to its `n`-th submission (zero based).
pub fn mock_tx_hash(n: usize) -> B256 {
    keccak256(format!("mock-tx-{}", n + 1))
}
