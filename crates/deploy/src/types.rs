//! Records shared by the builder, the coordinators and the registry.

use std::{fmt, str::FromStr};

use alloy_core::primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};

use crate::layout::StorageLayout;

/// Identifier of a module version: a monotonic integer or a semantic version string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionId {
    Number(u64),
    Semantic(String),
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionId::Number(n) => write!(f, "{n}"),
            VersionId::Semantic(s) => f.write_str(s),
        }
    }
}

impl FromStr for VersionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u64>() {
            Ok(n) => VersionId::Number(n),
            Err(_) => VersionId::Semantic(s.to_string()),
        })
    }
}

impl From<u64> for VersionId {
    fn from(n: u64) -> Self {
        VersionId::Number(n)
    }
}

impl From<&str> for VersionId {
    fn from(s: &str) -> Self {
        // Infallible.
        s.parse().unwrap_or_else(|e| match e {})
    }
}

/// A built, deployable version of a module. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleVersion {
    /// Contract name from the artifact.
    pub name: String,
    pub identifier: VersionId,
    /// Creation code submitted to the ledger.
    pub bytecode: Bytes,
    pub layout: StorageLayout,
    /// SHA-256 over the bytecode and the canonical layout, hex encoded.
    pub digest: String,
}

/// Outcome of one on-chain operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReceipt {
    pub transaction_hash: B256,
    /// Block number the transaction was included in, if known.
    pub block_reference: Option<u64>,
    /// Contract created by the transaction, if any.
    pub deployed_address: Option<Address>,
    pub success: bool,
}

/// One activated implementation in a module's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: VersionId,
    pub implementation_address: Address,
    /// Hash of the transaction that made this implementation live.
    ///
    /// `None` when the entry was repaired by reconciliation and the activating
    /// transaction was never observed by this process.
    pub activation_receipt_hash: Option<B256>,
    pub artifact_digest: String,
    pub layout: StorageLayout,
    /// Unix timestamp (seconds) at which the entry was recorded.
    pub activated_at: i64,
}

/// An implementation that has been deployed but whose activation has not been
/// observed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingActivation {
    pub version: VersionId,
    pub implementation_address: Address,
    pub artifact_digest: String,
    pub layout: StorageLayout,
    pub deployment_receipt_hash: B256,
}

impl PendingActivation {
    pub fn into_history_entry(self, activation_receipt_hash: Option<B256>) -> HistoryEntry {
        HistoryEntry {
            version: self.version,
            implementation_address: self.implementation_address,
            activation_receipt_hash,
            artifact_digest: self.artifact_digest,
            layout: self.layout,
            activated_at: now_secs(),
        }
    }
}

/// Durable record of a deployed module.
///
/// `proxy_address` and `admin_address` never change after the first write, and
/// `history` is append-only. The last history entry always describes the
/// current implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub logical_name: String,
    pub proxy_address: Address,
    pub admin_address: Address,
    pub current_implementation_address: Address,
    pub current_version: VersionId,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingActivation>,
}

impl ProxyRecord {
    /// Build the record of a freshly deployed module.
    pub fn initial(
        logical_name: impl Into<String>,
        proxy_address: Address,
        admin_address: Address,
        entry: HistoryEntry,
    ) -> Self {
        Self {
            logical_name: logical_name.into(),
            proxy_address,
            admin_address,
            current_implementation_address: entry.implementation_address,
            current_version: entry.version.clone(),
            history: vec![entry],
            pending: None,
        }
    }

    /// The entry describing the implementation currently behind the proxy.
    pub fn current_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Return a copy with `entry` appended and made current.
    pub fn with_activated(&self, entry: HistoryEntry) -> Self {
        let mut next = self.clone();
        next.current_implementation_address = entry.implementation_address;
        next.current_version = entry.version.clone();
        next.history.push(entry);
        next.pending = None;
        next
    }
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
