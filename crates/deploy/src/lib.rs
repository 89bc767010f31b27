//! proxyup-deploy - Deployment and upgrade orchestration for proxy-backed modules.
//!
//! A module is published once behind a permanent ERC1967 proxy and later
//! upgraded by repointing that proxy to new implementations. This crate checks
//! storage-layout compatibility between versions, drives the deploy and upgrade
//! state machines against a [`LedgerClient`], and keeps an append-only history
//! of every activation in a [`ProxyRegistry`].

pub mod abi;
pub mod builder;
pub mod config;
mod deployer;
mod error;
pub mod layout;
pub mod ledger;
mod orchestrator;
mod reconcile;
pub mod registry;
mod signer;
mod types;
mod upgrade;

pub use abi::{AbiError, InitCall};
pub use builder::{ArtifactBuilder, ArtifactSource, BuildError, ImplementationBuilder, ModuleSource};
pub use config::{
    CONFIG_FILENAME, Config, GasPriceStrategy, NetworkConfig, NetworkPreset, SignerConfig,
};
pub use deployer::{DeployStage, DeploymentCoordinator};
pub use error::{DeployError, ErrorClass, Stage};
pub use layout::{LayoutViolation, StorageField, StorageLayout, check_compatibility};
pub use ledger::{JsonRpcLedger, LedgerClient, LedgerError, Transaction, TxKind};
pub use orchestrator::{ModuleGuard, ModuleLocks, OperationContext, Orchestrator, StatusReport};
pub use reconcile::{Reconciler, Reconciliation};
pub use registry::{FileRegistry, MemoryRegistry, ProxyRegistry, RegistryError};
pub use signer::Signer;
pub use types::{
    DeploymentReceipt, HistoryEntry, ModuleVersion, PendingActivation, ProxyRecord, VersionId,
};
pub use upgrade::{UpgradeAttempt, UpgradeCoordinator, UpgradeStage};
