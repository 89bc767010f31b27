//! Durable mapping from logical module name to its proxy record.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ProxyRecord;

mod file;
mod memory;

pub use file::{FileLease, FileRegistry};
pub use memory::{MemoryLease, MemoryRegistry};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid module name `{0}`: only ASCII letters, digits, `_` and `-` are allowed")]
    InvalidName(String),

    #[error("{0}")]
    InvariantViolation(String),

    #[error("module `{0}` is locked by another operation")]
    Busy(String),

    #[error("registry I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt registry entry {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Storage of proxy records, keyed by logical module name.
///
/// Implementations must reject any write that breaks the record invariants
/// (see [`check_transition`]). A missing record is not an error: it means the
/// module still needs its first deployment.
pub trait ProxyRegistry: Send + Sync {
    /// Guard held for the duration of an operation on one module.
    type Lease: Send;

    /// Take the exclusive lease on `name`, failing with [`RegistryError::Busy`]
    /// if someone else holds it.
    fn lease(&self, name: &str) -> Result<Self::Lease, RegistryError>;

    fn lookup(&self, name: &str) -> Result<Option<ProxyRecord>, RegistryError>;

    /// Persist `record` under `name`, replacing the previous record.
    fn record(&self, name: &str, record: ProxyRecord) -> Result<(), RegistryError>;
}

/// Reject names that cannot safely be used as file names.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Check that `next` may replace `previous` as the record of `name`.
pub fn check_transition(
    name: &str,
    previous: Option<&ProxyRecord>,
    next: &ProxyRecord,
) -> Result<(), RegistryError> {
    let violation = |msg: String| Err(RegistryError::InvariantViolation(msg));

    if next.logical_name != name {
        return violation(format!(
            "record for `{}` stored under `{}`",
            next.logical_name, name
        ));
    }

    let Some(last) = next.history.last() else {
        return violation(format!("record for `{name}` has an empty history"));
    };
    if last.implementation_address != next.current_implementation_address
        || last.version != next.current_version
    {
        return violation(format!(
            "current implementation of `{name}` disagrees with its last history entry"
        ));
    }

    let Some(previous) = previous else {
        return Ok(());
    };

    if previous.proxy_address != next.proxy_address {
        return violation(format!(
            "proxy address of `{name}` cannot change from {} to {}",
            previous.proxy_address, next.proxy_address
        ));
    }
    if previous.admin_address != next.admin_address {
        return violation(format!(
            "admin address of `{name}` cannot change from {} to {}",
            previous.admin_address, next.admin_address
        ));
    }
    if !next.history.starts_with(&previous.history) {
        return violation(format!("history of `{name}` is append-only"));
    }

    Ok(())
}
