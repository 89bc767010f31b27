//! Operator configuration.
//!
//! Configuration is layered with figment: built-in defaults, then the
//! `Proxyup.toml` file, then `PROXYUP_*` environment variables (nested keys are
//! separated by `__`, e.g. `PROXYUP_NETWORK__ENDPOINT_URL`).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{orchestrator::OperationContext, signer::Signer};

/// The default name for the configuration file.
pub const CONFIG_FILENAME: &str = "Proxyup.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "PROXYUP_";

/// Default time to wait for a transaction to confirm.
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 300;

/// Ledger endpoint selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint of a ledger node.
    pub endpoint_url: String,
    /// Expected chain id of the endpoint.
    pub chain_id: u64,
}

/// Known networks, usable as a shortcut for [`NetworkConfig`] and gas settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum NetworkPreset {
    Localhost,
    Avax,
    Fuji,
}

impl NetworkPreset {
    pub fn network(&self) -> NetworkConfig {
        let (endpoint_url, chain_id) = match self {
            NetworkPreset::Localhost => ("http://127.0.0.1:8545", 31337),
            NetworkPreset::Avax => ("https://api.avax.network/ext/bc/C/rpc", 43114),
            NetworkPreset::Fuji => ("https://api.avax-test.network/ext/bc/C/rpc", 43113),
        };
        NetworkConfig {
            endpoint_url: endpoint_url.to_string(),
            chain_id,
        }
    }

    pub fn gas_price(&self) -> GasPriceStrategy {
        match self {
            NetworkPreset::Avax => GasPriceStrategy::Fixed { gwei: 100 },
            NetworkPreset::Localhost | NetworkPreset::Fuji => GasPriceStrategy::Auto,
        }
    }

    /// Apply the preset's network and gas settings to `config`.
    pub fn apply(&self, config: &mut Config) {
        config.network = self.network();
        config.gas_price = self.gas_price();
    }
}

/// How the gas price of submitted transactions is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum GasPriceStrategy {
    /// Let the ledger node pick the gas price.
    #[default]
    Auto,
    /// Always use the given price.
    Fixed { gwei: u64 },
}

impl GasPriceStrategy {
    /// Gas price in wei, or `None` when the node decides.
    pub fn wei(&self) -> Option<u128> {
        match self {
            GasPriceStrategy::Auto => None,
            GasPriceStrategy::Fixed { gwei } => Some(*gwei as u128 * 1_000_000_000),
        }
    }
}

/// Identity used to submit transactions. Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Hex-encoded private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Name of an environment variable holding the private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_env: Option<String>,
    /// Account managed and unlocked by the ledger node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Address>,
}

impl SignerConfig {
    pub fn resolve(&self) -> Result<Signer> {
        match (&self.private_key, &self.private_key_env, &self.account) {
            (Some(key), None, None) => Signer::from_private_key(key),
            (None, Some(var), None) => {
                let key = std::env::var(var)
                    .with_context(|| format!("Signer environment variable {} is not set", var))?;
                Signer::from_private_key(&key)
                    .with_context(|| format!("Invalid private key in {}", var))
            }
            (None, None, Some(address)) => Ok(Signer::account(*address)),
            (None, None, None) => anyhow::bail!(
                "No signer configured: set one of signer.private_key, signer.private_key_env or signer.account"
            ),
            _ => anyhow::bail!(
                "Ambiguous signer: set only one of signer.private_key, signer.private_key_env or signer.account"
            ),
        }
    }
}

/// Complete operator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds to wait for a transaction before reporting it as unconfirmed.
    pub confirmation_timeout_secs: u64,
    /// Directory holding the proxy registry.
    pub registry_path: PathBuf,
    /// Compiled artifact of the proxy contract (ERC1967 proxy).
    pub proxy_artifact: PathBuf,
    pub network: NetworkConfig,
    #[serde(default)]
    pub gas_price: GasPriceStrategy,
    #[serde(default)]
    pub signer: SignerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: DEFAULT_CONFIRMATION_TIMEOUT_SECS,
            registry_path: PathBuf::from(".proxyup/registry"),
            proxy_artifact: PathBuf::from("artifacts/ERC1967Proxy.json"),
            network: NetworkPreset::Localhost.network(),
            gas_price: GasPriceStrategy::Auto,
            signer: SignerConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration from defaults, an optional TOML file and the environment.
    ///
    /// `path` may point to a file or to a directory containing [`CONFIG_FILENAME`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !path.exists() {
                anyhow::bail!("Configuration file or directory not found: {}", path.display());
            }
            let config_path = if path.is_dir() {
                path.join(CONFIG_FILENAME)
            } else {
                path.to_path_buf()
            };
            figment = figment.merge(Toml::file(config_path));
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;

        tracing::debug!(
            endpoint = %config.network.endpoint_url,
            chain_id = config.network.chain_id,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.network.endpoint_url).with_context(|| {
            format!("Invalid network endpoint URL: {}", self.network.endpoint_url)
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Network endpoint must use http or https, got {}", url.scheme());
        }
        if self.confirmation_timeout_secs == 0 {
            anyhow::bail!("confirmation_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Build the per-operation context (signer and timeout) from this configuration.
    pub fn operation_context(&self) -> Result<OperationContext> {
        let signer = self.signer.resolve()?;
        Ok(OperationContext::new(signer, self.confirmation_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.network.chain_id, 31337);
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new("proxyup-test").unwrap();
        let path = temp_dir.path().join(CONFIG_FILENAME);

        let mut original = Config::default();
        NetworkPreset::Avax.apply(&mut original);
        original.signer.account = Some(Address::repeat_byte(0x11));
        original.save_to_file(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.gas_price.wei(), Some(100_000_000_000));
    }

    #[test]
    fn test_load_from_directory() {
        let temp_dir = TempDir::new("proxyup-test").unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILENAME),
            r#"
confirmation_timeout_secs = 30

[network]
endpoint_url = "https://api.avax-test.network/ext/bc/C/rpc"
chain_id = 43113

[signer]
private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#,
        )
        .unwrap();

        let config = Config::load(Some(temp_dir.path())).unwrap();
        assert_eq!(config.network.chain_id, 43113);
        assert_eq!(config.confirmation_timeout_secs, 30);
        // Unset keys keep their defaults.
        assert_eq!(config.registry_path, PathBuf::from(".proxyup/registry"));
        assert!(config.operation_context().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/Proxyup.toml"))).is_err());
    }

    #[test]
    fn test_invalid_endpoint() {
        let mut config = Config::default();
        config.network.endpoint_url = "ws://localhost:8546".to_string();
        assert!(config.validate().is_err());
        config.network.endpoint_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_signer_resolution() {
        assert!(SignerConfig::default().resolve().is_err());

        let account = Address::repeat_byte(0x22);
        let signer = SignerConfig {
            account: Some(account),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(signer.address(), account);

        let ambiguous = SignerConfig {
            account: Some(account),
            private_key: Some("0x01".to_string()),
            ..Default::default()
        };
        assert!(ambiguous.resolve().is_err());
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("fuji".parse::<NetworkPreset>().unwrap(), NetworkPreset::Fuji);
        assert_eq!(NetworkPreset::Localhost.to_string(), "localhost");
        assert!("mainnet".parse::<NetworkPreset>().is_err());
    }
}
