use std::path::PathBuf;

use clap::{Parser, Subcommand};
use proxyup_deploy::{NetworkPreset, VersionId};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "proxyup")]
#[command(
    author,
    version,
    about = "Deploy and upgrade modules behind permanent proxy addresses"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "PROXYUP_VERBOSITY", default_value_t = LevelFilter::INFO, global = true)]
    pub verbosity: LevelFilter,

    /// Path to a Proxyup.toml configuration file, or a directory containing one.
    ///
    /// If not provided, ./Proxyup.toml is used when present.
    #[arg(short, long, alias = "conf", env = "PROXYUP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Network preset overriding the configured endpoint, chain id and gas price.
    #[arg(short, long, global = true)]
    pub network: Option<NetworkPreset>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy a module behind a new proxy and run its initializer.
    DeployNew {
        /// Logical name of the module.
        name: String,

        /// Compiled artifact (JSON with `bytecode` and `storageLayout`).
        #[arg(long)]
        artifact: PathBuf,

        /// Version identifier: an integer or a semantic version.
        #[arg(long)]
        version: VersionId,

        /// Initializer signature, called atomically with proxy construction.
        #[arg(long, default_value = "initialize()")]
        init: String,

        /// Initializer argument. Repeat once per parameter, in order.
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Print the resulting record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Upgrade a deployed module to a new implementation.
    Upgrade {
        /// Logical name of the module.
        name: String,

        /// Compiled artifact of the new version.
        #[arg(long)]
        artifact: PathBuf,

        /// Version identifier of the new version.
        #[arg(long)]
        version: VersionId,

        /// Print the resulting record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a module's record, reconciled with the ledger.
    Status {
        /// Logical name of the module.
        name: String,

        /// Only read the local registry, without querying the ledger.
        #[arg(long)]
        offline: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write a configuration file with default values.
    InitConfig {
        /// Target file, or directory to write Proxyup.toml into.
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}
