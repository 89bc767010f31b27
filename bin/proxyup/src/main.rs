//! proxyup deploys modules behind permanent proxies and upgrades them safely.

mod cli;
mod output;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use proxyup_deploy::{
    ArtifactBuilder, CONFIG_FILENAME, Config, DeployError, ErrorClass, FileRegistry,
    ImplementationBuilder, InitCall, JsonRpcLedger, LedgerError, ModuleSource, ModuleVersion, NetworkPreset,
    OperationContext, Orchestrator, VersionId,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Operation failed");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Map an error to the process exit code.
///
/// 2: rejected before anything irreversible, 3: ledger failure or timeout,
/// 4: signer is not the admin, 1: anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(ledger) = err.downcast_ref::<LedgerError>() {
        return match ledger {
            LedgerError::Unauthorized(_) => 4,
            _ => 3,
        };
    }
    match err.downcast_ref::<DeployError>().map(DeployError::class) {
        Some(ErrorClass::Validation) => 2,
        Some(ErrorClass::Transport) => 3,
        Some(ErrorClass::Unauthorized) => 4,
        Some(ErrorClass::Fatal) | None => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        config: config_file,
        network,
        command,
        ..
    } = cli;

    if let Command::InitConfig { path, force } = command {
        return init_config(network, &path, force);
    }

    let config_path = config_file
        .or_else(|| Path::new(CONFIG_FILENAME).exists().then(|| PathBuf::from(CONFIG_FILENAME)));
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(preset) = network {
        preset.apply(&mut config);
    }

    let registry = FileRegistry::open(&config.registry_path).with_context(|| {
        format!("Failed to open registry at {}", config.registry_path.display())
    })?;

    match command {
        Command::DeployNew {
            name,
            artifact,
            version,
            init,
            args,
            json,
        } => {
            let module = build_module(version, artifact)?;
            let ledger = connect(&config, JsonRpcLedger::from_config(&config)?).await?;
            let orchestrator = Orchestrator::new(ledger, registry);
            let ctx = config.operation_context()?;

            tracing::info!(
                module = %name,
                version = %module.identifier,
                endpoint = %config.network.endpoint_url,
                chain_id = config.network.chain_id,
                "Deploying new module..."
            );
            let record = orchestrator
                .deploy_new(&ctx, &name, &module, &InitCall::new(init, args))
                .await?;

            if json {
                output::print_json(&record)?;
            } else {
                output::print_record(&record);
            }
        }
        Command::Upgrade {
            name,
            artifact,
            version,
            json,
        } => {
            let module = build_module(version, artifact)?;
            let ledger = connect(&config, JsonRpcLedger::without_proxy(&config)?).await?;
            let orchestrator = Orchestrator::new(ledger, registry);
            let ctx = config.operation_context()?;

            tracing::info!(
                module = %name,
                version = %module.identifier,
                endpoint = %config.network.endpoint_url,
                chain_id = config.network.chain_id,
                "Upgrading module..."
            );
            let record = orchestrator.upgrade(&ctx, &name, &module).await?;

            if json {
                output::print_json(&record)?;
            } else {
                output::print_record(&record);
            }
        }
        Command::Status {
            name,
            offline,
            json,
        } => {
            let ledger = JsonRpcLedger::read_only(&config.network)?;
            let orchestrator = Orchestrator::new(ledger, registry);

            let ctx = OperationContext::read_only(config.confirmation_timeout());
            let report = orchestrator
                .status(&name, (!offline).then_some(&ctx))
                .await?;

            if json {
                output::print_json(&report)?;
            } else {
                output::print_status(&report);
            }
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

fn build_module(version: VersionId, artifact: PathBuf) -> Result<ModuleVersion> {
    let source = ModuleSource::from_path(version, artifact.clone());
    let module = ArtifactBuilder
        .build(&source)
        .map_err(DeployError::from)
        .with_context(|| format!("Failed to build module from {}", artifact.display()))?;
    Ok(module)
}

/// Check that `ledger` is reachable and serves the configured chain.
async fn connect(config: &Config, ledger: JsonRpcLedger) -> Result<JsonRpcLedger> {
    ledger.verify_chain_id().await.with_context(|| {
        format!("Failed to reach ledger at {}", config.network.endpoint_url)
    })?;
    Ok(ledger)
}

fn init_config(network: Option<NetworkPreset>, path: &Path, force: bool) -> Result<()> {
    let path = if path.is_dir() {
        path.join(CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    let mut config = Config::default();
    if let Some(preset) = network {
        preset.apply(&mut config);
    }
    config.save_to_file(&path)?;

    println!("Configuration written to {}", path.display());
    Ok(())
}
