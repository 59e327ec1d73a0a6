// src/main.rs

mod cli;

use anyhow::{Context, Result};
use apexd::{
    ApexBuilder, ApexConfig, ApexDaemon, ApexManifest, DaemonLock, Request, SigningKeyPair,
    dispatch,
};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

fn load_config(path: Option<&Path>) -> Result<ApexConfig> {
    match path {
        Some(path) => ApexConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(ApexConfig::default()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn keygen(out: &Path, key_id: Option<&str>) -> Result<()> {
    let mut keypair = SigningKeyPair::generate();
    if let Some(id) = key_id {
        keypair = keypair.with_key_id(id);
    }
    let public = PathBuf::from(format!("{}.pub", out.display()));
    keypair
        .save_to_files(out, &public)
        .with_context(|| format!("Failed to write key files to {}", out.display()))?;
    println!("Private key: {}", out.display());
    println!("Public key:  {}", public.display());
    println!("Public key (base64): {}", keypair.public_key_base64());
    Ok(())
}

fn pack(payload_dir: &Path, manifest: &Path, key: &Path, output: &Path) -> Result<()> {
    let bytes = std::fs::read(manifest)
        .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
    let manifest = ApexManifest::parse(&bytes).map_err(|e| anyhow::anyhow!("Invalid manifest: {}", e))?;
    let keypair = SigningKeyPair::load_from_file(key)
        .with_context(|| format!("Failed to load signing key {}", key.display()))?;

    let id = format!("{}@{}", manifest.name, manifest.version);
    ApexBuilder::new(manifest)
        .add_dir(payload_dir)?
        .build(&keypair, output)
        .with_context(|| format!("Failed to build {}", output.display()))?;
    println!("Built {} at {}", id, output.display());
    Ok(())
}

fn to_request(command: Commands) -> Option<Request> {
    Some(match command {
        Commands::Stage { paths } => Request::StagePackages { paths },
        Commands::Submit {
            session_id,
            children,
            rollback,
        } => Request::SubmitStagedSession {
            session_id,
            child_session_ids: children,
            is_rollback: rollback,
        },
        Commands::MarkReady { session_id } => Request::MarkStagedSessionReady { session_id },
        Commands::MarkSuccessful { session_id } => {
            Request::MarkStagedSessionSuccessful { session_id }
        }
        Commands::Abort { session_id } => Request::AbortStagedSession { session_id },
        Commands::Sessions => Request::GetSessions,
        Commands::Session { session_id } => Request::GetStagedSessionInfo { session_id },
        Commands::Active { name: None } => Request::GetActivePackages,
        Commands::Active {
            name: Some(package_name),
        } => Request::GetActivePackage { package_name },
        Commands::Activate { path } => Request::ActivatePackage { path },
        Commands::Deactivate { path } => Request::DeactivatePackage { path },
        Commands::Preinstall { paths } => Request::PreinstallPackages { paths },
        Commands::Postinstall { paths } => Request::PostinstallPackages { paths },
        Commands::Boot | Commands::Keygen { .. } | Commands::Pack { .. } => return None,
    })
}

fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Keygen { out, key_id } => {
            keygen(out, key_id.as_deref())?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Pack {
            payload_dir,
            manifest,
            key,
            output,
        } => {
            pack(payload_dir, manifest, key, output)?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;
    let _lock = DaemonLock::acquire(&config.lock_path)?;
    let daemon = ApexDaemon::open(config).context("Failed to start apexd")?;

    if cli.boot || matches!(cli.command, Commands::Boot) {
        let report = daemon.boot().context("Boot activation pass failed")?;
        info!(
            "Activated sessions {:?}, failed sessions {:?}",
            report.activated, report.failed
        );
        if matches!(cli.command, Commands::Boot) {
            print_json(&report)?;
            return Ok(ExitCode::SUCCESS);
        }
    }

    let Some(request) = to_request(cli.command) else {
        return Ok(ExitCode::SUCCESS);
    };
    let response = dispatch(&daemon, request);
    print_json(&response)?;
    Ok(if response.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}
