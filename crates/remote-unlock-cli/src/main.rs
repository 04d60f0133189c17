//! Local operator tooling for remote-unlock hosts: inspect volumes, unlock
//! from the console, resume the boot, and check configuration files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use remote_unlock_core::{
    config::DEFAULT_CONFIG_PATH, count_locked, logging, unlock::apply_password,
    RemoteUnlockConfig, VolumeProvider, VolumeSet,
};
use remote_unlock_zfs::SystemZfsProvider;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "remote-unlock",
    version,
    about = "Operator tools for hosts waiting on encrypted ZFS volumes."
)]
struct Cli {
    /// Path to the remote-unlock configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List encryption roots and whether their keys are loaded.
    Status,

    /// Prompt for one password and try it on every locked volume.
    Unlock {
        /// Resume the boot when no locked volume remains afterwards.
        #[arg(long)]
        resume_boot: bool,
    },

    /// Kill the boot-time passphrase prompts so the boot carries on.
    ResumeBoot {
        /// Resume even if some volumes are still locked.
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let provider = provider(&cli.config)?;
            let volumes = provider.list_volumes()?;
            print_volume_table(&volumes);
        }
        Commands::Unlock { resume_boot } => {
            let provider = provider(&cli.config)?;
            let before = provider.list_volumes()?;
            if count_locked(&before) == 0 {
                println!("All volumes are unlocked.");
            } else {
                let password = Zeroizing::new(prompt_password("Password: ")?);
                if password.is_empty() {
                    bail!("no password entered");
                }
                let unlocked = apply_password(&provider, &password)?;
                if unlocked == 0 {
                    bail!("invalid password");
                }
                println!("Unlocked {unlocked} volume(s).");
            }

            let remaining = count_locked(&provider.list_volumes()?);
            if remaining > 0 {
                println!("{remaining} volume(s) still locked.");
            } else if resume_boot {
                provider.resume_boot()?;
                println!("Boot resumed.");
            }
        }
        Commands::ResumeBoot { force } => {
            let provider = provider(&cli.config)?;
            let remaining = count_locked(&provider.list_volumes()?);
            if remaining > 0 {
                if !force {
                    bail!("{remaining} volume(s) still locked; pass --force to resume anyway");
                }
                warn!("resuming boot with {remaining} locked volume(s)");
            }
            provider.resume_boot()?;
            println!("Boot resumed.");
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(RemoteUnlockConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let cfg = RemoteUnlockConfig::load(&file)
                .with_context(|| format!("failed to load configuration from {}", file.display()))?;
            println!(
                "Configuration valid (listen {}, {} host key(s), {}).",
                cfg.server.listen,
                cfg.server.host_keys.len(),
                if cfg.server.authorized_keys.is_some() {
                    "public key auth"
                } else {
                    "no client auth"
                }
            );
        }
    }

    Ok(())
}

/// Load the config and build the ZFS provider it describes.
fn provider(config_path: &Path) -> Result<SystemZfsProvider> {
    let config = RemoteUnlockConfig::load(config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path.display()
        )
    })?;
    let provider = SystemZfsProvider::from_config(&config)?;
    provider.probe().context("zfs is not usable")?;
    Ok(provider)
}

fn print_volume_table(volumes: &VolumeSet) {
    if volumes.is_empty() {
        println!("No encrypted volumes found.");
        return;
    }
    println!("{:<40} STATUS", "VOLUME");
    for (name, state) in volumes {
        let status = if state.is_locked() { "locked" } else { "unlocked" };
        println!("{name:<40} {status}");
    }
}
