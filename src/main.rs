// src/main.rs

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    // RUST_LOG wins over the configured filter; stdout is left to command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .init();

    match cli.command {
        // =====================================================================
        // Bag Commands
        // =====================================================================
        Commands::Init { bag, id } => commands::cmd_init(&config, &bag, &id),

        Commands::Add { bag, file, dest } => {
            commands::cmd_add(&config, &bag, &file, dest.as_deref())
        }

        Commands::SetMeta {
            bag,
            component,
            record,
        } => commands::cmd_set_meta(&config, &bag, &component, &record),

        Commands::Remove { bag, component } => commands::cmd_remove(&config, &bag, &component),

        Commands::Finalize { bag } => commands::cmd_finalize(&config, &bag),

        Commands::Validate { bag, json } => {
            if !commands::cmd_validate(&bag, json)? {
                std::process::exit(1);
            }
            Ok(())
        }

        // =====================================================================
        // Service Commands
        // =====================================================================
        Commands::Preserve {
            id,
            metadata,
            data,
            transform,
            transform_args,
            archive,
            wait_secs,
        } => {
            let succeeded = commands::cmd_preserve(
                &config,
                &id,
                &metadata,
                data.as_deref(),
                transform.as_deref(),
                &transform_args,
                &archive,
                wait_secs,
            )?;
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Status { target, identifier } => {
            commands::cmd_status(&config, &target, identifier)
        }

        Commands::Recover { archive, wait_secs } => {
            commands::cmd_recover(&config, archive.as_deref(), wait_secs)
        }
    }
}
