use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info, info_span, Instrument};
use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use commands::Lookup;
use config::CacheConfig;

mod commands;
mod config;
mod static_site;
mod tracing;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Generate a static binary cache site from the local narinfo store")]
    Export {
        #[arg(short, long, help = "Output directory, overrides export.output_dir")]
        output: Option<PathBuf>,
    },
    #[command(about = "Store a NAR and its narinfo in the configured backend")]
    Push {
        #[arg(long, help = "Store path hash the narinfo is keyed by")]
        hash: String,
        #[arg(long, help = "Path to the narinfo file")]
        narinfo: PathBuf,
        #[arg(long, help = "Path to the NAR file")]
        nar: Option<PathBuf>,
        #[arg(
            long,
            requires = "nar",
            help = "Filename to store the NAR under, defaults to the file name"
        )]
        nar_name: Option<String>,
    },
    #[command(about = "Download a NAR from the configured backend")]
    Fetch {
        #[arg(long)]
        nar_name: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    #[command(about = "Check whether the cache holds a narinfo or a NAR")]
    Has(HasArgs),
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct HasArgs {
    #[arg(long)]
    hash: Option<String>,
    #[arg(long)]
    nar_name: Option<String>,
}

async fn run(config: CacheConfig, command: Command) -> Result<ExitCode> {
    match command {
        Command::Export { output } => {
            let summary = commands::export(&config, output).await?;
            println!(
                "exported {} narinfo files to {} (nar base url {})",
                summary.narinfo_count,
                summary.output_dir.display(),
                summary.nar_base_url
            );
        }
        Command::Push {
            hash,
            narinfo,
            nar,
            nar_name,
        } => {
            let nar_name = match (&nar, nar_name) {
                (_, Some(name)) => Some(name),
                (Some(nar), None) => Some(
                    nar.file_name()
                        .and_then(|name| name.to_str())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            anyhow!("unable to derive a NAR filename from {}", nar.display())
                        })?,
                ),
                (None, None) => None,
            };
            let storage = cache_store::create_storage(&config.storage)?;
            let nar_upload = nar.as_deref().zip(nar_name.as_deref());
            let url = commands::push(storage.as_ref(), &hash, &narinfo, nar_upload).await?;
            if let Some(url) = url {
                println!("{}", url);
            }
        }
        Command::Fetch { nar_name, output } => {
            let storage = cache_store::create_storage(&config.storage)?;
            if !commands::fetch(storage.as_ref(), &nar_name, &output).await? {
                bail!("nar {} not found", nar_name);
            }
        }
        Command::Has(args) => {
            let lookup = match (args.hash, args.nar_name) {
                (Some(hash), _) => Lookup::Narinfo(hash),
                (None, Some(nar_name)) => Lookup::Nar(nar_name),
                (None, None) => bail!("either --hash or --nar-name is required"),
            };
            let storage = cache_store::create_storage(&config.storage)?;
            let found = commands::has(storage.as_ref(), &lookup).await?;
            println!("{}", found);
            if !found {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = CacheConfig::load(cli.config.as_deref())?;

    let telemetry = setup_tracing(&config).inspect_err(|e| {
        error!("Error setting up tracing: {:?}", e);
    })?;

    let root_span = info_span!("opencache", backend = config.storage.backend_name());
    let result = run(config, cli.command).instrument(root_span).await;
    if let Err(err) = &result {
        error!("command failed: {:?}", err);
    } else {
        info!("command finished");
    }

    // export traces before shutdown
    telemetry.shutdown();
    result
}
