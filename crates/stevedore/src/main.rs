use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use stevedore_core::UploadOrchestrator;

mod config;
use crate::config::Config;

#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file and print a time-limited URL for it.
    Upload {
        path: PathBuf,

        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,

        /// Object key to upload to. Defaults to the file name.
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .compact()
        .init();

    // load configuration
    let mut config_file = File::open(cli.config_file.unwrap_or("./stevedore.yml".into()))?;
    let mut s = String::new();
    config_file.read_to_string(&mut s)?;
    let config: Config = serde_yaml::from_str(&s)?;

    // initialize object storage
    let objects = config.objects.new_objects().await?;
    let orchestrator = UploadOrchestrator::new(objects, config.upload)?;

    match cli.command {
        Command::Upload {
            path,
            content_type,
            key,
        } => {
            let key = match key {
                Some(key) => key,
                None => path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("cannot derive a key from {path:?}"))?,
            };

            let size = tokio::fs::metadata(&path).await?.len();
            let max = orchestrator.settings().max_upload_size;
            if size > max {
                bail!("{path:?} is {size} bytes, larger than the {max} byte upload limit");
            }

            let source = tokio::fs::File::open(&path).await?;
            let signal = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "unable to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                tracing::info!("interrupted, aborting upload");
            };

            let location = orchestrator
                .run_with_signal(source, &key, &content_type, signal)
                .await?;
            println!("{location}");
        }
    }

    Ok(())
}
