mod cli;
mod progress;

use std::path::Path;
use std::process;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use humansize::{BINARY, format_size};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use fetchio_engine::{FetchConfig, FetchError, Protocol, RegistryClient};

use crate::cli::{Args, Commands, CommonOpts};
use crate::progress::BarProgress;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("{} {e}", "Error:".red().bold());
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(common: &CommonOpts, threads: usize, buffer_kib: usize) -> FetchConfig {
    let mut builder = FetchConfig::builder()
        .workers(threads)
        .buffer_size(buffer_kib * 1024);

    let token = common
        .token
        .clone()
        .or_else(|| std::env::var("HF_TOKEN").ok());
    if let Some(token) = token {
        builder = builder.token(token);
    }
    if let Some(protocol) = common.protocol.as_deref().and_then(Protocol::from_name) {
        builder = builder.protocol_override(Some(protocol));
    }
    if let Some(mirror) = &common.mirror {
        builder = builder.base_url(mirror.clone());
    }
    builder.build()
}

async fn run(args: Args) -> Result<(), FetchError> {
    match args.command {
        Commands::Info { model_id, common } => {
            let client = RegistryClient::new(build_config(&common, 4, 512))?;
            let listing = client.model_info(&model_id).await?;
            println!("Model: {}", listing.repository_id);
            println!("Files: {}", listing.entries.len());
            println!("Total Size: {}", format_size(listing.total_bytes(), BINARY));
            Ok(())
        }

        Commands::List {
            model_id,
            json,
            common,
        } => {
            let client = RegistryClient::new(build_config(&common, 4, 512))?;
            let listing = client.model_info(&model_id).await?;
            if json {
                println!("{}", listing.to_canonical_json());
            } else {
                println!("Model: {}", listing.repository_id);
                for entry in &listing.entries {
                    let hash = if entry.content_hash.is_empty() {
                        "-"
                    } else {
                        entry.content_hash.as_str()
                    };
                    println!(
                        "{}  {}  {}",
                        entry.path,
                        format_size(entry.size, BINARY),
                        hash
                    );
                }
            }
            Ok(())
        }

        Commands::Download {
            model_id,
            dir,
            threads,
            buffer_size,
            cache_dir,
            common,
        } => {
            let mut config = build_config(&common, threads, buffer_size);
            if let Some(cache_dir) = cache_dir {
                config.cache_dir = Some(cache_dir);
            }
            let client = RegistryClient::new(config)?;

            let listing = client.model_info(&model_id).await?;
            let bar = Arc::new(BarProgress::new(listing.total_bytes()));
            let cancel = cancel_on_ctrl_c();

            let summary = client
                .download_model(&model_id, &dir, bar.clone(), cancel)
                .await?;
            bar.finish();
            println!(
                "{} {} files ({} fetched, {} already present)",
                "Downloaded".green().bold(),
                summary.files_completed + summary.files_skipped,
                format_size(summary.bytes_downloaded, BINARY),
                summary.files_skipped,
            );
            Ok(())
        }

        Commands::File {
            model_id,
            filename,
            buffer_size,
            common,
        } => {
            let config = build_config(&common, 1, buffer_size);
            let client = RegistryClient::new(config)?;

            let listing = client.model_info(&model_id).await?;
            let size = listing
                .entries
                .iter()
                .find(|e| e.path == filename)
                .map_or(0, |e| e.size);
            let bar = Arc::new(BarProgress::new(size));
            let cancel = cancel_on_ctrl_c();

            let summary = client
                .download_file(&model_id, &filename, Path::new("."), bar.clone(), cancel)
                .await?;
            bar.finish();
            println!(
                "{} {} ({})",
                "Downloaded".green().bold(),
                filename,
                format_size(summary.bytes_downloaded, BINARY),
            );
            Ok(())
        }

        Commands::Http3Test { url, common } => {
            let client = RegistryClient::new(build_config(&common, 1, 512))?;
            let envelope = client.probe(&url).await?;
            println!(
                "Success! Protocol: {}, Status: {}, Size: {}",
                envelope.protocol,
                envelope.status,
                envelope.body.len()
            );
            if let Some(alt_svc) = &envelope.alt_svc {
                println!("Alt-Svc: {alt_svc}");
            }
            Ok(())
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, draining workers");
            token.cancel();
        }
    });
    cancel
}
