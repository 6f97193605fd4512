//! CLI entry point for the crawler tool.

use anyhow::{Context, Result, bail};
use clap::Parser;
use crawler_core::{FileConfig, Request, load_config};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => FileConfig::default(),
    };
    let config = file_config.merged_with(args.overrides());
    let loader = config.build_loader().context("invalid configuration")?;

    info!(urls = args.urls.len(), user_agent = %loader.user_agent(), "Crawler starting");

    let mut failed = 0usize;
    for raw in &args.urls {
        let request = match Request::parse_get(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(url = %raw, error = %e, "Skipping invalid URL");
                failed += 1;
                continue;
            }
        };

        match loader.load_or_fail(request).await {
            Ok(responded) => {
                let response = responded.response();
                println!(
                    "{} {} ({} bytes)",
                    response.status,
                    responded.effective_uri(),
                    response.body.len()
                );
                for hop in responded.redirects() {
                    println!("  via {hop}");
                }
            }
            Err(e) => {
                println!("ERR {raw}: {e}");
                failed += 1;
            }
        }
    }

    info!(total = args.urls.len(), failed, "Crawl complete");

    if failed > 0 {
        bail!("{failed} of {} URLs failed", args.urls.len());
    }
    Ok(())
}
