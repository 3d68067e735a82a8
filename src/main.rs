use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use page_mirror::{AssetStatus, MirrorCommand, MirrorReport, MirrorSession};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("page_mirror=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = MirrorCommand::parse();
    let config = args.into_config();

    let html = match &args.html {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read HTML snapshot {:?}", path))?,
        ),
        None => None,
    };
    let seeds = match &args.resources {
        Some(path) => read_seed_list(path)?,
        None => Vec::new(),
    };

    println!("🚀 Mirroring: {}", args.url.blue());
    println!("📁 Output directory: {:?}", config.output_dir);
    if !seeds.is_empty() {
        println!("🌱 Extra resources: {}", seeds.len());
    }

    let session = MirrorSession::new(config).context("Failed to set up mirror session")?;

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}")?);
    progress_bar.enable_steady_tick(Duration::from_millis(120));
    progress_bar.set_message(format!("Mirroring {}", args.url));

    let result = match &html {
        Some(html) => session.mirror_document(html, &args.url, &seeds).await,
        None => session.mirror_url(&args.url, &seeds).await,
    };
    progress_bar.finish_and_clear();

    let report = result.with_context(|| format!("Failed to mirror {}", args.url))?;
    print_summary(&report);

    Ok(())
}

fn read_seed_list(path: &std::path::Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read resource list {:?}", path))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

fn print_summary(report: &MirrorReport) {
    for record in report.assets.iter().filter(|r| r.status == AssetStatus::Failed) {
        eprintln!(
            "⚠️  {} {}",
            record.url.yellow(),
            record.error.as_deref().unwrap_or("failed").dimmed()
        );
    }

    println!("💾 Saved page to: {:?}", report.document_path);
    println!(
        "📊 {} fetched, {} failed, {} left as-is",
        report.fetched.to_string().green(),
        report.failed.to_string().red(),
        report.skipped
    );
    if let Some(error) = &report.manifest_error {
        println!("{} {}", "⚠️  Manifest not written:".yellow(), error.dimmed());
    }

    if report.cancelled {
        println!("{}", "⏹️  Run stopped early; the mirror is partial.".yellow());
    } else if report.is_complete() {
        println!("{}", "✅ Page mirrored successfully!".green().bold());
    } else {
        println!("{}", "⚠️  Page mirrored with missing assets.".yellow().bold());
    }
}
