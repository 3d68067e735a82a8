use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{AssetLayout, MirrorConfig, RetryPolicy, DEFAULT_USER_AGENT};

#[derive(Parser, Debug)]
#[command(
    name = "page-mirror",
    about = "Save a single web page with everything it needs to render offline",
    version,
    long_about = "Downloads one page together with its stylesheets, scripts, images and fonts, rewrites every reference to point at the local copies and links to other pages back to the live site."
)]
pub struct MirrorCommand {
    /// The URL of the page to mirror
    #[arg(required = true)]
    pub url: String,

    /// Output directory for the mirrored page
    #[arg(short, long, default_value = "./mirrored_page")]
    pub output_dir: PathBuf,

    /// Use this saved markup (e.g. a rendered DOM snapshot) instead of fetching the page;
    /// references still resolve against URL
    #[arg(long, value_name = "FILE")]
    pub html: Option<PathBuf>,

    /// File with extra resource URLs to mirror, one per line (e.g. exported from a network log)
    #[arg(long, value_name = "FILE")]
    pub resources: Option<PathBuf>,

    /// How assets are laid out on disk
    #[arg(long, value_enum, default_value_t = AssetLayout::Flat)]
    pub layout: AssetLayout,

    /// Folder inside the output directory that receives the assets
    #[arg(long, default_value = "assets")]
    pub assets_dir: String,

    /// Maximum concurrent downloads
    #[arg(short = 'c', long, default_value = "8", value_parser = parse_positive)]
    pub max_concurrent: usize,

    /// Timeout for each request in seconds
    #[arg(long, default_value = "20", value_parser = parse_positive_u64)]
    pub timeout: u64,

    /// Retries for failed requests (network errors, 5xx, 408, 429)
    #[arg(long, default_value = "2")]
    pub retries: u32,

    /// Stop after this many seconds and write whatever was fetched
    #[arg(long, value_name = "SECONDS", value_parser = parse_positive_u64)]
    pub run_timeout: Option<u64>,

    /// User agent string to use for requests
    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Do not write manifest.json
    #[arg(long)]
    pub no_manifest: bool,
}

fn parse_positive(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    parse_positive(value).map(|n| n as u64)
}

impl MirrorCommand {
    pub fn into_config(&self) -> MirrorConfig {
        MirrorConfig {
            output_dir: self.output_dir.clone(),
            layout: self.layout,
            assets_dir: self.assets_dir.clone(),
            max_concurrent: self.max_concurrent,
            timeout: Duration::from_secs(self.timeout),
            retry: RetryPolicy {
                max_retries: self.retries,
                ..RetryPolicy::default()
            },
            user_agent: self.user_agent.clone(),
            run_timeout: self.run_timeout.map(Duration::from_secs),
            write_manifest: !self.no_manifest,
            ..MirrorConfig::default()
        }
    }
}
