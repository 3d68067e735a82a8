use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// How the assets subtree is laid out under the output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AssetLayout {
    /// Every asset in a single folder with deduplicated filenames.
    #[default]
    Flat,
    /// Remote path structure kept, grouped under one folder per origin.
    Mirrored,
}

/// Retry behavior for transient fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub output_dir: PathBuf,
    pub layout: AssetLayout,
    /// Folder, relative to `output_dir`, that holds every asset.
    pub assets_dir: String,
    /// File name of the rewritten root document.
    pub document_name: String,
    pub max_concurrent: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub user_agent: String,
    /// Upper bound on the whole run; when it elapses in-flight fetches are
    /// dropped and whatever completed is written out.
    pub run_timeout: Option<Duration>,
    pub write_manifest: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./mirrored_page"),
            layout: AssetLayout::Flat,
            assets_dir: "assets".to_string(),
            document_name: "index.html".to_string(),
            max_concurrent: 8,
            timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            run_timeout: None,
            write_manifest: true,
        }
    }
}

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0";

pub const MANIFEST_FILE: &str = "manifest.json";

impl MirrorConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(MirrorError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(MirrorError::Config("timeout must be non-zero".to_string()));
        }
        if !is_plain_relative(&self.assets_dir) {
            return Err(MirrorError::Config(format!(
                "assets_dir {:?} must be a relative path without '..'",
                self.assets_dir
            )));
        }
        if self.document_name.is_empty()
            || self.document_name.contains('/')
            || self.document_name.contains('\\')
            || self.document_name == MANIFEST_FILE
        {
            return Err(MirrorError::Config(format!(
                "document_name {:?} must be a plain file name",
                self.document_name
            )));
        }
        Ok(())
    }
}

fn is_plain_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MirrorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = MirrorConfig::new("/tmp/out");
        config.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::new("/tmp/out");
        config.assets_dir = "../escape".to_string();
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::new("/tmp/out");
        config.document_name = "nested/index.html".to_string();
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::new("/tmp/out");
        config.assets_dir = "static/assets".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }
}
