//! One mirror operation from document to output tree.
//!
//! The session discovers references in the root document, resolves them
//! level by level (document references, then references found in the
//! stylesheets fetched on the previous level), persists every asset, rewrites
//! stylesheets and the document to point at the local copies and writes the
//! manifest. Fetches within a level run concurrently; names are allocated
//! after each level settles, in discovery order, so the same input always
//! produces the same tree.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{MirrorConfig, MANIFEST_FILE};
use crate::css::{self, CssReferenceKind};
use crate::downloader::AssetFetcher;
use crate::error::{MirrorError, Result};
use crate::file_manager::FileManager;
use crate::html_parser::{HtmlParser, ResourceType};
use crate::manifest::{Asset, AssetRecord, AssetStatus, Manifest};
use crate::naming::{self, NameAllocator};
use crate::resolver::{self, Reference};

/// Stops a running session from another task.
///
/// Fetches still in flight are dropped; everything already fetched is
/// written out and the unfinished assets are reported as failed.
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }
}

/// Outcome of a mirror operation.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    /// Where the rewritten document was written.
    pub document_path: PathBuf,
    pub fetched: usize,
    pub failed: usize,
    /// References left as written: `data:`, non-http schemes, fragments and
    /// malformed references.
    pub skipped: usize,
    /// HTTP requests sent, retries and the root document included.
    pub requests: usize,
    pub cancelled: bool,
    /// Why `manifest.json` could not be written, if it could not.
    pub manifest_error: Option<String>,
    pub assets: Vec<AssetRecord>,
}

impl MirrorReport {
    /// Every discovered asset was fetched and written.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed == 0
    }
}

pub struct MirrorSession {
    config: MirrorConfig,
    fetcher: AssetFetcher,
    manifest: Manifest,
    names: NameAllocator,
    /// Stylesheets already scanned for nested references.
    visited: HashSet<Url>,
    files: FileManager,
    signal: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
    skipped: usize,
    cancelled: bool,
}

impl MirrorSession {
    pub fn new(config: MirrorConfig) -> Result<Self> {
        config.validate()?;

        let fetcher = AssetFetcher::new(&config)?;
        let files = FileManager::new(&config.output_dir)?;
        let names = NameAllocator::new(config.layout, &config.assets_dir);
        let (signal, _) = watch::channel(false);

        Ok(Self {
            config,
            fetcher,
            manifest: Manifest::new(),
            names,
            visited: HashSet::new(),
            files,
            signal: Arc::new(signal),
            deadline: None,
            skipped: 0,
            cancelled: false,
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            signal: self.signal.clone(),
        }
    }

    /// Fetch the page at `url` and mirror it. Failing to retrieve the page
    /// itself is fatal; failures of individual assets are not.
    pub async fn mirror_url(mut self, url: &str, seeds: &[String]) -> Result<MirrorReport> {
        let target = resolver::parse_base(url)?;
        self.start_clock();

        info!(url = %target, "fetching root document");
        let root = tokio::select! {
            biased;
            _ = self.stopped() => return Err(MirrorError::Cancelled),
            root = self.fetcher.retrieve(&target) => root?,
        };

        let html = root.text();
        self.mirror(&html, root.final_url, seeds).await
    }

    /// Mirror an already retrieved document, such as a DOM snapshot saved
    /// from a browser, whose references resolve against `base_url`.
    pub async fn mirror_document(
        mut self,
        html: &str,
        base_url: &str,
        seeds: &[String],
    ) -> Result<MirrorReport> {
        let base_url = resolver::parse_base(base_url)?;
        self.start_clock();
        self.mirror(html, base_url, seeds).await
    }

    fn start_clock(&mut self) {
        self.deadline = self.config.run_timeout.map(|limit| Instant::now() + limit);
    }

    async fn mirror(mut self, html: &str, base_url: Url, seeds: &[String]) -> Result<MirrorReport> {
        let parser = HtmlParser::from_base(base_url);
        let resources = parser.extract_resources(html);

        let mut frontier = Vec::new();
        for link in &resources.links {
            if let Some(url) = self.classify(&resources.base_url, &link.reference) {
                frontier.push((url, link.resource_type));
            }
        }
        for seed in seeds {
            match resolver::parse_base(seed) {
                Ok(mut url) => {
                    url.set_fragment(None);
                    frontier.push((url, ResourceType::Other));
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "ignoring seed");
                    self.skipped += 1;
                }
            }
        }
        info!(
            base = %resources.base_url,
            references = frontier.len(),
            skipped = self.skipped,
            "document scanned"
        );

        self.settle(frontier).await;

        self.persist_assets();
        self.persist_stylesheets();
        let document_path = self.persist_document(&parser, html, &resources.base_url)?;

        let mut manifest_error = None;
        if self.config.write_manifest {
            if let Err(e) = self.write_manifest() {
                warn!(error = %e, "could not write manifest");
                manifest_error = Some(e.to_string());
            }
        }

        let report = self.report(document_path, manifest_error);
        info!(
            fetched = report.fetched,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "mirror finished"
        );
        Ok(report)
    }

    /// Resolve a raw reference; only http(s) URLs come back. Everything else
    /// is counted as skipped and left as written.
    fn classify(&mut self, base: &Url, raw: &str) -> Option<Url> {
        match resolver::resolve(base, raw) {
            Reference::Fetchable { url, .. } => Some(url),
            Reference::Malformed(reason) => {
                warn!(reference = raw, %reason, "malformed reference left untouched");
                self.skipped += 1;
                None
            }
            Reference::Embedded | Reference::NonNavigable => {
                self.skipped += 1;
                None
            }
        }
    }

    /// Resolve until no new stylesheet references turn up, or the run is
    /// stopped. Every stylesheet is scanned once, so import cycles end.
    async fn settle(&mut self, mut frontier: Vec<(Url, ResourceType)>) {
        let mut depth = 0usize;

        while !frontier.is_empty() {
            let mut seen = HashSet::new();
            let mut level: Vec<Arc<Asset>> = Vec::new();
            for (url, kind) in frontier.drain(..) {
                let (asset, _) = self.manifest.insert_if_absent(&url);
                asset.note_reference(kind);
                if seen.insert(url) {
                    level.push(asset);
                }
            }

            let fetches = join_all(
                level
                    .iter()
                    .map(|asset| self.fetcher.fetch(&self.manifest, asset.url())),
            );
            let stop = self.stopped();
            let completed = tokio::select! {
                biased;
                _ = stop => false,
                _ = fetches => true,
            };

            self.assign_names(&level);

            if !completed {
                warn!(depth, "run stopped, unfinished assets are reported as failed");
                self.cancelled = true;
                break;
            }

            debug!(depth, assets = level.len(), "level settled");
            frontier = self.nested_references(&level);
            depth += 1;
        }
    }

    fn assign_names(&mut self, level: &[Arc<Asset>]) {
        for asset in level {
            if asset.local_path().is_some() {
                continue;
            }
            let Some(fetched) = asset.fetched() else {
                continue;
            };
            let hint = if asset.is_stylesheet() {
                ResourceType::Stylesheet
            } else {
                asset.hint()
            };
            let path = self
                .names
                .allocate(asset.url(), fetched.content_type.as_deref(), hint);
            asset.assign_local_path(path);
        }
    }

    fn nested_references(&mut self, level: &[Arc<Asset>]) -> Vec<(Url, ResourceType)> {
        let mut next = Vec::new();

        for asset in level {
            if !asset.is_stylesheet() {
                continue;
            }
            let Some(fetched) = asset.fetched() else {
                continue;
            };
            if !self.visited.insert(asset.url().clone()) {
                continue;
            }

            for reference in css::scan(&css::decode(&fetched.body)) {
                let kind = match reference.kind {
                    CssReferenceKind::Import => ResourceType::Stylesheet,
                    CssReferenceKind::Url => ResourceType::Other,
                };
                if let Some(url) = self.classify(&fetched.final_url, &reference.target) {
                    next.push((url, kind));
                }
            }
        }

        next
    }

    /// Local reference for `raw` as seen from the file at `from`, if it
    /// points at an asset that made it to disk.
    fn localize(&self, base: &Url, raw: &str, from: &str) -> Option<String> {
        let Reference::Fetchable { url, fragment } = resolver::resolve(base, raw) else {
            return None;
        };
        let asset = self.manifest.get(&url)?;
        let target = asset.available_path()?;

        let mut local = naming::relative_to(from, target);
        if let Some(fragment) = fragment {
            local.push('#');
            local.push_str(&fragment);
        }
        Some(local)
    }

    fn persist_assets(&self) {
        let mut written = 0usize;
        for asset in self.manifest.assets() {
            if asset.is_stylesheet() {
                continue;
            }
            let (Some(fetched), Some(path)) = (asset.fetched(), asset.local_path()) else {
                continue;
            };
            match self.files.save_file(path, &fetched.body) {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(url = %asset.url(), error = %e, "could not write asset");
                    asset.mark_persist_failed(e.to_string());
                }
            }
        }
        debug!(written, "assets written");
    }

    fn persist_stylesheets(&self) {
        for asset in self.manifest.assets() {
            if !asset.is_stylesheet() {
                continue;
            }
            let (Some(fetched), Some(path)) = (asset.fetched(), asset.local_path()) else {
                continue;
            };

            let rewritten = css::rewrite_bytes(&fetched.body, |reference| {
                self.localize(&fetched.final_url, &reference.target, path)
            });
            if let Err(e) = self.files.save_file(path, &rewritten) {
                warn!(url = %asset.url(), error = %e, "could not write stylesheet");
                asset.mark_persist_failed(e.to_string());
            }
        }
    }

    fn persist_document(&self, parser: &HtmlParser, html: &str, base_url: &Url) -> Result<PathBuf> {
        let document_name = self.config.document_name.as_str();
        let rewritten = parser.rewrite_links(html, base_url, |base, raw| {
            self.localize(base, raw, document_name)
        })?;
        self.files.save_file(document_name, rewritten.as_bytes())
    }

    fn write_manifest(&self) -> Result<()> {
        let records = self.manifest.records();
        let json = serde_json::to_vec_pretty(&records)?;
        self.files.save_file(MANIFEST_FILE, &json)?;
        Ok(())
    }

    /// Resolves once the run is cancelled or its deadline passed.
    async fn stopped(&self) {
        let mut signal = self.signal.subscribe();
        let cancelled = async move {
            let closed = signal.wait_for(|stop| *stop).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => {}
                _ = tokio::time::sleep_until(deadline) => {}
            },
            None => cancelled.await,
        }
    }

    fn report(&self, document_path: PathBuf, manifest_error: Option<String>) -> MirrorReport {
        let assets = self.manifest.records();
        let fetched = assets
            .iter()
            .filter(|record| record.status == AssetStatus::Fetched)
            .count();

        MirrorReport {
            document_path,
            fetched,
            failed: assets.len() - fetched,
            skipped: self.skipped,
            requests: self.fetcher.requests_sent(),
            cancelled: self.cancelled,
            manifest_error,
            assets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_document_without_fetchable_references() {
        let temp_dir = tempdir().unwrap();
        let session = MirrorSession::new(MirrorConfig::new(temp_dir.path())).unwrap();

        let html = r##"<img src="data:image/png;base64,AAAA"><a href="mailto:a@b.test">m</a><a href="#top">t</a>"##;
        let report = session
            .mirror_document(html, "https://x.test/p/", &[])
            .await
            .unwrap();

        assert_eq!(report.fetched, 0);
        assert_eq!(report.requests, 0);
        assert_eq!(report.skipped, 1);
        assert!(report.is_complete());
        assert_eq!(std::fs::read_to_string(&report.document_path).unwrap(), html);
        assert!(temp_dir.path().join(MANIFEST_FILE).is_file());
    }

    #[tokio::test]
    async fn test_manifest_write_failure_keeps_the_report() {
        let temp_dir = tempdir().unwrap();
        std::fs::create_dir(temp_dir.path().join(MANIFEST_FILE)).unwrap();
        let session = MirrorSession::new(MirrorConfig::new(temp_dir.path())).unwrap();

        let report = session
            .mirror_document("<p>x</p>", "https://x.test/", &[])
            .await
            .unwrap();

        assert!(report.document_path.is_file());
        assert!(report.manifest_error.is_some());
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let mut config = MirrorConfig::new(temp_dir.path());
        config.max_concurrent = 0;
        assert!(matches!(
            MirrorSession::new(config),
            Err(MirrorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_non_http_base_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let session = MirrorSession::new(MirrorConfig::new(temp_dir.path())).unwrap();
        let result = session.mirror_document("<p></p>", "file:///tmp/x.html", &[]).await;
        assert!(matches!(
            result,
            Err(MirrorError::MalformedReference { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_handle_is_shared() {
        let temp_dir = tempdir().unwrap();
        let session = MirrorSession::new(MirrorConfig::new(temp_dir.path())).unwrap();
        let handle = session.cancel_handle();
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
    }
}
