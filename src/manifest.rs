use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::Serialize;
use tokio::sync::OnceCell;
use url::Url;

use crate::error::MirrorError;
use crate::html_parser::ResourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Fetched,
    Failed,
}

/// Body and metadata of a successful retrieval.
#[derive(Debug)]
pub struct Fetched {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// URL after redirects; references inside the body resolve against it.
    pub final_url: Url,
}

impl Fetched {
    pub fn is_css(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .map(|parsed| parsed.essence_str().eq_ignore_ascii_case("text/css"))
            .unwrap_or(false)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(Fetched),
    Failed(MirrorError),
}

/// One remote resource. The fetch outcome is written exactly once; the local
/// path is assigned by the name allocator once the fetch succeeded.
#[derive(Debug)]
pub struct Asset {
    url: Url,
    hint: Mutex<ResourceType>,
    stylesheet: AtomicBool,
    pub(crate) outcome: OnceCell<FetchOutcome>,
    local_path: OnceLock<String>,
    persist_error: OnceLock<String>,
}

impl Asset {
    fn new(url: Url) -> Self {
        Self {
            url,
            hint: Mutex::new(ResourceType::Other),
            stylesheet: AtomicBool::new(false),
            outcome: OnceCell::new(),
            local_path: OnceLock::new(),
            persist_error: OnceLock::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn outcome(&self) -> Option<&FetchOutcome> {
        self.outcome.get()
    }

    pub fn fetched(&self) -> Option<&Fetched> {
        match self.outcome.get() {
            Some(FetchOutcome::Fetched(fetched)) => Some(fetched),
            _ => None,
        }
    }

    pub fn status(&self) -> AssetStatus {
        match self.outcome.get() {
            None => AssetStatus::Pending,
            Some(FetchOutcome::Failed(_)) => AssetStatus::Failed,
            Some(FetchOutcome::Fetched(_)) if self.persist_error.get().is_some() => {
                AssetStatus::Failed
            }
            Some(FetchOutcome::Fetched(_)) => AssetStatus::Fetched,
        }
    }

    /// Record how the asset was referenced. A stylesheet reference wins over
    /// any other kind, so an asset imported anywhere gets scanned.
    pub fn note_reference(&self, kind: ResourceType) {
        if kind == ResourceType::Stylesheet {
            self.stylesheet.store(true, Ordering::Relaxed);
        }
        let mut hint = self.hint.lock().unwrap_or_else(PoisonError::into_inner);
        if *hint == ResourceType::Other {
            *hint = kind;
        }
    }

    pub fn hint(&self) -> ResourceType {
        *self.hint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Referenced as a stylesheet, or served as `text/css`.
    pub fn is_stylesheet(&self) -> bool {
        self.stylesheet.load(Ordering::Relaxed)
            || self.fetched().map(Fetched::is_css).unwrap_or(false)
    }

    pub fn local_path(&self) -> Option<&str> {
        self.local_path.get().map(String::as_str)
    }

    pub(crate) fn assign_local_path(&self, path: String) {
        let _ = self.local_path.set(path);
    }

    pub(crate) fn mark_persist_failed(&self, reason: String) {
        let _ = self.persist_error.set(reason);
    }

    /// Local path to rewrite references to, if the asset made it to disk.
    pub fn available_path(&self) -> Option<&str> {
        match self.status() {
            AssetStatus::Fetched => self.local_path(),
            _ => None,
        }
    }

    pub fn record(&self) -> AssetRecord {
        let error = match self.outcome.get() {
            None => Some("cancelled before completion".to_string()),
            Some(FetchOutcome::Failed(error)) => Some(error.to_string()),
            Some(FetchOutcome::Fetched(_)) => self.persist_error.get().cloned(),
        };
        let status = match self.status() {
            AssetStatus::Pending => AssetStatus::Failed,
            other => other,
        };

        AssetRecord {
            url: self.url.to_string(),
            local_path: self.available_path().map(str::to_owned),
            status,
            content_type: self.fetched().and_then(|f| f.content_type.clone()),
            error,
        }
    }
}

/// Serializable view of one manifest entry.
#[derive(Debug, Clone, Serialize)]
pub struct AssetRecord {
    pub url: String,
    pub local_path: Option<String>,
    pub status: AssetStatus,
    pub content_type: Option<String>,
    pub error: Option<String>,
}

/// Remote URL → asset, shared by every component of a session.
#[derive(Debug, Default)]
pub struct Manifest {
    entries: Mutex<HashMap<Url, Arc<Asset>>>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the asset for `url`, creating a placeholder if there is none.
    /// The boolean is true when this call created the entry.
    pub fn insert_if_absent(&self, url: &Url) -> (Arc<Asset>, bool) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(url) {
            return (existing.clone(), false);
        }
        let asset = Arc::new(Asset::new(url.clone()));
        entries.insert(url.clone(), asset.clone());
        (asset, true)
    }

    pub fn get(&self, url: &Url) -> Option<Arc<Asset>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every asset, ordered by URL.
    pub fn assets(&self) -> Vec<Arc<Asset>> {
        let mut assets: Vec<Arc<Asset>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
        assets
    }

    pub fn records(&self) -> Vec<AssetRecord> {
        self.assets().iter().map(|asset| asset.record()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_insert_if_absent_is_idempotent() {
        let manifest = Manifest::new();
        let (first, created) = manifest.insert_if_absent(&url("https://x.test/a.png"));
        assert!(created);
        let (second, created) = manifest.insert_if_absent(&url("https://x.test/a.png"));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_stylesheet_reference_wins() {
        let manifest = Manifest::new();
        let (asset, _) = manifest.insert_if_absent(&url("https://x.test/theme"));
        asset.note_reference(ResourceType::Image);
        assert!(!asset.is_stylesheet());
        asset.note_reference(ResourceType::Stylesheet);
        assert!(asset.is_stylesheet());
        assert_eq!(asset.hint(), ResourceType::Image);
    }

    #[test]
    fn test_status_transitions() {
        let manifest = Manifest::new();
        let (asset, _) = manifest.insert_if_absent(&url("https://x.test/a.css"));
        assert_eq!(asset.status(), AssetStatus::Pending);

        asset
            .outcome
            .set(FetchOutcome::Fetched(Fetched {
                body: b"body{}".to_vec(),
                content_type: Some("text/css; charset=utf-8".to_string()),
                final_url: url("https://x.test/a.css"),
            }))
            .unwrap();
        asset.assign_local_path("assets/a.css".to_string());

        assert_eq!(asset.status(), AssetStatus::Fetched);
        assert!(asset.is_stylesheet());
        assert_eq!(asset.available_path(), Some("assets/a.css"));

        asset.mark_persist_failed("disk full".to_string());
        assert_eq!(asset.status(), AssetStatus::Failed);
        assert_eq!(asset.available_path(), None);
        assert_eq!(asset.record().error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_pending_assets_are_reported_as_failed() {
        let manifest = Manifest::new();
        manifest.insert_if_absent(&url("https://x.test/slow.js"));
        let records = manifest.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AssetStatus::Failed);
        assert!(records[0].error.as_deref().unwrap().contains("cancelled"));
    }
}
