//! Watches the persisted document and swaps in new snapshots
//!
//! The file is polled and fingerprinted with SHA-256; only a changed digest
//! triggers a parse. A reload is all-or-nothing: a read, parse or
//! validation failure leaves the previous snapshot and credentials live.

use crate::document::{Document, DocumentError};
use crate::driver::Driver;
use crate::groups::GroupConflict;
use crate::lifecycle::{now_millis, LifecycleManager};
use crate::registry::{Registry, Snapshot};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("rejected document: {0}")]
    Groups(#[from] GroupConflict),
}

/// Backend names affected by a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    /// No longer in the document; left running and never reaped again
    pub removed: Vec<String>,
    /// Record changed; takes effect on the next request or sweep
    pub updated: Vec<String>,
}

impl ReloadResult {
    fn between(previous: &Snapshot, next: &Snapshot) -> Self {
        let mut result = ReloadResult::default();
        let next_names: HashSet<&str> = next.backends().iter().map(|b| b.name()).collect();

        for backend in next.backends() {
            match previous.backend(backend.name()) {
                None => result.added.push(backend.name().to_string()),
                Some(old) if old.record != backend.record => {
                    result.updated.push(backend.name().to_string())
                }
                Some(_) => {}
            }
        }
        result.removed = previous
            .backends()
            .iter()
            .map(|b| b.name())
            .filter(|name| !next_names.contains(name))
            .map(str::to_string)
            .collect();

        result
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct ConfigReactor {
    path: PathBuf,
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    /// Receives Proxmox credentials from each applied document
    driver: Option<Arc<Driver>>,
    interval: Duration,
    fingerprint: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
}

impl ConfigReactor {
    pub fn new<P: AsRef<Path>>(
        path: P,
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleManager>,
        interval: Duration,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            registry,
            lifecycle,
            driver: None,
            interval,
            fingerprint: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_driver(mut self, driver: Arc<Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document at startup, writing a default one when it is missing
    pub fn load_initial(&self) -> Result<ReloadResult, ReloadError> {
        let (document, created) = Document::load_or_bootstrap(&self.path)?;
        if created {
            info!(path = %self.path.display(), "No document found, created an empty one");
        }
        if let Ok(bytes) = std::fs::read(&self.path) {
            *self.fingerprint.lock() = Some(fingerprint(&bytes));
        }
        self.apply(&document)
    }

    /// Check the document once; `Ok(None)` when it has not changed
    pub async fn poll_once(&self) -> Result<Option<ReloadResult>, ReloadError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| DocumentError::Io {
            path: self.path.clone(),
            source,
        })?;

        let digest = fingerprint(&bytes);
        {
            let mut current = self.fingerprint.lock();
            if current.as_deref() == Some(digest.as_str()) {
                return Ok(None);
            }
            // Stored before parsing so a broken file is not reparsed every tick
            *current = Some(digest);
        }

        let document = Document::from_slice(&bytes)?;
        self.apply(&document).map(Some)
    }

    /// Validate and install a document
    pub fn apply(&self, document: &Document) -> Result<ReloadResult, ReloadError> {
        let snapshot = Snapshot::from_document(document)?;
        let result = ReloadResult::between(&self.registry.snapshot(), &snapshot);

        // Seed before publishing so no sweep sees a backend without activity
        let seeded = self
            .lifecycle
            .seed(snapshot.backends().iter().map(|b| b.name()), now_millis());
        if let Some(driver) = &self.driver {
            driver.set_credentials(snapshot.credentials());
        }
        self.registry.replace(snapshot);

        debug!(seeded, "Document applied");
        Ok(result)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            interval_ms = self.interval.as_millis() as u64,
            "Watching document for changes"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.poll_once().await {
                        Ok(Some(result)) => {
                            self.last_error.lock().take();
                            info!(
                                added = result.added.len(),
                                removed = result.removed.len(),
                                updated = result.updated.len(),
                                "Config reloaded, containers updated"
                            );
                            if !result.added.is_empty() {
                                info!(backends = ?result.added, "New backends available");
                            }
                            if !result.removed.is_empty() {
                                info!(backends = ?result.removed, "Backends removed from the document");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => self.report_error(&e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Log each distinct failure once
    fn report_error(&self, e: &ReloadError) {
        let message = e.to_string();
        let mut last = self.last_error.lock();
        if last.as_deref() != Some(message.as_str()) {
            error!(path = %self.path.display(), error = %message, "Failed to reload config, keeping previous state");
            *last = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_A: &str = r#"{
        "containers": [
            {"name": "A", "host": "a.example", "url": "http://a:80", "active": true, "idleTimeout": 60}
        ]
    }"#;

    const DOC_AB: &str = r#"{
        "containers": [
            {"name": "A", "host": "a.example", "url": "http://a:8080", "active": true, "idleTimeout": 60},
            {"name": "B", "host": "b.example", "url": "http://b:80", "active": true}
        ]
    }"#;

    fn reactor(path: &Path) -> (ConfigReactor, Arc<Registry>, Arc<LifecycleManager>) {
        let registry = Registry::new(Snapshot::empty());
        let lifecycle = LifecycleManager::new(Duration::from_secs(30), Duration::from_secs(5));
        let reactor = ConfigReactor::new(
            path,
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            Duration::from_millis(500),
        );
        (reactor, registry, lifecycle)
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(fingerprint(DOC_A.as_bytes()), fingerprint(DOC_AB.as_bytes()));
    }

    #[test]
    fn test_load_initial_bootstraps_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("config.json");
        let (reactor, registry, _) = reactor(&path);

        let result = reactor.load_initial().unwrap();

        assert!(path.exists());
        assert!(result.added.is_empty());
        assert!(registry.snapshot().backends().is_empty());
    }

    #[tokio::test]
    async fn test_reload_seeds_only_new_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, DOC_A).unwrap();
        let (reactor, registry, lifecycle) = reactor(&path);

        let result = reactor.load_initial().unwrap();
        assert_eq!(result.added, vec!["A"]);
        assert_eq!(registry.snapshot().resolve_host("a.example").unwrap().name(), "A");

        // Unchanged file is a no-op
        assert_eq!(reactor.poll_once().await.unwrap(), None);

        lifecycle.touch("A", 42);
        std::fs::write(&path, DOC_AB).unwrap();
        let result = reactor.poll_once().await.unwrap().unwrap();

        assert_eq!(result.added, vec!["B"]);
        assert_eq!(result.updated, vec!["A"]);
        assert!(result.removed.is_empty());
        assert_eq!(lifecycle.last_activity("A"), Some(42));
        assert!(lifecycle.last_activity("B").unwrap() > 42);
    }

    #[tokio::test]
    async fn test_broken_document_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, DOC_A).unwrap();
        let (reactor, registry, _) = reactor(&path);
        reactor.load_initial().unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            reactor.poll_once().await,
            Err(ReloadError::Document(DocumentError::Parse(_)))
        ));
        assert!(registry.snapshot().backend("A").is_some());

        // Same broken bytes are not reparsed
        assert_eq!(reactor.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_conflicting_groups_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, DOC_A).unwrap();
        let (reactor, registry, _) = reactor(&path);
        reactor.load_initial().unwrap();

        let conflicting = r#"{
            "containers": [{"name": "C", "host": "c.example", "url": "http://c", "active": true}],
            "groups": [
                {"name": "one", "container": ["C"], "active": true},
                {"name": "two", "container": "C", "active": true}
            ]
        }"#;
        std::fs::write(&path, conflicting).unwrap();

        assert!(matches!(reactor.poll_once().await, Err(ReloadError::Groups(_))));
        assert!(registry.snapshot().backend("C").is_none());
        assert!(registry.snapshot().backend("A").is_some());
    }

    #[tokio::test]
    async fn test_removed_backend_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, DOC_AB).unwrap();
        let (reactor, _, lifecycle) = reactor(&path);
        reactor.load_initial().unwrap();

        std::fs::write(&path, DOC_A).unwrap();
        let result = reactor.poll_once().await.unwrap().unwrap();

        assert_eq!(result.removed, vec!["B"]);
        // Runtime state survives removal
        assert!(lifecycle.last_activity("B").is_some());
    }
}
