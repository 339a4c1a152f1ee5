//! Document persistence.
//!
//! # Data Flow
//! ```text
//! load:   lock → read frpc.toml → ClientDocument::parse → unlock
//! save:   lock → render → temp file in the client dir → fsync → rename → unlock
//! update: lock → read → caller closure → (Ok) render + rename → unlock
//! ```
//!
//! # Design Decisions
//! - The lock is a `flock` on a sibling `.lock` file so that independent
//!   processes (daemon, CLI, editors that respect it) serialize
//! - `update` holds one lock across read, mutate and write; the closure's
//!   error aborts the write and still releases the lock
//! - Writes go through a temp file and rename, so readers never observe a
//!   half-written document

pub mod layout;
pub mod lock;

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::config::schema::{PathsConfig, StoreConfig};
use crate::document::ClientDocument;
use crate::error::{FleetError, FleetResult};

pub use layout::{is_valid_client_id, FleetLayout};
pub use lock::DocumentLock;

/// Lock-guarded load and save of per-client documents.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    layout: FleetLayout,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl ConfigStore {
    pub fn new(paths: &PathsConfig, store: &StoreConfig) -> Self {
        Self {
            layout: FleetLayout::new(paths),
            lock_timeout: store.lock_timeout(),
            poll_interval: store.lock_poll_interval(),
        }
    }

    pub fn layout(&self) -> &FleetLayout {
        &self.layout
    }

    pub fn exists(&self, client_id: &str) -> bool {
        self.layout.document_path(client_id).is_file()
    }

    pub fn load(&self, client_id: &str) -> FleetResult<ClientDocument> {
        self.require_document(client_id)?;
        let _lock = self.lock(client_id)?;
        self.read(client_id)
    }

    /// [`load`](Self::load) on the blocking pool, for async callers that
    /// must not stall the runtime while the lock is contended.
    pub async fn load_async(&self, client_id: &str) -> FleetResult<ClientDocument> {
        let store = self.clone();
        let id = client_id.to_string();
        tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .map_err(|e| FleetError::io(self.layout.document_path(client_id), std::io::Error::other(e)))?
    }

    /// Persist the full document, replacing whatever is on disk.
    pub fn save(&self, client_id: &str, document: &ClientDocument) -> FleetResult<()> {
        ensure_dir(&self.layout.client_dir(client_id))?;
        let _lock = self.lock(client_id)?;
        self.write(client_id, document)
    }

    /// Load, mutate and save under a single lock.
    ///
    /// Nothing is written when `mutate` fails.
    pub fn update<T, F>(&self, client_id: &str, mutate: F) -> FleetResult<T>
    where
        F: FnOnce(&mut ClientDocument) -> FleetResult<T>,
    {
        self.require_document(client_id)?;
        let _lock = self.lock(client_id)?;
        let mut document = self.read(client_id)?;
        let output = mutate(&mut document)?;
        self.write(client_id, &document)?;
        Ok(output)
    }

    /// Write a brand new document; fails if one already exists.
    pub fn create(&self, client_id: &str, document: &ClientDocument) -> FleetResult<()> {
        ensure_dir(&self.layout.client_dir(client_id))?;
        let _lock = self.lock(client_id)?;
        if self.exists(client_id) {
            return Err(FleetError::AlreadyExists(format!(
                "client {client_id} already has a document"
            )));
        }
        self.write(client_id, document)
    }

    /// Delete the document and its lock file.
    pub fn remove(&self, client_id: &str) -> FleetResult<()> {
        self.require_document(client_id)?;
        let lock = self.lock(client_id)?;
        let path = self.layout.document_path(client_id);
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => missing(client_id),
            _ => FleetError::io(&path, e),
        })?;

        // Unlinked while still held; waiters notice and relock the new file.
        if let Err(e) = std::fs::remove_file(lock.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %lock.path().display(), error = %e, "failed to remove lock file");
            }
        }
        drop(lock);
        tracing::info!(client_id, "document removed");
        Ok(())
    }

    fn lock(&self, client_id: &str) -> FleetResult<DocumentLock> {
        DocumentLock::acquire(&self.layout.lock_path(client_id), self.lock_timeout, self.poll_interval)
    }

    fn require_document(&self, client_id: &str) -> FleetResult<()> {
        if self.exists(client_id) {
            Ok(())
        } else {
            Err(missing(client_id))
        }
    }

    fn read(&self, client_id: &str) -> FleetResult<ClientDocument> {
        let path = self.layout.document_path(client_id);
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => missing(client_id),
            _ => FleetError::io(&path, e),
        })?;
        ClientDocument::parse(&text).map_err(|e| FleetError::Corrupt {
            path,
            message: e.to_string(),
        })
    }

    fn write(&self, client_id: &str, document: &ClientDocument) -> FleetResult<()> {
        let path = self.layout.document_path(client_id);
        let text = document.render()?;
        write_atomic(&path, text.as_bytes())?;
        tracing::debug!(client_id, path = %path.display(), bytes = text.len(), "document saved");
        Ok(())
    }
}

fn missing(client_id: &str) -> FleetError {
    FleetError::NotFound(format!("client {client_id} has no document"))
}

fn ensure_dir(dir: &Path) -> FleetResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| FleetError::io(dir, e))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> FleetResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| FleetError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| FleetError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| FleetError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| FleetError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ConnectionSettings;
    use crate::error::ErrorKind;

    fn store(dir: &Path) -> ConfigStore {
        let paths = PathsConfig {
            data_dir: dir.to_path_buf(),
            ..PathsConfig::default()
        };
        let store = StoreConfig {
            lock_timeout_ms: 200,
            lock_poll_interval_ms: 10,
        };
        ConfigStore::new(&paths, &store)
    }

    fn document(server: &str) -> ClientDocument {
        ClientDocument::new(ConnectionSettings {
            server_addr: Some(server.to_string()),
            ..ConnectionSettings::default()
        })
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).load("1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create("1", &document("relay.example.com")).unwrap();
        let loaded = store.load("1").unwrap();
        assert_eq!(loaded.connection.server_addr.as_deref(), Some("relay.example.com"));

        let err = store.create("1", &document("other")).unwrap_err();
        assert!(matches!(err, FleetError::AlreadyExists(_)));
    }

    #[test]
    fn test_corrupt_document_is_io_class() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        std::fs::create_dir_all(dir.path().join("1")).unwrap();
        std::fs::write(store.layout().document_path("1"), "serverPort = \"nope").unwrap();
        let err = store.load("1").unwrap_err();
        assert!(matches!(err, FleetError::Corrupt { .. }));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create("1", &document("a")).unwrap();
        let before = std::fs::read(store.layout().document_path("1")).unwrap();

        let result: FleetResult<()> = store.update("1", |doc| {
            doc.connection.server_addr = Some("b".into());
            Err(FleetError::PreconditionFailed("rejected".into()))
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read(store.layout().document_path("1")).unwrap(), before);

        // The lock was released on the error path.
        store
            .update("1", |doc| {
                doc.connection.server_addr = Some("c".into());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.load("1").unwrap().connection.server_addr.as_deref(), Some("c"));
    }

    #[test]
    fn test_update_blocked_by_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create("1", &document("a")).unwrap();

        let _held = DocumentLock::acquire(
            &store.layout().lock_path("1"),
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .unwrap();
        let err = store.update("1", |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[test]
    fn test_save_replaces_document_and_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create("1", &document("a")).unwrap();

        let mut replacement = document("b");
        replacement.tunnels.push(
            crate::document::TunnelRecord::from_table(
                crate::document::parse_table("name = 'ssh'\ntype = 'tcp'\nlocalPort = 22\nremotePort = 2222").unwrap(),
            )
            .unwrap(),
        );
        store.save("1", &replacement).unwrap();
        assert_eq!(store.load("1").unwrap(), replacement);

        assert!(!dir.path().join("2").exists());
        store.save("2", &document("c")).unwrap();
        assert_eq!(store.load("2").unwrap(), document("c"));
    }

    #[tokio::test]
    async fn test_async_load_waits_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            data_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        };
        let store = ConfigStore::new(
            &paths,
            &StoreConfig {
                lock_timeout_ms: 2_000,
                lock_poll_interval_ms: 10,
            },
        );
        store.create("1", &document("a")).unwrap();

        let lock_path = store.layout().lock_path("1");
        let held = DocumentLock::acquire(&lock_path, Duration::from_secs(1), Duration::from_millis(10)).unwrap();
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            drop(held);
        });

        let began = std::time::Instant::now();
        let (loaded, timer_elapsed) = tokio::join!(store.load_async("1"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            began.elapsed()
        });
        assert!(timer_elapsed < Duration::from_millis(250), "timer stalled for {timer_elapsed:?}");
        assert_eq!(loaded.unwrap().connection.server_addr.as_deref(), Some("a"));
        holder.join().unwrap();
    }

    #[test]
    fn test_remove_deletes_document_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create("1", &document("a")).unwrap();
        store.remove("1").unwrap();
        assert!(!store.exists("1"));
        assert!(!store.layout().lock_path("1").exists());
        assert_eq!(store.remove("1").unwrap_err().kind(), ErrorKind::NotFound);
    }
}
