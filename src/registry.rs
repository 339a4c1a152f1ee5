//! Source of valid client ids.
//!
//! The engine never owns client identity; it only asks whether an id exists
//! and which ids there are.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{FleetError, FleetResult};
use crate::store::is_valid_client_id;

pub trait ClientRegistry: Send + Sync {
    fn list_ids(&self) -> FleetResult<BTreeSet<String>>;

    fn contains(&self, client_id: &str) -> FleetResult<bool> {
        Ok(self.list_ids()?.contains(client_id))
    }
}

/// Treats every sub-directory of the data directory as a client.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    data_dir: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

impl ClientRegistry for DirectoryRegistry {
    fn list_ids(&self) -> FleetResult<BTreeSet<String>> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(FleetError::io(&self.data_dir, e)),
        };

        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| FleetError::io(&self.data_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(id) if is_valid_client_id(&id) => {
                    ids.insert(id);
                }
                _ => tracing::debug!(path = %entry.path().display(), "skipping non-client directory"),
            }
        }
        Ok(ids)
    }

    fn contains(&self, client_id: &str) -> FleetResult<bool> {
        Ok(is_valid_client_id(client_id) && self.data_dir.join(client_id).is_dir())
    }
}

/// Fixed, in-memory id set. Used by embedders that keep client identity
/// elsewhere, and by tests.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    ids: RwLock<BTreeSet<String>>,
}

impl StaticRegistry {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, client_id: impl Into<String>) {
        self.ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(client_id.into());
    }

    pub fn remove(&self, client_id: &str) -> bool {
        self.ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(client_id)
    }
}

impl ClientRegistry for StaticRegistry {
    fn list_ids(&self) -> FleetResult<BTreeSet<String>> {
        Ok(self
            .ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_registry_lists_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("3")).unwrap();
        std::fs::create_dir(dir.path().join("4")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let registry = DirectoryRegistry::new(dir.path());
        let ids: Vec<_> = registry.list_ids().unwrap().into_iter().collect();
        assert_eq!(ids, ["3", "4"]);
        assert!(registry.contains("3").unwrap());
        assert!(!registry.contains("5").unwrap());
        assert!(!registry.contains("..").unwrap());
    }

    #[test]
    fn test_missing_data_dir_is_empty_fleet() {
        let registry = DirectoryRegistry::new("/definitely/not/here");
        assert!(registry.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_static_registry() {
        let registry = StaticRegistry::new(["7", "8"]);
        assert!(registry.contains("7").unwrap());
        registry.remove("7");
        registry.insert("9");
        let ids: Vec<_> = registry.list_ids().unwrap().into_iter().collect();
        assert_eq!(ids, ["8", "9"]);
    }
}
