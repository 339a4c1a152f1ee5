//! Canonical per-client paths.

use std::path::{Path, PathBuf};

use crate::config::schema::PathsConfig;

/// Maps a client id to its directory, document, lock file and executable.
#[derive(Debug, Clone)]
pub struct FleetLayout {
    data_dir: PathBuf,
    document_name: String,
    executable_name: String,
}

impl FleetLayout {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            data_dir: paths.data_dir.clone(),
            document_name: paths.document_name.clone(),
            executable_name: paths.executable_name.clone(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn client_dir(&self, client_id: &str) -> PathBuf {
        self.data_dir.join(client_id)
    }

    pub fn document_path(&self, client_id: &str) -> PathBuf {
        self.client_dir(client_id).join(&self.document_name)
    }

    /// Lock file beside the document: `frpc.toml` → `frpc.lock`.
    pub fn lock_path(&self, client_id: &str) -> PathBuf {
        self.document_path(client_id).with_extension("lock")
    }

    pub fn executable_path(&self, client_id: &str) -> PathBuf {
        self.client_dir(client_id).join(&self.executable_name)
    }

    /// Client id owning `path`, if `path` is some client's document.
    pub fn client_of_document(&self, path: &Path) -> Option<String> {
        if path.file_name()? != self.document_name.as_str() {
            return None;
        }
        let client_dir = path.parent()?;
        if client_dir.parent()? != self.data_dir {
            return None;
        }
        client_dir.file_name()?.to_str().map(str::to_string)
    }
}

/// Rejects ids that would escape the data directory.
pub fn is_valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id != "."
        && client_id != ".."
        && !client_id.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FleetLayout {
        FleetLayout::new(&PathsConfig {
            data_dir: PathBuf::from("/srv/fleet"),
            ..PathsConfig::default()
        })
    }

    #[test]
    fn test_paths() {
        let layout = layout();
        assert_eq!(layout.document_path("7"), Path::new("/srv/fleet/7/frpc.toml"));
        assert_eq!(layout.lock_path("7"), Path::new("/srv/fleet/7/frpc.lock"));
        assert_eq!(layout.executable_path("7"), Path::new("/srv/fleet/7/frpc"));
    }

    #[test]
    fn test_client_of_document() {
        let layout = layout();
        assert_eq!(
            layout.client_of_document(Path::new("/srv/fleet/12/frpc.toml")),
            Some("12".to_string())
        );
        assert_eq!(layout.client_of_document(Path::new("/srv/fleet/12/frpc.lock")), None);
        assert_eq!(layout.client_of_document(Path::new("/elsewhere/12/frpc.toml")), None);
    }

    #[test]
    fn test_client_id_validation() {
        assert!(is_valid_client_id("7"));
        assert!(is_valid_client_id("edge-01"));
        assert!(!is_valid_client_id(""));
        assert!(!is_valid_client_id(".."));
        assert!(!is_valid_client_id("a/b"));
    }
}
