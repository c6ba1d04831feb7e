//! Deployment mount roots.
//!
//! The four reserved roots are deployment configuration. A `MountTable` is
//! loaded from `<config dir>/klnk/mounts.json` when present and otherwise
//! falls back to the built-in roots in [`PathsConfig`].

use crate::config::{PathsConfig, ProtocolConfig};
use crate::error::{KlnkError, Result};
use crate::request::RequestPath;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reserved mount and path roots of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountTable {
    /// Working directories at or below this root may enter the cluster scope.
    pub cluster_root: PathBuf,
    /// Where a migrated executable fetch is redirected on a retry signal.
    pub local_fallback_root: PathBuf,
    /// Files below this root are shared-memory mappings.
    pub shm_map_root: PathBuf,
    /// Control channel mount; requests are encoded as paths below it.
    pub control_root: PathBuf,
}

impl Default for MountTable {
    fn default() -> Self {
        Self {
            cluster_root: PathBuf::from(PathsConfig::ROOT),
            local_fallback_root: PathBuf::from(PathsConfig::LBFS),
            shm_map_root: PathBuf::from(PathsConfig::VMAP),
            control_root: PathBuf::from(PathsConfig::KLNK),
        }
    }
}

impl MountTable {
    /// Load a mount table from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| KlnkError::io_with_path(e, path))?;
        let table: MountTable = serde_json::from_str(&content)?;
        table.validate()?;
        info!(target: "klnk::scope", "loaded mount table from {}", path.display());
        Ok(table)
    }

    /// Load from the default location, or the built-in roots if no file exists.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!(target: "klnk::scope", "no mount table file, using built-in roots");
                Ok(Self::default())
            }
        }
    }

    /// `<config dir>/klnk/mounts.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(PathsConfig::CONFIG_DIR_NAME)
                .join(PathsConfig::MOUNTS_FILENAME)
        })
    }

    /// Every root must be an absolute UTF-8 path, and the control root must
    /// leave room for an encoded request.
    pub fn validate(&self) -> Result<()> {
        for (name, root) in [
            ("cluster_root", &self.cluster_root),
            ("local_fallback_root", &self.local_fallback_root),
            ("shm_map_root", &self.shm_map_root),
            ("control_root", &self.control_root),
        ] {
            if !root.is_absolute() {
                return Err(KlnkError::Config {
                    message: format!("{} must be absolute: {}", name, root.display()),
                });
            }
            if root.to_str().is_none() {
                return Err(KlnkError::Config {
                    message: format!("{} is not valid UTF-8", name),
                });
            }
        }
        if self.local_fallback_root.as_os_str().len() >= ProtocolConfig::PATH_MAX {
            return Err(KlnkError::Config {
                message: "local_fallback_root exceeds the path limit".to_string(),
            });
        }
        let control_len = self.control_root.to_string_lossy().trim_end_matches('/').len();
        if control_len > RequestPath::MAX_CONTROL_ROOT_LEN {
            return Err(KlnkError::Config {
                message: format!(
                    "control_root is {} bytes, at most {} leave room for request fields",
                    control_len,
                    RequestPath::MAX_CONTROL_ROOT_LEN
                ),
            });
        }
        Ok(())
    }

    /// Whether `path` names the shared-memory map root or something below it.
    ///
    /// Matches on the exact root followed by end-of-path or `/`, so a sibling
    /// such as `<root>x` is not a member.
    pub fn is_shm_map(&self, path: &Path) -> bool {
        let (Some(path), Some(root)) = (path.to_str(), self.shm_map_root.to_str()) else {
            return false;
        };
        match path.strip_prefix(root) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::{Operation, ResourceClass};

    #[test]
    fn test_default_roots() {
        let table = MountTable::default();
        assert_eq!(table.cluster_root, PathBuf::from("/vhub/root"));
        assert_eq!(table.control_root, PathBuf::from("/vhub/mnt/klnk"));
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_shm_map_membership() {
        let table = MountTable::default();
        assert!(table.is_shm_map(Path::new("/vhub/mnt/vmap")));
        assert!(table.is_shm_map(Path::new("/vhub/mnt/vmap/x")));
        assert!(table.is_shm_map(Path::new("/vhub/mnt/vmap/a/b")));
        assert!(!table.is_shm_map(Path::new("/vhub/mnt/vmapx")));
        assert!(!table.is_shm_map(Path::new("/vhub/mnt")));
        assert!(!table.is_shm_map(Path::new("/other/vhub/mnt/vmap")));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mounts.json");
        std::fs::write(&path, r#"{"cluster_root": "/srv/cluster"}"#).unwrap();

        let table = MountTable::load(&path).unwrap();
        assert_eq!(table.cluster_root, PathBuf::from("/srv/cluster"));
        assert_eq!(table.local_fallback_root, PathBuf::from(PathsConfig::LBFS));
    }

    #[test]
    fn test_load_rejects_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mounts.json");
        std::fs::write(&path, r#"{"control_root": "mnt/klnk"}"#).unwrap();

        assert!(matches!(
            MountTable::load(&path),
            Err(KlnkError::Config { .. })
        ));
    }

    #[test]
    fn test_control_root_bound_fits_every_request() {
        let worst = RequestPath {
            cls: ResourceClass::Task.code(),
            key: u32::MAX,
            op: Operation::NR_OPERATIONS - 1,
            id: u32::MAX,
            val1: u32::MAX,
            val2: u32::MAX,
            addr: u64::MAX,
            inlen: ProtocolConfig::IO_MAX as u64,
            outlen: ProtocolConfig::IO_MAX as u64,
        };

        let mut table = MountTable::default();
        table.control_root = PathBuf::from(format!(
            "/{}",
            "k".repeat(RequestPath::MAX_CONTROL_ROOT_LEN - 1)
        ));
        assert!(table.validate().is_ok());
        let path = worst.render(&table.control_root).unwrap();
        assert_eq!(path.len(), ProtocolConfig::PATH_MAX - 1);

        table.control_root = PathBuf::from(format!(
            "/{}",
            "k".repeat(RequestPath::MAX_CONTROL_ROOT_LEN)
        ));
        assert!(matches!(table.validate(), Err(KlnkError::Config { .. })));
        assert!(worst.render(&table.control_root).is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = MountTable::load(Path::new("/nonexistent/klnk/mounts.json"));
        assert!(matches!(result, Err(KlnkError::Io { path: Some(_), .. })));
    }
}
