//! Process scope: who may use the cluster mechanism.
//!
//! The global identifier lives on an explicit [`ExecContext`] passed by
//! reference through every call, never in process-wide state. Its lifecycle
//! belongs to whoever manages processes; this crate only reads it, and writes
//! it solely through [`ExecContext::set_global_id`].

use crate::mounts::MountTable;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Execution context of one requesting process or thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    gpid: i32,
    cwd: PathBuf,
}

impl ExecContext {
    /// A purely local context (global id 0) with the given working directory.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            gpid: 0,
            cwd: cwd.into(),
        }
    }

    /// Context for the calling process, using its current working directory.
    pub fn current() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn with_global_id(mut self, id: i32) -> Self {
        self.gpid = id;
        self
    }

    pub fn get_global_id(&self) -> i32 {
        self.gpid
    }

    pub fn set_global_id(&mut self, id: i32) {
        self.gpid = id;
    }

    /// True iff the context holds a strictly positive global id.
    pub fn is_global(&self) -> bool {
        self.gpid > 0
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = cwd.into();
    }

    /// Whether the working directory resolves to the cluster root or below it.
    ///
    /// Comparison is per path component, so `/vhub/rootx` is not inside
    /// `/vhub/root`. An unresolvable working directory yields `false`.
    pub fn can_enter(&self, mounts: &MountTable) -> bool {
        let resolved = match std::fs::canonicalize(&self.cwd) {
            Ok(path) => path,
            Err(e) => {
                debug!(
                    target: "klnk::scope",
                    gpid = self.gpid,
                    "cannot resolve {}: {}",
                    self.cwd.display(),
                    e
                );
                return false;
            }
        };
        let root = std::fs::canonicalize(&mounts.cluster_root)
            .unwrap_or_else(|_| mounts.cluster_root.clone());
        resolved.starts_with(&root)
    }
}
