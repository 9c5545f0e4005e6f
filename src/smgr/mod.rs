// Storage manager
//
// Relation files live under `<data_dir>/<tablespace>/<database>/<relation>`
// with one file per fork. The two-phase core only needs the unlink path:
// dropping every fork of a relation when a prepared transaction's final
// decision says so, tolerating files that were never created.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::common::RelFileNode;
use crate::error::Result;

/// Forks a relation may have on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkNumber {
    Main,
    FreeSpaceMap,
    VisibilityMap,
}

impl ForkNumber {
    pub const ALL: [ForkNumber; 3] = [
        ForkNumber::Main,
        ForkNumber::FreeSpaceMap,
        ForkNumber::VisibilityMap,
    ];

    fn suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::FreeSpaceMap => "_fsm",
            ForkNumber::VisibilityMap => "_vm",
        }
    }
}

/// File-level storage manager rooted at a data directory.
#[derive(Debug, Clone)]
pub struct StorageManager {
    data_dir: PathBuf,
}

impl StorageManager {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, rel: RelFileNode, fork: ForkNumber) -> PathBuf {
        self.data_dir
            .join(rel.spc_node.to_string())
            .join(rel.db_node.to_string())
            .join(format!("{}{}", rel.rel_node, fork.suffix()))
    }

    /// Creates the main fork (and its parent directories) for a relation.
    pub fn create(&self, rel: RelFileNode) -> Result<()> {
        let path = self.path_for(rel, ForkNumber::Main);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&path)?;
        Ok(())
    }

    /// True when the relation's main fork exists.
    pub fn exists(&self, rel: RelFileNode) -> bool {
        self.path_for(rel, ForkNumber::Main).exists()
    }

    /// Unlinks every fork of the relation. Missing forks are ignored; only
    /// real I/O failures surface.
    pub fn unlink_all_forks(&self, rel: RelFileNode) -> Result<()> {
        for fork in ForkNumber::ALL {
            let path = self.path_for(rel, fork);
            match fs::remove_file(&path) {
                Ok(()) => debug!(?rel, ?fork, "unlinked relation fork"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_unlink() {
        let dir = tempdir().unwrap();
        let smgr = StorageManager::new(dir.path());
        let rel = RelFileNode::new(1, 2, 3);

        smgr.create(rel).unwrap();
        assert!(smgr.exists(rel));

        smgr.unlink_all_forks(rel).unwrap();
        assert!(!smgr.exists(rel));
    }

    #[test]
    fn test_unlink_missing_is_silent() {
        let dir = tempdir().unwrap();
        let smgr = StorageManager::new(dir.path());

        smgr.unlink_all_forks(RelFileNode::new(9, 9, 9)).unwrap();
    }
}
