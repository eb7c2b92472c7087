//! Working-copy verification
//!
//! Compares the committed length of every tracked path at `HEAD` with the
//! size of its working file.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use tracing::warn;

use crate::error::Result;
use crate::repository::Avc;
use crate::store::{GlobalStore, LocalStore};

/// State of one working file relative to its committed length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Intact,
    Missing,
    /// Fewer bytes on disk than committed
    Short { actual: u64 },
    /// More bytes on disk than committed (not yet staged or committed)
    Longer { actual: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEntry {
    pub path: String,
    pub committed: u64,
    pub state: FileState,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub entries: Vec<VerifyEntry>,
}

impl VerifyReport {
    /// Entries whose working file cannot reproduce the committed bytes
    pub fn damaged(&self) -> impl Iterator<Item = &VerifyEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, FileState::Missing | FileState::Short { .. }))
    }

    pub fn is_clean(&self) -> bool {
        self.damaged().next().is_none()
    }
}

impl<G: GlobalStore, L: LocalStore> Avc<G, L> {
    /// Committed length of every path tracked at `HEAD`
    pub fn tracked_files(&self) -> Result<BTreeMap<String, u64>> {
        let mut tracked = BTreeMap::new();
        let mut cursor = self.head()?;
        while let Some(id) = cursor {
            // Tracked files only grow, so the largest end offset wins.
            for change in self.global.changes(&id)? {
                let end = change.end_offset();
                let slot = tracked.entry(change.path).or_insert(end);
                *slot = (*slot).max(end);
            }
            cursor = self.global.parent_of(&id)?;
        }
        Ok(tracked)
    }

    /// Check every tracked working file against its committed length
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for (path, committed) in self.tracked_files()? {
            let state = match fs::metadata(self.layout.data_path(&path)) {
                Ok(meta) if meta.len() == committed => FileState::Intact,
                Ok(meta) if meta.len() < committed => FileState::Short { actual: meta.len() },
                Ok(meta) => FileState::Longer { actual: meta.len() },
                Err(e) if e.kind() == ErrorKind::NotFound => FileState::Missing,
                Err(e) => return Err(e.into()),
            };
            if state != FileState::Intact {
                warn!("{}: {:?} (committed {} bytes)", path, state, committed);
            }
            report.entries.push(VerifyEntry {
                path,
                committed,
                state,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::memory_store::{MemoryGlobalStore, MemoryLocalStore};
    use tempfile::TempDir;

    #[test]
    fn test_verify_reports_each_state() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path().join("repo"), tmp.path().join("data"));
        fs::create_dir_all(layout.data_toplevel()).unwrap();
        let mut avc = Avc::with_stores(layout, MemoryGlobalStore::new(), MemoryLocalStore::new());

        for name in ["intact", "short", "longer", "missing"] {
            fs::write(avc.layout().data_path(name), vec![0u8; 10]).unwrap();
            avc.stage(name, Some(5)).unwrap();
        }
        avc.build_commit(false).unwrap();
        fs::write(avc.layout().data_path("intact"), vec![0u8; 8]).unwrap();
        avc.stage("intact", None).unwrap();
        avc.build_commit(false).unwrap();

        fs::write(avc.layout().data_path("short"), vec![0u8; 2]).unwrap();
        fs::remove_file(avc.layout().data_path("missing")).unwrap();

        let tracked = avc.tracked_files().unwrap();
        assert_eq!(tracked["intact"], 8);
        assert_eq!(tracked["short"], 5);

        let report = avc.verify().unwrap();
        let states: BTreeMap<&str, FileState> =
            report.entries.iter().map(|e| (e.path.as_str(), e.state)).collect();
        assert_eq!(states["intact"], FileState::Intact);
        assert_eq!(states["short"], FileState::Short { actual: 2 });
        assert_eq!(states["longer"], FileState::Longer { actual: 10 });
        assert_eq!(states["missing"], FileState::Missing);
        assert!(!report.is_clean());
        assert_eq!(report.damaged().count(), 2);
    }
}
