//! Staging tracker
//!
//! Each tracked path has at most one pending change. Staging the same path
//! again only ever grows that change; it never moves its start.

use std::fs;
use std::io::ErrorKind;
use tracing::{debug, info};

use crate::error::{AvcError, Result};
use crate::layout::normalize_tracked_path;
use crate::object::{ChangeType, StagedChange};
use crate::repository::Avc;
use crate::store::{GlobalStore, LocalStore};

/// Result of staging one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// A new staged row was written
    Created(StagedChange),
    /// An existing staged row now covers more bytes
    Grown(StagedChange),
    /// The existing staged row already covered the declared bytes
    Unchanged(StagedChange),
    /// Every declared byte is already committed
    NothingNew { committed: u64, declared: u64 },
}

impl<G: GlobalStore, L: LocalStore> Avc<G, L> {
    /// Stage the first `declared` bytes of `path` (default: the whole file).
    ///
    /// `path` is relative to the data toplevel.
    pub fn stage(&mut self, path: &str, declared: Option<u64>) -> Result<StageOutcome> {
        let head = self.ensure_head_is_main()?;
        let tracked = normalize_tracked_path(path)?;
        let backing = self.layout.data_path(&tracked);

        let meta = fs::metadata(&backing).map_err(|e| match e.kind() {
            ErrorKind::NotFound => AvcError::InvalidPath {
                path: path.to_string(),
                reason: format!("{} does not exist", backing.display()),
            },
            _ => AvcError::Io(e),
        })?;
        if !meta.is_file() {
            return Err(AvcError::InvalidPath {
                path: path.to_string(),
                reason: format!("{} is not a regular file", backing.display()),
            });
        }
        let available = meta.len();
        let declared = declared.unwrap_or(available);
        if declared > available {
            return Err(AvcError::InsufficientBytes {
                path: tracked,
                declared,
                available,
            });
        }

        let committed = self.global.committed_length(head.as_ref(), &tracked)?;
        let existing = self.local.staged(&tracked)?;

        let (change_type, start, wanted) = match committed {
            None => (ChangeType::Create, 0, declared),
            Some(len) if declared <= len => {
                info!(
                    "Nothing new to add with {} bytes: {} already has {} committed bytes",
                    declared, tracked, len
                );
                return Ok(StageOutcome::NothingNew {
                    committed: len,
                    declared,
                });
            }
            Some(len) => (ChangeType::Append, len, declared - len),
        };

        let outcome = match existing {
            Some(mut row) => {
                if row.change_type != change_type || row.start_offset != start {
                    return Err(AvcError::consistency(format!(
                        "staged {} of {} at offset {} does not match expected {} at offset {}",
                        row.change_type, tracked, row.start_offset, change_type, start
                    )));
                }
                if wanted <= row.num_bytes {
                    return Ok(StageOutcome::Unchanged(row));
                }
                row.num_bytes = wanted;
                self.local.put_staged(&row)?;
                StageOutcome::Grown(row)
            }
            None => {
                let row = StagedChange {
                    path: tracked.clone(),
                    change_type,
                    start_offset: start,
                    num_bytes: wanted,
                    backing_path: backing.to_string_lossy().into_owned(),
                    backing_offset: start,
                };
                self.local.put_staged(&row)?;
                StageOutcome::Created(row)
            }
        };
        debug!("Staged {:?}", outcome);
        Ok(outcome)
    }

    /// Drop every staged change
    pub fn reset_staging(&mut self) -> Result<()> {
        self.local.clear_staged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::memory_store::{MemoryGlobalStore, MemoryLocalStore};
    use crate::object::{Commit, CommitChange, CommitId};
    use tempfile::TempDir;

    type MemAvc = Avc<MemoryGlobalStore, MemoryLocalStore>;

    fn setup() -> (TempDir, MemAvc) {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path().join("repo"), tmp.path().join("data"));
        fs::create_dir_all(layout.data_toplevel()).unwrap();
        let avc = Avc::with_stores(layout, MemoryGlobalStore::new(), MemoryLocalStore::new());
        (tmp, avc)
    }

    fn write(avc: &MemAvc, path: &str, len: usize) {
        let full = avc.layout().data_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, vec![7u8; len]).unwrap();
    }

    fn commit_length(avc: &mut MemAvc, path: &str, len: u64) -> CommitId {
        let parent = avc.head().unwrap();
        let id = CommitId::compute(parent.as_ref(), "t", "h", [path]);
        let change = CommitChange {
            commit_id: id.clone(),
            batch_id: 0,
            path: path.to_string(),
            change_type: ChangeType::Create,
            start_offset: 0,
            num_bytes: len,
            blob_name: id.blob_name(0),
            blob_offset: 0,
        };
        avc.global.record_commit(&Commit::new(id.clone(), parent), &[change]).unwrap();
        avc.local.complete_commit(&id).unwrap();
        id
    }

    #[test]
    fn test_stage_create_then_grow() {
        let (_tmp, mut avc) = setup();
        write(&avc, "logs/a.bin", 100);

        let first = avc.stage("logs/a.bin", Some(40)).unwrap();
        let StageOutcome::Created(row) = first else {
            panic!("expected create, got {:?}", first);
        };
        assert_eq!(row.change_type, ChangeType::Create);
        assert_eq!(row.num_bytes, 40);
        assert!(row.backing_path.ends_with("data/logs/a.bin"));

        assert!(matches!(avc.stage("logs/a.bin", Some(30)).unwrap(), StageOutcome::Unchanged(_)));
        assert!(matches!(avc.stage("./logs/a.bin", None).unwrap(), StageOutcome::Grown(r) if r.num_bytes == 100));
        assert_eq!(avc.local().staged_changes().unwrap().len(), 1);
    }

    #[test]
    fn test_stage_is_idempotent() {
        let (_tmp, mut avc) = setup();
        write(&avc, "a.bin", 10);
        avc.stage("a.bin", None).unwrap();
        let before = avc.local().staged_changes().unwrap();
        avc.stage("a.bin", None).unwrap();
        assert_eq!(avc.local().staged_changes().unwrap(), before);
    }

    #[test]
    fn test_stage_append_after_commit() {
        let (_tmp, mut avc) = setup();
        write(&avc, "a.bin", 100);
        commit_length(&mut avc, "a.bin", 60);

        let outcome = avc.stage("a.bin", None).unwrap();
        let StageOutcome::Created(row) = outcome else {
            panic!("expected new append row");
        };
        assert_eq!(row.change_type, ChangeType::Append);
        assert_eq!(row.start_offset, 60);
        assert_eq!(row.backing_offset, 60);
        assert_eq!(row.num_bytes, 40);

        assert_eq!(
            avc.stage("a.bin", Some(50)).unwrap(),
            StageOutcome::NothingNew {
                committed: 60,
                declared: 50
            }
        );
        assert_eq!(avc.local().staged("a.bin").unwrap().unwrap().num_bytes, 40);
    }

    #[test]
    fn test_stage_declared_exceeds_file() {
        let (_tmp, mut avc) = setup();
        write(&avc, "a.bin", 10);
        assert!(matches!(
            avc.stage("a.bin", Some(11)),
            Err(AvcError::InsufficientBytes {
                declared: 11,
                available: 10,
                ..
            })
        ));
    }

    #[test]
    fn test_stage_rejects_bad_paths() {
        let (_tmp, mut avc) = setup();
        fs::create_dir_all(avc.layout().data_path("dir")).unwrap();
        assert!(matches!(avc.stage("/etc/passwd", None), Err(AvcError::InvalidPath { .. })));
        assert!(matches!(avc.stage("dir", None), Err(AvcError::InvalidPath { .. })));
        assert!(matches!(avc.stage("missing.bin", None), Err(AvcError::InvalidPath { .. })));
    }

    #[test]
    fn test_stale_staged_row_is_a_consistency_fault() {
        let (_tmp, mut avc) = setup();
        write(&avc, "a.bin", 100);
        avc.stage("a.bin", Some(20)).unwrap();
        // Someone commits behind our back without clearing staging.
        let id = commit_length(&mut avc, "a.bin", 50);
        avc.local.put_staged(&StagedChange {
            path: "a.bin".to_string(),
            change_type: ChangeType::Create,
            start_offset: 0,
            num_bytes: 20,
            backing_path: "x".to_string(),
            backing_offset: 0,
        })
        .unwrap();
        assert_eq!(avc.head().unwrap(), Some(id));
        assert!(matches!(avc.stage("a.bin", None), Err(AvcError::Consistency(_))));
    }

    #[test]
    fn test_stage_requires_head_at_main() {
        let (_tmp, mut avc) = setup();
        write(&avc, "a.bin", 10);
        commit_length(&mut avc, "a.bin", 10);
        avc.local.set_head(None).unwrap();
        assert!(matches!(avc.stage("a.bin", None), Err(AvcError::RefMismatch { .. })));
    }

    #[test]
    fn test_reset_staging() {
        let (_tmp, mut avc) = setup();
        write(&avc, "a.bin", 10);
        write(&avc, "b.bin", 10);
        avc.stage("a.bin", None).unwrap();
        avc.stage("b.bin", None).unwrap();
        avc.reset_staging().unwrap();
        assert!(avc.local().staged_changes().unwrap().is_empty());
    }
}
