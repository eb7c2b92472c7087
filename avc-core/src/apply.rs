//! Apply/checkout engine
//!
//! Replays committed changes onto the working files under the data
//! toplevel. Blobs are consumed as they are applied: create blobs are moved
//! into place and packed append blobs are deleted after their last use.
//! Every step recognizes its own completed state, so an interrupted apply is
//! resumed by running it again.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AvcError, Result};
use crate::layout::Layout;
use crate::object::{ChangeType, CommitChange, CommitId};
use crate::repository::Avc;
use crate::store::{GlobalStore, LocalStore};

/// One planned filesystem step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStep {
    /// Move a whole create blob onto its destination
    Move {
        blob: PathBuf,
        dest: PathBuf,
        num_bytes: u64,
    },
    /// Remove a consumed append blob
    Delete { blob: PathBuf },
    /// Append `len` bytes at `src_offset` of `blob` to `dest`
    AppendBytes {
        blob: PathBuf,
        src_offset: u64,
        len: u64,
        dest: PathBuf,
        dest_offset: u64,
    },
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// The step's effect was already present
    AlreadyApplied,
    /// The blob to delete was already gone
    MissingDeleteTarget,
}

/// Per-commit tally of step outcomes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub commit_id: CommitId,
    pub applied: usize,
    pub already_applied: usize,
    pub missing_delete_targets: usize,
}

impl ApplyReport {
    fn new(commit_id: CommitId) -> Self {
        Self {
            commit_id,
            applied: 0,
            already_applied: 0,
            missing_delete_targets: 0,
        }
    }

    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Applied => self.applied += 1,
            StepOutcome::AlreadyApplied => self.already_applied += 1,
            StepOutcome::MissingDeleteTarget => self.missing_delete_targets += 1,
        }
    }

    pub fn skipped(&self) -> usize {
        self.already_applied + self.missing_delete_targets
    }
}

/// Turn a commit's changes (ascending batch order) into forward I/O steps.
///
/// Rows are scanned newest first so that each append blob's `Delete` lands
/// right after its last consumer once the list is reversed.
pub fn plan_io(layout: &Layout, changes: &[CommitChange]) -> Result<Vec<IoStep>> {
    let mut steps = Vec::with_capacity(changes.len() * 2);
    let mut deleted: HashSet<&str> = HashSet::new();
    for c in changes.iter().rev() {
        let blob = layout.blob_path(&c.blob_name);
        let dest = layout.data_path(&c.path);
        match c.change_type {
            ChangeType::Create => {
                if c.start_offset != 0 || c.blob_offset != 0 {
                    return Err(AvcError::consistency(format!(
                        "create of {} must start at 0 in blob and file (start {}, blob offset {})",
                        c.path, c.start_offset, c.blob_offset
                    )));
                }
                steps.push(IoStep::Move {
                    blob,
                    dest,
                    num_bytes: c.num_bytes,
                });
            }
            ChangeType::Append => {
                if deleted.insert(c.blob_name.as_str()) {
                    steps.push(IoStep::Delete { blob: blob.clone() });
                }
                steps.push(IoStep::AppendBytes {
                    blob,
                    src_offset: c.blob_offset,
                    len: c.num_bytes,
                    dest,
                    dest_offset: c.start_offset,
                });
            }
        }
    }
    steps.reverse();
    Ok(steps)
}

fn file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn move_blob(blob: &Path, dest: &Path, num_bytes: u64) -> Result<StepOutcome> {
    let Some(blob_len) = file_len(blob)? else {
        return match file_len(dest)? {
            Some(len) if len >= num_bytes => {
                warn!(
                    "Blob {} is gone but {} already has {} bytes, skipping move",
                    blob.display(),
                    dest.display(),
                    len
                );
                Ok(StepOutcome::AlreadyApplied)
            }
            _ => Err(AvcError::consistency(format!(
                "blob {} is missing and {} was never created",
                blob.display(),
                dest.display()
            ))),
        };
    };
    if blob_len != num_bytes {
        return Err(AvcError::consistency(format!(
            "blob {} has {} bytes, commit expects {}",
            blob.display(),
            blob_len,
            num_bytes
        )));
    }
    ensure_parent(dest)?;
    match fs::rename(blob, dest) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            fs::copy(blob, dest)?;
            fs::remove_file(blob)?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(StepOutcome::Applied)
}

fn delete_blob(blob: &Path) -> Result<StepOutcome> {
    match fs::remove_file(blob) {
        Ok(()) => Ok(StepOutcome::Applied),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("Tried to delete non-existent blob {}", blob.display());
            Ok(StepOutcome::MissingDeleteTarget)
        }
        Err(e) => Err(e.into()),
    }
}

fn append_bytes(
    blob: &Path,
    src_offset: u64,
    len: u64,
    dest: &Path,
    dest_offset: u64,
) -> Result<StepOutcome> {
    let end = dest_offset + len;
    let dest_len = file_len(dest)?.ok_or_else(|| {
        AvcError::consistency(format!("cannot append to missing file {}", dest.display()))
    })?;

    if !blob.exists() {
        if dest_len >= end {
            warn!(
                "Blob {} is gone but {} already has {} bytes, skipping append",
                blob.display(),
                dest.display(),
                dest_len
            );
            return Ok(StepOutcome::AlreadyApplied);
        }
        return Err(AvcError::consistency(format!(
            "blob {} is missing and {} has only {} of {} bytes",
            blob.display(),
            dest.display(),
            dest_len,
            end
        )));
    }
    if dest_len == end && len > 0 {
        // interrupted after this append, before the blob was deleted
        warn!("{} already ends at {}, skipping append", dest.display(), end);
        return Ok(StepOutcome::AlreadyApplied);
    }
    if dest_len != dest_offset {
        return Err(AvcError::consistency(format!(
            "{} has {} bytes, expected to append at {}",
            dest.display(),
            dest_len,
            dest_offset
        )));
    }

    let mut src = File::open(blob)?;
    src.seek(SeekFrom::Start(src_offset))?;
    let mut out = OpenOptions::new().append(true).open(dest)?;
    let copied = io::copy(&mut src.take(len), &mut out)?;
    if copied != len {
        out.set_len(dest_offset)?;
        return Err(AvcError::consistency(format!(
            "short read from {}: wanted {} bytes at {}, got {}",
            blob.display(),
            len,
            src_offset,
            copied
        )));
    }
    out.sync_all()?;
    Ok(StepOutcome::Applied)
}

/// Run one step
pub fn execute_step(step: &IoStep) -> Result<StepOutcome> {
    match step {
        IoStep::Move {
            blob,
            dest,
            num_bytes,
        } => move_blob(blob, dest, *num_bytes),
        IoStep::Delete { blob } => delete_blob(blob),
        IoStep::AppendBytes {
            blob,
            src_offset,
            len,
            dest,
            dest_offset,
        } => append_bytes(blob, *src_offset, *len, dest, *dest_offset),
    }
}

impl<G: GlobalStore, L: LocalStore> Avc<G, L> {
    /// Replay one commit onto the working files and move `HEAD` to it
    pub fn apply_commit(&mut self, id: &CommitId) -> Result<ApplyReport> {
        let changes = self.global.changes(id)?;
        if changes.is_empty() {
            return Err(AvcError::consistency(format!("commit {} has no changes", id)));
        }
        let steps = plan_io(&self.layout, &changes)?;

        let mut report = ApplyReport::new(id.clone());
        for step in &steps {
            debug!("{:?}", step);
            report.record(execute_step(step)?);
        }
        self.local.set_head(Some(id))?;
        info!(
            "Applied {} ({} steps, {} skipped)",
            id,
            steps.len(),
            report.skipped()
        );
        Ok(report)
    }

    /// Apply every commit between `HEAD` and `main`, oldest first
    pub fn fast_forward(&mut self) -> Result<Vec<ApplyReport>> {
        let staged = self.local.staged_changes()?;
        if !staged.is_empty() {
            return Err(AvcError::StagingNotEmpty(staged.len()));
        }
        let head = self.head()?;
        let main = self.main()?;
        let pending = self.global.commits_between(head.as_ref(), main.as_ref())?;
        if pending.is_empty() {
            info!("Already up to date");
        }
        pending.iter().map(|id| self.apply_commit(id)).collect()
    }

    /// Remove the tip commit and rewind both refs to its parent.
    ///
    /// Returns the removed commit, or `None` when `HEAD` is null. Staged rows
    /// hold offsets relative to the tip, so staging must be empty. The
    /// commit's blobs are left where they are.
    pub fn abort_last_commit(&mut self) -> Result<Option<CommitId>> {
        if self.head()?.is_none() {
            info!("No commits to abort");
            return Ok(None);
        }
        let staged = self.local.staged_changes()?;
        if !staged.is_empty() {
            return Err(AvcError::StagingNotEmpty(staged.len()));
        }
        let Some(tip) = self.ensure_head_is_main()? else {
            return Ok(None);
        };
        let parent = self.global.parent_of(&tip)?;
        self.local.set_head(parent.as_ref())?;
        self.global.remove_commit(&tip, parent.as_ref())?;
        info!("Aborted commit {}", tip);
        Ok(Some(tip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::{MemoryGlobalStore, MemoryLocalStore};
    use crate::object::Commit;
    use tempfile::TempDir;

    type MemAvc = Avc<MemoryGlobalStore, MemoryLocalStore>;

    fn setup(tmp: &TempDir) -> MemAvc {
        let layout = Layout::new(tmp.path().join("repo"), tmp.path().join("data"));
        fs::create_dir_all(layout.blobs_dir()).unwrap();
        fs::create_dir_all(layout.data_toplevel()).unwrap();
        Avc::with_stores(layout, MemoryGlobalStore::new(), MemoryLocalStore::new())
    }

    fn change(
        id: &CommitId,
        batch: u64,
        path: &str,
        start: u64,
        len: u64,
        blob: u64,
        blob_offset: u64,
    ) -> CommitChange {
        CommitChange {
            commit_id: id.clone(),
            batch_id: batch,
            path: path.to_string(),
            change_type: if start == 0 { ChangeType::Create } else { ChangeType::Append },
            start_offset: start,
            num_bytes: len,
            blob_name: id.blob_name(blob),
            blob_offset,
        }
    }

    fn put_blob(avc: &MemAvc, id: &CommitId, seq: u64, data: &[u8]) {
        let path = avc.layout().blob_path(&id.blob_name(seq));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    /// Commit 1 creates `a` (4 bytes) and `dir/b` (3 bytes); commit 2 appends
    /// to both from one packed blob.
    fn two_commits(avc: &mut MemAvc) -> (CommitId, CommitId) {
        let c1 = CommitId::compute(None, "t1", "h", ["1"]);
        let c2 = CommitId::compute(Some(&c1), "t2", "h", ["2"]);
        avc.global
            .record_commit(
                &Commit::new(c1.clone(), None),
                &[change(&c1, 0, "a", 0, 4, 0, 0), change(&c1, 0, "dir/b", 0, 3, 1, 0)],
            )
            .unwrap();
        avc.global
            .record_commit(
                &Commit::new(c2.clone(), Some(c1.clone())),
                &[change(&c2, 0, "a", 4, 2, 0, 0), change(&c2, 1, "dir/b", 3, 5, 0, 2)],
            )
            .unwrap();
        put_blob(avc, &c1, 0, b"AAAA");
        put_blob(avc, &c1, 1, b"BBB");
        put_blob(avc, &c2, 0, b"aabbbbb");
        (c1, c2)
    }

    #[test]
    fn test_plan_io_deletes_after_last_consumer() {
        let tmp = TempDir::new().unwrap();
        let avc = setup(&tmp);
        let id = CommitId::new("ab00");
        let changes = vec![
            change(&id, 0, "x", 0, 5, 0, 0),
            change(&id, 1, "y", 7, 2, 1, 0),
            change(&id, 2, "z", 3, 4, 1, 2),
            change(&id, 3, "y", 9, 1, 2, 0),
        ];
        let steps = plan_io(avc.layout(), &changes).unwrap();
        let kinds: Vec<&str> = steps
            .iter()
            .map(|s| match s {
                IoStep::Move { .. } => "move",
                IoStep::Delete { .. } => "delete",
                IoStep::AppendBytes { .. } => "append",
            })
            .collect();
        assert_eq!(kinds, vec!["move", "append", "append", "delete", "append", "delete"]);
        assert_eq!(
            steps[3],
            IoStep::Delete {
                blob: avc.layout().blob_path(&id.blob_name(1))
            }
        );
    }

    #[test]
    fn test_plan_io_rejects_offset_create() {
        let tmp = TempDir::new().unwrap();
        let avc = setup(&tmp);
        let id = CommitId::new("ab00");
        let mut bad = change(&id, 0, "x", 0, 5, 0, 0);
        bad.blob_offset = 1;
        assert!(matches!(plan_io(avc.layout(), &[bad]), Err(AvcError::Consistency(_))));
    }

    #[test]
    fn test_fast_forward_reconstructs_files() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (c1, c2) = two_commits(&mut avc);

        let reports = avc.fast_forward().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].commit_id, c1);
        assert_eq!(avc.head().unwrap(), Some(c2.clone()));
        assert_eq!(fs::read(avc.layout().data_path("a")).unwrap(), b"AAAAaa");
        assert_eq!(fs::read(avc.layout().data_path("dir/b")).unwrap(), b"BBBbbbbb");
        for (id, seq) in [(&c1, 0), (&c1, 1), (&c2, 0)] {
            assert!(!avc.layout().blob_path(&id.blob_name(seq)).exists());
        }
        assert!(avc.fast_forward().unwrap().is_empty());
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (c1, c2) = two_commits(&mut avc);
        avc.apply_commit(&c1).unwrap();
        avc.apply_commit(&c2).unwrap();

        let again = avc.apply_commit(&c1).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.already_applied, 2);
        let again = avc.apply_commit(&c2).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.already_applied, 2);
        assert_eq!(again.missing_delete_targets, 1);
        assert_eq!(fs::read(avc.layout().data_path("a")).unwrap(), b"AAAAaa");
    }

    #[test]
    fn test_resume_after_interrupted_pack() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (c1, c2) = two_commits(&mut avc);
        avc.apply_commit(&c1).unwrap();

        // Only the first append of c2 made it before the interruption.
        let steps = plan_io(avc.layout(), &avc.global().changes(&c2).unwrap()).unwrap();
        assert_eq!(execute_step(&steps[0]).unwrap(), StepOutcome::Applied);

        let report = avc.apply_commit(&c2).unwrap();
        assert_eq!(report.already_applied, 1);
        assert_eq!(fs::read(avc.layout().data_path("dir/b")).unwrap(), b"BBBbbbbb");
        assert_eq!(fs::read(avc.layout().data_path("a")).unwrap(), b"AAAAaa");
    }

    #[test]
    fn test_append_to_wrong_length_is_a_fault() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (c1, c2) = two_commits(&mut avc);
        avc.apply_commit(&c1).unwrap();
        fs::write(avc.layout().data_path("a"), b"AAAAAAAAAA").unwrap();
        assert!(matches!(avc.apply_commit(&c2), Err(AvcError::Consistency(_))));
        assert_eq!(avc.head().unwrap(), Some(c1));
    }

    #[test]
    fn test_short_blob_is_a_fault() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (c1, c2) = two_commits(&mut avc);
        avc.apply_commit(&c1).unwrap();
        put_blob(&avc, &c2, 0, b"aab");
        assert!(matches!(avc.apply_commit(&c2), Err(AvcError::Consistency(_))));
        // The partial append of dir/b was rolled back.
        assert_eq!(fs::read(avc.layout().data_path("dir/b")).unwrap(), b"BBB");
    }

    #[test]
    fn test_move_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (c1, _) = two_commits(&mut avc);
        put_blob(&avc, &c1, 0, b"AAAAA");
        assert!(matches!(avc.apply_commit(&c1), Err(AvcError::Consistency(_))));
    }

    #[test]
    fn test_apply_unknown_commit() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        assert!(matches!(
            avc.apply_commit(&CommitId::new("ff")),
            Err(AvcError::Consistency(_))
        ));
    }

    #[test]
    fn test_fast_forward_requires_empty_staging() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        fs::write(avc.layout().data_path("f"), b"x").unwrap();
        avc.stage("f", None).unwrap();
        assert!(matches!(avc.fast_forward(), Err(AvcError::StagingNotEmpty(1))));
    }

    #[test]
    fn test_fast_forward_not_ancestor() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        two_commits(&mut avc);
        let stray = CommitId::compute(None, "x", "y", ["z"]);
        avc.local.set_head(Some(&stray)).unwrap();
        assert!(matches!(avc.fast_forward(), Err(AvcError::NotAncestor { .. })));
    }

    #[test]
    fn test_abort_last_commit() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        assert_eq!(avc.abort_last_commit().unwrap(), None);

        let (c1, c2) = two_commits(&mut avc);
        avc.local.set_head(Some(&c2)).unwrap();
        assert_eq!(avc.abort_last_commit().unwrap(), Some(c2.clone()));
        assert_eq!(avc.head().unwrap(), Some(c1.clone()));
        assert_eq!(avc.main().unwrap(), Some(c1.clone()));
        assert!(avc.global().commit(&c2).unwrap().is_none());
        assert!(avc.global().changes(&c2).unwrap().is_empty());

        assert_eq!(avc.abort_last_commit().unwrap(), Some(c1));
        assert_eq!(avc.head().unwrap(), None);
        assert_eq!(avc.main().unwrap(), None);
    }

    #[test]
    fn test_abort_with_null_head_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (_, c2) = two_commits(&mut avc);
        assert_eq!(avc.head().unwrap(), None);

        assert_eq!(avc.abort_last_commit().unwrap(), None);
        assert_eq!(avc.main().unwrap(), Some(c2.clone()));
        assert!(avc.global().commit(&c2).unwrap().is_some());
    }

    #[test]
    fn test_abort_requires_empty_staging() {
        let tmp = TempDir::new().unwrap();
        let mut avc = setup(&tmp);
        let (_, c2) = two_commits(&mut avc);
        avc.local.set_head(Some(&c2)).unwrap();
        fs::write(avc.layout().data_path("a"), b"AAAAaaXY").unwrap();
        avc.stage("a", None).unwrap();

        assert!(matches!(avc.abort_last_commit(), Err(AvcError::StagingNotEmpty(1))));
        assert_eq!(avc.main().unwrap(), Some(c2));
    }
}
