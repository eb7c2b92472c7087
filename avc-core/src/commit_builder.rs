//! Commit builder
//!
//! Seals the staged set into a commit: computes its id, splits oversize
//! changes, packs appends into shared blobs and emits the operations an
//! uploader must run to place those blobs in the remote repository.

use tracing::{debug, info};

use crate::error::{AvcError, Result};
use crate::layout::Layout;
use crate::object::{ChangeType, Commit, CommitChange, CommitId, StagedChange};
use crate::operation::{save_plan, ReadSource, VirtualAddOperation};
use crate::repository::Avc;
use crate::store::{GlobalStore, LocalStore};

/// Default upper bound on the size of one blob (48 GB)
pub const MAX_BLOB_SIZE: u64 = 48_000_000_000;

/// Outcome of [`CommitBuilder::build`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPlan {
    /// `None` when nothing was staged
    pub commit_id: Option<CommitId>,
    pub changes: Vec<CommitChange>,
    pub operations: Vec<VirtualAddOperation>,
}

impl CommitPlan {
    fn empty() -> Self {
        Self {
            commit_id: None,
            changes: Vec::new(),
            operations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commit_id.is_none()
    }
}

/// Builds commits from the staged set
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    max_blob_size: u64,
}

impl Default for CommitBuilder {
    fn default() -> Self {
        Self {
            max_blob_size: MAX_BLOB_SIZE,
        }
    }
}

impl CommitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_blob_size(mut self, max_blob_size: u64) -> Self {
        self.max_blob_size = max_blob_size;
        self
    }

    /// Build the next commit from everything staged in `avc`.
    ///
    /// With `dry_run` the plan is computed and written out but neither store
    /// is touched.
    pub fn build<G: GlobalStore, L: LocalStore>(
        &self,
        avc: &mut Avc<G, L>,
        dry_run: bool,
    ) -> Result<CommitPlan> {
        if self.max_blob_size == 0 {
            return Err(AvcError::InvalidState("max blob size must be positive".to_string()));
        }
        let parent = avc.ensure_head_is_main()?;
        let staged = avc.local.staged_changes()?;
        if staged.is_empty() {
            info!("No staged changes");
            return Ok(CommitPlan::empty());
        }
        for s in &staged {
            check_contiguous(&avc.global, parent.as_ref(), s)?;
        }

        let timestamp = commit_timestamp();
        let host = host_name();
        let lines: Vec<String> = staged.iter().map(StagedChange::canonical_line).collect();
        let commit_id = CommitId::compute(
            parent.as_ref(),
            &timestamp,
            &host,
            lines.iter().map(String::as_str),
        );
        info!("Building commit {}", commit_id);

        let (creates, appends) = split_oversize(staged, self.max_blob_size);
        let (changes, mut operations) = pack(&commit_id, creates, appends, self.max_blob_size);
        debug!(
            "Commit {} packs {} changes into {} blobs",
            commit_id,
            changes.len(),
            operations.len()
        );

        if !dry_run {
            let commit = Commit::new(commit_id.clone(), parent);
            avc.global.record_commit(&commit, &changes)?;
            avc.local.complete_commit(&commit_id)?;
            info!("Advanced main and HEAD to {}", commit_id);
        }

        operations.push(VirtualAddOperation::Direct {
            repo_path: Layout::global_db_repo_path(),
            local_path: avc.layout.global_db_path().to_string_lossy().into_owned(),
        });
        save_plan(&avc.layout.plan_path(), &operations)?;

        Ok(CommitPlan {
            commit_id: Some(commit_id),
            changes,
            operations,
        })
    }
}

impl<G: GlobalStore, L: LocalStore> Avc<G, L> {
    /// Build a commit with the default blob size limit
    pub fn build_commit(&mut self, dry_run: bool) -> Result<CommitPlan> {
        CommitBuilder::default().build(self, dry_run)
    }
}

/// A staged row must start exactly where the committed history of its path ends
fn check_contiguous<G: GlobalStore>(
    global: &G,
    parent: Option<&CommitId>,
    staged: &StagedChange,
) -> Result<()> {
    let committed = global.committed_length(parent, &staged.path)?;
    let expected = match committed {
        None => (ChangeType::Create, 0),
        Some(len) => (ChangeType::Append, len),
    };
    if (staged.change_type, staged.start_offset) != expected {
        return Err(AvcError::consistency(format!(
            "staged {} of {} at offset {} does not continue the committed {} bytes",
            staged.change_type,
            staged.path,
            staged.start_offset,
            committed.unwrap_or(0)
        )));
    }
    Ok(())
}

/// Local wall-clock time in ISO-8601 with microseconds
fn commit_timestamp() -> String {
    chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Partition staged changes into creates and appends, none longer than `max`.
///
/// The tail of an oversize create becomes an append; oversize appends are
/// split repeatedly. Every remainder is queued after the staged appends, so
/// the fragments of one path stay in ascending offset order.
pub fn split_oversize(
    staged: Vec<StagedChange>,
    max: u64,
) -> (Vec<StagedChange>, Vec<StagedChange>) {
    let (mut creates, mut appends): (Vec<_>, Vec<_>) = staged
        .into_iter()
        .partition(|s| s.change_type == ChangeType::Create);

    for create in &mut creates {
        if let Some(rest) = create.split_at(max) {
            appends.push(rest);
        }
    }
    let mut i = 0;
    while i < appends.len() {
        if let Some(rest) = appends[i].split_at(max) {
            appends.push(rest);
        }
        i += 1;
    }
    (creates, appends)
}

/// Blob currently being filled with appends
struct OpenBlob {
    name: String,
    size: u64,
    sources: Vec<ReadSource>,
}

impl OpenBlob {
    fn seal(self) -> VirtualAddOperation {
        VirtualAddOperation::Concatenating {
            repo_path: Layout::blob_repo_path(&self.name),
            sources: self.sources,
        }
    }
}

/// Assign batch ids and blobs to already split changes.
///
/// Every create gets a blob of its own in batch 0. Appends are packed in
/// order into shared blobs of at most `max` bytes, one batch per append.
pub fn pack(
    commit_id: &CommitId,
    creates: Vec<StagedChange>,
    appends: Vec<StagedChange>,
    max: u64,
) -> (Vec<CommitChange>, Vec<VirtualAddOperation>) {
    let mut next_blob = 0u64;
    let mut alloc_blob = || {
        let name = commit_id.blob_name(next_blob);
        next_blob += 1;
        name
    };

    let mut changes = Vec::with_capacity(creates.len() + appends.len());
    let mut operations = Vec::new();
    let mut batch_id = 0u64;

    if !creates.is_empty() {
        for s in creates {
            let blob_name = alloc_blob();
            operations.push(VirtualAddOperation::Concatenating {
                repo_path: Layout::blob_repo_path(&blob_name),
                sources: vec![ReadSource::new(&s.backing_path, s.backing_offset, s.num_bytes)],
            });
            changes.push(CommitChange {
                commit_id: commit_id.clone(),
                batch_id,
                path: s.path,
                change_type: ChangeType::Create,
                start_offset: 0,
                num_bytes: s.num_bytes,
                blob_name,
                blob_offset: 0,
            });
        }
        batch_id += 1;
    }

    let mut current: Option<OpenBlob> = None;
    for s in appends {
        let mut blob = match current.take() {
            Some(open) if open.size + s.num_bytes > max => {
                operations.push(open.seal());
                OpenBlob {
                    name: alloc_blob(),
                    size: 0,
                    sources: Vec::new(),
                }
            }
            Some(open) => open,
            None => OpenBlob {
                name: alloc_blob(),
                size: 0,
                sources: Vec::new(),
            },
        };
        changes.push(CommitChange {
            commit_id: commit_id.clone(),
            batch_id,
            path: s.path,
            change_type: ChangeType::Append,
            start_offset: s.start_offset,
            num_bytes: s.num_bytes,
            blob_name: blob.name.clone(),
            blob_offset: blob.size,
        });
        blob.sources
            .push(ReadSource::new(s.backing_path, s.backing_offset, s.num_bytes));
        blob.size += s.num_bytes;
        batch_id += 1;
        current = Some(blob);
    }
    if let Some(open) = current {
        if !open.sources.is_empty() {
            operations.push(open.seal());
        }
    }

    (changes, operations)
}
