//! Storage abstraction layer for AVC
//!
//! Two independent transactional stores back the engine:
//! - the **global** store travels with the repository: commits, their
//!   changes, and the shared `main` ref;
//! - the **local** store is private to one working copy: staged changes and
//!   the `HEAD` ref.
//!
//! Every mutating method is atomic within its store.

use crate::error::{AvcError, Result};
use crate::object::{Commit, CommitChange, CommitId, StagedChange};

/// Name of the shared ref in the global store
pub const MAIN_REF: &str = "main";

/// Name of the working-copy ref in the local store
pub const HEAD_REF: &str = "HEAD";

/// Shared commit graph store
pub trait GlobalStore {
    /// Current value of the `main` ref
    fn main_ref(&self) -> Result<Option<CommitId>>;

    /// Look up a commit record
    fn commit(&self, id: &CommitId) -> Result<Option<Commit>>;

    /// The highest-batch change to `path` within `commit`, if any
    fn latest_change(&self, commit: &CommitId, path: &str) -> Result<Option<CommitChange>>;

    /// Every change of `commit`, ordered by ascending batch id
    fn changes(&self, commit: &CommitId) -> Result<Vec<CommitChange>>;

    /// Insert a commit with its changes and point `main` at it
    fn record_commit(&mut self, commit: &Commit, changes: &[CommitChange]) -> Result<()>;

    /// Delete a commit with its changes and point `main` at `new_main`
    fn remove_commit(&mut self, id: &CommitId, new_main: Option<&CommitId>) -> Result<()>;

    /// Parent of `id`; unknown commits are an error
    fn parent_of(&self, id: &CommitId) -> Result<Option<CommitId>> {
        self.commit(id)?
            .map(|c| c.parent_id)
            .ok_or_else(|| AvcError::NotFound(id.clone()))
    }

    /// Committed length of `path` as seen from `tip`.
    ///
    /// Walks the ancestry chain and stops at the first commit touching the
    /// path. `None` means the path was never committed.
    fn committed_length(&self, tip: Option<&CommitId>, path: &str) -> Result<Option<u64>> {
        let mut cursor = tip.cloned();
        while let Some(id) = cursor {
            if let Some(change) = self.latest_change(&id, path)? {
                return Ok(Some(change.end_offset()));
            }
            cursor = self.parent_of(&id)?;
        }
        Ok(None)
    }

    /// Commits strictly after `ancestor` up to and including `tip`,
    /// oldest first.
    fn commits_between(
        &self,
        ancestor: Option<&CommitId>,
        tip: Option<&CommitId>,
    ) -> Result<Vec<CommitId>> {
        let mut chain = Vec::new();
        let mut cursor = tip.cloned();
        while cursor.as_ref() != ancestor {
            match cursor {
                Some(id) => {
                    cursor = self.parent_of(&id)?;
                    chain.push(id);
                }
                None => {
                    return Err(AvcError::NotAncestor {
                        head: ancestor.cloned(),
                        main: tip.cloned(),
                    });
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }
}

/// Private working-copy store
pub trait LocalStore {
    /// Current value of the `HEAD` ref
    fn head_ref(&self) -> Result<Option<CommitId>>;

    fn set_head(&mut self, head: Option<&CommitId>) -> Result<()>;

    /// Staged change for `path`, if any
    fn staged(&self, path: &str) -> Result<Option<StagedChange>>;

    /// All staged changes in the order they were first staged
    fn staged_changes(&self) -> Result<Vec<StagedChange>>;

    /// Insert a staged change, or update the existing row for its path
    /// in place (keeping its position in staged order).
    fn put_staged(&mut self, change: &StagedChange) -> Result<()>;

    fn clear_staged(&mut self) -> Result<()>;

    /// Advance `HEAD` and drop all staged changes in one transaction
    fn complete_commit(&mut self, head: &CommitId) -> Result<()>;
}
