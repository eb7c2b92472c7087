//! In-memory store implementations
//!
//! Used by engine unit tests and anywhere a throwaway repository is enough.

use std::collections::HashMap;

use crate::error::{AvcError, Result};
use crate::object::{Commit, CommitChange, CommitId, StagedChange};
use crate::store::{GlobalStore, LocalStore};

/// In-memory global store
#[derive(Debug, Default)]
pub struct MemoryGlobalStore {
    commits: HashMap<CommitId, Commit>,
    changes: HashMap<CommitId, Vec<CommitChange>>,
    main: Option<CommitId>,
}

impl MemoryGlobalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalStore for MemoryGlobalStore {
    fn main_ref(&self) -> Result<Option<CommitId>> {
        Ok(self.main.clone())
    }

    fn commit(&self, id: &CommitId) -> Result<Option<Commit>> {
        Ok(self.commits.get(id).cloned())
    }

    fn latest_change(&self, commit: &CommitId, path: &str) -> Result<Option<CommitChange>> {
        Ok(self
            .changes
            .get(commit)
            .and_then(|rows| {
                rows.iter()
                    .filter(|c| c.path == path)
                    .max_by_key(|c| c.batch_id)
            })
            .cloned())
    }

    fn changes(&self, commit: &CommitId) -> Result<Vec<CommitChange>> {
        let mut rows = self.changes.get(commit).cloned().unwrap_or_default();
        rows.sort_by(|a, b| (a.batch_id, &a.path).cmp(&(b.batch_id, &b.path)));
        Ok(rows)
    }

    fn record_commit(&mut self, commit: &Commit, changes: &[CommitChange]) -> Result<()> {
        if self.commits.contains_key(&commit.id) {
            return Err(AvcError::Database(format!("duplicate commit {}", commit.id)));
        }
        self.commits.insert(commit.id.clone(), commit.clone());
        self.changes.insert(commit.id.clone(), changes.to_vec());
        self.main = Some(commit.id.clone());
        Ok(())
    }

    fn remove_commit(&mut self, id: &CommitId, new_main: Option<&CommitId>) -> Result<()> {
        if self.commits.remove(id).is_none() {
            return Err(AvcError::NotFound(id.clone()));
        }
        self.changes.remove(id);
        self.main = new_main.cloned();
        Ok(())
    }
}

/// In-memory local store
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    staged: Vec<StagedChange>,
    head: Option<CommitId>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn head_ref(&self) -> Result<Option<CommitId>> {
        Ok(self.head.clone())
    }

    fn set_head(&mut self, head: Option<&CommitId>) -> Result<()> {
        self.head = head.cloned();
        Ok(())
    }

    fn staged(&self, path: &str) -> Result<Option<StagedChange>> {
        Ok(self.staged.iter().find(|s| s.path == path).cloned())
    }

    fn staged_changes(&self) -> Result<Vec<StagedChange>> {
        Ok(self.staged.clone())
    }

    fn put_staged(&mut self, change: &StagedChange) -> Result<()> {
        match self.staged.iter_mut().find(|s| s.path == change.path) {
            Some(existing) => existing.num_bytes = change.num_bytes,
            None => self.staged.push(change.clone()),
        }
        Ok(())
    }

    fn clear_staged(&mut self) -> Result<()> {
        self.staged.clear();
        Ok(())
    }

    fn complete_commit(&mut self, head: &CommitId) -> Result<()> {
        self.head = Some(head.clone());
        self.staged.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ChangeType;

    fn commit_with(
        store: &mut MemoryGlobalStore,
        parent: Option<&CommitId>,
        tag: &str,
        rows: &[(&str, u64, u64)],
    ) -> CommitId {
        let id = CommitId::compute(parent, tag, "host", [tag]);
        let changes: Vec<CommitChange> = rows
            .iter()
            .enumerate()
            .map(|(i, (path, start, len))| CommitChange {
                commit_id: id.clone(),
                batch_id: i as u64,
                path: path.to_string(),
                change_type: if *start == 0 { ChangeType::Create } else { ChangeType::Append },
                start_offset: *start,
                num_bytes: *len,
                blob_name: id.blob_name(i as u64),
                blob_offset: 0,
            })
            .collect();
        store
            .record_commit(&Commit::new(id.clone(), parent.cloned()), &changes)
            .unwrap();
        id
    }

    #[test]
    fn test_committed_length_walks_ancestry() {
        let mut store = MemoryGlobalStore::new();
        let c1 = commit_with(&mut store, None, "c1", &[("a", 0, 10), ("b", 0, 3)]);
        let c2 = commit_with(&mut store, Some(&c1), "c2", &[("a", 10, 5)]);
        let c3 = commit_with(&mut store, Some(&c2), "c3", &[("c", 0, 7)]);

        assert_eq!(store.committed_length(Some(&c3), "a").unwrap(), Some(15));
        assert_eq!(store.committed_length(Some(&c3), "b").unwrap(), Some(3));
        assert_eq!(store.committed_length(Some(&c1), "a").unwrap(), Some(10));
        assert_eq!(store.committed_length(Some(&c1), "c").unwrap(), None);
        assert_eq!(store.committed_length(None, "a").unwrap(), None);
    }

    #[test]
    fn test_commits_between() {
        let mut store = MemoryGlobalStore::new();
        let c1 = commit_with(&mut store, None, "c1", &[("a", 0, 1)]);
        let c2 = commit_with(&mut store, Some(&c1), "c2", &[("a", 1, 1)]);
        let c3 = commit_with(&mut store, Some(&c2), "c3", &[("a", 2, 1)]);

        assert_eq!(
            store.commits_between(Some(&c1), Some(&c3)).unwrap(),
            vec![c2.clone(), c3.clone()]
        );
        assert!(store.commits_between(Some(&c3), Some(&c3)).unwrap().is_empty());
        assert!(store.commits_between(None, None).unwrap().is_empty());

        let stray = CommitId::compute(None, "elsewhere", "host", ["x"]);
        assert!(matches!(
            store.commits_between(Some(&stray), Some(&c3)),
            Err(AvcError::NotAncestor { .. })
        ));
    }

    #[test]
    fn test_put_staged_keeps_position() {
        let mut store = MemoryLocalStore::new();
        let mut first = StagedChange {
            path: "one".to_string(),
            change_type: ChangeType::Create,
            start_offset: 0,
            num_bytes: 1,
            backing_path: "/d/one".to_string(),
            backing_offset: 0,
        };
        let second = StagedChange { path: "two".to_string(), ..first.clone() };
        store.put_staged(&first).unwrap();
        store.put_staged(&second).unwrap();
        first.num_bytes = 4;
        store.put_staged(&first).unwrap();

        let rows = store.staged_changes().unwrap();
        assert_eq!(rows[0].path, "one");
        assert_eq!(rows[0].num_bytes, 4);
        assert_eq!(rows[1].path, "two");
    }
}
