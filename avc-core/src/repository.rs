//! The `Avc` repository handle
//!
//! Binds a [`Layout`] to one global and one local store. Staging, commit
//! building and apply are implemented on this type in their own modules.

use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{AvcError, Result};
use crate::layout::{require, AvcConfig, Layout};
use crate::object::{Commit, CommitId, StagedChange};
use crate::sqlite_store::{SqliteGlobalStore, SqliteLocalStore};
use crate::store::{GlobalStore, LocalStore};

/// Snapshot of refs and staged work
#[derive(Debug, Clone)]
pub struct Status {
    pub head: Option<CommitId>,
    pub main: Option<CommitId>,
    pub staged: Vec<StagedChange>,
}

impl Status {
    pub fn is_up_to_date(&self) -> bool {
        self.head == self.main
    }
}

/// An open AVC working copy
pub struct Avc<G: GlobalStore = SqliteGlobalStore, L: LocalStore = SqliteLocalStore> {
    pub(crate) layout: Layout,
    pub(crate) global: G,
    pub(crate) local: L,
}

impl Avc<SqliteGlobalStore, SqliteLocalStore> {
    /// Create a fresh `.avc/` under `repo_toplevel`.
    ///
    /// `data_dir` defaults to the repository toplevel.
    pub fn init(repo_toplevel: &Path, data_dir: Option<&Path>) -> Result<Self> {
        let data_toplevel = resolve_data_dir(repo_toplevel, data_dir)?;
        let layout = Layout::new(repo_toplevel, data_toplevel);
        require(&layout.avc_dir(), false)?;

        fs::create_dir(layout.avc_dir())?;
        fs::create_dir(layout.blobs_dir())?;
        let avc = Self::create_stores(layout)?;
        info!("Initialized AVC repository in {}", avc.layout.avc_dir().display());
        Ok(avc)
    }

    /// Attach a fresh working copy to an `.avc/` obtained by cloning.
    pub fn cloned(repo_toplevel: &Path, data_dir: Option<&Path>) -> Result<Self> {
        let data_toplevel = resolve_data_dir(repo_toplevel, data_dir)?;
        let layout = Layout::new(repo_toplevel, data_toplevel);
        require(&layout.avc_dir(), true)?;
        require(&layout.global_db_path(), true)?;
        require(&layout.local_db_path(), false)?;
        require(&layout.config_path(), false)?;
        // git does not carry empty directories
        fs::create_dir_all(layout.blobs_dir())?;

        let avc = Self::create_stores(layout)?;
        info!(
            "Attached working copy to {} (data in {})",
            avc.layout.avc_dir().display(),
            avc.layout.data_toplevel().display()
        );
        Ok(avc)
    }

    /// Open an initialized working copy
    pub fn open(repo_toplevel: &Path) -> Result<Self> {
        let shared = Layout::new(repo_toplevel, repo_toplevel);
        shared.check_shared()?;
        require(&shared.local_db_path(), true)?;
        require(&shared.config_path(), true)?;

        let config = AvcConfig::load(&shared.config_path())?;
        let layout = Layout::new(repo_toplevel, config.data_toplevel);
        let global = SqliteGlobalStore::open(&layout.global_db_path())?;
        let local = SqliteLocalStore::open(&layout.local_db_path())?;
        Ok(Self::with_stores(layout, global, local))
    }

    fn create_stores(layout: Layout) -> Result<Self> {
        let global = SqliteGlobalStore::open(&layout.global_db_path())?;
        let local = SqliteLocalStore::open(&layout.local_db_path())?;
        AvcConfig {
            data_toplevel: layout.data_toplevel().to_path_buf(),
        }
        .save(&layout.config_path())?;
        Ok(Self::with_stores(layout, global, local))
    }
}

fn resolve_data_dir(repo_toplevel: &Path, data_dir: Option<&Path>) -> Result<std::path::PathBuf> {
    let dir = data_dir.unwrap_or(repo_toplevel);
    if !dir.is_dir() {
        return Err(AvcError::Layout(format!(
            "data directory {} does not exist",
            dir.display()
        )));
    }
    Ok(dir.canonicalize()?)
}

impl<G: GlobalStore, L: LocalStore> Avc<G, L> {
    pub fn with_stores(layout: Layout, global: G, local: L) -> Self {
        Self {
            layout,
            global,
            local,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn global(&self) -> &G {
        &self.global
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn head(&self) -> Result<Option<CommitId>> {
        self.local.head_ref()
    }

    pub fn main(&self) -> Result<Option<CommitId>> {
        self.global.main_ref()
    }

    /// Fail unless `HEAD == main`; returns that shared ref
    pub fn ensure_head_is_main(&self) -> Result<Option<CommitId>> {
        let head = self.head()?;
        let main = self.main()?;
        if head != main {
            return Err(AvcError::RefMismatch { head, main });
        }
        Ok(head)
    }

    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            head: self.head()?,
            main: self.main()?,
            staged: self.local.staged_changes()?,
        })
    }

    /// Commits reachable from `main`, newest first
    pub fn log(&self) -> Result<Vec<Commit>> {
        let mut history = Vec::new();
        let mut cursor = self.main()?;
        while let Some(id) = cursor {
            let commit = self
                .global
                .commit(&id)?
                .ok_or_else(|| AvcError::NotFound(id.clone()))?;
            cursor = commit.parent_id.clone();
            history.push(commit);
        }
        Ok(history)
    }

    /// Committed length of a tracked path as seen from `HEAD`
    pub fn committed_length(&self, path: &str) -> Result<Option<u64>> {
        let head = self.head()?;
        self.global.committed_length(head.as_ref(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join(".git")).unwrap();
        tmp
    }

    #[test]
    fn test_init_creates_layout() {
        let repo = git_repo();
        let avc = Avc::init(repo.path(), None).unwrap();
        let layout = avc.layout();
        assert!(layout.global_db_path().is_file());
        assert!(layout.local_db_path().is_file());
        assert!(layout.blobs_dir().is_dir());
        let config = AvcConfig::load(&layout.config_path()).unwrap();
        assert_eq!(config.data_toplevel, repo.path().canonicalize().unwrap());

        let status = avc.status().unwrap();
        assert!(status.is_up_to_date());
        assert!(status.head.is_none());
        assert!(status.staged.is_empty());
        drop(avc);

        assert!(matches!(Avc::init(repo.path(), None), Err(AvcError::Layout(_))));
    }

    #[test]
    fn test_open_reads_config() {
        let repo = git_repo();
        let data = TempDir::new().unwrap();
        drop(Avc::init(repo.path(), Some(data.path())).unwrap());
        let avc = Avc::open(repo.path()).unwrap();
        assert_eq!(avc.layout().data_toplevel(), data.path().canonicalize().unwrap());
    }

    #[test]
    fn test_open_requires_init() {
        let repo = git_repo();
        assert!(matches!(Avc::open(repo.path()), Err(AvcError::Layout(_))));
    }

    #[test]
    fn test_cloned_requires_fresh_local_state() {
        let repo = git_repo();
        drop(Avc::init(repo.path(), None).unwrap());
        // Already has local state and config.
        assert!(matches!(Avc::cloned(repo.path(), None), Err(AvcError::Layout(_))));

        let layout = Layout::new(repo.path(), repo.path());
        fs::remove_file(layout.local_db_path()).unwrap();
        fs::remove_file(layout.config_path()).unwrap();
        fs::remove_dir(layout.blobs_dir()).unwrap();
        let avc = Avc::cloned(repo.path(), None).unwrap();
        assert!(avc.layout().blobs_dir().is_dir());
        assert!(avc.head().unwrap().is_none());
    }

    #[test]
    fn test_missing_data_dir_rejected() {
        let repo = git_repo();
        let missing = repo.path().join("nope");
        assert!(matches!(
            Avc::init(repo.path(), Some(&missing)),
            Err(AvcError::Layout(_))
        ));
    }
}
