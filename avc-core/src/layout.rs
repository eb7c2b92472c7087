//! On-disk layout of an AVC repository
//!
//! Everything lives under `.avc/` at the git toplevel:
//!
//! ```text
//! .avc/
//!   global_state.db       shared metadata
//!   local_state.db        private metadata
//!   blobs/                blob tree
//!   config.json           {"data_toplevel": "..."}
//!   git_operations.json   last operation plan
//! ```
//!
//! Tracked data files live under a separate *data toplevel*, which may be the
//! repository itself or any other directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{AvcError, Result};

pub const AVC_DIR: &str = ".avc";
pub const GLOBAL_DB_FILE: &str = "global_state.db";
pub const LOCAL_DB_FILE: &str = "local_state.db";
pub const BLOBS_DIR: &str = "blobs";
pub const CONFIG_FILE: &str = "config.json";
pub const PLAN_FILE: &str = "git_operations.json";

/// Per-clone settings persisted in `.avc/config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvcConfig {
    /// Absolute directory tracked paths are relative to
    pub data_toplevel: PathBuf,
}

impl AvcConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Resolved paths of one working copy
#[derive(Debug, Clone)]
pub struct Layout {
    repo_toplevel: PathBuf,
    data_toplevel: PathBuf,
}

impl Layout {
    pub fn new(repo_toplevel: impl Into<PathBuf>, data_toplevel: impl Into<PathBuf>) -> Self {
        Self {
            repo_toplevel: repo_toplevel.into(),
            data_toplevel: data_toplevel.into(),
        }
    }

    pub fn repo_toplevel(&self) -> &Path {
        &self.repo_toplevel
    }

    pub fn data_toplevel(&self) -> &Path {
        &self.data_toplevel
    }

    pub fn avc_dir(&self) -> PathBuf {
        self.repo_toplevel.join(AVC_DIR)
    }

    pub fn global_db_path(&self) -> PathBuf {
        self.avc_dir().join(GLOBAL_DB_FILE)
    }

    pub fn local_db_path(&self) -> PathBuf {
        self.avc_dir().join(LOCAL_DB_FILE)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.avc_dir().join(BLOBS_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.avc_dir().join(CONFIG_FILE)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.avc_dir().join(PLAN_FILE)
    }

    /// Local path of a blob
    pub fn blob_path(&self, blob_name: &str) -> PathBuf {
        self.blobs_dir().join(blob_name)
    }

    /// Repository-relative path of a blob, as written into operation plans
    pub fn blob_repo_path(blob_name: &str) -> String {
        format!("{}/{}/{}", AVC_DIR, BLOBS_DIR, blob_name)
    }

    /// Repository-relative path of the global store file
    pub fn global_db_repo_path() -> String {
        format!("{}/{}", AVC_DIR, GLOBAL_DB_FILE)
    }

    /// Local file backing a tracked path
    pub fn data_path(&self, tracked: &str) -> PathBuf {
        self.data_toplevel.join(tracked)
    }

    /// Check that the shared pieces of `.avc/` are present
    pub fn check_shared(&self) -> Result<()> {
        require(&self.avc_dir(), true)?;
        require(&self.global_db_path(), true)?;
        require(&self.blobs_dir(), true)
    }
}

/// Fail with a layout error unless `path` exists (`want == true`) or is
/// absent (`want == false`).
pub(crate) fn require(path: &Path, want: bool) -> Result<()> {
    match (path.exists(), want) {
        (false, true) => Err(AvcError::Layout(format!("{} does not exist", path.display()))),
        (true, false) => Err(AvcError::Layout(format!("{} already exists", path.display()))),
        _ => Ok(()),
    }
}

/// Normalize a user-supplied tracked path into its canonical relative form.
///
/// `.` components are dropped and `..` pops a previous component; paths that
/// are absolute or escape the data toplevel are rejected.
pub fn normalize_tracked_path(path: &str) -> Result<String> {
    let invalid = |reason: &str| AvcError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| invalid("not valid UTF-8"))?;
                parts.push(part.to_string());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(invalid("escapes the data toplevel"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("must be relative to the data toplevel"));
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(parts.join("/"))
}

/// Walk up from `start` to the nearest directory containing `.git`
pub fn discover_toplevel(start: &Path) -> Result<PathBuf> {
    let start = start.canonicalize()?;
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            AvcError::Layout(format!("{} is not inside a git repository", start.display()))
        })
}
