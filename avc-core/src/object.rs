//! Core object model for AVC
//!
//! Commits, committed changes and staged changes. Unlike a content-addressed
//! object store, a commit id hashes *when* and *where* a change set was
//! sealed as well as what it contains, so two commits of an identical change
//! set never share an id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::AvcError;

/// Sentinel hashed in place of a parent id for root commits
pub const ROOT_PARENT_SENTINEL: &str = "n/a";

/// Hex SHA-256 identifier of a commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    /// Wrap an existing hex id without validation (ids read back from a store)
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Compute a commit id from its identity inputs.
    ///
    /// Each component is newline terminated; `staged_lines` are the canonical
    /// forms of the staged rows, in staged order.
    pub fn compute<'a>(
        parent: Option<&CommitId>,
        timestamp: &str,
        host: &str,
        staged_lines: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut sha = Sha256::new();
        match parent {
            Some(p) => sha.update(p.as_str().as_bytes()),
            None => sha.update(ROOT_PARENT_SENTINEL.as_bytes()),
        }
        sha.update(b"\n");
        sha.update(timestamp.as_bytes());
        sha.update(b"\n");
        sha.update(host.as_bytes());
        sha.update(b"\n");
        for line in staged_lines {
            sha.update(line.as_bytes());
            sha.update(b"\n");
        }
        Self(hex::encode(sha.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two character directory prefix used for blob fan-out
    pub fn prefix(&self) -> &str {
        let end = self.0.len().min(2);
        &self.0[..end]
    }

    /// Name of the `seq`-th blob allocated by this commit
    pub fn blob_name(&self, seq: u64) -> String {
        format!("{}/{}-blob-{}", self.prefix(), self.0, seq)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of change recorded for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Append,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Append => "append",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = AvcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeType::Create),
            "append" => Ok(ChangeType::Append),
            other => Err(AvcError::consistency(format!("unknown change type: {}", other))),
        }
    }
}

/// Commit record: an id and its single parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub parent_id: Option<CommitId>,
}

impl Commit {
    pub fn new(id: CommitId, parent_id: Option<CommitId>) -> Self {
        Self { id, parent_id }
    }

}

/// One committed byte range of one path, and where its bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitChange {
    pub commit_id: CommitId,
    /// Replay order within the commit
    pub batch_id: u64,
    pub path: String,
    pub change_type: ChangeType,
    /// Offset within the logical tracked file
    pub start_offset: u64,
    pub num_bytes: u64,
    /// Blob name relative to the blob directory
    pub blob_name: String,
    /// Offset within the physical blob
    pub blob_offset: u64,
}

impl CommitChange {
    /// Logical file length once this change is applied
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.num_bytes
    }
}

/// A pending, not yet committed change of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedChange {
    pub path: String,
    pub change_type: ChangeType,
    pub start_offset: u64,
    pub num_bytes: u64,
    /// Local file holding the not yet packed bytes
    pub backing_path: String,
    pub backing_offset: u64,
}

impl StagedChange {
    /// Canonical single-line form hashed into the commit id
    pub fn canonical_line(&self) -> String {
        format!(
            "{{'path': '{}', 'type': '{}', 'start_offset': {}, 'num_bytes': {}, 'backing_path': '{}', 'backing_offset': {}}}",
            self.path,
            self.change_type,
            self.start_offset,
            self.num_bytes,
            self.backing_path,
            self.backing_offset
        )
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.num_bytes
    }

    /// Split off everything past `max` bytes as a follow-up append.
    ///
    /// Returns `None` when the change already fits.
    pub fn split_at(&mut self, max: u64) -> Option<StagedChange> {
        if self.num_bytes <= max {
            return None;
        }
        let rest = StagedChange {
            path: self.path.clone(),
            change_type: ChangeType::Append,
            start_offset: self.start_offset + max,
            num_bytes: self.num_bytes - max,
            backing_path: self.backing_path.clone(),
            backing_offset: self.backing_offset + max,
        };
        self.num_bytes = max;
        Some(rest)
    }
}
