//! Virtual add operations and the operation-plan file
//!
//! A plan is the hand-off contract to an external uploader: for every object
//! that must appear in the remote repository it says where the bytes come
//! from, either one whole local file or an ordered list of byte ranges.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::byte_range::{from_io, ByteRange, ByteRangeStream};
use crate::error::{AvcError, Result};

/// One byte range of a local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSource {
    pub local_path: String,
    pub offset: u64,
    pub num_bytes: u64,
}

impl ReadSource {
    pub fn new(local_path: impl Into<String>, offset: u64, num_bytes: u64) -> Self {
        Self {
            local_path: local_path.into(),
            offset,
            num_bytes,
        }
    }
}

impl From<&ReadSource> for ByteRange {
    fn from(s: &ReadSource) -> Self {
        ByteRange::new(&s.local_path, s.offset, s.num_bytes)
    }
}

/// How to produce one destination object's bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VirtualAddOperation {
    /// Stitch an ordered list of ranges into one object
    #[serde(rename = "ConcatenatingAddOperation")]
    Concatenating {
        repo_path: String,
        sources: Vec<ReadSource>,
    },
    /// Copy one local file verbatim
    #[serde(rename = "DirectAddOperation")]
    Direct {
        repo_path: String,
        local_path: String,
    },
}

impl VirtualAddOperation {
    /// Destination path inside the remote repository
    pub fn repo_path(&self) -> &str {
        match self {
            VirtualAddOperation::Concatenating { repo_path, .. } => repo_path,
            VirtualAddOperation::Direct { repo_path, .. } => repo_path,
        }
    }

    /// Where this operation's object lands below `root`
    pub fn destination(&self, root: &Path) -> PathBuf {
        self.repo_path()
            .split('/')
            .fold(root.to_path_buf(), |acc, part| acc.join(part))
    }

    /// Produce this operation's object below `root`, returning its size.
    ///
    /// The object is written to a `.partial` sibling and renamed into place,
    /// so a destination either holds the complete object or nothing new.
    pub fn materialize(&self, root: &Path) -> Result<u64> {
        let target = self.destination(root);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".partial");
        let tmp_path = target.with_file_name(tmp_name);

        let written = match self.write_to(&tmp_path) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        fs::rename(&tmp_path, &target)?;
        Ok(written)
    }

    fn write_to(&self, path: &Path) -> Result<u64> {
        let sources = match self {
            VirtualAddOperation::Direct { local_path, .. } => return Ok(fs::copy(local_path, path)?),
            VirtualAddOperation::Concatenating { sources, .. } => sources,
        };
        let mut stream = ByteRangeStream::new(sources.iter().map(ByteRange::from).collect())?;
        let mut out = BufWriter::new(File::create(path)?);
        let copied = io::copy(&mut stream, &mut out).map_err(from_io)?;
        out.flush()?;
        stream.close();
        if copied != stream.len() {
            return Err(AvcError::consistency(format!(
                "{}: copied {} of {} bytes",
                self.repo_path(),
                copied,
                stream.len()
            )));
        }
        Ok(copied)
    }
}

/// Reject plans that would write the same destination twice
pub fn check_unique_destinations(ops: &[VirtualAddOperation]) -> Result<()> {
    let mut seen = HashSet::new();
    for op in ops {
        if !seen.insert(op.repo_path()) {
            return Err(AvcError::InvalidState(format!(
                "duplicate repo path in plan: {}",
                op.repo_path()
            )));
        }
    }
    Ok(())
}

/// Persist a plan as a JSON array
pub fn save_plan(path: &Path, ops: &[VirtualAddOperation]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(ops)?;
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a plan written by [`save_plan`]
pub fn load_plan(path: &Path) -> Result<Vec<VirtualAddOperation>> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}
