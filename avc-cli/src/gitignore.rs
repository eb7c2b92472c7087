//! Keeps per-clone `.avc` files out of git

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Entries every working copy must ignore
pub const IGNORED: &[&str] = &[
    "/.avc/local_state.db",
    "/.avc/local_state.db-wal",
    "/.avc/local_state.db-shm",
    "/.avc/config.json",
    "/.avc/git_operations.json",
];

/// Append whichever of [`IGNORED`] is missing from `<toplevel>/.gitignore`.
///
/// Returns the entries that were added.
pub fn ensure_ignored(toplevel: &Path) -> Result<Vec<&'static str>> {
    let path = toplevel.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let present: Vec<&str> = existing.lines().map(str::trim).collect();
    let missing: Vec<&'static str> = IGNORED
        .iter()
        .copied()
        .filter(|entry| !present.contains(entry))
        .collect();
    if missing.is_empty() {
        return Ok(missing);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    for entry in &missing {
        writeln!(file, "{}", entry)?;
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_adds_missing_entries_once() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".gitignore"), "target\n/.avc/config.json").unwrap();

        let added = ensure_ignored(tmp.path()).unwrap();
        assert_eq!(added.len(), IGNORED.len() - 1);
        assert!(!added.contains(&"/.avc/config.json"));

        let text = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert!(text.starts_with("target\n/.avc/config.json\n/.avc/local_state.db\n"));
        assert!(ensure_ignored(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_creates_gitignore() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(ensure_ignored(tmp.path()).unwrap().len(), IGNORED.len());
        let text = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert_eq!(text.lines().count(), IGNORED.len());
    }
}
