//! Checkpoint store - persists snapshots under the project directory
//!
//! Layout per checkpoint:
//! ```text
//! <project>/.agent-stream/checkpoints/<id>/
//!   metadata.json
//!   file_mapping.json       path -> index
//!   files/file_N.json       { path, originalContent, currentContent }
//!   files/content_N.txt     current content, for external diff tools
//! ```
//! Writers take an exclusive lock on `checkpoints/.lock`.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::event::FileSnapshot;

/// Checkpoint metadata (`metadata.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub checkpoint_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub file_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
}

/// One persisted file snapshot (`files/file_N.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub path: String,
    pub original_content: String,
    pub current_content: String,
}

/// Which side of a snapshot to write back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Content before the tool ran
    Original,
    /// Content captured after the tool ran
    Current,
}

impl std::str::FromStr for RestoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "original" => Ok(RestoreMode::Original),
            "current" => Ok(RestoreMode::Current),
            _ => Err(anyhow!("Unknown restore mode: {}", s)),
        }
    }
}

/// Per-project checkpoint store
pub struct CheckpointStore {
    project_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// `<project>/.agent-stream/checkpoints`
    pub fn root(&self) -> PathBuf {
        self.project_root.join(".agent-stream").join("checkpoints")
    }

    fn checkpoint_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            bail!("Invalid checkpoint id: {}", id);
        }
        Ok(self.root().join(id))
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(id)?;
        if !dir.exists() {
            bail!("Checkpoint {} not found", id);
        }
        Ok(dir)
    }

    /// Exclusive lock held for the lifetime of the returned file.
    fn lock(&self) -> Result<File> {
        let root = self.root();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create checkpoints directory {}", root.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Persist a checkpoint; current content starts out equal to the original.
    pub fn save(&self, id: &str, files: &[FileSnapshot], trigger: Option<&str>) -> Result<CheckpointMetadata> {
        let dir = self.checkpoint_dir(id)?;
        let lock = self.lock()?;

        let files_dir = dir.join("files");
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;

        let git = self.git_info();
        let metadata = CheckpointMetadata {
            id: id.to_string(),
            timestamp: Utc::now(),
            name: None,
            checkpoint_type: "auto".to_string(),
            trigger: trigger.map(String::from),
            file_count: files.len(),
            git_branch: git.get("branch").cloned(),
            git_commit: git.get("commit").cloned(),
        };
        fs::write(dir.join("metadata.json"), serde_json::to_string_pretty(&metadata)?)
            .context("Failed to write checkpoint metadata")?;

        let mut mapping = HashMap::new();
        for (index, file) in files.iter().enumerate() {
            let stored = StoredSnapshot {
                path: file.path.clone(),
                original_content: file.original_content.clone(),
                current_content: file.original_content.clone(),
            };
            write_snapshot(&files_dir, index, &stored)?;
            mapping.insert(file.path.clone(), index);
        }
        fs::write(dir.join("file_mapping.json"), serde_json::to_string_pretty(&mapping)?)
            .context("Failed to write checkpoint file mapping")?;

        lock.unlock()?;
        info!(checkpoint_id = %id, files = files.len(), "Checkpoint saved");
        Ok(metadata)
    }

    /// All checkpoints, newest first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<CheckpointMetadata>> {
        let root = self.root();
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in fs::read_dir(&root)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_json::<CheckpointMetadata>(&path.join("metadata.json")) {
                Ok(metadata) => out.push(metadata),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    pub fn metadata(&self, id: &str) -> Result<CheckpointMetadata> {
        read_json(&self.existing_dir(id)?.join("metadata.json"))
    }

    /// Paths recorded in a checkpoint
    pub fn files(&self, id: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self.mapping(&self.existing_dir(id)?)?.into_keys().collect();
        paths.sort();
        Ok(paths)
    }

    /// One file's stored snapshot
    pub fn file(&self, id: &str, path: &str) -> Result<StoredSnapshot> {
        let dir = self.existing_dir(id)?;
        let index = *self
            .mapping(&dir)?
            .get(path)
            .ok_or_else(|| anyhow!("File not found in checkpoint: {}", path))?;
        read_json(&dir.join("files").join(format!("file_{}.json", index)))
    }

    /// Refresh every snapshot's current content from disk (after the tool ran).
    pub fn capture_current(&self, id: &str) -> Result<usize> {
        let dir = self.existing_dir(id)?;
        let lock = self.lock()?;
        let files_dir = dir.join("files");
        let mapping = self.mapping(&dir)?;
        for (path, index) in &mapping {
            let mut stored: StoredSnapshot = read_json(&files_dir.join(format!("file_{}.json", index)))?;
            stored.current_content = fs::read(self.resolve_target(path))
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            write_snapshot(&files_dir, *index, &stored)?;
        }
        lock.unlock()?;
        Ok(mapping.len())
    }

    /// Write every file of a checkpoint back.
    pub fn restore(&self, id: &str, mode: RestoreMode) -> Result<usize> {
        let dir = self.existing_dir(id)?;
        let mapping = self.mapping(&dir)?;
        for (path, index) in &mapping {
            self.restore_one(&dir, path, *index, mode)?;
        }
        info!(checkpoint_id = %id, files = mapping.len(), ?mode, "Checkpoint restored");
        Ok(mapping.len())
    }

    /// Write back only the named files; a name the checkpoint lacks is an error.
    pub fn restore_files(&self, id: &str, files: &[String], mode: RestoreMode) -> Result<()> {
        let dir = self.existing_dir(id)?;
        let mapping = self.mapping(&dir)?;
        for path in files {
            let index = mapping
                .get(path)
                .ok_or_else(|| anyhow!("File not found in checkpoint: {}", path))?;
            self.restore_one(&dir, path, *index, mode)?;
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.checkpoint_dir(id)?;
        if dir.exists() {
            let lock = self.lock()?;
            fs::remove_dir_all(&dir).with_context(|| format!("Failed to delete checkpoint {}", id))?;
            lock.unlock()?;
        }
        Ok(())
    }

    /// Keep the newest `keep` checkpoints; returns how many were removed.
    pub fn clean_old(&self, keep: usize) -> Result<usize> {
        let stale: Vec<String> = self.list()?.into_iter().skip(keep).map(|m| m.id).collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let lock = self.lock()?;
        for id in &stale {
            let dir = self.checkpoint_dir(id)?;
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(checkpoint_id = %id, error = %e, "Failed to delete old checkpoint");
            }
        }
        lock.unlock()?;
        Ok(stale.len())
    }

    /// Branch and commit of the project, when it is a git checkout
    pub fn git_info(&self) -> HashMap<String, String> {
        let mut info = HashMap::new();
        if let Some(branch) = git_output(&self.project_root, &["rev-parse", "--abbrev-ref", "HEAD"]) {
            info.insert("branch".to_string(), branch);
        }
        if let Some(commit) = git_output(&self.project_root, &["rev-parse", "HEAD"]) {
            info.insert("commit".to_string(), commit);
        }
        info
    }

    fn mapping(&self, dir: &Path) -> Result<HashMap<String, usize>> {
        read_json(&dir.join("file_mapping.json"))
    }

    fn restore_one(&self, dir: &Path, path: &str, index: usize, mode: RestoreMode) -> Result<()> {
        let stored: StoredSnapshot = read_json(&dir.join("files").join(format!("file_{}.json", index)))?;
        let target = self.resolve_target(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = match mode {
            RestoreMode::Original => &stored.original_content,
            RestoreMode::Current => &stored.current_content,
        };
        fs::write(&target, content).with_context(|| format!("Failed to restore file {}", path))?;
        debug!(path = %target.display(), "Restored file");
        Ok(())
    }

    /// Relative paths land under the project; absolute paths outside it are
    /// restored under the project root by file name.
    fn resolve_target(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if !p.is_absolute() {
            return self.project_root.join(p);
        }
        if p.starts_with(&self.project_root) {
            return p.to_path_buf();
        }
        p.file_name()
            .map(|name| self.project_root.join(name))
            .unwrap_or_else(|| self.project_root.clone())
    }
}

fn write_snapshot(files_dir: &Path, index: usize, stored: &StoredSnapshot) -> Result<()> {
    fs::write(
        files_dir.join(format!("file_{}.json", index)),
        serde_json::to_string_pretty(stored)?,
    )
    .context("Failed to write file snapshot")?;
    fs::write(files_dir.join(format!("content_{}.txt", index)), &stored.current_content)
        .context("Failed to write file content")?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(dir).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(path: &str, content: &str) -> FileSnapshot {
        FileSnapshot {
            path: path.to_string(),
            original_content: content.to_string(),
        }
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let metadata = store
            .save("cp-1", &[snapshot("a.txt", "one"), snapshot("src/b.rs", "two")], Some("Write: a.txt"))
            .unwrap();
        assert_eq!(metadata.file_count, 2);
        assert_eq!(metadata.checkpoint_type, "auto");

        assert_eq!(store.metadata("cp-1").unwrap().trigger.as_deref(), Some("Write: a.txt"));
        assert_eq!(store.files("cp-1").unwrap(), vec!["a.txt", "src/b.rs"]);
        assert_eq!(store.file("cp-1", "src/b.rs").unwrap().original_content, "two");
        assert!(store.file("cp-1", "missing.txt").is_err());
        assert!(store.root().join("cp-1/files/content_0.txt").exists());
    }

    #[test]
    fn test_restore_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("cp-1", &[snapshot("a.txt", "before")], None).unwrap();

        fs::write(dir.path().join("a.txt"), "after").unwrap();
        assert_eq!(store.capture_current("cp-1").unwrap(), 1);
        assert_eq!(store.file("cp-1", "a.txt").unwrap().current_content, "after");

        store.restore("cp-1", RestoreMode::Original).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "before");

        store
            .restore_files("cp-1", &["a.txt".to_string()], RestoreMode::Current)
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "after");

        assert!(store
            .restore_files("cp-1", &["nope.txt".to_string()], RestoreMode::Current)
            .is_err());
    }

    #[test]
    fn test_outside_absolute_path_restores_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store
            .save("cp-1", &[snapshot("/somewhere/else/notes.md", "kept")], None)
            .unwrap();
        store.restore("cp-1", RestoreMode::Original).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("notes.md")).unwrap(), "kept");
    }

    #[test]
    fn test_list_delete_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        for id in ["cp-1", "cp-2", "cp-3"] {
            store.save(id, &[], None).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let listed: Vec<String> = store.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec!["cp-3", "cp-2", "cp-1"]);

        store.delete("cp-2").unwrap();
        assert!(store.metadata("cp-2").is_err());

        assert_eq!(store.clean_old(1).unwrap(), 1);
        let remaining: Vec<String> = store.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(remaining, vec!["cp-3"]);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.save("../escape", &[], None).is_err());
        assert!(store.delete("..").is_err());
    }

    #[test]
    fn test_restore_mode_parse() {
        assert_eq!("original".parse::<RestoreMode>().unwrap(), RestoreMode::Original);
        assert_eq!("current".parse::<RestoreMode>().unwrap(), RestoreMode::Current);
        assert!("latest".parse::<RestoreMode>().is_err());
    }
}
