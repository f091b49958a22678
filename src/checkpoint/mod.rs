//! Checkpoint trigger - snapshots files before a tool mutates them
//!
//! Inspects every `ToolStart` before it is appended:
//! - a `write`-kind tool with a resolvable path snapshots each named file
//! - a `bash`-kind tool whose command looks destructive yields a marker
//!   checkpoint with no files
//!
//! Snapshots are best-effort. A missing, unreadable or oversized file is
//! recorded with empty content; the tool call itself is never held up.

pub mod store;

pub use store::{CheckpointMetadata, CheckpointStore, RestoreMode, StoredSnapshot};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;
use uuid::Uuid;

use crate::event::{Event, FileSnapshot, Timestamp, ToolKind};

/// Shell commands that can destroy or overwrite state
static DESTRUCTIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // file removal and overwrite
        r#"(?:^|[\s;&|('"`])(?:sudo\s+)?(?:rm|rmdir|mv|cp|unlink|truncate|shred)(?:\s|$)"#,
        r"\bsed\s+(?:-[a-zA-Z]*i|--in-place)",
        r"\bfind\b.*\s-delete\b",
        r"\bdd\b.*\bof=",
        // package managers
        r"\b(?:npm|pnpm|yarn|bun)\s+(?:install|i|add|remove|rm|uninstall|update|upgrade|ci|link|prune|dedupe)\b",
        r"\bpip3?\s+(?:install|uninstall)\b",
        r"\buv\s+(?:add|remove|sync|pip\s+(?:install|uninstall))\b",
        r"\bpoetry\s+(?:add|remove|update|install)\b",
        r"\bcargo\s+(?:add|remove|rm|update|install|uninstall)\b",
        r"\bgo\s+(?:get|mod\s+tidy)\b",
        r"\bbrew\s+(?:install|uninstall|remove|upgrade)\b",
        r"\b(?:apt|apt-get)\s+(?:install|remove|purge|upgrade|autoremove)\b",
        // git history rewrites
        r"\bgit\s+reset\s+--hard\b",
        r"\bgit\s+clean\b",
        r"\bgit\s+rebase\b",
        r"\bgit\s+push\b.*\s(?:-f|--force(?:-with-lease)?)\b",
        r"\bgit\s+checkout\s+(?:--|\.)(?:\s|$)",
        r"\bgit\s+restore\b",
        r"\bgit\s+filter-branch\b",
        r"\bgit\s+commit\b.*--amend\b",
        r"\bgit\s+stash\s+(?:drop|clear)\b",
        r"\bgit\s+branch\s+-D\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Output redirection into a file, `>` or `>>`
static REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^-=<>&])>{1,2}\s*[^\s&>|]").expect("Invalid redirect regex"));

/// Redirections that never touch a real file
static HARMLESS_REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d*>{1,2}\s*(?:/dev/null|&\d)").expect("Invalid redirect regex"));

/// Argument keys that name a file a tool is about to change
const PATH_KEYS: &[&str] = &[
    "file_path",
    "filePath",
    "path",
    "absolute_path",
    "notebook_path",
    "target_file",
    "source",
    "destination",
];

/// Checkpoint entry for a history view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub id: String,
    pub timestamp: Timestamp,
    pub trigger: String,
    pub file_count: usize,
}

/// Is this shell command likely to destroy or overwrite state?
pub fn is_destructive_command(command: &str) -> bool {
    if DESTRUCTIVE_PATTERNS.iter().any(|re| re.is_match(command)) {
        return true;
    }
    let without_harmless = HARMLESS_REDIRECT_RE.replace_all(command, "");
    REDIRECT_RE.is_match(&without_harmless)
}

/// Shell command carried in tool arguments (`command` or `cmd`, string or argv).
pub fn shell_command(args: &Value) -> Option<String> {
    let value = args.get("command").or_else(|| args.get("cmd"))?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

/// Every file path a mutating tool names, in order, without repeats.
pub fn mutation_paths(args: &Value) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let mut push = |p: &str| {
        if !p.is_empty() && !paths.iter().any(|existing| existing == p) {
            paths.push(p.to_string());
        }
    };

    for key in PATH_KEYS {
        if let Some(p) = args.get(*key).and_then(|v| v.as_str()) {
            push(p);
        }
    }
    if let Some(list) = args.get("paths").and_then(|v| v.as_array()) {
        list.iter().filter_map(|v| v.as_str()).for_each(&mut push);
    }
    match args.get("changes") {
        Some(Value::Array(changes)) => {
            for change in changes {
                if let Some(p) = change.get("path").and_then(|v| v.as_str()) {
                    push(p);
                }
            }
        }
        Some(Value::Object(changes)) => changes.keys().for_each(|p| push(p.as_str())),
        _ => {}
    }
    paths
}

/// Decides and captures pre-mutation snapshots
#[derive(Debug, Clone)]
pub struct CheckpointTrigger {
    cwd: PathBuf,
    max_snapshot_bytes: u64,
}

impl CheckpointTrigger {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            max_snapshot_bytes: 2 * 1024 * 1024,
        }
    }

    pub fn with_max_snapshot_bytes(mut self, max: u64) -> Self {
        self.max_snapshot_bytes = max;
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = cwd.into();
    }

    /// Inspect a `ToolStart`; returns the `CheckpointCreate` to append before it.
    pub fn inspect(&self, event: &Event, timestamp: Timestamp) -> Option<Event> {
        let Event::ToolStart {
            id,
            tool_kind,
            name,
            args,
            ..
        } = event
        else {
            return None;
        };

        let (trigger, file_snapshots) = match tool_kind {
            ToolKind::Write => {
                let paths = mutation_paths(args);
                if paths.is_empty() {
                    return None;
                }
                let snapshots: Vec<FileSnapshot> = paths.iter().map(|p| self.snapshot(p)).collect();
                (format!("{}: {}", name, paths.join(", ")), snapshots)
            }
            ToolKind::Bash => {
                let command = shell_command(args)?;
                if !is_destructive_command(&command) {
                    return None;
                }
                (format!("{}: {}", name, command), Vec::new())
            }
            _ => return None,
        };

        debug!(tool_id = %id, files = file_snapshots.len(), "Creating checkpoint");
        Some(Event::CheckpointCreate {
            id: format!("cp-{}", Uuid::new_v4()),
            trigger,
            tool_id: Some(id.clone()),
            file_snapshots,
            timestamp,
        })
    }

    /// Current content of `path`, or empty when it cannot be read.
    pub fn snapshot(&self, path: &str) -> FileSnapshot {
        let resolved = self.resolve(path);
        let original_content = match std::fs::metadata(&resolved) {
            Ok(meta) if meta.len() > self.max_snapshot_bytes => {
                debug!(path = %resolved.display(), size = meta.len(), "File too large to snapshot");
                String::new()
            }
            Ok(_) => match std::fs::read(&resolved) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    debug!(path = %resolved.display(), error = %e, "Snapshot read failed");
                    String::new()
                }
            },
            Err(_) => String::new(),
        };
        FileSnapshot {
            path: path.to_string(),
            original_content,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_start(kind: ToolKind, name: &str, args: Value) -> Event {
        Event::ToolStart {
            id: "tool-1".into(),
            tool_kind: kind,
            name: name.into(),
            args,
            timestamp: 10,
        }
    }

    #[test]
    fn test_destructive_commands() {
        for cmd in [
            "rm -rf build",
            "cd src && rm old.rs",
            "mv a.txt b.txt",
            "cp -r dist /tmp/x",
            "echo hi > notes.txt",
            "cat a >> b",
            "npm install left-pad",
            "pip install requests",
            "cargo add serde",
            "git reset --hard HEAD~1",
            "git push origin main --force",
            "git checkout -- src/lib.rs",
            "git commit --amend -m x",
            "sed -i 's/a/b/' file.txt",
            "bash -lc 'rm -rf build'",
        ] {
            assert!(is_destructive_command(cmd), "expected destructive: {}", cmd);
        }
    }

    #[test]
    fn test_benign_commands() {
        for cmd in [
            "ls -la",
            "cargo test 2>&1",
            "grep -rn confirm src",
            "git status",
            "git push origin main",
            "npm run build > /dev/null",
            "echo 'a => b'",
            "ls -rm",
            "cat README.md",
        ] {
            assert!(!is_destructive_command(cmd), "expected benign: {}", cmd);
        }
    }

    #[test]
    fn test_mutation_paths() {
        assert_eq!(mutation_paths(&json!({"file_path": "a.txt", "content": "x"})), vec!["a.txt"]);
        assert_eq!(
            mutation_paths(&json!({"source": "a", "destination": "b"})),
            vec!["a", "b"]
        );
        assert_eq!(
            mutation_paths(&json!({"changes": [{"path": "x.rs"}, {"path": "y.rs"}, {"path": "x.rs"}]})),
            vec!["x.rs", "y.rs"]
        );
        assert_eq!(mutation_paths(&json!({"changes": {"z.rs": {"add": {}}}})), vec!["z.rs"]);
        assert!(mutation_paths(&json!({"content": "x"})).is_empty());
    }

    #[test]
    fn test_destructive_bash_creates_marker() {
        let trigger = CheckpointTrigger::new(".");
        let start = tool_start(ToolKind::Bash, "Bash", json!({"command": "rm -rf build"}));
        match trigger.inspect(&start, 10) {
            Some(Event::CheckpointCreate { file_snapshots, tool_id, timestamp, .. }) => {
                assert!(file_snapshots.is_empty());
                assert_eq!(tool_id.as_deref(), Some("tool-1"));
                assert_eq!(timestamp, 10);
            }
            other => panic!("Expected CheckpointCreate, got {:?}", other),
        }
        let safe = tool_start(ToolKind::Bash, "Bash", json!({"command": "ls"}));
        assert!(trigger.inspect(&safe, 10).is_none());
    }

    #[test]
    fn test_write_snapshots_existing_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exists.txt"), "old content").unwrap();
        let trigger = CheckpointTrigger::new(dir.path());

        let start = tool_start(
            ToolKind::Write,
            "apply_patch",
            json!({"changes": [{"path": "exists.txt"}, {"path": "a.txt"}]}),
        );
        match trigger.inspect(&start, 1) {
            Some(Event::CheckpointCreate { file_snapshots, .. }) => {
                assert_eq!(
                    file_snapshots,
                    vec![
                        FileSnapshot { path: "exists.txt".into(), original_content: "old content".into() },
                        FileSnapshot { path: "a.txt".into(), original_content: String::new() },
                    ]
                );
            }
            other => panic!("Expected CheckpointCreate, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![b'x'; 64]).unwrap();
        let trigger = CheckpointTrigger::new(dir.path()).with_max_snapshot_bytes(16);
        assert_eq!(trigger.snapshot("big.bin").original_content, "");
    }

    #[test]
    fn test_read_tools_never_trigger() {
        let trigger = CheckpointTrigger::new(".");
        let start = tool_start(ToolKind::Read, "Read", json!({"file_path": "a.txt"}));
        assert!(trigger.inspect(&start, 1).is_none());
        let no_path = tool_start(ToolKind::Write, "Write", json!({"content": "x"}));
        assert!(trigger.inspect(&no_path, 1).is_none());
    }
}
