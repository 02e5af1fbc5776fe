//! Active session discovery.
//!
//! The "active" session is the main session file with the newest
//! modification time across every project directory. Sub-agent sessions
//! (`agent-*.jsonl`) write alongside the main ones and are never active.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// The session file currently receiving writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: String,
    /// Encoded project directory name (e.g. "-home-user-app")
    pub project_dir: String,
    pub file_path: PathBuf,
    pub modified: SystemTime,
}

/// Main session files only: `<id>.jsonl`, not `agent-*.jsonl`.
pub fn is_session_file_name(name: &str) -> bool {
    match name.strip_suffix(".jsonl") {
        Some(stem) => !stem.is_empty() && !name.starts_with("agent-"),
        None => false,
    }
}

/// Find the most recently modified session file under `projects_dir`.
///
/// Ties on modification time go to the lexicographically smallest path, so
/// the answer does not depend on directory listing order. Returns `None`
/// when there are no projects or no session files. Files that vanish while
/// scanning are skipped.
pub fn locate(projects_dir: &Path) -> io::Result<Option<ActiveSession>> {
    let entries = match fs::read_dir(projects_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut best: Option<ActiveSession> = None;

    for project_entry in entries.flatten() {
        let project_path = project_entry.path();
        if !project_path.is_dir() {
            continue;
        }
        let Some(project_dir) = project_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let files = match fs::read_dir(&project_path) {
            Ok(files) => files,
            Err(e) => {
                debug!("Skipping unreadable project dir {}: {}", project_path.display(), e);
                continue;
            }
        };

        for file_entry in files.flatten() {
            let file_path = file_entry.path();
            let Some(name) = file_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_session_file_name(name) {
                continue;
            }

            let modified = match fs::metadata(&file_path) {
                Ok(meta) if meta.is_file() => match meta.modified() {
                    Ok(t) => t,
                    Err(_) => continue,
                },
                _ => continue,
            };

            let newer = match &best {
                None => true,
                Some(current) => {
                    modified > current.modified
                        || (modified == current.modified && file_path < current.file_path)
                }
            };

            if newer {
                best = Some(ActiveSession {
                    session_id: name.trim_end_matches(".jsonl").to_string(),
                    project_dir: project_dir.to_string(),
                    file_path,
                    modified,
                });
            }
        }
    }

    Ok(best)
}
