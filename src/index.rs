//! Session index built from the master history log.
//!
//! `history.jsonl` gets one line per prompt the user submits:
//! `{"display": "...", "timestamp": 1736937000000, "project": "/path", "sessionId": "..."}`.
//! A full scan folds those lines into per-session metadata. The result is
//! cached in a single slot for a fixed time-to-live and rebuilt wholesale.

use crate::jsonl::{stream_jsonl, LineOutcome};
use crate::paths::encode_project_path;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Characters of the first prompt kept as a session preview
const FIRST_MESSAGE_PREVIEW_CHARS: usize = 150;

/// Debounce for history log change notifications
const WATCH_DEBOUNCE_MS: u64 = 250;

/// Aggregated metadata for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: String,
    pub project_path: String,
    pub project_encoded: String,
    /// Epoch milliseconds
    pub first_message_timestamp: i64,
    /// Epoch milliseconds
    pub last_message_timestamp: i64,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_user_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl SessionMetadata {
    pub fn from_entry(entry: &HistoryEntry) -> Option<Self> {
        let (id, project, timestamp) = entry.key_fields()?;
        Some(Self {
            id: id.to_string(),
            project_path: project.to_string(),
            project_encoded: encode_project_path(project),
            first_message_timestamp: timestamp,
            last_message_timestamp: timestamp,
            message_count: 1,
            first_user_message: entry.display.as_deref().map(preview),
            summary: None,
        })
    }

    /// Fold another history entry of the same session in.
    pub fn observe(&mut self, timestamp: i64) {
        self.first_message_timestamp = self.first_message_timestamp.min(timestamp);
        self.last_message_timestamp = self.last_message_timestamp.max(timestamp);
        self.message_count += 1;
    }
}

/// One line of the history log.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub project: Option<String>,
    /// Epoch milliseconds; kept loose so a bad value does not discard the line
    pub timestamp: Option<Value>,
    pub display: Option<String>,
}

impl HistoryEntry {
    /// Session id, project and timestamp. Entries without a session id or
    /// project are unusable; a missing or non-numeric timestamp counts as 0.
    pub fn key_fields(&self) -> Option<(&str, &str, i64)> {
        let id = self.session_id.as_deref().filter(|s| !s.is_empty())?;
        let project = self.project.as_deref().filter(|s| !s.is_empty())?;
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(Value::as_f64)
            .filter(|t| t.is_finite())
            .map_or(0, |t| t as i64);
        Some((id, project, timestamp))
    }
}

fn preview(display: &str) -> String {
    display.chars().take(FIRST_MESSAGE_PREVIEW_CHARS).collect()
}

pub type SessionMap = HashMap<String, SessionMetadata>;

/// Stream the usable entries of a history log. Missing file → no entries.
pub fn history_entries(history_path: &Path) -> impl Iterator<Item = HistoryEntry> {
    stream_jsonl(history_path).filter_map(|outcome| match outcome {
        LineOutcome::Parsed(value) => serde_json::from_value::<HistoryEntry>(value).ok(),
        LineOutcome::Skipped { line_no, error } => {
            debug!("Skipping malformed history line {}: {}", line_no, error);
            None
        }
    })
}

/// Single linear scan of the history log, aggregating by session id.
pub fn build_index(history_path: &Path) -> SessionMap {
    let mut sessions = SessionMap::new();

    for entry in history_entries(history_path) {
        let Some((id, _, timestamp)) = entry.key_fields() else {
            continue;
        };
        match sessions.get_mut(id) {
            Some(existing) => existing.observe(timestamp),
            None => {
                if let Some(meta) = SessionMetadata::from_entry(&entry) {
                    sessions.insert(meta.id.clone(), meta);
                }
            }
        }
    }

    sessions
}

struct CachedIndex {
    sessions: Arc<SessionMap>,
    built_at: Instant,
    generation: u64,
}

/// Cached session index service.
///
/// Constructed once per process and shared through the app state. Holds one
/// cache slot behind an async mutex; the lock is held across a rebuild so
/// callers arriving mid-rebuild wait for, and then share, that result.
pub struct SessionIndex {
    history_path: PathBuf,
    ttl: Duration,
    slot: Mutex<Option<CachedIndex>>,
    /// Bumped by `invalidate`; a cached entry from an older generation is stale
    generation: AtomicU64,
    rebuilds: AtomicU64,
}

impl SessionIndex {
    pub fn new(history_path: PathBuf, ttl: Duration) -> Self {
        Self {
            history_path,
            ttl,
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
        }
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Current index, rebuilt if older than the TTL or invalidated.
    pub async fn get(&self) -> Arc<SessionMap> {
        let requested_at = Instant::now();
        let mut slot = self.slot.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        if let Some(cached) = slot.as_ref() {
            let current = cached.generation == generation;
            let fresh = cached.built_at.elapsed() < self.ttl;
            // Built while we were waiting on the lock: share it
            let in_flight = cached.built_at >= requested_at;
            if current && (fresh || in_flight) {
                return cached.sessions.clone();
            }
        }

        let sessions = Arc::new(self.rebuild().await);
        *slot = Some(CachedIndex {
            sessions: sessions.clone(),
            built_at: Instant::now(),
            generation,
        });
        sessions
    }

    /// Scan the history log now, bypassing the cache.
    pub async fn rebuild(&self) -> SessionMap {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        let path = self.history_path.clone();
        let started = std::time::Instant::now();

        match tokio::task::spawn_blocking(move || build_index(&path)).await {
            Ok(sessions) => {
                debug!(
                    "Session index rebuilt: {} sessions in {:?}",
                    sessions.len(),
                    started.elapsed()
                );
                sessions
            }
            Err(e) => {
                error!("Session index rebuild task failed: {}", e);
                SessionMap::new()
            }
        }
    }

    /// Force the next `get` to rebuild. Safe to call from any thread.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }
}

/// Watch the history log and invalidate the index whenever it changes.
///
/// Runs on a dedicated thread that owns the debouncer for the life of the
/// process. Watches the parent directory since the log may not exist yet.
pub fn watch_history(index: Arc<SessionIndex>) {
    let history_path = index.history_path().to_path_buf();
    let Some(watch_dir) = history_path.parent().map(Path::to_path_buf) else {
        warn!("History path has no parent, not watching: {}", history_path.display());
        return;
    };

    std::thread::spawn(move || {
        let target = history_path.file_name().map(|n| n.to_os_string());
        let mut debouncer = match new_debouncer(
            Duration::from_millis(WATCH_DEBOUNCE_MS),
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
                Ok(events) => {
                    if events
                        .iter()
                        .any(|event| event.path.file_name() == target.as_deref())
                    {
                        debug!("History log changed, invalidating session index");
                        index.invalidate();
                    }
                }
                Err(e) => {
                    error!("History watcher error: {:?}", e);
                }
            },
        ) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create history watcher: {}", e);
                return;
            }
        };

        if let Err(e) = debouncer.watcher().watch(&watch_dir, RecursiveMode::NonRecursive) {
            warn!("Failed to watch {}: {}", watch_dir.display(), e);
            return;
        }

        info!("Watching {} for history changes", history_path.display());

        // Keep thread (and the debouncer) alive
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn history_line(session: &str, project: &str, ts: i64, display: &str) -> String {
        serde_json::json!({
            "display": display,
            "timestamp": ts,
            "project": project,
            "sessionId": session,
        })
        .to_string()
    }

    fn write_history(dir: &TempDir, lines: &[String]) -> PathBuf {
        let path = dir.path().join("history.jsonl");
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn test_aggregates_per_session() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                history_line("s1", "/work/app", 300, "second"),
                history_line("s1", "/work/app", 100, "first"),
                history_line("s2", "/work/my_lib", 200, "other"),
            ],
        );

        let index = build_index(&path);
        assert_eq!(index.len(), 2);

        let s1 = &index["s1"];
        assert_eq!(s1.first_message_timestamp, 100);
        assert_eq!(s1.last_message_timestamp, 300);
        assert_eq!(s1.message_count, 2);
        // Preview comes from the first line observed, not the earliest timestamp
        assert_eq!(s1.first_user_message.as_deref(), Some("second"));

        let s2 = &index["s2"];
        assert_eq!(s2.project_encoded, "-work-my-lib");
    }

    #[test]
    fn test_two_lines_same_session() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                history_line("s", "/p", 100, "a"),
                history_line("s", "/p", 300, "b"),
            ],
        );
        let meta = &build_index(&path)["s"];
        assert_eq!(
            (meta.first_message_timestamp, meta.last_message_timestamp, meta.message_count),
            (100, 300, 2)
        );
    }

    #[test]
    fn test_skips_incomplete_and_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                "{\"display\":\"no session\",\"timestamp\":1,\"project\":\"/p\"}".to_string(),
                "{\"sessionId\":\"s\",\"timestamp\":1}".to_string(),
                "garbage".to_string(),
                history_line("s", "/p", 5, "ok"),
            ],
        );
        let index = build_index(&path);
        assert_eq!(index.len(), 1);
        assert_eq!(index["s"].message_count, 1);
    }

    #[test]
    fn test_entry_without_timestamp_still_counts() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                "{\"sessionId\":\"s\",\"project\":\"/p\",\"display\":\"no time\"}".to_string(),
                "{\"sessionId\":\"s\",\"project\":\"/p\",\"timestamp\":\"soon\"}".to_string(),
                history_line("s", "/p", 300, "later"),
            ],
        );
        let meta = &build_index(&path)["s"];
        assert_eq!(meta.message_count, 3);
        assert_eq!(meta.first_message_timestamp, 0);
        assert_eq!(meta.last_message_timestamp, 300);
        assert_eq!(meta.first_user_message.as_deref(), Some("no time"));
    }

    #[test]
    fn test_preview_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let long = "é".repeat(400);
        let path = write_history(&tmp, &[history_line("s", "/p", 1, &long)]);
        let preview = build_index(&path)["s"].first_user_message.clone().unwrap();
        assert_eq!(preview.chars().count(), 150);
    }

    #[test]
    fn test_missing_history_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(build_index(&tmp.path().join("history.jsonl")).is_empty());
    }

    #[tokio::test]
    async fn test_get_within_ttl_returns_same_instance() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(&tmp, &[history_line("s", "/p", 1, "hi")]);
        let index = SessionIndex::new(path, Duration::from_secs(60));

        let first = index.get().await;
        let second = index.get().await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(index.rebuild_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_cache_rebuilds_once_under_concurrency() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(&tmp, &[history_line("s", "/p", 1, "hi")]);
        let index = Arc::new(SessionIndex::new(path, Duration::from_millis(50)));

        let stale = index.get().await;
        assert_eq!(index.rebuild_count(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = index.clone();
                tokio::spawn(async move { index.get().await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(index.rebuild_count(), 2);
        assert!(!Arc::ptr_eq(&stale, &results[0]));
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(&tmp, &[history_line("s1", "/p", 1, "hi")]);
        let index = SessionIndex::new(path.clone(), Duration::from_secs(60));
        assert_eq!(index.get().await.len(), 1);

        fs::write(
            &path,
            [history_line("s1", "/p", 1, "hi"), history_line("s2", "/p", 2, "yo")].join("\n"),
        )
        .unwrap();
        // Still cached
        assert_eq!(index.get().await.len(), 1);

        index.invalidate();
        assert_eq!(index.get().await.len(), 2);
        assert_eq!(index.rebuild_count(), 2);
    }
}
