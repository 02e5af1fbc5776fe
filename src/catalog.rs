//! Read-side queries over the session index: paging, projects, search and
//! single-session detail.
//!
//! Every query drops sessions whose log file no longer exists, since the
//! history log outlives deleted sessions.

use crate::error::ApiError;
use crate::index::{history_entries, SessionMap, SessionMetadata};
use crate::jsonl::{file_exists, records};
use crate::ordering::{order, split_session_records, OrderedEntry};
use crate::paths::{is_safe_session_id, project_display_name, session_file_path};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;
const MAX_SEARCH_RESULTS: usize = 50;
const MIN_QUERY_CHARS: usize = 2;
const MATCHES_PER_SESSION: usize = 3;
const SNIPPET_BEFORE: usize = 40;
const SNIPPET_AFTER: usize = 60;
const SNIPPET_FALLBACK: usize = 150;

// ============================================================================
// Session list
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub project: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<SessionMetadata>,
    pub total: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Position of the last session on a page: its timestamp and id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PageCursor {
    timestamp: i64,
    id: String,
}

impl PageCursor {
    /// Whether `meta` sorts after this position in newest-first order
    fn precedes(&self, meta: &SessionMetadata) -> bool {
        meta.last_message_timestamp < self.timestamp
            || (meta.last_message_timestamp == self.timestamp && meta.id > self.id)
    }
}

/// Decode a page cursor (`<timestamp>:<id>`, base64)
fn decode_cursor(cursor: &str) -> Option<PageCursor> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let (timestamp, id) = text.split_once(':')?;
    Some(PageCursor {
        timestamp: timestamp.parse().ok()?,
        id: id.to_string(),
    })
}

/// Encode the last session of a page as an opaque cursor
fn encode_cursor(meta: &SessionMetadata) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}:{}", meta.last_message_timestamp, meta.id))
}

fn existing_sessions<'a>(
    index: &'a SessionMap,
    projects_dir: &'a Path,
) -> impl Iterator<Item = &'a SessionMetadata> + 'a {
    index.values().filter(move |meta| {
        file_exists(&session_file_path(projects_dir, &meta.project_encoded, &meta.id))
    })
}

/// Newest-first page of sessions.
pub fn list_sessions(
    index: &SessionMap,
    projects_dir: &Path,
    query: &ListQuery,
) -> Result<SessionPage, ApiError> {
    let limit = query
        .limit
        .filter(|&l| l > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);

    let before = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(cursor) => Some(
            decode_cursor(cursor)
                .ok_or_else(|| ApiError::InvalidRequest("Invalid cursor".to_string()))?,
        ),
        None => None,
    };

    let mut sessions: Vec<&SessionMetadata> = existing_sessions(index, projects_dir)
        .filter(|meta| match query.project.as_deref() {
            Some(filter) => meta.project_path.contains(filter),
            None => true,
        })
        .collect();
    // Ties broken by id; the cursor resumes after (timestamp, id)
    sessions.sort_by(|a, b| {
        b.last_message_timestamp
            .cmp(&a.last_message_timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });

    let start = match &before {
        Some(cursor) => sessions
            .iter()
            .position(|meta| cursor.precedes(meta))
            .unwrap_or(sessions.len()),
        None => 0,
    };

    let page: Vec<SessionMetadata> = sessions
        .iter()
        .skip(start)
        .take(limit)
        .map(|meta| (*meta).clone())
        .collect();
    let has_more = start + limit < sessions.len();
    let cursor = if has_more {
        page.last().map(encode_cursor)
    } else {
        None
    };

    Ok(SessionPage {
        sessions: page,
        total: sessions.len(),
        has_more,
        cursor,
    })
}

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub path: String,
    pub display_name: String,
    pub session_count: usize,
    pub last_activity_timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ProjectList {
    pub projects: Vec<ProjectSummary>,
    pub total: usize,
}

pub fn list_projects(index: &SessionMap, projects_dir: &Path) -> ProjectList {
    let mut grouped: HashMap<&str, ProjectSummary> = HashMap::new();

    for meta in existing_sessions(index, projects_dir) {
        grouped
            .entry(meta.project_path.as_str())
            .and_modify(|p| {
                p.session_count += 1;
                p.last_activity_timestamp = p.last_activity_timestamp.max(meta.last_message_timestamp);
            })
            .or_insert_with(|| ProjectSummary {
                path: meta.project_path.clone(),
                display_name: project_display_name(&meta.project_path),
                session_count: 1,
                last_activity_timestamp: meta.last_message_timestamp,
            });
    }

    let mut projects: Vec<ProjectSummary> = grouped.into_values().collect();
    projects.sort_by(|a, b| {
        b.last_activity_timestamp
            .cmp(&a.last_activity_timestamp)
            .then_with(|| a.path.cmp(&b.path))
    });

    ProjectList {
        total: projects.len(),
        projects,
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchMatch {
    pub snippet: String,
    /// ISO 8601
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub session: SessionMetadata,
    pub matches: Vec<SearchMatch>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub query: String,
}

/// Case-insensitive substring search over submitted prompts.
///
/// Session metadata in the results aggregates the matching prompts only.
pub fn search(
    history_path: &Path,
    projects_dir: &Path,
    query: &SearchQuery,
) -> Result<SearchResponse, ApiError> {
    let trimmed = query.q.as_deref().unwrap_or("").trim();
    if trimmed.chars().count() < MIN_QUERY_CHARS {
        return Err(ApiError::InvalidRequest(
            "Search query must be at least 2 characters".to_string(),
        ));
    }
    let limit = query
        .limit
        .filter(|&l| l > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_SEARCH_RESULTS);
    let term: Vec<char> = trimmed.chars().map(fold_char).collect();

    let mut found: HashMap<String, SearchResult> = HashMap::new();
    let mut missing: HashSet<String> = HashSet::new();

    for entry in history_entries(history_path) {
        let Some((id, _, timestamp)) = entry.key_fields() else {
            continue;
        };
        let display = entry.display.as_deref().unwrap_or("");
        if !contains_folded(display, &term) {
            continue;
        }
        let hit = SearchMatch {
            snippet: highlight_match(display, &term),
            timestamp: iso_from_millis(timestamp),
        };

        if let Some(result) = found.get_mut(id) {
            result.session.observe(timestamp);
            if result.matches.len() < MATCHES_PER_SESSION {
                result.matches.push(hit);
            }
            continue;
        }
        if missing.contains(id) {
            continue;
        }

        let Some(session) = SessionMetadata::from_entry(&entry) else {
            continue;
        };
        if !file_exists(&session_file_path(projects_dir, &session.project_encoded, id)) {
            missing.insert(id.to_string());
            continue;
        }
        found.insert(
            id.to_string(),
            SearchResult {
                session,
                matches: vec![hit],
            },
        );
    }

    let total = found.len();
    let mut results: Vec<SearchResult> = found.into_values().collect();
    results.sort_by(|a, b| {
        b.session
            .last_message_timestamp
            .cmp(&a.session.last_message_timestamp)
            .then_with(|| a.session.id.cmp(&b.session.id))
    });
    results.truncate(limit);

    Ok(SearchResponse {
        results,
        total,
        query: trimmed.to_lowercase(),
    })
}

/// Single-char lowercase fold, so folded text lines up with the original.
fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn fold_chars(text: &str) -> (Vec<char>, Vec<char>) {
    let chars: Vec<char> = text.chars().collect();
    let folded = chars.iter().copied().map(fold_char).collect();
    (chars, folded)
}

fn find_folded(folded: &[char], term: &[char]) -> Option<usize> {
    if term.is_empty() || term.len() > folded.len() {
        return None;
    }
    folded.windows(term.len()).position(|w| w == term)
}

fn contains_folded(text: &str, term: &[char]) -> bool {
    find_folded(&fold_chars(text).1, term).is_some()
}

/// Context around the first occurrence of `term`; the leading 150 chars
/// when there is none.
fn highlight_match(text: &str, term: &[char]) -> String {
    let (chars, folded) = fold_chars(text);
    let Some(index) = find_folded(&folded, term) else {
        return chars.iter().take(SNIPPET_FALLBACK).collect();
    };

    let start = index.saturating_sub(SNIPPET_BEFORE);
    let end = (index + term.len() + SNIPPET_AFTER).min(chars.len());

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.extend(&chars[start..end]);
    if end < chars.len() {
        snippet.push_str("...");
    }
    snippet
}

/// Format epoch milliseconds as ISO 8601 (e.g., "2025-01-15T10:30:00.000Z")
pub fn iso_from_millis(millis: i64) -> String {
    let datetime = time::OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        datetime.year(),
        datetime.month() as u8,
        datetime.day(),
        datetime.hour(),
        datetime.minute(),
        datetime.second(),
        datetime.millisecond()
    )
}

// ============================================================================
// Session detail
// ============================================================================

/// A session file rendered for display.
#[derive(Debug)]
pub struct LoadedSession {
    pub messages: Vec<OrderedEntry>,
    /// Last title line in the file
    pub summary: Option<String>,
}

/// Stream a session file and put it in display order.
pub fn load_session(path: &Path) -> LoadedSession {
    let split = split_session_records(records(path));
    LoadedSession {
        messages: order(split.turns, split.boundaries),
        summary: split.summary,
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub metadata: SessionMetadata,
    pub messages: Vec<OrderedEntry>,
}

pub fn session_detail(
    index: &SessionMap,
    projects_dir: &Path,
    session_id: &str,
) -> Result<SessionDetail, ApiError> {
    if session_id.is_empty() {
        return Err(ApiError::InvalidRequest("Session ID is required".to_string()));
    }
    if !is_safe_session_id(session_id) {
        return Err(ApiError::InvalidRequest("Invalid session ID".to_string()));
    }

    let meta = index
        .get(session_id)
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

    let path = session_file_path(projects_dir, &meta.project_encoded, session_id);
    if !file_exists(&path) {
        return Err(ApiError::NotFound("Session file not found".to_string()));
    }

    let loaded = load_session(&path);
    let mut metadata = meta.clone();
    metadata.summary = loaded.summary;

    Ok(SessionDetail {
        metadata,
        messages: loaded.messages,
    })
}
