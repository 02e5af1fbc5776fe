//! Live tail of the active session.
//!
//! Each subscriber gets its own [`TailController`] driven by a polling task.
//! On connect the controller replays the active session's backlog in
//! batches, then every tick it:
//! 1. re-locates the active session and announces a switch if it moved
//! 2. reads bytes appended since the last offset
//! 3. emits records it has not delivered before
//! 4. emits a heartbeat
//!
//! Events reach the HTTP layer through a bounded channel wrapped as a
//! [`Stream`]. Dropping the [`LiveSubscription`] stops the task.

use crate::jsonl::{read_from_offset, LineAssembler};
use crate::locator::{locate, ActiveSession};
use crate::ordering::{order, split_session_records, OrderedEntry};
use crate::records::{Record, RecordKind};
use axum::response::sse::Event;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// Records per `history_batch` event
pub const HISTORY_BATCH_SIZE: usize = 20;

const CHANNEL_CAPACITY: usize = 64;

/// One event on the live stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    Init {
        session_id: String,
        project_path: String,
    },
    HistoryBatch {
        messages: Vec<Record>,
        loaded: usize,
        total: usize,
        is_last: bool,
    },
    Message(Record),
    SessionSwitch {
        old_session_id: String,
        new_session_id: String,
        project_path: String,
    },
    Error {
        error: String,
    },
    Heartbeat,
}

impl TailEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TailEvent::Init { .. } => "init",
            TailEvent::HistoryBatch { .. } => "history_batch",
            TailEvent::Message(_) => "message",
            TailEvent::SessionSwitch { .. } => "session_switch",
            TailEvent::Error { .. } => "error",
            TailEvent::Heartbeat => "heartbeat",
        }
    }

    /// JSON body of the event as sent on the wire.
    pub fn payload(&self) -> Value {
        match self {
            TailEvent::Init {
                session_id,
                project_path,
            } => json!({ "sessionId": session_id, "projectPath": project_path }),
            TailEvent::HistoryBatch {
                messages,
                loaded,
                total,
                is_last,
            } => json!({
                "messages": messages,
                "loaded": loaded,
                "total": total,
                "isLast": is_last,
            }),
            TailEvent::Message(record) => record.raw().clone(),
            TailEvent::SessionSwitch {
                old_session_id,
                new_session_id,
                project_path,
            } => json!({
                "oldSessionId": old_session_id,
                "newSessionId": new_session_id,
                "projectPath": project_path,
            }),
            TailEvent::Error { error } => json!({ "error": error }),
            TailEvent::Heartbeat => Value::Null,
        }
    }

    /// Heartbeats go out as an SSE comment, everything else as a named event.
    pub fn to_sse(&self) -> Event {
        match self {
            TailEvent::Heartbeat => Event::default().comment("heartbeat"),
            other => Event::default()
                .event(other.name())
                .data(other.payload().to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("No active session found")]
    NoActiveSession,
    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Key used to suppress repeat deliveries. Records without an id are keyed
/// by a hash of their content.
pub fn delivery_key(record: &Record) -> String {
    match record.id() {
        Some(id) => id.to_string(),
        None => {
            let mut hasher = DefaultHasher::new();
            record.raw().to_string().hash(&mut hasher);
            format!("anon-{:016x}", hasher.finish())
        }
    }
}

/// Kinds a viewer renders. Everything else is tracked but not sent.
fn is_deliverable(kind: RecordKind) -> bool {
    kind.is_turn() || matches!(kind, RecordKind::CompactBoundary | RecordKind::Summary)
}

#[derive(Debug)]
struct TailCursor {
    session_id: String,
    file_path: PathBuf,
    offset: u64,
    assembler: LineAssembler,
}

impl TailCursor {
    fn at_start(active: ActiveSession) -> Self {
        Self {
            session_id: active.session_id,
            file_path: active.file_path,
            offset: 0,
            assembler: LineAssembler::default(),
        }
    }
}

/// Per-subscriber tail state.
#[derive(Debug)]
pub struct TailController {
    projects_dir: PathBuf,
    cursor: Option<TailCursor>,
    /// Keys delivered (or deliberately withheld) on this subscription
    seen: HashSet<String>,
}

impl TailController {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self {
            projects_dir,
            cursor: None,
            seen: HashSet::new(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.cursor.as_ref().map(|c| c.session_id.as_str())
    }

    /// Byte offset of the next read in the current file.
    pub fn offset(&self) -> u64 {
        self.cursor.as_ref().map_or(0, |c| c.offset)
    }

    /// Attach to the active session and replay its backlog.
    ///
    /// Returns `init` followed by one or more `history_batch` events.
    pub fn initialize(&mut self) -> Result<Vec<TailEvent>, TailError> {
        let active = self.locate_active()?.ok_or(TailError::NoActiveSession)?;
        let project_path = active.project_dir.clone();
        let mut cursor = TailCursor::at_start(active);

        let lines = read_lines(&mut cursor)?;

        // Last occurrence wins, keeping the position of the first
        let mut backlog: Vec<Record> = Vec::new();
        let mut position = std::collections::HashMap::new();
        for record in lines.iter().filter_map(|line| Record::parse_line(line)) {
            let key = delivery_key(&record);
            self.seen.insert(key.clone());
            if !is_deliverable(record.kind()) {
                continue;
            }
            match position.get(&key) {
                Some(&idx) => backlog[idx] = record,
                None => {
                    position.insert(key, backlog.len());
                    backlog.push(record);
                }
            }
        }

        info!(
            "Live tail attached to {} ({} records, offset {})",
            cursor.session_id,
            backlog.len(),
            cursor.offset
        );

        let mut events = vec![TailEvent::Init {
            session_id: cursor.session_id.clone(),
            project_path,
        }];
        events.extend(history_batches(backlog));
        self.cursor = Some(cursor);
        Ok(events)
    }

    /// One polling step. Never fails: I/O problems are logged and the tick
    /// yields no messages. Always ends with a heartbeat.
    pub fn tick(&mut self) -> Vec<TailEvent> {
        let mut events = match self.poll() {
            Ok(events) => events,
            Err(e) => {
                warn!("Live tail tick failed: {}", e);
                Vec::new()
            }
        };
        events.push(TailEvent::Heartbeat);
        events
    }

    fn poll(&mut self) -> Result<Vec<TailEvent>, TailError> {
        let Some(current) = self.cursor.as_ref() else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();

        if let Some(active) = self.locate_active()? {
            if active.file_path != current.file_path {
                info!(
                    "Active session switched: {} -> {}",
                    current.session_id, active.session_id
                );
                events.push(TailEvent::SessionSwitch {
                    old_session_id: current.session_id.clone(),
                    new_session_id: active.session_id.clone(),
                    project_path: active.project_dir.clone(),
                });
                self.cursor = Some(TailCursor::at_start(active));
            }
        }

        match self.read_appended() {
            Ok(messages) => events.extend(messages),
            Err(e) => warn!("Live tail read failed: {}", e),
        }
        Ok(events)
    }

    fn read_appended(&mut self) -> Result<Vec<TailEvent>, TailError> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(Vec::new());
        };
        let lines = read_lines(cursor)?;

        let mut events = Vec::new();
        for record in lines.iter().filter_map(|line| Record::parse_line(line)) {
            if !self.seen.insert(delivery_key(&record)) {
                continue;
            }
            if is_deliverable(record.kind()) {
                events.push(TailEvent::Message(record));
            }
        }
        Ok(events)
    }

    fn locate_active(&self) -> Result<Option<ActiveSession>, TailError> {
        locate(&self.projects_dir).map_err(|source| TailError::Scan {
            path: self.projects_dir.clone(),
            source,
        })
    }
}

/// Read everything past the cursor and return the lines it completes.
fn read_lines(cursor: &mut TailCursor) -> Result<Vec<String>, TailError> {
    let chunk = read_from_offset(&cursor.file_path, cursor.offset).map_err(|source| {
        TailError::Read {
            path: cursor.file_path.clone(),
            source,
        }
    })?;

    if chunk.reset {
        debug!(
            "{} shrank below offset {}, re-reading from start",
            cursor.file_path.display(),
            cursor.offset
        );
        cursor.assembler.clear();
    }
    cursor.offset = chunk.end_offset;

    let mut lines = cursor.assembler.push(&chunk.bytes);
    lines.extend(cursor.assembler.flush_complete());
    Ok(lines)
}

fn history_batches(backlog: Vec<Record>) -> Vec<TailEvent> {
    let total = backlog.len();
    if total == 0 {
        return vec![TailEvent::HistoryBatch {
            messages: Vec::new(),
            loaded: 0,
            total: 0,
            is_last: true,
        }];
    }

    let mut loaded = 0;
    backlog
        .chunks(HISTORY_BATCH_SIZE)
        .map(|batch| {
            loaded += batch.len();
            TailEvent::HistoryBatch {
                messages: batch.to_vec(),
                loaded,
                total,
                is_last: loaded >= total,
            }
        })
        .collect()
}

/// Drive one controller until the receiver goes away.
async fn run(mut controller: TailController, poll_interval: Duration, tx: mpsc::Sender<TailEvent>) {
    let initial = match controller.initialize() {
        Ok(events) => events,
        Err(e) => {
            warn!("Live tail could not start: {}", e);
            let _ = tx.send(TailEvent::Error { error: e.to_string() }).await;
            return;
        }
    };
    if !send_all(&tx, initial).await {
        return;
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tx.closed() => break,
            _ = ticker.tick() => {
                if !send_all(&tx, controller.tick()).await {
                    break;
                }
            }
        }
    }

    debug!(
        "Live tail stopped for {}",
        controller.session_id().unwrap_or("<none>")
    );
}

async fn send_all(tx: &mpsc::Sender<TailEvent>, events: Vec<TailEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub connected_at: Instant,
}

struct Registration {
    id: u64,
    subscribers: Arc<DashMap<u64, SubscriberInfo>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some((_, info)) = self.subscribers.remove(&self.id) {
            info!(
                "Live subscriber {} disconnected after {:?}",
                self.id,
                info.connected_at.elapsed()
            );
        }
    }
}

/// A live event stream. Dropping it stops the tail task.
pub struct LiveSubscription {
    events: ReceiverStream<TailEvent>,
    _task: AbortOnDrop,
    _registration: Registration,
}

impl Stream for LiveSubscription {
    type Item = TailEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TailEvent>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}

/// Spawns tail tasks and tracks who is connected.
pub struct LiveHub {
    projects_dir: PathBuf,
    poll_interval: Duration,
    subscribers: Arc<DashMap<u64, SubscriberInfo>>,
    next_id: AtomicU64,
}

impl LiveHub {
    pub fn new(projects_dir: PathBuf, poll_interval: Duration) -> Self {
        Self {
            projects_dir,
            poll_interval,
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a tail task for a new subscriber. Must be called within a tokio runtime.
    pub fn subscribe(&self) -> LiveSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(
            id,
            SubscriberInfo {
                connected_at: Instant::now(),
            },
        );
        info!("Live subscriber {} connected", id);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let controller = TailController::new(self.projects_dir.clone());
        let task = tokio::spawn(run(controller, self.poll_interval, tx));

        LiveSubscription {
            events: ReceiverStream::new(rx),
            _task: AbortOnDrop(task),
            _registration: Registration {
                id,
                subscribers: self.subscribers.clone(),
            },
        }
    }

    pub fn active_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Consumer-side model of the live stream.
///
/// Accumulates delivered records and renders them with the same ordering as
/// the session detail endpoint. A session switch keeps what was already
/// shown.
#[derive(Debug, Default)]
pub struct LiveView {
    pub session_id: Option<String>,
    pub project_path: Option<String>,
    pub error: Option<String>,
    pub loaded: usize,
    pub total: usize,
    records: Vec<Record>,
}

impl LiveView {
    pub fn apply(&mut self, event: &TailEvent) {
        match event {
            TailEvent::Init {
                session_id,
                project_path,
            } => {
                self.session_id = Some(session_id.clone());
                self.project_path = Some(project_path.clone());
            }
            TailEvent::HistoryBatch {
                messages,
                loaded,
                total,
                ..
            } => {
                self.records.extend(messages.iter().cloned());
                self.loaded = *loaded;
                self.total = *total;
            }
            TailEvent::Message(record) => self.records.push(record.clone()),
            TailEvent::SessionSwitch {
                new_session_id,
                project_path,
                ..
            } => {
                self.session_id = Some(new_session_id.clone());
                self.project_path = Some(project_path.clone());
            }
            TailEvent::Error { error } => self.error = Some(error.clone()),
            TailEvent::Heartbeat => {}
        }
    }

    pub fn messages(&self) -> Vec<OrderedEntry> {
        let split = split_session_records(self.records.iter().cloned());
        order(split.turns, split.boundaries)
    }

    pub fn summary(&self) -> Option<String> {
        split_session_records(self.records.iter().cloned()).summary
    }
}
