//! Display ordering for conversation records.
//!
//! Both the session detail endpoint and live viewers render through
//! [`order`], so a session looks the same whether it was loaded in one read
//! or assembled from a stream of incremental events.

use crate::records::{parse_instant, CompactionBoundary, Record, RecordKind};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Label shown on the divider inserted at each compaction point
pub const COMPACTION_LABEL: &str = "Context Compacted";

/// Synthetic divider rendered where the conversation was compacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionMarker {
    #[serde(rename = "type")]
    kind: &'static str,
    pub summary: String,
    #[serde(rename = "leafUuid")]
    pub leaf_uuid: String,
}

impl CompactionMarker {
    pub fn after(leaf_uuid: String) -> Self {
        Self {
            kind: "summary",
            summary: COMPACTION_LABEL.to_string(),
            leaf_uuid,
        }
    }
}

/// One entry of the rendered conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OrderedEntry {
    Record(Record),
    Marker(CompactionMarker),
}

/// Records of one session file, split by role.
#[derive(Debug, Default)]
pub struct SessionRecords {
    pub turns: Vec<Record>,
    pub boundaries: Vec<CompactionBoundary>,
    /// Last title line in the file
    pub summary: Option<String>,
}

/// Split raw session records into turns, compaction boundaries and the title.
pub fn split_session_records<I>(records: I) -> SessionRecords
where
    I: IntoIterator<Item = Record>,
{
    let mut split = SessionRecords::default();
    for record in records {
        match record.kind() {
            RecordKind::User | RecordKind::Assistant => split.turns.push(record),
            RecordKind::CompactBoundary => {
                if let Some(boundary) = record.boundary() {
                    split.boundaries.push(boundary);
                }
            }
            RecordKind::Summary => {
                if let Some(text) = record.summary_text() {
                    split.summary = Some(text.to_string());
                }
            }
            RecordKind::FileSnapshot | RecordKind::Unknown => {}
        }
    }
    split
}

/// Deduplicate by record id. A later record replaces an earlier one with the
/// same id but keeps the earlier one's position. Records without an id are
/// all kept.
pub fn dedup_last_wins<I>(records: I) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut slots: Vec<Record> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for record in records {
        match record.id().map(str::to_owned) {
            Some(id) => match position.get(&id) {
                Some(&idx) => slots[idx] = record,
                None => {
                    position.insert(id, slots.len());
                    slots.push(record);
                }
            },
            None => slots.push(record),
        }
    }

    slots
}

/// Merge conversation records and compaction boundaries into display order.
///
/// Records are deduplicated (last wins) and stably sorted by timestamp.
/// Each distinct boundary becomes a marker placed one nanosecond after its
/// parent record, or at its own timestamp when the parent is unknown.
/// The result depends only on the inputs, not on how they arrived.
pub fn order<R, B>(records: R, boundaries: B) -> Vec<OrderedEntry>
where
    R: IntoIterator<Item = Record>,
    B: IntoIterator<Item = CompactionBoundary>,
{
    let mut timed: Vec<(DateTime<Utc>, Record)> = dedup_last_wins(records)
        .into_iter()
        .map(|record| (record.instant(), record))
        .collect();
    // Stable: equal timestamps keep their input order
    timed.sort_by_key(|(at, _)| *at);

    let markers = {
        let by_id: HashMap<&str, DateTime<Utc>> = timed
            .iter()
            .filter_map(|(at, record)| record.id().map(|id| (id, *at)))
            .collect();

        let mut seen_parents = HashSet::new();
        let mut markers: Vec<(DateTime<Utc>, CompactionMarker)> = boundaries
            .into_iter()
            .filter(|b| seen_parents.insert(b.logical_parent_id.clone()))
            .map(|b| {
                let at = match by_id.get(b.logical_parent_id.as_str()) {
                    Some(parent_at) => *parent_at + Duration::nanoseconds(1),
                    None => parse_instant(&b.timestamp).unwrap_or_default(),
                };
                (at, CompactionMarker::after(b.logical_parent_id))
            })
            .collect();
        markers.sort_by_key(|(at, _)| *at);
        markers
    };

    let mut result = Vec::with_capacity(timed.len() + markers.len());
    let mut pending = markers.into_iter().peekable();

    for (at, record) in timed {
        while let Some((_, marker)) = pending.next_if(|(marker_at, _)| *marker_at <= at) {
            result.push(OrderedEntry::Marker(marker));
        }
        result.push(OrderedEntry::Record(record));
    }
    result.extend(pending.map(|(_, marker)| OrderedEntry::Marker(marker)));

    result
}
