//! Narrative memory as an append-only arena.
//!
//! Events refer to each other by [`EventId`] only, and only to earlier
//! events, so the reference graph can never contain a cycle. Trimming drops
//! a prefix while every surviving id stays valid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChronicleError {
    #[error("Event {reference} is not earlier than the new event {next}")]
    ForwardReference { reference: EventId, next: EventId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChronicleEvent {
    pub id: EventId,
    pub summary: String,
    /// Who or what the event is about
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Earlier events this one follows from
    #[serde(default)]
    pub references: Vec<EventId>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Chronicle {
    events: VecDeque<ChronicleEvent>,
    next_id: u64,
}

impl Chronicle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. References to trimmed events are kept as plain ids.
    pub fn record(
        &mut self,
        summary: impl Into<String>,
        subjects: Vec<String>,
        references: Vec<EventId>,
    ) -> Result<EventId, ChronicleError> {
        let id = EventId(self.next_id);
        if let Some(&reference) = references.iter().find(|r| **r >= id) {
            return Err(ChronicleError::ForwardReference { reference, next: id });
        }
        self.events.push_back(ChronicleEvent {
            id,
            summary: summary.into(),
            subjects,
            references,
            recorded_at: Utc::now(),
        });
        self.next_id += 1;
        Ok(id)
    }

    pub fn get(&self, id: EventId) -> Option<&ChronicleEvent> {
        let first = self.events.front()?.id.0;
        let offset = id.0.checked_sub(first)?;
        self.events.get(usize::try_from(offset).ok()?)
    }

    /// The last `limit` events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<&ChronicleEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).collect()
    }

    pub fn about(&self, subject: &str) -> Vec<&ChronicleEvent> {
        self.events
            .iter()
            .filter(|e| e.subjects.iter().any(|s| s == subject))
            .collect()
    }

    /// Drop every event older than `id`; returns how many were dropped
    pub fn trim_before(&mut self, id: EventId) -> usize {
        let mut dropped = 0;
        while self.events.front().is_some_and(|e| e.id < id) {
            self.events.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Summaries of recent events, for a content agent's context snapshot
    pub fn context(&self, limit: usize) -> Value {
        let events: Vec<Value> = self
            .recent(limit)
            .into_iter()
            .map(|e| json!({ "id": e.id, "summary": e.summary, "subjects": e.subjects }))
            .collect();
        Value::Array(events)
    }
}
