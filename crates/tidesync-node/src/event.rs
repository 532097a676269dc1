//! Captured change events
//!
//! An [`Event`] is immutable once produced. Stages that need a different
//! shape derive a new event (see [`Event::retarget`]) instead of mutating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of change captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Insert,
    Update,
    Delete,
    Truncate,
}

/// Source position marker used to resume a connector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub String);

impl Position {
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A captured change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    table: Arc<str>,
    op: EventOp,
    position: Position,
    payload: serde_json::Value,
    captured_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        table: impl Into<Arc<str>>,
        op: EventOp,
        position: Position,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            table: table.into(),
            op,
            position,
            payload,
            captured_at: Utc::now(),
        }
    }

    /// Originating table
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn op(&self) -> EventOp {
        self.op
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Derive the same change addressed to another table
    pub fn retarget(&self, table: impl Into<Arc<str>>) -> Self {
        Self {
            table: table.into(),
            ..self.clone()
        }
    }
}

/// Events from one fetch cycle, in capture order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBatch {
    events: Vec<Event>,
}

impl EventBatch {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Position of the last event, used as the batch's resume point
    pub fn last_position(&self) -> Option<&Position> {
        self.events.last().map(Event::position)
    }

    /// Summary used to name a batch in logs
    pub fn describe(&self) -> BatchDescriptor {
        BatchDescriptor {
            events: self.events.len(),
            first_position: self.events.first().map(|e| e.position.clone()),
            last_position: self.events.last().map(|e| e.position.clone()),
        }
    }
}

impl From<Vec<Event>> for EventBatch {
    fn from(events: Vec<Event>) -> Self {
        Self::new(events)
    }
}

impl FromIterator<Event> for EventBatch {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for EventBatch {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Identity of a batch for drain reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub events: usize,
    pub first_position: Option<Position>,
    pub last_position: Option<Position>,
}

impl std::fmt::Display for BatchDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.first_position, &self.last_position) {
            (Some(first), Some(last)) => {
                write!(f, "{} events [{}..{}]", self.events, first, last)
            }
            _ => write!(f, "{} events", self.events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pos: &str) -> Event {
        Event::new(
            "shop.orders",
            EventOp::Insert,
            Position::new(pos),
            serde_json::json!({"id": 1}),
        )
    }

    #[test]
    fn test_retarget_keeps_position() {
        let original = event("binlog.000001:120");
        let mapped = original.retarget("dw.orders");

        assert_eq!(mapped.table(), "dw.orders");
        assert_eq!(mapped.position(), original.position());
        assert_eq!(original.table(), "shop.orders");
    }

    #[test]
    fn test_batch_descriptor() {
        let batch: EventBatch = vec![event("1"), event("2"), event("3")].into();
        let desc = batch.describe();

        assert_eq!(desc.events, 3);
        assert_eq!(desc.to_string(), "3 events [1..3]");
        assert_eq!(batch.last_position(), Some(&Position::new("3")));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event("binlog.000001:120")).unwrap();
        assert_eq!(json["table"], "shop.orders");
        assert_eq!(json["payload"]["id"], 1);

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.table(), "shop.orders");
        assert_eq!(parsed.position(), &Position::new("binlog.000001:120"));
    }

    #[test]
    fn test_empty_batch_descriptor() {
        let batch = EventBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.describe().to_string(), "0 events");
    }
}
