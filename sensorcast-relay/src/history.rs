//! Bounded, most-recent-first history of relayed records.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use sensorcast_common::Record;

/// An immutable view of the history at one instant, newest first.
///
/// Cloning is cheap; every viewer shares the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(Arc<[Record]>);

impl Snapshot {
    /// A snapshot with no records.
    pub fn empty() -> Self {
        Self(Arc::from(Vec::<Record>::new()))
    }

    /// Encode as a viewer frame: a JSON array of `{timestamp, value}` objects.
    pub fn encode_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.0)
    }

    /// Payloads in order, newest first.
    pub fn payloads(&self) -> Vec<&str> {
        self.0.iter().map(|r| r.payload.as_str()).collect()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for Snapshot {
    type Target = [Record];

    fn deref(&self) -> &[Record] {
        &self.0
    }
}

/// Fixed-capacity history buffer.
///
/// Holds at most `capacity` records; inserting into a full buffer evicts
/// the oldest one.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    records: VecDeque<Record>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Insert a record at the front and return the resulting snapshot.
    pub fn append(&mut self, record: Record) -> Snapshot {
        self.records.push_front(record);
        self.records.truncate(self.capacity);
        self.snapshot()
    }

    /// Current contents, newest first.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.records.iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
