//! Pending entity queue.
//!
//! FIFO of entities not yet acknowledged by the server. At most one entity
//! is in flight (written, awaiting its acknowledgment); it is always the
//! head of the queue and is only removed once its tag is acknowledged.

use std::collections::VecDeque;

use crate::protocol::Entity;

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<Entity>,
    in_flight: Option<i64>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entity: Entity) {
        self.entries.push_back(entity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tag of the entity currently written but not yet acknowledged.
    pub fn in_flight(&self) -> Option<i64> {
        self.in_flight
    }

    /// Mark the head in flight and return it for writing.
    ///
    /// Returns `None` when not `ready`, when a write is already in flight,
    /// or when the queue is empty.
    pub fn begin_dispatch(&mut self, ready: bool) -> Option<Entity> {
        if !ready || self.in_flight.is_some() {
            return None;
        }
        let head = self.entries.front()?.clone();
        self.in_flight = Some(head.tag);
        Some(head)
    }

    /// Remove the in-flight entity if `tag` acknowledges it.
    ///
    /// Acknowledgments for any other tag (e.g. a write abandoned by an
    /// earlier connection) are ignored and return `false`.
    pub fn acknowledge(&mut self, tag: i64) -> bool {
        if self.in_flight != Some(tag) {
            return false;
        }
        self.in_flight = None;
        self.entries.pop_front();
        true
    }

    /// Drop the in-flight entity after its connection was lost.
    pub fn abandon_in_flight(&mut self) -> Option<Entity> {
        self.in_flight.take()?;
        self.entries.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entries.iter()
    }
}
