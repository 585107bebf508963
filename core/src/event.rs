//! Events and the per-execution event queue.

use crate::tag::Tag;
use crate::value::StructValue;
use serde::{Deserialize, Serialize};

/// An event sent to a running tree, with an optional struct payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tag: Tag,
    pub payload: Option<StructValue>,
    /// Name of the sender, for diagnostics.
    pub origin: Option<String>,
}

impl Event {
    pub fn new(tag: impl Into<Tag>) -> Self {
        Event {
            tag: tag.into(),
            payload: None,
            origin: None,
        }
    }

    pub fn with_payload(mut self, payload: StructValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn payload_type(&self) -> Option<&str> {
        self.payload.as_ref().map(StructValue::type_name)
    }
}

/// What an event must look like to trigger a transition or allow a selection.
///
/// An empty descriptor matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventDesc {
    pub tag: Option<Tag>,
    pub payload_type: Option<String>,
}

impl EventDesc {
    pub fn tag(tag: impl Into<Tag>) -> Self {
        EventDesc {
            tag: Some(tag.into()),
            payload_type: None,
        }
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.tag.is_some() || self.payload_type.is_some()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.is_valid() {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !event.tag.matches(tag) {
                return false;
            }
        }
        if let Some(expected) = &self.payload_type {
            let Some(payload) = &event.payload else {
                return false;
            };
            if !is_type_or_parent(payload, expected) {
                return false;
            }
        }
        true
    }
}

fn is_type_or_parent(value: &StructValue, name: &str) -> bool {
    let mut ty = Some(value.ty());
    while let Some(current) = ty {
        if current.name() == name {
            return true;
        }
        ty = current.parent();
    }
    false
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub event: Event,
    pub consumed: bool,
}

/// Bounded queue of pending events. Overflow drops the new event.
#[derive(Debug, Clone)]
pub struct EventQueue {
    events: Vec<QueuedEvent>,
    capacity: usize,
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::with_capacity(64)
    }
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        EventQueue {
            events: Vec::new(),
            capacity,
        }
    }

    /// Enqueues an event. Returns false if the queue is full.
    pub fn send(&mut self, event: Event) -> bool {
        if self.events.len() >= self.capacity {
            tracing::warn!(
                tag = %event.tag,
                capacity = self.capacity,
                "event queue full, dropping event"
            );
            return false;
        }
        tracing::trace!(tag = %event.tag, "event queued");
        self.events.push(QueuedEvent {
            event,
            consumed: false,
        });
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedEvent> {
        self.events.iter()
    }

    /// Index of the first event not yet consumed that matches `desc`.
    pub fn find(&self, desc: &EventDesc) -> Option<usize> {
        self.events
            .iter()
            .position(|e| !e.consumed && desc.matches(&e.event))
    }

    pub fn contains(&self, desc: &EventDesc) -> bool {
        self.find(desc).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events.get(index).map(|e| &e.event)
    }

    pub fn consume(&mut self, index: usize) {
        if let Some(event) = self.events.get_mut(index) {
            event.consumed = true;
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Drops the oldest `count` events, keeping anything queued after them.
    pub fn retire(&mut self, count: usize) {
        let count = count.min(self.events.len());
        self.events.drain(..count);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
