//! Pending-call buffer owned by the lifecycle manager. Holds everything
//! submitted before the vendor SDK is ready: an ordered event queue, a
//! merged attribute map, and the desired user id.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

use crate::models::TrackingEvent;

/// Events queued beyond this are dropped oldest-first. Initialization that
/// takes long enough to hit this bound has effectively failed anyway.
const MAX_PENDING_EVENTS: usize = 500;

#[derive(Debug, Default)]
pub struct PendingQueue {
    events: VecDeque<TrackingEvent>,
    attributes: serde_json::Map<String, Value>,
    user_id: Option<String>,
}

/// Everything drained out of the queue, in submission order.
#[derive(Debug, Default)]
pub struct DrainedQueue {
    pub user_id: Option<String>,
    pub events: Vec<TrackingEvent>,
    pub attributes: serde_json::Map<String, Value>,
}

impl PendingQueue {
    pub fn push_event(&mut self, event: TrackingEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            if let Some(dropped) = self.events.pop_front() {
                warn!(
                    event_name = %dropped.event_name,
                    "pending event queue full, dropping oldest event"
                );
            }
        }
        self.events.push_back(event);
    }

    /// Merge new attributes over any previously buffered ones
    /// (last-write-wins per key, not replacement of the whole map).
    pub fn merge_attributes(&mut self, attributes: serde_json::Map<String, Value>) {
        for (key, value) in attributes {
            self.attributes.insert(key, value);
        }
    }

    pub fn set_user_id(&mut self, user_id: &str) {
        self.user_id = Some(user_id.to_string());
    }

    pub fn clear_user_state(&mut self) {
        self.user_id = None;
        self.attributes.clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.attributes.is_empty() && self.user_id.is_none()
    }

    /// Take only the buffered attributes, leaving events and user id in
    /// place. Used when attributes were parked waiting for identification.
    pub fn take_attributes(&mut self) -> serde_json::Map<String, Value> {
        std::mem::take(&mut self.attributes)
    }

    /// Take everything, leaving the queue empty. Called exactly once per
    /// successful initialization.
    pub fn drain(&mut self) -> DrainedQueue {
        DrainedQueue {
            user_id: self.user_id.take(),
            events: self.events.drain(..).collect(),
            attributes: std::mem::take(&mut self.attributes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> TrackingEvent {
        TrackingEvent::new(name, None)
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let mut queue = PendingQueue::default();
        queue.push_event(event("first"));
        queue.push_event(event("second"));
        queue.push_event(event("third"));

        let drained = queue.drain();
        let names: Vec<_> = drained.events.iter().map(|e| e.event_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_is_empty_second_time() {
        let mut queue = PendingQueue::default();
        queue.push_event(event("only"));
        assert_eq!(queue.drain().events.len(), 1);
        assert!(queue.drain().events.is_empty());
    }

    #[test]
    fn attributes_merge_last_write_wins() {
        let mut queue = PendingQueue::default();
        let mut first = serde_json::Map::new();
        first.insert("plan".into(), "free".into());
        first.insert("company".into(), "GreenScape".into());
        queue.merge_attributes(first);

        let mut second = serde_json::Map::new();
        second.insert("plan".into(), "pro".into());
        queue.merge_attributes(second);

        let drained = queue.drain();
        assert_eq!(drained.attributes["plan"], "pro");
        assert_eq!(drained.attributes["company"], "GreenScape");
    }

    #[test]
    fn queue_bound_drops_oldest() {
        let mut queue = PendingQueue::default();
        for i in 0..(MAX_PENDING_EVENTS + 5) {
            queue.push_event(event(&format!("e{i}")));
        }
        let drained = queue.drain();
        assert_eq!(drained.events.len(), MAX_PENDING_EVENTS);
        assert_eq!(drained.events[0].event_name, "e5");
    }
}
