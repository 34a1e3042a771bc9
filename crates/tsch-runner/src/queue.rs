//! Keyed event queue.
//!
//! Events are ordered by `(asn, priority, insertion sequence)`. An event may
//! carry a [`UniqueTag`]; scheduling another event with the same tag drops
//! the pending one if it lies strictly after the current slot.

use std::collections::{BTreeMap, HashMap};
use tsch_common::{Asn, Callback, NodeId, SfAction, UniqueTag};

/// What an event does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Scheduling-function callback on a mote.
    Sf {
        /// Owning mote.
        node: NodeId,
        /// Action to run.
        action: SfAction,
    },
    /// One pass of the MAC over every schedule.
    Slotframe,
    /// Scripted parent switch (index into the model's list).
    ParentSwitch(usize),
}

/// A queued event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Slot at which the event fires.
    pub asn: Asn,
    /// Lower runs first among events at the same slot.
    pub priority: u8,
    /// Deduplication key, if any.
    pub tag: Option<UniqueTag>,
    /// What to do.
    pub kind: EventKind,
}

impl From<Callback> for Event {
    fn from(cb: Callback) -> Self {
        Event {
            asn: cb.asn,
            priority: cb.priority,
            tag: Some(cb.tag),
            kind: EventKind::Sf {
                node: cb.tag.node,
                action: cb.action,
            },
        }
    }
}

type Key = (Asn, u8, u64);

/// Min-queue of events with tag replacement.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<Key, Event>,
    tags: HashMap<UniqueTag, Key>,
    next_seq: u64,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        EventQueue::default()
    }

    /// Insert an event.
    ///
    /// A tagged event replaces the pending event with the same tag when that
    /// one fires after `now`; an event due at `now` is kept and still fires.
    pub fn schedule(&mut self, now: Asn, event: Event) {
        if let Some(tag) = event.tag {
            if let Some(old) = self.tags.remove(&tag) {
                if old.0 > now {
                    self.events.remove(&old);
                }
            }
        }

        let key = (event.asn, event.priority, self.next_seq);
        self.next_seq += 1;
        if let Some(tag) = event.tag {
            self.tags.insert(tag, key);
        }
        self.events.insert(key, event);
    }

    /// Remove and return the earliest event.
    pub fn pop(&mut self) -> Option<Event> {
        let (key, event) = self.events.pop_first()?;
        if let Some(tag) = event.tag {
            if self.tags.get(&tag) == Some(&key) {
                self.tags.remove(&tag);
            }
        }
        Some(event)
    }

    /// Slot of the earliest event.
    pub fn peek_asn(&self) -> Option<Asn> {
        self.events.keys().next().map(|key| key.0)
    }

    /// Pending event with the given tag, if any.
    pub fn pending(&self, tag: &UniqueTag) -> Option<&Event> {
        self.tags.get(tag).and_then(|key| self.events.get(key))
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsch_common::Purpose;

    fn sf_event(asn: u64, priority: u8, purpose: Purpose) -> Event {
        let tag = UniqueTag::new(NodeId(1), purpose);
        Event {
            asn: Asn::from_slots(asn),
            priority,
            tag: Some(tag),
            kind: EventKind::Sf {
                node: NodeId(1),
                action: SfAction::Housekeeping,
            },
        }
    }

    fn plain(asn: u64, priority: u8) -> Event {
        Event {
            asn: Asn::from_slots(asn),
            priority,
            tag: None,
            kind: EventKind::Slotframe,
        }
    }

    #[test]
    fn test_order_by_asn_priority_then_insertion() {
        let mut queue = EventQueue::new();
        queue.schedule(Asn::ZERO, plain(10, 4));
        queue.schedule(Asn::ZERO, plain(5, 4));
        queue.schedule(Asn::ZERO, plain(10, 1));
        queue.schedule(
            Asn::ZERO,
            Event {
                kind: EventKind::ParentSwitch(7),
                ..plain(10, 4)
            },
        );

        let order: Vec<(u64, u8, EventKind)> = std::iter::from_fn(|| queue.pop())
            .map(|e| (e.asn.as_u64(), e.priority, e.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                (5, 4, EventKind::Slotframe),
                (10, 1, EventKind::Slotframe),
                (10, 4, EventKind::Slotframe),
                (10, 4, EventKind::ParentSwitch(7)),
            ]
        );
    }

    #[test]
    fn test_same_tag_replaces_future_event() {
        let mut queue = EventQueue::new();
        queue.schedule(Asn::ZERO, sf_event(100, 4, Purpose::Housekeeping));
        queue.schedule(Asn::ZERO, sf_event(50, 4, Purpose::Housekeeping));
        queue.schedule(Asn::ZERO, sf_event(60, 4, Purpose::ParentChange));

        assert_eq!(queue.len(), 2);
        let tag = UniqueTag::new(NodeId(1), Purpose::Housekeeping);
        assert_eq!(queue.pending(&tag).map(|e| e.asn), Some(Asn::from_slots(50)));
        assert_eq!(queue.pop().map(|e| e.asn.as_u64()), Some(50));
        assert!(queue.pending(&tag).is_none());
    }

    #[test]
    fn test_same_tag_keeps_event_due_now() {
        let mut queue = EventQueue::new();
        queue.schedule(Asn::ZERO, sf_event(20, 4, Purpose::BandwidthIncrement));
        queue.schedule(Asn::from_slots(20), sf_event(21, 4, Purpose::BandwidthIncrement));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|e| e.asn.as_u64()), Some(20));
        assert_eq!(queue.pop().map(|e| e.asn.as_u64()), Some(21));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_callback_conversion() {
        let tag = UniqueTag::new(NodeId(3), Purpose::BandwidthDecrement);
        let event = Event::from(Callback {
            asn: Asn::from_slots(9),
            priority: 4,
            tag,
            action: SfAction::BandwidthDecrement,
        });
        assert_eq!(event.tag, Some(tag));
        assert_eq!(
            event.kind,
            EventKind::Sf {
                node: NodeId(3),
                action: SfAction::BandwidthDecrement
            }
        );
    }
}
