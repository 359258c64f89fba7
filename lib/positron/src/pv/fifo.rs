//! Bounded monitor update queue with an optional pipeline window.
//!
//! When the queue is full a new update is either squashed into the newest
//! queued element (default, newest data wins and doubly-posted bits are
//! recorded as overrun) or, with drop-on-full, the oldest unsent element is
//! discarded. With pipelining the consumer side stops delivering once the
//! window is exhausted until the peer acknowledges.

use crate::pv::MonitorElement;
use std::collections::VecDeque;

pub const DEFAULT_QUEUE_SIZE: usize = 4;

pub struct MonitorFIFO {
    queue: VecDeque<MonitorElement>,
    bound: usize,
    drop_on_full: bool,
    /// Remaining pipeline window, None when pipelining is off.
    window: Option<u32>,
}

impl MonitorFIFO {
    pub fn new(bound: usize, drop_on_full: bool, pipeline: bool) -> MonitorFIFO {
        let bound = if bound == 0 { DEFAULT_QUEUE_SIZE } else { bound };
        MonitorFIFO {
            queue: VecDeque::with_capacity(bound),
            bound,
            drop_on_full,
            window: if pipeline { Some(bound as u32) } else { None },
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn window(&self) -> Option<u32> {
        self.window
    }

    /// Queues an update. Returns true when the queue was empty before, the
    /// signal for the owner to notify its requester.
    pub fn post(&mut self, element: MonitorElement) -> bool {
        let was_empty = self.queue.is_empty();

        if self.queue.len() >= self.bound {
            if self.drop_on_full {
                self.queue.pop_front();
                self.queue.push_back(element);
            } else {
                // squash into the newest element so the freshest data and
                // the full set of changed bits survive
                let newest = self.queue.back_mut().expect("bound is never zero");
                let mut twice = element.changed.clone();
                twice.and_with(&newest.changed);
                newest.overrun.or_with(&twice);
                newest.value.copy_from_masked(&element.value, &element.changed);
                newest.changed.or_with(&element.changed);
            }
            return was_empty;
        }

        self.queue.push_back(element);
        was_empty
    }

    /// Takes the next deliverable update, consuming one window slot.
    pub fn poll(&mut self) -> Option<MonitorElement> {
        if let Some(window) = self.window {
            if window == 0 {
                return None;
            }
        }
        let element = self.queue.pop_front()?;
        if let Some(window) = self.window.as_mut() {
            *window -= 1;
        }
        Some(element)
    }

    /// Reopens `count` window slots. Returns true when queued updates are
    /// now deliverable again.
    pub fn ack(&mut self, count: u32) -> bool {
        match self.window.as_mut() {
            Some(window) => {
                *window = window.saturating_add(count);
                !self.queue.is_empty()
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bitset::BitSet;
    use crate::data::value::{Field, PVField, PVStructure, ScalarKind, Structure};
    use std::sync::Arc;

    fn int_type() -> Arc<Structure> {
        Structure::new("", vec![("value".to_owned(), Field::Scalar(ScalarKind::Int))])
    }

    fn element(value: i32) -> MonitorElement {
        let mut pv = PVStructure::new_default(int_type());
        pv.set("value", PVField::Int(value)).unwrap();
        MonitorElement {
            value: pv,
            changed: BitSet::of(1),
            overrun: BitSet::new(),
        }
    }

    #[test]
    fn test_fifo_order_and_notify_signal() {
        let mut fifo = MonitorFIFO::new(4, false, false);
        assert!(fifo.post(element(1)));
        assert!(!fifo.post(element(2)));

        assert_eq!(fifo.poll().unwrap().value.get("value").unwrap().as_int(), Some(1));
        assert_eq!(fifo.poll().unwrap().value.get("value").unwrap().as_int(), Some(2));
        assert!(fifo.poll().is_none());
    }

    #[test]
    fn test_squash_on_full_keeps_newest() {
        let mut fifo = MonitorFIFO::new(2, false, false);
        fifo.post(element(1));
        fifo.post(element(2));
        fifo.post(element(3));
        assert_eq!(fifo.len(), 2);

        assert_eq!(fifo.poll().unwrap().value.get("value").unwrap().as_int(), Some(1));
        let squashed = fifo.poll().unwrap();
        assert_eq!(squashed.value.get("value").unwrap().as_int(), Some(3));
        // bit 1 was posted twice into the same element
        assert!(squashed.overrun.get(1));
    }

    #[test]
    fn test_drop_on_full_discards_oldest() {
        let mut fifo = MonitorFIFO::new(2, true, false);
        fifo.post(element(1));
        fifo.post(element(2));
        fifo.post(element(3));

        assert_eq!(fifo.poll().unwrap().value.get("value").unwrap().as_int(), Some(2));
        assert_eq!(fifo.poll().unwrap().value.get("value").unwrap().as_int(), Some(3));
        assert!(fifo.poll().is_none());
    }

    #[test]
    fn test_pipeline_window_blocks_and_resumes() {
        let mut fifo = MonitorFIFO::new(2, false, true);
        fifo.post(element(1));
        fifo.post(element(2));

        assert!(fifo.poll().is_some());
        assert!(fifo.poll().is_some());
        // window exhausted: element stays queued
        fifo.post(element(3));
        assert!(fifo.poll().is_none());
        assert_eq!(fifo.len(), 1);

        assert!(fifo.ack(1));
        assert_eq!(fifo.poll().unwrap().value.get("value").unwrap().as_int(), Some(3));
        assert!(!fifo.ack(1));
    }
}
