use std::collections::VecDeque;

use crate::central::Central;
use crate::characteristic::CharacteristicId;

/// A characteristic value update waiting to be sent to one central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub central: Central,
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

/// Bounded outbound queue with all-or-nothing admission.
///
/// A rejected batch arms a single readiness signal, which the next drain that frees
/// capacity consumes.
#[derive(Debug)]
pub(crate) struct NotificationQueue {
    capacity: usize,
    items: VecDeque<Notification>,
    waiting_for_ready: bool,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
            waiting_for_ready: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.items.len()
    }

    /// Enqueues every notification or none of them.
    pub fn try_push_all(&mut self, batch: Vec<Notification>) -> bool {
        if batch.len() > self.remaining() {
            self.waiting_for_ready = true;
            return false;
        }
        self.items.extend(batch);
        true
    }

    /// Removes up to `max` notifications from the front.
    ///
    /// The returned flag is set when this drain freed capacity while a producer was waiting;
    /// it is set at most once per rejected batch.
    pub fn drain(&mut self, max: usize) -> (Vec<Notification>, bool) {
        let n = max.min(self.items.len());
        let drained: Vec<_> = self.items.drain(..n).collect();
        let ready = !drained.is_empty() && std::mem::take(&mut self.waiting_for_ready);
        (drained, ready)
    }

    /// Drops queued notifications matching `pred`.
    ///
    /// Like [`drain()`](Self::drain), returns whether this freed capacity for a waiting producer.
    pub fn remove_where(&mut self, pred: impl Fn(&Notification) -> bool) -> bool {
        let before = self.items.len();
        self.items.retain(|n| !pred(n));
        self.items.len() < before && std::mem::take(&mut self.waiting_for_ready)
    }

    /// Empties the queue and forgets any pending readiness signal.
    pub fn clear(&mut self) {
        self.items.clear();
        self.waiting_for_ready = false;
    }
}
