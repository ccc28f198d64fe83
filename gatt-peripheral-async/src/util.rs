use std::cell::Cell;
use std::mem::ManuallyDrop;
use std::ops::Deref;

use futures_channel::mpsc;

/// Runs a closure when dropped, unless defused first.
pub struct ScopeGuard<F: FnOnce()> {
    dropfn: ManuallyDrop<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        // SAFETY: `self` is forgotten right after, so `dropfn` is never touched again.
        unsafe { ManuallyDrop::drop(&mut self.dropfn) }
        std::mem::forget(self)
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        // SAFETY: `dropfn` is `ManuallyDrop` and is taken exactly once, here.
        let dropfn = unsafe { ManuallyDrop::take(&mut self.dropfn) };
        dropfn();
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: ManuallyDrop::new(dropfn),
    }
}

/// A broadcast sender that never closes and drops the oldest message on overflow.
pub struct BroadcastSender<T> {
    sender: async_broadcast::Sender<T>,
    _keep_alive: async_broadcast::InactiveReceiver<T>,
}

impl<T> Deref for BroadcastSender<T> {
    type Target = async_broadcast::Sender<T>;

    fn deref(&self) -> &Self::Target {
        &self.sender
    }
}

pub type BroadcastReceiver<T> = async_broadcast::Receiver<T>;

pub fn broadcast<T>(cap: usize) -> BroadcastSender<T> {
    let (mut sender, receiver) = async_broadcast::broadcast(cap);
    sender.set_overflow(true);
    BroadcastSender {
        sender,
        _keep_alive: receiver.deactivate(),
    }
}

/// A broadcast channel that only keeps the latest value.
pub fn watch<T>() -> BroadcastSender<T> {
    broadcast(1)
}

/// At most one unbounded consumer; registering a new one replaces (and closes) the previous.
pub struct Exclusive<T> {
    sender: Cell<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Exclusive<T> {
    fn default() -> Self {
        Self {
            sender: Cell::new(None),
        }
    }
}

impl<T> Exclusive<T> {
    pub fn register(&self) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded();
        self.sender.set(Some(sender));
        receiver
    }

    /// Hands `value` to the consumer, or back to the caller if there is none.
    pub fn send(&self, value: T) -> Result<(), T> {
        let Some(sender) = self.sender.take() else {
            return Err(value);
        };
        match sender.unbounded_send(value) {
            Ok(()) => {
                self.sender.set(Some(sender));
                Ok(())
            }
            Err(err) => Err(err.into_inner()),
        }
    }
}
