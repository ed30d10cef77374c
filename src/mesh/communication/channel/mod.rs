//! The inbox worker threads use to hand results back to the
//! event loop.
//!
//! Senders may live on any thread; the single consumer is the loop,
//! which drains everything pending once per iteration. A bound keeps
//! runaway producers from exhausting memory.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mesh::error::*;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    bound: usize,
}

/// The sending side of an inbox.
pub struct InboxTx<T> {
    shared: Arc<Shared<T>>,
}

/// The receiving side of an inbox.
pub struct InboxRx<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a new inbox holding at most `bound` pending items.
pub fn new_inbox<T>(bound: usize) -> (InboxTx<T>, InboxRx<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        bound,
    });
    (
        InboxTx {
            shared: Arc::clone(&shared),
        },
        InboxRx { shared },
    )
}

impl<T> InboxTx<T> {
    /// Queues an item for the loop thread.
    pub fn send(&self, item: T) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.bound {
            return Err("Inbox is full").wrapped(ErrorKind::CommunicationChannel);
        }
        queue.push_back(item);
        Ok(())
    }
}

impl<T> Clone for InboxTx<T> {
    fn clone(&self) -> Self {
        InboxTx {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> InboxRx<T> {
    /// Takes everything currently pending.
    pub fn drain(&self) -> Vec<T> {
        let mut queue = self.shared.queue.lock();
        queue.drain(..).collect()
    }

    /// Takes the next pending item, if any.
    pub fn try_recv(&self) -> Option<T> {
        self.shared.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_then_drain_in_order() {
        let (tx, rx) = new_inbox(8);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(vec![1, 2], rx.drain());
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_bound_is_enforced() {
        let (tx, rx) = new_inbox(1);
        tx.send(1).unwrap();
        assert!(tx.send(2).is_err());
        assert_eq!(Some(1), rx.try_recv());
        assert!(tx.send(2).is_ok());
    }

    #[test]
    fn test_send_from_other_thread() {
        let (tx, rx) = new_inbox(8);
        let handle = std::thread::spawn(move || {
            tx.send(7).unwrap();
        });
        handle.join().unwrap();
        assert_eq!(Some(7), rx.try_recv());
    }
}
