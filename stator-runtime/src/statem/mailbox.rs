//! Bounded FIFO mailbox

use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Enqueue at the tail; a full mailbox hands the message back
    pub fn put(&self, msg: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(msg);
        }
        queue.push_back(msg);
        Ok(())
    }

    pub fn get(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_capacity() {
        let mailbox = Mailbox::new(2);
        assert!(mailbox.put(1).is_ok());
        assert!(mailbox.put(2).is_ok());
        assert_eq!(mailbox.put(3), Err(3));
        assert_eq!(mailbox.len(), 2);

        assert_eq!(mailbox.get(), Some(1));
        assert!(mailbox.put(3).is_ok());
        assert_eq!(mailbox.get(), Some(2));
        assert_eq!(mailbox.get(), Some(3));
        assert!(mailbox.is_empty());
    }
}
