//! Bounded batching buffer
//!
//! A fixed-capacity FIFO that rejects new items once full, until the owner
//! drains it with [`BoundedBuffer::get_all`].

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::record::Record;

/// Fixed-capacity accumulator for batching records
#[derive(Debug)]
pub struct BoundedBuffer<T = Record> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an item.
    ///
    /// Returns `Error::BufferFull` (and drops nothing) at capacity.
    pub fn add(&self, item: T) -> Result<()> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(Error::BufferFull {
                capacity: self.capacity,
            });
        }
        items.push(item);
        Ok(())
    }

    /// Take every item, leaving the buffer empty
    pub fn get_all(&self) -> Vec<T> {
        let mut items = self.items.lock();
        std::mem::replace(&mut *items, Vec::with_capacity(self.capacity))
    }

    /// Drop every item
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn is_full(&self) -> bool {
        self.items.lock().len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedBuffer<T> {
    /// Copy every item without draining
    pub fn peek_all(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}
