//! Bounded, ordered message batches

use std::mem;

/// Items accumulated until a size threshold, then taken as a whole.
#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<T>,
    max_size: usize,
}

impl<T> Batch<T> {
    /// A `max_size` of zero is treated as one.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Appends `item`, returning `true` when the batch is now full.
    pub fn push(&mut self, item: T) -> bool {
        self.items.push(item);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Empties the batch, returning its items in insertion order.
    pub fn take(&mut self) -> Vec<T> {
        mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
