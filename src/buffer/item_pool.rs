// SPDX-License-Identifier: GPL-3.0-only

//! Fixed-capacity pool of reusable items

use crate::errors::{HalError, HalResult};
use tracing::{error, warn};

/// Hands out at most `capacity` items; every acquire must be matched by a release
#[derive(Debug)]
pub struct ItemPool<T> {
    name: &'static str,
    free: Vec<T>,
    capacity: usize,
}

impl<T: Default> ItemPool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        free.resize_with(capacity, T::default);
        Self {
            name,
            free,
            capacity,
        }
    }
}

impl<T> ItemPool<T> {
    /// Pool pre-filled with `items`, handed out first to last
    pub fn from_items(name: &'static str, mut items: Vec<T>) -> Self {
        let capacity = items.len();
        items.reverse();
        Self {
            name,
            free: items,
            capacity,
        }
    }

    pub fn acquire(&mut self) -> Option<T> {
        let item = self.free.pop();
        if item.is_none() {
            warn!(pool = self.name, capacity = self.capacity, "Item pool exhausted");
        }
        item
    }

    /// Return an item; releasing more than was acquired is an invariant violation
    pub fn release(&mut self, item: T) -> HalResult<()> {
        if self.free.len() >= self.capacity {
            error!(pool = self.name, capacity = self.capacity, "Release into a full pool");
            return Err(HalError::InvariantViolation(format!(
                "{}: released more items than acquired",
                self.name
            )));
        }
        self.free.push(item);
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_balance() {
        let mut pool: ItemPool<u32> = ItemPool::new("test", 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn over_release_is_rejected() {
        let mut pool: ItemPool<u32> = ItemPool::new("test", 1);
        assert!(matches!(pool.release(7), Err(HalError::InvariantViolation(_))));
    }
}
