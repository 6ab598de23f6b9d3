use hashlink::LinkedHashSet;
use std::hash::Hash;

/// Insertion-ordered set with a fixed capacity. Once full, inserting a new
/// element evicts the oldest one.
#[derive(Debug)]
pub struct BoundedSet<T: Eq + Hash> {
    items: LinkedHashSet<T>,
    capacity: usize,
}

impl<T: Eq + Hash> BoundedSet<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: LinkedHashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Returns false if the item was already present. A present item keeps
    /// its place in the eviction order.
    pub fn insert(&mut self, item: T) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.insert(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
