// Fixed-capacity membership set with FIFO eviction.
//
// A connection has to remember which sequence IDs it has already delivered
// (to drop duplicates) and which of its own packets the peer has
// acknowledged (to stop resending them). Sequence IDs wrap every 65535
// reliable packets, so neither record can grow forever: `RotatingIdSet`
// keeps only the most recent `capacity` insertions. When a new ID pushes the
// window past capacity, the oldest insertion is forgotten.
//
// Invariant: the keys of `members` are exactly the distinct values in
// `order`, and `order.len() <= capacity`. The same ID may be inserted more
// than once; `members` counts occurrences so that evicting an old copy does
// not drop an ID whose newer copy is still inside the window.

use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::FxHashMap;

/// Membership set that forgets its oldest entries beyond `capacity`.
#[derive(Clone, Debug)]
pub struct RotatingIdSet<T> {
    capacity: usize,
    order: VecDeque<T>,
    members: FxHashMap<T, u32>,
}

impl<T: Copy + Eq + Hash> RotatingIdSet<T> {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rotating set capacity must be non-zero");
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: FxHashMap::default(),
        }
    }

    /// Record `id`, evicting the oldest entry if the window is full.
    pub fn add(&mut self, id: T) {
        while self.order.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.forget_one(oldest);
        }
        self.order.push_back(id);
        *self.members.entry(id).or_insert(0) += 1;
    }

    /// True if `id` is inside the live window.
    pub fn contains(&self, id: &T) -> bool {
        self.members.contains_key(id)
    }

    /// Number of distinct IDs in the window.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn forget_one(&mut self, id: T) {
        if let Some(count) = self.members.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.members.remove(&id);
            }
        }
    }
}
