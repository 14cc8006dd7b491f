//! Fixed-capacity ring buffer.
//!
//! Storage is allocated once up to capacity; once full, each push
//! overwrites the oldest slot in place.

/// Bounded history, oldest entry evicted first.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    start: usize,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            slots: Vec::with_capacity(capacity),
            start: 0,
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
        } else {
            self.slots[self.start] = value;
            self.start = (self.start + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            ring: self,
            front: 0,
            back: self.slots.len(),
        }
    }

    /// The newest `n` entries (or fewer), oldest first.
    pub fn latest(&self, n: usize) -> Iter<'_, T> {
        let len = self.slots.len();
        Iter {
            ring: self,
            front: len - n.min(len),
            back: len,
        }
    }

    /// Entry `i` counted from the oldest.
    pub fn get(&self, i: usize) -> Option<&T> {
        (i < self.slots.len()).then(|| &self.slots[(self.start + i) % self.slots.len()])
    }

    pub fn last(&self) -> Option<&T> {
        self.slots.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.start = 0;
    }

    /// Change capacity, keeping the newest entries that still fit.
    pub fn resize(&mut self, capacity: usize)
    where
        T: Clone,
    {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        if capacity == self.capacity {
            return;
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.extend(self.latest(capacity).cloned());
        self.slots = slots;
        self.start = 0;
        self.capacity = capacity;
    }
}

/// Iterator over a [`RingBuffer`], oldest first.
pub struct Iter<'a, T> {
    ring: &'a RingBuffer<T>,
    front: usize,
    back: usize,
}

impl<'a, T> Clone for Iter<'a, T> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring,
            front: self.front,
            back: self.back,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.front >= self.back {
            return None;
        }
        let item = self.ring.get(self.front);
        self.front += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<'a, T> DoubleEndedIterator for Iter<'a, T> {
    fn next_back(&mut self) -> Option<&'a T> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        self.ring.get(self.back)
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
