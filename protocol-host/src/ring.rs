/// Fixed-capacity circular buffer holding the newest samples seen before a trigger.
///
/// Once full, each push overwrites the oldest entry. A zero-capacity ring
/// accepts pushes and stays empty.
#[derive(Debug, Clone)]
pub struct PretrigRing<T> {
    entries: Vec<T>,
    capacity: usize,
    write: usize,
}

impl<T: Copy> PretrigRing<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(value);
        } else {
            self.entries[self.write] = value;
        }
        self.write = (self.write + 1) % self.capacity;
    }

    pub fn extend_from_slice(&mut self, values: &[T]) {
        // Only the newest `capacity` values can survive.
        let skip = values.len().saturating_sub(self.capacity);
        for &value in &values[skip..] {
            self.push(value);
        }
    }

    /// The newest `count` entries, oldest first.
    pub fn newest(&self, count: usize) -> impl Iterator<Item = T> + '_ {
        let count = count.min(self.entries.len());
        let (head, tail) = if self.entries.len() < self.capacity {
            (&self.entries[..], &[][..])
        } else {
            // `write` is the oldest entry once the ring has wrapped.
            let (newer, older) = self.entries.split_at(self.write);
            (older, newer)
        };
        head.iter()
            .chain(tail.iter())
            .skip(self.entries.len() - count)
            .copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.write = 0;
    }

    /// Drop the storage as well as the contents.
    pub fn release(&mut self) {
        self.entries = Vec::new();
        self.write = 0;
    }
}
