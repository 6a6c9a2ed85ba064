/// Scratch buffer that grows geometrically up to a hard limit.
///
/// Once at the limit it stops growing; the owner flushes it whenever
/// [`StagingBuffer::is_full`] reports true.
#[derive(Debug)]
pub struct StagingBuffer<T> {
    data: Vec<T>,
    limit: usize,
}

impl<T: Copy> StagingBuffer<T> {
    pub fn new(initial: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            data: Vec::with_capacity(initial.clamp(1, limit)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.limit
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append an item. The caller flushes first when the buffer is full.
    pub fn push(&mut self, item: T) {
        debug_assert!(!self.is_full(), "staging buffer pushed past its limit");
        if self.data.len() == self.data.capacity() {
            let grown = (self.data.capacity() * 2).min(self.limit);
            self.data.reserve_exact(grown.saturating_sub(self.data.len()).max(1));
        }
        self.data.push(item);
    }

    /// Hand the staged items to `f`, then clear the buffer keeping its capacity.
    pub fn drain_with<R>(&mut self, f: impl FnOnce(&[T]) -> R) -> R {
        let result = f(&self.data);
        self.data.clear();
        result
    }
}
