//! Splitting large update lists into bounded chunks.
//!
//! Used by the server to bound the size of each persisted / broadcast unit of
//! a bulk mutation, and by the client to bound the work done per frame.

use crate::config::DEFAULT_CHUNK_SIZE;

/// Splits update lists into fixed-size chunks; only the last chunk may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchChunker {
    chunk_size: usize,
}

impl Default for BatchChunker {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BatchChunker {
    /// Create a chunker. A zero size is clamped to 1.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks `len` items split into. Empty input yields zero chunks.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Whether `len` items need more than one chunk.
    pub fn is_multi_chunk(&self, len: usize) -> bool {
        self.chunk_count(len) > 1
    }

    /// Split owned items into chunks, preserving order.
    pub fn split<T>(&self, items: Vec<T>) -> Vec<Vec<T>> {
        let mut chunks = Vec::with_capacity(self.chunk_count(items.len()));
        let mut iter = items.into_iter().peekable();
        while iter.peek().is_some() {
            chunks.push(iter.by_ref().take(self.chunk_size).collect());
        }
        chunks
    }

    /// Borrowing variant of [`split`](Self::split).
    pub fn chunks<'a, T>(&self, items: &'a [T]) -> std::slice::Chunks<'a, T> {
        items.chunks(self.chunk_size)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Chunking preserves every item in order and never exceeds the chunk size.
        #[test]
        fn prop_split_preserves_items_and_bounds(len in 0usize..5000, size in 1usize..1500) {
            let chunker = BatchChunker::new(size);
            let items: Vec<usize> = (0..len).collect();
            let chunks = chunker.split(items.clone());

            prop_assert_eq!(chunks.len(), chunker.chunk_count(len));
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= size));
            if let Some((last, init)) = chunks.split_last() {
                prop_assert!(init.iter().all(|c| c.len() == size));
                prop_assert!(last.len() <= size);
            }
            let flattened: Vec<usize> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(flattened, items);
        }
    }
}
