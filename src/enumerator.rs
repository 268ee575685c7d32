//! Restartable cursor used for format and pin enumeration

use std::sync::Arc;

/// Cursor over a list fixed at construction.
///
/// The list is shared, the position is not: clones walk independently, so a
/// cursor can be handed to any number of negotiating peers.
#[derive(Debug)]
pub struct Enumerator<T> {
    items: Arc<[T]>,
    index: usize,
}

impl<T> Enumerator<T> {
    pub fn new(items: Arc<[T]>) -> Self {
        Self { items, index: 0 }
    }

    /// Advance the cursor by `count` entries.
    ///
    /// Returns true if entries remain after the skip.
    pub fn skip_ahead(&mut self, count: usize) -> bool {
        self.index = self.index.saturating_add(count);
        self.index < self.items.len()
    }

    /// Rewind to the first entry
    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.index)
    }
}

// manual impl: deriving would require `T: Clone` for the shared list
impl<T> Clone for Enumerator<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            index: self.index,
        }
    }
}

impl<T: Clone> Iterator for Enumerator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.items.get(self.index).cloned()?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for Enumerator<T> {}
