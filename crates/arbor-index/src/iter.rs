//! Forward cursor over the leaf sibling chain.

use crate::page::LeafPage;
use crate::types::{IndexKey, IndexValue};
use arbor_buffer::BufferPool;
use std::sync::Arc;

/// A forward iterator over the entries of a B+ tree, in key order.
///
/// The cursor keeps the current leaf's page pinned and releases that pin
/// when it advances to the next leaf or is dropped; it never holds more
/// than one pin. Two cursors compare equal when they sit on the same
/// leaf at the same offset, so a cursor advanced past the last entry
/// compares equal to the tree's `end()`.
pub struct IndexIterator<K: IndexKey, V: IndexValue> {
    pool: Arc<BufferPool>,
    /// Current decoded leaf; its page is pinned while this is Some.
    leaf: Option<LeafPage<K, V>>,
    /// Offset of the next entry within the current leaf.
    index: usize,
}

impl<K: IndexKey, V: IndexValue> IndexIterator<K, V> {
    /// Builds a cursor over `leaf` (already pinned by the caller, and
    /// owned by the cursor from here on) at the given offset.
    pub(crate) fn new(pool: Arc<BufferPool>, leaf: Option<LeafPage<K, V>>, index: usize) -> Self {
        Self { pool, leaf, index }
    }

    /// Returns true once the cursor has moved past the last entry of
    /// the rightmost leaf (or the tree is empty).
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(leaf) => self.index >= leaf.size() && !leaf.next_page_id().is_valid(),
        }
    }

    /// Returns the entry under the cursor without advancing, if any.
    pub fn current(&self) -> Option<(K, V)> {
        let leaf = self.leaf.as_ref()?;
        if self.index < leaf.size() {
            Some(leaf.item_at(self.index))
        } else {
            None
        }
    }

    /// Releases the held pin and parks the cursor at the end state.
    fn invalidate(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            self.pool.unpin_page(leaf.page_id(), false);
        }
    }

    /// Moves the cursor onto the next leaf in the sibling chain.
    ///
    /// Returns false if the chain is exhausted or unreadable.
    fn advance_leaf(&mut self) -> bool {
        let next = match &self.leaf {
            Some(leaf) => leaf.next_page_id(),
            None => return false,
        };
        if !next.is_valid() {
            return false;
        }

        // One pin at a time: release the current leaf before pinning
        // the next one.
        self.invalidate();

        let frame = match self.pool.fetch_page(next) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("iterator lost the sibling chain at {next}: {e}");
                return false;
            }
        };
        let decoded = {
            let data = frame.read_data();
            LeafPage::<K, V>::from_bytes(&data[..])
        };
        match decoded {
            Ok(leaf) => {
                self.leaf = Some(leaf);
                self.index = 0;
                true
            }
            Err(e) => {
                self.pool.unpin_page(next, false);
                tracing::warn!("iterator read a non-leaf page {next}: {e}");
                false
            }
        }
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for IndexIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.size() {
                let item = leaf.item_at(self.index);
                self.index += 1;
                return Some(item);
            }
            if !self.advance_leaf() {
                // Parked at (rightmost leaf, size): the end position.
                return None;
            }
        }
    }
}

impl<K: IndexKey, V: IndexValue> PartialEq for IndexIterator<K, V> {
    fn eq(&self, other: &Self) -> bool {
        let position = |it: &Self| {
            (
                it.leaf.as_ref().map(|leaf| leaf.page_id()),
                it.leaf.as_ref().map(|_| it.index),
            )
        };
        position(self) == position(other)
    }
}

impl<K: IndexKey, V: IndexValue> Drop for IndexIterator<K, V> {
    fn drop(&mut self) {
        self.invalidate();
    }
}
