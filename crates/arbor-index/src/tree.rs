//! Page-based B+ tree index engine.
//!
//! The tree owns nothing but its root page id and configuration; every
//! page lives in the buffer pool and is borrowed through a pin. Each
//! operation descends from the root to a leaf, and structural
//! modifications (split, coalesce, redistribute, root adjustment)
//! propagate back up through the parent page ids.
//!
//! Pin discipline: every `fetch_page`/`new_page` is matched by exactly
//! one `unpin_page` on every exit path, with the dirty flag reflecting
//! whether the page bytes were rewritten. Typed pages are decoded from a
//! pinned frame, mutated, and encoded back into the frame right before
//! the matching unpin.

use crate::iter::IndexIterator;
use crate::page::{fatal, InternalPage, LeafPage, TreePage, TreePageHeader};
use crate::roots::{IndexRootsPage, HEADER_PAGE_ID};
use crate::types::{IndexKey, IndexValue, KeyComparator};
use arbor_buffer::BufferPool;
use arbor_common::page::PageId;
use arbor_common::{ArborError, IndexConfig, Result};
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

/// A disk-resident B+ tree index mapping unique fixed-size keys to
/// fixed-size values.
///
/// The design assumes a single mutator (or external serialization of
/// mutators); page latches only protect readers from torn reads.
pub struct BPlusTree<K, V, C> {
    /// Identity of this index in the roots page.
    index_id: u32,
    /// The pool owning every page of this tree.
    pool: Arc<BufferPool>,
    /// Three-way key comparator.
    comparator: C,
    /// Fan-out cap for leaf pages.
    leaf_max_size: usize,
    /// Fan-out cap for internal pages.
    internal_max_size: usize,
    /// Current root page id (raw u32; PageId::INVALID when empty).
    root_page_id: AtomicU32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: IndexKey,
    V: IndexValue,
    C: KeyComparator<K>,
{
    /// Opens (or prepares to create) the index identified by `index_id`.
    ///
    /// Fan-out caps of zero are replaced by the page-size-derived
    /// defaults. If the roots page already records a root for this
    /// index, it is adopted; otherwise the tree starts empty and
    /// registers itself on the first insert.
    pub fn new(
        index_id: u32,
        pool: Arc<BufferPool>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let leaf_max_size = if leaf_max_size == 0 {
            LeafPage::<K, V>::derived_max_size()
        } else {
            leaf_max_size
        };
        let internal_max_size = if internal_max_size == 0 {
            InternalPage::<K>::derived_max_size()
        } else {
            internal_max_size
        };

        let root = Self::load_root(&pool, index_id)?;
        Ok(Self {
            index_id,
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: AtomicU32::new(root.0),
            _marker: PhantomData,
        })
    }

    /// Opens the index with fan-out caps taken from `config`.
    pub fn with_config(
        index_id: u32,
        pool: Arc<BufferPool>,
        comparator: C,
        config: &IndexConfig,
    ) -> Result<Self> {
        Self::new(
            index_id,
            pool,
            comparator,
            config.leaf_max_size,
            config.internal_max_size,
        )
    }

    /// Reads this index's root from the roots page, creating the roots
    /// page on a fresh pool.
    fn load_root(pool: &BufferPool, index_id: u32) -> Result<PageId> {
        match pool.fetch_page(HEADER_PAGE_ID) {
            Ok(frame) => {
                let roots = IndexRootsPage::from_bytes(&frame.read_data()[..]);
                pool.unpin_page(HEADER_PAGE_ID, false);
                Ok(roots.get(index_id).unwrap_or(PageId::INVALID))
            }
            Err(ArborError::PageNotFound { .. }) => {
                let (page_id, frame) = pool.new_page()?;
                if page_id != HEADER_PAGE_ID {
                    pool.unpin_page(page_id, false);
                    pool.delete_page(page_id);
                    return Err(ArborError::Internal(
                        "index roots page must be the first allocated page".to_string(),
                    ));
                }
                IndexRootsPage::new().write_to(&mut frame.write_data()[..]);
                pool.unpin_page(page_id, true);
                Ok(PageId::INVALID)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the identity of this index.
    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    /// Returns the current root page id.
    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(AtomicOrdering::Acquire))
    }

    fn set_root_page_id(&self, page_id: PageId) {
        self.root_page_id.store(page_id.0, AtomicOrdering::Release);
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Records the current root in the roots page.
    ///
    /// `insert_record` is true only on first tree creation; afterwards
    /// the existing record is updated in place.
    fn update_root_page_id(&self, insert_record: bool) -> Result<()> {
        let frame = self.pool.fetch_page(HEADER_PAGE_ID)?;
        let mut roots = IndexRootsPage::from_bytes(&frame.read_data()[..]);

        let result = if insert_record {
            roots.insert(self.index_id, self.root_page_id())
        } else {
            roots.update(self.index_id, self.root_page_id())
        };

        match result {
            Ok(()) => {
                roots.write_to(&mut frame.write_data()[..]);
                self.pool.unpin_page(HEADER_PAGE_ID, true);
                Ok(())
            }
            Err(e) => {
                self.pool.unpin_page(HEADER_PAGE_ID, false);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Page plumbing
    // =========================================================================

    /// Encodes a page into its still-pinned frame, then releases the
    /// caller's pin dirty.
    ///
    /// The extra fetch cannot miss: a pinned page is never evicted.
    fn write_and_unpin(&self, page_id: PageId, encode: impl FnOnce(&mut [u8])) {
        match self.pool.fetch_page(page_id) {
            Ok(frame) => {
                encode(&mut frame.write_data()[..]);
                self.pool.unpin_page(page_id, true);
                self.pool.unpin_page(page_id, true);
            }
            Err(_) => fatal(&format!("pinned {page_id} vanished from the buffer pool")),
        }
    }

    fn write_back_leaf(&self, leaf: &LeafPage<K, V>) {
        self.write_and_unpin(leaf.page_id(), |data| leaf.write_to(data));
    }

    fn write_back_internal(&self, internal: &InternalPage<K>) {
        self.write_and_unpin(internal.page_id(), |data| internal.write_to(data));
    }

    fn write_back(&self, page: &TreePage<K, V>) {
        self.write_and_unpin(page.page_id(), |data| page.write_to(data));
    }

    /// Releases a pin without writing anything back.
    fn discard(&self, page_id: PageId) {
        self.pool.unpin_page(page_id, false);
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Descends from the root to the leaf responsible for `key` (or the
    /// leftmost leaf). The returned leaf's page is pinned; the caller
    /// unpins it. Returns None on an empty tree.
    fn find_leaf(&self, key: &K, leftmost: bool) -> Result<Option<LeafPage<K, V>>> {
        let mut current = self.root_page_id();
        if !current.is_valid() {
            return Ok(None);
        }

        loop {
            let frame = self.pool.fetch_page(current)?;
            let decoded = {
                let data = frame.read_data();
                TreePage::<K, V>::from_bytes(&data[..])
            };
            let page = match decoded {
                Ok(page) => page,
                Err(e) => {
                    self.discard(current);
                    return Err(e);
                }
            };

            match page {
                TreePage::Leaf(leaf) => return Ok(Some(leaf)),
                TreePage::Internal(internal) => {
                    let next = if leftmost {
                        internal.value_at(0)
                    } else {
                        internal.lookup(key, &self.comparator)
                    };
                    self.discard(current);
                    current = next;
                }
            }
        }
    }

    /// Point query: the value stored under `key`, if any.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let leaf = match self.find_leaf(key, false)? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        let result = leaf.lookup(key, &self.comparator);
        self.discard(leaf.page_id());
        Ok(result)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a key/value pair.
    ///
    /// Returns false (without error) if the key is already present.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        if self.is_empty() {
            self.start_new_tree(key, value)?;
            return Ok(true);
        }
        self.insert_into_leaf(key, value)
    }

    /// Creates the tree: a single leaf root holding one entry.
    fn start_new_tree(&self, key: &K, value: &V) -> Result<()> {
        let (page_id, frame) = self.pool.new_page()?;
        let mut root = LeafPage::<K, V>::new(page_id, PageId::INVALID, self.leaf_max_size);

        self.set_root_page_id(page_id);
        if let Err(e) = self.update_root_page_id(true) {
            self.set_root_page_id(PageId::INVALID);
            self.discard(page_id);
            self.pool.delete_page(page_id);
            return Err(e);
        }

        root.insert(*key, *value, &self.comparator);
        root.write_to(&mut frame.write_data()[..]);
        self.pool.unpin_page(page_id, true);
        Ok(())
    }

    /// Inserts into the responsible leaf, splitting on overflow.
    fn insert_into_leaf(&self, key: &K, value: &V) -> Result<bool> {
        let mut leaf = match self.find_leaf(key, false)? {
            Some(leaf) => leaf,
            None => {
                return Err(ArborError::Internal(
                    "descent found no leaf in a non-empty tree".to_string(),
                ))
            }
        };

        if leaf.lookup(key, &self.comparator).is_some() {
            self.discard(leaf.page_id());
            return Ok(false);
        }

        leaf.insert(*key, *value, &self.comparator);
        if leaf.size() > leaf.max_size() {
            self.split_leaf(leaf)?;
        } else {
            self.write_back_leaf(&leaf);
        }
        Ok(true)
    }

    /// Splits an overfull leaf: the upper half moves to a fresh sibling
    /// and the sibling's first key is pushed into the parent.
    fn split_leaf(&self, mut leaf: LeafPage<K, V>) -> Result<()> {
        let (new_page_id, _) = match self.pool.new_page() {
            Ok(pair) => pair,
            Err(e) => {
                // The overflow only exists in the decoded copy; dropping
                // it clean leaves the pre-insert page intact.
                self.discard(leaf.page_id());
                return Err(e);
            }
        };

        let mut new_leaf =
            LeafPage::<K, V>::new(new_page_id, leaf.parent_page_id(), self.leaf_max_size);
        leaf.move_half_to(&mut new_leaf);
        let separator = new_leaf.key_at(0);

        self.insert_into_parent(TreePage::Leaf(leaf), separator, TreePage::Leaf(new_leaf))
    }

    /// Links a freshly split `right` page next to `left` in their
    /// parent, growing a new root when `left` was the root. Cascades
    /// upward when the parent overflows in turn.
    ///
    /// Takes ownership of both pages' pins and releases them.
    fn insert_into_parent(
        &self,
        mut left: TreePage<K, V>,
        key: K,
        mut right: TreePage<K, V>,
    ) -> Result<()> {
        if !left.parent_page_id().is_valid() {
            // The old root split: allocate a new internal root above it.
            let (root_id, root_frame) = match self.pool.new_page() {
                Ok(pair) => pair,
                Err(e) => {
                    self.write_back(&left);
                    self.write_back(&right);
                    return Err(e);
                }
            };

            let mut new_root =
                InternalPage::<K>::new(root_id, PageId::INVALID, self.internal_max_size);
            new_root.populate_new_root(left.page_id(), key, right.page_id());
            left.set_parent_page_id(root_id);
            right.set_parent_page_id(root_id);

            self.set_root_page_id(root_id);
            let update = self.update_root_page_id(false);

            new_root.write_to(&mut root_frame.write_data()[..]);
            self.pool.unpin_page(root_id, true);
            self.write_back(&left);
            self.write_back(&right);
            return update;
        }

        let parent_id = left.parent_page_id();
        let parent_frame = match self.pool.fetch_page(parent_id) {
            Ok(frame) => frame,
            Err(e) => {
                self.write_back(&left);
                self.write_back(&right);
                return Err(e);
            }
        };
        let decoded = {
            let data = parent_frame.read_data();
            InternalPage::<K>::from_bytes(&data[..])
        };
        let mut parent = match decoded {
            Ok(parent) => parent,
            Err(e) => {
                self.discard(parent_id);
                self.write_back(&left);
                self.write_back(&right);
                return Err(e);
            }
        };

        right.set_parent_page_id(parent_id);
        parent.insert_node_after(left.page_id(), key, right.page_id());
        self.write_back(&left);
        self.write_back(&right);

        if parent.size() > parent.max_size() {
            let (new_id, _) = match self.pool.new_page() {
                Ok(pair) => pair,
                Err(e) => {
                    // Keep the separator: persist the overfull parent
                    // rather than lose the new child's routing entry.
                    self.write_back_internal(&parent);
                    return Err(e);
                }
            };

            let mut new_internal =
                InternalPage::<K>::new(new_id, parent.parent_page_id(), self.internal_max_size);
            let bubbled = match parent.move_half_to(&mut new_internal, &self.pool) {
                Ok(key) => key,
                Err(e) => {
                    self.write_back_internal(&parent);
                    self.write_back_internal(&new_internal);
                    return Err(e);
                }
            };

            return self.insert_into_parent(
                TreePage::Internal(parent),
                bubbled,
                TreePage::Internal(new_internal),
            );
        }

        self.write_back_internal(&parent);
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Removes `key` if present. Removing an absent key is a silent
    /// no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut leaf = match self.find_leaf(key, false)? {
            Some(leaf) => leaf,
            None => return Ok(()),
        };

        let size_before = leaf.size();
        let size_after = leaf.remove_and_delete(key, &self.comparator);
        if size_after == size_before {
            self.discard(leaf.page_id());
            return Ok(());
        }

        if size_after < leaf.min_size() {
            self.coalesce_or_redistribute(TreePage::Leaf(leaf))
        } else {
            self.write_back_leaf(&leaf);
            Ok(())
        }
    }

    /// Restores the minimum-occupancy invariant for an underfull page by
    /// merging with or borrowing from a sibling, recursing up the tree
    /// when the parent underflows in turn.
    ///
    /// Takes ownership of `node`'s pin; pins the parent and one sibling
    /// for the duration and releases everything on every exit path.
    fn coalesce_or_redistribute(&self, node: TreePage<K, V>) -> Result<()> {
        if !node.parent_page_id().is_valid() {
            return self.adjust_root(node);
        }

        let parent_id = node.parent_page_id();
        let parent_frame = match self.pool.fetch_page(parent_id) {
            Ok(frame) => frame,
            Err(e) => {
                self.write_back(&node);
                return Err(e);
            }
        };
        let decoded = {
            let data = parent_frame.read_data();
            InternalPage::<K>::from_bytes(&data[..])
        };
        let mut parent = match decoded {
            Ok(parent) => parent,
            Err(e) => {
                self.discard(parent_id);
                self.write_back(&node);
                return Err(e);
            }
        };

        let index = match parent.value_index(node.page_id()) {
            Some(index) => index,
            None => fatal(&format!(
                "{} not referenced by its parent {parent_id}",
                node.page_id()
            )),
        };
        // Prefer the left neighbor; the leftmost child pairs with its
        // right neighbor instead.
        let sibling_slot = if index == 0 { 1 } else { index - 1 };
        let sibling_id = parent.value_at(sibling_slot);

        let sibling_frame = match self.pool.fetch_page(sibling_id) {
            Ok(frame) => frame,
            Err(e) => {
                self.discard(parent_id);
                self.write_back(&node);
                return Err(e);
            }
        };
        let decoded = {
            let data = sibling_frame.read_data();
            TreePage::<K, V>::from_bytes(&data[..])
        };
        let sibling = match decoded {
            Ok(page) => page,
            Err(e) => {
                self.discard(sibling_id);
                self.discard(parent_id);
                self.write_back(&node);
                return Err(e);
            }
        };

        match (node, sibling) {
            (TreePage::Leaf(node_leaf), TreePage::Leaf(sibling_leaf)) => {
                self.rebalance_leaf(node_leaf, sibling_leaf, parent, index, sibling_slot)
            }
            (TreePage::Internal(node_int), TreePage::Internal(sibling_int)) => {
                self.rebalance_internal(node_int, sibling_int, parent, index, sibling_slot)
            }
            (node, sibling) => fatal(&format!(
                "sibling pages {} and {} differ in kind",
                node.page_id(),
                sibling.page_id()
            )),
        }
    }

    /// Merges or redistributes an underfull leaf with its sibling.
    fn rebalance_leaf(
        &self,
        mut node: LeafPage<K, V>,
        mut sibling: LeafPage<K, V>,
        mut parent: InternalPage<K>,
        index: usize,
        sibling_slot: usize,
    ) -> Result<()> {
        if node.size() + sibling.size() <= node.max_size() {
            // Coalesce: always merge the right page into the left one.
            let (mut left, mut right, right_slot) = if index == 0 {
                (node, sibling, sibling_slot)
            } else {
                (sibling, node, index)
            };
            right.move_all_to(&mut left);

            let right_id = right.page_id();
            self.write_back_leaf(&left);
            self.discard(right_id);
            self.pool.delete_page(right_id);

            parent.remove(right_slot);
            self.finish_parent_after_merge(parent)
        } else {
            // Redistribute one entry; the primitive repairs the parent
            // separator.
            if index == 0 {
                sibling.move_first_to_end_of(&mut node, &mut parent);
            } else {
                sibling.move_last_to_front_of(&mut node, &mut parent);
            }
            self.write_back_leaf(&node);
            self.write_back_leaf(&sibling);
            self.write_back_internal(&parent);
            Ok(())
        }
    }

    /// Merges or redistributes an underfull internal page with its
    /// sibling. The merge eligibility leaves one slot of headroom for
    /// the separator demoted from the parent.
    fn rebalance_internal(
        &self,
        mut node: InternalPage<K>,
        mut sibling: InternalPage<K>,
        mut parent: InternalPage<K>,
        index: usize,
        sibling_slot: usize,
    ) -> Result<()> {
        if node.size() + sibling.size() <= node.max_size() - 1 {
            let (mut left, mut right, right_slot) = if index == 0 {
                (node, sibling, sibling_slot)
            } else {
                (sibling, node, index)
            };

            let middle_key = parent.key_at(right_slot);
            if let Err(e) = right.move_all_to(&mut left, middle_key, &self.pool) {
                self.write_back_internal(&left);
                self.write_back_internal(&right);
                self.write_back_internal(&parent);
                return Err(e);
            }

            let right_id = right.page_id();
            self.write_back_internal(&left);
            self.discard(right_id);
            self.pool.delete_page(right_id);

            parent.remove(right_slot);
            self.finish_parent_after_merge(parent)
        } else {
            let result = if index == 0 {
                sibling.move_first_to_end_of(&mut node, &mut parent, &self.pool)
            } else {
                sibling.move_last_to_front_of(&mut node, &mut parent, &self.pool)
            };
            self.write_back_internal(&node);
            self.write_back_internal(&sibling);
            self.write_back_internal(&parent);
            result
        }
    }

    /// After a merge removed a slot from `parent`, either recurse (the
    /// parent underflowed, or is a collapsing root) or write it back.
    fn finish_parent_after_merge(&self, parent: InternalPage<K>) -> Result<()> {
        if parent.size() < parent.min_size() {
            self.coalesce_or_redistribute(TreePage::Internal(parent))
        } else {
            self.write_back_internal(&parent);
            Ok(())
        }
    }

    /// Handles underflow at the root, where minimum occupancy does not
    /// apply:
    /// - an emptied leaf root ends the tree (root id becomes INVALID);
    /// - an internal root left with a single child hands the root role
    ///   to that child;
    /// - anything else is left as is.
    fn adjust_root(&self, node: TreePage<K, V>) -> Result<()> {
        match node {
            TreePage::Leaf(leaf) if leaf.size() == 0 => {
                let page_id = leaf.page_id();
                self.discard(page_id);
                self.pool.delete_page(page_id);

                self.set_root_page_id(PageId::INVALID);
                self.update_root_page_id(false)
            }
            TreePage::Internal(mut internal) if internal.size() == 1 => {
                let child = internal.remove_and_return_only_child();
                let page_id = internal.page_id();
                self.discard(page_id);
                self.pool.delete_page(page_id);

                self.set_root_page_id(child);
                self.update_root_page_id(false)?;

                let frame = self.pool.fetch_page(child)?;
                {
                    let mut data = frame.write_data();
                    TreePageHeader::set_parent_in_slice(&mut data[..], PageId::INVALID);
                }
                self.pool.unpin_page(child, true);
                Ok(())
            }
            node => {
                // Root leaves may shrink below min_size and internal
                // roots may hold as few as two children.
                self.write_back(&node);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Cursor positioned at the first key of the tree.
    pub fn begin(&self) -> Result<IndexIterator<K, V>> {
        let leaf = self.find_leaf(&K::default(), true)?;
        Ok(IndexIterator::new(Arc::clone(&self.pool), leaf, 0))
    }

    /// Cursor positioned at the first key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<IndexIterator<K, V>> {
        let leaf = self.find_leaf(key, false)?;
        let index = leaf
            .as_ref()
            .map(|leaf| leaf.key_index(key, &self.comparator))
            .unwrap_or(0);
        Ok(IndexIterator::new(Arc::clone(&self.pool), leaf, index))
    }

    /// Cursor positioned one past the last key: at
    /// `(rightmost leaf, rightmost leaf size)`, reached by walking the
    /// sibling chain.
    pub fn end(&self) -> Result<IndexIterator<K, V>> {
        let mut leaf = match self.find_leaf(&K::default(), true)? {
            Some(leaf) => leaf,
            None => return Ok(IndexIterator::new(Arc::clone(&self.pool), None, 0)),
        };

        while leaf.next_page_id().is_valid() {
            let next = leaf.next_page_id();
            self.discard(leaf.page_id());

            let frame = self.pool.fetch_page(next)?;
            let decoded = {
                let data = frame.read_data();
                LeafPage::<K, V>::from_bytes(&data[..])
            };
            leaf = match decoded {
                Ok(leaf) => leaf,
                Err(e) => {
                    self.discard(next);
                    return Err(e);
                }
            };
        }

        let index = leaf.size();
        Ok(IndexIterator::new(Arc::clone(&self.pool), Some(leaf), index))
    }

    // =========================================================================
    // Maintenance and diagnostics
    // =========================================================================

    /// Releases every page belonging to this index and drops its record
    /// from the roots page.
    pub fn destroy(&self) -> Result<()> {
        let root = self.root_page_id();
        if root.is_valid() {
            self.destroy_subtree(root)?;
            self.set_root_page_id(PageId::INVALID);
        }

        let frame = self.pool.fetch_page(HEADER_PAGE_ID)?;
        let mut roots = IndexRootsPage::from_bytes(&frame.read_data()[..]);
        let removed = roots.remove(self.index_id);
        if removed {
            roots.write_to(&mut frame.write_data()[..]);
        }
        self.pool.unpin_page(HEADER_PAGE_ID, removed);
        Ok(())
    }

    fn destroy_subtree(&self, page_id: PageId) -> Result<()> {
        let frame = self.pool.fetch_page(page_id)?;
        let decoded = {
            let data = frame.read_data();
            TreePage::<K, V>::from_bytes(&data[..])
        };
        let page = match decoded {
            Ok(page) => page,
            Err(e) => {
                self.discard(page_id);
                return Err(e);
            }
        };

        let children: Vec<PageId> = match &page {
            TreePage::Internal(internal) => {
                (0..internal.size()).map(|i| internal.value_at(i)).collect()
            }
            TreePage::Leaf(_) => Vec::new(),
        };
        self.discard(page_id);

        for child in children {
            self.destroy_subtree(child)?;
        }
        self.pool.delete_page(page_id);
        Ok(())
    }

    /// Diagnostic: asserts that no page of the pool is left pinned.
    pub fn check(&self) -> bool {
        let all_unpinned = self.pool.check_all_unpinned();
        if !all_unpinned {
            tracing::error!("problem in page unpin");
        }
        all_unpinned
    }

    /// Walks the whole tree verifying its structural invariants: equal
    /// leaf depth, occupancy bounds, separator keys matching subtree
    /// minimums, parent back-pointers, and the leaf sibling chain.
    ///
    /// Intended for tests and offline verification; every visited page
    /// is pinned and unpinned clean.
    pub fn check_integrity(&self) -> Result<()> {
        let root = self.root_page_id();
        if !root.is_valid() {
            return Ok(());
        }

        let mut leaf_depth = None;
        let mut leaves = Vec::new();
        self.verify_subtree(root, PageId::INVALID, 0, &mut leaf_depth, &mut leaves)?;
        self.verify_sibling_chain(&leaves)
    }

    /// Recursive invariant walk. Returns the minimum key of the subtree.
    fn verify_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        leaves: &mut Vec<PageId>,
    ) -> Result<K> {
        let corrupt = |msg: String| ArborError::TreeCorrupted(msg);

        let frame = self.pool.fetch_page(page_id)?;
        let decoded = {
            let data = frame.read_data();
            TreePage::<K, V>::from_bytes(&data[..])
        };
        let page = match decoded {
            Ok(page) => page,
            Err(e) => {
                self.discard(page_id);
                return Err(e);
            }
        };
        self.discard(page_id);

        if page.page_id() != page_id {
            return Err(corrupt(format!(
                "{page_id} header carries id {}",
                page.page_id()
            )));
        }
        if page.parent_page_id() != expected_parent {
            return Err(corrupt(format!(
                "{page_id} records parent {} but is referenced by {expected_parent}",
                page.parent_page_id()
            )));
        }

        let is_root = !expected_parent.is_valid();
        match page {
            TreePage::Leaf(leaf) => {
                if is_root {
                    if leaf.size() < 1 {
                        return Err(corrupt(format!("root leaf {page_id} is empty")));
                    }
                } else if leaf.size() < leaf.min_size() || leaf.size() > leaf.max_size() {
                    return Err(corrupt(format!(
                        "leaf {page_id} size {} outside [{}, {}]",
                        leaf.size(),
                        leaf.min_size(),
                        leaf.max_size()
                    )));
                }

                for i in 1..leaf.size() {
                    if self.comparator.compare(&leaf.key_at(i - 1), &leaf.key_at(i))
                        != Ordering::Less
                    {
                        return Err(corrupt(format!("leaf {page_id} keys out of order")));
                    }
                }

                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(corrupt(format!(
                            "leaf {page_id} at depth {depth}, expected {expected}"
                        )));
                    }
                    Some(_) => {}
                }

                leaves.push(page_id);
                Ok(leaf.key_at(0))
            }
            TreePage::Internal(internal) => {
                if is_root {
                    if internal.size() < 2 {
                        return Err(corrupt(format!(
                            "root internal {page_id} holds {} children",
                            internal.size()
                        )));
                    }
                } else if internal.size() < internal.min_size()
                    || internal.size() > internal.max_size()
                {
                    return Err(corrupt(format!(
                        "internal {page_id} size {} outside [{}, {}]",
                        internal.size(),
                        internal.min_size(),
                        internal.max_size()
                    )));
                }

                for i in 2..internal.size() {
                    if self
                        .comparator
                        .compare(&internal.key_at(i - 1), &internal.key_at(i))
                        != Ordering::Less
                    {
                        return Err(corrupt(format!("internal {page_id} keys out of order")));
                    }
                }

                let mut subtree_min = None;
                for i in 0..internal.size() {
                    let child_min = self.verify_subtree(
                        internal.value_at(i),
                        page_id,
                        depth + 1,
                        leaf_depth,
                        leaves,
                    )?;
                    if i == 0 {
                        subtree_min = Some(child_min);
                    } else if self.comparator.compare(&internal.key_at(i), &child_min)
                        != Ordering::Equal
                    {
                        return Err(corrupt(format!(
                            "internal {page_id} slot {i} separator does not match subtree minimum"
                        )));
                    }
                }

                match subtree_min {
                    Some(min) => Ok(min),
                    None => Err(corrupt(format!("internal {page_id} has no children"))),
                }
            }
        }
    }

    /// Follows the sibling chain from the leftmost leaf and checks that
    /// it visits exactly the leaves found by the recursive walk, in
    /// order, ending at INVALID.
    fn verify_sibling_chain(&self, leaves: &[PageId]) -> Result<()> {
        let corrupt = |msg: String| ArborError::TreeCorrupted(msg);

        let mut current = match leaves.first() {
            Some(&first) => first,
            None => return Ok(()),
        };

        for (i, &expected) in leaves.iter().enumerate() {
            if current != expected {
                return Err(corrupt(format!(
                    "sibling chain reaches {current} where the tree has {expected}"
                )));
            }

            let frame = self.pool.fetch_page(current)?;
            let decoded = {
                let data = frame.read_data();
                LeafPage::<K, V>::from_bytes(&data[..])
            };
            let leaf = match decoded {
                Ok(leaf) => leaf,
                Err(e) => {
                    self.discard(current);
                    return Err(e);
                }
            };
            self.discard(current);

            let next = leaf.next_page_id();
            if i + 1 == leaves.len() {
                if next.is_valid() {
                    return Err(corrupt(format!(
                        "rightmost leaf {current} links to {next}"
                    )));
                }
            } else {
                if !next.is_valid() {
                    return Err(corrupt(format!("sibling chain ends early at {current}")));
                }
                current = next;
            }
        }

        Ok(())
    }
}
