//! Disk-resident B+ tree index for ArborDB.
//!
//! The index maps unique fixed-size keys to fixed-size values over
//! pages owned by the [`arbor_buffer::BufferPool`]. It supports point
//! lookup, ordered forward iteration, insertion, and deletion, keeping
//! the tree balanced through splits, merges, redistribution, and root
//! adjustment.
//!
//! Layers, leaves first:
//! - [`page`]: the on-page layouts ([`LeafPage`], [`InternalPage`]) and
//!   their single-page primitives
//! - [`roots`]: the page-0 side table mapping index ids to root pages
//! - [`tree`]: the [`BPlusTree`] engine driving pins and structural
//!   modifications
//! - [`iter`]: the forward cursor over the leaf sibling chain
//!
//! ```text
//!                [ internal (dummy | k1 | k2) ]
//!               /            |           \
//!        [ leaf ] --next--> [ leaf ] --next--> [ leaf ]
//! ```
//!
//! Internal pages follow the dummy-slot convention: slot 0 carries the
//! leftmost child under an uninitialized key, and the key at slot
//! `i >= 1` equals the smallest key in the subtree at slot `i`.

pub mod iter;
pub mod page;
pub mod roots;
pub mod tree;
pub mod types;

pub use iter::IndexIterator;
pub use page::{IndexPageType, InternalPage, LeafPage, TreePage, TreePageHeader};
pub use roots::{IndexRootsPage, HEADER_PAGE_ID};
pub use tree::BPlusTree;
pub use types::{
    GenericKey, IndexKey, IndexValue, KeyComparator, OrdComparator, RecordId,
};
