//! # Nested B+ Tree Engine
//!
//! Three B+ trees nested inside one another, each sized for one level
//! of the memory hierarchy:
//!
//! ```text
//!                     outer tree (main memory)
//!                   Interior: 339 keys / 4 KiB
//!                    /                      \
//!          Page (4 KiB leaf)        Superpage (2 MiB leaf)
//!          B+ tree of 64-byte       B+ tree of 4 KiB pages,
//!          cache-line nodes         each a full Page
//!                   |                        |
//!          ClLeaf / ClInode         SpInode (681 keys / page)
//!          searched with one
//!          SIMD compare round
//! ```
//!
//! Every descent step therefore scans keys already resident in the
//! smallest applicable unit: a SIMD register over a cache line, a
//! cache line within a loaded page, a page within a mapped superpage.
//!
//! ## Module Map
//!
//! - [`scan`]: SIMD predecessor / lower-bound / child-index primitives
//! - [`cell`]: 64-byte cache-line sub-nodes
//! - [`page`]: the 4 KiB page and its cache-line sub-tree
//! - [`superpage`]: the 2 MiB superpage and its page sub-tree
//! - [`interior`]: outer internal nodes and tagged child pointers
//! - [`tree`]: the outer tree and public operations
//! - [`iter`]: ordered iteration along the leaf sibling chain

pub mod cell;
pub mod interior;
pub mod iter;
pub mod page;
pub mod scan;
pub mod superpage;
pub mod tree;

pub use iter::TreeIter;
pub use tree::Tree;
