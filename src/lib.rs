//! # Strata - Memory-Hierarchy-Nested Ordered Index
//!
//! Strata is an in-memory ordered index over `i32` keys supporting point
//! lookup, predecessor search, insertion, deletion, ordered iteration and
//! bulk load. Its distinguishing feature is a nested node layout: the
//! structure is a B+ tree whose leaves are themselves small B+ trees
//! built from cache-line-sized sub-nodes, which in turn are searched with
//! SIMD. Each nesting level matches a level of the memory hierarchy, so
//! every descent step processes keys already resident in the smallest
//! applicable unit.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strata::Tree;
//!
//! let mut tree = Tree::new()?;
//! tree.insert(42);
//! assert_eq!(tree.search(50), Some(42));   // largest key <= 50
//! assert!(tree.contains(42));
//!
//! let loaded = Tree::bulk_load(&[0, 10, 20, 30])?;
//! let keys: Vec<i32> = loaded.iter_from(i32::MIN).collect();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Public API (Tree, TreeIter)        │
//! ├──────────────────────────────────────────┤
//! │   Outer B+ tree: 4 KiB internal nodes,    │
//! │   tagged child pointers, 340-way fanout   │
//! ├─────────────────────┬────────────────────┤
//! │  Page (4 KiB leaf)  │ Superpage (2 MiB)  │
//! │  B+ tree of 64 B    │ B+ tree of 4 KiB   │
//! │  cache-line nodes   │ page nodes         │
//! ├─────────────────────┴────────────────────┤
//! │   SIMD scan primitives (SSE2 / NEON)      │
//! ├──────────────────────────────────────────┤
//! │   Region arena (anonymous maps, bitmap    │
//! │   allocation, huge-page advice)           │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Hierarchy Configuration
//!
//! [`Hierarchy`] selects the leaf-equivalent size (4 KiB pages or 2 MiB
//! superpages) and the intra-page layout strategy ([`ClStrategy`]):
//! the slot-indexed default, fence keys cached in the page header, or
//! the dense Eytzinger layout. All strategies are behavior-equivalent.
//!
//! ## Threading
//!
//! A tree is a single-threaded structure: operations run to completion
//! on the caller's thread and iterators borrow the tree for their whole
//! lifetime. Wrap it in external synchronization for shared use.
//!
//! ## Module Overview
//!
//! - [`btree`]: the nested tree engine (scan, cell, page, superpage,
//!   interior, tree, iter)
//! - [`config`]: geometry constants and the [`Hierarchy`] object
//! - [`memory`]: the page-aligned region arena

pub mod btree;
pub mod config;
pub mod memory;

pub use btree::{Tree, TreeIter};
pub use config::{ClStrategy, Hierarchy};
