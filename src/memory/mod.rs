//! # Region Allocation
//!
//! Leaf-equivalents (4 KiB pages or 2 MiB superpages) are carved out of
//! large anonymous memory maps rather than allocated individually. This
//! keeps leaves page-aligned (a requirement of the tagged child-pointer
//! encoding), co-locates siblings for TLB locality, and makes teardown a
//! matter of dropping the maps.
//!
//! - [`arena`]: the chained bitmap arena handing out fixed-size regions

mod arena;

pub use arena::RegionArena;
