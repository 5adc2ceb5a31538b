//! # Strata Configuration Module
//!
//! Geometry constants live in [`constants`]; the runtime-selectable knobs
//! live in [`Hierarchy`]. A `Hierarchy` describes which memory-hierarchy
//! level backs the outer tree's leaves (4 KiB pages or 2 MiB superpages),
//! which intra-page layout strategy to use, and the derived capacity and
//! underflow thresholds every structural operation consults.
//!
//! ## Why a single configuration object?
//!
//! The thresholds are interdependent: `min_page_keys` must be derived from
//! `page_max_keys`, which itself depends on the cache-line geometry and the
//! chosen strategy. Deriving them in one place prevents a tree built with
//! one threshold from being rebalanced against another.

pub mod constants;
pub use constants::*;

/// Intra-page layout strategy for the cache-line sub-tree.
///
/// All three strategies are behavior-equivalent; they differ only in how
/// the first descent step inside a page resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClStrategy {
    /// Slot-indexed cache-line sub-tree.
    #[default]
    Default,
    /// Slot-indexed sub-tree plus a separator cache in the page header.
    FenceKeys,
    /// Dense BFS layout: one root internal with children at contiguous
    /// slots, addressable without an indirection. Sub-tree height ≤ 1.
    Eytzinger,
}

/// Nesting configuration for a tree.
///
/// Built through the factory constructors; the derived fields
/// (`page_max_keys`, `min_page_keys`, `sp_max_keys`, `min_sp_keys`) must
/// stay consistent with the cache-line geometry, so the fields are public
/// for inspection but trees should be configured via the constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hierarchy {
    /// Allocation size of one leaf-equivalent in bytes (4096 or 2 MiB).
    pub leaf_alloc: usize,
    /// Maximum keys per page, given the strategy's slot budget.
    pub page_max_keys: usize,
    /// Underflow threshold for page leaves in the outer tree.
    pub min_page_keys: usize,
    /// Maximum keys per superpage (0 when superpages are unused).
    pub sp_max_keys: usize,
    /// Underflow threshold for superpage leaves in the outer tree.
    pub min_sp_keys: usize,
    /// Whether outer-tree leaves are 2 MiB superpages.
    pub use_superpages: bool,
    /// Intra-page layout strategy.
    pub cl_strategy: ClStrategy,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::page_default()
    }
}

impl Hierarchy {
    /// Default geometry: 4 KiB page leaves, slot-indexed sub-trees.
    pub fn page_default() -> Self {
        let page_max_keys = compute_page_max_keys(CL_KEY_CAP, CL_CHILD_CAP, PAGE_SLOTS);
        Self {
            leaf_alloc: PAGE_SIZE,
            page_max_keys,
            min_page_keys: page_max_keys / 4,
            sp_max_keys: 0,
            min_sp_keys: 0,
            use_superpages: false,
            cl_strategy: ClStrategy::Default,
        }
    }

    /// Page leaves with the root internal's separators cached in the
    /// page header.
    pub fn fence_keys() -> Self {
        Self { cl_strategy: ClStrategy::FenceKeys, ..Self::page_default() }
    }

    /// Page leaves with the dense Eytzinger sub-tree layout.
    ///
    /// Capacity is capped at one internal level over at most 16 contiguous
    /// leaves, so pages report full (and the outer tree splits them)
    /// earlier than under the default strategy.
    pub fn eytzinger() -> Self {
        let page_max_keys = CL_EYTZ_CHILD_CAP * CL_KEY_CAP;
        Self {
            page_max_keys,
            min_page_keys: page_max_keys / 4,
            cl_strategy: ClStrategy::Eytzinger,
            ..Self::page_default()
        }
    }

    /// 2 MiB superpage leaves.
    ///
    /// 511 usable pages per superpage, one of which becomes the page-level
    /// root internal once the sub-tree reaches height 1, leaving 510 page
    /// leaves.
    pub fn superpage() -> Self {
        let base = Self::page_default();
        let sp_max_keys = (SP_PAGES - 2) * base.page_max_keys;
        Self {
            leaf_alloc: SP_SIZE,
            sp_max_keys,
            min_sp_keys: sp_max_keys / 4,
            use_superpages: true,
            ..base
        }
    }

    /// Default geometry with a custom leaf allocation size (≥ 4096).
    ///
    /// Sizes other than `PAGE_SIZE` and `SP_SIZE` keep page semantics but
    /// let the arena co-locate more leaves per region.
    pub fn custom(leaf_alloc: usize) -> Self {
        Self { leaf_alloc: leaf_alloc.max(PAGE_SIZE), ..Self::page_default() }
    }
}

/// Maximum keys fitting in `page_slots` CL slots arranged as a B+ sub-tree.
///
/// Sub-height 0 is a single leaf; sub-height 1 is one root internal over
/// up to `cl_child_cap` leaves; sub-height 2 is a root over `m` internals
/// over `n` leaves with `m ≤ cl_child_cap`, `n ≤ m × cl_child_cap` and
/// `1 + m + n ≤ page_slots`. The sub-height-2 optimum for the default
/// geometry is m = 5, n = 57: 855 keys in 63 slots.
fn compute_page_max_keys(cl_key_cap: usize, cl_child_cap: usize, page_slots: usize) -> usize {
    let mut best = cl_key_cap;

    let h1_leaves = cl_child_cap.min(page_slots - 1);
    best = best.max(h1_leaves * cl_key_cap);

    for m in 1..=cl_child_cap {
        if 1 + m >= page_slots {
            break;
        }
        let n = (page_slots - 1 - m).min(m * cl_child_cap);
        best = best.max(n * cl_key_cap);
    }

    best
}
