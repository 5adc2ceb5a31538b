//! # Strata Geometry Constants
//!
//! This module centralizes the layout constants for every nesting level of
//! the index. Constants that depend on each other are co-located and the
//! relationships are enforced with compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! CL_SIZE (64 bytes, one cache line)
//!       │
//!       ├─> CL_KEY_CAP (15)      1 B tag + 1 B count + 2 B pad + 15 × 4 B keys
//!       ├─> CL_SEP_CAP (12)      1 B tag + 1 B count + 13 B children + 1 B pad + 12 × 4 B keys
//!       ├─> CL_CHILD_CAP (13)    CL_SEP_CAP + 1
//!       └─> CL_EYTZ_SEP_CAP (15) 1 B tag + 1 B count + 1 B nchildren + 1 B pad + 15 × 4 B keys
//!
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_SLOTS (63)      slot 0 is the page header, slots 1–63 hold CL nodes
//!       ├─> MAX_IKEYS (339)      (4096 - 16 - 8) / 12 separators in an outer internal
//!       └─> PTR_TAG_MASK (0xFFF) low bits free for tagging thanks to 4096-alignment
//!
//! SP_SIZE (2 MiB)
//!       │
//!       ├─> SP_PAGES (512)       page 0 is the superpage header
//!       └─> SP_MAX_IKEYS (681)   8 B header + 681 × 4 B keys + 682 × 2 B children
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Every cache-line node variant is exactly `CL_SIZE` bytes
//! 2. The page header is exactly one CL slot; a page is exactly 64 slots
//! 3. An outer internal node and a superpage internal node each fit in one page
//!
//! These are asserted at compile time here and next to the struct
//! definitions in `btree::cell`, `btree::page` and `btree::superpage`.

// ============================================================================
// CACHE-LINE LEVEL
// The innermost structural unit: one 64-byte slot, searched with SIMD
// ============================================================================

/// Size of one cache-line sub-node in bytes.
pub const CL_SIZE: usize = 64;

/// Keys per cache-line leaf.
pub const CL_KEY_CAP: usize = 15;

/// Minimum keys in a non-root cache-line leaf.
pub const CL_MIN_KEYS: usize = CL_KEY_CAP / 2;

/// Separator keys per slot-indexed cache-line internal.
pub const CL_SEP_CAP: usize = 12;

/// Children per slot-indexed cache-line internal.
pub const CL_CHILD_CAP: usize = CL_SEP_CAP + 1;

/// Minimum children in a non-root cache-line internal.
pub const CL_MIN_CHILDREN: usize = (CL_CHILD_CAP + 1) / 2;

/// Separator keys per Eytzinger cache-line internal (no child array).
pub const CL_EYTZ_SEP_CAP: usize = 15;

/// Children per Eytzinger cache-line internal (implicit BFS slots).
pub const CL_EYTZ_CHILD_CAP: usize = CL_EYTZ_SEP_CAP + 1;

const _: () = assert!(4 + CL_KEY_CAP * 4 == CL_SIZE, "CL leaf must fill one cache line");
const _: () = assert!(
    2 + CL_CHILD_CAP + 1 + CL_SEP_CAP * 4 == CL_SIZE,
    "CL internal must fill one cache line"
);
const _: () =
    assert!(4 + CL_EYTZ_SEP_CAP * 4 == CL_SIZE, "Eytzinger CL internal must fill one cache line");

// ============================================================================
// PAGE LEVEL
// One 4 KiB page holds a B+ sub-tree of cache-line nodes
// ============================================================================

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Usable CL slots per page. Slot 0 is the page header.
pub const PAGE_SLOTS: usize = PAGE_SIZE / CL_SIZE - 1;

/// Maximum page sub-tree height recorded by descent paths. The slot
/// budget caps real trees at height 2; the header field leaves room for
/// exotic geometries.
pub const PAGE_MAX_SUB_HEIGHT: usize = 7;

/// Fence-key cache capacity in the page header (separators).
pub const FENCE_KEY_CAP: usize = 6;

/// Fence-key cache capacity in the page header (child slots).
pub const FENCE_SLOT_CAP: usize = FENCE_KEY_CAP + 1;

const _: () = assert!(PAGE_SLOTS == 63, "page slot count derivation mismatch");

// ============================================================================
// OUTER TREE LEVEL
// Outer internal nodes route between pages (or superpages)
// ============================================================================

/// Header bytes in an outer internal node.
pub const INODE_HEADER: usize = 16;

/// Maximum separator keys per outer internal node.
/// Per key: 4 B separator + 8 B child pointer, plus one extra pointer.
pub const MAX_IKEYS: usize = (PAGE_SIZE - INODE_HEADER - 8) / 12;

/// Minimum separator keys in a non-root outer internal node.
pub const MIN_IKEYS: usize = MAX_IKEYS / 2;

/// Maximum outer tree height tracked by descent paths.
pub const MAX_HEIGHT: usize = 32;

const _: () = assert!(MAX_IKEYS == 339, "outer internal fanout derivation mismatch");
const _: () = assert!(
    INODE_HEADER + MAX_IKEYS * 4 + (MAX_IKEYS + 1) * 8 <= PAGE_SIZE,
    "outer internal node must fit in one page"
);

// ============================================================================
// POINTER TAGGING
// Child pointers to page leaves carry the leaf's CL-root slot and sub-tree
// height in the low bits guaranteed zero by 4096-byte alignment
// ============================================================================

/// All tag bits of a child pointer.
pub const PTR_TAG_MASK: usize = 0xFFF;

/// Bits 0–5: CL root slot index (1–63).
pub const PTR_SLOT_MASK: usize = 0x3F;

/// Bits 6–8: page sub-tree height.
pub const PTR_HEIGHT_SHIFT: u32 = 6;

/// Mask for the sub-tree height after shifting.
pub const PTR_HEIGHT_MASK: usize = 0x7;

const _: () = assert!(PAGE_SIZE - 1 >= PTR_TAG_MASK, "tag bits must fit below page alignment");

// ============================================================================
// SUPERPAGE LEVEL
// One 2 MiB region holds a B+ sub-tree of pages
// ============================================================================

/// Size of one superpage in bytes.
pub const SP_SIZE: usize = 2 * 1024 * 1024;

/// Pages per superpage. Page 0 is the superpage header.
pub const SP_PAGES: usize = SP_SIZE / PAGE_SIZE;

/// Maximum separator keys per page-level internal inside a superpage.
/// 8 B header + 681 × 4 B keys + 682 × 2 B children = 4096 B.
/// One internal routes more children than the superpage has pages, so
/// no underflow threshold exists at this level.
pub const SP_MAX_IKEYS: usize = 681;

/// Words in the superpage page-allocation bitmap.
pub const SP_BITMAP_WORDS: usize = SP_PAGES / 64;

/// Maximum page sub-tree height inside a superpage recorded by descent
/// paths. With fanout 682 over at most 510 page leaves, real trees stop
/// at height 1.
pub const SP_MAX_SUB_HEIGHT: usize = 4;

const _: () = assert!(SP_PAGES == 512, "superpage page count derivation mismatch");
const _: () = assert!(
    8 + SP_MAX_IKEYS * 4 + (SP_MAX_IKEYS + 1) * 2 <= PAGE_SIZE,
    "superpage internal node must fit in one page"
);

// ============================================================================
// KEY SPACE
// ============================================================================

/// Sentinel for "no key": used for empty-minimum results and padding,
/// never compared against live slots (counts bound every scan).
pub const KEY_MAX: i32 = i32::MAX;

/// Largest scratch buffer a single page can require (all slots as leaves).
pub const PAGE_SCRATCH_KEYS: usize = PAGE_SLOTS * CL_KEY_CAP;

const _: () = assert!(PAGE_SCRATCH_KEYS == 945, "page scratch sizing mismatch");
