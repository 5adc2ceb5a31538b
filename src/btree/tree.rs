//! # Outer Tree
//!
//! The top level of the nesting: a B+ tree whose leaves are 4 KiB pages
//! (or 2 MiB superpages) and whose internal nodes route up to 340
//! children per 4 KiB node. A point operation descends the outer tree,
//! hands off to the leaf-equivalent's own sub-tree, and unwinds any
//! structural consequence (split, underflow) back through the recorded
//! descent path.
//!
//! ## Descent
//!
//! ```text
//! Tree::search(key)
//!   └─ Interior::search (SIMD-stepped binary search, 339 separators)
//!        └─ tagged child pointer → prefetch the leaf's CL root line
//!             └─ Page::search_key (fence keys / Eytzinger / default)
//!                  └─ ClLeaf::predecessor (one SIMD compare round)
//! ```
//!
//! ## Structural changes
//!
//! Inserts that fill a leaf-equivalent split it in place: the upper half
//! bulk-loads into a fresh region, the sibling list is re-spliced, and
//! the separator propagates upward, splitting full internals as it
//! goes. Every allocation the cascade will need (interior nodes and
//! the leaf region) is obtained *before* the first mutation, so an
//! allocation failure reports a clean `false` with the tree untouched.
//!
//! Deletes that underflow a leaf-equivalent borrow from or merge with a
//! sibling, refreshing the parent separator from the right
//! participant's minimum, then rebalance internals bottom-up, and
//! finally collapse the root when it routes a single child.
//!
//! ## Ownership
//!
//! The tree owns its region arena (pages and superpages live there) and
//! every interior allocation; drop tears down the interiors recursively
//! and the arena reclaims all leaf storage wholesale. Sibling links are
//! weak references threaded through storage the tree owns: navigation
//! only, never reclamation.

use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;

use crate::btree::interior::{ptr_root_slot, tag_page_ptr, untag, Interior};
use crate::btree::page::{Page, PageDelete, PageInsert};
use crate::btree::scan;
use crate::btree::superpage::Superpage;
use crate::config::{
    Hierarchy, CL_SIZE, MAX_HEIGHT, MAX_IKEYS, MIN_IKEYS, PAGE_SCRATCH_KEYS, PAGE_SIZE, SP_SIZE,
};
use crate::memory::RegionArena;

/// Outer descent record: (internal node, child index taken).
type OuterPath = SmallVec<[(*mut Interior, usize); MAX_HEIGHT]>;

/// Ordered in-memory index over `i32` keys with predecessor search.
///
/// Nodes at every level are sized and laid out for one level of the
/// memory hierarchy: SIMD registers scan cache-line nodes, cache-line
/// nodes tile 4 KiB pages, pages tile 2 MiB superpages, and the outer
/// tree routes between them.
pub struct Tree {
    root: usize,
    n: usize,
    height: u32,
    hier: Hierarchy,
    arena: RegionArena,
}

impl Tree {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Empty tree with the default hierarchy (4 KiB page leaves).
    pub fn new() -> Result<Self> {
        Self::with_hierarchy(Hierarchy::page_default())
    }

    /// Empty tree with an explicit hierarchy.
    pub fn with_hierarchy(hier: Hierarchy) -> Result<Self> {
        let mut arena = Self::make_arena(&hier)?;
        let root = arena
            .alloc()
            .ok_or_else(|| eyre::eyre!("failed to allocate root leaf region"))?;
        let mut tree = Self { root: root.as_ptr() as usize, n: 0, height: 0, hier, arena };
        tree.init_leaf_region(tree.root);
        Ok(tree)
    }

    /// O(n) bottom-up construction from strictly ascending unique keys.
    pub fn bulk_load(keys: &[i32]) -> Result<Self> {
        Self::bulk_load_with(keys, Hierarchy::page_default())
    }

    /// Bulk-load with an explicit hierarchy.
    pub fn bulk_load_with(keys: &[i32], hier: Hierarchy) -> Result<Self> {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]), "bulk_load input must be sorted unique");

        if keys.is_empty() {
            return Self::with_hierarchy(hier);
        }

        let mut arena = Self::make_arena(&hier)?;
        let leaf_cap = if hier.use_superpages { hier.sp_max_keys } else { hier.page_max_keys };

        // Near-equal partition; earlier leaves take the extras.
        let n = keys.len();
        let nleaves = n.div_ceil(leaf_cap);
        let base = n / nleaves;
        let extra = n % nleaves;

        let mut entries: Vec<(usize, i32)> = Vec::with_capacity(nleaves);
        let mut offset = 0usize;
        for i in 0..nleaves {
            let take = base + usize::from(i < extra);
            let region = arena
                .alloc()
                .ok_or_else(|| eyre::eyre!("failed to allocate leaf region during bulk load"))?;
            let word = region.as_ptr() as usize;
            let run = &keys[offset..offset + take];
            if hier.use_superpages {
                // SAFETY: fresh region of SP_SIZE bytes.
                unsafe { Superpage::from_raw(word as *mut u8) }.bulk_load(run, &hier);
            } else {
                // SAFETY: fresh region of PAGE_SIZE bytes.
                unsafe { Page::from_raw(word as *mut u8) }.bulk_load(run, &hier);
            }
            entries.push((word, run[0]));
            offset += take;
        }

        // Thread the sibling lists in key order.
        if hier.use_superpages {
            for w in entries.windows(2) {
                let (a, b) = (w[0].0, w[1].0);
                // SAFETY: both regions are live superpages just built.
                unsafe {
                    let left = Superpage::from_raw(a as *mut u8);
                    let right = Superpage::from_raw(b as *mut u8);
                    left.set_next(right as *mut Superpage);
                    right.set_prev(left as *mut Superpage);
                    let left_last = left.last_leaf_mut();
                    let right_first = right.first_leaf_mut();
                    (*left_last).set_next(right_first);
                    (*right_first).set_prev(left_last);
                }
            }
        } else {
            for w in entries.windows(2) {
                // SAFETY: both regions are live pages just built.
                unsafe {
                    let left = Page::from_raw(w[0].0 as *mut u8);
                    let right = Page::from_raw(w[1].0 as *mut u8);
                    left.set_next(right as *mut Page);
                    right.set_prev(left as *mut Page);
                }
            }
            // Interior child entries carry the leaf tag.
            for e in entries.iter_mut() {
                // SAFETY: live page just built.
                e.0 = tag_page_ptr(unsafe { Page::from_raw_ref(e.0 as *const u8) });
            }
        }

        // Internal levels bottom-up at maximum fanout.
        let mut height = 0u32;
        while entries.len() > 1 {
            let count = entries.len();
            let nparents = count.div_ceil(MAX_IKEYS + 1);
            let per = count / nparents;
            let extra_c = count % nparents;

            let mut next: Vec<(usize, i32)> = Vec::with_capacity(nparents);
            let mut ci = 0usize;
            for p in 0..nparents {
                let nc = per + usize::from(p < extra_c);
                let node = Interior::alloc()
                    .ok_or_else(|| eyre::eyre!("failed to allocate internal node during bulk load"))?;
                let keys_run: Vec<i32> = entries[ci + 1..ci + nc].iter().map(|e| e.1).collect();
                let children_run: Vec<usize> = entries[ci..ci + nc].iter().map(|e| e.0).collect();
                // SAFETY: fresh exclusive allocation.
                unsafe { (*node).set(&keys_run, &children_run) };
                next.push((node as usize, entries[ci].1));
                ci += nc;
            }
            entries = next;
            height += 1;
        }

        Ok(Self { root: untag(entries[0].0), n, height, hier, arena })
    }

    fn make_arena(hier: &Hierarchy) -> Result<RegionArena> {
        ensure!(hier.leaf_alloc >= PAGE_SIZE, "leaf allocation below page size");
        // Co-locate page leaves within 2 MiB chunks for TLB locality;
        // larger leaf-equivalents get one region per chunk.
        let chunk = SP_SIZE.div_ceil(hier.leaf_alloc) * hier.leaf_alloc;
        RegionArena::new(chunk, hier.leaf_alloc).wrap_err("failed to create region arena")
    }

    fn init_leaf_region(&mut self, word: usize) {
        let hier = self.hier;
        if hier.use_superpages {
            // SAFETY: word addresses an owned SP_SIZE region.
            unsafe { Superpage::from_raw(word as *mut u8) }.init(&hier);
        } else {
            // SAFETY: word addresses an owned PAGE_SIZE region.
            unsafe { Page::from_raw(word as *mut u8) }.init(&hier);
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// The hierarchy this tree was configured with.
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hier
    }

    /// Predecessor search: the largest stored key ≤ `key`.
    pub fn search(&self, key: i32) -> Option<i32> {
        if self.n == 0 {
            return None;
        }
        let word = self.descend_readonly(key);
        let base = untag(word);
        if self.hier.use_superpages {
            // SAFETY: base addresses a live superpage of this tree.
            unsafe { Superpage::from_raw_ref(base as *const u8) }.search_key(key)
        } else {
            // SAFETY: base addresses a live page of this tree.
            let page = unsafe { Page::from_raw_ref(base as *const u8) };
            page.search_key(key).or_else(|| {
                let prev = page.prev();
                if prev.is_null() {
                    return None;
                }
                // SAFETY: sibling links reference live pages of this tree.
                let prev = unsafe { &*prev };
                (prev.nkeys() > 0).then(|| prev.max_key())
            })
        }
    }

    /// Exact membership test.
    pub fn contains(&self, key: i32) -> bool {
        if self.n == 0 {
            return false;
        }
        let base = untag(self.descend_readonly(key));
        if self.hier.use_superpages {
            // SAFETY: base addresses a live superpage of this tree.
            unsafe { Superpage::from_raw_ref(base as *const u8) }.contains(key)
        } else {
            // SAFETY: base addresses a live page of this tree.
            unsafe { Page::from_raw_ref(base as *const u8) }.contains(key)
        }
    }

    /// Descend to the leaf-equivalent word covering `key`, prefetching
    /// each page leaf's cache-line root through the pointer tag.
    fn descend_readonly(&self, key: i32) -> usize {
        let mut word = self.root;
        for _ in 0..self.height {
            // SAFETY: non-leaf levels always hold live interior nodes.
            let node = unsafe { &*(untag(word) as *const Interior) };
            let idx = node.search(key);
            let child = node.child(idx);
            if !self.hier.use_superpages {
                let slot = ptr_root_slot(child);
                if slot != 0 {
                    scan::prefetch((untag(child) + slot as usize * CL_SIZE) as *const u8);
                }
            }
            word = child;
        }
        word
    }

    /// Descend recording the interior path.
    fn descend_path(&mut self, key: i32) -> (usize, OuterPath) {
        let mut path = OuterPath::new();
        let mut word = self.root;
        for _ in 0..self.height {
            let ptr = untag(word) as *mut Interior;
            // SAFETY: non-leaf levels always hold live interior nodes.
            let node = unsafe { &*ptr };
            let idx = node.search(key);
            path.push((ptr, idx));
            word = node.child(idx);
        }
        (word, path)
    }

    /// Descend recording the path and the lowest separator bounding the
    /// reached leaf from above (`i64::MAX` on the rightmost spine).
    fn descend_with_fence(&mut self, key: i32) -> (usize, OuterPath, i64) {
        let mut path = OuterPath::new();
        let mut fence = i64::MAX;
        let mut word = self.root;
        for _ in 0..self.height {
            let ptr = untag(word) as *mut Interior;
            // SAFETY: non-leaf levels always hold live interior nodes.
            let node = unsafe { &*ptr };
            let idx = node.search(key);
            if idx < node.len() {
                fence = fence.min(node.key(idx) as i64);
            }
            path.push((ptr, idx));
            word = node.child(idx);
        }
        (word, path, fence)
    }

    // ------------------------------------------------------------------
    // Leaf-equivalent dispatch
    // ------------------------------------------------------------------

    fn leaf_insert(&mut self, base: usize, key: i32) -> PageInsert {
        let hier = self.hier;
        if hier.use_superpages {
            // SAFETY: base addresses a live superpage owned by this tree.
            unsafe { Superpage::from_raw(base as *mut u8) }.insert(key, &hier)
        } else {
            // SAFETY: base addresses a live page owned by this tree.
            unsafe { Page::from_raw(base as *mut u8) }.insert(key, &hier)
        }
    }

    fn leaf_delete(&mut self, base: usize, key: i32) -> PageDelete {
        let hier = self.hier;
        if hier.use_superpages {
            // SAFETY: base addresses a live superpage owned by this tree.
            unsafe { Superpage::from_raw(base as *mut u8) }.delete(key, &hier)
        } else {
            // SAFETY: base addresses a live page owned by this tree.
            unsafe { Page::from_raw(base as *mut u8) }.delete(key, &hier)
        }
    }

    /// Refresh the parent's tagged pointer after a page-leaf mutation
    /// that may have moved the leaf's cache-line root.
    fn retag(&mut self, parent: Option<&(*mut Interior, usize)>, base: usize) {
        if self.hier.use_superpages {
            return;
        }
        if let Some(&(ptr, idx)) = parent {
            // SAFETY: live interior node; base addresses a live page.
            unsafe { (*ptr).set_child(idx, tag_page_ptr(Page::from_raw_ref(base as *const u8))) };
        }
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert `key`; `false` when it was already present (or when an
    /// allocation failure prevented a required split).
    pub fn insert(&mut self, key: i32) -> bool {
        let (word, path) = self.descend_path(key);
        let base = untag(word);
        match self.leaf_insert(base, key) {
            PageInsert::Inserted => {
                self.n += 1;
                self.retag(path.last(), base);
                true
            }
            PageInsert::Duplicate => false,
            PageInsert::Full => self.split_and_insert(key, base, &path),
        }
    }

    /// Split the full leaf-equivalent at `base`, insert `key` into the
    /// proper half, and propagate the separator. All allocations happen
    /// before the first mutation.
    fn split_and_insert(&mut self, key: i32, base: usize, path: &OuterPath) -> bool {
        let hier = self.hier;

        // Pre-budget every interior the cascade can need: one per
        // contiguously full ancestor, one more if the root splits.
        let mut full_chain = 0usize;
        for &(ptr, _) in path.iter().rev() {
            // SAFETY: live interior node.
            if unsafe { &*ptr }.is_full() {
                full_chain += 1;
            } else {
                break;
            }
        }
        let root_split = full_chain == path.len();
        let mut spares: SmallVec<[*mut Interior; 4]> = SmallVec::new();
        for _ in 0..full_chain + usize::from(root_split) {
            match Interior::alloc() {
                Some(ptr) => spares.push(ptr),
                None => {
                    for &ptr in &spares {
                        // SAFETY: just allocated, never shared.
                        unsafe { Interior::free(ptr) };
                    }
                    return false;
                }
            }
        }
        let Some(region) = self.arena.alloc() else {
            for &ptr in &spares {
                // SAFETY: just allocated, never shared.
                unsafe { Interior::free(ptr) };
            }
            return false;
        };
        let right_base = region.as_ptr() as usize;

        // Split and place the pending key.
        let (mut sep, mut right_word, left_word) = if hier.use_superpages {
            // SAFETY: both regions are live, distinct superpages.
            let left = unsafe { Superpage::from_raw(base as *mut u8) };
            let right = unsafe { Superpage::from_raw(right_base as *mut u8) };
            let sep = left.split_into(right, &hier);
            let target = if key < sep { base } else { right_base };
            let st = self.leaf_insert(target, key);
            debug_assert_eq!(st, PageInsert::Inserted);
            (sep, right_base, base)
        } else {
            // SAFETY: both regions are live, distinct pages.
            let left = unsafe { Page::from_raw(base as *mut u8) };
            let right = unsafe { Page::from_raw(right_base as *mut u8) };
            let sep = left.split_into(right, &hier);
            let target = if key < sep { base } else { right_base };
            let st = self.leaf_insert(target, key);
            debug_assert_eq!(st, PageInsert::Inserted);
            // SAFETY: both pages live; tags re-derived from headers.
            unsafe {
                (
                    sep,
                    tag_page_ptr(Page::from_raw_ref(right_base as *const u8)),
                    tag_page_ptr(Page::from_raw_ref(base as *const u8)),
                )
            }
        };
        self.n += 1;

        // Propagate the separator upward.
        let mut first = true;
        for &(ptr, idx) in path.iter().rev() {
            // SAFETY: live interior node, exclusively owned.
            let node = unsafe { &mut *ptr };
            if first {
                node.set_child(idx, left_word);
                first = false;
            }
            if !node.is_full() {
                node.insert_at(idx, sep, right_word);
                debug_assert!(spares.is_empty());
                return true;
            }

            // Rebuild both halves from the virtually merged arrays.
            let mut merged_keys = [0i32; MAX_IKEYS + 1];
            let mut merged_children = [0usize; MAX_IKEYS + 2];
            let n = node.len();
            merged_keys[..idx].copy_from_slice(&node.keys()[..idx]);
            merged_keys[idx] = sep;
            merged_keys[idx + 1..n + 1].copy_from_slice(&node.keys()[idx..]);
            for i in 0..=idx {
                merged_children[i] = node.child(i);
            }
            merged_children[idx + 1] = right_word;
            for i in idx + 1..=n {
                merged_children[i + 1] = node.child(i);
            }

            let mid = (n + 1) / 2;
            sep = merged_keys[mid];
            node.set(&merged_keys[..mid], &merged_children[..mid + 1]);

            let new_node = spares.pop().unwrap();
            // SAFETY: fresh exclusive allocation.
            unsafe { (*new_node).set(&merged_keys[mid + 1..n + 1], &merged_children[mid + 1..n + 2]) };
            right_word = new_node as usize;
        }

        // The cascade reached the root (or the root was a leaf).
        let new_root = spares.pop().unwrap();
        let left_root = if path.is_empty() { left_word } else { self.root };
        // SAFETY: fresh exclusive allocation.
        unsafe { (*new_root).set(&[sep], &[left_root, right_word]) };
        self.root = new_root as usize;
        self.height += 1;
        debug_assert!(spares.is_empty());
        true
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete `key`; `false` when it was not present.
    pub fn delete(&mut self, key: i32) -> bool {
        if self.n == 0 {
            return false;
        }
        let (word, path) = self.descend_path(key);
        let base = untag(word);
        match self.leaf_delete(base, key) {
            PageDelete::NotFound => false,
            PageDelete::Deleted => {
                self.n -= 1;
                self.retag(path.last(), base);
                true
            }
            PageDelete::Underflow => {
                self.n -= 1;
                self.handle_underflow(&path, base);
                true
            }
        }
    }

    /// Rebalance after a leaf-equivalent underflowed, then propagate
    /// interior deficiencies and collapse the root if needed.
    fn handle_underflow(&mut self, path: &OuterPath, base: usize) {
        let Some(&(parent_ptr, ci)) = path.last() else {
            // A lone root leaf may run arbitrarily low.
            return;
        };

        if self.hier.use_superpages {
            self.rebalance_sp_leaves(parent_ptr, ci, base);
        } else {
            self.rebalance_page_leaves(parent_ptr, ci, base);
        }

        // Interior deficiencies bubble up toward the root.
        let mut level = path.len() - 1;
        loop {
            let (node_ptr, _) = path[level];
            if level == 0 {
                // SAFETY: live root interior.
                let root = unsafe { &*node_ptr };
                if root.len() == 0 {
                    self.root = untag(root.child(0));
                    self.height -= 1;
                    // SAFETY: detached from the tree, freed exactly once.
                    unsafe { Interior::free(node_ptr) };
                }
                return;
            }
            // SAFETY: live interior node.
            if unsafe { &*node_ptr }.len() >= MIN_IKEYS {
                return;
            }

            level -= 1;
            let (gp_ptr, gci) = path[level];
            if !self.try_interior_redistribute(gp_ptr, gci) {
                self.merge_interior(gp_ptr, gci);
            }
        }
    }

    /// Borrow or merge between page-leaf siblings under `parent`.
    fn rebalance_page_leaves(&mut self, parent_ptr: *mut Interior, ci: usize, base: usize) {
        let hier = self.hier;
        // SAFETY: live interior node, exclusively owned during mutation.
        let parent = unsafe { &mut *parent_ptr };
        debug_assert!(parent.len() > 0);

        let mut buf = [0i32; 2 * PAGE_SCRATCH_KEYS];

        // Redistribute from the left sibling.
        if ci > 0 {
            let left_base = untag(parent.child(ci - 1));
            // SAFETY: live pages of this tree, distinct regions.
            let left = unsafe { Page::from_raw(left_base as *mut u8) };
            if left.nkeys() > hier.min_page_keys {
                let cur = unsafe { Page::from_raw(base as *mut u8) };
                let sep = redistribute_pages(left, cur, &mut buf, &hier);
                parent.set_key(ci - 1, sep);
                parent.set_child(ci - 1, tag_page_ptr(left));
                parent.set_child(ci, tag_page_ptr(cur));
                return;
            }
        }
        // Redistribute from the right sibling.
        if ci < parent.len() {
            let right_base = untag(parent.child(ci + 1));
            // SAFETY: live pages of this tree, distinct regions.
            let right = unsafe { Page::from_raw(right_base as *mut u8) };
            if right.nkeys() > hier.min_page_keys {
                let cur = unsafe { Page::from_raw(base as *mut u8) };
                let sep = redistribute_pages(cur, right, &mut buf, &hier);
                parent.set_key(ci, sep);
                parent.set_child(ci, tag_page_ptr(cur));
                parent.set_child(ci + 1, tag_page_ptr(right));
                return;
            }
        }

        // Merge (left preferred); the victim page returns to the arena.
        if ci > 0 {
            let left_base = untag(parent.child(ci - 1));
            // SAFETY: live pages of this tree, distinct regions.
            let left = unsafe { Page::from_raw(left_base as *mut u8) };
            let victim = unsafe { Page::from_raw(base as *mut u8) };
            merge_pages(left, victim, &mut buf, &hier);
            parent.remove_at(ci - 1);
            parent.set_child(ci - 1, tag_page_ptr(left));
            self.free_region(base);
        } else {
            let right_base = untag(parent.child(ci + 1));
            // SAFETY: live pages of this tree, distinct regions.
            let cur = unsafe { Page::from_raw(base as *mut u8) };
            let victim = unsafe { Page::from_raw(right_base as *mut u8) };
            merge_pages(cur, victim, &mut buf, &hier);
            parent.remove_at(ci);
            parent.set_child(ci, tag_page_ptr(cur));
            self.free_region(right_base);
        }
    }

    /// Borrow or merge between superpage siblings under `parent`.
    fn rebalance_sp_leaves(&mut self, parent_ptr: *mut Interior, ci: usize, base: usize) {
        let hier = self.hier;
        // SAFETY: live interior node, exclusively owned during mutation.
        let parent = unsafe { &mut *parent_ptr };
        debug_assert!(parent.len() > 0);

        if ci > 0 {
            let left_base = parent.child(ci - 1);
            // SAFETY: live superpages of this tree, distinct regions.
            let left = unsafe { Superpage::from_raw(left_base as *mut u8) };
            if left.nkeys() > hier.min_sp_keys {
                let cur = unsafe { Superpage::from_raw(base as *mut u8) };
                let sep = redistribute_superpages(left, cur, &hier);
                parent.set_key(ci - 1, sep);
                return;
            }
        }
        if ci < parent.len() {
            let right_base = parent.child(ci + 1);
            // SAFETY: live superpages of this tree, distinct regions.
            let right = unsafe { Superpage::from_raw(right_base as *mut u8) };
            if right.nkeys() > hier.min_sp_keys {
                let cur = unsafe { Superpage::from_raw(base as *mut u8) };
                let sep = redistribute_superpages(cur, right, &hier);
                parent.set_key(ci, sep);
                return;
            }
        }

        if ci > 0 {
            let left_base = parent.child(ci - 1);
            // SAFETY: live superpages of this tree, distinct regions.
            let left = unsafe { Superpage::from_raw(left_base as *mut u8) };
            let victim = unsafe { Superpage::from_raw(base as *mut u8) };
            merge_superpages(left, victim, &hier);
            parent.remove_at(ci - 1);
            self.free_region(base);
        } else {
            let right_base = parent.child(ci + 1);
            // SAFETY: live superpages of this tree, distinct regions.
            let cur = unsafe { Superpage::from_raw(base as *mut u8) };
            let victim = unsafe { Superpage::from_raw(right_base as *mut u8) };
            merge_superpages(cur, victim, &hier);
            parent.remove_at(ci);
            self.free_region(right_base);
        }
    }

    fn free_region(&mut self, base: usize) {
        if let Some(ptr) = std::ptr::NonNull::new(base as *mut u8) {
            self.arena.free(ptr);
        }
    }

    /// Rotate one child into the deficient interior at child `gci`.
    fn try_interior_redistribute(&mut self, gp_ptr: *mut Interior, gci: usize) -> bool {
        // SAFETY: live interior nodes, exclusively owned during mutation.
        let gp = unsafe { &mut *gp_ptr };
        let cur = untag(gp.child(gci)) as *mut Interior;

        if gci > 0 {
            let left = untag(gp.child(gci - 1)) as *mut Interior;
            // SAFETY: as above.
            let left = unsafe { &mut *left };
            if left.len() > MIN_IKEYS {
                let sep = gp.key(gci - 1);
                let (k, c) = left.pop_last_child();
                // SAFETY: as above.
                unsafe { (*cur).push_first_child(sep, c) };
                gp.set_key(gci - 1, k);
                return true;
            }
        }
        if gci < gp.len() {
            let right = untag(gp.child(gci + 1)) as *mut Interior;
            // SAFETY: as above.
            let right = unsafe { &mut *right };
            if right.len() > MIN_IKEYS {
                let sep = gp.key(gci);
                let (k, c) = right.pop_first_child();
                // SAFETY: as above.
                unsafe { (*cur).push_last_child(sep, c) };
                gp.set_key(gci, k);
                return true;
            }
        }
        false
    }

    /// Merge the deficient interior with a sibling, pulling the parent
    /// separator down (left preferred).
    fn merge_interior(&mut self, gp_ptr: *mut Interior, gci: usize) {
        // SAFETY: live interior nodes, exclusively owned during mutation.
        let gp = unsafe { &mut *gp_ptr };
        if gci > 0 {
            let left = untag(gp.child(gci - 1)) as *mut Interior;
            let victim = untag(gp.child(gci)) as *mut Interior;
            let sep = gp.key(gci - 1);
            // SAFETY: distinct live nodes.
            unsafe { (*left).merge_with_sep(sep, &*victim) };
            gp.remove_at(gci - 1);
            // SAFETY: detached from the tree, freed exactly once.
            unsafe { Interior::free(victim) };
        } else {
            let cur = untag(gp.child(gci)) as *mut Interior;
            let victim = untag(gp.child(gci + 1)) as *mut Interior;
            let sep = gp.key(gci);
            // SAFETY: distinct live nodes.
            unsafe { (*cur).merge_with_sep(sep, &*victim) };
            gp.remove_at(gci);
            // SAFETY: detached from the tree, freed exactly once.
            unsafe { Interior::free(victim) };
        }
    }

    // ------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------

    /// Insert a batch of keys; returns how many were new. Keys are
    /// sorted first so runs falling into one leaf skip re-navigation.
    pub fn insert_batch(&mut self, keys: &[i32]) -> usize {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();

        let mut inserted = 0usize;
        let mut i = 0usize;
        while i < sorted.len() {
            let (word, path, fence) = self.descend_with_fence(sorted[i]);
            let base = untag(word);
            let mut dirty = false;
            while i < sorted.len() && (sorted[i] as i64) < fence {
                match self.leaf_insert(base, sorted[i]) {
                    PageInsert::Inserted => {
                        self.n += 1;
                        inserted += 1;
                        i += 1;
                        dirty = true;
                    }
                    PageInsert::Duplicate => i += 1,
                    PageInsert::Full => {
                        // The split invalidates the path; finish this key
                        // through the full insert and re-navigate.
                        if dirty {
                            self.retag(path.last(), base);
                        }
                        if self.split_and_insert(sorted[i], base, &path) {
                            inserted += 1;
                        }
                        i += 1;
                        dirty = false;
                        break;
                    }
                }
            }
            if dirty {
                self.retag(path.last(), base);
            }
        }
        inserted
    }

    /// Delete a batch of keys; returns how many were present.
    pub fn delete_batch(&mut self, keys: &[i32]) -> usize {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();

        let mut deleted = 0usize;
        let mut i = 0usize;
        while i < sorted.len() && self.n > 0 {
            let (word, path, fence) = self.descend_with_fence(sorted[i]);
            let base = untag(word);
            let mut dirty = false;
            while i < sorted.len() && (sorted[i] as i64) < fence {
                match self.leaf_delete(base, sorted[i]) {
                    PageDelete::Deleted => {
                        self.n -= 1;
                        deleted += 1;
                        i += 1;
                        dirty = true;
                    }
                    PageDelete::NotFound => i += 1,
                    PageDelete::Underflow => {
                        // Rebalancing may merge this leaf away; the path
                        // is dead afterwards.
                        self.n -= 1;
                        deleted += 1;
                        i += 1;
                        self.handle_underflow(&path, base);
                        dirty = false;
                        break;
                    }
                }
            }
            if dirty {
                self.retag(path.last(), base);
            }
        }
        deleted
    }

    // ------------------------------------------------------------------
    // Iterator support
    // ------------------------------------------------------------------

    /// Page leaf whose range covers `start` (or the leftmost when the
    /// key precedes the tree). Null for an empty tree.
    pub(crate) fn find_leaf_page(&self, start: i32) -> *const Page {
        if self.n == 0 {
            return std::ptr::null();
        }
        let base = untag(self.descend_readonly(start));
        if self.hier.use_superpages {
            // SAFETY: base addresses a live superpage of this tree.
            unsafe { Superpage::from_raw_ref(base as *const u8) }.find_leaf(start)
        } else {
            base as *const Page
        }
    }

    // ------------------------------------------------------------------
    // Structural validation (tests)
    // ------------------------------------------------------------------

    /// Validate every reachable invariant: interior occupancy and
    /// ordering, tag fidelity, per-leaf sub-tree invariants, sibling
    /// list closure in both directions, and the key count. Test
    /// support; panics on violation.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        let mut leaves: Vec<usize> = Vec::new();
        let mut key_total = 0usize;
        self.collect_and_check(self.root, self.height, i64::MIN, i64::MAX, true, &mut leaves, &mut key_total);
        assert_eq!(key_total, self.n, "leaf key totals disagree with tree.n");

        // Page-leaf chain: forward traversal visits every leaf in order,
        // backward traversal is its mirror.
        let pages: Vec<*const Page> = if self.hier.use_superpages {
            leaves
                .iter()
                .flat_map(|&sp| {
                    // SAFETY: live superpage of this tree.
                    let sp = unsafe { Superpage::from_raw_ref(sp as *const u8) };
                    let mut v = Vec::new();
                    let mut p = sp.first_leaf();
                    loop {
                        v.push(p);
                        if p == sp.last_leaf() {
                            break;
                        }
                        // SAFETY: intra-superpage chain of live pages.
                        p = unsafe { (*p).next() as *const Page };
                    }
                    v
                })
                .collect()
        } else {
            leaves.iter().map(|&w| w as *const Page).collect()
        };

        for (i, &p) in pages.iter().enumerate() {
            // SAFETY: live pages of this tree.
            let page = unsafe { &*p };
            let expect_prev = if i == 0 { std::ptr::null_mut() } else { pages[i - 1] as *mut Page };
            let expect_next =
                if i + 1 == pages.len() { std::ptr::null_mut() } else { pages[i + 1] as *mut Page };
            assert_eq!(page.prev(), expect_prev, "leaf chain prev broken at {i}");
            assert_eq!(page.next(), expect_next, "leaf chain next broken at {i}");
        }
    }

    fn collect_and_check(
        &self,
        word: usize,
        height: u32,
        lo: i64,
        hi: i64,
        is_root: bool,
        leaves: &mut Vec<usize>,
        key_total: &mut usize,
    ) {
        if height == 0 {
            let base = untag(word);
            if self.hier.use_superpages {
                // SAFETY: live superpage of this tree.
                let sp = unsafe { Superpage::from_raw_ref(base as *const u8) };
                sp.check_invariants();
                if sp.nkeys() > 0 {
                    assert!((sp.min_key() as i64) >= lo && (sp.max_key() as i64) < hi);
                }
                *key_total += sp.nkeys();
            } else {
                // SAFETY: live page of this tree.
                let page = unsafe { Page::from_raw_ref(base as *const u8) };
                page.check_invariants();
                if page.nkeys() > 0 {
                    assert!((page.min_key() as i64) >= lo && (page.max_key() as i64) < hi);
                }
                if !is_root {
                    // Tag fidelity against the live header.
                    assert_eq!(ptr_root_slot(word), page.root_slot(), "stale root-slot tag");
                    assert_eq!(
                        crate::btree::interior::ptr_sub_height(word),
                        page.sub_height(),
                        "stale sub-height tag"
                    );
                }
                *key_total += page.nkeys();
            }
            leaves.push(base);
            return;
        }

        // SAFETY: non-leaf levels always hold live interior nodes.
        let node = unsafe { &*(untag(word) as *const Interior) };
        let keys = node.keys();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "interior keys not strictly sorted");
        if !is_root {
            assert!(node.len() >= MIN_IKEYS, "non-root interior underfull: {}", node.len());
        }
        assert!(node.len() <= MAX_IKEYS);
        for c in 0..node.nchildren() {
            let clo = if c == 0 { lo } else { keys[c - 1] as i64 };
            let chi = if c == node.nchildren() - 1 { hi } else { keys[c] as i64 };
            self.collect_and_check(node.child(c), height - 1, clo, chi, false, leaves, key_total);
        }
    }

    fn free_interiors(word: usize, height: u32) {
        if height == 0 {
            return;
        }
        let ptr = untag(word) as *mut Interior;
        // SAFETY: live interior node being torn down exactly once.
        let node = unsafe { &*ptr };
        for c in 0..node.nchildren() {
            Self::free_interiors(node.child(c), height - 1);
        }
        // SAFETY: children already freed; node unreachable afterwards.
        unsafe { Interior::free(ptr) };
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        Self::free_interiors(self.root, self.height);
        // Leaf regions die with the arena.
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("n", &self.n)
            .field("height", &self.height)
            .field("use_superpages", &self.hier.use_superpages)
            .field("cl_strategy", &self.hier.cl_strategy)
            .finish()
    }
}

// ============================================================================
// Leaf-equivalent pair operations
// ============================================================================

/// Even out two adjacent pages; returns the right page's new minimum.
fn redistribute_pages(left: &mut Page, right: &mut Page, buf: &mut [i32], hier: &Hierarchy) -> i32 {
    let saved = (left.prev(), left.next(), right.prev(), right.next());
    let ln = left.extract_sorted(buf);
    let rn = right.extract_sorted(&mut buf[ln..]);
    let total = ln + rn;
    let new_ln = total / 2;

    left.bulk_load(&buf[..new_ln], hier);
    right.bulk_load(&buf[new_ln..total], hier);
    left.set_prev(saved.0);
    left.set_next(saved.1);
    right.set_prev(saved.2);
    right.set_next(saved.3);

    buf[new_ln]
}

/// Pour `victim` into `left` and unlink it from the sibling chain.
fn merge_pages(left: &mut Page, victim: &mut Page, buf: &mut [i32], hier: &Hierarchy) {
    let saved_prev = left.prev();
    let saved_next = victim.next();
    let ln = left.extract_sorted(buf);
    let rn = victim.extract_sorted(&mut buf[ln..]);

    left.bulk_load(&buf[..ln + rn], hier);
    left.set_prev(saved_prev);
    left.set_next(saved_next);
    if !saved_next.is_null() {
        // SAFETY: sibling links reference live pages of the same tree.
        unsafe { (*saved_next).set_prev(left as *mut Page) };
    }
}

/// Even out two adjacent superpages; returns the right one's new
/// minimum. Re-splices the global page-leaf list across both regions.
fn redistribute_superpages(left: &mut Superpage, right: &mut Superpage, hier: &Hierarchy) -> i32 {
    // SAFETY: boundary leaves are live pages of the two superpages.
    let outer_prev = unsafe { &*left.first_leaf() }.prev();
    let outer_next = unsafe { &*right.last_leaf() }.next();
    let (sp_prev, sp_next) = (left.prev(), right.next());

    let total = left.nkeys() + right.nkeys();
    let mut buf = vec![0i32; total];
    let ln = left.extract_sorted(&mut buf);
    let rn = right.extract_sorted(&mut buf[ln..]);
    debug_assert_eq!(ln + rn, total);
    let new_ln = total / 2;

    left.bulk_load(&buf[..new_ln], hier);
    right.bulk_load(&buf[new_ln..], hier);

    stitch_sp_boundaries(left, right, outer_prev, outer_next);
    left.set_prev(sp_prev);
    left.set_next(right as *mut Superpage);
    right.set_prev(left as *mut Superpage);
    right.set_next(sp_next);

    buf[new_ln]
}

/// Pour `victim` into `left`, unlink it at both the page and superpage
/// level.
fn merge_superpages(left: &mut Superpage, victim: &mut Superpage, hier: &Hierarchy) {
    // SAFETY: boundary leaves are live pages of the two superpages.
    let outer_prev = unsafe { &*left.first_leaf() }.prev();
    let outer_next = unsafe { &*victim.last_leaf() }.next();
    let (sp_prev, sp_next) = (left.prev(), victim.next());

    let total = left.nkeys() + victim.nkeys();
    let mut buf = vec![0i32; total];
    let ln = left.extract_sorted(&mut buf);
    let rn = victim.extract_sorted(&mut buf[ln..]);
    debug_assert_eq!(ln + rn, total);

    left.bulk_load(&buf, hier);

    let first = left.first_leaf_mut();
    let last = left.last_leaf_mut();
    // SAFETY: live pages; saved neighbors, if non-null, are live too.
    unsafe {
        (*first).set_prev(outer_prev);
        if !outer_prev.is_null() {
            (*outer_prev).set_next(first);
        }
        (*last).set_next(outer_next);
        if !outer_next.is_null() {
            (*outer_next).set_prev(last);
        }
    }

    left.set_prev(sp_prev);
    left.set_next(sp_next);
    if !sp_next.is_null() {
        // SAFETY: superpage chain references live superpages.
        unsafe { (*sp_next).set_prev(left as *mut Superpage) };
    }
}

/// Re-splice the page-leaf chain around two freshly rebuilt superpages.
fn stitch_sp_boundaries(
    left: &mut Superpage,
    right: &mut Superpage,
    outer_prev: *mut Page,
    outer_next: *mut Page,
) {
    let left_first = left.first_leaf_mut();
    let left_last = left.last_leaf_mut();
    let right_first = right.first_leaf_mut();
    let right_last = right.last_leaf_mut();

    // SAFETY: all endpoints are live pages; saved neighbors, if
    // non-null, are live pages of the same tree.
    unsafe {
        (*left_first).set_prev(outer_prev);
        if !outer_prev.is_null() {
            (*outer_prev).set_next(left_first);
        }
        (*left_last).set_next(right_first);
        (*right_first).set_prev(left_last);
        (*right_last).set_next(outer_next);
        if !outer_next.is_null() {
            (*outer_next).set_prev(right_last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_queries() {
        let tree = Tree::new().unwrap();
        assert_eq!(tree.len(), 0);
        assert!(tree.is_empty());
        assert_eq!(tree.search(0), None);
        assert!(!tree.contains(0));
    }

    #[test]
    fn insert_and_point_queries() {
        let mut tree = Tree::new().unwrap();
        assert!(tree.insert(42));
        assert!(!tree.insert(42));
        assert_eq!(tree.len(), 1);
        assert!(tree.contains(42));
        assert!(!tree.contains(41));
        assert_eq!(tree.search(50), Some(42));
        assert_eq!(tree.search(41), None);
    }

    #[test]
    fn insert_past_one_page_splits_outer() {
        let mut tree = Tree::new().unwrap();
        for k in 0..3000 {
            assert!(tree.insert(k), "insert {k}");
        }
        assert_eq!(tree.len(), 3000);
        assert!(tree.height >= 1);
        tree.check_invariants();
        for k in 0..3000 {
            assert!(tree.contains(k), "missing {k}");
        }
    }

    #[test]
    fn descending_inserts() {
        let mut tree = Tree::new().unwrap();
        for k in (0..3000).rev() {
            assert!(tree.insert(k));
        }
        assert_eq!(tree.len(), 3000);
        tree.check_invariants();
        for k in (0..3000).step_by(7) {
            assert_eq!(tree.search(k), Some(k));
        }
    }

    #[test]
    fn delete_merges_back_to_single_leaf() {
        let mut tree = Tree::new().unwrap();
        for k in 0..3000 {
            tree.insert(k);
        }
        for k in 0..3000 {
            assert!(tree.delete(k), "delete {k}");
        }
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.height, 0);
        assert!(!tree.delete(0));
        tree.check_invariants();
    }

    #[test]
    fn bulk_load_round_trip() {
        let keys: Vec<i32> = (0..10_000).map(|i| i * 3).collect();
        let tree = Tree::bulk_load(&keys).unwrap();
        assert_eq!(tree.len(), keys.len());
        tree.check_invariants();
        for &k in keys.iter().step_by(11) {
            assert!(tree.contains(k));
            assert_eq!(tree.search(k + 1), Some(k));
        }
        assert_eq!(tree.search(-1), None);
    }

    #[test]
    fn batch_insert_then_batch_delete() {
        let mut tree = Tree::new().unwrap();
        let keys: Vec<i32> = (0..5000).rev().collect();
        assert_eq!(tree.insert_batch(&keys), 5000);
        assert_eq!(tree.insert_batch(&keys[..100]), 0);
        assert_eq!(tree.len(), 5000);
        tree.check_invariants();

        let evens: Vec<i32> = (0..5000).filter(|k| k % 2 == 0).collect();
        assert_eq!(tree.delete_batch(&evens), evens.len());
        assert_eq!(tree.len(), 2500);
        tree.check_invariants();
        assert!(tree.contains(1));
        assert!(!tree.contains(2));
    }

    #[test]
    fn superpage_tree_basic() {
        let mut tree = Tree::with_hierarchy(Hierarchy::superpage()).unwrap();
        for k in 0..5000 {
            assert!(tree.insert(k));
        }
        assert_eq!(tree.len(), 5000);
        tree.check_invariants();
        for k in (0..5000).step_by(37) {
            assert!(tree.contains(k));
        }
        for k in (0..5000).filter(|k| k % 2 == 1) {
            assert!(tree.delete(k));
        }
        assert_eq!(tree.len(), 2500);
        tree.check_invariants();
        assert!(tree.contains(2));
        assert!(!tree.contains(3));
    }

    #[test]
    fn eytzinger_tree_matches_default() {
        let mut eytz = Tree::with_hierarchy(Hierarchy::eytzinger()).unwrap();
        let mut plain = Tree::new().unwrap();
        for k in (0..4000).map(|i| (i * 37) % 8000) {
            assert_eq!(eytz.insert(k), plain.insert(k), "insert {k}");
        }
        assert_eq!(eytz.len(), plain.len());
        eytz.check_invariants();
        for q in (0..8000).step_by(13) {
            assert_eq!(eytz.search(q), plain.search(q), "query {q}");
        }
    }

    #[test]
    fn allocation_failure_shape() {
        // Interior pre-budgeting never leaves a partial cascade: a
        // successful insert after many splits keeps invariants intact.
        let mut tree = Tree::new().unwrap();
        for k in 0..20_000 {
            tree.insert(k);
        }
        tree.check_invariants();
        assert_eq!(tree.len(), 20_000);
    }
}
