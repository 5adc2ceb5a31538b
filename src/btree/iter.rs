//! # Ordered Iteration
//!
//! Iteration never re-descends the outer tree: it seeks once to the
//! page leaf covering the start key, extracts that leaf's keys into an
//! owned buffer, and from then on walks the sibling chain, reloading
//! one leaf at a time. The iterator borrows the tree, so the borrow
//! checker enforces the read-only-during-iteration contract that the
//! structure requires.

use crate::btree::page::Page;
use crate::btree::tree::Tree;
use crate::config::PAGE_SCRATCH_KEYS;

/// Ordered key iterator positioned by [`Tree::iter_from`].
pub struct TreeIter<'a> {
    _tree: &'a Tree,
    leaf: *const Page,
    sorted: Vec<i32>,
    pos: usize,
}

impl Tree {
    /// Iterator over all keys ≥ `start`, ascending. Pass `i32::MIN` for
    /// a full scan.
    pub fn iter_from(&self, start: i32) -> TreeIter<'_> {
        let mut iter = TreeIter {
            _tree: self,
            leaf: self.find_leaf_page(start),
            sorted: Vec::with_capacity(PAGE_SCRATCH_KEYS),
            pos: 0,
        };
        iter.load_leaf();
        iter.pos = iter.sorted.partition_point(|&k| k < start);
        // Starting past the last key of the seek leaf: begin at the
        // next leaf instead.
        if iter.pos >= iter.sorted.len() {
            iter.advance_leaf();
        }
        iter
    }
}

impl TreeIter<'_> {
    fn load_leaf(&mut self) {
        self.sorted.clear();
        if self.leaf.is_null() {
            return;
        }
        // SAFETY: the borrow on the tree keeps every leaf alive and
        // unmodified for the iterator's lifetime.
        let page = unsafe { &*self.leaf };
        self.sorted.resize(page.nkeys(), 0);
        let n = page.extract_sorted(&mut self.sorted);
        debug_assert_eq!(n, page.nkeys());
    }

    fn advance_leaf(&mut self) {
        if self.leaf.is_null() {
            return;
        }
        // SAFETY: as in load_leaf.
        self.leaf = unsafe { (*self.leaf).next() };
        self.load_leaf();
        self.pos = 0;
    }
}

impl Iterator for TreeIter<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        while self.pos >= self.sorted.len() {
            if self.leaf.is_null() {
                return None;
            }
            self.advance_leaf();
        }
        let key = self.sorted[self.pos];
        self.pos += 1;
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_yields_nothing() {
        let tree = Tree::new().unwrap();
        assert_eq!(tree.iter_from(i32::MIN).next(), None);
    }

    #[test]
    fn full_scan_is_sorted_and_complete() {
        let keys: Vec<i32> = (0..5000).map(|i| i * 3).collect();
        let tree = Tree::bulk_load(&keys).unwrap();
        let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
        assert_eq!(got, keys);
    }

    #[test]
    fn seek_lands_on_first_key_not_below() {
        let keys: Vec<i32> = (0..100).map(|i| i * 10).collect();
        let tree = Tree::bulk_load(&keys).unwrap();

        let mut it = tree.iter_from(50);
        assert_eq!(it.next(), Some(50));
        assert_eq!(it.next(), Some(60));

        let mut it = tree.iter_from(55);
        assert_eq!(it.next(), Some(60));

        assert_eq!(tree.iter_from(991).next(), None);
    }

    #[test]
    fn scan_crosses_leaf_boundaries() {
        let mut tree = Tree::new().unwrap();
        for k in (0..4000).rev() {
            tree.insert(k);
        }
        let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
        let expect: Vec<i32> = (0..4000).collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn superpage_scan() {
        let keys: Vec<i32> = (0..20_000).collect();
        let tree =
            Tree::bulk_load_with(&keys, crate::config::Hierarchy::superpage()).unwrap();
        let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
        assert_eq!(got, keys);
        assert_eq!(tree.iter_from(19_999).next(), Some(19_999));
    }
}
