//! # Chained Bitmap Arena
//!
//! The arena owns a list of anonymous memory maps ("chunks"), each
//! subdivided into fixed-size regions tracked by an allocation bitmap.
//! Allocation takes the lowest clear bit of the first chunk with room;
//! freeing clears the bit found by pointer-range lookup. When every chunk
//! is full a new one is mapped.
//!
//! ## Layout
//!
//! ```text
//! RegionArena
//!   ├─ Chunk 0: mmap ───> [region 0][region 1]...[region N-1]
//!   │           bitmap ─> 0b00101...
//!   ├─ Chunk 1: ...
//!   └─ chunk_size, region_size
//! ```
//!
//! ## Alignment
//!
//! Anonymous maps are page-aligned by the OS, and `region_size` is always
//! a multiple of 4096, so every region satisfies the 4096-byte alignment
//! the tagged-pointer encoding relies on.
//!
//! ## Huge Pages
//!
//! Chunks of 2 MiB and larger are advised `HugePage` on Linux so the
//! kernel can back superpage leaves (and dense page-leaf neighborhoods)
//! with 2 MiB TLB entries.
//!
//! ## Ownership
//!
//! The arena is owned exclusively by one tree. Regions handed out remain
//! valid until freed back or until the arena is dropped; the tree never
//! dereferences a region after returning it.

use std::ptr::NonNull;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

struct Chunk {
    map: MmapMut,
    bitmap: Vec<u64>,
    num_regions: usize,
    used: usize,
}

impl Chunk {
    fn new(chunk_size: usize, region_size: usize) -> Result<Self> {
        let num_regions = chunk_size / region_size;
        let map = MmapMut::map_anon(chunk_size)
            .wrap_err_with(|| format!("failed to map {chunk_size}-byte arena chunk"))?;

        #[cfg(target_os = "linux")]
        if chunk_size >= 2 * 1024 * 1024 {
            // Best-effort: the tree works identically on 4 KiB mappings.
            let _ = map.advise(memmap2::Advice::HugePage);
        }

        Ok(Self {
            map,
            bitmap: vec![0u64; num_regions.div_ceil(64)],
            num_regions,
            used: 0,
        })
    }

    fn base(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Lowest free region index, if any.
    fn find_free(&self) -> Option<usize> {
        for (w, word) in self.bitmap.iter().enumerate() {
            if *word != u64::MAX {
                let idx = w * 64 + (!*word).trailing_zeros() as usize;
                if idx < self.num_regions {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let base = self.map.as_ptr();
        // Range check against the mapped extent only.
        ptr >= base && (ptr as usize) < base as usize + self.map.len()
    }
}

/// Chained arena of fixed-size, page-aligned, zero-initialized regions.
pub struct RegionArena {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    region_size: usize,
}

impl RegionArena {
    /// Create an arena serving `region_size`-byte regions out of
    /// `chunk_size`-byte maps. No memory is mapped until the first
    /// allocation.
    pub fn new(chunk_size: usize, region_size: usize) -> Result<Self> {
        ensure!(region_size >= 4096, "region size {} below page alignment", region_size);
        ensure!(
            region_size % 4096 == 0,
            "region size {} is not a multiple of page size",
            region_size
        );
        let chunk_size = chunk_size.max(region_size);
        ensure!(
            chunk_size % region_size == 0,
            "chunk size {} is not a multiple of region size {}",
            chunk_size,
            region_size
        );
        Ok(Self { chunks: Vec::new(), chunk_size, region_size })
    }

    /// Size of the regions this arena serves.
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of regions currently handed out.
    pub fn regions_in_use(&self) -> usize {
        self.chunks.iter().map(|c| c.used).sum()
    }

    /// Allocate one zeroed region. `None` when the OS refuses to map a
    /// new chunk; the caller converts that into its structural-boundary
    /// failure status.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.try_alloc_existing() {
            return Some(ptr);
        }

        let chunk = Chunk::new(self.chunk_size, self.region_size).ok()?;
        self.chunks.push(chunk);
        self.try_alloc_existing()
    }

    fn try_alloc_existing(&mut self) -> Option<NonNull<u8>> {
        let region_size = self.region_size;
        for chunk in &mut self.chunks {
            if let Some(idx) = chunk.find_free() {
                chunk.bitmap[idx / 64] |= 1u64 << (idx % 64);
                chunk.used += 1;
                // SAFETY: idx < num_regions, so the region lies inside the map.
                let ptr = unsafe { chunk.base().add(idx * region_size) };
                // Fresh maps are zeroed by the OS; reused regions carry
                // stale contents and must be cleared here.
                unsafe { std::ptr::write_bytes(ptr, 0, region_size) };
                return NonNull::new(ptr);
            }
        }
        None
    }

    /// Return a region to the arena. Pointers not handed out by this
    /// arena are ignored.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let region_size = self.region_size;
        for chunk in &mut self.chunks {
            if chunk.contains(ptr.as_ptr()) {
                let offset = ptr.as_ptr() as usize - chunk.base() as usize;
                let idx = offset / region_size;
                let word = &mut chunk.bitmap[idx / 64];
                if *word & (1u64 << (idx % 64)) != 0 {
                    *word &= !(1u64 << (idx % 64));
                    chunk.used -= 1;
                }
                return;
            }
        }
        debug_assert!(false, "free of pointer not owned by this arena");
    }
}

impl std::fmt::Debug for RegionArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionArena")
            .field("chunks", &self.chunks.len())
            .field("chunk_size", &self.chunk_size)
            .field("region_size", &self.region_size)
            .field("regions_in_use", &self.regions_in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_aligned_zeroed_regions() {
        let mut arena = RegionArena::new(64 * 4096, 4096).unwrap();
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 4096, 0);
        assert_eq!(b.as_ptr() as usize % 4096, 0);
        // SAFETY: region is 4096 bytes and owned by us.
        let bytes = unsafe { std::slice::from_raw_parts(a.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_makes_region_reusable() {
        let mut arena = RegionArena::new(2 * 4096, 4096).unwrap();
        let a = arena.alloc().unwrap();
        let _b = arena.alloc().unwrap();
        assert_eq!(arena.regions_in_use(), 2);

        arena.free(a);
        assert_eq!(arena.regions_in_use(), 1);

        // The lone free region in the first chunk is handed out again.
        let c = arena.alloc().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn freed_region_is_rezeroed_on_realloc() {
        let mut arena = RegionArena::new(4096, 4096).unwrap();
        let a = arena.alloc().unwrap();
        // SAFETY: region is 4096 bytes and owned by us.
        unsafe { std::ptr::write_bytes(a.as_ptr(), 0xAB, 4096) };
        arena.free(a);

        let b = arena.alloc().unwrap();
        assert_eq!(b, a);
        let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhausted_chunks_chain_new_ones() {
        let mut arena = RegionArena::new(2 * 4096, 4096).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..5 {
            ptrs.push(arena.alloc().unwrap());
        }
        assert_eq!(arena.regions_in_use(), 5);
        ptrs.sort();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 5);
    }

    #[test]
    fn rejects_unaligned_region_size() {
        assert!(RegionArena::new(1 << 20, 1000).is_err());
        assert!(RegionArena::new(1 << 20, 6000).is_err());
    }
}
