//! `DmaRegion` / `SgTable`, owned, physically-contiguous, uncacheable buffers
//! and the scatter-gather view client I/O is mapped through.
//!
//! As spec.md §3 (DmaRegion / SgTable): the invariant `Σ segment.length ==
//! length` holds, segments never cross a page boundary, and on a controller
//! without 64-bit addressing capability every segment's physical address is
//! checked against `u32::MAX` rather than silently truncated (see
//! SPEC_FULL.md's dma module section for why this departs from the original).

extern crate alloc;

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::util::{Error, Result};

pub(crate) const PAGE_SIZE: usize = 0x1000;

/// A 64-bit physical address. Newtype instead of a bare `u64` so the 32-bit
/// addressing check in [`SgTable`] can't be skipped by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn fits_32bit(self) -> bool {
        self.0 <= u32::MAX as u64
    }

    pub const fn add(self, off: u64) -> Self {
        PhysAddr(self.0 + off)
    }
}

/// Injected by the embedder: allocates/frees physically-contiguous,
/// uncacheable memory. The core never touches a page table or frame
/// allocator directly (spec.md §1, register/memory bring-up is an
/// external collaborator's job).
pub trait DmaAllocator {
    /// Allocate `bytes` rounded up to `align` (a power of two, >= page size
    /// for anything handed to hardware as a DMA buffer). Returns the
    /// physical base and a writable pointer to the same memory.
    fn alloc_contiguous(&self, bytes: usize, align: usize) -> Result<(PhysAddr, NonNull<u8>)>;

    /// Release a region previously returned by `alloc_contiguous`.
    ///
    /// # Safety
    /// `phys`/`bytes` must exactly match a prior successful allocation that
    /// has not already been freed.
    unsafe fn free(&self, phys: PhysAddr, bytes: usize);
}

/// One (physical address, length) run that lies entirely within a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub phys: PhysAddr,
    pub len: u32,
}

/// Scatter-gather view over a `DmaRegion` (or an externally supplied client
/// buffer already split by the caller), split so that no entry crosses a
/// page boundary.
#[derive(Debug, Clone, Default)]
pub struct SgTable {
    segments: Vec<Segment>,
    total_len: usize,
}

impl SgTable {
    pub fn new() -> Self {
        Self { segments: Vec::new(), total_len: 0 }
    }

    /// Build a page-bounded SG table from one contiguous physical run.
    /// Rejects any segment whose address would overflow 32 bits when
    /// `addr64` is false, per spec.md §3.
    pub fn from_contiguous(phys: PhysAddr, len: usize, addr64: bool) -> Result<Self> {
        let mut table = Self::new();
        let mut offset = 0usize;
        while offset < len {
            let page_off = (phys.0 as usize + offset) & (PAGE_SIZE - 1);
            let chunk = core::cmp::min(len - offset, PAGE_SIZE - page_off);
            let seg_phys = phys.add(offset as u64);
            if !addr64 && !seg_phys.fits_32bit() {
                return Err(Error::AddressOverflow);
            }
            table.segments.push(Segment { phys: seg_phys, len: chunk as u32 });
            table.total_len += chunk;
            offset += chunk;
        }
        Ok(table)
    }

    /// Construct directly from caller-supplied segments (client buffers that
    /// arrive pre-scattered, e.g. from a higher-level page cache).
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let total_len = segments.iter().map(|s| s.len as usize).sum();
        Self { segments, total_len }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Walk segments starting at `(index, offset)`, yielding contiguous byte
    /// runs bounded by `max_len` bytes (used to split a window of an SG table
    /// across several transfer descriptors). Returns the runs consumed plus
    /// the new `(index, offset)` cursor.
    pub fn take(&self, mut index: usize, mut offset: usize, max_len: usize) -> (Vec<Segment>, usize, usize) {
        let mut out = Vec::new();
        let mut remaining = max_len;
        while remaining > 0 {
            let Some(seg) = self.segments.get(index) else { break };
            let avail = seg.len as usize - offset;
            let take = core::cmp::min(avail, remaining);
            if take == 0 {
                break;
            }
            out.push(Segment { phys: seg.phys.add(offset as u64), len: take as u32 });
            remaining -= take;
            offset += take;
            if offset >= seg.len as usize {
                index += 1;
                offset = 0;
            }
        }
        (out, index, offset)
    }
}

/// An owned physically-contiguous DMA buffer plus its scatter-gather view.
pub struct DmaRegion {
    phys: PhysAddr,
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for DmaRegion {}

impl DmaRegion {
    pub fn alloc(alloc: &dyn DmaAllocator, bytes: usize, align: usize) -> Result<Self> {
        let (phys, ptr) = alloc.alloc_contiguous(bytes, align)?;
        Ok(Self { phys, ptr, len: bytes })
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.ptr.as_ptr() as *const T
    }

    pub fn as_mut_ptr<T>(&mut self) -> *mut T {
        self.ptr.as_ptr() as *mut T
    }

    pub fn sg_table(&self, addr64: bool) -> Result<SgTable> {
        SgTable::from_contiguous(self.phys, self.len, addr64)
    }

    /// Release the backing memory back to `alloc`. Consumes `self` because
    /// the memory is no longer valid to dereference afterwards.
    pub fn free(self, alloc: &dyn DmaAllocator) {
        unsafe { alloc.free(self.phys, self.len) };
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::alloc::{alloc as heap_alloc, dealloc, Layout};
    use core::cell::RefCell;

    /// Host-side fake: backs "DMA" memory with the regular heap and pretends
    /// the virtual address is also the physical address, which is enough to
    /// exercise the page-splitting and address-overflow logic.
    pub struct FakeDma {
        allocations: RefCell<Vec<(Layout, *mut u8)>>,
    }

    impl FakeDma {
        pub fn new() -> Self {
            Self { allocations: RefCell::new(Vec::new()) }
        }
    }

    impl DmaAllocator for FakeDma {
        fn alloc_contiguous(&self, bytes: usize, align: usize) -> Result<(PhysAddr, NonNull<u8>)> {
            let layout = Layout::from_size_align(bytes, align).map_err(|_| Error::Invalid)?;
            let raw = unsafe { heap_alloc(layout) };
            let ptr = NonNull::new(raw).ok_or(Error::OutOfPool)?;
            self.allocations.borrow_mut().push((layout, raw));
            Ok((PhysAddr(raw as u64), ptr))
        }

        unsafe fn free(&self, phys: PhysAddr, _bytes: usize) {
            let mut allocations = self.allocations.borrow_mut();
            if let Some(pos) = allocations.iter().position(|(_, p)| *p as u64 == phys.0) {
                let (layout, raw) = allocations.remove(pos);
                dealloc(raw, layout);
            }
        }
    }

    #[test]
    fn sg_table_splits_on_page_boundary() {
        // Force a base address 0x800 into the page so a 0x1000-byte region crosses one boundary.
        let base = PhysAddr(0x1000_0800);
        let table = SgTable::from_contiguous(base, 0x1000, true).unwrap();
        assert_eq!(table.total_len(), 0x1000);
        assert_eq!(table.segments()[0].len, 0x800);
        assert_eq!(table.segments()[1].len, 0x800);
        assert_eq!(table.segments()[1].phys, base.add(0x800));
    }

    #[test]
    fn sg_table_rejects_high_address_without_addr64() {
        let base = PhysAddr((u32::MAX as u64) - 0x10);
        let err = SgTable::from_contiguous(base, 0x1000, false).unwrap_err();
        assert_eq!(err, Error::AddressOverflow);
    }

    #[test]
    fn take_splits_across_segment_boundaries() {
        let table = SgTable::from_segments(alloc::vec![
            Segment { phys: PhysAddr(0x1000), len: 512 },
            Segment { phys: PhysAddr(0x2000), len: 512 },
        ]);
        let (runs, idx, off) = table.take(0, 0, 768);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len, 512);
        assert_eq!(runs[1].len, 256);
        assert_eq!(idx, 1);
        assert_eq!(off, 256);
    }

    #[test]
    fn dma_region_roundtrips_through_fake_allocator() {
        let fake = FakeDma::new();
        let mut region = DmaRegion::alloc(&fake, 4096, 4096).unwrap();
        region.as_mut_slice()[0] = 0xAB;
        assert_eq!(region.as_slice()[0], 0xAB);
        let sg = region.sg_table(true).unwrap();
        assert_eq!(sg.total_len(), 4096);
        region.free(&fake);
    }
}
