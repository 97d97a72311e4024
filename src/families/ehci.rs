//! EHCI queue family: Queue Heads and Queue Element Transfer Descriptors
//! (qTDs), spec.md §4.4.
//!
//! Layout and status-bit table grounded in `examples/felipestenzel-stenzel_os/
//! stenzel-os-x86-ultra/kernel/src/drivers/usb/ehci.rs`'s `QueueHead`/
//! `TransferDescriptor`/`QTD_STATUS_*` constants.

extern crate alloc;

use crate::dma::SgTable;
use crate::pool::{DescriptorPool, Handle, PoolElement, SchedulerObject, NO_INDEX};
use crate::scheduler::ElementRef;
use crate::transfer::{ProcessEvent, ProcessReason, ScanContext};
use crate::util::{Error, Result};

use super::QueueFamily;

const QTD_STATUS_ACTIVE: u32 = 1 << 7;
const QTD_STATUS_HALTED: u32 = 1 << 6;
const QTD_STATUS_BUFERR: u32 = 1 << 5;
const QTD_STATUS_BABBLE: u32 = 1 << 4;
const QTD_STATUS_XACTERR: u32 = 1 << 3;
const QTD_CERR_MASK: u32 = 0b11 << 10;
const QTD_PID_SHIFT: u32 = 8;
pub const QTD_PID_OUT: u32 = 0;
pub const QTD_PID_IN: u32 = 1;
pub const QTD_PID_SETUP: u32 = 2;
const QTD_IOC: u32 = 1 << 15;
const QTD_TOTAL_BYTES_SHIFT: u32 = 16;
const QTD_TOGGLE: u32 = 1 << 31;
const QTD_TERMINATE: u32 = 1 << 0;
const QTD_MAX_TRANSFER: usize = 0x7FFF;

/// EHCI Queue Head: asynchronous or periodic anchor, carries the transfer
/// overlay EHCI copies qTD state into while executing.
#[repr(C, align(32))]
pub struct Qh {
    pub horizontal_link: u32,
    pub endpoint_chars: u32,
    pub endpoint_caps: u32,
    pub current_qtd: u32,
    pub next_qtd: u32,
    pub alt_next_qtd: u32,
    pub token: u32,
    pub buffers: [u32; 5],
    pub object: SchedulerObject,
}

impl PoolElement for Qh {
    fn scheduler_object(&self) -> &SchedulerObject {
        &self.object
    }
    fn scheduler_object_mut(&mut self) -> &mut SchedulerObject {
        &mut self.object
    }
    fn reset(&mut self) {
        self.horizontal_link = QTD_TERMINATE;
        self.endpoint_chars = 0;
        self.endpoint_caps = 0;
        self.current_qtd = 0;
        self.next_qtd = QTD_TERMINATE;
        self.alt_next_qtd = QTD_TERMINATE;
        self.token = 0;
        self.buffers = [0; 5];
        self.object = SchedulerObject::new();
    }
}

/// EHCI qTD, 32 bytes of hardware state plus shadow tail. `requested_len`
/// is software-only: the Total Bytes to Transfer field in `token` is
/// decremented in place as hardware executes the qTD, so the originally
/// requested length has to be retained separately to recover bytes moved.
#[repr(C, align(32))]
pub struct Qtd {
    pub next_qtd: u32,
    pub alt_next_qtd: u32,
    pub token: u32,
    pub buffers: [u32; 5],
    pub object: SchedulerObject,
    pub requested_len: u16,
}

impl Qtd {
    pub fn is_active(&self) -> bool {
        self.token & QTD_STATUS_ACTIVE != 0
    }

    pub fn toggle(&self) -> bool {
        self.token & QTD_TOGGLE != 0
    }

    pub fn remaining_bytes(&self) -> u16 {
        ((self.token >> QTD_TOTAL_BYTES_SHIFT) & 0x7FFF) as u16
    }

    /// Bytes actually moved: the requested length minus whatever the Total
    /// Bytes to Transfer field still holds once the qTD retires.
    pub fn transferred_bytes(&self) -> u16 {
        self.requested_len.saturating_sub(self.remaining_bytes())
    }

    pub fn error(&self) -> Option<Error> {
        if self.token & QTD_STATUS_HALTED != 0 {
            if self.token & QTD_STATUS_BABBLE != 0 {
                Some(Error::Babble)
            } else if self.token & QTD_STATUS_BUFERR != 0 {
                Some(Error::BufferError)
            } else if self.token & QTD_STATUS_XACTERR != 0 {
                Some(Error::NoResponse)
            } else {
                Some(Error::Stall)
            }
        } else {
            None
        }
    }

    /// Fill the token and page-pointer list for one qTD, `phys` the start of
    /// a run that is physically contiguous for up to `total_bytes` (real
    /// EHCI hardware only lets pointers 1..4 advance a fixed page from
    /// pointer 0's base, so a qTD can only describe one contiguous region,
    /// never independently-placed SG fragments). CERR is seeded to 3 (max
    /// retries before the controller halts the queue on an error).
    pub fn fill(&mut self, pid: u32, toggle: bool, total_bytes: u16, phys: u64) {
        self.token = QTD_STATUS_ACTIVE
            | QTD_CERR_MASK
            | (pid << QTD_PID_SHIFT)
            | ((total_bytes as u32) << QTD_TOTAL_BYTES_SHIFT)
            | if toggle { QTD_TOGGLE } else { 0 };
        let page_base = phys & !(crate::dma::PAGE_SIZE as u64 - 1);
        for (i, slot) in self.buffers.iter_mut().enumerate() {
            *slot = (page_base + (i as u64) * crate::dma::PAGE_SIZE as u64) as u32;
        }
        self.buffers[0] = phys as u32;
        self.next_qtd = QTD_TERMINATE;
        self.alt_next_qtd = QTD_TERMINATE;
        self.requested_len = total_bytes;
    }
}

impl PoolElement for Qtd {
    fn scheduler_object(&self) -> &SchedulerObject {
        &self.object
    }
    fn scheduler_object_mut(&mut self) -> &mut SchedulerObject {
        &mut self.object
    }
    fn reset(&mut self) {
        self.next_qtd = QTD_TERMINATE;
        self.alt_next_qtd = QTD_TERMINATE;
        self.token = 0;
        self.buffers = [0; 5];
        self.object = SchedulerObject::new();
        self.requested_len = 0;
    }
}

pub struct EhciQueues {
    pub qhs: DescriptorPool<Qh>,
    pub qtds: DescriptorPool<Qtd>,
}

impl EhciQueues {
    pub fn new(qhs: DescriptorPool<Qh>, qtds: DescriptorPool<Qtd>) -> Self {
        Self { qhs, qtds }
    }

    fn qtd_link(&self, handle: Handle) -> u32 {
        self.qtds.phys_of(handle) as u32 & !0x1F
    }

    /// Append `qtd` after the last qTD currently reachable from `root`'s
    /// depth chain, the EHCI analog of `UsbSchedulerChainElement` over
    /// `next_qtd`.
    pub fn append_qtd(&mut self, root: Handle, qtd: Handle) {
        let mut cursor = root;
        loop {
            let next = self.qtds.get(cursor).object.depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = Handle::new(self.qtds.pool_id(), next);
        }
        let link = self.qtd_link(qtd);
        self.qtds.get_mut(qtd).object.depth_next = NO_INDEX;
        self.qtds.get_mut(cursor).next_qtd = link;
        self.qtds.get_mut(cursor).object.depth_next = qtd.index();
    }

    /// Set Interrupt-On-Complete on the last qTD reachable from `root`.
    pub fn set_ioc(&mut self, root: Handle) {
        let mut cursor = root;
        loop {
            let next = self.qtds.get(cursor).object.depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = Handle::new(self.qtds.pool_id(), next);
        }
        self.qtds.get_mut(cursor).token |= QTD_IOC;
    }

    /// Build a qTD chain for a bulk/control/interrupt data stage out of
    /// `sg`, spec.md §8 scenario 2 ("EHCI bulk multi-page read"). Each SG
    /// segment is its own physically contiguous run and becomes one or more
    /// qTDs: one qTD covers up to `(PAGE_SIZE - page offset) + 4 *
    /// PAGE_SIZE` bytes (EHCI's 5-entry page-pointer list, where pointers
    /// 1..4 are computed from pointer 0's page base, so a single qTD cannot
    /// splice together two SG fragments that aren't already contiguous).
    /// Toggle is flipped once per max-packet-size packet the qTD covers.
    /// Returns the chain's head and the ending toggle.
    pub fn build_bulk_chain(
        &mut self,
        pid: u32,
        sg: &SgTable,
        max_packet_size: u16,
        mut toggle: bool,
    ) -> Result<(Handle, bool)> {
        let page_size = crate::dma::PAGE_SIZE;
        let mps = max_packet_size.max(1) as usize;
        let mut head: Option<Handle> = None;

        for seg in sg.segments() {
            let mut phys = seg.phys.0;
            let mut remaining = seg.len as usize;
            while remaining > 0 {
                let offset_in_page = (phys as usize) & (page_size - 1);
                let capacity = (page_size - offset_in_page) + 4 * page_size;
                let len = remaining.min(capacity).min(QTD_MAX_TRANSFER);

                let qtd = self.qtds.allocate()?;
                self.qtds.get_mut(qtd).fill(pid, toggle, len as u16, phys);
                match head {
                    None => head = Some(qtd),
                    Some(h) => self.append_qtd(h, qtd),
                }

                let packets = (len + mps - 1) / mps;
                if packets % 2 == 1 {
                    toggle = !toggle;
                }
                phys += len as u64;
                remaining -= len;
            }
        }

        let head = head.ok_or(Error::Invalid)?;
        self.set_ioc(head);
        Ok((head, toggle))
    }
}

impl crate::scheduler::ElementStore for EhciQueues {
    fn object(&self, elem: ElementRef) -> &SchedulerObject {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.qhs.pool_id() {
            self.qhs.get(handle).scheduler_object()
        } else {
            self.qtds.get(handle).scheduler_object()
        }
    }

    fn object_mut(&mut self, elem: ElementRef) -> &mut SchedulerObject {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.qhs.pool_id() {
            self.qhs.get_mut(handle).scheduler_object_mut()
        } else {
            self.qtds.get_mut(handle).scheduler_object_mut()
        }
    }

    fn link_value(&self, elem: ElementRef) -> u32 {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.qhs.pool_id() {
            self.qhs.phys_of(handle) as u32 & !0x1F
        } else {
            self.qtds.phys_of(handle) as u32 & !0x1F
        }
    }
}

impl QueueFamily for EhciQueues {
    fn process_element(&mut self, element: ElementRef, reason: ProcessReason, ctx: &mut ScanContext) -> Result<()> {
        let handle = Handle::new(element.pool, element.index);
        match reason {
            ProcessReason::Scan => {
                let qtd = self.qtds.get(handle);
                if qtd.is_active() {
                    return Ok(());
                }
                ctx.elements_executed += 1;
                if let Some(err) = qtd.error() {
                    ctx.result = Some(err);
                    return Ok(());
                }
                ctx.elements_processed += 1;
                ctx.last_toggle = Some(qtd.toggle());
                if qtd.remaining_bytes() != 0 {
                    ctx.short = true;
                }
                ctx.bytes_transferred += qtd.transferred_bytes() as usize;
                Ok(())
            }
            ProcessReason::Reset | ProcessReason::FixToggle => {
                let qtd = self.qtds.get_mut(handle);
                qtd.token = (qtd.token & !QTD_STATUS_HALTED) | QTD_STATUS_ACTIVE;
                Ok(())
            }
            ProcessReason::Cleanup | ProcessReason::Unlink => {
                self.qtds.free(handle);
                Ok(())
            }
            ProcessReason::Dump | ProcessReason::Link => Ok(()),
        }
    }

    fn process_event(&mut self, event: ProcessEvent) -> Result<()> {
        match event {
            ProcessEvent::ResetDone => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaRegion;

    fn make_qtd_pool(capacity: u16) -> DescriptorPool<Qtd> {
        let fake = crate::dma::tests::FakeDma::new();
        let stride = crate::util::align_up(core::mem::size_of::<Qtd>(), 32);
        let region = DmaRegion::alloc(&fake, stride * capacity as usize, 32).unwrap();
        DescriptorPool::new(0, region, capacity, 1, 32)
    }

    #[test]
    fn halted_babble_qtd_reports_babble() {
        let mut pool = make_qtd_pool(2);
        let h = pool.allocate().unwrap();
        pool.get_mut(h).token = QTD_STATUS_HALTED | QTD_STATUS_BABBLE;
        assert_eq!(pool.get(h).error(), Some(Error::Babble));
    }

    #[test]
    fn active_qtd_is_left_alone_during_scan() {
        let mut pool = make_qtd_pool(2);
        let h = pool.allocate().unwrap();
        pool.get_mut(h).token = QTD_STATUS_ACTIVE;
        let qhs_region = {
            let fake = crate::dma::tests::FakeDma::new();
            let stride = crate::util::align_up(core::mem::size_of::<Qh>(), 32);
            DmaRegion::alloc(&fake, stride, 32).unwrap()
        };
        let mut queues = EhciQueues::new(DescriptorPool::new(1, qhs_region, 1, 1, 32), pool);
        let mut ctx = ScanContext::default();
        queues
            .process_element(ElementRef { pool: 0, index: h.index() }, ProcessReason::Scan, &mut ctx)
            .unwrap();
        assert_eq!(ctx.elements_executed, 0);
    }

    /// spec.md §3 `Σ bytes_transferred` invariant: a qTD that completes short
    /// must report the bytes actually moved, not the leftover remainder.
    #[test]
    fn scan_counts_bytes_moved_not_bytes_remaining() {
        let mut pool = make_qtd_pool(2);
        let h = pool.allocate().unwrap();
        pool.get_mut(h).fill(QTD_PID_IN, false, 1024, 0x5000);
        // Hardware retires the qTD after moving only 512 of the 1024
        // requested bytes: Total-Bytes-to-Transfer now holds the remainder.
        let token = pool.get(h).token;
        pool.get_mut(h).token = (token & !(0x7FFF << QTD_TOTAL_BYTES_SHIFT)) | (512 << QTD_TOTAL_BYTES_SHIFT);
        pool.get_mut(h).token &= !QTD_STATUS_ACTIVE;

        let qhs_region = {
            let fake = crate::dma::tests::FakeDma::new();
            let stride = crate::util::align_up(core::mem::size_of::<Qh>(), 32);
            DmaRegion::alloc(&fake, stride, 32).unwrap()
        };
        let mut queues = EhciQueues::new(DescriptorPool::new(1, qhs_region, 1, 1, 32), pool);
        let mut ctx = ScanContext::default();
        queues
            .process_element(ElementRef { pool: 0, index: h.index() }, ProcessReason::Scan, &mut ctx)
            .unwrap();
        assert_eq!(ctx.bytes_transferred, 512);
        assert!(ctx.short);
    }

    fn chain_len(queues: &EhciQueues, mut cursor: Handle) -> usize {
        let mut n = 1;
        loop {
            let next = queues.qtds.get(cursor).object.depth_next;
            if next == NO_INDEX {
                break n;
            }
            cursor = Handle::new(queues.qtds.pool_id(), next);
        }
    }

    /// spec.md §8 scenario 2: 20 KiB bulk IN, address 5 endpoint 2, MPS 512,
    /// SG `[(0x10000000, 4096), (0x10010000, 8192), (0x10040000, 8192)]`.
    /// None of the three runs are mutually contiguous, and EHCI's qTD page
    /// list can only describe one contiguous run per qTD (pointers 1..4 are
    /// computed from pointer 0's page base, not independently placed), so
    /// the faithful split is one qTD per SG segment (each well under the
    /// 5-page/20480-byte-per-qTD capacity) rather than a flat byte-count
    /// division across segment boundaries.
    #[test]
    fn ehci_bulk_multi_page_read_splits_one_qtd_per_contiguous_run() {
        let mut queues = make_qtd_pool(8);
        let qhs_region = {
            let fake = crate::dma::tests::FakeDma::new();
            let stride = crate::util::align_up(core::mem::size_of::<Qh>(), 32);
            DmaRegion::alloc(&fake, stride, 32).unwrap()
        };
        let mut queues = EhciQueues::new(DescriptorPool::new(1, qhs_region, 1, 1, 32), queues);
        let sg = crate::dma::SgTable::from_segments(alloc::vec![
            crate::dma::Segment { phys: crate::dma::PhysAddr(0x1000_0000), len: 4096 },
            crate::dma::Segment { phys: crate::dma::PhysAddr(0x1001_0000), len: 8192 },
            crate::dma::Segment { phys: crate::dma::PhysAddr(0x1004_0000), len: 8192 },
        ]);

        let (head, _toggle) = queues.build_bulk_chain(QTD_PID_IN, &sg, 512, false).unwrap();

        assert_eq!(chain_len(&queues, head), 3);
        let first = queues.qtds.get(head);
        assert_eq!(first.remaining_bytes(), 4096);
        assert_eq!(first.buffers[0], 0x1000_0000);

        let second = queues.qtds.get(Handle::new(queues.qtds.pool_id(), first.object.depth_next));
        assert_eq!(second.remaining_bytes(), 8192);
        assert_eq!(second.buffers[0], 0x1001_0000);

        let third = queues.qtds.get(Handle::new(queues.qtds.pool_id(), second.object.depth_next));
        assert_eq!(third.remaining_bytes(), 8192);
        assert_eq!(third.buffers[0], 0x1004_0000);
        assert_eq!(third.token & QTD_IOC, QTD_IOC, "IOC set on last qTD");
        assert_eq!(second.token & QTD_IOC, 0);
    }
}
