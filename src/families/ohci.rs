//! OHCI queue family: Endpoint Descriptors and General Transfer Descriptors,
//! spec.md §4.4.
//!
//! Layout and condition-code table grounded in `examples/
//! felipestenzel-stenzel_os/stenzel-os-x86-ultra/kernel/src/drivers/usb/
//! ohci.rs`'s `EndpointDescriptor`/`TransferDescriptor`/`TD_CC_*` constants.

extern crate alloc;

use crate::dma::SgTable;
use crate::pool::{DescriptorPool, Handle, PoolElement, SchedulerObject, NO_INDEX};
use crate::scheduler::{Direction, ElementRef};
use crate::transfer::{ProcessEvent, ProcessReason, ScanContext};
use crate::util::{Error, Result};

use super::QueueFamily;

const ED_K: u32 = 1 << 14;

const TD_CC_NOERROR: u32 = 0;
const TD_CC_CRC: u32 = 1;
const TD_CC_BITSTUFFING: u32 = 2;
const TD_CC_DATATOGGLEMISMATCH: u32 = 3;
const TD_CC_STALL: u32 = 4;
const TD_CC_DEVICENOTRESPONDING: u32 = 5;
const TD_CC_PIDCHECKFAILURE: u32 = 6;
const TD_CC_UNEXPECTEDPID: u32 = 7;
const TD_CC_DATAOVERRUN: u32 = 8;
const TD_CC_DATAUNDERRUN: u32 = 9;
const TD_CC_BUFFEROVERRUN: u32 = 12;
const TD_CC_BUFFERUNDERRUN: u32 = 13;
const TD_CC_NOTACCESSED: u32 = 14;

const TD_DP_SETUP: u32 = 0 << 19;
const TD_DP_OUT: u32 = 1 << 19;
const TD_DP_IN: u32 = 2 << 19;
const TD_DI_MASK: u32 = 7 << 21;
/// Delay Interrupt of 0: interrupt on the next frame after completion, the
/// OHCI analog of UHCI/EHCI's IOC bit. `7` (`TD_DI_NONE`) suppresses the
/// interrupt entirely.
const TD_DI_IMMEDIATE: u32 = 0 << 21;
const TD_DI_NONE: u32 = 7 << 21;
const TD_T_DATA0: u32 = 2 << 24;
const TD_T_DATA1: u32 = 3 << 24;
const TD_T_TOGGLE_BIT: u32 = 1 << 24;

/// OHCI Endpoint Descriptor, breadth-chain anchor for a device endpoint.
#[repr(C, align(16))]
pub struct Ed {
    pub control: u32,
    pub tail_td: u32,
    pub head_td: u32,
    pub next_ed: u32,
    pub object: SchedulerObject,
}

impl Ed {
    pub fn is_halted(&self) -> bool {
        self.head_td & 1 != 0
    }

    pub fn clear_halt(&mut self) {
        self.head_td &= !1;
    }

    pub fn disable(&mut self) {
        self.control |= ED_K;
    }

    pub fn enable(&mut self) {
        self.control &= !ED_K;
    }
}

impl PoolElement for Ed {
    fn scheduler_object(&self) -> &SchedulerObject {
        &self.object
    }
    fn scheduler_object_mut(&mut self) -> &mut SchedulerObject {
        &mut self.object
    }
    fn reset(&mut self) {
        self.control = ED_K;
        self.tail_td = 0;
        self.head_td = 0;
        self.next_ed = 0;
        self.object = SchedulerObject::new();
    }
}

/// OHCI General Transfer Descriptor, 16 bytes of hardware state plus shadow
/// tail. `requested_len` is software-only: OHCI retires a completed TD by
/// zeroing `cbp`, and a short TD leaves `be - cbp + 1` holding bytes moved
/// rather than bytes requested, so the original request has to be kept
/// alongside to tell a full completion from a short one.
#[repr(C, align(16))]
pub struct Td {
    pub control: u32,
    pub cbp: u32,
    pub next_td: u32,
    pub be: u32,
    pub object: SchedulerObject,
    pub requested_len: u16,
}

impl Td {
    pub fn condition_code(&self) -> u32 {
        (self.control >> 28) & 0xF
    }

    /// Translate a condition code into the common error taxonomy, following
    /// the ordering the original checks bits in (stall/toggle before the
    /// generic over/underrun codes).
    pub fn error(&self) -> Option<Error> {
        match self.condition_code() {
            TD_CC_NOERROR => None,
            TD_CC_STALL => Some(Error::Stall),
            TD_CC_DATATOGGLEMISMATCH => Some(Error::InvalidToggles),
            TD_CC_DEVICENOTRESPONDING | TD_CC_CRC | TD_CC_BITSTUFFING => Some(Error::NoResponse),
            TD_CC_PIDCHECKFAILURE | TD_CC_UNEXPECTEDPID => Some(Error::Invalid),
            TD_CC_DATAOVERRUN | TD_CC_BUFFEROVERRUN => Some(Error::Babble),
            TD_CC_DATAUNDERRUN | TD_CC_BUFFERUNDERRUN => Some(Error::BufferError),
            TD_CC_NOTACCESSED => Some(Error::Invalid),
            _ => Some(Error::Unknown),
        }
    }

    /// Bytes actually moved: the whole `requested` length once hardware
    /// retires `cbp` to zero on full completion, or `cbp - start` if the
    /// controller stopped partway through (`start` recovered from `be` and
    /// `requested` since the TD doesn't keep its own start pointer). `cbp`
    /// counts up from the buffer start as bytes move, unlike UHCI/EHCI's
    /// countdown-to-zero remaining-length fields.
    pub fn actual_length(&self, requested: u32) -> u32 {
        if self.cbp == 0 || requested == 0 {
            requested
        } else {
            let start = self.be.wrapping_sub(requested).wrapping_add(1);
            self.cbp.wrapping_sub(start)
        }
    }

    /// The data toggle this TD carried (`T_DATA1` vs `T_DATA0`, bits 24-25
    /// of `control`), set at build time and echoed back unchanged by
    /// hardware on completion.
    pub fn toggle(&self) -> bool {
        self.control & TD_T_TOGGLE_BIT != 0
    }

    /// Fill a general TD for `dp` (SETUP/OUT/IN) covering `len` bytes at
    /// `phys`, matching the teacher's `setup_in`/`setup_out`/`setup_setup`
    /// shape but taking the toggle and buffer as parameters so one helper
    /// serves every stage.
    pub fn fill(&mut self, dp: u32, toggle: bool, phys: u64, len: u32) {
        let t = if toggle { TD_T_DATA1 } else { TD_T_DATA0 };
        self.control = dp | t | TD_DI_NONE | (TD_CC_NOTACCESSED << 28);
        if len > 0 {
            self.cbp = phys as u32;
            self.be = (phys + len as u64 - 1) as u32;
        } else {
            self.cbp = 0;
            self.be = 0;
        }
        self.next_td = 0;
        self.requested_len = len as u16;
    }
}

impl PoolElement for Td {
    fn scheduler_object(&self) -> &SchedulerObject {
        &self.object
    }
    fn scheduler_object_mut(&mut self) -> &mut SchedulerObject {
        &mut self.object
    }
    fn reset(&mut self) {
        self.control = TD_CC_NOTACCESSED << 28;
        self.cbp = 0;
        self.next_td = 0;
        self.be = 0;
        self.object = SchedulerObject::new();
        self.requested_len = 0;
    }
}

pub struct OhciQueues {
    pub eds: DescriptorPool<Ed>,
    pub tds: DescriptorPool<Td>,
}

impl OhciQueues {
    pub fn new(eds: DescriptorPool<Ed>, tds: DescriptorPool<Td>) -> Self {
        Self { eds, tds }
    }

    fn td_link(&self, handle: Handle) -> u32 {
        self.tds.phys_of(handle) as u32 & !0xF
    }

    pub fn append_td(&mut self, root: Handle, td: Handle) {
        let mut cursor = root;
        loop {
            let next = self.tds.get(cursor).object.depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = Handle::new(self.tds.pool_id(), next);
        }
        let link = self.td_link(td);
        self.tds.get_mut(td).object.depth_next = NO_INDEX;
        self.tds.get_mut(cursor).next_td = link;
        self.tds.get_mut(cursor).object.depth_next = td.index();
    }

    /// Set Delay Interrupt to "interrupt immediately" on the last TD
    /// reachable from `root`'s depth chain, the OHCI analog of UHCI/EHCI's
    /// IOC bit.
    pub fn set_ioc(&mut self, root: Handle) {
        let mut cursor = root;
        loop {
            let next = self.tds.get(cursor).object.depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = Handle::new(self.tds.pool_id(), next);
        }
        let td = self.tds.get_mut(cursor);
        td.control = (td.control & !TD_DI_MASK) | TD_DI_IMMEDIATE;
    }

    /// Fill a depth chain of TDs for one data stage out of `sg`, one TD per
    /// packet bounded by both `max_packet_size` and the current SG segment
    /// (an OHCI general TD's buffer is a single contiguous physical run),
    /// toggling after every TD. Mirrors
    /// [`crate::families::uhci::UhciQueues::build_data_chain`]; OHCI has no
    /// bulk-OUT zero-length-packet quirk to replicate, so unlike UHCI this
    /// takes no `bulk_out_zlp` flag. Returns the chain's head and the toggle
    /// the next stage should start from.
    pub fn build_data_chain(
        &mut self,
        direction: Direction,
        sg: &SgTable,
        max_packet_size: u16,
        mut toggle: bool,
    ) -> Result<(Handle, bool)> {
        let dp = match direction {
            Direction::In => TD_DP_IN,
            Direction::Out => TD_DP_OUT,
        };
        let mps = max_packet_size.max(1) as usize;
        let mut head: Option<Handle> = None;

        for seg in sg.segments() {
            let mut seg_offset = 0usize;
            while seg_offset < seg.len as usize {
                let len = (seg.len as usize - seg_offset).min(mps);
                let phys = seg.phys.0 + seg_offset as u64;
                let td = self.tds.allocate()?;
                self.tds.get_mut(td).fill(dp, toggle, phys, len as u32);
                match head {
                    None => head = Some(td),
                    Some(h) => self.append_td(h, td),
                }
                toggle = !toggle;
                seg_offset += len;
            }
        }

        let head = head.ok_or(Error::Invalid)?;
        Ok((head, toggle))
    }

    /// Build a complete bulk/interrupt transaction chain and set the
    /// interrupt-on-complete bit on its last TD.
    pub fn build_bulk_chain(
        &mut self,
        direction: Direction,
        sg: &SgTable,
        max_packet_size: u16,
        toggle_in: bool,
    ) -> Result<(Handle, bool)> {
        let (head, toggle_out) = self.build_data_chain(direction, sg, max_packet_size, toggle_in)?;
        self.set_ioc(head);
        Ok((head, toggle_out))
    }

    /// Build a full control transfer chain: SETUP (DATA0) -> DATA stage from
    /// `sg` (DATA1) -> STATUS handshake (opposite direction from the data
    /// stage, DATA1, zero length), interrupt-on-complete on the STATUS TD,
    /// spec.md §8 scenario 1 generalized to OHCI.
    pub fn build_control_chain(
        &mut self,
        setup_phys: u64,
        data_direction: Direction,
        sg: &SgTable,
        max_packet_size: u16,
    ) -> Result<Handle> {
        let setup = self.tds.allocate()?;
        self.tds.get_mut(setup).fill(TD_DP_SETUP, false, setup_phys, 8);

        if !sg.is_empty() {
            let (data_head, _toggle) = self.build_data_chain(data_direction, sg, max_packet_size, true)?;
            self.append_td(setup, data_head);
        }

        let status_dp = match data_direction {
            Direction::In => TD_DP_OUT,
            Direction::Out => TD_DP_IN,
        };
        let status = self.tds.allocate()?;
        self.tds.get_mut(status).fill(status_dp, true, 0, 0);
        self.append_td(setup, status);
        self.set_ioc(setup);
        Ok(setup)
    }
}

impl crate::scheduler::ElementStore for OhciQueues {
    fn object(&self, elem: ElementRef) -> &SchedulerObject {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.eds.pool_id() {
            self.eds.get(handle).scheduler_object()
        } else {
            self.tds.get(handle).scheduler_object()
        }
    }

    fn object_mut(&mut self, elem: ElementRef) -> &mut SchedulerObject {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.eds.pool_id() {
            self.eds.get_mut(handle).scheduler_object_mut()
        } else {
            self.tds.get_mut(handle).scheduler_object_mut()
        }
    }

    fn link_value(&self, elem: ElementRef) -> u32 {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.eds.pool_id() {
            self.eds.phys_of(handle) as u32 & !0xF
        } else {
            self.tds.phys_of(handle) as u32 & !0xF
        }
    }
}

impl QueueFamily for OhciQueues {
    fn process_element(&mut self, element: ElementRef, reason: ProcessReason, ctx: &mut ScanContext) -> Result<()> {
        let handle = Handle::new(element.pool, element.index);
        match reason {
            ProcessReason::Scan => {
                let td = self.tds.get(handle);
                if td.condition_code() == TD_CC_NOTACCESSED {
                    return Ok(());
                }
                ctx.elements_executed += 1;
                if let Some(err) = td.error() {
                    ctx.result = Some(err);
                    return Ok(());
                }
                ctx.elements_processed += 1;
                let actual = td.actual_length(td.requested_len as u32);
                ctx.bytes_transferred += actual as usize;
                if actual < td.requested_len as u32 {
                    ctx.short = true;
                }
                ctx.last_toggle = Some(!td.toggle());
                Ok(())
            }
            ProcessReason::FixToggle => {
                let index = handle.index();
                let ed_handle = Handle::new(self.eds.pool_id(), index);
                self.eds.get_mut(ed_handle).clear_halt();
                Ok(())
            }
            ProcessReason::Reset => {
                let td = self.tds.get_mut(handle);
                td.control = (td.control & !(0xFu32 << 28)) | (TD_CC_NOTACCESSED << 28);
                Ok(())
            }
            ProcessReason::Cleanup | ProcessReason::Unlink => {
                self.tds.free(handle);
                Ok(())
            }
            ProcessReason::Dump | ProcessReason::Link => Ok(()),
        }
    }

    fn process_event(&mut self, _event: ProcessEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaRegion;

    fn make_td_pool(capacity: u16) -> DescriptorPool<Td> {
        let fake = crate::dma::tests::FakeDma::new();
        let stride = crate::util::align_up(core::mem::size_of::<Td>(), 16);
        let region = DmaRegion::alloc(&fake, stride * capacity as usize, 16).unwrap();
        DescriptorPool::new(0, region, capacity, 1, 16)
    }

    /// Two pools with distinct ids (EDs = 1, TDs = 0) so a test that mixes
    /// up which pool a handle belongs to would actually fail.
    fn make_queues(td_capacity: u16, ed_capacity: u16) -> OhciQueues {
        let td_fake = crate::dma::tests::FakeDma::new();
        let td_stride = crate::util::align_up(core::mem::size_of::<Td>(), 16);
        let td_region = DmaRegion::alloc(&td_fake, td_stride * td_capacity as usize, 16).unwrap();
        let ed_fake = crate::dma::tests::FakeDma::new();
        let ed_stride = crate::util::align_up(core::mem::size_of::<Ed>(), 16);
        let ed_region = DmaRegion::alloc(&ed_fake, ed_stride * ed_capacity as usize, 16).unwrap();
        OhciQueues::new(
            DescriptorPool::new(1, ed_region, ed_capacity, 1, 16),
            DescriptorPool::new(0, td_region, td_capacity, 1, 16),
        )
    }

    #[test]
    fn condition_code_stall_maps_to_stall_error() {
        let mut pool = make_td_pool(2);
        let h = pool.allocate().unwrap();
        pool.get_mut(h).control = TD_CC_STALL << 28;
        assert_eq!(pool.get(h).error(), Some(Error::Stall));
    }

    #[test]
    fn not_accessed_tds_are_skipped_during_scan() {
        let mut pool = make_td_pool(2);
        let h = pool.allocate().unwrap();
        let eds_region = {
            let fake = crate::dma::tests::FakeDma::new();
            let stride = crate::util::align_up(core::mem::size_of::<Ed>(), 16);
            DmaRegion::alloc(&fake, stride, 16).unwrap()
        };
        let mut queues = OhciQueues::new(DescriptorPool::new(1, eds_region, 1, 1, 16), pool);
        let mut ctx = ScanContext::default();
        queues
            .process_element(ElementRef { pool: 0, index: h.index() }, ProcessReason::Scan, &mut ctx)
            .unwrap();
        assert_eq!(ctx.elements_executed, 0);
    }

    /// spec.md §3 `Σ bytes_transferred` invariant: a TD that completes short
    /// must report the bytes actually moved, and flag the chain short, not
    /// silently report nothing the way the family used to.
    #[test]
    fn scan_counts_bytes_moved_and_flags_short_packet() {
        let mut queues = make_queues(2, 2);
        let td = queues.tds.allocate().unwrap();
        queues.tds.get_mut(td).fill(TD_DP_IN, false, 0x5000, 64);
        // Hardware stops after moving only 32 of the 64 requested bytes:
        // CBP advances from the buffer start instead of retiring to 0.
        let entry = queues.tds.get_mut(td);
        entry.cbp = 0x5000 + 32;
        entry.control = (entry.control & !(0xFu32 << 28)) | (TD_CC_NOERROR << 28);

        let mut ctx = ScanContext::default();
        queues
            .process_element(ElementRef { pool: queues.tds.pool_id(), index: td.index() }, ProcessReason::Scan, &mut ctx)
            .unwrap();
        assert_eq!(ctx.bytes_transferred, 32);
        assert!(ctx.short);
    }

    /// A fully-completed TD (hardware retires `cbp` to 0) must count every
    /// requested byte and not flag short.
    #[test]
    fn scan_counts_full_completion_as_not_short() {
        let mut queues = make_queues(2, 2);
        let td = queues.tds.allocate().unwrap();
        queues.tds.get_mut(td).fill(TD_DP_OUT, true, 0x6000, 16);
        let entry = queues.tds.get_mut(td);
        entry.cbp = 0;
        entry.control = (entry.control & !(0xFu32 << 28)) | (TD_CC_NOERROR << 28);

        let mut ctx = ScanContext::default();
        queues
            .process_element(ElementRef { pool: queues.tds.pool_id(), index: td.index() }, ProcessReason::Scan, &mut ctx)
            .unwrap();
        assert_eq!(ctx.bytes_transferred, 16);
        assert!(!ctx.short);
        // The TD was built with toggle DATA1 (`true`); the next transaction
        // should start at the complement, DATA0.
        assert_eq!(ctx.last_toggle, Some(false));
    }

    /// Review regression: `FixToggle` must resolve the ED through the ED
    /// pool's own id, not whatever pool the caller's `ElementRef` happened
    /// to carry (which names the TD, not the ED).
    #[test]
    fn fix_toggle_clears_halt_through_ed_pool_not_callers_element_pool() {
        let mut queues = make_queues(2, 2);
        let ed = queues.eds.allocate().unwrap();
        queues.eds.get_mut(ed).head_td |= 1;
        let td = queues.tds.allocate().unwrap();
        assert_eq!(ed.index(), td.index(), "test relies on matching indices across pools");

        let mut ctx = ScanContext::default();
        queues
            .process_element(ElementRef { pool: queues.tds.pool_id(), index: td.index() }, ProcessReason::FixToggle, &mut ctx)
            .unwrap();
        assert!(!queues.eds.get(ed).is_halted());
    }

    /// spec.md §4.3: a multi-packet bulk chain must alternate DATA0/DATA1
    /// across TDs and report the post-chain toggle for the next transfer.
    #[test]
    fn build_bulk_chain_alternates_toggle_across_packets() {
        let mut queues = make_queues(8, 1);
        let sg = SgTable::from_segments(alloc::vec![crate::dma::Segment {
            phys: crate::dma::PhysAddr(0x7000),
            len: 16,
        }]);
        let (head, toggle_out) = queues.build_bulk_chain(Direction::Out, &sg, 8, false).unwrap();

        let first = queues.tds.get(head);
        assert!(!first.toggle());
        let next_index = first.object.depth_next;
        assert_ne!(next_index, NO_INDEX);
        let second = queues.tds.get(Handle::new(queues.tds.pool_id(), next_index));
        assert!(second.toggle());
        assert_eq!(second.object.depth_next, NO_INDEX);
        assert!(!toggle_out);
        // IOC (Delay Interrupt = immediate) set on the last TD only.
        assert_eq!(second.control & TD_DI_MASK, TD_DI_IMMEDIATE);
        assert_eq!(first.control & TD_DI_MASK, TD_DI_NONE);
    }
}
