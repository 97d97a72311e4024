//! UHCI queue family: Transfer Descriptors and Queue Heads, spec.md §4.4.
//!
//! Descriptor layout grounded verbatim in `examples/felipestenzel-stenzel_os/
//! stenzel-os-x86-ultra/kernel/src/drivers/usb/uhci.rs`'s `TransferDescriptor`/
//! status-bit constants; the `SchedulerObject` tail and pool wiring are new,
//! per spec.md §9 ("hardware fields beside software shadow").

extern crate alloc;

use crate::dma::SgTable;
use crate::pool::{DescriptorPool, Handle, PoolElement, SchedulerObject, NO_INDEX};
use crate::scheduler::{Direction, ElementRef};
use crate::transfer::{ProcessEvent, ProcessReason, ScanContext};
use crate::util::{Error, Result};

use super::QueueFamily;

const FLP_T: u32 = 1 << 0;
const FLP_Q: u32 = 1 << 1;

const TD_STATUS_ACTIVE: u32 = 1 << 23;
const TD_STATUS_IOC: u32 = 1 << 24;
const TD_STATUS_STALLED: u32 = 1 << 22;
const TD_STATUS_DBE: u32 = 1 << 21;
const TD_STATUS_BABBLE: u32 = 1 << 20;
const TD_STATUS_NAK: u32 = 1 << 19;
const TD_STATUS_CRC: u32 = 1 << 18;
const TD_STATUS_ERROR_MASK: u32 = 0x00FC_0000;
const TD_ACTLEN_MASK: u32 = 0x7FF;

const TD_PID_SETUP: u32 = 0x2D;
const TD_PID_IN: u32 = 0x69;
const TD_PID_OUT: u32 = 0xE1;

/// UHCI Transfer Descriptor, 32 bytes of hardware state plus the shared
/// scheduler shadow tail.
#[repr(C, align(16))]
pub struct Td {
    pub link_ptr: u32,
    pub ctrl_status: u32,
    pub token: u32,
    pub buffer_ptr: u32,
    pub object: SchedulerObject,
}

impl Td {
    pub fn setup_token(&mut self, address: u8, endpoint: u8, data_phys: u32, len: u16, low_speed: bool) {
        self.ctrl_status = TD_STATUS_ACTIVE | (3 << 27) | if low_speed { 1 << 26 } else { 0 };
        let maxlen = if len == 0 { 0x7FF } else { (len - 1) as u32 };
        self.token = (maxlen << 21) | ((endpoint as u32) << 15) | ((address as u32) << 8) | TD_PID_SETUP;
        self.buffer_ptr = data_phys;
    }

    pub fn data_token(&mut self, pid: u32, address: u8, endpoint: u8, data_phys: u32, len: u16, toggle: bool, low_speed: bool) {
        self.ctrl_status = TD_STATUS_ACTIVE | (3 << 27) | if low_speed { 1 << 26 } else { 0 };
        let maxlen = if len == 0 { 0x7FF } else { (len - 1) as u32 };
        let d = toggle as u32;
        self.token = (maxlen << 21) | (d << 19) | ((endpoint as u32) << 15) | ((address as u32) << 8) | pid;
        self.buffer_ptr = data_phys;
    }

    pub fn is_active(&self) -> bool {
        self.ctrl_status & TD_STATUS_ACTIVE != 0
    }

    pub fn actual_length(&self) -> u32 {
        let raw = self.ctrl_status & TD_ACTLEN_MASK;
        if raw == TD_ACTLEN_MASK { 0 } else { raw + 1 }
    }

    /// Decode the first error bit set, checking in the same priority order
    /// as the individual `is_stalled`/etc bit tests, collapsed into one call.
    pub fn error(&self) -> Option<Error> {
        let status = self.ctrl_status & TD_STATUS_ERROR_MASK;
        if status & TD_STATUS_STALLED != 0 {
            Some(Error::Stall)
        } else if status & TD_STATUS_BABBLE != 0 {
            Some(Error::Babble)
        } else if status & TD_STATUS_DBE != 0 {
            Some(Error::BufferError)
        } else if status & TD_STATUS_NAK != 0 {
            Some(Error::Nak)
        } else if status & TD_STATUS_CRC != 0 {
            Some(Error::NoResponse)
        } else {
            None
        }
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
        self.link_ptr = FLP_T;
        self.ctrl_status = 0;
        self.token = 0;
        self.buffer_ptr = 0;
        self.object = SchedulerObject::new();
    }
}

/// UHCI Queue Head: a breadth-chain anchor whose element link can point at a
/// TD chain (depth), used for control/bulk/interrupt endpoints.
#[repr(C, align(16))]
pub struct Qh {
    pub link_ptr: u32,
    pub element_ptr: u32,
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
        self.link_ptr = FLP_T;
        self.element_ptr = FLP_T;
        self.object = SchedulerObject::new();
    }
}

pub struct UhciQueues {
    pub tds: DescriptorPool<Td>,
    pub qhs: DescriptorPool<Qh>,
}

impl UhciQueues {
    pub fn new(tds: DescriptorPool<Td>, qhs: DescriptorPool<Qh>) -> Self {
        Self { tds, qhs }
    }

    fn td_link(&self, handle: Handle) -> u32 {
        (self.tds.phys_of(handle) as u32 & !0xF) | 0
    }

    /// Append `td` after the last TD currently reachable from `root`'s depth
    /// chain, matching the original's queue-append-not-replace convention.
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
        self.tds.get_mut(cursor).link_ptr = link;
        self.tds.get_mut(cursor).object.depth_next = td.index();
    }

    /// Set Interrupt-On-Complete on the last TD reachable from `root`'s depth
    /// chain, the one flag `UhciTransferFill` sets after filling every
    /// transaction (`PreviousTd->Flags |= UHCI_TD_IOC`).
    pub fn set_ioc(&mut self, root: Handle) {
        let mut cursor = root;
        loop {
            let next = self.tds.get(cursor).object.depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = Handle::new(self.tds.pool_id(), next);
        }
        self.tds.get_mut(cursor).ctrl_status |= TD_STATUS_IOC;
    }

    /// Allocate and fill the single SETUP TD of a control transfer. The
    /// toggle is forced to 0 regardless of the endpoint's tracked toggle,
    /// per USB 2.0 §8.6.1 and `UhciTransferFill`'s `Toggle = 0; // Initial
    /// toggle must ALWAYS be 0 for setup`.
    pub fn build_setup_td(&mut self, address: u8, endpoint: u8, low_speed: bool, setup_phys: u32, len: u16) -> Result<Handle> {
        let td = self.tds.allocate()?;
        self.tds.get_mut(td).setup_token(address, endpoint, setup_phys, len, low_speed);
        Ok(td)
    }

    /// Fill a depth chain of TDs for one data-stage transaction out of `sg`,
    /// mirroring `UhciTransferFill`'s per-transaction while loop: one TD per
    /// packet, each bounded by both the endpoint's max packet size and the
    /// current SG segment (a TD's buffer pointer is a single physical
    /// address, so a packet never spans two segments), toggling after every
    /// TD. When `bulk_out_zlp` is set and the transfer ends exactly on a max
    /// packet size boundary on a bulk OUT, an extra zero-length TD is
    /// appended, matching the original's `Transfer->Transfer.Type ==
    /// BulkTransfer` zero-length-packet insertion. Returns the chain's head
    /// and the toggle the next transaction (or STATUS stage) should start
    /// from. Callers needing IOC set call [`Self::set_ioc`] once the whole
    /// transfer's chain (not just this data stage) is assembled.
    pub fn build_data_chain(
        &mut self,
        address: u8,
        endpoint: u8,
        direction: Direction,
        low_speed: bool,
        bulk_out_zlp: bool,
        sg: &SgTable,
        max_packet_size: u16,
        mut toggle: bool,
    ) -> Result<(Handle, bool)> {
        let pid = match direction {
            Direction::In => TD_PID_IN,
            Direction::Out => TD_PID_OUT,
        };
        let mps = max_packet_size.max(1) as usize;
        let mut head: Option<Handle> = None;
        let mut last_len_was_full_mps = false;

        for seg in sg.segments() {
            let mut seg_offset = 0usize;
            while seg_offset < seg.len as usize {
                let len = (seg.len as usize - seg_offset).min(mps);
                let phys = (seg.phys.0 + seg_offset as u64) as u32;
                let td = self.tds.allocate()?;
                self.tds.get_mut(td).data_token(pid, address, endpoint, phys, len as u16, toggle, low_speed);
                match head {
                    None => head = Some(td),
                    Some(h) => self.append_td(h, td),
                }
                toggle = !toggle;
                last_len_was_full_mps = len == mps;
                seg_offset += len;
            }
        }

        if bulk_out_zlp && direction == Direction::Out && last_len_was_full_mps && head.is_some() {
            let td = self.tds.allocate()?;
            self.tds.get_mut(td).data_token(pid, address, endpoint, 0, 0, toggle, low_speed);
            self.append_td(head.unwrap(), td);
            toggle = !toggle;
        }

        let head = head.ok_or(Error::Invalid)?;
        Ok((head, toggle))
    }

    /// Build a complete bulk/interrupt transaction chain from `sg` and set
    /// IOC on its last TD, the whole of `UhciTransferFill` collapsed to the
    /// non-control case (a single transaction, no SETUP/STATUS framing).
    pub fn build_bulk_chain(
        &mut self,
        address: u8,
        endpoint: u8,
        direction: Direction,
        low_speed: bool,
        is_bulk: bool,
        sg: &SgTable,
        max_packet_size: u16,
        toggle_in: bool,
    ) -> Result<(Handle, bool)> {
        let (head, toggle_out) =
            self.build_data_chain(address, endpoint, direction, low_speed, is_bulk, sg, max_packet_size, toggle_in)?;
        self.set_ioc(head);
        Ok((head, toggle_out))
    }

    /// Build a full control transfer chain: SETUP (toggle 0) -> DATA stage
    /// from `sg` (toggle starting at 1) -> STATUS handshake (opposite
    /// direction from the data stage, toggle 1, zero length), IOC on the
    /// STATUS TD. `UhciTransferFill`'s three `Transactions[i]` loop
    /// iterations collapsed to control's fixed shape, per spec.md §8
    /// scenario 1.
    pub fn build_control_chain(
        &mut self,
        address: u8,
        endpoint: u8,
        low_speed: bool,
        setup_phys: u32,
        data_direction: Direction,
        sg: &SgTable,
        max_packet_size: u16,
    ) -> Result<Handle> {
        let setup = self.build_setup_td(address, endpoint, low_speed, setup_phys, 8)?;

        if !sg.is_empty() {
            let (data_head, _toggle) =
                self.build_data_chain(address, endpoint, data_direction, low_speed, false, sg, max_packet_size, true)?;
            self.append_td(setup, data_head);
        }

        let status_pid = match data_direction {
            Direction::In => TD_PID_OUT,
            Direction::Out => TD_PID_IN,
        };
        let status = self.tds.allocate()?;
        self.tds.get_mut(status).data_token(status_pid, address, endpoint, 0, 0, true, low_speed);
        self.append_td(setup, status);
        self.set_ioc(setup);
        Ok(setup)
    }
}

impl crate::scheduler::ElementStore for UhciQueues {
    fn object(&self, elem: ElementRef) -> &SchedulerObject {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.qhs.pool_id() {
            self.qhs.get(handle).scheduler_object()
        } else {
            self.tds.get(handle).scheduler_object()
        }
    }

    fn object_mut(&mut self, elem: ElementRef) -> &mut SchedulerObject {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.qhs.pool_id() {
            self.qhs.get_mut(handle).scheduler_object_mut()
        } else {
            self.tds.get_mut(handle).scheduler_object_mut()
        }
    }

    fn link_value(&self, elem: ElementRef) -> u32 {
        let handle = Handle::new(elem.pool, elem.index);
        if elem.pool == self.qhs.pool_id() {
            (self.qhs.phys_of(handle) as u32 & !0xF) | FLP_Q
        } else {
            self.tds.phys_of(handle) as u32 & !0xF
        }
    }
}

impl QueueFamily for UhciQueues {
    fn process_element(&mut self, element: ElementRef, reason: ProcessReason, ctx: &mut ScanContext) -> Result<()> {
        let handle = Handle::new(element.pool, element.index);
        match reason {
            ProcessReason::Scan => {
                let td = self.tds.get(handle);
                if td.is_active() {
                    return Ok(());
                }
                ctx.elements_executed += 1;
                if let Some(err) = td.error() {
                    ctx.result = Some(err);
                    return Ok(());
                }
                ctx.elements_processed += 1;
                ctx.bytes_transferred += td.actual_length() as usize;
                let requested = (((td.token >> 21) & 0x7FF) + 1).min(0x7FF);
                if (td.actual_length() as u32) < requested {
                    ctx.short = true;
                }
                let toggle = (td.token >> 19) & 1 != 0;
                ctx.last_toggle = Some(!toggle);
                Ok(())
            }
            ProcessReason::Reset | ProcessReason::FixToggle => {
                let td = self.tds.get_mut(handle);
                td.ctrl_status |= TD_STATUS_ACTIVE;
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
