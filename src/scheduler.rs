//! The bandwidth-aware periodic scheduler, spec.md §4.2, family-independent.
//!
//! Grounded in `examples/original_source/modules/serial/usb/common/
//! scheduler.c`/`scheduler_periodic.c`/`scheduler_settings.c`: bandwidth
//! cost formulas from USB 2.0 §5.11.3, validate-then-commit two-pass
//! reservation, and sorted-by-descending-interval periodic linking.

extern crate alloc;

use alloc::vec::Vec;

use crate::pool::{ElementFlags, SchedulerObject, NO_INDEX};
use crate::util::{bit_time, ns_to_us, Error, Result};

/// USB 2.0 transaction kind, used only to select the bandwidth formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

const BW_HOST_DELAY: u64 = 1000;
const BW_HUB_LS_SETUP: u64 = 333;
const USB2_HOST_DELAY: u64 = 5;

/// `HS_NSECS`/`HS_NSECS_ISO` from the original: high-speed (non-)isochronous
/// transaction cost in nanoseconds, `token` selects the `38` (isoc) vs `55`
/// (non-isoc) multiplier.
fn hs_nsecs(bytes: u32, isoc: bool) -> u64 {
    let base = if isoc { 38 } else { 55 };
    (base * 8 * 2083 + 2083 * (3 + bit_time(bytes))) / 1000 + USB2_HOST_DELAY
}

/// Packet cost in microseconds per USB 2.0 §5.11.3, spec.md §4.2.
pub fn bandwidth_cost_us(speed: Speed, direction: Direction, kind: TransactionType, bytes: u32) -> u16 {
    let ns = match speed {
        Speed::Low => {
            let term = bit_time(bytes) * 10 + 31;
            match direction {
                Direction::In => 64060 + 2 * BW_HUB_LS_SETUP + BW_HOST_DELAY + (67667 * term) / 1000,
                Direction::Out => 64107 + 2 * BW_HUB_LS_SETUP + BW_HOST_DELAY + (66700 * term) / 1000,
            }
        }
        Speed::Full => {
            let term = (8354 * (10 * bit_time(bytes) + 31)) / 1000;
            match kind {
                TransactionType::Isochronous => {
                    let base = if direction == Direction::In { 7268 } else { 6265 };
                    base + BW_HOST_DELAY + term
                }
                _ => 9107 + BW_HOST_DELAY + term,
            }
        }
        Speed::High => hs_nsecs(bytes, kind == TransactionType::Isochronous),
    };
    ns_to_us(ns).min(u16::MAX as u64) as u16
}

/// Round `requested` up to the nearest power of two exponent the schedule
/// can represent, per spec.md §4.2 interval fitting. On high-speed the
/// exponent is `2^(interval-1)` (micro-frame granularity); on lower speeds
/// it is `interval` directly (frame granularity).
fn interval_to_period(requested_log2: u8, high_speed: bool, frame_count: u16) -> u16 {
    let exponent = if high_speed {
        requested_log2.saturating_sub(1)
    } else {
        requested_log2
    };
    let period = 1u32 << exponent;
    core::cmp::min(period, frame_count as u32) as u16
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub frame_count: u16,
    pub subframe_count: u8,
    pub max_bandwidth_per_frame: u16,
    /// When true, framelist slots with no successor are rewritten with the
    /// family's EOL bit instead of `0` (`USB_SCHEDULER_LINK_BIT_EOL`).
    pub link_bit_eol: bool,
}

impl SchedulerConfig {
    /// 90% of the 12000-bit / 1000us frame budget, the original's
    /// `FRAME_TIME_MAX_BITS_ALLOC`/`FRAME_TIME_MAX_USECS_ALLOC`.
    pub const FRAME_TIME_MAX_USECS_ALLOC: u16 = 900;

    pub fn usb1(frame_count: u16) -> Self {
        Self {
            frame_count,
            subframe_count: 1,
            max_bandwidth_per_frame: Self::FRAME_TIME_MAX_USECS_ALLOC,
            link_bit_eol: false,
        }
    }

    pub fn usb2(frame_count: u16) -> Self {
        Self {
            frame_count,
            subframe_count: 8,
            max_bandwidth_per_frame: Self::FRAME_TIME_MAX_USECS_ALLOC,
            link_bit_eol: true,
        }
    }
}

/// Opaque reference to one scheduled element: which pool it lives in plus its
/// index within that pool. Kept separate from [`crate::pool::Handle`] so the
/// scheduler never needs the pool's element type parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRef {
    pub pool: u8,
    pub index: u16,
}

impl ElementRef {
    pub const NONE: ElementRef = ElementRef { pool: 0, index: NO_INDEX };

    pub fn is_none(self) -> bool {
        self.index == NO_INDEX
    }
}

/// Abstraction the scheduler needs over "the collection of elements with
/// `SchedulerObject`s", so it can walk chains without knowing the concrete
/// descriptor type of any given pool. Family modules implement this once per
/// pool type; the scheduler is entirely generic over it.
pub trait ElementStore {
    fn object(&self, elem: ElementRef) -> &SchedulerObject;
    fn object_mut(&mut self, elem: ElementRef) -> &mut SchedulerObject;
    /// Physical address of the element, link-flags already folded in ,
    /// what gets written into a framelist slot or a neighbour's link word.
    fn link_value(&self, elem: ElementRef) -> u32;
}

/// Owns the framelist plus the bandwidth-per-(micro)frame array. Does not own
/// descriptor pools itself (those live in family controllers, which implement
/// [`ElementStore`] over them), this mirrors `UsbScheduler_t` holding only
/// `VirtualFrameList`/`Bandwidth`, with `Settings.Pools` addressed indirectly.
pub struct Scheduler {
    config: SchedulerConfig,
    /// Virtual shadow of the framelist: `ElementRef` of the chain head per frame.
    virtual_frame_list: Vec<ElementRef>,
    /// Hardware-visible framelist, mirrors `virtual_frame_list` but holds the
    /// encoded link word the controller actually walks.
    hw_frame_list: Vec<u32>,
    bandwidth: Vec<u16>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let frame_count = config.frame_count as usize;
        let total_slots = frame_count * config.subframe_count as usize;
        Self {
            config,
            virtual_frame_list: alloc::vec![ElementRef::NONE; frame_count],
            hw_frame_list: alloc::vec![0u32; frame_count],
            bandwidth: alloc::vec![0u16; total_slots],
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn hw_frame_list(&self) -> &[u32] {
        &self.hw_frame_list
    }

    fn no_link_encoding(&self) -> u32 {
        if self.config.link_bit_eol {
            1
        } else {
            0
        }
    }

    /// `UsbSchedulerResetInternalData`: rewind bandwidth/framelist to empty
    /// without touching any pool. Used by a controller recovering from a
    /// fatal host error (spec.md §7) before re-running bring-up.
    pub fn reset_internal_data(&mut self) {
        for slot in self.bandwidth.iter_mut() {
            *slot = 0;
        }
        let no_link = self.no_link_encoding();
        for (v, hw) in self.virtual_frame_list.iter_mut().zip(self.hw_frame_list.iter_mut()) {
            *v = ElementRef::NONE;
            *hw = no_link;
        }
    }

    /// Try, then (if `commit`) actually reserve, bandwidth for an element
    /// requiring `transactions` per period. Two-pass so a rejected request
    /// never mutates `self.bandwidth` (spec.md §4.2 "validate-then-commit").
    fn walk_and_reserve(
        &mut self,
        period: u16,
        cost: u16,
        transactions: u8,
        commit: bool,
    ) -> Result<(u16, u16)> {
        let max = self.config.max_bandwidth_per_frame;
        let subframes = self.config.subframe_count as u16;
        let stride = period as usize;
        let mut start_frame: Option<u16> = None;
        let mut frame_mask: u16 = 0;

        let mut i: usize = 0;
        while i < self.config.frame_count as usize {
            let base = i * subframes as usize;
            if self.bandwidth[base] as u32 + cost as u32 > max as u32 {
                // Retry on odd frames only when the period allows more than one phase.
                if period == 1 || start_frame.is_some() {
                    return Err(Error::NoBandwidth);
                }
            } else {
                if subframes > 1 && transactions > 1 {
                    let (mask, ok) = self.reserve_subframes(base, cost, transactions, frame_mask, commit);
                    if !ok {
                        return Err(Error::NoBandwidth);
                    }
                    frame_mask = mask;
                }
                if commit {
                    self.bandwidth[base] += cost;
                }
                if start_frame.is_none() {
                    start_frame = Some(i as u16);
                }
            }
            i += stride.max(1);
        }

        start_frame.map(|f| (f, frame_mask)).ok_or(Error::NoBandwidth)
    }

    /// `UsbSchedulerAllocateBandwidthSubframe`: search micro-frames `1..8` of
    /// frame `base` for `transactions` free slots (EHCI split transactions).
    fn reserve_subframes(&mut self, base: usize, cost: u16, transactions: u8, mut mask: u16, commit: bool) -> (u16, bool) {
        let subframes = self.config.subframe_count as usize;
        let max = self.config.max_bandwidth_per_frame;
        if mask == 0 {
            let mut need = transactions;
            for j in 1..subframes {
                if need == 0 {
                    break;
                }
                if self.bandwidth[base + j] as u32 + cost as u32 <= max as u32 {
                    if commit {
                        self.bandwidth[base + j] += cost;
                    }
                    mask |= 1 << j;
                    need -= 1;
                }
            }
            (mask, need == 0)
        } else if commit {
            for j in 1..subframes {
                if mask & (1 << j) != 0 {
                    self.bandwidth[base + j] += cost;
                }
            }
            (mask, true)
        } else {
            (mask, true)
        }
    }

    /// Reserve bandwidth for a periodic element. Fills in
    /// `object.{bandwidth, frame_interval, start_frame, frame_mask}` and sets
    /// `ElementFlags::BANDWIDTH` on success. Never mutates scheduler state on
    /// failure (spec.md §8 scenario 3).
    pub fn allocate_bandwidth(
        &mut self,
        object: &mut SchedulerObject,
        interval_log2: u8,
        speed: Speed,
        direction: Direction,
        kind: TransactionType,
        bytes: u32,
        transactions: u8,
    ) -> Result<()> {
        let high_speed = speed == Speed::High;
        let cost = bandwidth_cost_us(speed, direction, kind, bytes);

        let mut exponent = interval_log2;
        loop {
            let period = interval_to_period(exponent, high_speed, self.config.frame_count);
            // Validate.
            if self.walk_and_reserve(period, cost, transactions, false).is_ok() {
                // Commit: the second walk is guaranteed to succeed given the same inputs.
                let (start_frame, frame_mask) = self.walk_and_reserve(period, cost, transactions, true)?;
                object.bandwidth = cost;
                object.frame_interval = period;
                object.start_frame = start_frame;
                object.frame_mask = frame_mask;
                object.set_element_flags(object.element_flags() | ElementFlags::BANDWIDTH);
                return Ok(());
            }
            if exponent == 0 {
                return Err(Error::NoBandwidth);
            }
            exponent -= 1;
        }
    }

    /// Release the bandwidth reserved by a prior `allocate_bandwidth` call.
    pub fn free_bandwidth(&mut self, object: &mut SchedulerObject) {
        if !object.element_flags().contains(ElementFlags::BANDWIDTH) {
            return;
        }
        let subframes = self.config.subframe_count as usize;
        let period = object.frame_interval.max(1) as usize;
        let mut i = object.start_frame as usize;
        while i < self.config.frame_count as usize {
            let base = i * subframes;
            if subframes > 1 && object.frame_mask != 0 {
                for j in 1..subframes {
                    if object.frame_mask & (1 << j) != 0 {
                        self.bandwidth[base + j] = self.bandwidth[base + j].saturating_sub(object.bandwidth);
                    }
                }
            } else {
                self.bandwidth[base] = self.bandwidth[base].saturating_sub(object.bandwidth);
            }
            i += period;
        }
        object.bandwidth = 0;
        object.frame_mask = 0;
        object.set_element_flags(object.element_flags() - ElementFlags::BANDWIDTH);
    }

    /// `UsbSchedulerChainElement`, splice `elem` into the depth or breadth
    /// chain rooted at `root`, stopping at `marker` (or back at `root`) if
    /// given. A store-release fence separates writing `elem`'s link from
    /// writing `root`'s link so hardware never follows a half-formed chain
    /// (spec.md §4.2/§5).
    pub fn chain<S: ElementStore>(&self, store: &mut S, root: ElementRef, elem: ElementRef, marker: Option<ElementRef>, depth: bool) {
        let mut cursor = root;
        loop {
            let next = if depth {
                store.object(cursor).depth_next
            } else {
                store.object(cursor).breath_next
            };
            let next_ref = ElementRef { pool: cursor.pool, index: next };
            if next == NO_INDEX || Some(next_ref) == marker || next_ref == root {
                break;
            }
            cursor = next_ref;
        }
        let link = store.link_value(elem);
        if depth {
            store.object_mut(elem).depth_next = store.object(cursor).depth_next;
        } else {
            store.object_mut(elem).breath_next = store.object(cursor).breath_next;
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        if depth {
            store.object_mut(cursor).depth_next = elem.index;
        } else {
            store.object_mut(cursor).breath_next = elem.index;
        }
        let _ = link;
    }

    /// `UsbSchedulerUnchainElement`, symmetric removal.
    pub fn unchain<S: ElementStore>(&self, store: &mut S, root: ElementRef, elem: ElementRef, depth: bool) {
        let mut cursor = root;
        loop {
            let next = if depth {
                store.object(cursor).depth_next
            } else {
                store.object(cursor).breath_next
            };
            if next == NO_INDEX {
                return;
            }
            let next_ref = ElementRef { pool: cursor.pool, index: next };
            if next_ref == elem {
                let elem_next = if depth {
                    store.object(elem).depth_next
                } else {
                    store.object(elem).breath_next
                };
                if depth {
                    store.object_mut(cursor).depth_next = elem_next;
                } else {
                    store.object_mut(cursor).breath_next = elem_next;
                }
                return;
            }
            cursor = next_ref;
        }
    }

    /// `UsbSchedulerLinkPeriodicElement`, insert `elem` into every frame of
    /// its reserved period, sorted by descending `frame_interval` (longer
    /// intervals come first, spec.md §4.2 linking).
    pub fn link_periodic<S: ElementStore>(&mut self, store: &mut S, elem: ElementRef) {
        let object = *store.object(elem);
        let period = object.frame_interval.max(1) as usize;
        let mut i = object.start_frame as usize;
        while i < self.config.frame_count as usize {
            if self.virtual_frame_list[i].is_none() {
                self.virtual_frame_list[i] = elem;
                self.hw_frame_list[i] = store.link_value(elem);
            } else {
                self.link_periodic_into_frame(store, i, elem, &object);
            }
            i += period;
        }
    }

    fn link_periodic_into_frame<S: ElementStore>(&mut self, store: &mut S, frame: usize, elem: ElementRef, object: &SchedulerObject) {
        let mut existing = self.virtual_frame_list[frame];
        loop {
            let existing_obj = *store.object(existing);
            if existing_obj.breath_next == NO_INDEX || existing == elem {
                break;
            }
            if object.frame_interval > existing_obj.frame_interval {
                break;
            }
            existing = ElementRef { pool: existing.pool, index: existing_obj.breath_next };
        }
        if existing == elem {
            return;
        }
        let existing_obj = *store.object(existing);
        let existing_is_head = existing == self.virtual_frame_list[frame];
        if existing_is_head && object.frame_interval > existing_obj.frame_interval {
            store.object_mut(elem).breath_next = existing.index;
            self.virtual_frame_list[frame] = elem;
            self.hw_frame_list[frame] = store.link_value(elem);
        } else {
            store.object_mut(elem).breath_next = existing_obj.breath_next;
            store.object_mut(existing).breath_next = elem.index;
        }
    }

    /// `UsbSchedulerUnlinkPeriodicElement`, symmetric removal. If `elem` was
    /// the framelist head with no successor, the slot is rewritten with the
    /// family's "no link" encoding.
    pub fn unlink_periodic<S: ElementStore>(&mut self, store: &mut S, elem: ElementRef) {
        let object = *store.object(elem);
        let period = object.frame_interval.max(1) as usize;
        let mut i = object.start_frame as usize;
        let no_link = self.no_link_encoding();
        while i < self.config.frame_count as usize {
            let head = self.virtual_frame_list[i];
            if head == elem {
                if object.breath_next != NO_INDEX {
                    let next = ElementRef { pool: elem.pool, index: object.breath_next };
                    self.virtual_frame_list[i] = next;
                    self.hw_frame_list[i] = store.link_value(next);
                } else {
                    self.virtual_frame_list[i] = ElementRef::NONE;
                    self.hw_frame_list[i] = no_link;
                }
            } else {
                let mut cursor = head;
                loop {
                    let cursor_obj = *store.object(cursor);
                    if cursor_obj.breath_next == NO_INDEX {
                        break;
                    }
                    let next = ElementRef { pool: cursor.pool, index: cursor_obj.breath_next };
                    if next == elem {
                        store.object_mut(cursor).breath_next = object.breath_next;
                        break;
                    }
                    cursor = next;
                }
            }
            i += period;
        }
    }
}
