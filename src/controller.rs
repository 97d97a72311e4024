//! `Controller`, ties scheduler, transfer manager and a queue family
//! together into the entry points an embedder's IRQ handler and client API
//! call, spec.md §6.
//!
//! Grounded in the orchestration shape of `examples/original_source/modules/
//! serial/usb/common/manager.c` (`UsbManagerInitialize`, per-controller
//! endpoint toggle table) combined with the probe-then-register flow of
//! `examples/felipestenzel-stenzel_os/stenzel-os-x86-ultra/kernel/src/drivers/
//! usb/mod.rs::init()`, generalized behind [`crate::families::QueueFamily`]
//! so the same orchestration serves UHCI, OHCI and EHCI.

use crate::families::QueueFamily;
use crate::pool::{Handle, NO_INDEX};
use crate::scheduler::{ElementRef, ElementStore, Scheduler};
use crate::transfer::{ProcessEvent, ProcessReason, ScanContext, Transfer, TransferManager};
use crate::util::{Error, Result};

/// One physical USB port's reported state, spec.md §6 `port_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub low_speed: bool,
    pub high_speed: bool,
}

/// A USB host controller: one [`Scheduler`] plus one family's queue engine,
/// generic over the family so the same type serves UHCI/OHCI/EHCI (the
/// family owns its descriptor pools; the controller owns scheduling and
/// transfer bookkeeping common to all of them).
pub struct Controller<F: QueueFamily + ElementStore> {
    scheduler: Scheduler,
    transfers: TransferManager,
    family: F,
    /// Per-transfer id -> root element, so completion scanning and
    /// unlink/cleanup can find a transfer's chain without the family
    /// exposing its pool layout to this module.
    roots: alloc::collections::BTreeMap<u32, ElementRef>,
}

extern crate alloc;

impl<F: QueueFamily + ElementStore> Controller<F> {
    pub fn new(scheduler: Scheduler, family: F) -> Self {
        Self { scheduler, transfers: TransferManager::new(), family, roots: alloc::collections::BTreeMap::new() }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    pub fn family_mut(&mut self) -> &mut F {
        &mut self.family
    }

    /// Count the elements reachable from `root` by following `depth_next`,
    /// the length of the chain a submitted transfer is about to scan.
    fn chain_length(&self, root: ElementRef) -> u32 {
        let mut count = 1u32;
        let mut cursor = root;
        loop {
            let next = self.family.object(cursor).depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = ElementRef { pool: cursor.pool, index: next };
            count += 1;
        }
        count
    }

    /// `submit_transfer`: register the transfer and remember which family
    /// element is its chain root, once the caller (who alone knows the
    /// family's concrete pool type) has built and linked the chain. The
    /// chain's length (via `depth_next`) is stamped into the transfer so
    /// `TransferManager::apply_scan`'s `elements_completed >= elements_total`
    /// terminal check has something to compare against.
    pub fn submit_transfer(&mut self, mut transfer: Transfer, root: ElementRef) -> u32 {
        let length = self.chain_length(root);
        transfer.chain_length = length;
        transfer.elements_total = length;
        transfer.root_element = Some(Handle::new(root.pool, root.index));
        let id = self.transfers.submit(transfer);
        self.roots.insert(id, root);
        id
    }

    /// `dequeue_transfer`: ask the family to unlink and free the chain, then
    /// drop the transfer record. Per spec.md §6, a transfer that has already
    /// finished is simply dropped without an unlink pass.
    pub fn dequeue_transfer(&mut self, id: u32) -> Result<()> {
        if let Some(root) = self.roots.remove(&id) {
            let mut ctx = ScanContext::default();
            self.family.process_element(root, ProcessReason::Unlink, &mut ctx)?;
        }
        self.transfers.dequeue(id);
        Ok(())
    }

    /// Walk a transfer's chain from `root` following `depth_next`, feeding
    /// each element into the family's scan in turn and folding the results
    /// into one [`ScanContext`] (spec.md §4.3 step 3, §4.4). Stops as soon as
    /// an element reports no progress (still active, hardware hasn't reached
    /// it yet) or ends the transfer early (error or short packet, per §4.3
    /// "any subsequent TDs are cancelled by not restarting them").
    fn scan_chain(&mut self, root: ElementRef) -> Result<ScanContext> {
        let mut ctx = ScanContext::default();
        let mut cursor = root;
        loop {
            let executed_before = ctx.elements_executed;
            self.family.process_element(cursor, ProcessReason::Scan, &mut ctx)?;
            if ctx.elements_executed == executed_before {
                break;
            }
            if ctx.result.is_some() || ctx.short {
                break;
            }
            let next = self.family.object(cursor).depth_next;
            if next == NO_INDEX {
                break;
            }
            cursor = ElementRef { pool: cursor.pool, index: next };
        }
        Ok(ctx)
    }

    /// `on_irq`: scan every in-flight transfer's chain for progress and fold
    /// the result into the transfer manager. Returns the ids that just
    /// became done, so the embedder can wake whatever is waiting on them.
    pub fn on_irq(&mut self) -> Result<alloc::vec::Vec<u32>> {
        let mut finished = alloc::vec::Vec::new();
        let ids: alloc::vec::Vec<u32> = self.roots.keys().copied().collect();
        for id in ids {
            let Some(root) = self.roots.get(&id).copied() else { continue };
            let was_done = self.transfers.get(id).map(|t| t.is_done()).unwrap_or(true);
            if was_done {
                continue;
            }
            let ctx = self.scan_chain(root)?;
            self.transfers.apply_scan(id, ctx)?;
            if self.transfers.get(id).map(|t| t.is_done()).unwrap_or(false) {
                finished.push(id);
            }
        }
        Ok(finished)
    }

    /// `on_fast_irq`: a lightweight pre-check the embedder can call from a
    /// true interrupt context before scheduling the full `on_irq` scan, here
    /// just forwarded, since this core has no notion of interrupt-context
    /// restrictions (that belongs to the embedder).
    pub fn on_fast_irq(&mut self) -> Result<bool> {
        Ok(!self.roots.is_empty())
    }

    /// `reset_endpoint`: `HCIPROCESS_REASON_FIXTOGGLE`, force the endpoint's
    /// toggle back to DATA0 and ask the family to clear any halt condition on
    /// the element representing that endpoint.
    pub fn reset_endpoint(&mut self, endpoint: crate::transfer::EndpointIdentifier, element: ElementRef) -> Result<()> {
        self.transfers.reset_toggle(endpoint);
        let mut ctx = ScanContext::default();
        self.family.process_element(element, ProcessReason::FixToggle, &mut ctx)
    }

    /// `on_register`/post-reset re-priming, spec.md §6. The family gets a
    /// chance to rebuild its async/periodic anchors before normal operation resumes.
    pub fn on_register(&mut self) -> Result<()> {
        self.family.process_event(ProcessEvent::ResetDone)
    }

    /// Driven by an embedder that detected the controller went into a fatal
    /// halted state (spec.md §7 "scheduler lock + fatal host error
    /// recovery"): rewind scheduler bookkeeping, the family rebuilds its
    /// pools from scratch afterward.
    pub fn recover_from_fatal_error(&mut self) {
        self.scheduler.reset_internal_data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaRegion, SgTable};
    use crate::families::uhci::{Qh, Td, UhciQueues};
    use crate::pool::{DescriptorPool, Handle};
    use crate::scheduler::{Direction, Speed, SchedulerConfig};
    use crate::transfer::{EndpointIdentifier, TransferFlags, TransferKind, TransferStatus};

    fn make_uhci_controller() -> Controller<UhciQueues> {
        let fake = crate::dma::tests::FakeDma::new();
        let td_stride = crate::util::align_up(core::mem::size_of::<Td>(), 16);
        let qh_stride = crate::util::align_up(core::mem::size_of::<Qh>(), 16);
        let td_region = DmaRegion::alloc(&fake, td_stride * 8, 16).unwrap();
        let qh_region = DmaRegion::alloc(&fake, qh_stride * 4, 16).unwrap();
        let tds = DescriptorPool::new(0, td_region, 8, 1, 16);
        let qhs = DescriptorPool::new(1, qh_region, 4, 1, 16);
        Controller::new(Scheduler::new(SchedulerConfig::usb1(1024)), UhciQueues::new(tds, qhs))
    }

    #[test]
    fn submit_then_dequeue_removes_transfer_record() {
        let mut ctl = make_uhci_controller();
        let td = ctl.family_mut().tds.allocate().unwrap();
        let transfer = Transfer::new(
            TransferKind::Bulk,
            Direction::In,
            Speed::Full,
            EndpointIdentifier::new(1, 1, Direction::In),
            64,
            SgTable::new(),
            TransferFlags::empty(),
        );
        let id = ctl.submit_transfer(transfer, ElementRef { pool: 0, index: td.index() });
        assert!(ctl.transfers().get(id).is_some());
        ctl.dequeue_transfer(id).unwrap();
        assert!(ctl.transfers().get(id).is_none());
    }

    #[test]
    fn on_irq_finishes_transfer_once_td_completes() {
        let mut ctl = make_uhci_controller();
        let td = ctl.family_mut().tds.allocate().unwrap();
        ctl.family_mut().tds.get_mut(td).data_token(0x69, 1, 1, 0x3000, 8, false, false);
        ctl.family_mut().tds.get_mut(td).ctrl_status &= !(1 << 23);

        let transfer = Transfer::new(
            TransferKind::Bulk,
            Direction::In,
            Speed::Full,
            EndpointIdentifier::new(1, 1, Direction::In),
            64,
            SgTable::new(),
            TransferFlags::SHORT_OK,
        );
        let id = ctl.submit_transfer(transfer, ElementRef { pool: 0, index: td.index() });

        let finished = ctl.on_irq().unwrap();
        assert_eq!(finished, alloc::vec![id]);
        assert_eq!(ctl.transfers().get(id).unwrap().status, TransferStatus::Finished);
    }

    /// spec.md §8 scenario 1: a multi-TD chain must accumulate progress
    /// across every element, not just the root, before `on_irq` reports the
    /// transfer finished.
    #[test]
    fn on_irq_walks_full_chain_before_finishing_multi_td_transfer() {
        let mut ctl = make_uhci_controller();
        let sg = SgTable::from_segments(alloc::vec![crate::dma::Segment { phys: crate::dma::PhysAddr(0x3000), len: 16 }]);
        let (root, _toggle) = ctl
            .family_mut()
            .build_bulk_chain(1, 1, Direction::In, false, true, &sg, 8, false)
            .unwrap();

        let tds_pool = ctl.family().tds.pool_id();
        let mut cursor = root;
        loop {
            let td = ctl.family_mut().tds.get_mut(cursor);
            // Clear ACTIVE and set the actual-length field to match the 8
            // bytes requested (maxlen-1 == actlen-1 == 7), a full completion.
            td.ctrl_status = (td.ctrl_status & !(1 << 23)) | 7;
            let next = td.object.depth_next;
            if next == crate::pool::NO_INDEX {
                break;
            }
            cursor = Handle::new(tds_pool, next);
        }

        let transfer = Transfer::new(
            TransferKind::Bulk,
            Direction::In,
            Speed::Full,
            EndpointIdentifier::new(1, 1, Direction::In),
            8,
            SgTable::new(),
            TransferFlags::empty(),
        );
        let id = ctl.submit_transfer(transfer, ElementRef { pool: tds_pool, index: root.index() });

        let finished = ctl.on_irq().unwrap();
        assert_eq!(finished, alloc::vec![id]);
        let recorded = ctl.transfers().get(id).unwrap();
        assert_eq!(recorded.status, TransferStatus::Finished);
        assert_eq!(recorded.elements_completed, 2);
    }
}
