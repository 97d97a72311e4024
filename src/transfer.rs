//! `Transfer` / `TransferManager`, the family-independent USB transfer
//! lifecycle, spec.md §3/§4.3.
//!
//! Grounded in `examples/original_source/modules/serial/usb/common/types.h`
//! (`HCIProcessReason`/`HCIProcessEvent`/`HCIProcessReasonScanContext`) and
//! `manager.c` (`struct usb_controller_endpoint` toggle tracking). Family
//! modules drive this through [`TransferManager::scan`] rather than walking
//! their own descriptor chains directly, so toggle resync and completion
//! bookkeeping live in exactly one place.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::dma::SgTable;
use crate::pool::Handle;
use crate::scheduler::{Direction, Speed};
use crate::util::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Mirrors `enum HCIProcessReason`, why a family is being asked to look at
/// one of its queues right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessReason {
    Dump,
    Scan,
    Reset,
    FixToggle,
    Link,
    Unlink,
    Cleanup,
}

/// Mirrors `enum HCIProcessEvent`, a one-shot controller-level event, not
/// tied to any one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    ResetDone,
}

/// Status visible to the client once a transfer finishes, spec.md §3. Kept
/// distinct from [`crate::util::Error`] even though the values overlap 1:1,
/// because a `TransferStatus` is a terminal outcome attached to a transfer
/// record, not a `Result::Err` bubbling out of a fallible call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotProcessed,
    Queued,
    InProgress,
    Finished,
    Short,
    Stall,
    Babble,
    BufferError,
    Nak,
    Invalid,
    NoBandwidth,
}

impl From<Error> for TransferStatus {
    fn from(err: Error) -> Self {
        match err {
            Error::Stall => TransferStatus::Stall,
            Error::Babble => TransferStatus::Babble,
            Error::BufferError => TransferStatus::BufferError,
            Error::Nak => TransferStatus::Nak,
            Error::Short => TransferStatus::Short,
            Error::NoBandwidth => TransferStatus::NoBandwidth,
            Error::InvalidToggles | Error::Invalid | Error::NoResponse | Error::Unknown | Error::Timeout => {
                TransferStatus::Invalid
            }
            _ => TransferStatus::Invalid,
        }
    }
}

bitflags::bitflags! {
    pub struct TransferFlags: u8 {
        /// Short packets are a normal completion, not an error (bulk reads
        /// of unknown length).
        const SHORT_OK = 1 << 0;
        /// Isochronous transfer: no retry, no toggle tracking.
        const ISOCHRONOUS = 1 << 1;
    }
}

/// Addresses one endpoint for toggle-tracking purposes, keyed by the full
/// `(hub, port, device address, endpoint, direction)` tuple rather than just
/// `(device, endpoint)`, a device address is only unique under one hub/port
/// at a time during re-enumeration, matching `struct usb_controller_endpoint`
/// in `examples/original_source/modules/serial/usb/common/manager.c`.
/// Control endpoints track a single toggle shared by both directions, per
/// USB 2.0 §8.6.1, callers pass `Direction::Out` for control consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EndpointIdentifier {
    pub hub: u8,
    pub port: u8,
    pub device_address: u8,
    pub endpoint: u8,
    pub direction_bit: u8,
}

impl EndpointIdentifier {
    pub fn new(device_address: u8, endpoint: u8, direction: Direction) -> Self {
        Self::on_hub_port(0, 0, device_address, endpoint, direction)
    }

    pub fn on_hub_port(hub: u8, port: u8, device_address: u8, endpoint: u8, direction: Direction) -> Self {
        let direction_bit = if endpoint == 0 { 0 } else { matches!(direction, Direction::In) as u8 };
        Self { hub, port, device_address, endpoint, direction_bit }
    }
}

/// A queued or in-flight USB transfer, spec.md §3.
pub struct Transfer {
    pub kind: TransferKind,
    pub direction: Direction,
    pub speed: Speed,
    pub endpoint: EndpointIdentifier,
    pub max_packet_size: u16,
    /// `log2` of the polling interval the client requested, for periodic kinds.
    pub interval_log2: u8,
    pub sg_table: SgTable,
    pub flags: TransferFlags,
    pub status: TransferStatus,
    /// Root descriptor of this transfer's chain in its family's pool, opaque
    /// to this module, set by the family once it builds the chain.
    pub root_element: Option<Handle>,
    pub chain_length: u32,
    pub elements_total: u32,
    pub elements_completed: u32,
    pub bytes_transferred: usize,
}

impl Transfer {
    pub fn new(
        kind: TransferKind,
        direction: Direction,
        speed: Speed,
        endpoint: EndpointIdentifier,
        max_packet_size: u16,
        sg_table: SgTable,
        flags: TransferFlags,
    ) -> Self {
        Self {
            kind,
            direction,
            speed,
            endpoint,
            max_packet_size,
            interval_log2: 0,
            sg_table,
            flags,
            status: TransferStatus::NotProcessed,
            root_element: None,
            chain_length: 0,
            elements_total: 0,
            elements_completed: 0,
            bytes_transferred: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.status, TransferStatus::NotProcessed | TransferStatus::Queued | TransferStatus::InProgress)
    }
}

/// Per-transfer progress a family reports back after walking its queue, the
/// Rust shape of `HCIProcessReasonScanContext`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanContext {
    pub elements_executed: u32,
    pub elements_processed: u32,
    pub last_toggle: Option<bool>,
    pub short: bool,
    pub bytes_transferred: usize,
    pub result: Option<Error>,
}

/// Owns the transfer table and the per-endpoint toggle map; family modules
/// own the hardware descriptor chains and call back into this to record
/// completion, exactly the division of labour in spec.md §4.3.
pub struct TransferManager {
    transfers: BTreeMap<u32, Transfer>,
    next_id: u32,
    toggles: BTreeMap<EndpointIdentifier, bool>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self { transfers: BTreeMap::new(), next_id: 1, toggles: BTreeMap::new() }
    }

    /// Register a transfer as queued, returning the id clients reference it by.
    /// `UsbManagerCreateTransfer`'s entry point.
    pub fn submit(&mut self, mut transfer: Transfer) -> u32 {
        transfer.status = TransferStatus::Queued;
        let id = self.next_id;
        self.next_id += 1;
        self.transfers.insert(id, transfer);
        id
    }

    /// Alias for [`Self::submit`] under the original's name.
    pub fn queue_transfer(&mut self, transfer: Transfer) -> u32 {
        self.submit(transfer)
    }

    pub fn get(&self, id: u32) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    /// Remove and return a finished transfer, e.g. once the client has
    /// collected its status.
    pub fn take(&mut self, id: u32) -> Option<Transfer> {
        self.transfers.remove(&id)
    }

    /// Drop a transfer regardless of status, `HCIPROCESS_REASON_UNLINK`'s
    /// bookkeeping half, called once the family has unlinked the chain.
    pub fn dequeue(&mut self, id: u32) {
        self.transfers.remove(&id);
    }

    /// Current data toggle for `endpoint`; `false` (DATA0) if never recorded.
    pub fn toggle(&self, endpoint: EndpointIdentifier) -> bool {
        self.toggles.get(&endpoint).copied().unwrap_or(false)
    }

    pub fn set_toggle(&mut self, endpoint: EndpointIdentifier, toggle: bool) {
        self.toggles.insert(endpoint, toggle);
    }

    /// `HCIPROCESS_REASON_FIXTOGGLE`: force an endpoint's toggle to a known
    /// value, used after a stall recovery or `ClearFeature(ENDPOINT_HALT)`.
    pub fn reset_toggle(&mut self, endpoint: EndpointIdentifier) {
        self.toggles.insert(endpoint, false);
    }

    /// Apply a family's scan result to a transfer: advance progress, resync
    /// the endpoint's toggle if the hardware's last toggle disagrees with our
    /// bookkeeping, and compute the final [`TransferStatus`] once the chain is
    /// fully processed or an error terminates it early.
    pub fn apply_scan(&mut self, id: u32, ctx: ScanContext) -> Result<()> {
        let transfer = self.transfers.get_mut(&id).ok_or(Error::Invalid)?;
        transfer.elements_executed_or_processed(ctx.elements_executed, ctx.elements_processed);
        transfer.bytes_transferred += ctx.bytes_transferred;

        if let Some(toggle) = ctx.last_toggle {
            self.toggles.insert(transfer_endpoint(transfer), toggle);
        }

        if let Some(err) = ctx.result {
            transfer.status = err.into();
            return Ok(());
        }

        if ctx.short && !transfer.flags.contains(TransferFlags::SHORT_OK) {
            transfer.status = TransferStatus::Short;
            return Ok(());
        } else if ctx.short {
            transfer.status = TransferStatus::Finished;
            return Ok(());
        }

        if transfer.elements_completed >= transfer.elements_total && transfer.elements_total > 0 {
            transfer.status = TransferStatus::Finished;
        } else if transfer.status == TransferStatus::Queued {
            transfer.status = TransferStatus::InProgress;
        }
        Ok(())
    }

    /// `UsbManagerTransferFinish`: force a transfer straight to a terminal
    /// status, bypassing the normal scan-driven progression, used when the
    /// embedder cancels a transfer outright (device disconnect) rather than
    /// letting it run to completion or failure through `apply_scan`.
    pub fn finalize(&mut self, id: u32, status: TransferStatus) -> Result<()> {
        let transfer = self.transfers.get_mut(&id).ok_or(Error::Invalid)?;
        transfer.status = status;
        Ok(())
    }
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Transfer {
    fn elements_executed_or_processed(&mut self, executed: u32, processed: u32) {
        self.elements_completed += processed;
        let _ = executed;
    }
}

fn transfer_endpoint(transfer: &Transfer) -> EndpointIdentifier {
    transfer.endpoint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SgTable;

    fn ep(n: u8, dir: Direction) -> EndpointIdentifier {
        EndpointIdentifier::new(1, n, dir)
    }

    fn sample_transfer() -> Transfer {
        let mut t = Transfer::new(
            TransferKind::Bulk,
            Direction::In,
            Speed::High,
            ep(1, Direction::In),
            512,
            SgTable::new(),
            TransferFlags::empty(),
        );
        t.elements_total = 2;
        t
    }

    #[test]
    fn submit_marks_queued_and_is_retrievable() {
        let mut mgr = TransferManager::new();
        let id = mgr.submit(sample_transfer());
        assert_eq!(mgr.get(id).unwrap().status, TransferStatus::Queued);
    }

    #[test]
    fn apply_scan_completes_after_all_elements_processed() {
        let mut mgr = TransferManager::new();
        let id = mgr.submit(sample_transfer());
        mgr.apply_scan(id, ScanContext { elements_processed: 1, elements_executed: 1, ..Default::default() }).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, TransferStatus::InProgress);
        mgr.apply_scan(id, ScanContext { elements_processed: 1, elements_executed: 1, ..Default::default() }).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, TransferStatus::Finished);
    }

    #[test]
    fn short_packet_without_short_ok_flag_is_an_error() {
        let mut mgr = TransferManager::new();
        let id = mgr.submit(sample_transfer());
        mgr.apply_scan(id, ScanContext { short: true, elements_processed: 1, ..Default::default() }).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, TransferStatus::Short);
    }

    #[test]
    fn short_packet_with_short_ok_flag_finishes_cleanly() {
        let mut mgr = TransferManager::new();
        let mut t = sample_transfer();
        t.flags = TransferFlags::SHORT_OK;
        let id = mgr.submit(t);
        mgr.apply_scan(id, ScanContext { short: true, elements_processed: 1, ..Default::default() }).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, TransferStatus::Finished);
    }

    #[test]
    fn scan_result_error_maps_to_transfer_status() {
        let mut mgr = TransferManager::new();
        let id = mgr.submit(sample_transfer());
        mgr.apply_scan(id, ScanContext { result: Some(Error::Stall), ..Default::default() }).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, TransferStatus::Stall);
    }

    #[test]
    fn toggle_resyncs_from_scan_context() {
        let mut mgr = TransferManager::new();
        let id = mgr.submit(sample_transfer());
        assert_eq!(mgr.toggle(ep(1, Direction::In)), false);
        mgr.apply_scan(id, ScanContext { last_toggle: Some(true), elements_processed: 1, ..Default::default() }).unwrap();
        assert_eq!(mgr.toggle(ep(1, Direction::In)), true);
    }

    #[test]
    fn fix_toggle_forces_data0() {
        let mut mgr = TransferManager::new();
        let endpoint = ep(2, Direction::Out);
        mgr.set_toggle(endpoint, true);
        assert_eq!(mgr.toggle(endpoint), true);
        mgr.reset_toggle(endpoint);
        assert_eq!(mgr.toggle(endpoint), false);
    }
}
