//! Per-host-controller-family queue management, spec.md §4.4/§6.
//!
//! Grounded in `examples/original_source/modules/serial/usb/common/types.h`'s
//! `HCIProcessReason`/`HCIProcessEvent` split and the per-family
//! `UhciQueueReset`/`OhciQueueReset`/`EhciQueueReset`-style entry points the
//! original scatters across `uhci/queue.c`, `ohci/queue.c`, `ehci/queue.c`.
//! Here that split becomes one trait so [`crate::controller::Controller`]
//! can drive any family identically.

pub mod ehci;
pub mod ohci;
pub mod uhci;

use crate::scheduler::ElementRef;
use crate::transfer::{ProcessEvent, ProcessReason, ScanContext};
use crate::util::Result;

/// A host-controller family's queue engine: UHCI/OHCI/EHCI each implement
/// this once over their own descriptor pools. `process_element` inverts the
/// original's per-reason callback into a single dispatch point (spec.md
/// §4.4 "process_element/process_event").
pub trait QueueFamily {
    /// Inspect or act on one queue element for `reason`. `Scan` fills in and
    /// returns progress via the scan context; other reasons mutate hardware
    /// or shadow state and ignore the return value's fields besides `result`.
    fn process_element(&mut self, element: ElementRef, reason: ProcessReason, ctx: &mut ScanContext) -> Result<()>;

    /// Handle a one-shot controller event not tied to a specific queue
    /// element (currently just post-reset re-priming of the async/periodic
    /// anchors).
    fn process_event(&mut self, event: ProcessEvent) -> Result<()>;
}
