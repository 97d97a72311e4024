//! Core scheduling/transaction engine shared by USB (UHCI/OHCI/EHCI) and
//! SATA (AHCI) host controller drivers.
//!
//! `no_std` by design: register access, PCI enumeration and physical memory
//! allocation are injected by the embedder through [`regs::ControllerRegs`]
//! and [`dma::DmaAllocator`] rather than owned here, so this crate has
//! nothing OS-specific left to depend on. Built in the style of
//! `examples/felipestenzel-stenzel_os/stenzel-os-x86-ultra`'s driver layer,
//! generalized to the family-independent scheduler and transfer lifecycle
//! MollenOS's USB stack factors out in `modules/serial/usb/common`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ahci;
pub mod controller;
pub mod dma;
pub mod families;
pub mod pool;
pub mod regs;
pub mod scheduler;
pub mod transfer;
pub mod util;

pub use util::{Error, Result};
