//! AHCI port command engine: Command List / Command Table / PRDT / Received
//! FIS, spec.md §4.5.
//!
//! Grounded in `examples/felipestenzel-stenzel_os/stenzel-os-x86-ultra/
//! kernel/src/drivers/storage/ahci.rs`'s `AhciPort` (register offsets,
//! `stop`/`start`/`wait_slot_ready`/`issue_command`/`identify`), restructured
//! behind [`crate::regs::ControllerRegs`] per spec.md §1 and split into one
//! command slot per in-flight transaction instead of a single-outstanding-
//! command loop (spec.md §4.5 "32 command slots").

pub mod fis;

extern crate alloc;

use alloc::vec::Vec;

use crate::dma::{DmaAllocator, DmaRegion, SgTable};
use crate::regs::{rmw32, wait_for32, ControllerRegs};
use crate::util::{Error, Result};

use fis::{RegD2H, RegH2D};

const PORT_CLB: u32 = 0x00;
const PORT_CLBU: u32 = 0x04;
const PORT_FB: u32 = 0x08;
const PORT_FBU: u32 = 0x0C;
const PORT_IS: u32 = 0x10;
const PORT_IE: u32 = 0x14;
const PORT_CMD: u32 = 0x18;
const PORT_TFD: u32 = 0x20;
const PORT_SIG: u32 = 0x24;
const PORT_SSTS: u32 = 0x28;
const PORT_SCTL: u32 = 0x2C;
const PORT_SERR: u32 = 0x30;
const PORT_SACT: u32 = 0x34;
const PORT_CI: u32 = 0x38;

const PORT_CMD_ST: u32 = 1 << 0;
const PORT_CMD_SUD: u32 = 1 << 1;
const PORT_CMD_POD: u32 = 1 << 2;
const PORT_CMD_FRE: u32 = 1 << 4;
const PORT_CMD_ICC_ACTIVE: u32 = 1 << 28;
const PORT_CMD_FR: u32 = 1 << 14;
const PORT_CMD_CR: u32 = 1 << 15;

const SSTS_DET_MASK: u32 = 0xF;
const SSTS_DET_PRESENT: u32 = 3;

const SCTL_DET_MASK: u32 = 0xF;
const SCTL_DET_INIT: u32 = 1;
const SCTL_IPM_DISABLE_PARTIAL: u32 = 1 << 8;
const SCTL_IPM_DISABLE_SLUMBER: u32 = 1 << 9;

const SATA_SIG_ATA: u32 = 0x0000_0101;
const SATA_SIG_ATAPI: u32 = 0xEB14_0101;

const TFD_ERR: u32 = 1 << 0;
const TFD_DRQ: u32 = 1 << 3;
const TFD_BSY: u32 = 1 << 7;

/// `PxIE`/`PxIS` bits this engine cares about, AHCI 1.3.1 §3.3.17/§3.3.16.
/// Host-bus fatal (HBFS) and interface fatal (IFS) leave the port unable to
/// make progress on its own and require a stop/start cycle to recover from;
/// the others either fail just the one in-flight command (`TFES`) or are
/// purely informational and only logged.
const PORT_IS_HBFS: u32 = 1 << 29;
const PORT_IS_IFS: u32 = 1 << 27;
const PORT_IS_FATAL: u32 = PORT_IS_HBFS | PORT_IS_IFS;
const PORT_IS_INFS: u32 = 1 << 26;
const PORT_IS_OFS: u32 = 1 << 24;
const PORT_IS_IPMS: u32 = 1 << 23;
const PORT_IS_NONFATAL: u32 = PORT_IS_INFS | PORT_IS_OFS | PORT_IS_IPMS;
const PORT_IS_TFES: u32 = 1 << 30;
const PORT_IS_PCS: u32 = 1 << 6;

/// `AhciPortStart`'s interrupt-enable bitmask: every cause the port reports
/// through `PxIS` gets unmasked up front so `wait_complete`/an embedder's IRQ
/// handler can classify it, rather than enabling causes piecemeal.
const PORT_INTERRUPT_ENABLE_MASK: u32 = (1 << 0) // DHRE
    | (1 << 1) // PSE
    | (1 << 2) // DSE
    | (1 << 3) // SDBE
    | (1 << 6) // PCE
    | (1 << 22) // PRCE
    | PORT_IS_IPMS // IPME
    | PORT_IS_OFS // OFE
    | PORT_IS_INFS // INFE
    | PORT_IS_IFS // IFE
    | (1 << 28) // HBDE
    | PORT_IS_HBFS // HBFE
    | PORT_IS_TFES // TFEE
    | (1 << 31); // CPDE

pub const COMMAND_SLOTS: usize = 32;
pub const MAX_PRDT_ENTRIES: usize = 248;
/// AHCI PRDT entry byte-count field is 22 bits, so each entry is capped at
/// 4 MiB (and must be even, which `from_contiguous`'s page splitting already
/// guarantees since pages are smaller than this cap).
pub const MAX_PRDT_ENTRY_BYTES: u32 = 4 * 1024 * 1024;

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
struct CommandHeader {
    flags: u16,
    prdtl: u16,
    prdbc: u32,
    ctba: u64,
    _reserved: [u32; 4],
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
struct PrdtEntry {
    dba: u64,
    _reserved: u32,
    dbc: u32,
}

const CMD_TABLE_CFIS_LEN: usize = 64;
const CMD_TABLE_ACMD_LEN: usize = 16;
const CMD_TABLE_RESERVED_LEN: usize = 48;

/// Outcome of one issued command, spec.md §4.5 error taxonomy: fatal errors
/// require the port to be restarted, non-fatal ones only fail that command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    TaskFile(u8),
    Fatal,
    Timeout,
}

impl From<PortError> for Error {
    fn from(err: PortError) -> Self {
        match err {
            PortError::TaskFile(_) => Error::BufferError,
            PortError::Fatal => Error::Unknown,
            PortError::Timeout => Error::Timeout,
        }
    }
}

/// One queued or in-flight storage command, spec.md §4.5. `lba`/`sector_count`/
/// `lba48` are carried alongside the already-built [`RegH2D`] so
/// [`PortCommandEngine::complete_storage`] can compute a resubmission window
/// (adjusted LBA and remaining sector count) if the device returns fewer
/// bytes than requested, mirroring `AhciTransaction_t`'s resumable shape in
/// `examples/original_source/modules/storage/ahci/transactions.c`.
pub struct Transaction {
    pub slot: u8,
    pub sg_table: SgTable,
    pub command: RegH2D,
    pub write: bool,
    pub lba: u64,
    pub sector_count: u32,
    pub lba48: bool,
}

/// Outcome of [`PortCommandEngine::complete_storage`]: how much of the
/// request this command actually moved, and, if short, the LBA/count window
/// still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCompletion {
    pub sectors_transferred: u32,
    pub remainder: Option<(u64, u32)>,
}

/// Per-port command engine. Owns the Command List / Received FIS area /
/// per-slot Command Tables, all in one [`DmaRegion`] each, and the register
/// offset for this port within the HBA's MMIO space.
pub struct PortCommandEngine {
    port_index: u8,
    reg_base: u32,
    command_list: DmaRegion,
    received_fis: DmaRegion,
    command_tables: Vec<DmaRegion>,
    slot_busy: u32,
    started: bool,
}

impl PortCommandEngine {
    /// `reg_base` is the byte offset of this port's register block from the
    /// start of the controller's MMIO BAR (`HBA_PORT_BASE + index *
    /// HBA_PORT_SIZE`).
    pub fn new(
        alloc: &dyn DmaAllocator,
        port_index: u8,
        reg_base: u32,
    ) -> Result<Self> {
        let command_list = DmaRegion::alloc(alloc, core::mem::size_of::<CommandHeader>() * COMMAND_SLOTS, 1024)?;
        let received_fis = DmaRegion::alloc(alloc, 256, 256)?;
        let mut command_tables = Vec::with_capacity(COMMAND_SLOTS);
        let table_size = CMD_TABLE_CFIS_LEN + CMD_TABLE_ACMD_LEN + CMD_TABLE_RESERVED_LEN
            + MAX_PRDT_ENTRIES * core::mem::size_of::<PrdtEntry>();
        for _ in 0..COMMAND_SLOTS {
            command_tables.push(DmaRegion::alloc(alloc, table_size, 128)?);
        }
        Ok(Self {
            port_index,
            reg_base,
            command_list,
            received_fis,
            command_tables,
            slot_busy: 0,
            started: false,
        })
    }

    fn offset(&self, port_offset: u32) -> u32 {
        self.reg_base + port_offset
    }

    /// `AhciPortInitiateSetup` + `AhciPortFinishSetup`'s stop half: mask
    /// interrupts, then if the port is already running (CR/FR/ST/FRE any
    /// set) bring it fully idle before touching CLB/FB.
    fn initiate_setup(&mut self, regs: &dyn ControllerRegs) -> Result<()> {
        regs.write32(self.offset(PORT_IE), 0);
        if regs.read32(self.offset(PORT_CMD)) & (PORT_CMD_CR | PORT_CMD_FR | PORT_CMD_ST | PORT_CMD_FRE) != 0 {
            self.stop(regs)?;
        }
        Ok(())
    }

    /// `AhciPort::stop`, clear ST/FRE, wait for FR/CR to clear.
    pub fn stop(&mut self, regs: &dyn ControllerRegs) -> Result<()> {
        rmw32(regs, self.offset(PORT_CMD), 0, PORT_CMD_ST | PORT_CMD_FRE);
        wait_for32(regs, self.offset(PORT_CMD), PORT_CMD_FR | PORT_CMD_CR, 0, 50, 500_000)?;
        self.started = false;
        Ok(())
    }

    /// `AhciPortFinishSetup`: pulse COMRESET over `PxSCTL`, wait for the PHY
    /// to report a device present (`PxSSTS.DET == 3`), spin up staggered
    /// spin-up/power bits, then clear `PxSERR`/`PxIS` so stale bits from the
    /// reset don't immediately look like a fault once interrupts are unmasked.
    fn finish_setup(&mut self, regs: &dyn ControllerRegs) -> Result<()> {
        rmw32(
            regs,
            self.offset(PORT_SCTL),
            SCTL_IPM_DISABLE_PARTIAL | SCTL_IPM_DISABLE_SLUMBER | SCTL_DET_INIT,
            SCTL_DET_MASK,
        );
        regs.spin_wait_us(50_000);
        rmw32(regs, self.offset(PORT_SCTL), 0, SCTL_DET_MASK);
        wait_for32(regs, self.offset(PORT_SSTS), SSTS_DET_MASK, SSTS_DET_PRESENT, 100, 1_000_000)?;
        rmw32(regs, self.offset(PORT_CMD), PORT_CMD_SUD | PORT_CMD_POD | PORT_CMD_ICC_ACTIVE, 0);
        regs.write32(self.offset(PORT_SERR), u32::MAX);
        regs.write32(self.offset(PORT_IS), u32::MAX);
        Ok(())
    }

    /// `AhciPortStart`: program CLB/FB, unmask every interrupt cause this
    /// engine classifies, then wait for CR/FR to settle clear before the
    /// caller proceeds to [`Self::enable`].
    pub fn start(&mut self, regs: &dyn ControllerRegs) -> Result<()> {
        let clb = self.command_list.phys_addr().0;
        regs.write32(self.offset(PORT_CLB), (clb & 0xFFFF_FFFF) as u32);
        regs.write32(self.offset(PORT_CLBU), (clb >> 32) as u32);
        let fb = self.received_fis.phys_addr().0;
        regs.write32(self.offset(PORT_FB), (fb & 0xFFFF_FFFF) as u32);
        regs.write32(self.offset(PORT_FBU), (fb >> 32) as u32);
        regs.write32(self.offset(PORT_IE), PORT_INTERRUPT_ENABLE_MASK);
        wait_for32(regs, self.offset(PORT_CMD), PORT_CMD_CR | PORT_CMD_FR, 0, 50, 500_000)?;
        Ok(())
    }

    /// `AhciPortEnable`: raise FRE and wait for the FIS receive engine to
    /// confirm running, clear a stuck BSY/DRQ left over from the reset, then
    /// raise ST and wait for the command-list engine to confirm running.
    /// Returns the port's signature register, the caller uses it to tell an
    /// ATA device from ATAPI (spec.md §4.5 device detection).
    pub fn enable(&mut self, regs: &dyn ControllerRegs) -> Result<u32> {
        rmw32(regs, self.offset(PORT_CMD), PORT_CMD_FRE, 0);
        wait_for32(regs, self.offset(PORT_CMD), PORT_CMD_FR, PORT_CMD_FR, 50, 500_000)?;

        if regs.read32(self.offset(PORT_TFD)) & (TFD_BSY | TFD_DRQ) != 0 {
            regs.write32(self.offset(PORT_SERR), u32::MAX);
            wait_for32(regs, self.offset(PORT_TFD), TFD_BSY | TFD_DRQ, 0, 100, 2_000_000)?;
        }

        rmw32(regs, self.offset(PORT_CMD), PORT_CMD_ST, 0);
        wait_for32(regs, self.offset(PORT_CMD), PORT_CMD_CR, PORT_CMD_CR, 50, 500_000)?;
        self.started = true;
        let signature = regs.read32(self.offset(PORT_SIG));
        log::debug!("ahci: port {} enabled, signature 0x{:08x}", self.port_index, signature);
        Ok(signature)
    }

    /// Full bring-up FSM: stop if running, COMRESET, program/start, enable.
    /// Returns the port's signature register once a device answers, or
    /// `Error::Timeout` if the PHY never reports a device present. Combines
    /// `AhciPortInitiateSetup`/`AhciPortFinishSetup`/`AhciPortStart`/
    /// `AhciPortEnable` into the single call an embedder's port-probe loop
    /// drives per physical port (spec.md §4.5 steps 1-8).
    pub fn bring_up(&mut self, regs: &dyn ControllerRegs) -> Result<u32> {
        self.initiate_setup(regs)?;
        self.finish_setup(regs)?;
        self.start(regs)?;
        self.enable(regs)
    }

    /// `PORT_SSTS.DET == 3`, a device is physically present and
    /// communication has been established (spec.md §4.5 device detection).
    pub fn device_present(&self, regs: &dyn ControllerRegs) -> bool {
        regs.read32(self.offset(PORT_SSTS)) & SSTS_DET_MASK == SSTS_DET_PRESENT
    }

    pub fn is_atapi(&self, regs: &dyn ControllerRegs) -> bool {
        regs.read32(self.offset(PORT_SIG)) == SATA_SIG_ATAPI
    }

    /// Find and reserve the lowest-numbered free command slot.
    fn acquire_slot(&mut self) -> Result<u8> {
        for i in 0..COMMAND_SLOTS as u32 {
            if self.slot_busy & (1 << i) == 0 {
                self.slot_busy |= 1 << i;
                return Ok(i as u8);
            }
        }
        Err(Error::OutOfPool)
    }

    fn release_slot(&mut self, slot: u8) {
        self.slot_busy &= !(1 << slot);
    }

    /// Build the PRDT for `slot` from `sg_table`. Per spec.md §4.5 step 4, a
    /// segment larger than `MAX_PRDT_ENTRY_BYTES` is split across multiple
    /// entries rather than rejected; `PrdtFull` is reserved for exceeding the
    /// `MAX_PRDT_ENTRIES` cap after splitting (spec.md §9, explicit error
    /// instead of silent truncation).
    fn build_prdt(&mut self, slot: u8, sg_table: &SgTable) -> Result<u16> {
        let mut entries: Vec<(u64, u32)> = Vec::new();
        for seg in sg_table.segments() {
            let mut offset = 0u32;
            while offset < seg.len {
                let len = (seg.len - offset).min(MAX_PRDT_ENTRY_BYTES);
                entries.push((seg.phys.0 + offset as u64, len));
                offset += len;
            }
        }
        if entries.len() > MAX_PRDT_ENTRIES {
            return Err(Error::PrdtFull);
        }

        let table = &mut self.command_tables[slot as usize];
        let prdt_offset = CMD_TABLE_CFIS_LEN + CMD_TABLE_ACMD_LEN + CMD_TABLE_RESERVED_LEN;
        let last = entries.len().saturating_sub(1);
        for (i, (phys, len)) in entries.iter().enumerate() {
            // Interrupt-on-completion only makes sense on the final entry.
            let ioc = if i == last { 1u32 << 31 } else { 0 };
            let entry = PrdtEntry { dba: *phys, _reserved: 0, dbc: (len - 1) | ioc };
            let write_offset = prdt_offset + i * core::mem::size_of::<PrdtEntry>();
            unsafe {
                core::ptr::write_unaligned(table.as_mut_ptr::<u8>().add(write_offset) as *mut PrdtEntry, entry);
            }
        }
        Ok(entries.len() as u16)
    }

    /// `AhciPort::issue_command`, stage the Command FIS + PRDT into `slot`'s
    /// Command Table, point the Command Header at it, and set `PxCI`.
    pub fn issue(&mut self, regs: &dyn ControllerRegs, command: RegH2D, sg_table: SgTable, write: bool) -> Result<Transaction> {
        if !self.started {
            return Err(Error::Invalid);
        }
        let slot = self.acquire_slot()?;
        let prdtl = match self.build_prdt(slot, &sg_table) {
            Ok(n) => n,
            Err(e) => {
                self.release_slot(slot);
                return Err(e);
            }
        };

        let table_phys = self.command_tables[slot as usize].phys_addr().0;
        {
            let mut cfis = [0u8; 20];
            command.encode(&mut cfis);
            let table = &mut self.command_tables[slot as usize];
            table.as_mut_slice()[..20].copy_from_slice(&cfis);
        }

        let header = CommandHeader {
            flags: (core::mem::size_of::<[u8; 20]>() / 4) as u16 | if write { 1 << 6 } else { 0 },
            prdtl,
            prdbc: 0,
            ctba: table_phys,
            _reserved: [0; 4],
        };
        let header_offset = slot as usize * core::mem::size_of::<CommandHeader>();
        unsafe {
            core::ptr::write_unaligned(self.command_list.as_mut_ptr::<u8>().add(header_offset) as *mut CommandHeader, header);
        }

        regs.write32(self.offset(PORT_IS), u32::MAX);
        rmw32(regs, self.offset(PORT_CI), 1 << slot, 0);

        Ok(Transaction { slot, sg_table, command, write, lba: 0, sector_count: 0, lba48: false })
    }

    /// Poll for completion of `txn`: `PxCI` bit clears on success, a
    /// task-file error (`PxTFD.ERR`) or a fatal `PxIS` cause fails it
    /// (spec.md §4.5 error handling).
    pub fn wait_complete(&mut self, regs: &dyn ControllerRegs, txn: &Transaction) -> core::result::Result<(), PortError> {
        let mut waited = 0u32;
        let timeout_us = 5_000_000u32;
        let step_us = 50;
        loop {
            let is = regs.read32(self.offset(PORT_IS));
            if is & PORT_IS_FATAL != 0 {
                log::error!("ahci: port {} fatal PxIS 0x{:08x}, aborting slot {}", self.port_index, is, txn.slot);
                self.release_slot(txn.slot);
                return Err(PortError::Fatal);
            }
            if is & PORT_IS_NONFATAL != 0 {
                // Logged only: the command in flight is unaffected, clear so it
                // doesn't keep re-triggering the embedder's interrupt handler.
                log::warn!("ahci: port {} non-fatal PxIS 0x{:08x}", self.port_index, is & PORT_IS_NONFATAL);
                regs.write32(self.offset(PORT_IS), is & PORT_IS_NONFATAL);
            }
            let ci = regs.read32(self.offset(PORT_CI));
            if ci & (1 << txn.slot) == 0 {
                self.release_slot(txn.slot);
                if is & PORT_IS_TFES != 0 {
                    let tfd = regs.read32(self.offset(PORT_TFD));
                    if tfd & TFD_ERR != 0 {
                        return Err(PortError::TaskFile((tfd >> 8) as u8));
                    }
                }
                return Ok(());
            }
            let tfd = regs.read32(self.offset(PORT_TFD));
            if tfd & TFD_ERR != 0 && tfd & TFD_BSY == 0 {
                self.release_slot(txn.slot);
                return Err(PortError::TaskFile((tfd >> 8) as u8));
            }
            if waited >= timeout_us {
                self.release_slot(txn.slot);
                log::error!("ahci: port {} slot {} timed out waiting for completion", self.port_index, txn.slot);
                return Err(PortError::Timeout);
            }
            regs.spin_wait_us(step_us);
            waited += step_us;
        }
    }

    /// Bytes hardware actually moved for an already-completed slot's Command
    /// Table, read back from `PRDBC` (AHCI 1.3.1 Table 4-2), zero once the
    /// header has been reused by a later command so callers must read this
    /// before reissuing the slot.
    fn read_prdbc(&self, slot: u8) -> u32 {
        let header_offset = slot as usize * core::mem::size_of::<CommandHeader>();
        unsafe { core::ptr::read_unaligned(self.command_list.as_ptr::<u8>().add(header_offset + 4) as *const u32) }
    }

    /// Decode the Register D2H FIS the device posted into this port's
    /// Received FIS area (AHCI 1.3.1 Table 5-2 byte offset 0x40), used only
    /// for the richer error detail `wait_complete`'s `PxTFD`-derived
    /// `PortError::TaskFile` doesn't carry (device/LBA/count at time of error).
    fn last_d2h_fis(&self) -> Option<RegD2H> {
        const RFIS_D2H_OFFSET: usize = 0x40;
        let bytes: [u8; 20] = self.received_fis.as_slice()[RFIS_D2H_OFFSET..RFIS_D2H_OFFSET + 20]
            .try_into()
            .ok()?;
        RegD2H::decode(&bytes)
    }

    /// Translate an ATA error register byte into a short, human-readable
    /// cause, matching `PrintTaskDataErrorString` in `examples/
    /// original_source/modules/storage/ahci/dispatch.c`.
    pub fn describe_task_file_error(error_byte: u8) -> &'static str {
        const ATA_ERR_EOM: u8 = 1 << 1;
        const ATA_ERR_IDNF: u8 = 1 << 4;
        if error_byte & ATA_ERR_IDNF != 0 {
            "invalid sector range (IDNF)"
        } else if error_byte & ATA_ERR_EOM != 0 {
            "end of media"
        } else {
            "device reported a task file error"
        }
    }

    /// Issue a READ/WRITE DMA command, selecting the 28-bit or 48-bit LBA
    /// variant from `lba48`, and capping `sector_count` to what that
    /// command's count field can express (`CommandTable[]` selection in
    /// `examples/original_source/modules/storage/ahci/transactions.c`).
    pub fn storage_transfer(
        &mut self,
        regs: &dyn ControllerRegs,
        write: bool,
        lba: u64,
        sector_count: u32,
        lba48: bool,
        sg_table: SgTable,
    ) -> Result<Transaction> {
        const ATA_CMD_READ_DMA: u8 = 0xC8;
        const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
        const ATA_CMD_WRITE_DMA: u8 = 0xCA;
        const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
        /// A 28-bit count field of `0` means 256 sectors; there is no way to
        /// request more in one command.
        const MAX_SECTORS_LBA28: u32 = 256;
        const MAX_SECTORS_LBA48: u32 = 65536;

        let max_sectors = if lba48 { MAX_SECTORS_LBA48 } else { MAX_SECTORS_LBA28 };
        let count = sector_count.min(max_sectors);
        let count_field = if count == max_sectors { 0 } else { count as u16 };

        let (command_byte, device, lba_field) = if lba48 {
            let cmd = if write { ATA_CMD_WRITE_DMA_EXT } else { ATA_CMD_READ_DMA_EXT };
            (cmd, 0x40u8, lba & 0x0000_FFFF_FFFF_FFFF)
        } else {
            let cmd = if write { ATA_CMD_WRITE_DMA } else { ATA_CMD_READ_DMA };
            (cmd, 0xE0 | (((lba >> 24) & 0xF) as u8), lba & 0x00FF_FFFF)
        };

        let command = RegH2D {
            command: true,
            command_byte,
            features: 0,
            lba: lba_field,
            device,
            count: count_field,
            icc: 0,
            control: 0,
        };
        log::trace!(
            "ahci: port {} storage_transfer write={} lba={} count={} lba48={}",
            self.port_index,
            write,
            lba,
            count,
            lba48
        );
        let mut txn = self.issue(regs, command, sg_table, write)?;
        txn.lba = lba;
        txn.sector_count = count;
        txn.lba48 = lba48;
        Ok(txn)
    }

    /// Wait for a storage transaction issued through [`Self::storage_transfer`]
    /// to complete, and compute a resubmission window if the device
    /// transferred fewer bytes than requested (`prdbc < sg_table.total_len()`),
    /// mirroring `AhciTransactionHandleResponse`'s `BytesLeft`/resubmit loop.
    /// The caller is responsible for building a fresh [`SgTable`] for the
    /// remainder window and calling `storage_transfer` again with it, this
    /// engine never retains ownership of client memory across calls.
    pub fn complete_storage(
        &mut self,
        regs: &dyn ControllerRegs,
        txn: &Transaction,
        sector_size: u32,
    ) -> core::result::Result<StorageCompletion, PortError> {
        if let Err(err) = self.wait_complete(regs, txn) {
            if let PortError::TaskFile(error_byte) = err {
                if let Some(d2h) = self.last_d2h_fis() {
                    log::warn!(
                        "ahci: port {} {} (status=0x{:02x} error=0x{:02x})",
                        self.port_index,
                        Self::describe_task_file_error(error_byte),
                        d2h.status,
                        d2h.error
                    );
                }
            }
            return Err(err);
        }
        let prdbc = self.read_prdbc(txn.slot);
        let requested = txn.sg_table.total_len() as u32;
        let sector_size = sector_size.max(1);
        let sectors_done = prdbc.min(requested) / sector_size;
        if sectors_done >= txn.sector_count {
            Ok(StorageCompletion { sectors_transferred: txn.sector_count, remainder: None })
        } else {
            let next_lba = txn.lba + sectors_done as u64;
            let remaining = txn.sector_count - sectors_done;
            log::debug!(
                "ahci: port {} short transfer, {} sectors left starting at lba {}",
                self.port_index,
                remaining,
                next_lba
            );
            Ok(StorageCompletion { sectors_transferred: sectors_done, remainder: Some((next_lba, remaining)) })
        }
    }

    /// `PxSACT ^ PxCI` diffing for NCQ-issued commands: slots whose bit
    /// cleared in both registers have completed (AHCI 1.3.1 §5.3.8.1). Not
    /// used by the non-NCQ `issue`/`wait_complete` path above, but exposed
    /// for a future NCQ-aware transaction manager (spec.md Open Question).
    pub fn completed_ncq_slots(&self, regs: &dyn ControllerRegs, previously_active: u32) -> u32 {
        let sact = regs.read32(self.offset(PORT_SACT));
        let ci = regs.read32(self.offset(PORT_CI));
        previously_active & !(sact | ci)
    }

    /// `identify()`: issue `IDENTIFY DEVICE` and hand back the raw 512-byte
    /// response for the caller to parse into an `AtaIdentity`.
    pub fn identify(&mut self, regs: &dyn ControllerRegs, alloc: &dyn DmaAllocator) -> Result<DmaRegion> {
        let buf = DmaRegion::alloc(alloc, 512, 2)?;
        let sg = buf.sg_table(true)?;
        let command = RegH2D {
            command: true,
            command_byte: 0xEC,
            device: 0,
            ..Default::default()
        };
        let txn = self.issue(regs, command, sg, false)?;
        self.wait_complete(regs, &txn).map_err(|_| Error::NoResponse)?;
        Ok(buf)
    }
}

/// Parsed `IDENTIFY DEVICE` response, spec.md's SPEC_FULL supplement (the
/// original builds this inline in `identify()`; here it is a reusable type).
#[derive(Debug, Clone)]
pub struct AtaIdentity {
    pub sectors: u64,
    pub lba48: bool,
    pub model: alloc::string::String,
}

impl AtaIdentity {
    pub fn parse(buf: &[u8]) -> Self {
        let sectors = u64::from_le_bytes([
            buf[200], buf[201], buf[202], buf[203], buf[204], buf[205], buf[206], buf[207],
        ]);
        // Word 83, bit 10: LBA48 addressing supported.
        let word83 = u16::from_le_bytes([buf[166], buf[167]]);
        let lba48 = word83 & (1 << 10) != 0;
        let model: Vec<u8> = buf[54..94]
            .chunks(2)
            .flat_map(|c| [c[1], c[0]])
            .take_while(|&c| c != 0)
            .collect();
        let model = core::str::from_utf8(&model).unwrap_or("unknown").trim().into();
        Self { sectors, lba48, model }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::tests::FakeDma;
    use crate::regs::tests::FakeRegs;

    fn make_engine() -> (PortCommandEngine, FakeDma) {
        let fake = FakeDma::new();
        let engine = PortCommandEngine::new(&fake, 0, 0x100).unwrap();
        (engine, fake)
    }

    #[test]
    fn start_programs_clb_fb_and_interrupt_mask_without_starting() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        engine.start(&regs).unwrap();
        let clb = regs.read32(0x100 + PORT_CLB);
        assert_eq!(clb as u64, engine.command_list.phys_addr().0 & 0xFFFF_FFFF);
        assert_eq!(regs.read32(0x100 + PORT_IE), PORT_INTERRUPT_ENABLE_MASK);
        assert!(!engine.started);
    }

    #[test]
    fn enable_sets_st_and_returns_signature() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        // FakeRegs is plain memory, not real hardware: pre-poke FR/CR as
        // already set so the two handshake waits inside `enable` pass
        // immediately instead of timing out.
        regs.write32(0x100 + PORT_CMD, PORT_CMD_FR | PORT_CMD_CR);
        regs.write32(0x100 + PORT_SIG, SATA_SIG_ATA);
        let sig = engine.enable(&regs).unwrap();
        assert_eq!(sig, SATA_SIG_ATA);
        assert!(regs.read32(0x100 + PORT_CMD) & PORT_CMD_ST != 0);
        assert!(engine.started);
    }

    #[test]
    fn bring_up_runs_the_full_fsm_to_a_signature() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        regs.write32(0x100 + PORT_SSTS, SSTS_DET_PRESENT);
        regs.write32(0x100 + PORT_SIG, SATA_SIG_ATAPI);
        // FakeRegs has no real hardware timing: register the handshake bits
        // `enable` waits on (FR then CR) so each `wait_for32` resolves on its
        // first spin instead of looping until timeout.
        regs.flips_after.borrow_mut().push((0x100 + PORT_CMD, PORT_CMD_FR, PORT_CMD_FR));
        regs.flips_after.borrow_mut().push((0x100 + PORT_CMD, PORT_CMD_CR, PORT_CMD_CR));
        let sig = engine.bring_up(&regs).unwrap();
        assert_eq!(sig, SATA_SIG_ATAPI);
        assert!(engine.started);
        assert!(regs.read32(0x100 + PORT_CMD) & PORT_CMD_ST != 0);
    }

    #[test]
    fn issue_without_start_is_rejected() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        let err = engine.issue(&regs, RegH2D::default(), SgTable::new(), false).unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn oversized_sg_table_is_rejected_with_prdt_full() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        engine.started = true;
        let segments: Vec<_> = (0..(MAX_PRDT_ENTRIES + 1))
            .map(|i| crate::dma::Segment { phys: crate::dma::PhysAddr((i as u64) * 0x1000), len: 512 })
            .collect();
        let sg = SgTable::from_segments(segments);
        let err = engine.issue(&regs, RegH2D::default(), sg, false).unwrap_err();
        assert_eq!(err, Error::PrdtFull);
    }

    /// spec.md §4.5 step 4: a segment bigger than one PRDT entry can hold
    /// splits into multiple entries instead of being rejected outright.
    #[test]
    fn oversized_segment_splits_across_multiple_prdt_entries() {
        let (mut engine, _fake) = make_engine();
        let sg = SgTable::from_segments(alloc::vec![crate::dma::Segment {
            phys: crate::dma::PhysAddr(0x10_0000),
            len: MAX_PRDT_ENTRY_BYTES + 1,
        }]);
        let prdtl = engine.build_prdt(0, &sg).unwrap();
        assert_eq!(prdtl, 2);

        let table = &engine.command_tables[0];
        let prdt_offset = CMD_TABLE_CFIS_LEN + CMD_TABLE_ACMD_LEN + CMD_TABLE_RESERVED_LEN;
        let read_entry = |i: usize| unsafe {
            core::ptr::read_unaligned(table.as_ptr::<u8>().add(prdt_offset + i * core::mem::size_of::<PrdtEntry>()) as *const PrdtEntry)
        };
        let first = read_entry(0);
        let second = read_entry(1);
        assert_eq!(first.dba, 0x10_0000);
        assert_eq!(first.dbc & 0x3F_FFFF, MAX_PRDT_ENTRY_BYTES - 1);
        assert_eq!(first.dbc & (1 << 31), 0, "IOC belongs on the last entry only");
        assert_eq!(second.dba, 0x10_0000 + MAX_PRDT_ENTRY_BYTES as u64);
        assert_eq!(second.dbc & 0x3F_FFFF, 0);
        assert_ne!(second.dbc & (1 << 31), 0);
    }

    #[test]
    fn acquire_slot_reuses_released_slots() {
        let (mut engine, _fake) = make_engine();
        let a = engine.acquire_slot().unwrap();
        engine.release_slot(a);
        let b = engine.acquire_slot().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn storage_transfer_caps_28bit_sector_count_and_splits_lba() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        engine.started = true;
        let lba: u64 = 0x0F12_3456;
        let txn = engine
            .storage_transfer(&regs, false, lba, 10_000, false, SgTable::new())
            .unwrap();
        assert_eq!(txn.sector_count, 256);
        assert_eq!(txn.command.count, 0);
        assert_eq!(txn.command.lba, lba & 0x00FF_FFFF);
        assert_eq!(txn.command.device & 0xF, ((lba >> 24) & 0xF) as u8);
        assert_eq!(txn.command.command_byte, 0xC8);
    }

    #[test]
    fn storage_transfer_lba48_write_selects_write_dma_ext() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        engine.started = true;
        let txn = engine
            .storage_transfer(&regs, true, 0x1_0000_0000, 1, true, SgTable::new())
            .unwrap();
        assert_eq!(txn.command.command_byte, 0x35);
        assert_eq!(txn.command.device, 0x40);
        assert_eq!(txn.command.lba, 0x1_0000_0000);
    }

    #[test]
    fn complete_storage_reports_remainder_on_short_transfer() {
        let (mut engine, _fake) = make_engine();
        let regs = FakeRegs::new(0x200);
        engine.started = true;
        let segments = alloc::vec![crate::dma::Segment { phys: crate::dma::PhysAddr(0x2000), len: 4096 }];
        let sg = SgTable::from_segments(segments);
        let txn = engine.storage_transfer(&regs, false, 100, 8, false, sg).unwrap();
        // Simulate hardware retiring the command but only moving half the PRDT.
        // FakeRegs has no write-1-to-clear emulation, so `issue`'s `PxIS =
        // 0xFFFFFFFF` literally sets every bit instead of clearing them; reset
        // it here to the value real hardware would settle on.
        regs.write32(0x100 + PORT_IS, 0);
        regs.write32(0x100 + PORT_CI, 0);
        let header_offset = txn.slot as usize * core::mem::size_of::<CommandHeader>();
        unsafe {
            core::ptr::write_unaligned(engine.command_list.as_mut_ptr::<u8>().add(header_offset + 4) as *mut u32, 2048);
        }
        let completion = engine.complete_storage(&regs, &txn, 512).unwrap();
        assert_eq!(completion.sectors_transferred, 4);
        assert_eq!(completion.remainder, Some((104, 4)));
    }

    #[test]
    fn ata_identity_parses_sectors_model_and_lba48() {
        let mut buf = alloc::vec![0u8; 512];
        buf[166..168].copy_from_slice(&(1u16 << 10).to_le_bytes());
        let sectors: u64 = 12_345_678;
        buf[200..208].copy_from_slice(&sectors.to_le_bytes());
        let name = b"QEMU HARDDISK";
        for (i, chunk) in name.chunks(2).enumerate() {
            let (a, b) = (chunk[0], *chunk.get(1).unwrap_or(&0));
            buf[54 + i * 2] = b;
            buf[54 + i * 2 + 1] = a;
        }
        let identity = AtaIdentity::parse(&buf);
        assert_eq!(identity.sectors, sectors);
        assert!(identity.lba48);
        assert_eq!(identity.model, "QEMU HARDDISK");
    }
}
