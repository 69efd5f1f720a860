//! W25Q128 SPI flash emulation for the Arduboy FX.
//!
//! 16 MB chip hanging off the SPI bus with an active-low chip select whose
//! port pin is configurable. Storage is sparse: 4 KB sectors are allocated
//! on first write and unallocated sectors read as erased (0xFF).
//!
//! Supported commands:
//! - 0x02: Page Program (addr24, then data; 0.7 ms busy, wraps in the page)
//! - 0x03: Read Data (addr24, then continuous read)
//! - 0x04: Write Disable
//! - 0x05: Read Status Register 1 (bit 0 = BUSY)
//! - 0x06: Write Enable
//! - 0x20: Sector Erase (addr24; 100 ms busy)
//! - 0x9F: JEDEC ID → EF 40 17
//! - 0xAB: Release Power Down
//! - 0xB9: Power Down
//!
//! Responses lag one byte behind the SPI transfer that produced them, so
//! read data is fetched while the last address byte is clocked in.

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const FX_SIZE: usize = 16 * 1024 * 1024;
pub const SECTOR_BYTES: usize = 4096;
pub const NUM_SECTORS: usize = FX_SIZE / SECTOR_BYTES;
pub const PAGE_BYTES: usize = 256;

const ADDR_MASK: u32 = 0xFF_FFFF;

/// Busy time after each programmed byte.
const PROGRAM_BYTE_PS: u64 = 700 * 1000 * 1000;
/// Busy time of a 4 KB sector erase.
const SECTOR_ERASE_PS: u64 = 100 * 1000 * 1000 * 1000;

const JEDEC_MFR: u8 = 0xEF; // Winbond
const JEDEC_TYPE: u8 = 0x40;
const JEDEC_CAP: u8 = 0x17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FxState {
    /// Waiting for a command byte
    Idle,
    ReadAddr(u8),
    Reading,
    ProgAddr(u8),
    Programming,
    EraseAddr(u8),
    ReadStatus,
    JedecId(u8),
    /// Clocking out the bytes that follow Release Power Down
    Releasing(u8),
    /// Command finished; remaining bytes are ignored until deselect
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxFlash {
    sectors: Vec<Option<Vec<u8>>>,
    /// One bit per sector written by the firmware since load
    sectors_modified: Vec<u64>,
    /// Set whenever the firmware writes flash
    pub sectors_dirty: bool,
    pub state: FxState,
    pub enabled: bool,
    woken_up: bool,
    write_enabled: bool,
    addr: u32,
    pub busy_ps_rem: u64,
    /// Last command byte accepted, 0 when none
    pub last_command: u8,
    /// The last byte was a command sent while the chip was busy
    pub busy_error: bool,
}

impl FxFlash {
    pub fn new() -> Self {
        FxFlash {
            sectors: vec![None; NUM_SECTORS],
            sectors_modified: vec![0; NUM_SECTORS / 64],
            sectors_dirty: false,
            state: FxState::Idle,
            enabled: false,
            woken_up: false,
            write_enabled: false,
            addr: 0,
            busy_ps_rem: 0,
            last_command: 0,
            busy_error: false,
        }
    }

    /// Reset the interface state. Flash contents survive.
    pub fn reset(&mut self) {
        self.state = FxState::Idle;
        self.enabled = false;
        self.woken_up = false;
        self.write_enabled = false;
        self.addr = 0;
        self.busy_ps_rem = 0;
        self.last_command = 0;
        self.busy_error = false;
        self.sectors_dirty = false;
    }

    /// Erase the whole chip and forget which sectors were modified.
    pub fn erase_all(&mut self) {
        self.sectors.iter_mut().for_each(|s| *s = None);
        self.sectors_modified.iter_mut().for_each(|w| *w = 0);
    }

    pub fn read_byte(&self, addr: usize) -> u8 {
        let addr = addr % FX_SIZE;
        match &self.sectors[addr / SECTOR_BYTES] {
            Some(sector) => sector[addr % SECTOR_BYTES],
            None => 0xFF,
        }
    }

    fn sector_mut(&mut self, index: usize) -> &mut Vec<u8> {
        self.sectors[index].get_or_insert_with(|| vec![0xFF; SECTOR_BYTES])
    }

    /// Copy `bytes` into flash starting at `addr`, allocating sectors as
    /// needed. Data past the end of the chip is dropped.
    pub fn write_bytes(&mut self, addr: usize, bytes: &[u8]) {
        let end = (addr + bytes.len()).min(FX_SIZE);
        let mut a = addr;
        while a < end {
            let offset = a % SECTOR_BYTES;
            let n = (SECTOR_BYTES - offset).min(end - a);
            let src = &bytes[a - addr..a - addr + n];
            self.sector_mut(a / SECTOR_BYTES)[offset..offset + n].copy_from_slice(src);
            a += n;
        }
    }

    fn program_byte(&mut self, addr: usize, byte: u8) {
        let sector = self.sector_mut(addr / SECTOR_BYTES);
        sector[addr % SECTOR_BYTES] &= byte;
    }

    fn mark_modified(&mut self, addr: u32) {
        let sector = (addr as usize) / SECTOR_BYTES;
        self.sectors_modified[sector / 64] |= 1 << (sector % 64);
        self.sectors_dirty = true;
    }

    /// Sector indices written by the firmware.
    pub fn modified_sectors(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_SECTORS).filter(|&s| self.sectors_modified[s / 64] & (1 << (s % 64)) != 0)
    }

    /// Contents of sector `index`; erased sectors read as 0xFF.
    pub(crate) fn sector_data(&self, index: usize) -> Vec<u8> {
        match &self.sectors[index] {
            Some(sector) => sector.clone(),
            None => vec![0xFF; SECTOR_BYTES],
        }
    }

    /// Replace a whole sector with restored save data and count it as
    /// written by the firmware.
    pub(crate) fn restore_sector(&mut self, index: usize, bytes: &[u8]) {
        self.sector_mut(index).copy_from_slice(bytes);
        self.mark_modified((index * SECTOR_BYTES) as u32);
    }

    /// Total bytes in allocated sectors.
    pub fn allocated_bytes(&self) -> usize {
        self.sectors.iter().flatten().count() * SECTOR_BYTES
    }

    /// Sector table shape is intact (checked on savestate load).
    pub(crate) fn is_consistent(&self) -> bool {
        self.sectors.len() == NUM_SECTORS
            && self.sectors_modified.len() == NUM_SECTORS / 64
            && self.sectors.iter().flatten().all(|s| s.len() == SECTOR_BYTES)
    }

    pub fn is_busy(&self) -> bool {
        self.busy_ps_rem != 0
    }

    /// Drive the chip select. Deselecting ends the current command.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.state = FxState::Idle;
            if self.busy_ps_rem == 0 {
                self.last_command = 0;
            }
        }
    }

    /// Let `ps` picoseconds of busy time elapse.
    pub fn advance(&mut self, ps: u64) {
        if ps >= self.busy_ps_rem {
            if self.busy_ps_rem != 0 && !self.enabled {
                self.last_command = 0;
            }
            self.busy_ps_rem = 0;
        } else {
            self.busy_ps_rem -= ps;
        }
    }

    fn status(&self) -> u8 {
        self.is_busy() as u8
    }

    fn shift_addr(&mut self, byte: u8) {
        self.addr = ((self.addr << 8) | byte as u32) & ADDR_MASK;
    }

    fn read_next(&mut self) -> u8 {
        let v = self.read_byte(self.addr as usize);
        self.addr = (self.addr + 1) & ADDR_MASK;
        v
    }

    /// Exchange one SPI byte. Returns the byte to shift in on the next
    /// transfer.
    pub fn spi_transceive(&mut self, byte: u8) -> u8 {
        if !self.enabled {
            return 0;
        }
        self.busy_error = false;

        match self.state {
            FxState::Idle if !self.woken_up => {
                if byte == 0xAB {
                    self.woken_up = true;
                    self.last_command = byte;
                    self.state = FxState::Releasing(0);
                }
                0
            }
            FxState::Idle => self.command(byte),
            FxState::ReadAddr(n) => {
                self.shift_addr(byte);
                if n < 2 {
                    self.state = FxState::ReadAddr(n + 1);
                    0
                } else {
                    self.state = FxState::Reading;
                    self.read_next()
                }
            }
            FxState::Reading => self.read_next(),
            FxState::ProgAddr(n) => {
                self.shift_addr(byte);
                self.state = if n < 2 { FxState::ProgAddr(n + 1) } else { FxState::Programming };
                0
            }
            FxState::Programming => {
                let addr = self.addr;
                self.mark_modified(addr);
                self.program_byte(addr as usize, byte);
                self.addr = (addr & !0xFF) | ((addr + 1) & 0xFF);
                self.busy_ps_rem = PROGRAM_BYTE_PS;
                0
            }
            FxState::EraseAddr(n) => {
                self.shift_addr(byte);
                if n < 2 {
                    self.state = FxState::EraseAddr(n + 1);
                } else {
                    let addr = self.addr & !(SECTOR_BYTES as u32 - 1);
                    self.mark_modified(addr);
                    self.sectors[addr as usize / SECTOR_BYTES] = None;
                    self.busy_ps_rem = SECTOR_ERASE_PS;
                    self.state = FxState::Done;
                }
                0
            }
            FxState::ReadStatus => self.status(),
            FxState::JedecId(n) => {
                if n == 0 {
                    self.state = FxState::JedecId(1);
                    JEDEC_TYPE
                } else {
                    self.state = FxState::Idle;
                    JEDEC_CAP
                }
            }
            FxState::Releasing(n) => {
                self.state = if n < 2 { FxState::Releasing(n + 1) } else { FxState::Idle };
                0
            }
            FxState::Done => 0,
        }
    }

    fn command(&mut self, byte: u8) -> u8 {
        let busy = self.is_busy();
        if busy && byte != 0x05 && byte != 0x06 {
            debug!(command = byte, "FX command while busy");
            self.busy_error = true;
        }
        self.last_command = byte;
        self.state = FxState::Done;
        match byte {
            0x02 if self.write_enabled && !busy => {
                self.addr = 0;
                self.state = FxState::ProgAddr(0);
            }
            0x03 if !busy => {
                self.addr = 0;
                self.state = FxState::ReadAddr(0);
            }
            0x04 if !busy => self.write_enabled = false,
            0x05 => {
                self.state = FxState::ReadStatus;
                return self.status();
            }
            0x06 if !busy => self.write_enabled = true,
            0x20 if self.write_enabled && !busy => {
                self.addr = 0;
                self.state = FxState::EraseAddr(0);
            }
            0x9F => {
                self.state = FxState::JedecId(0);
                return JEDEC_MFR;
            }
            0xB9 => self.woken_up = false,
            0x02 | 0x03 | 0x04 | 0x06 | 0x20 => {}
            _ => {
                self.last_command = 0;
                self.state = FxState::Idle;
            }
        }
        0
    }
}

impl Default for FxFlash {
    fn default() -> Self {
        Self::new()
    }
}
