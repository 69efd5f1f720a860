//! ATmega32u4 memory subsystem.
//!
//! The memory model follows the AVR unified data-space layout:
//!
//! | Address Range | Content                      |
//! |---------------|------------------------------|
//! | 0x0000–0x001F | General registers R0–R31     |
//! | 0x0020–0x00FF | I/O + extended I/O registers |
//! | 0x0100–0x0AFF | SRAM (2560 bytes)            |
//!
//! SREG and the stack pointer live inside the I/O window, so there is exactly
//! one copy of every architectural register. Flash (32 KB) and EEPROM (1 KB)
//! are separate address spaces.

use serde::{Deserialize, Serialize};

use crate::peripherals::{PINB, PINE, PINF};
use crate::{DATA_SIZE, EEPROM_SIZE, FLASH_SIZE, FLASH_WORDS, SPH_ADDR, SPL_ADDR, SREG_ADDR};

/// ATmega32u4 memory model containing data space, flash, and EEPROM.
#[derive(Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Unified data space: registers (0x00-0x1F) + I/O (0x20-0xFF) + SRAM (0x100+)
    pub data: Vec<u8>,
    /// Program memory (flash)
    pub flash: Vec<u8>,
    /// EEPROM
    pub eeprom: Vec<u8>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: vec![0u8; DATA_SIZE],
            flash: vec![0u8; FLASH_SIZE],
            eeprom: vec![0xFFu8; EEPROM_SIZE],
        }
    }

    /// Clear the data space, keeping the input pin latches (buttons).
    pub fn clear_data(&mut self) {
        let pins = [PINB, PINE, PINF].map(|a| (a, self.data[a as usize]));
        self.data.iter_mut().for_each(|b| *b = 0);
        for (a, v) in pins {
            self.data[a as usize] = v;
        }
    }

    // --- Register access ---

    #[inline(always)]
    pub fn reg(&self, r: u8) -> u8 {
        self.data[r as usize]
    }

    #[inline(always)]
    pub fn set_reg(&mut self, r: u8, v: u8) {
        self.data[r as usize] = v;
    }

    /// Read the 16-bit register pair starting at `r` (low byte in `r`).
    #[inline(always)]
    pub fn reg_word(&self, r: u8) -> u16 {
        let r = r as usize;
        self.data[r] as u16 | ((self.data[r + 1] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_reg_word(&mut self, r: u8, v: u16) {
        let r = r as usize;
        self.data[r] = v as u8;
        self.data[r + 1] = (v >> 8) as u8;
    }

    #[inline(always)]
    pub fn x(&self) -> u16 {
        self.reg_word(26)
    }

    #[inline(always)]
    pub fn y(&self) -> u16 {
        self.reg_word(28)
    }

    #[inline(always)]
    pub fn z(&self) -> u16 {
        self.reg_word(30)
    }

    #[inline(always)]
    pub fn set_z(&mut self, v: u16) {
        self.set_reg_word(30, v);
    }

    // --- SREG / SP (memory-mapped) ---

    #[inline(always)]
    pub fn sreg(&self) -> u8 {
        self.data[SREG_ADDR as usize]
    }

    #[inline(always)]
    pub fn set_sreg(&mut self, v: u8) {
        self.data[SREG_ADDR as usize] = v;
    }

    #[inline(always)]
    pub fn flag(&self, bit: u8) -> bool {
        self.sreg() & (1 << bit) != 0
    }

    #[inline(always)]
    pub fn sp(&self) -> u16 {
        self.data[SPL_ADDR as usize] as u16 | ((self.data[SPH_ADDR as usize] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_sp(&mut self, v: u16) {
        self.data[SPL_ADDR as usize] = v as u8;
        self.data[SPH_ADDR as usize] = (v >> 8) as u8;
    }

    // --- Program memory ---

    /// Read 16-bit word from flash at word address (wraps at the flash size).
    #[inline(always)]
    pub fn read_program_word(&self, word_addr: usize) -> u16 {
        let byte_addr = (word_addr % FLASH_WORDS) * 2;
        self.flash[byte_addr] as u16 | ((self.flash[byte_addr + 1] as u16) << 8)
    }

    /// Read single byte from flash at byte address; beyond flash reads 0.
    #[inline(always)]
    pub fn read_flash_byte(&self, byte_addr: usize) -> u8 {
        self.flash.get(byte_addr).copied().unwrap_or(0)
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_pair() {
        let mut mem = Memory::new();
        mem.set_z(0x1234);
        assert_eq!(mem.z(), 0x1234);
        assert_eq!(mem.data[30], 0x34);
        assert_eq!(mem.data[31], 0x12);
        mem.set_reg_word(24, 0xBEEF);
        assert_eq!(mem.reg(24), 0xEF);
        assert_eq!(mem.reg(25), 0xBE);
    }

    #[test]
    fn test_program_word_wraps() {
        let mut mem = Memory::new();
        mem.flash[0] = 0x0C;
        mem.flash[1] = 0x94;
        assert_eq!(mem.read_program_word(0), 0x940C);
        assert_eq!(mem.read_program_word(FLASH_WORDS), 0x940C);
        assert_eq!(mem.read_flash_byte(FLASH_SIZE + 5), 0);
    }

    #[test]
    fn test_stack_pointer_is_memory_mapped() {
        let mut mem = Memory::new();
        mem.set_sp(0x0AFF);
        assert_eq!(mem.data[0x5D], 0xFF);
        assert_eq!(mem.data[0x5E], 0x0A);
        assert_eq!(mem.sp(), 0x0AFF);
    }

    #[test]
    fn test_clear_data_keeps_pins() {
        let mut mem = Memory::new();
        mem.data[PINF as usize] = 0xF0;
        mem.data[0x200] = 0x55;
        mem.clear_data();
        assert_eq!(mem.data[PINF as usize], 0xF0);
        assert_eq!(mem.data[0x200], 0);
    }
}
