//! EEPROM controller emulation.
//!
//! The 1 KB EEPROM array lives in [`Memory::eeprom`](crate::memory::Memory);
//! this controller models the EECR handshake around it. Setting EEMPE opens
//! a four cycle window in which EEPE starts a program operation, and the
//! byte is committed only after the programming time has elapsed. Reads
//! through EERE complete at once but stall the CPU for four cycles.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EEARH, EEARL, EECR, EEDR};

const EEMPE: u8 = 1 << 2;
const EEPE: u8 = 1 << 1;
const EERE: u8 = 1 << 0;

/// Erase and write, 3.4 ms.
const ERASE_WRITE_CYCLES: u32 = 16 * 3400;
/// Erase only or write only, 1.8 ms.
const HALF_OP_CYCLES: u32 = 16 * 1800;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EepromCtrl {
    clear_eempe_cycles: u32,
    write_addr: u16,
    write_data: u8,
    pub program_cycles: u32,
    busy: bool,
}

fn eear(data: &[u8]) -> u16 {
    (data[EEARL as usize] as u16 | ((data[EEARH as usize] as u16) << 8)) & 0x3FF
}

impl EepromCtrl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Store to EECR. Returns true when the CPU must stall for a read.
    pub fn store_eecr(&mut self, data: &mut [u8], eeprom: &[u8], mut v: u8) -> bool {
        let old = data[EECR as usize];
        let addr = eear(data);

        if v & EEMPE != 0 {
            self.clear_eempe_cycles = 5;
            self.busy = true;
        }

        if self.program_cycles == 0 && v & EEPE != 0 {
            if old & EEMPE == 0 {
                v &= !EEPE;
            } else {
                let eedr = data[EEDR as usize];
                let (cycles, byte) = match (v >> 4) & 0x3 {
                    0 => (ERASE_WRITE_CYCLES, eedr),
                    1 => (HALF_OP_CYCLES, 0xFF),
                    2 => (HALF_OP_CYCLES, eedr & eeprom[addr as usize]),
                    _ => (0, 0),
                };
                if cycles != 0 {
                    debug!(addr, byte, cycles, "EEPROM programming started");
                    self.program_cycles = cycles;
                    self.write_addr = addr;
                    self.write_data = byte;
                    self.busy = true;
                }
            }
        }

        let mut stall = false;
        if v & EERE != 0 {
            v &= !EERE;
            data[EEDR as usize] = eeprom[addr as usize];
            stall = true;
        }

        data[EECR as usize] = v;
        stall
    }

    pub fn tick(&mut self, data: &mut [u8], eeprom: &mut [u8], cycles: u32) {
        if !self.busy {
            return;
        }
        let eecr = &mut data[EECR as usize];

        if self.clear_eempe_cycles != 0 {
            if self.clear_eempe_cycles <= cycles {
                self.clear_eempe_cycles = 0;
                *eecr &= !EEMPE;
                if self.program_cycles == 0 {
                    self.busy = false;
                }
            } else {
                self.clear_eempe_cycles -= cycles;
            }
        }

        if self.program_cycles != 0 {
            *eecr |= EEPE;
            if self.program_cycles <= cycles {
                self.program_cycles = 0;
                *eecr &= !EEPE;
                eeprom[self.write_addr as usize] = self.write_data;
                self.busy = false;
            } else {
                self.program_cycles -= cycles;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DATA_SIZE, EEPROM_SIZE};

    fn setup(addr: u16, value: u8) -> (EepromCtrl, Vec<u8>, Vec<u8>) {
        let mut data = vec![0u8; DATA_SIZE];
        data[EEARL as usize] = addr as u8;
        data[EEARH as usize] = (addr >> 8) as u8;
        data[EEDR as usize] = value;
        (EepromCtrl::new(), data, vec![0xFF; EEPROM_SIZE])
    }

    #[test]
    fn test_write_sequence() {
        let (mut ee, mut data, mut eeprom) = setup(0x123, 0x42);
        ee.store_eecr(&mut data, &eeprom, EEMPE);
        ee.tick(&mut data, &mut eeprom, 1);
        ee.store_eecr(&mut data, &eeprom, EEMPE | EEPE);
        assert_eq!(ee.program_cycles, ERASE_WRITE_CYCLES);
        ee.tick(&mut data, &mut eeprom, ERASE_WRITE_CYCLES - 1);
        assert_eq!(eeprom[0x123], 0xFF);
        assert_ne!(data[EECR as usize] & EEPE, 0);
        ee.tick(&mut data, &mut eeprom, 1);
        assert_eq!(eeprom[0x123], 0x42);
        assert_eq!(data[EECR as usize] & (EEPE | EEMPE), 0);
    }

    #[test]
    fn test_eepe_without_eempe_is_ignored() {
        let (mut ee, mut data, mut eeprom) = setup(0x10, 0x00);
        ee.store_eecr(&mut data, &eeprom, EEPE);
        assert_eq!(ee.program_cycles, 0);
        assert_eq!(data[EECR as usize] & EEPE, 0);
        ee.tick(&mut data, &mut eeprom, 100_000);
        assert_eq!(eeprom[0x10], 0xFF);
    }

    #[test]
    fn test_eempe_window_expires() {
        let (mut ee, mut data, mut eeprom) = setup(0x10, 0x00);
        ee.store_eecr(&mut data, &eeprom, EEMPE);
        ee.tick(&mut data, &mut eeprom, 5);
        assert_eq!(data[EECR as usize] & EEMPE, 0);
        ee.store_eecr(&mut data, &eeprom, EEPE);
        assert_eq!(ee.program_cycles, 0);
    }

    #[test]
    fn test_write_only_ands_existing_byte() {
        let (mut ee, mut data, mut eeprom) = setup(0x20, 0x0F);
        eeprom[0x20] = 0x3C;
        ee.store_eecr(&mut data, &eeprom, EEMPE | 0x20);
        ee.store_eecr(&mut data, &eeprom, EEMPE | EEPE | 0x20);
        ee.tick(&mut data, &mut eeprom, HALF_OP_CYCLES);
        assert_eq!(eeprom[0x20], 0x0C);
    }

    #[test]
    fn test_read_stalls() {
        let (mut ee, mut data, mut eeprom) = setup(0x3FF, 0);
        eeprom[0x3FF] = 0x99;
        assert!(ee.store_eecr(&mut data, &eeprom, EERE));
        assert_eq!(data[EEDR as usize], 0x99);
        assert_eq!(data[EECR as usize] & EERE, 0);
    }
}
