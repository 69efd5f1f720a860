//! SPI master controller emulation.
//!
//! Transfers are clocked: after a store to SPDR the byte is shifted out one
//! bit per SPI clock (CPU clock divided by the SPR/SPI2X setting) while the
//! slave's response is shifted in. When the eighth bit has moved SPIF is
//! raised and [`Spi::done`] tells the board to hand the byte to whichever
//! device is selected.

use serde::{Deserialize, Serialize};

use super::{SPCR, SPDR, SPSR};

const SPE: u8 = 1 << 6;
const DORD: u8 = 1 << 5;
const MSTR: u8 = 1 << 4;

const SPIF: u8 = 1 << 7;
const WCOL: u8 = 1 << 6;

/// CPU cycles per SPI clock, indexed by `SPI2X:SPR1:SPR0`.
const CLOCK_CYCLES: [u32; 8] = [4, 16, 64, 128, 2, 8, 32, 64];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spi {
    pub clock_cycles: u32,
    clock_cycle: u32,
    bit_progress: u8,
    pub busy: bool,
    /// SPSR was read while SPIF was set; the next SPDR access clears it
    pub read_after_transmit: bool,
    /// Byte shifted out by the last transfer
    pub data_out: u8,
    /// Byte the slave shifts in during the next transfer
    pub data_in: u8,
    /// A transfer completed during the last tick
    pub done: bool,
}

impl Spi {
    pub fn new() -> Self {
        Spi {
            clock_cycles: 4,
            clock_cycle: 0,
            bit_progress: 0,
            busy: false,
            read_after_transmit: false,
            data_out: 0,
            data_in: 0,
            done: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Spi::new();
    }

    /// Store to SPCR or SPSR. Only SPI2X is writable in SPSR.
    pub fn store_control(&mut self, data: &mut [u8], addr: u16, v: u8) {
        if addr == SPSR {
            let spsr = &mut data[SPSR as usize];
            *spsr = (*spsr & !0x01) | (v & 0x01);
        } else {
            data[SPCR as usize] = v;
        }
        let n = ((data[SPSR as usize] & 0x1) << 2) | (data[SPCR as usize] & 0x3);
        self.clock_cycles = CLOCK_CYCLES[n as usize];
    }

    /// Store to SPDR. Returns true on a write collision.
    pub fn store_data(&mut self, data: &mut [u8], v: u8) -> bool {
        if data[SPCR as usize] & SPE == 0 {
            data[SPDR as usize] = v;
            self.busy = false;
            return false;
        }
        if self.busy {
            data[SPSR as usize] |= WCOL;
            return true;
        }
        if self.read_after_transmit {
            data[SPSR as usize] &= !(SPIF | WCOL);
            self.read_after_transmit = false;
        }
        data[SPDR as usize] = v;
        self.data_out = 0;
        self.clock_cycle = 0;
        self.bit_progress = 0;
        self.busy = true;
        false
    }

    /// Load from SPSR.
    pub fn load_status(&mut self, data: &[u8]) -> u8 {
        let spsr = data[SPSR as usize];
        if spsr & SPIF != 0 {
            self.read_after_transmit = true;
        }
        spsr
    }

    /// Load from SPDR: completes the SPIF clearing sequence.
    pub fn load_data(&mut self, data: &mut [u8]) -> u8 {
        if self.read_after_transmit {
            data[SPSR as usize] &= !(SPIF | WCOL);
            self.read_after_transmit = false;
        }
        data[SPDR as usize]
    }

    pub fn tick(&mut self, data: &mut [u8], cycles: u32) {
        let spcr = data[SPCR as usize];
        if spcr & SPE == 0 {
            self.busy = false;
            return;
        }
        if !self.busy || spcr & MSTR == 0 {
            return;
        }

        self.clock_cycle += cycles;
        let mut iters = self.clock_cycle / self.clock_cycles;
        self.clock_cycle %= self.clock_cycles;

        let mut spdr = data[SPDR as usize];
        while iters > 0 {
            iters -= 1;
            let b = if spcr & DORD != 0 {
                let b = spdr & 0x1;
                spdr = (spdr >> 1) | (self.data_in & 0x80);
                b
            } else {
                let b = spdr >> 7;
                spdr = (spdr << 1) | (self.data_in >> 7);
                b
            };
            self.data_in <<= 1;
            self.data_out = (self.data_out << 1) | b;

            self.bit_progress += 1;
            if self.bit_progress == 8 {
                self.done = true;
                self.busy = false;
                data[SPSR as usize] |= SPIF;
                break;
            }
        }
        data[SPDR as usize] = spdr;
    }
}

impl Default for Spi {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SIZE;

    fn master() -> (Spi, Vec<u8>) {
        let mut data = vec![0u8; DATA_SIZE];
        let mut spi = Spi::new();
        // SPE | MSTR, SPI2X: clk/2
        spi.store_control(&mut data, SPCR, SPE | MSTR);
        spi.store_control(&mut data, SPSR, 0x01);
        (spi, data)
    }

    #[test]
    fn test_clock_selection() {
        let (spi, _) = master();
        assert_eq!(spi.clock_cycles, 2);
    }

    #[test]
    fn test_transfer_takes_eight_clocks() {
        let (mut spi, mut data) = master();
        spi.data_in = 0x5A;
        assert!(!spi.store_data(&mut data, 0xC3));
        spi.tick(&mut data, 15);
        assert!(!spi.done);
        assert_eq!(data[SPSR as usize] & SPIF, 0);
        spi.tick(&mut data, 1);
        assert!(spi.done);
        assert_eq!(spi.data_out, 0xC3);
        assert_eq!(data[SPDR as usize], 0x5A);
        assert_eq!(data[SPSR as usize] & SPIF, SPIF);
    }

    #[test]
    fn test_write_collision() {
        let (mut spi, mut data) = master();
        spi.store_data(&mut data, 0x01);
        spi.tick(&mut data, 4);
        assert!(spi.store_data(&mut data, 0x02));
        assert_eq!(data[SPSR as usize] & WCOL, WCOL);
    }

    #[test]
    fn test_spif_cleared_by_status_then_data() {
        let (mut spi, mut data) = master();
        spi.store_data(&mut data, 0xFF);
        spi.tick(&mut data, 16);
        assert_ne!(spi.load_status(&data) & SPIF, 0);
        spi.load_data(&mut data);
        assert_eq!(data[SPSR as usize] & SPIF, 0);
    }

    #[test]
    fn test_lsb_first() {
        let (mut spi, mut data) = master();
        spi.store_control(&mut data, SPCR, SPE | MSTR | DORD);
        spi.store_data(&mut data, 0x01);
        spi.tick(&mut data, 16);
        assert_eq!(spi.data_out, 0x80);
    }
}
