//! PLL frequency synthesizer emulation.
//!
//! Only the lock handshake is modeled: after PLLE is set, PLOCK rises once
//! the PLL has been running for 3 ms. Clearing PLLE drops the lock.

use serde::{Deserialize, Serialize};

use super::PLLCSR;

const PLOCK: u8 = 1 << 0;
const PLLE: u8 = 1 << 1;

/// 3 ms at 16 MHz.
const LOCK_CYCLES: u64 = 16_000_000 * 3 / 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pll {
    lock_cycle: u64,
    pub busy: bool,
}

impl Pll {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Pll::new();
    }

    /// Store to PLLCSR. PLOCK is read-only.
    pub fn store(&mut self, data: &mut [u8], mut v: u8) {
        let csr = &mut data[PLLCSR as usize];
        if v & PLLE == 0 {
            self.lock_cycle = 0;
            self.busy = false;
            *csr &= !PLOCK;
        } else {
            self.busy = *csr & PLOCK == 0;
        }
        v = (v & !PLOCK) | (*csr & PLOCK);
        *csr = v;
    }

    pub fn tick(&mut self, data: &mut [u8], cycles: u32) {
        if !self.busy {
            return;
        }
        self.lock_cycle += cycles as u64;
        if self.lock_cycle >= LOCK_CYCLES {
            data[PLLCSR as usize] |= PLOCK;
            self.busy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SIZE;

    #[test]
    fn test_lock_after_3ms() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut pll = Pll::new();
        pll.store(&mut data, PLLE | 0x10);
        pll.tick(&mut data, (LOCK_CYCLES - 1) as u32);
        assert_eq!(data[PLLCSR as usize] & PLOCK, 0);
        pll.tick(&mut data, 1);
        assert_eq!(data[PLLCSR as usize], PLLE | 0x10 | PLOCK);
    }

    #[test]
    fn test_disable_drops_lock() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut pll = Pll::new();
        pll.store(&mut data, PLLE);
        pll.tick(&mut data, LOCK_CYCLES as u32);
        pll.store(&mut data, PLOCK);
        assert_eq!(data[PLLCSR as usize], 0);
        assert!(!pll.busy);
    }
}
