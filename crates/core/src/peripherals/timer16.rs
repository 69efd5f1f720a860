//! 16-bit Timer/Counter1 and Timer/Counter3 emulation.
//!
//! Same lazy evaluation scheme as [`Timer8`](super::Timer8): the counter is
//! only advanced when its next event is due or when a register is accessed.
//! All sixteen WGM modes are resolved, including phase and frequency correct
//! PWM with OCR updates at BOTTOM. Timer3's compare output A drives PC6, the
//! Arduboy speaker pin, whenever DDRC6 is set.
//!
//! TCNTn is accessed through the shared TEMP byte like the real part: the
//! high byte is latched when the low byte is read and committed when the low
//! byte is written.

use serde::{Deserialize, Serialize};

use super::{
    increase_counter, io_word, min_nonzero, DDRC, DIVIDERS, PORTC, PRR0, PRR1, TIFR1, TIFR3,
    TIMER1_BASE, TIMER3_BASE,
};

const PC6: u8 = 1 << 6;

/// Resolve TOP and the overflow point for a 16-bit WGM mode.
fn process_wgm16(wgm: u32, ocr_a: u32, icr: u32) -> (u32, u32) {
    let (top, tov) = match wgm {
        0x1 => (0x00FF, 0x0000), // PWM, phase correct, 8-bit
        0x2 => (0x01FF, 0x0000), // PWM, phase correct, 9-bit
        0x3 => (0x03FF, 0x0000), // PWM, phase correct, 10-bit
        0x4 => (ocr_a, 0xFFFF),  // CTC
        0x5 => (0x00FF, 0xFFFF), // fast PWM, 8-bit
        0x6 => (0x01FF, 0xFFFF), // fast PWM, 9-bit
        0x7 => (0x03FF, 0xFFFF), // fast PWM, 10-bit
        0x8 => (icr, 0x0000),    // PWM, phase and frequency correct
        0x9 => (ocr_a, 0x0000),  // PWM, phase and frequency correct
        0xA => (icr, 0x0000),    // PWM, phase correct
        0xB => (ocr_a, 0x0000),  // PWM, phase correct
        0xC => (icr, 0xFFFF),    // CTC
        0xE => (icr, 0xFFFF),    // fast PWM
        0xF => (ocr_a, 0xFFFF),  // fast PWM
        _ => (0xFFFF, 0xFFFF),   // normal, reserved
    };
    (top.max(3), tov)
}

/// PRTIM1 in PRR0 and PRTIM3 in PRR1 share this bit.
const PRTIM: u8 = 1 << 3;

/// Which 16-bit timer a [`Timer16`] emulates. The unit fixes the register
/// block, so a decoded timer can never address outside the I/O space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timer16Unit {
    Timer1,
    Timer3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer16 {
    unit: Timer16Unit,

    pub tcnt: u32,
    pub count_down: bool,
    pub phase_correct: bool,
    fast_pwm: bool,
    update_ocr_at_top: bool,
    update_ocr_at_bottom: bool,
    /// Active (buffered) OCRnA/B/C
    pub ocr: [u32; 3],
    pub top: u32,
    pub tov: u32,
    com_a: u8,
    pub divider: u32,
    divider_cycle: u32,
    prev_update_cycle: u64,
    pub next_update_cycle: u64,
    /// TEMP register for 16-bit TCNT access
    temp: u8,
}

impl Timer16 {
    fn with_unit(unit: Timer16Unit) -> Self {
        Timer16 {
            unit,
            tcnt: 0,
            count_down: false,
            phase_correct: false,
            fast_pwm: false,
            update_ocr_at_top: false,
            update_ocr_at_bottom: false,
            ocr: [0; 3],
            top: 0xFFFF,
            tov: 0xFFFF,
            com_a: 0,
            divider: 0,
            divider_cycle: 0,
            prev_update_cycle: 0,
            next_update_cycle: u64::MAX,
            temp: 0,
        }
    }

    /// Timer/Counter1 (powered down by PRR0.PRTIM1).
    pub fn timer1() -> Self {
        Self::with_unit(Timer16Unit::Timer1)
    }

    /// Timer/Counter3 (powered down by PRR1.PRTIM3, OC3A on PC6).
    pub fn timer3() -> Self {
        Self::with_unit(Timer16Unit::Timer3)
    }

    /// Power-on state keeping the unit.
    pub fn reset(&mut self) {
        *self = Self::with_unit(self.unit);
    }

    pub fn unit(&self) -> Timer16Unit {
        self.unit
    }

    /// Address of TCCRnA; the rest of the block follows it.
    fn base(&self) -> u16 {
        match self.unit {
            Timer16Unit::Timer1 => TIMER1_BASE,
            Timer16Unit::Timer3 => TIMER3_BASE,
        }
    }

    fn tifr_addr(&self) -> u16 {
        match self.unit {
            Timer16Unit::Timer1 => TIFR1,
            Timer16Unit::Timer3 => TIFR3,
        }
    }

    fn prr_addr(&self) -> u16 {
        match self.unit {
            Timer16Unit::Timer1 => PRR0,
            Timer16Unit::Timer3 => PRR1,
        }
    }

    /// Compare output A is wired to PC6 (Timer3 only).
    fn drives_oc_a(&self) -> bool {
        self.unit == Timer16Unit::Timer3
    }

    fn addr(&self, offset: u16) -> usize {
        (self.base() + offset) as usize
    }

    fn wgm(&self, data: &[u8]) -> u32 {
        (data[self.addr(0)] & 0x3) as u32 | ((data[self.addr(1)] >> 1) & 0xC) as u32
    }

    fn stopped(&self, data: &[u8]) -> bool {
        self.divider == 0 || data[self.prr_addr() as usize] & PRTIM != 0
    }

    fn load_ocr(&mut self, data: &[u8]) {
        self.ocr = [
            io_word(data, self.base() + 0x8),
            io_word(data, self.base() + 0xA),
            io_word(data, self.base() + 0xC),
        ];
        let icr = io_word(data, self.base() + 0x6);
        let (top, tov) = process_wgm16(self.wgm(data), self.ocr[0], icr);
        self.top = top;
        self.tov = tov;
    }

    /// Drive OCnA after a compare match (`at_bottom == false`) or when a
    /// fast PWM cycle restarts (`at_bottom == true`).
    fn compare_output(&self, data: &mut [u8], at_bottom: bool) {
        if !self.drives_oc_a() || data[DDRC as usize] & PC6 == 0 {
            return;
        }
        let portc = &mut data[PORTC as usize];
        match (self.com_a, at_bottom) {
            (1, false) => *portc ^= PC6,
            (2, false) | (3, true) => *portc &= !PC6,
            (3, false) | (2, true) => *portc |= PC6,
            _ => {}
        }
    }

    /// Bring TCNTn/TIFRn up to date with cycle `now`.
    pub fn catch_up(&mut self, data: &mut [u8], now: u64) {
        if !self.stopped(data) {
            let cycles = now.saturating_sub(self.prev_update_cycle);
            self.run(data, cycles);
        }
        self.prev_update_cycle = now;
    }

    pub fn update(&mut self, data: &mut [u8], now: u64) {
        self.catch_up(data, now);
        self.configure(data, now);
    }

    /// Store to a control/compare register of this timer.
    pub fn store_reg(&mut self, data: &mut [u8], now: u64, addr: u16, v: u8) {
        self.catch_up(data, now);
        data[addr as usize] = v;
        self.configure(data, now);
    }

    /// Store to TCNTnL/TCNTnH.
    pub fn store_tcnt(&mut self, data: &mut [u8], now: u64, addr: u16, v: u8) {
        if addr == self.base() + 5 {
            self.temp = v;
            return;
        }
        self.catch_up(data, now);
        data[self.addr(4)] = v;
        data[self.addr(5)] = self.temp;
        self.tcnt = ((self.temp as u32) << 8) | v as u32;
        self.configure(data, now);
    }

    /// Load from TCNTnL/TCNTnH.
    pub fn load_tcnt(&mut self, data: &mut [u8], now: u64, addr: u16) -> u8 {
        if addr == self.base() + 5 {
            return self.temp;
        }
        self.catch_up(data, now);
        self.temp = data[self.addr(5)];
        data[self.addr(4)]
    }

    /// Restart the prescaler (GTCCR.PSRSYNC).
    pub fn reset_prescaler(&mut self) {
        self.divider_cycle = 0;
    }

    fn run(&mut self, data: &mut [u8], cycles: u64) {
        let mut ticks = increase_counter(&mut self.divider_cycle, cycles, self.divider);
        let mut tifr = data[self.tifr_addr() as usize] & 0xF;

        while ticks > 0 {
            let tcnt = self.tcnt;
            let top = self.top;
            for (i, &ocr) in self.ocr.iter().enumerate() {
                if tcnt == ocr {
                    tifr |= 0x2 << i;
                }
            }
            if self.count_down {
                if tcnt == 0 {
                    self.count_down = false;
                    continue;
                }
                let stop = self.ocr.iter().copied().filter(|&o| o < tcnt).max().unwrap_or(0);
                let t = ((tcnt - stop) as u64).min(ticks);
                ticks -= t;
                self.tcnt -= t as u32;
                if self.tcnt == self.ocr[0] {
                    self.compare_output(data, false);
                }
                if self.tcnt == 0 {
                    tifr |= 0x1;
                    self.count_down = false;
                    if self.update_ocr_at_bottom {
                        self.load_ocr(data);
                    }
                }
            } else if tcnt == top {
                ticks -= 1;
                if self.phase_correct {
                    self.count_down = true;
                    self.tcnt -= 1;
                } else {
                    tifr |= 0x1;
                    self.tcnt = 0;
                    if self.fast_pwm {
                        self.compare_output(data, true);
                    }
                }
                if self.update_ocr_at_top {
                    self.load_ocr(data);
                }
            } else if tcnt > top {
                let t = ((0x10000 - tcnt) as u64).min(ticks);
                ticks -= t;
                self.tcnt += t as u32;
                if self.tcnt >= 0x10000 {
                    self.tcnt = 0;
                    tifr |= 0x1;
                }
            } else {
                let stop = self.ocr.iter().copied().filter(|&o| o > tcnt).fold(top, u32::min);
                let t = ((stop - tcnt) as u64).min(ticks);
                ticks -= t;
                self.tcnt += t as u32;
                if self.tcnt == self.ocr[0] {
                    self.compare_output(data, false);
                }
            }
        }

        data[self.tifr_addr() as usize] |= tifr;
        data[self.addr(4)] = self.tcnt as u8;
        data[self.addr(5)] = (self.tcnt >> 8) as u8;
    }

    /// Re-read TCCRnA/B, OCRn and ICRn and schedule the next update.
    pub fn configure(&mut self, data: &mut [u8], now: u64) {
        self.divider = DIVIDERS[(data[self.addr(1)] & 0x7) as usize];
        if self.stopped(data) {
            self.next_update_cycle = u64::MAX;
            return;
        }

        let wgm = self.wgm(data);
        let mask = 1u32 << wgm;
        if mask & 0x1011 != 0 {
            self.load_ocr(data);
        }
        self.update_ocr_at_bottom = mask & 0x0300 != 0;
        self.update_ocr_at_top = mask & 0xCCEE != 0;
        if self.update_ocr_at_bottom && self.tcnt == 0 {
            self.load_ocr(data);
        }
        let icr = io_word(data, self.base() + 0x6);
        let (top, tov) = process_wgm16(wgm, self.ocr[0], icr);
        self.top = top;
        self.tov = tov;
        self.phase_correct = mask & 0x0F0E != 0;
        self.fast_pwm = mask & 0xC0E0 != 0;
        if !self.phase_correct {
            self.count_down = false;
        }
        self.com_a = data[self.addr(0)] >> 6;

        let tcnt = self.tcnt as i64;
        let top = self.top;
        let mut ticks = u32::MAX;
        if self.count_down {
            ticks = min_nonzero(ticks, top, tcnt);
            for &ocr in &self.ocr {
                ticks = min_nonzero(ticks, top, tcnt - ocr as i64);
            }
        } else {
            let edge = if self.phase_correct { top } else { self.tov.max(top) } as i64;
            ticks = min_nonzero(ticks, top, edge - tcnt);
            for &ocr in &self.ocr {
                ticks = min_nonzero(ticks, top, ocr as i64 - tcnt);
            }
            if tcnt > top as i64 {
                ticks = min_nonzero(ticks, top, 0x10000 - tcnt);
            }
            if tcnt == top as i64 {
                ticks = 1;
            }
        }
        if self.ocr.iter().any(|&o| o as i64 == tcnt) {
            ticks = 1;
        }

        let cycles = (ticks as u64 * self.divider as u64)
            .saturating_sub(self.divider_cycle as u64)
            .max(1);
        self.next_update_cycle = now + cycles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SIZE;

    fn run_until(t: &mut Timer16, data: &mut [u8], limit: u64) -> u64 {
        let mut now = 0;
        while t.next_update_cycle <= limit {
            now = t.next_update_cycle;
            t.update(data, now);
        }
        now
    }

    #[test]
    fn test_ctc_period() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = Timer16::timer1();
        // OCR1A = 999, CTC (WGM12), clk/1
        data[0x88] = (999 & 0xFF) as u8;
        data[0x89] = (999 >> 8) as u8;
        data[0x81] = 0x08 | 0x01;
        t.configure(&mut data, 0);
        assert_eq!(t.top, 999);
        run_until(&mut t, &mut data, 1000);
        assert_eq!(t.tcnt, 0);
        assert_eq!(data[TIFR1 as usize] & 0x3, 0x3);
    }

    #[test]
    fn test_timer3_toggles_speaker_pin() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = Timer16::timer3();
        data[DDRC as usize] = PC6;
        // OCR3A = 99, CTC, COM3A0 toggle, clk/1
        data[0x98] = 99;
        data[0x90] = 0x40;
        data[0x91] = 0x08 | 0x01;
        t.configure(&mut data, 0);
        t.update(&mut data, 99);
        assert_eq!(data[PORTC as usize] & PC6, PC6);
        t.update(&mut data, 199);
        assert_eq!(data[PORTC as usize] & PC6, 0);
    }

    #[test]
    fn test_tcnt_uses_temp_register() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = Timer16::timer1();
        data[0x81] = 0x01;
        t.configure(&mut data, 0);
        t.store_tcnt(&mut data, 0, 0x85, 0x12);
        assert_eq!(t.tcnt, 0);
        t.store_tcnt(&mut data, 0, 0x84, 0x34);
        assert_eq!(t.tcnt, 0x1234);
        let lo = t.load_tcnt(&mut data, 16, 0x84);
        let hi = t.load_tcnt(&mut data, 17, 0x85);
        assert_eq!((hi as u16) << 8 | lo as u16, 0x1244);
    }

    #[test]
    fn test_power_reduction_stops_timer() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = Timer16::timer3();
        data[0x91] = 0x01;
        data[PRR1 as usize] = 1 << 3;
        t.update(&mut data, 500);
        assert_eq!(t.tcnt, 0);
        assert_eq!(t.next_update_cycle, u64::MAX);
    }

    #[test]
    fn test_phase_correct_8bit_period() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = Timer16::timer1();
        // WGM 1 (phase correct 8-bit), clk/1, OCR1A = 0x80
        data[0x88] = 0x80;
        data[0x80] = 0x01;
        data[0x81] = 0x01;
        t.configure(&mut data, 0);
        t.update(&mut data, 2 * 255);
        assert_eq!(t.tcnt, 0);
        assert_eq!(data[TIFR1 as usize] & 1, 1);
    }
}
