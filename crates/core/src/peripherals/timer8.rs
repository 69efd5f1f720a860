//! 8-bit Timer/Counter0 emulation.
//!
//! The counter is evaluated lazily: instead of ticking every CPU cycle, the
//! timer remembers the cycle of its last update and computes the cycle of its
//! next interesting event (compare match, TOP, overflow). The scheduler calls
//! [`Timer8::update`] once that cycle is reached, and any register access
//! catches the counter up first. Supports all WGM modes of Timer0 (normal,
//! CTC, fast PWM, phase-correct PWM) with double-buffered OCR0A/OCR0B.

use serde::{Deserialize, Serialize};

use super::{
    increase_counter, min_nonzero, DIVIDERS, OCR0A, OCR0B, PRR0, TCCR0A, TCCR0B, TCNT0, TIFR0,
};

/// PRR0 bit powering down Timer0.
const PRTIM0: u8 = 1 << 5;

/// Resolve TOP and the overflow point for an 8-bit WGM mode.
fn process_wgm8(wgm: u32, ocr_a: u32) -> (u32, u32) {
    let (top, tov) = match wgm {
        0x1 => (0xFF, 0x00),  // PWM, phase correct
        0x2 => (ocr_a, 0xFF), // CTC
        0x5 => (ocr_a, 0x00), // PWM, phase correct, TOP = OCR0A
        0x7 => (ocr_a, 0xFF), // fast PWM, TOP = OCR0A
        _ => (0xFF, 0xFF),    // normal, fast PWM, reserved
    };
    (top.max(3), tov)
}

fn wgm(data: &[u8]) -> u32 {
    (data[TCCR0A as usize] & 0x3) as u32 | ((data[TCCR0B as usize] >> 1) & 0x4) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer8 {
    pub tcnt: u32,
    pub count_down: bool,
    pub phase_correct: bool,
    update_ocr_at_top: bool,
    /// Active (buffered) compare values
    pub ocr_a: u32,
    pub ocr_b: u32,
    pub top: u32,
    pub tov: u32,
    /// Current prescaler divider, 0 when stopped
    pub divider: u32,
    divider_cycle: u32,
    prev_update_cycle: u64,
    /// CPU cycle at which the next event needs processing
    pub next_update_cycle: u64,
}

impl Timer8 {
    pub fn new() -> Self {
        Timer8 {
            tcnt: 0,
            count_down: false,
            phase_correct: false,
            update_ocr_at_top: false,
            ocr_a: 0,
            ocr_b: 0,
            top: 0xFF,
            tov: 0xFF,
            divider: 0,
            divider_cycle: 0,
            prev_update_cycle: 0,
            next_update_cycle: u64::MAX,
        }
    }

    fn stopped(&self, data: &[u8]) -> bool {
        self.divider == 0 || data[PRR0 as usize] & PRTIM0 != 0
    }

    fn load_ocr(&mut self, data: &[u8]) {
        self.ocr_a = data[OCR0A as usize] as u32;
        self.ocr_b = data[OCR0B as usize] as u32;
        let (top, tov) = process_wgm8(wgm(data), self.ocr_a);
        self.top = top;
        self.tov = tov;
    }

    /// Bring TCNT0/TIFR0 up to date with cycle `now` using the current
    /// configuration.
    pub fn catch_up(&mut self, data: &mut [u8], now: u64) {
        if !self.stopped(data) {
            let cycles = now.saturating_sub(self.prev_update_cycle);
            self.run(data, cycles);
        }
        self.prev_update_cycle = now;
    }

    /// Catch up, then re-read the configuration and schedule the next event.
    pub fn update(&mut self, data: &mut [u8], now: u64) {
        self.catch_up(data, now);
        self.configure(data, now);
    }

    /// Store to TCNT0: the old count runs up to `now`, the new count applies
    /// from there on.
    pub fn store_tcnt(&mut self, data: &mut [u8], now: u64, v: u8) {
        self.catch_up(data, now);
        data[TCNT0 as usize] = v;
        self.tcnt = v as u32;
        self.configure(data, now);
    }

    /// Restart the prescaler (GTCCR.PSRSYNC).
    pub fn reset_prescaler(&mut self) {
        self.divider_cycle = 0;
    }

    fn run(&mut self, data: &mut [u8], cycles: u64) {
        let mut ticks = increase_counter(&mut self.divider_cycle, cycles, self.divider);
        let mut tifr = data[TIFR0 as usize] & 0x7;

        while ticks > 0 {
            let tcnt = self.tcnt;
            let top = self.top;
            if tcnt == self.ocr_a {
                tifr |= 0x2;
            }
            if tcnt == self.ocr_b {
                tifr |= 0x4;
            }
            if self.count_down {
                if tcnt == 0 {
                    self.count_down = false;
                    continue;
                }
                let mut stop = 0;
                for ocr in [self.ocr_a, self.ocr_b] {
                    if ocr < tcnt {
                        stop = stop.max(ocr);
                    }
                }
                let t = ((tcnt - stop) as u64).min(ticks);
                ticks -= t;
                self.tcnt -= t as u32;
                if self.tcnt == 0 {
                    tifr |= 0x1;
                    self.count_down = false;
                }
            } else if tcnt == top {
                ticks -= 1;
                if self.phase_correct {
                    self.count_down = true;
                    self.tcnt -= 1;
                } else {
                    tifr |= 0x1;
                    self.tcnt = 0;
                }
                if self.update_ocr_at_top {
                    self.load_ocr(data);
                }
            } else if tcnt > top {
                // TCNT0 was written above TOP: count through MAX and wrap
                let t = ((0x100 - tcnt) as u64).min(ticks);
                ticks -= t;
                self.tcnt += t as u32;
                if self.tcnt >= 0x100 {
                    self.tcnt = 0;
                    tifr |= 0x1;
                }
            } else {
                let mut stop = top;
                for ocr in [self.ocr_a, self.ocr_b] {
                    if ocr > tcnt {
                        stop = stop.min(ocr);
                    }
                }
                let t = ((stop - tcnt) as u64).min(ticks);
                ticks -= t;
                self.tcnt += t as u32;
            }
        }

        data[TIFR0 as usize] |= tifr;
        data[TCNT0 as usize] = self.tcnt as u8;
    }

    /// Re-read TCCR0A/B, OCR0A/B and schedule the next update.
    pub fn configure(&mut self, data: &mut [u8], now: u64) {
        self.divider = DIVIDERS[(data[TCCR0B as usize] & 0x7) as usize];
        if self.stopped(data) {
            self.next_update_cycle = u64::MAX;
            return;
        }

        let wgm = wgm(data);
        let mask = 1u32 << wgm;
        if mask & 0x5 != 0 {
            self.load_ocr(data);
        }
        self.update_ocr_at_top = mask & 0xAA != 0;
        if self.update_ocr_at_top && self.tcnt == self.top {
            self.load_ocr(data);
        }
        let (top, tov) = process_wgm8(wgm, self.ocr_a);
        self.top = top;
        self.tov = tov;
        self.phase_correct = mask & 0x22 != 0;
        if !self.phase_correct {
            self.count_down = false;
        }

        let tcnt = self.tcnt as i64;
        let top = self.top;
        let ocrs = [self.ocr_a as i64, self.ocr_b as i64];
        let mut ticks = u32::MAX;
        if self.count_down {
            ticks = min_nonzero(ticks, top, tcnt);
            for ocr in ocrs {
                ticks = min_nonzero(ticks, top, tcnt - ocr);
            }
        } else {
            let edge = if self.phase_correct { top } else { self.tov.max(top) } as i64;
            ticks = min_nonzero(ticks, top, edge - tcnt);
            for ocr in ocrs {
                ticks = min_nonzero(ticks, top, ocr - tcnt);
            }
            if tcnt > top as i64 {
                ticks = min_nonzero(ticks, top, 0x100 - tcnt);
            }
            if tcnt == top as i64 {
                ticks = 1;
            }
        }
        if ocrs.contains(&tcnt) {
            ticks = 1;
        }

        let cycles = (ticks as u64 * self.divider as u64)
            .saturating_sub(self.divider_cycle as u64)
            .max(1);
        self.next_update_cycle = now + cycles;
    }
}

impl Default for Timer8 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SIZE;

    fn setup(tccr0a: u8, tccr0b: u8, ocr0a: u8) -> (Timer8, Vec<u8>) {
        let mut data = vec![0u8; DATA_SIZE];
        data[TCCR0A as usize] = tccr0a;
        data[TCCR0B as usize] = tccr0b;
        data[OCR0A as usize] = ocr0a;
        let mut t = Timer8::new();
        t.configure(&mut data, 0);
        (t, data)
    }

    #[test]
    fn test_stopped_timer_never_schedules() {
        let (t, _) = setup(0, 0, 0);
        assert_eq!(t.next_update_cycle, u64::MAX);
    }

    #[test]
    fn test_normal_mode_overflow() {
        // normal mode, clk/1
        let (mut t, mut data) = setup(0, 0x01, 0);
        t.update(&mut data, 255);
        assert_eq!(data[TCNT0 as usize], 255);
        assert_eq!(data[TIFR0 as usize] & 1, 0);
        t.update(&mut data, 256);
        assert_eq!(data[TCNT0 as usize], 0);
        assert_eq!(data[TIFR0 as usize] & 1, 1);
    }

    #[test]
    fn test_prescaler_divides() {
        // clk/64
        let (mut t, mut data) = setup(0, 0x03, 0);
        t.update(&mut data, 64 * 10 + 63);
        assert_eq!(data[TCNT0 as usize], 10);
    }

    #[test]
    fn test_ctc_compare_match() {
        // CTC (WGM01), clk/1, OCR0A = 99
        let (mut t, mut data) = setup(0x02, 0x01, 99);
        let mut now = 0;
        while data[TIFR0 as usize] & 0x2 == 0 && now < 1000 {
            now = t.next_update_cycle;
            t.update(&mut data, now);
        }
        assert_eq!(now, 100);
        assert_eq!(data[TCNT0 as usize], 0);
    }

    #[test]
    fn test_tcnt_store_restarts_count() {
        let (mut t, mut data) = setup(0, 0x01, 0);
        t.update(&mut data, 50);
        t.store_tcnt(&mut data, 50, 250);
        t.update(&mut data, 55);
        assert_eq!(data[TCNT0 as usize], 255);
        t.update(&mut data, 56);
        assert_eq!(data[TCNT0 as usize], 0);
        assert_eq!(data[TIFR0 as usize] & 1, 1);
    }

    #[test]
    fn test_powered_down_timer_holds() {
        let (mut t, mut data) = setup(0, 0x01, 0);
        data[PRR0 as usize] = PRTIM0;
        t.update(&mut data, 100);
        assert_eq!(data[TCNT0 as usize], 0);
        assert_eq!(t.next_update_cycle, u64::MAX);
    }

    #[test]
    fn test_phase_correct_counts_down() {
        // phase correct PWM, TOP = 0xFF, clk/1
        let (mut t, mut data) = setup(0x01, 0x01, 0x80);
        t.update(&mut data, 256);
        assert!(t.count_down);
        assert_eq!(data[TCNT0 as usize], 254);
        t.update(&mut data, 510);
        assert_eq!(data[TCNT0 as usize], 0);
        assert_eq!(data[TIFR0 as usize] & 1, 1);
        assert!(!t.count_down);
    }
}
