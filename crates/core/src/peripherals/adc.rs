//! Analog-to-digital converter emulation.
//!
//! Nothing analog is wired up on an Arduboy that firmware cares about
//! except the floating pin sampled by `initRandomSeed()`, so every
//! conversion yields the same mid-scale reading. What matters is the
//! handshake: a conversion started with ADSC takes 13 ADC clocks at the
//! ADPS prescaler, then ADSC clears, ADIF rises and ADCH:ADCL receive the
//! result (left-adjusted when ADMUX.ADLAR is set).

use serde::{Deserialize, Serialize};

use super::{ADCH, ADCL, ADCSRA, ADMUX, PRR0};

const ADEN: u8 = 1 << 7;
const ADSC: u8 = 1 << 6;
pub(crate) const ADIF: u8 = 1 << 4;
pub(crate) const ADIE: u8 = 1 << 3;

const ADLAR: u8 = 1 << 5;
/// PRR0 bit powering down the ADC.
const PRADC: u8 = 1 << 0;

/// ADC clocks per single conversion.
const CONVERSION_CLOCKS: u32 = 13;
/// Reading of the unconnected input.
const SAMPLE: u16 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Adc {
    /// CPU cycles into the running conversion
    conversion_cycle: u32,
}

impl Adc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Adc::new();
    }

    /// Store to ADCSRA. ADIF is write-one-to-clear, ADSC can only be set,
    /// and clearing ADEN aborts a running conversion.
    pub fn store(&mut self, data: &mut [u8], v: u8) {
        let old = data[ADCSRA as usize];
        let mut new = v & !ADIF;
        if v & ADIF == 0 {
            new |= old & ADIF;
        }
        if v & ADEN == 0 {
            new &= !ADSC;
        } else {
            new |= old & ADSC;
        }
        if new & ADSC == 0 {
            self.conversion_cycle = 0;
        }
        data[ADCSRA as usize] = new;
    }

    pub fn tick(&mut self, data: &mut [u8], cycles: u32) {
        if data[PRR0 as usize] & PRADC != 0 {
            return;
        }
        let adcsra = data[ADCSRA as usize];
        if adcsra & (ADEN | ADSC) != ADEN | ADSC {
            self.conversion_cycle = 0;
            return;
        }

        let prescaler = (1u32 << (adcsra & 0x7)).max(2);
        self.conversion_cycle += cycles;
        if self.conversion_cycle < CONVERSION_CLOCKS * prescaler {
            return;
        }
        self.conversion_cycle = 0;

        let mut result = SAMPLE;
        if data[ADMUX as usize] & ADLAR != 0 {
            result <<= 6;
        }
        data[ADCL as usize] = result as u8;
        data[ADCH as usize] = (result >> 8) as u8;
        data[ADCSRA as usize] = (adcsra & !ADSC) | ADIF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SIZE;

    #[test]
    fn test_conversion_takes_13_adc_clocks() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut adc = Adc::new();
        // enabled, started, clk/128
        adc.store(&mut data, ADEN | ADSC | 0x7);
        adc.tick(&mut data, 13 * 128 - 1);
        assert_ne!(data[ADCSRA as usize] & ADSC, 0);
        adc.tick(&mut data, 1);
        assert_eq!(data[ADCSRA as usize], ADEN | ADIF | 0x7);
        assert_eq!(data[ADCL as usize], (SAMPLE & 0xFF) as u8);
        assert_eq!(data[ADCH as usize], (SAMPLE >> 8) as u8);
    }

    #[test]
    fn test_left_adjusted_result() {
        let mut data = vec![0u8; DATA_SIZE];
        data[ADMUX as usize] = ADLAR;
        let mut adc = Adc::new();
        adc.store(&mut data, ADEN | ADSC);
        adc.tick(&mut data, 13 * 2);
        let v = u16::from_le_bytes([data[ADCL as usize], data[ADCH as usize]]);
        assert_eq!(v, SAMPLE << 6);
    }

    #[test]
    fn test_adif_write_one_to_clear() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut adc = Adc::new();
        adc.store(&mut data, ADEN | ADSC);
        adc.tick(&mut data, 26);
        // writing ADIF as zero keeps it
        adc.store(&mut data, ADEN);
        assert_ne!(data[ADCSRA as usize] & ADIF, 0);
        adc.store(&mut data, ADEN | ADIF);
        assert_eq!(data[ADCSRA as usize], ADEN);
    }

    #[test]
    fn test_disable_aborts_and_power_down_holds() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut adc = Adc::new();
        adc.store(&mut data, ADEN | ADSC);
        adc.tick(&mut data, 20);
        adc.store(&mut data, 0);
        assert_eq!(data[ADCSRA as usize] & ADSC, 0);

        data[PRR0 as usize] = PRADC;
        adc.store(&mut data, ADEN | ADSC);
        adc.tick(&mut data, 1000);
        assert_ne!(data[ADCSRA as usize] & ADSC, 0);
    }
}
