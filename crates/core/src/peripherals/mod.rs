//! ATmega32u4 peripheral emulation.
//!
//! Contains the on-chip peripherals an Arduboy program talks to, plus the
//! external FX flash chip hanging off the SPI bus:
//!
//! - [`Timer8`]: 8-bit Timer/Counter0 (millis(), frame timing)
//! - [`Timer16`]: 16-bit Timer/Counter1 and Timer/Counter3 (tones, OC3A speaker pin)
//! - [`Spi`]: SPI master (display and FX flash)
//! - [`EepromCtrl`]: EEPROM read/program controller
//! - [`Pll`]: PLL lock timing
//! - [`Adc`]: conversion handshake for `analogRead()` and random seeding
//! - [`Usb`]: USB serial transmit sink
//! - [`FxFlash`]: W25Q128 16 MB external SPI flash
//!
//! Every data-space address in the I/O window maps to a [`RegHook`] through
//! [`reg_hook`]; `bus.rs` dispatches loads and stores on it.

mod adc;
mod eeprom;
pub mod fx_flash;
mod pll;
mod spi;
mod timer16;
mod timer8;
mod usb;

pub use adc::Adc;
pub(crate) use adc::{ADIE, ADIF};
pub use eeprom::EepromCtrl;
pub use fx_flash::FxFlash;
pub use pll::Pll;
pub use spi::Spi;
pub use timer16::{Timer16, Timer16Unit};
pub use timer8::Timer8;
pub use usb::Usb;

// --- GPIO ---
pub const PINB: u16 = 0x23;
pub const DDRB: u16 = 0x24;
pub const PORTB: u16 = 0x25;
pub const PINC: u16 = 0x26;
pub const DDRC: u16 = 0x27;
pub const PORTC: u16 = 0x28;
pub const PIND: u16 = 0x29;
pub const DDRD: u16 = 0x2A;
pub const PORTD: u16 = 0x2B;
pub const PINE: u16 = 0x2C;
pub const DDRE: u16 = 0x2D;
pub const PORTE: u16 = 0x2E;
pub const PINF: u16 = 0x2F;
pub const DDRF: u16 = 0x30;
pub const PORTF: u16 = 0x31;

// --- Timer interrupt flags / masks ---
pub const TIFR0: u16 = 0x35;
pub const TIFR1: u16 = 0x36;
pub const TIFR3: u16 = 0x38;
pub const TIMSK0: u16 = 0x6E;
pub const TIMSK1: u16 = 0x6F;
pub const TIMSK3: u16 = 0x71;

// --- EEPROM ---
pub const EECR: u16 = 0x3F;
pub const EEDR: u16 = 0x40;
pub const EEARL: u16 = 0x41;
pub const EEARH: u16 = 0x42;

// --- Timer0 ---
pub const GTCCR: u16 = 0x43;
pub const TCCR0A: u16 = 0x44;
pub const TCCR0B: u16 = 0x45;
pub const TCNT0: u16 = 0x46;
pub const OCR0A: u16 = 0x47;
pub const OCR0B: u16 = 0x48;

// --- Timer1 / Timer3 register blocks (TCCRnA at base) ---
pub const TIMER1_BASE: u16 = 0x80;
pub const TIMER3_BASE: u16 = 0x90;

// --- Misc ---
pub const PLLCSR: u16 = 0x49;
pub const SPCR: u16 = 0x4C;
pub const SPSR: u16 = 0x4D;
pub const SPDR: u16 = 0x4E;
pub const PLLFRQ: u16 = 0x52;
pub const SMCR: u16 = 0x53;
pub const PRR0: u16 = 0x64;
pub const PRR1: u16 = 0x65;

// --- ADC ---
pub const ADCL: u16 = 0x78;
pub const ADCH: u16 = 0x79;
pub const ADCSRA: u16 = 0x7A;
pub const ADMUX: u16 = 0x7C;

pub const UEDATX: u16 = 0xF1;

// ATmega32u4 interrupt vector addresses (word addresses from datasheet)
pub const INT_TIMER1_COMPA: u16 = 0x0022;
pub const INT_TIMER1_COMPB: u16 = 0x0024;
pub const INT_TIMER1_COMPC: u16 = 0x0026;
pub const INT_TIMER1_OVF: u16 = 0x0028;
pub const INT_TIMER0_COMPA: u16 = 0x002A;
pub const INT_TIMER0_COMPB: u16 = 0x002C;
pub const INT_TIMER0_OVF: u16 = 0x002E;
pub const INT_ADC: u16 = 0x003A;
pub const INT_TIMER3_COMPA: u16 = 0x0040;
pub const INT_TIMER3_COMPB: u16 = 0x0042;
pub const INT_TIMER3_COMPC: u16 = 0x0044;
pub const INT_TIMER3_OVF: u16 = 0x0046;

/// Clock dividers selected by the CSn2:0 bits (external clock sources never
/// tick on an Arduboy).
pub(crate) const DIVIDERS: [u32; 8] = [0, 1, 8, 64, 256, 1024, 0, 0];

/// Which of the three emulated timers a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    T0,
    T1,
    T3,
}

/// Side effect attached to a data-space address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegHook {
    /// Ordinary memory cell.
    Plain,
    /// PINx: writing ones toggles the matching PORTx bits.
    Pin,
    /// GTCCR: PSRSYNC resets the shared Timer0/1/3 prescaler.
    Gtccr,
    /// PRR0/PRR1: timer power reduction bits.
    Prr,
    /// Timer control / compare register.
    TimerReg(TimerId),
    /// TCNTn (low or high byte).
    TimerTcnt(TimerId),
    /// TIFRn, write-one-to-clear.
    TimerTifr(TimerId),
    Spcr,
    Spsr,
    Spdr,
    Eecr,
    Pllcsr,
    /// ADCSRA: conversion start, write-one-to-clear ADIF.
    Adcsra,
    Uedatx,
}

const fn build_reg_hooks() -> [RegHook; 256] {
    let mut t = [RegHook::Plain; 256];
    t[PINB as usize] = RegHook::Pin;
    t[PINC as usize] = RegHook::Pin;
    t[PIND as usize] = RegHook::Pin;
    t[PINE as usize] = RegHook::Pin;
    t[PINF as usize] = RegHook::Pin;

    t[TIFR0 as usize] = RegHook::TimerTifr(TimerId::T0);
    t[TIFR1 as usize] = RegHook::TimerTifr(TimerId::T1);
    t[TIFR3 as usize] = RegHook::TimerTifr(TimerId::T3);

    t[EECR as usize] = RegHook::Eecr;
    t[GTCCR as usize] = RegHook::Gtccr;

    let mut a = TCCR0A as usize;
    while a <= OCR0B as usize {
        t[a] = RegHook::TimerReg(TimerId::T0);
        a += 1;
    }
    t[TCNT0 as usize] = RegHook::TimerTcnt(TimerId::T0);

    let mut i = 0;
    while i < 0x0E {
        t[TIMER1_BASE as usize + i] = RegHook::TimerReg(TimerId::T1);
        t[TIMER3_BASE as usize + i] = RegHook::TimerReg(TimerId::T3);
        i += 1;
    }
    t[TIMER1_BASE as usize + 4] = RegHook::TimerTcnt(TimerId::T1);
    t[TIMER1_BASE as usize + 5] = RegHook::TimerTcnt(TimerId::T1);
    t[TIMER3_BASE as usize + 4] = RegHook::TimerTcnt(TimerId::T3);
    t[TIMER3_BASE as usize + 5] = RegHook::TimerTcnt(TimerId::T3);

    t[PLLCSR as usize] = RegHook::Pllcsr;
    t[ADCSRA as usize] = RegHook::Adcsra;
    t[SPCR as usize] = RegHook::Spcr;
    t[SPSR as usize] = RegHook::Spsr;
    t[SPDR as usize] = RegHook::Spdr;
    t[PRR0 as usize] = RegHook::Prr;
    t[PRR1 as usize] = RegHook::Prr;
    t[UEDATX as usize] = RegHook::Uedatx;
    t
}

static REG_HOOKS: [RegHook; 256] = build_reg_hooks();

/// Hook for a data-space address. Registers, SRAM and unmapped I/O are
/// [`RegHook::Plain`].
#[inline(always)]
pub fn reg_hook(addr: u16) -> RegHook {
    if addr < 0x100 {
        REG_HOOKS[addr as usize]
    } else {
        RegHook::Plain
    }
}

/// Read a little-endian 16-bit I/O register pair.
#[inline(always)]
pub(crate) fn io_word(data: &[u8], addr: u16) -> u32 {
    data[addr as usize] as u32 | ((data[addr as usize + 1] as u32) << 8)
}

/// Advance a prescaler counter by `inc` cycles; returns how many times it
/// wrapped at `top`.
#[inline(always)]
pub(crate) fn increase_counter(counter: &mut u32, inc: u64, top: u32) -> u64 {
    let c = *counter as u64 + inc;
    let top = top as u64;
    *counter = (c % top) as u32;
    c / top
}

/// Nonzero minimum used to find a timer's next event distance. Differences
/// that are zero or negative fall back to `top`.
#[inline(always)]
pub(crate) fn min_nonzero(a: u32, top: u32, b: i64) -> u32 {
    if b <= 0 {
        a.min(top)
    } else {
        a.min(b.min(u32::MAX as i64) as u32)
    }
}
