//! # arduboy-sim
//!
//! Cycle-accurate simulation core for the Arduboy handheld game console.
//!
//! Emulates the ATmega32u4 microcontroller with 16 MHz clock, 32 KB flash,
//! 2.5 KB SRAM and 1 KB EEPROM, together with the peripherals an Arduboy
//! program uses: Timer0/1/3, SPI, PLL, the EEPROM controller, USB serial
//! output, the SSD1306 OLED and the W25Q128 FX external flash.
//!
//! ## Architecture
//!
//! - [`Arduboy`]: the machine; owns every component and the clock
//! - [`Cpu`]: AVR CPU state, instruction execution and interrupt dispatch
//! - [`Memory`]: unified data space (registers + I/O + SRAM), flash, EEPROM
//! - [`peripherals`]: timers, SPI, PLL, EEPROM controller, USB, FX flash
//! - [`Ssd1306`]: display controller, refresh model and filter
//! - [`debugger`]: breakpoints and autobreaks, checked between steps
//! - [`profiler`]: per-address cycle counts and hotspots
//! - [`loader`], [`hex`], [`arduboy_file`]: image loading
//! - [`savestate`], [`snapshot`]: machine state serialization
//!
//! ## Timing
//!
//! [`Arduboy::advance`] converts simulated nanoseconds into CPU cycles and
//! steps the machine one instruction at a time. Peripherals observe each
//! step's register writes before the step's interrupt check, and interrupts
//! raised by a step are taken at the next instruction boundary. Time that
//! does not fill a whole step is carried into the next call, so splitting a
//! duration across calls never changes the outcome.

pub mod arduboy_file;
mod bus;
pub mod cpu;
pub mod debugger;
pub mod display;
pub mod hex;
pub mod loader;
pub mod memory;
pub mod opcodes;
pub mod peripherals;
pub mod profiler;
pub mod savedata;
pub mod savestate;
pub mod snapshot;


use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use cpu::Cpu;
pub use debugger::{Autobreak, BreakReason, Debugger};
pub use display::Ssd1306;
pub use loader::Device;
pub use memory::Memory;
pub use profiler::Profiler;

use opcodes::{decode_program, Instruction};
use peripherals::{
    Adc, EepromCtrl, FxFlash, Pll, Spi, Timer16, Timer8, Usb, PINB, PINE, PINF, PORTB, PORTD,
};

// ATmega32u4 constants
/// Flash memory size: 32 KB
pub const FLASH_SIZE: usize = 32 * 1024;
/// Flash size in 16-bit words
pub const FLASH_WORDS: usize = FLASH_SIZE / 2;
/// SRAM size: 2.5 KB (2048 + 512)
pub const SRAM_SIZE: usize = 2 * 1024 + 512;
/// EEPROM size: 1 KB
pub const EEPROM_SIZE: usize = 1024;
/// CPU clock frequency: 16 MHz
pub const CLOCK_HZ: u32 = 16_000_000;
/// Length of one CPU cycle in picoseconds
pub const CYCLE_PS: u64 = 1_000_000_000_000 / CLOCK_HZ as u64;

/// SSD1306 display width in pixels
pub const SCREEN_WIDTH: usize = 128;
/// SSD1306 display height in pixels
pub const SCREEN_HEIGHT: usize = 64;

/// Number of general-purpose registers (R0–R31)
pub const REG_COUNT: usize = 32;
/// I/O + extended I/O register space size (0x20..0xFF)
pub const IO_SIZE: usize = 224;
/// Total data space: registers + I/O + SRAM
pub const DATA_SIZE: usize = REG_COUNT + IO_SIZE + SRAM_SIZE;
/// Initial stack pointer (RAMEND)
pub const RAMEND: u16 = (DATA_SIZE - 1) as u16;

// SREG bit positions
pub const SREG_C: u8 = 0;
pub const SREG_Z: u8 = 1;
pub const SREG_N: u8 = 2;
pub const SREG_V: u8 = 3;
pub const SREG_S: u8 = 4;
pub const SREG_H: u8 = 5;
pub const SREG_T: u8 = 6;
pub const SREG_I: u8 = 7;

// I/O register addresses (data space addresses, not I/O addresses)
pub const SREG_ADDR: u16 = 0x5F;
pub const SPH_ADDR: u16 = 0x5E;
pub const SPL_ADDR: u16 = 0x5D;

/// Display chip select (PD6) and data/command (PD4) pins.
const DISPLAY_CS: u8 = 1 << 6;
const DISPLAY_DC: u8 = 1 << 4;

/// Arduboy button identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
}

impl Button {
    /// Input register and bit the button pulls low.
    /// UP=PF7, DOWN=PF4, LEFT=PF5, RIGHT=PF6, A=PE6, B=PB4
    fn pin(self) -> (u16, u8) {
        match self {
            Button::Up => (PINF, 7),
            Button::Down => (PINF, 4),
            Button::Left => (PINF, 5),
            Button::Right => (PINF, 6),
            Button::A => (PINE, 6),
            Button::B => (PINB, 4),
        }
    }
}

/// Host-settable machine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Data address of the PORT register driving the FX chip select
    pub fxport_reg: u8,
    /// FX chip select pin within `fxport_reg` (active low)
    pub fxport_mask: u8,
    /// Blend recent frames into [`Arduboy::filtered_pixels`]
    pub display_filter: bool,
    pub profiler_enabled: bool,
    /// Stack pointer values below this raise [`Autobreak::StackOverflow`]
    pub stack_limit: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fxport_reg: 0x2B,
            fxport_mask: 1 << 1,
            display_filter: false,
            profiler_enabled: false,
            stack_limit: loader::DEFAULT_STACK_LIMIT,
        }
    }
}

/// Main Arduboy machine combining all subsystems
pub struct Arduboy {
    pub cpu: Cpu,
    pub mem: Memory,
    pub timer0: Timer8,
    pub timer1: Timer16,
    pub timer3: Timer16,
    pub spi: Spi,
    pub eeprom_ctrl: EepromCtrl,
    pub pll: Pll,
    pub adc: Adc,
    pub usb: Usb,
    pub display: Ssd1306,
    /// Arduboy FX external SPI flash
    pub fx: FxFlash,
    pub debugger: Debugger,
    pub profiler: Profiler,
    pub config: Config,
    /// Set by breakpoints and single steps; `advance` does nothing while set
    pub paused: bool,
    pub program_loaded: bool,
    /// Byte size of the loaded program
    pub program_end: u32,
    /// Flash decoded once per load, one entry per word
    pub(crate) decoded: Vec<(Instruction, u8)>,
    /// Picoseconds carried between `advance` calls; negative after a
    /// multi-cycle step overshot the budget
    pub(crate) ps_rem: i64,
    pub(crate) title: String,
    pub(crate) device: String,
}

impl Arduboy {
    pub fn new() -> Self {
        let mut mem = Memory::new();
        // all buttons released
        mem.data[PINB as usize] = 0x10;
        mem.data[PINE as usize] = 0x40;
        mem.data[PINF as usize] = 0xF0;
        let decoded = decode_program(&mem.flash);
        let mut a = Arduboy {
            cpu: Cpu::new(),
            mem,
            timer0: Timer8::new(),
            timer1: Timer16::timer1(),
            timer3: Timer16::timer3(),
            spi: Spi::new(),
            eeprom_ctrl: EepromCtrl::new(),
            pll: Pll::new(),
            adc: Adc::new(),
            usb: Usb::new(),
            display: Ssd1306::new(),
            fx: FxFlash::new(),
            debugger: Debugger::new(),
            profiler: Profiler::new(),
            config: Config::default(),
            paused: false,
            program_loaded: false,
            program_end: 0,
            decoded,
            ps_rem: 0,
            title: String::new(),
            device: String::new(),
        };
        a.reset();
        a
    }

    /// Re-decode program flash after it was modified directly.
    pub fn decode_flash(&mut self) {
        self.decoded = decode_program(&self.mem.flash);
    }

    /// Reset the CPU and all peripherals to power-on state.
    ///
    /// Flash, EEPROM and FX contents are preserved, as are the button
    /// inputs. Breakpoints survive; a breakpoint at address 0 pauses at once.
    pub fn reset(&mut self) {
        self.profiler.reset();
        self.mem.clear_data();
        // the bootloader leaves the RX and TX LEDs off
        self.mem.data[PORTB as usize] |= 0x01;
        self.mem.data[PORTD as usize] |= 0x20;
        self.mem.set_sp(RAMEND);

        self.cpu = Cpu::new();
        self.timer0 = Timer8::new();
        self.timer1.reset();
        self.timer3.reset();
        self.spi.reset();
        self.pll.reset();
        self.adc.reset();
        self.eeprom_ctrl.reset();
        self.display.reset();
        self.fx.reset();
        self.usb.take();

        self.paused = self.debugger.has_breakpoint(0);
        self.debugger.step_target = None;
        self.ps_rem = 0;
        info!(paused = self.paused, "reset");
    }

    /// Set button state (true = pressed). Buttons are active low.
    pub fn set_button(&mut self, btn: Button, pressed: bool) {
        let (pin, bit) = btn.pin();
        let v = &mut self.mem.data[pin as usize];
        if pressed {
            *v &= !(1 << bit);
        } else {
            *v |= 1 << bit;
        }
    }

    /// One CPU step plus everything clocked by it. Returns the cycles used.
    fn cycle(&mut self) -> u32 {
        let cycles = self.advance_cycle();

        let cs = self.mem.data[self.config.fxport_reg as usize] & self.config.fxport_mask;
        self.fx.set_enabled(cs == 0);

        if self.spi.done {
            let byte = self.spi.data_out;
            let portd = self.mem.data[PORTD as usize];
            if portd & DISPLAY_CS == 0 {
                if portd & DISPLAY_DC != 0 {
                    self.display.send_data(byte);
                } else {
                    self.display.send_command(byte);
                }
            }
            self.spi.data_in = self.fx.spi_transceive(byte);
            if self.fx.busy_error {
                debug!(command = byte, pc = self.cpu.executing_pc, "FX command while busy");
                self.debugger.raise(Autobreak::FxBusy);
            }
            self.spi.done = false;
        }

        let executing = self.cpu.active || self.cpu.wakeup_cycles != 0;
        self.profiler.record(self.cpu.executing_pc, cycles, executing);

        let ps = cycles as u64 * CYCLE_PS;
        if self.display.advance(ps) {
            self.profiler.record_frame();
        }
        self.fx.advance(ps);
        cycles
    }

    /// Bring all timer registers up to the current cycle.
    fn update_all(&mut self) {
        let now = self.cpu.cycle_count;
        let data = &mut self.mem.data;
        self.timer0.update(data, now);
        self.timer1.update(data, now);
        self.timer3.update(data, now);
    }

    fn sync_config(&mut self) {
        self.display.enable_filter = self.config.display_filter;
        self.profiler.enabled = self.config.profiler_enabled;
    }

    /// Run for `ns` nanoseconds of simulated time, or until a breakpoint
    /// pauses the machine (check [`Arduboy::paused`]).
    pub fn advance(&mut self, ns: u64) {
        if self.paused || !self.program_loaded {
            return;
        }
        self.sync_config();

        let ns = i64::try_from(ns).unwrap_or(i64::MAX);
        let mut ps = self.ps_rem.saturating_add(ns.saturating_mul(1000));
        while ps >= CYCLE_PS as i64 {
            let cycles = self.cycle();
            ps -= cycles as i64 * CYCLE_PS as i64;
            if let Some(reason) = self.debugger.check(&self.cpu) {
                self.paused = true;
                debug!(?reason, pc = self.cpu.pc, cycle = self.cpu.cycle_count, "paused");
                break;
            }
        }
        self.update_all();
        self.ps_rem = if self.paused { 0 } else { ps };
    }

    /// Execute exactly one instruction (waiting out any stall or sleep
    /// first) and leave the machine paused.
    pub fn advance_instr(&mut self) {
        if !self.program_loaded {
            return;
        }
        self.sync_config();
        for _ in 0..65536 {
            let executes = self.cpu.active;
            self.cycle();
            if executes {
                break;
            }
        }
        self.update_all();
        self.paused = true;
        self.ps_rem = 0;
    }

    /// Sleeping with interrupts disabled: nothing can wake the CPU.
    pub fn is_halted(&self) -> bool {
        !self.cpu.active && self.cpu.wakeup_cycles == 0 && !self.mem.flag(SREG_I)
    }

    pub fn cycle_count(&self) -> u64 {
        self.cpu.cycle_count
    }

    /// Raw pixels of the last refreshed frame, 128×64 gray levels.
    pub fn pixels(&self) -> &[u8] {
        self.display.pixels()
    }

    pub fn filtered_pixels(&self) -> &[u8] {
        self.display.filtered_pixels()
    }

    /// Drain the bytes sent over USB serial.
    pub fn take_serial(&mut self) -> Vec<u8> {
        self.usb.take()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Device named by the loaded image or detected from its code; empty
    /// for a program that does not use the FX chip.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Build hotspots from the profile gathered so far and format the top
    /// `n` of them.
    pub fn profiler_report(&mut self, n: usize) -> String {
        let end_words = (self.program_end as usize).div_ceil(2);
        self.profiler.build_hotspots(&self.decoded, end_words);
        self.profiler.report(n)
    }
}

impl Default for Arduboy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Machine running `words` from address 0.
    fn with_program(words: &[u16]) -> Arduboy {
        let mut a = Arduboy::new();
        for (i, w) in words.iter().enumerate() {
            a.mem.flash[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        a.decode_flash();
        a.program_loaded = true;
        a.program_end = words.len() as u32 * 2;
        a
    }

    #[test]
    fn test_arduboy_creation() {
        let a = Arduboy::new();
        assert_eq!(a.cpu.pc, 0);
        assert_eq!(a.mem.sp(), RAMEND);
        assert_eq!(a.mem.data[PINF as usize], 0xF0);
        assert!(!a.paused);
    }

    #[test]
    fn test_button_press() {
        let mut a = Arduboy::new();
        assert_eq!(a.mem.data[PINF as usize] & (1 << 7), 1 << 7);
        a.set_button(Button::Up, true);
        assert_eq!(a.mem.data[PINF as usize] & (1 << 7), 0);
        a.set_button(Button::B, true);
        assert_eq!(a.mem.data[PINB as usize] & (1 << 4), 0);
        a.set_button(Button::Up, false);
        assert_eq!(a.mem.data[PINF as usize] & (1 << 7), 1 << 7);
    }

    #[test]
    fn test_reset_keeps_buttons_and_eeprom() {
        let mut a = Arduboy::new();
        a.set_button(Button::A, true);
        a.mem.eeprom[5] = 0x12;
        a.mem.set_reg(1, 7);
        a.reset();
        assert_eq!(a.mem.data[PINE as usize] & (1 << 6), 0);
        assert_eq!(a.mem.eeprom[5], 0x12);
        assert_eq!(a.mem.reg(1), 0);
    }

    #[test]
    fn test_no_program_does_not_run() {
        let mut a = Arduboy::new();
        a.advance(1_000_000);
        assert_eq!(a.cycle_count(), 0);
    }

    #[test]
    fn test_time_remainder_carries() {
        // NOPs
        let mut a = with_program(&[0; 16]);
        a.advance(50);
        assert_eq!(a.cycle_count(), 0);
        a.advance(50);
        assert_eq!(a.cycle_count(), 1);
        // 100 ns = 1.6 cycles: 37.5 ns carried
        a.advance(1000);
        assert_eq!(a.cycle_count(), 17);
    }

    #[test]
    fn test_huge_advance_saturates() {
        // stops at the breakpoint instead of wrapping to a negative budget
        let mut a = with_program(&[0, 0, 0xCFFF]);
        a.debugger.set_breakpoint(2, true);
        a.advance(u64::MAX);
        assert!(a.paused);
        assert_eq!(a.cpu.pc, 2);
        assert_eq!(a.cycle_count(), 2);
    }

    #[test]
    fn test_split_advance_matches_single() {
        // rjmp .-2 spins forever
        let mut a = with_program(&[0xCFFF]);
        let mut b = with_program(&[0xCFFF]);
        a.advance(10_000);
        for _ in 0..100 {
            b.advance(100);
        }
        assert_eq!(a.cycle_count(), b.cycle_count());
    }

    #[test]
    fn test_breakpoint_pauses_and_resumes() {
        let mut a = with_program(&[0, 0, 0, 0, 0xCFFF]);
        a.debugger.set_breakpoint(3, true);
        a.advance(1_000_000);
        assert!(a.paused);
        assert_eq!(a.cpu.pc, 3);
        assert_eq!(a.cycle_count(), 3);
        // one more cycle: the NOP at the breakpoint runs without pausing again
        a.paused = false;
        a.advance(63);
        assert!(!a.paused);
        assert_eq!(a.cpu.pc, 4);
        assert_eq!(a.cycle_count(), 4);
    }

    #[test]
    fn test_breakpoint_at_zero_pauses_on_reset() {
        let mut a = with_program(&[0]);
        a.debugger.set_breakpoint(0, true);
        a.reset();
        assert!(a.paused);
    }

    #[test]
    fn test_advance_instr_steps_one() {
        // ldi r16, 1; rjmp .-2
        let mut a = with_program(&[0xE001, 0xCFFF]);
        a.advance_instr();
        assert!(a.paused);
        assert_eq!(a.cpu.pc, 1);
        assert_eq!(a.mem.reg(16), 1);
        a.advance_instr();
        assert_eq!(a.cpu.pc, 1);
        assert_eq!(a.cycle_count(), 3);
    }

    #[test]
    fn test_sleep_with_interrupts_off_halts() {
        // cli; ldi r16, 1; out SMCR, r16; sleep
        let mut a = with_program(&[0x94F8, 0xE001, 0xBF03, 0x9588]);
        a.advance(10_000);
        assert!(a.is_halted());
    }

    #[test]
    fn test_break_autobreak() {
        // nop; break; nop
        let mut a = with_program(&[0, 0x9598, 0]);
        a.debugger.enable(Autobreak::Break, true);
        a.advance(1_000);
        assert!(a.paused);
        assert_eq!(a.debugger.last_break, Some(BreakReason::Autobreak(Autobreak::Break)));
        assert_eq!(a.cpu.pc, 2);
    }

    #[test]
    fn test_profiler_attributes_cycles() {
        let mut a = with_program(&[0, 0, 0xCFFF]);
        a.config.profiler_enabled = true;
        a.advance(10_000);
        assert_eq!(a.profiler.count(0), 1);
        assert!(a.profiler.count(2) > 100);
        assert!(a.profiler_report(3).contains("Hotspots"));
    }
}
