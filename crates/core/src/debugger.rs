//! Breakpoints and autobreaks.
//!
//! - **Execution breakpoints**: one bit per flash word
//! - **Data breakpoints**: one bit per data-space address, separately for
//!   loads and stores
//! - **Step target**: pause when the PC reaches a given word (step over)
//! - **Autobreaks**: anomaly classes raised by the CPU and peripherals; an
//!   enabled class pauses the scheduler at the end of the step that raised it
//!
//! The machine consults [`Debugger::check`] after every step of
//! [`Arduboy::advance`](crate::Arduboy::advance). Nothing here feeds back
//! into execution except the suppressed out-of-bounds IJMP/ICALL.

use serde::{Deserialize, Serialize};

use crate::cpu::{Cpu, NO_ACCESS};
use crate::{DATA_SIZE, FLASH_WORDS};

/// Anomaly classes that can pause execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Autobreak {
    /// BREAK instruction executed
    Break,
    /// IJMP/ICALL target past the end of the loaded program
    OobIjmp,
    /// LDD/STD through a Y or Z base of zero
    NullRelDeref,
    /// SPDR written while a transfer was in progress
    SpiWriteCollision,
    /// FX flash command issued while the chip was busy
    FxBusy,
    /// push below the configured stack limit
    StackOverflow,
}

impl Autobreak {
    pub const ALL: [Autobreak; 6] = [
        Autobreak::Break,
        Autobreak::OobIjmp,
        Autobreak::NullRelDeref,
        Autobreak::SpiWriteCollision,
        Autobreak::FxBusy,
        Autobreak::StackOverflow,
    ];

    #[inline(always)]
    fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Autobreak::Break => "BREAK instruction",
            Autobreak::OobIjmp => "out-of-bounds indirect jump",
            Autobreak::NullRelDeref => "null-relative dereference",
            Autobreak::SpiWriteCollision => "SPI write collision",
            Autobreak::FxBusy => "FX command while busy",
            Autobreak::StackOverflow => "stack overflow",
        }
    }
}

/// Why the last `advance` paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakReason {
    /// Execution breakpoint at this word address
    Breakpoint(u16),
    /// Step target reached
    Step(u16),
    /// Load from a watched data address
    Read(u16),
    /// Store to a watched data address
    Write(u16),
    Autobreak(Autobreak),
}

fn bits(n: usize) -> Vec<u64> {
    vec![0; (n + 63) / 64]
}

#[inline(always)]
fn test(set: &[u64], i: usize) -> bool {
    set.get(i / 64).map_or(false, |w| w & (1 << (i % 64)) != 0)
}

fn assign(set: &mut [u64], i: usize, on: bool) {
    if let Some(w) = set.get_mut(i / 64) {
        if on {
            *w |= 1 << (i % 64);
        } else {
            *w &= !(1 << (i % 64));
        }
    }
}

/// Debugger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debugger {
    breakpoints: Vec<u64>,
    read_breakpoints: Vec<u64>,
    write_breakpoints: Vec<u64>,
    /// Pause when the PC reaches this word address; cleared when hit
    pub step_target: Option<u16>,
    enabled: u8,
    pending: u8,
    /// Reason for the most recent pause
    pub last_break: Option<BreakReason>,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger {
            breakpoints: bits(FLASH_WORDS),
            read_breakpoints: bits(DATA_SIZE),
            write_breakpoints: bits(DATA_SIZE),
            step_target: None,
            enabled: 0,
            pending: 0,
            last_break: None,
        }
    }

    /// Set or clear an execution breakpoint at a word address.
    pub fn set_breakpoint(&mut self, pc: u16, on: bool) {
        assign(&mut self.breakpoints, pc as usize, on);
    }

    pub fn has_breakpoint(&self, pc: u16) -> bool {
        test(&self.breakpoints, pc as usize)
    }

    /// Set or clear a data breakpoint triggered by loads from `addr`.
    pub fn set_read_breakpoint(&mut self, addr: u16, on: bool) {
        assign(&mut self.read_breakpoints, addr as usize, on);
    }

    /// Set or clear a data breakpoint triggered by stores to `addr`.
    pub fn set_write_breakpoint(&mut self, addr: u16, on: bool) {
        assign(&mut self.write_breakpoints, addr as usize, on);
    }

    /// Remove every breakpoint and the step target.
    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.iter_mut().for_each(|w| *w = 0);
        self.read_breakpoints.iter_mut().for_each(|w| *w = 0);
        self.write_breakpoints.iter_mut().for_each(|w| *w = 0);
        self.step_target = None;
    }

    pub fn enable(&mut self, kind: Autobreak, on: bool) {
        if on {
            self.enabled |= kind.bit();
        } else {
            self.enabled &= !kind.bit();
        }
    }

    pub fn is_enabled(&self, kind: Autobreak) -> bool {
        self.enabled & kind.bit() != 0
    }

    /// Record that an autobreak condition occurred during the current step.
    #[inline]
    pub fn raise(&mut self, kind: Autobreak) {
        self.pending |= kind.bit();
    }

    /// Evaluate breakpoints after a step. Pending autobreaks are consumed
    /// whether or not they are enabled.
    pub fn check(&mut self, cpu: &Cpu) -> Option<BreakReason> {
        let pending = std::mem::take(&mut self.pending) & self.enabled;
        let mut hit = None;
        // the PC only matters when the next step will fetch from it
        if cpu.active {
            if self.step_target == Some(cpu.pc) {
                self.step_target = None;
                hit = Some(BreakReason::Step(cpu.pc));
            } else if self.has_breakpoint(cpu.pc) {
                hit = Some(BreakReason::Breakpoint(cpu.pc));
            }
        }
        if hit.is_none() && cpu.just_read != NO_ACCESS && test(&self.read_breakpoints, cpu.just_read as usize) {
            hit = Some(BreakReason::Read(cpu.just_read));
        }
        if hit.is_none() && cpu.just_written != NO_ACCESS && test(&self.write_breakpoints, cpu.just_written as usize) {
            hit = Some(BreakReason::Write(cpu.just_written));
        }
        if hit.is_none() && pending != 0 {
            hit = Autobreak::ALL
                .into_iter()
                .find(|k| pending & k.bit() != 0)
                .map(BreakReason::Autobreak);
        }
        if hit.is_some() {
            self.last_break = hit;
        }
        hit
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}
