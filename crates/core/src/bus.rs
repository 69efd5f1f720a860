//! Data-space load/store dispatch.
//!
//! Every CPU access to the data space goes through [`Arduboy::ld`] and
//! [`Arduboy::st`]. Plain cells (registers, SRAM, unhooked I/O) are read and
//! written directly; addresses with a [`RegHook`] are routed to the peripheral
//! that owns them. The last accessed address is latched for data breakpoints.

use tracing::debug;

use crate::debugger::Autobreak;
use crate::peripherals::{reg_hook, RegHook, TimerId};
use crate::Arduboy;

impl Arduboy {
    /// Load one byte from the data space. Addresses past the end read 0.
    pub(crate) fn ld(&mut self, addr: u16) -> u8 {
        let a = addr as usize;
        if a >= self.mem.data.len() {
            return 0;
        }
        self.cpu.just_read = addr;
        let now = self.cpu.cycle_count;
        let data = &mut self.mem.data;
        match reg_hook(addr) {
            RegHook::TimerTcnt(TimerId::T0) => {
                self.timer0.update(data, now);
                data[a]
            }
            RegHook::TimerTcnt(TimerId::T1) => self.timer1.load_tcnt(data, now, addr),
            RegHook::TimerTcnt(TimerId::T3) => self.timer3.load_tcnt(data, now, addr),
            RegHook::Spsr => self.spi.load_status(data),
            RegHook::Spdr => self.spi.load_data(data),
            _ => data[a],
        }
    }

    /// Store one byte to the data space. Stores past the end are dropped.
    pub(crate) fn st(&mut self, addr: u16, v: u8) {
        let a = addr as usize;
        if a >= self.mem.data.len() {
            return;
        }
        self.cpu.just_written = addr;
        let now = self.cpu.cycle_count;
        let data = &mut self.mem.data;
        match reg_hook(addr) {
            RegHook::Plain => data[a] = v,
            RegHook::Pin => data[a + 2] ^= v,
            RegHook::TimerReg(TimerId::T0) => {
                self.timer0.catch_up(data, now);
                data[a] = v;
                self.timer0.configure(data, now);
            }
            RegHook::TimerReg(TimerId::T1) => self.timer1.store_reg(data, now, addr, v),
            RegHook::TimerReg(TimerId::T3) => self.timer3.store_reg(data, now, addr, v),
            RegHook::TimerTcnt(TimerId::T0) => self.timer0.store_tcnt(data, now, v),
            RegHook::TimerTcnt(TimerId::T1) => self.timer1.store_tcnt(data, now, addr, v),
            RegHook::TimerTcnt(TimerId::T3) => self.timer3.store_tcnt(data, now, addr, v),
            RegHook::TimerTifr(id) => {
                match id {
                    TimerId::T0 => self.timer0.catch_up(data, now),
                    TimerId::T1 => self.timer1.catch_up(data, now),
                    TimerId::T3 => self.timer3.catch_up(data, now),
                }
                data[a] &= !v;
            }
            RegHook::Gtccr => {
                if v & 0x01 != 0 {
                    // PSRSYNC: prescaler restarts from the next cycle on
                    self.timer0.catch_up(data, now);
                    self.timer1.catch_up(data, now);
                    self.timer3.catch_up(data, now);
                    self.timer0.reset_prescaler();
                    self.timer1.reset_prescaler();
                    self.timer3.reset_prescaler();
                    self.timer0.configure(data, now);
                    self.timer1.configure(data, now);
                    self.timer3.configure(data, now);
                }
                data[a] = v & !0x01;
            }
            RegHook::Prr => {
                self.timer0.catch_up(data, now);
                self.timer1.catch_up(data, now);
                self.timer3.catch_up(data, now);
                data[a] = v;
                self.timer0.configure(data, now);
                self.timer1.configure(data, now);
                self.timer3.configure(data, now);
            }
            RegHook::Spcr | RegHook::Spsr => self.spi.store_control(data, addr, v),
            RegHook::Spdr => {
                if self.spi.store_data(data, v) {
                    debug!(pc = self.cpu.executing_pc, "SPI write collision");
                    self.debugger.raise(Autobreak::SpiWriteCollision);
                }
            }
            RegHook::Eecr => {
                if self.eeprom_ctrl.store_eecr(data, &self.mem.eeprom, v) {
                    self.cpu.wakeup_cycles = 4;
                    self.cpu.active = false;
                }
            }
            RegHook::Pllcsr => self.pll.store(data, v),
            RegHook::Adcsra => self.adc.store(data, v),
            RegHook::Uedatx => {
                data[a] = v;
                self.usb.push(v);
            }
        }
    }

    /// Read-modify-write of a single I/O bit (SBI/CBI).
    pub(crate) fn st_bit(&mut self, addr: u16, bit: u8, set: bool) {
        if crate::peripherals::reg_hook(addr) == RegHook::Pin {
            // SBI on PINx toggles one PORTx bit; CBI on PINx has no effect
            if set {
                self.st(addr, 1 << bit);
            }
            return;
        }
        let v = self.mem.data[addr as usize];
        let v = if set { v | (1 << bit) } else { v & !(1 << bit) };
        self.st(addr, v);
    }
}

#[cfg(test)]
mod tests {
    use crate::peripherals::{PINB, PORTB, TCNT0, TCCR0B, TIFR0, UEDATX};
    use crate::Arduboy;

    #[test]
    fn test_out_of_range_access() {
        let mut a = Arduboy::new();
        a.st(0xFFFF, 0x12);
        assert_eq!(a.ld(0xFFFF), 0);
    }

    #[test]
    fn test_pin_write_toggles_port() {
        let mut a = Arduboy::new();
        a.mem.data[PORTB as usize] = 0x0F;
        a.st(PINB, 0x03);
        assert_eq!(a.mem.data[PORTB as usize], 0x0C);
        a.st_bit(PINB, 7, true);
        assert_eq!(a.mem.data[PORTB as usize], 0x8C);
    }

    #[test]
    fn test_tifr_write_one_to_clear() {
        let mut a = Arduboy::new();
        a.mem.data[TIFR0 as usize] = 0x07;
        a.st(TIFR0, 0x02);
        assert_eq!(a.mem.data[TIFR0 as usize], 0x05);
    }

    #[test]
    fn test_tcnt0_load_catches_up() {
        let mut a = Arduboy::new();
        a.st(TCCR0B, 0x01);
        a.cpu.cycle_count = 40;
        assert_eq!(a.ld(TCNT0), 40);
    }

    #[test]
    fn test_uedatx_appends_serial() {
        let mut a = Arduboy::new();
        a.st(UEDATX, b'P');
        a.st(UEDATX, b'!');
        assert_eq!(a.take_serial(), b"P!".to_vec());
        assert!(a.take_serial().is_empty());
    }

    #[test]
    fn test_access_latches_address() {
        let mut a = Arduboy::new();
        a.st(0x0200, 1);
        a.ld(0x0201);
        assert_eq!(a.cpu.just_written, 0x0200);
        assert_eq!(a.cpu.just_read, 0x0201);
    }
}
