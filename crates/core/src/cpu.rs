//! AVR CPU core for ATmega32u4.
//!
//! Implements the CPU state machine and instruction execution for the full
//! AVRe+ instruction set used by the 32u4: arithmetic, logic, branches,
//! load/store, I/O, multiply and bit manipulation. Execution runs on
//! [`Arduboy`] so that every data access reaches the peripheral bus
//! (see `bus.rs`).
//!
//! SREG and the stack pointer are memory-mapped (0x5F, 0x5D/0x5E); there is
//! no shadow copy in [`Cpu`]. Flag computation follows the datasheet,
//! including the carry-chain behavior of SBC/SBCI/CPC where Z is only ever
//! cleared, never set, so multi-byte comparisons work.

use serde::{Deserialize, Serialize};

use crate::debugger::Autobreak;
use crate::memory::Memory;
use crate::opcodes::{decode, Instruction, Ptr, PtrMode};
use crate::peripherals::{
    ADCSRA, ADIE, ADIF, INT_ADC, INT_TIMER0_COMPA, INT_TIMER0_COMPB, INT_TIMER0_OVF,
    INT_TIMER1_COMPA, INT_TIMER1_COMPB, INT_TIMER1_COMPC, INT_TIMER1_OVF, INT_TIMER3_COMPA,
    INT_TIMER3_COMPB, INT_TIMER3_COMPC, INT_TIMER3_OVF, SMCR, TIFR0, TIFR1, TIFR3, TIMSK0,
    TIMSK1, TIMSK3,
};
use crate::{Arduboy, FLASH_WORDS, SREG_I, SREG_T};

/// Address latch value meaning "no access this cycle".
pub const NO_ACCESS: u16 = 0xFFFF;

/// Interrupt sources in priority order: (flag register, mask register, flag
/// bit, enable bit, vector). The timers keep flag and enable at the same bit
/// position; the ADC has both in ADCSRA.
const INTERRUPTS: [(u16, u16, u8, u8, u16); 12] = [
    (TIFR1, TIMSK1, 0x02, 0x02, INT_TIMER1_COMPA),
    (TIFR1, TIMSK1, 0x04, 0x04, INT_TIMER1_COMPB),
    (TIFR1, TIMSK1, 0x08, 0x08, INT_TIMER1_COMPC),
    (TIFR1, TIMSK1, 0x01, 0x01, INT_TIMER1_OVF),
    (TIFR0, TIMSK0, 0x02, 0x02, INT_TIMER0_COMPA),
    (TIFR0, TIMSK0, 0x04, 0x04, INT_TIMER0_COMPB),
    (TIFR0, TIMSK0, 0x01, 0x01, INT_TIMER0_OVF),
    (ADCSRA, ADCSRA, ADIF, ADIE, INT_ADC),
    (TIFR3, TIMSK3, 0x02, 0x02, INT_TIMER3_COMPA),
    (TIFR3, TIMSK3, 0x04, 0x04, INT_TIMER3_COMPB),
    (TIFR3, TIMSK3, 0x08, 0x08, INT_TIMER3_COMPC),
    (TIFR3, TIMSK3, 0x01, 0x01, INT_TIMER3_OVF),
];

/// CPU state for ATmega32u4.
///
/// The register file R0–R31, SREG and SP live in [`Memory::data`]; this
/// struct holds what is not memory-mapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cpu {
    /// Program counter (word address, not byte address)
    pub pc: u16,
    /// Monotonic cycle counter since reset
    pub cycle_count: u64,
    /// False while sleeping or while an interrupt/EEPROM stall is pending
    pub active: bool,
    /// Remaining stall cycles before the CPU resumes fetching
    pub wakeup_cycles: u32,
    /// SREG as it was before the instruction that just retired
    pub prev_sreg: u8,
    /// Word address of the instruction being executed
    pub executing_pc: u16,
    /// Data address loaded during the last step, [`NO_ACCESS`] if none
    pub just_read: u16,
    /// Data address stored during the last step, [`NO_ACCESS`] if none
    pub just_written: u16,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            pc: 0,
            cycle_count: 0,
            active: true,
            wakeup_cycles: 0,
            prev_sreg: 0,
            executing_pc: 0,
            just_read: NO_ACCESS,
            just_written: NO_ACCESS,
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

// --- Flag helpers ---

/// Compute SREG flags for ADD/ADC result using ATmega32u4 flag formulas.
pub fn flags_add(mem: &mut Memory, rd: u8, rr: u8, r: u8) {
    let r7 = (r >> 7) & 1; let rd7 = (rd >> 7) & 1; let rr7 = (rr >> 7) & 1;
    let r3 = (r >> 3) & 1; let rd3 = (rd >> 3) & 1; let rr3 = (rr >> 3) & 1;
    let h = (rd3 & rr3) | (rr3 & (r3 ^ 1)) | ((r3 ^ 1) & rd3);
    let v = (rd7 & rr7 & (r7 ^ 1)) | ((rd7 ^ 1) & (rr7 ^ 1) & r7);
    let n = r7;
    let z = (r == 0) as u8;
    let c = (rd7 & rr7) | (rr7 & (r7 ^ 1)) | ((r7 ^ 1) & rd7);
    let s = n ^ v;
    let sreg = mem.sreg();
    mem.set_sreg((sreg & 0b1100_0000) | (h << 5) | (s << 4) | (v << 3) | (n << 2) | (z << 1) | c);
}

/// Compute SREG flags for SUB/SBC/CP/CPC result.
///
/// When `set_z` is false (SBC/SBCI/CPC), the Z flag is only cleared, never
/// set.
pub fn flags_sub(mem: &mut Memory, rd: u8, rr: u8, r: u8, set_z: bool) {
    let r7 = (r >> 7) & 1; let rd7 = (rd >> 7) & 1; let rr7 = (rr >> 7) & 1;
    let r3 = (r >> 3) & 1; let rd3 = (rd >> 3) & 1; let rr3 = (rr >> 3) & 1;
    let h = ((rd3 ^ 1) & rr3) | (rr3 & r3) | (r3 & (rd3 ^ 1));
    let v = (rd7 & (rr7 ^ 1) & (r7 ^ 1)) | ((rd7 ^ 1) & rr7 & r7);
    let n = r7;
    let c = ((rd7 ^ 1) & rr7) | (rr7 & r7) | (r7 & (rd7 ^ 1));
    let s = n ^ v;
    let sreg = mem.sreg();
    let z = if set_z {
        (r == 0) as u8
    } else if r != 0 {
        0
    } else {
        (sreg >> 1) & 1
    };
    mem.set_sreg((sreg & 0b1100_0000) | (h << 5) | (s << 4) | (v << 3) | (n << 2) | (z << 1) | c);
}

/// Compute SREG flags for logic operations (AND, OR, EOR). V is always cleared.
pub fn flags_logic(mem: &mut Memory, r: u8) {
    let n = (r >> 7) & 1;
    let z = (r == 0) as u8;
    let s = n; // V=0
    let sreg = mem.sreg();
    mem.set_sreg((sreg & 0b1110_0001) | (s << 4) | (n << 2) | (z << 1));
}

/// Flags for the right shifts: C is the bit shifted out, V = N ^ C.
fn flags_shift(mem: &mut Memory, rd: u8, r: u8) {
    let c = rd & 1; let n = (r >> 7) & 1; let v = n ^ c;
    let z = (r == 0) as u8; let s = n ^ v;
    let sreg = mem.sreg();
    mem.set_sreg((sreg & 0b1110_0000) | (s << 4) | (v << 3) | (n << 2) | (z << 1) | c);
}

/// Flags for INC/DEC: C and H are untouched, V is set on the signed wrap `wrap_from`.
fn flags_incdec(mem: &mut Memory, rd: u8, r: u8, wrap_from: u8) {
    let n = (r >> 7) & 1; let v = (rd == wrap_from) as u8;
    let z = (r == 0) as u8; let s = n ^ v;
    let sreg = mem.sreg();
    mem.set_sreg((sreg & 0b1110_0001) | (s << 4) | (v << 3) | (n << 2) | (z << 1));
}

/// Store a multiply product in R1:R0. `c` is the product's bit 15 before any
/// FMUL shift.
fn mul_result(mem: &mut Memory, res: u16, c: bool) {
    mem.set_reg_word(0, res);
    let z = (res == 0) as u8;
    let sreg = mem.sreg();
    mem.set_sreg((sreg & 0b1111_1100) | (z << 1) | c as u8);
}

/// Skip the next instruction (CPSE, SBRC, SBRS, SBIC, SBIS) and return the
/// cycle cost of the skip.
pub fn skip_next(cpu: &mut Cpu, mem: &Memory) -> u32 {
    let w = mem.read_program_word(cpu.pc as usize);
    let (_, size) = decode(w, 0);
    cpu.pc = cpu.pc.wrapping_add(size as u16);
    1 + size as u32
}

#[inline(always)]
fn branch(pc: u16, k: i32) -> u16 {
    (pc as i32 + k) as u16
}

// ---- Instruction execution on Arduboy ----

impl Arduboy {
    /// Execute a single decoded AVR instruction and return the cycle cost.
    ///
    /// The PC is advanced past the instruction before it executes, so
    /// relative jumps and return addresses are computed from the next word.
    pub fn execute_inst(&mut self, inst: Instruction, size: u8) -> u32 {
        self.cpu.pc = self.cpu.pc.wrapping_add(size as u16);

        match inst {
            Instruction::Nop => 1,

            // -- Arithmetic --
            Instruction::Add { d, r } => {
                let rd = self.mem.reg(d); let rr = self.mem.reg(r);
                let res = rd.wrapping_add(rr);
                self.mem.set_reg(d, res);
                flags_add(&mut self.mem, rd, rr, res); 1
            }
            Instruction::Adc { d, r } => {
                let rd = self.mem.reg(d); let rr = self.mem.reg(r);
                let c = self.mem.sreg() & 1;
                let res = rd.wrapping_add(rr).wrapping_add(c);
                self.mem.set_reg(d, res);
                flags_add(&mut self.mem, rd, rr, res); 1
            }
            Instruction::Sub { d, r } => {
                let rd = self.mem.reg(d); let rr = self.mem.reg(r);
                let res = rd.wrapping_sub(rr);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.mem, rd, rr, res, true); 1
            }
            Instruction::Subi { d, k } => {
                let rd = self.mem.reg(d);
                let res = rd.wrapping_sub(k);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.mem, rd, k, res, true); 1
            }
            Instruction::Sbc { d, r } => {
                let rd = self.mem.reg(d); let rr = self.mem.reg(r);
                let c = self.mem.sreg() & 1;
                let res = rd.wrapping_sub(rr).wrapping_sub(c);
                self.mem.set_reg(d, res);
                // flag formulas take the original Rr; R already includes the carry
                flags_sub(&mut self.mem, rd, rr, res, false); 1
            }
            Instruction::Sbci { d, k } => {
                let rd = self.mem.reg(d);
                let c = self.mem.sreg() & 1;
                let res = rd.wrapping_sub(k).wrapping_sub(c);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.mem, rd, k, res, false); 1
            }
            Instruction::And { d, r } => {
                let res = self.mem.reg(d) & self.mem.reg(r);
                self.mem.set_reg(d, res);
                flags_logic(&mut self.mem, res); 1
            }
            Instruction::Andi { d, k } => {
                let res = self.mem.reg(d) & k;
                self.mem.set_reg(d, res);
                flags_logic(&mut self.mem, res); 1
            }
            Instruction::Or { d, r } => {
                let res = self.mem.reg(d) | self.mem.reg(r);
                self.mem.set_reg(d, res);
                flags_logic(&mut self.mem, res); 1
            }
            Instruction::Ori { d, k } => {
                let res = self.mem.reg(d) | k;
                self.mem.set_reg(d, res);
                flags_logic(&mut self.mem, res); 1
            }
            Instruction::Eor { d, r } => {
                let res = self.mem.reg(d) ^ self.mem.reg(r);
                self.mem.set_reg(d, res);
                flags_logic(&mut self.mem, res); 1
            }
            Instruction::Com { d } => {
                let res = !self.mem.reg(d);
                self.mem.set_reg(d, res);
                let n = (res >> 7) & 1; let z = (res == 0) as u8; let s = n;
                let sreg = self.mem.sreg();
                self.mem.set_sreg((sreg & 0b1110_0000) | (s << 4) | (n << 2) | (z << 1) | 1); 1
            }
            Instruction::Neg { d } => {
                let rd = self.mem.reg(d);
                let res = 0u8.wrapping_sub(rd);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.mem, 0, rd, res, true); 1
            }
            Instruction::Inc { d } => {
                let rd = self.mem.reg(d); let res = rd.wrapping_add(1);
                self.mem.set_reg(d, res);
                flags_incdec(&mut self.mem, rd, res, 0x7F); 1
            }
            Instruction::Dec { d } => {
                let rd = self.mem.reg(d); let res = rd.wrapping_sub(1);
                self.mem.set_reg(d, res);
                flags_incdec(&mut self.mem, rd, res, 0x80); 1
            }
            Instruction::Mul { d, r } => {
                let res = (self.mem.reg(d) as u16) * (self.mem.reg(r) as u16);
                mul_result(&mut self.mem, res, res & 0x8000 != 0); 2
            }
            Instruction::Muls { d, r } => {
                let res = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i8 as i16)) as u16;
                mul_result(&mut self.mem, res, res & 0x8000 != 0); 2
            }
            Instruction::Mulsu { d, r } => {
                let res = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i16)) as u16;
                mul_result(&mut self.mem, res, res & 0x8000 != 0); 2
            }
            Instruction::Fmul { d, r } => {
                let p = (self.mem.reg(d) as u16) * (self.mem.reg(r) as u16);
                mul_result(&mut self.mem, p << 1, p & 0x8000 != 0); 2
            }
            Instruction::Fmuls { d, r } => {
                let p = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i8 as i16)) as u16;
                mul_result(&mut self.mem, p << 1, p & 0x8000 != 0); 2
            }
            Instruction::Fmulsu { d, r } => {
                let p = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i16)) as u16;
                mul_result(&mut self.mem, p << 1, p & 0x8000 != 0); 2
            }
            Instruction::Adiw { d, k } => {
                let val = self.mem.reg_word(d);
                let res = val.wrapping_add(k as u16);
                self.mem.set_reg_word(d, res);
                let rdh7 = (val >> 15) as u8; let r15 = (res >> 15) as u8;
                let v = (rdh7 ^ 1) & r15; let n = r15; let z = (res == 0) as u8;
                let c = (r15 ^ 1) & rdh7; let s = n ^ v;
                let sreg = self.mem.sreg();
                self.mem.set_sreg((sreg & 0b1110_0000) | (s << 4) | (v << 3) | (n << 2) | (z << 1) | c); 2
            }
            Instruction::Sbiw { d, k } => {
                let val = self.mem.reg_word(d);
                let res = val.wrapping_sub(k as u16);
                self.mem.set_reg_word(d, res);
                let rdh7 = (val >> 15) as u8; let r15 = (res >> 15) as u8;
                let v = rdh7 & (r15 ^ 1); let n = r15; let z = (res == 0) as u8;
                let c = r15 & (rdh7 ^ 1); let s = n ^ v;
                let sreg = self.mem.sreg();
                self.mem.set_sreg((sreg & 0b1110_0000) | (s << 4) | (v << 3) | (n << 2) | (z << 1) | c); 2
            }

            // -- Compare --
            Instruction::Cp { d, r } => {
                let rd = self.mem.reg(d); let rr = self.mem.reg(r);
                flags_sub(&mut self.mem, rd, rr, rd.wrapping_sub(rr), true); 1
            }
            Instruction::Cpc { d, r } => {
                let rd = self.mem.reg(d); let rr = self.mem.reg(r);
                let c = self.mem.sreg() & 1;
                let res = rd.wrapping_sub(rr).wrapping_sub(c);
                flags_sub(&mut self.mem, rd, rr, res, false); 1
            }
            Instruction::Cpi { d, k } => {
                let rd = self.mem.reg(d);
                flags_sub(&mut self.mem, rd, k, rd.wrapping_sub(k), true); 1
            }

            // -- Data Transfer --
            Instruction::Mov { d, r } => { let v = self.mem.reg(r); self.mem.set_reg(d, v); 1 }
            Instruction::Movw { d, r } => { let v = self.mem.reg_word(r); self.mem.set_reg_word(d, v); 1 }
            Instruction::Ldi { d, k } => { self.mem.set_reg(d, k); 1 }
            Instruction::Lds { d, k } => { let v = self.ld(k); self.mem.set_reg(d, v); 2 }
            Instruction::Sts { k, r } => { let v = self.mem.reg(r); self.st(k, v); 2 }
            Instruction::Ld { d, ptr, mode } => {
                let a = self.ptr_addr(ptr, mode);
                let v = self.ld(a);
                self.mem.set_reg(d, v); 2
            }
            Instruction::St { r, ptr, mode } => {
                let v = self.mem.reg(r);
                let a = self.ptr_addr(ptr, mode);
                self.st(a, v); 2
            }
            Instruction::Ldd { d, ptr, q } => {
                let base = self.mem.reg_word(ptr.reg());
                if base == 0 {
                    self.debugger.raise(Autobreak::NullRelDeref);
                }
                let v = self.ld(base.wrapping_add(q as u16));
                self.mem.set_reg(d, v); 2
            }
            Instruction::Std { r, ptr, q } => {
                let base = self.mem.reg_word(ptr.reg());
                if base == 0 {
                    self.debugger.raise(Autobreak::NullRelDeref);
                }
                let v = self.mem.reg(r);
                self.st(base.wrapping_add(q as u16), v); 2
            }
            Instruction::Lpm { d, inc } => {
                let z = self.mem.z();
                let v = self.mem.read_flash_byte(z as usize);
                self.mem.set_reg(d, v);
                if inc {
                    self.mem.set_z(z.wrapping_add(1));
                }
                3
            }

            // -- Stack --
            Instruction::Push { r } => { let v = self.mem.reg(r); self.push(v); 2 }
            Instruction::Pop { d } => { let v = self.pop(); self.mem.set_reg(d, v); 2 }

            // -- Shift/Bit --
            Instruction::Lsr { d } => {
                let rd = self.mem.reg(d); let res = rd >> 1;
                self.mem.set_reg(d, res);
                flags_shift(&mut self.mem, rd, res); 1
            }
            Instruction::Asr { d } => {
                let rd = self.mem.reg(d); let res = ((rd as i8) >> 1) as u8;
                self.mem.set_reg(d, res);
                flags_shift(&mut self.mem, rd, res); 1
            }
            Instruction::Ror { d } => {
                let rd = self.mem.reg(d);
                let res = (rd >> 1) | ((self.mem.sreg() & 1) << 7);
                self.mem.set_reg(d, res);
                flags_shift(&mut self.mem, rd, res); 1
            }
            Instruction::Swap { d } => {
                let rd = self.mem.reg(d);
                self.mem.set_reg(d, rd.rotate_left(4)); 1
            }
            Instruction::Bst { d, b } => {
                let t = (self.mem.reg(d) >> b) & 1;
                let sreg = self.mem.sreg();
                self.mem.set_sreg((sreg & !(1 << SREG_T)) | (t << SREG_T)); 1
            }
            Instruction::Bld { d, b } => {
                let mut rd = self.mem.reg(d);
                if self.mem.flag(SREG_T) { rd |= 1 << b; } else { rd &= !(1 << b); }
                self.mem.set_reg(d, rd); 1
            }
            Instruction::Bset { s } => { let sreg = self.mem.sreg(); self.mem.set_sreg(sreg | (1 << s)); 1 }
            Instruction::Bclr { s } => { let sreg = self.mem.sreg(); self.mem.set_sreg(sreg & !(1 << s)); 1 }
            Instruction::Sbi { a, b } => { self.st_bit(a, b, true); 2 }
            Instruction::Cbi { a, b } => { self.st_bit(a, b, false); 2 }

            // -- Branch --
            Instruction::Rjmp { k } => { self.cpu.pc = branch(self.cpu.pc, k as i32); 2 }
            Instruction::Jmp { k } => { self.cpu.pc = k; 3 }
            Instruction::Ijmp => {
                if self.oob_indirect() {
                    // suppressed so the jump site can be inspected
                    self.cpu.pc = self.cpu.pc.wrapping_sub(size as u16);
                    return 2;
                }
                self.cpu.pc = self.mem.z(); 2
            }
            Instruction::Rcall { k } => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = branch(ret, k as i32); 3
            }
            Instruction::Call { k } => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = k; 4
            }
            Instruction::Icall => {
                if self.oob_indirect() {
                    self.cpu.pc = self.cpu.pc.wrapping_sub(size as u16);
                    return 3;
                }
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = self.mem.z(); 3
            }
            Instruction::Ret => { self.cpu.pc = self.pop_word(); 4 }
            Instruction::Reti => {
                self.cpu.pc = self.pop_word();
                let sreg = self.mem.sreg();
                self.mem.set_sreg(sreg | (1 << SREG_I)); 4
            }
            Instruction::Cpse { d, r } => {
                if self.mem.reg(d) == self.mem.reg(r) {
                    return skip_next(&mut self.cpu, &self.mem);
                } 1
            }
            Instruction::Sbrc { r, b } => {
                if self.mem.reg(r) & (1 << b) == 0 {
                    return skip_next(&mut self.cpu, &self.mem);
                } 1
            }
            Instruction::Sbrs { r, b } => {
                if self.mem.reg(r) & (1 << b) != 0 {
                    return skip_next(&mut self.cpu, &self.mem);
                } 1
            }
            Instruction::Sbic { a, b } => {
                if self.ld(a) & (1 << b) == 0 {
                    return skip_next(&mut self.cpu, &self.mem);
                } 1
            }
            Instruction::Sbis { a, b } => {
                if self.ld(a) & (1 << b) != 0 {
                    return skip_next(&mut self.cpu, &self.mem);
                } 1
            }
            Instruction::Brbs { s, k } => {
                if self.mem.flag(s) {
                    self.cpu.pc = branch(self.cpu.pc, k as i32); return 2;
                } 1
            }
            Instruction::Brbc { s, k } => {
                if !self.mem.flag(s) {
                    self.cpu.pc = branch(self.cpu.pc, k as i32); return 2;
                } 1
            }

            // -- I/O --
            Instruction::In { d, a } => { let v = self.ld(a); self.mem.set_reg(d, v); 1 }
            Instruction::Out { a, r } => { let v = self.mem.reg(r); self.st(a, v); 1 }

            // -- Misc --
            Instruction::Sleep => {
                if self.mem.data[SMCR as usize] & 0x01 != 0 {
                    self.cpu.active = false;
                }
                1
            }
            Instruction::Break => { self.debugger.raise(Autobreak::Break); 1 }
            // no watchdog, and flash is never self-programmed
            Instruction::Wdr | Instruction::Spm => 1,
            Instruction::Unknown(_) => 1,
        }
    }

    /// Resolve the address of an LD/ST through X/Y/Z, applying post-increment
    /// or pre-decrement to the pointer register.
    fn ptr_addr(&mut self, ptr: Ptr, mode: PtrMode) -> u16 {
        let r = ptr.reg();
        let p = self.mem.reg_word(r);
        match mode {
            PtrMode::Plain => p,
            PtrMode::PostInc => {
                self.mem.set_reg_word(r, p.wrapping_add(1));
                p
            }
            PtrMode::PreDec => {
                let p = p.wrapping_sub(1);
                self.mem.set_reg_word(r, p);
                p
            }
        }
    }

    /// True when Z points past the loaded program and the out-of-bounds
    /// indirect jump class is enabled (the jump is then suppressed).
    fn oob_indirect(&mut self) -> bool {
        if (self.mem.z() as u32) < self.program_end / 2 {
            return false;
        }
        self.debugger.raise(Autobreak::OobIjmp);
        self.debugger.is_enabled(Autobreak::OobIjmp)
    }

    fn push(&mut self, v: u8) {
        let sp = self.mem.sp();
        self.st(sp, v);
        let sp = sp.wrapping_sub(1);
        self.mem.set_sp(sp);
        if sp < self.config.stack_limit {
            self.debugger.raise(Autobreak::StackOverflow);
        }
    }

    fn pop(&mut self) -> u8 {
        let sp = self.mem.sp().wrapping_add(1);
        self.mem.set_sp(sp);
        self.ld(sp)
    }

    /// Push a return address: low byte first, so the high byte ends up at
    /// the lower address.
    fn push_word(&mut self, val: u16) {
        self.push(val as u8);
        self.push((val >> 8) as u8);
    }

    fn pop_word(&mut self) -> u16 {
        let hi = self.pop();
        let lo = self.pop();
        (hi as u16) << 8 | lo as u16
    }

    /// Cycles consumed per step while asleep: the fastest running timer
    /// prescaler, at most 1024.
    fn sleep_min_cycles(&self) -> u32 {
        [self.timer0.divider, self.timer1.divider, self.timer3.divider]
            .into_iter()
            .filter(|&d| d != 0)
            .fold(1024, u32::min)
    }

    /// Run one CPU step: a wake-up stall cycle, a sleep fast-forward, or one
    /// instruction. Peripherals then catch up and pending interrupts are
    /// dispatched. Returns the number of cycles consumed.
    pub(crate) fn advance_cycle(&mut self) -> u32 {
        let mut cycles = 1;
        self.cpu.just_read = NO_ACCESS;
        self.cpu.just_written = NO_ACCESS;

        if !self.cpu.active && self.cpu.wakeup_cycles > 0 {
            // attribute the stall to the interrupted instruction, not the vector
            if self.cpu.wakeup_cycles == 4 {
                self.cpu.executing_pc = self.cpu.pc;
            }
            self.cpu.wakeup_cycles -= 1;
            if self.cpu.wakeup_cycles == 0 {
                self.cpu.active = true;
            }
        } else if !self.cpu.active {
            cycles = self.sleep_min_cycles();
        }

        if self.cpu.active {
            let pc = self.cpu.pc % FLASH_WORDS as u16;
            self.cpu.pc = pc;
            self.cpu.executing_pc = pc;
            self.cpu.prev_sreg = self.mem.sreg();
            let (inst, size) = self.decoded[pc as usize];
            cycles = self.execute_inst(inst, size);
            self.cpu.pc %= FLASH_WORDS as u16;
        }
        self.cpu.cycle_count += cycles as u64;
        let now = self.cpu.cycle_count;

        let data = &mut self.mem.data;
        self.spi.tick(data, cycles);
        self.pll.tick(data, cycles);
        self.adc.tick(data, cycles);
        self.eeprom_ctrl.tick(data, &mut self.mem.eeprom, cycles);
        if now >= self.timer0.next_update_cycle {
            self.timer0.update(data, now);
        }
        if now >= self.timer1.next_update_cycle {
            self.timer1.update(data, now);
        }
        if now >= self.timer3.next_update_cycle {
            self.timer3.update(data, now);
        }

        for (tifr, timsk, flag, enable, vector) in INTERRUPTS {
            let data = &self.mem.data;
            if data[tifr as usize] & flag != 0 && data[timsk as usize] & enable != 0 {
                self.dispatch_interrupt(tifr, flag, vector);
            }
        }

        cycles
    }

    /// Enter an interrupt vector if the CPU can take it: I was set before the
    /// last instruction and no other dispatch or stall is in progress.
    fn dispatch_interrupt(&mut self, tifr: u16, flag: u8, vector: u16) {
        if self.cpu.wakeup_cycles != 0 || self.cpu.prev_sreg & (1 << SREG_I) == 0 {
            return;
        }
        let pc = self.cpu.pc;
        self.push_word(pc);
        self.cpu.pc = vector;
        self.mem.data[tifr as usize] &= !flag;
        let sreg = self.mem.sreg();
        self.mem.set_sreg(sreg & !(1 << SREG_I));
        self.cpu.wakeup_cycles = if self.cpu.active { 4 } else { 8 };
        self.cpu.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::Instruction;
    use crate::peripherals::{TCCR0B, TIMSK0};
    use crate::{Arduboy, SREG_C, SREG_Z};

    fn machine() -> Arduboy {
        let mut a = Arduboy::new();
        a.mem.set_sp(0x0AFF);
        a
    }

    #[test]
    fn test_add() {
        let mut a = machine();
        a.mem.set_reg(0, 10); a.mem.set_reg(1, 20);
        a.execute_inst(Instruction::Add { d: 0, r: 1 }, 1);
        assert_eq!(a.mem.reg(0), 30);
    }

    #[test]
    fn test_add_overflow() {
        let mut a = machine();
        a.mem.set_reg(0, 200); a.mem.set_reg(1, 100);
        a.execute_inst(Instruction::Add { d: 0, r: 1 }, 1);
        assert_eq!(a.mem.reg(0), 44);
        assert!(a.mem.flag(SREG_C));
    }

    #[test]
    fn test_sub() {
        let mut a = machine();
        a.mem.set_reg(0, 30); a.mem.set_reg(1, 20);
        a.execute_inst(Instruction::Sub { d: 0, r: 1 }, 1);
        assert_eq!(a.mem.reg(0), 10);
        assert!(!a.mem.flag(SREG_C));
    }

    #[test]
    fn test_push_pop() {
        let mut a = machine();
        a.mem.set_reg(5, 0x42);
        a.execute_inst(Instruction::Push { r: 5 }, 1);
        assert_eq!(a.mem.sp(), 0x0AFE);
        assert_eq!(a.mem.data[0x0AFF], 0x42);
        a.execute_inst(Instruction::Pop { d: 10 }, 1);
        assert_eq!(a.mem.sp(), 0x0AFF);
        assert_eq!(a.mem.reg(10), 0x42);
    }

    #[test]
    fn test_rcall_ret() {
        let mut a = machine();
        a.cpu.pc = 0x100;
        assert_eq!(a.execute_inst(Instruction::Rcall { k: 5 }, 1), 3);
        assert_eq!(a.cpu.pc, 0x106); // 0x100+1+5
        // return address low byte is pushed first
        assert_eq!(a.mem.data[0x0AFF], 0x01);
        assert_eq!(a.mem.data[0x0AFE], 0x01);
        assert_eq!(a.execute_inst(Instruction::Ret, 1), 4);
        assert_eq!(a.cpu.pc, 0x101);
    }

    #[test]
    fn test_branch_taken() {
        let mut a = machine();
        a.cpu.pc = 0x50;
        a.mem.set_sreg(1 << SREG_Z);
        let c = a.execute_inst(Instruction::Brbs { s: SREG_Z, k: 3 }, 1);
        assert_eq!(c, 2);
        assert_eq!(a.cpu.pc, 0x54);
    }

    #[test]
    fn test_branch_not_taken() {
        let mut a = machine();
        a.cpu.pc = 0x50;
        a.mem.set_sreg(0);
        let c = a.execute_inst(Instruction::Brbs { s: SREG_Z, k: 3 }, 1);
        assert_eq!(c, 1);
        assert_eq!(a.cpu.pc, 0x51);
    }

    #[test]
    fn test_skip_two_word_instruction() {
        let mut a = machine();
        // word 1: JMP 0x0000 (two words)
        a.mem.flash[2] = 0x0C;
        a.mem.flash[3] = 0x94;
        a.decode_flash();
        a.mem.set_reg(4, 7);
        a.mem.set_reg(5, 7);
        let c = a.execute_inst(Instruction::Cpse { d: 4, r: 5 }, 1);
        assert_eq!(c, 3);
        assert_eq!(a.cpu.pc, 3);
    }

    #[test]
    fn test_lpm() {
        let mut a = machine();
        a.mem.flash[0x100] = 0x42;
        a.mem.set_z(0x100);
        assert_eq!(a.execute_inst(Instruction::Lpm { d: 5, inc: true }, 1), 3);
        assert_eq!(a.mem.reg(5), 0x42);
        assert_eq!(a.mem.z(), 0x101);
    }

    #[test]
    fn test_mul() {
        let mut a = machine();
        a.mem.set_reg(2, 10); a.mem.set_reg(3, 20);
        a.execute_inst(Instruction::Mul { d: 2, r: 3 }, 1);
        assert_eq!(a.mem.reg(0), 0xC8); // 200 lo
        assert_eq!(a.mem.reg(1), 0x00); // 200 hi
    }

    #[test]
    fn test_fmul_carry_from_unshifted_product() {
        let mut a = machine();
        a.mem.set_reg(16, 0xC0); a.mem.set_reg(17, 0xC0);
        a.execute_inst(Instruction::Fmul { d: 16, r: 17 }, 1);
        // 0xC0 * 0xC0 = 0x9000, shifted 0x2000
        assert_eq!(a.mem.reg_word(0), 0x2000);
        assert!(a.mem.flag(SREG_C));
    }

    #[test]
    fn test_adiw() {
        let mut a = machine();
        a.mem.set_z(0x1000);
        a.execute_inst(Instruction::Adiw { d: 30, k: 5 }, 1);
        assert_eq!(a.mem.z(), 0x1005);
    }

    #[test]
    fn test_sbiw_borrow() {
        let mut a = machine();
        a.mem.set_reg_word(24, 0x0001);
        a.execute_inst(Instruction::Sbiw { d: 24, k: 2 }, 1);
        assert_eq!(a.mem.reg_word(24), 0xFFFF);
        assert!(a.mem.flag(SREG_C));
    }

    #[test]
    fn test_io_in_out() {
        let mut a = machine();
        a.mem.set_reg(16, 0x42);
        // SREG is at data space 0x5F (decoder adds 0x20 to I/O addr 0x3F)
        a.execute_inst(Instruction::Out { a: 0x5F, r: 16 }, 1);
        assert_eq!(a.mem.sreg(), 0x42);
        a.execute_inst(Instruction::In { d: 17, a: 0x5F }, 1);
        assert_eq!(a.mem.reg(17), 0x42);
    }

    #[test]
    fn test_ld_post_increment() {
        let mut a = machine();
        a.mem.data[0x0200] = 0x11;
        a.mem.set_reg_word(26, 0x0200);
        a.execute_inst(Instruction::Ld { d: 0, ptr: Ptr::X, mode: PtrMode::PostInc }, 1);
        assert_eq!(a.mem.reg(0), 0x11);
        assert_eq!(a.mem.x(), 0x0201);
    }

    #[test]
    fn test_sbci_carry_propagation() {
        // 32-bit increment via SUBI/SBCI chain: 0x000000FF + 1
        let mut a = machine();
        a.mem.set_reg(24, 0xFF);
        a.mem.set_reg(25, 0x00);
        a.mem.set_reg(26, 0x00);
        a.mem.set_reg(27, 0x00);
        a.execute_inst(Instruction::Subi { d: 24, k: 0xFF }, 1);
        a.execute_inst(Instruction::Sbci { d: 25, k: 0xFF }, 1);
        a.execute_inst(Instruction::Sbci { d: 26, k: 0xFF }, 1);
        a.execute_inst(Instruction::Sbci { d: 27, k: 0xFF }, 1);
        assert_eq!(a.mem.reg(24), 0x00);
        assert_eq!(a.mem.reg(25), 0x01);
        assert_eq!(a.mem.reg(26), 0x00);
        assert_eq!(a.mem.reg(27), 0x00);
    }

    #[test]
    fn test_cpc_16bit_compare() {
        // 0x0100 vs 0x00FF
        let mut a = machine();
        a.mem.set_reg(20, 0x00);
        a.mem.set_reg(21, 0x01);
        a.mem.set_reg(22, 0xFF);
        a.mem.set_reg(23, 0x00);
        a.execute_inst(Instruction::Cp { d: 20, r: 22 }, 1);
        a.execute_inst(Instruction::Cpc { d: 21, r: 23 }, 1);
        assert_eq!(a.mem.sreg() & 1, 0, "C flag should be clear: 0x0100 > 0x00FF");
        assert!(!a.mem.flag(SREG_Z));
    }

    #[test]
    fn test_unknown_opcode_is_nop() {
        let mut a = machine();
        a.cpu.pc = 7;
        assert_eq!(a.execute_inst(Instruction::Unknown(0xFFFF), 1), 1);
        assert_eq!(a.cpu.pc, 8);
    }

    #[test]
    fn test_interrupt_dispatch() {
        let mut a = machine();
        // Timer0 overflow pending and enabled
        a.mem.data[TIFR0 as usize] = 0x01;
        a.mem.data[TIMSK0 as usize] = 0x01;
        a.mem.set_sreg(1 << SREG_I);
        a.decode_flash();
        a.advance_cycle();
        assert_eq!(a.cpu.pc, INT_TIMER0_OVF);
        assert_eq!(a.mem.data[TIFR0 as usize] & 1, 0);
        assert!(!a.mem.flag(SREG_I));
        assert_eq!(a.cpu.wakeup_cycles, 4);
        // return address 1, high byte at the lower address
        assert_eq!(a.mem.data[0x0AFF], 0x01);
        assert_eq!(a.mem.data[0x0AFE], 0x00);
    }

    #[test]
    fn test_sei_delays_interrupt_one_instruction() {
        let mut a = machine();
        a.mem.flash[0] = 0x78; // SEI
        a.mem.flash[1] = 0x94;
        a.decode_flash();
        a.mem.data[TIFR0 as usize] = 0x01;
        a.mem.data[TIMSK0 as usize] = 0x01;
        a.advance_cycle();
        assert_eq!(a.cpu.pc, 1);
        a.advance_cycle();
        assert_eq!(a.cpu.pc, INT_TIMER0_OVF);
    }

    #[test]
    fn test_interrupt_blocked_with_i_clear() {
        let mut a = machine();
        a.mem.data[TIFR0 as usize] = 0x01;
        a.mem.data[TIMSK0 as usize] = 0x01;
        a.decode_flash();
        a.advance_cycle();
        assert_eq!(a.cpu.pc, 1);
        assert_eq!(a.mem.data[TIFR0 as usize] & 1, 1);
    }

    #[test]
    fn test_sleep_fast_forwards_by_prescaler() {
        let mut a = machine();
        a.mem.data[SMCR as usize] = 0x01;
        a.st(TCCR0B, 0x03); // clk/64
        a.execute_inst(Instruction::Sleep, 1);
        assert!(!a.cpu.active);
        a.decode_flash();
        assert_eq!(a.advance_cycle(), 64);
    }

    /// (instruction, data before, SREG before, data after, SREG after, PC
    /// after, cycles). Every case starts at PC 0x10 with SP 0x0AF0 and a
    /// two-word JMP at 0x11 for the skips to jump over.
    type Case = (Instruction, &'static [(u16, u8)], u8, &'static [(u16, u8)], u8, u16, u32);

    const INSTRUCTION_TABLE: &[Case] = {
        use Instruction::*;
        &[
            (Nop, &[], 0x00, &[], 0x00, 0x11, 1),
            (Movw { d: 2, r: 4 }, &[(4, 0x34), (5, 0x12)], 0x00, &[(2, 0x34), (3, 0x12)], 0x00, 0x11, 1),
            (Mul { d: 16, r: 17 }, &[(16, 0xFF), (17, 0xFF)], 0x00, &[(0, 0x01), (1, 0xFE)], 0x01, 0x11, 2),
            (Mul { d: 2, r: 3 }, &[(2, 0x00), (3, 0x55)], 0x01, &[(0, 0x00), (1, 0x00)], 0x02, 0x11, 2),
            (Muls { d: 16, r: 17 }, &[(16, 0x80), (17, 0x80)], 0x00, &[(0, 0x00), (1, 0x40)], 0x00, 0x11, 2),
            (Mulsu { d: 16, r: 17 }, &[(16, 0x80), (17, 0xFF)], 0x00, &[(0, 0x80), (1, 0x80)], 0x01, 0x11, 2),
            (Fmul { d: 16, r: 17 }, &[(16, 0x80), (17, 0x80)], 0x00, &[(0, 0x00), (1, 0x80)], 0x00, 0x11, 2),
            (Fmuls { d: 16, r: 17 }, &[(16, 0xC0), (17, 0x40)], 0x00, &[(0, 0x00), (1, 0xE0)], 0x01, 0x11, 2),
            (Fmulsu { d: 16, r: 17 }, &[(16, 0xC0), (17, 0x80)], 0x00, &[(0, 0x00), (1, 0xC0)], 0x01, 0x11, 2),
            (Add { d: 0, r: 1 }, &[(0, 0x7F), (1, 0x01)], 0x00, &[(0, 0x80)], 0x2C, 0x11, 1),
            (Adc { d: 0, r: 1 }, &[(0, 0xFF), (1, 0x00)], 0x01, &[(0, 0x00)], 0x23, 0x11, 1),
            (Sub { d: 0, r: 1 }, &[(0, 0x10), (1, 0x20)], 0x00, &[(0, 0xF0)], 0x15, 0x11, 1),
            // zero result keeps Z from the lower byte
            (Sbc { d: 0, r: 1 }, &[(0, 0x05), (1, 0x04)], 0x03, &[(0, 0x00)], 0x02, 0x11, 1),
            (Sbc { d: 0, r: 1 }, &[(0, 0x05), (1, 0x05)], 0x00, &[(0, 0x00)], 0x00, 0x11, 1),
            (Cp { d: 0, r: 1 }, &[(0, 0x40), (1, 0x41)], 0x00, &[(0, 0x40)], 0x35, 0x11, 1),
            (Cpc { d: 0, r: 1 }, &[(0, 0x00), (1, 0x00)], 0x03, &[(0, 0x00)], 0x35, 0x11, 1),
            (Cpse { d: 0, r: 1 }, &[(0, 0x07), (1, 0x07)], 0x00, &[], 0x00, 0x13, 3),
            (And { d: 0, r: 1 }, &[(0, 0xF0), (1, 0x0F)], 0x09, &[(0, 0x00)], 0x03, 0x11, 1),
            (Or { d: 0, r: 1 }, &[(0, 0x80), (1, 0x01)], 0x00, &[(0, 0x81)], 0x14, 0x11, 1),
            (Eor { d: 0, r: 1 }, &[(0, 0xFF), (1, 0x0F)], 0x08, &[(0, 0xF0)], 0x14, 0x11, 1),
            (Mov { d: 0, r: 1 }, &[(1, 0x99)], 0x00, &[(0, 0x99)], 0x00, 0x11, 1),
            (Cpi { d: 16, k: 0x10 }, &[(16, 0x10)], 0x01, &[(16, 0x10)], 0x02, 0x11, 1),
            (Sbci { d: 16, k: 0x00 }, &[(16, 0x00)], 0x03, &[(16, 0xFF)], 0x35, 0x11, 1),
            (Subi { d: 16, k: 0x01 }, &[(16, 0x80)], 0x00, &[(16, 0x7F)], 0x38, 0x11, 1),
            (Ori { d: 16, k: 0x80 }, &[(16, 0x01)], 0x00, &[(16, 0x81)], 0x14, 0x11, 1),
            (Andi { d: 16, k: 0x0F }, &[(16, 0x3C)], 0x1E, &[(16, 0x0C)], 0x00, 0x11, 1),
            (Ldi { d: 16, k: 0xA5 }, &[], 0x40, &[(16, 0xA5)], 0x40, 0x11, 1),
            (Adiw { d: 24, k: 1 }, &[(24, 0xFF), (25, 0x7F)], 0x00, &[(24, 0x00), (25, 0x80)], 0x0C, 0x11, 2),
            (Sbiw { d: 24, k: 1 }, &[(24, 0x00), (25, 0x00)], 0x00, &[(24, 0xFF), (25, 0xFF)], 0x15, 0x11, 2),
            (Com { d: 0 }, &[(0, 0x00)], 0x08, &[(0, 0xFF)], 0x15, 0x11, 1),
            (Neg { d: 0 }, &[(0, 0x80)], 0x00, &[(0, 0x80)], 0x0D, 0x11, 1),
            (Swap { d: 0 }, &[(0, 0x12)], 0x00, &[(0, 0x21)], 0x00, 0x11, 1),
            // V on the signed wraps, C untouched
            (Inc { d: 0 }, &[(0, 0x7F)], 0x01, &[(0, 0x80)], 0x0D, 0x11, 1),
            (Inc { d: 0 }, &[(0, 0xFF)], 0x20, &[(0, 0x00)], 0x22, 0x11, 1),
            (Dec { d: 0 }, &[(0, 0x80)], 0x00, &[(0, 0x7F)], 0x18, 0x11, 1),
            (Asr { d: 0 }, &[(0, 0x81)], 0x00, &[(0, 0xC0)], 0x15, 0x11, 1),
            (Lsr { d: 0 }, &[(0, 0x01)], 0x00, &[(0, 0x00)], 0x1B, 0x11, 1),
            (Ror { d: 0 }, &[(0, 0x02)], 0x01, &[(0, 0x81)], 0x0C, 0x11, 1),
            (Ldd { d: 0, ptr: Ptr::Y, q: 5 }, &[(28, 0x00), (29, 0x02), (0x0205, 0x66)], 0x00, &[(0, 0x66)], 0x00, 0x11, 2),
            (Std { r: 0, ptr: Ptr::Z, q: 3 }, &[(30, 0x00), (31, 0x02), (0, 0x77)], 0x00, &[(0x0203, 0x77)], 0x00, 0x11, 2),
            (Ld { d: 0, ptr: Ptr::X, mode: PtrMode::PreDec }, &[(26, 0x01), (27, 0x02), (0x0200, 0x11)], 0x00, &[(0, 0x11), (26, 0x00)], 0x00, 0x11, 2),
            (St { r: 0, ptr: Ptr::Y, mode: PtrMode::PostInc }, &[(28, 0x00), (29, 0x02), (0, 0x22)], 0x00, &[(0x0200, 0x22), (28, 0x01)], 0x00, 0x11, 2),
            (Lds { d: 0, k: 0x0210 }, &[(0x0210, 0x44)], 0x00, &[(0, 0x44)], 0x00, 0x12, 2),
            (Sts { k: 0x0210, r: 0 }, &[(0, 0x55)], 0x00, &[(0x0210, 0x55)], 0x00, 0x12, 2),
            (Lpm { d: 0, inc: false }, &[(30, 0x22), (31, 0x00)], 0x00, &[(0, 0x0C), (30, 0x22)], 0x00, 0x11, 3),
            (Push { r: 0 }, &[(0, 0x42)], 0x00, &[(0x0AF0, 0x42), (0x5D, 0xEF), (0x5E, 0x0A)], 0x00, 0x11, 2),
            (Pop { d: 0 }, &[(0x0AF1, 0x42)], 0x00, &[(0, 0x42), (0x5D, 0xF1)], 0x00, 0x11, 2),
            (In { d: 0, a: 0x3E }, &[(0x3E, 0x5A)], 0x00, &[(0, 0x5A)], 0x00, 0x11, 1),
            (Out { a: 0x3E, r: 0 }, &[(0, 0xA5)], 0x00, &[(0x3E, 0xA5)], 0x00, 0x11, 1),
            (Sbi { a: 0x3E, b: 3 }, &[(0x3E, 0x00)], 0x00, &[(0x3E, 0x08)], 0x00, 0x11, 2),
            (Cbi { a: 0x3E, b: 3 }, &[(0x3E, 0xFF)], 0x00, &[(0x3E, 0xF7)], 0x00, 0x11, 2),
            (Sbic { a: 0x3E, b: 0 }, &[(0x3E, 0xFE)], 0x00, &[], 0x00, 0x13, 3),
            (Sbis { a: 0x3E, b: 0 }, &[(0x3E, 0x01)], 0x00, &[], 0x00, 0x13, 3),
            (Sbrc { r: 0, b: 7 }, &[(0, 0x7F)], 0x00, &[], 0x00, 0x13, 3),
            (Sbrs { r: 0, b: 7 }, &[(0, 0x80)], 0x00, &[], 0x00, 0x13, 3),
            (Sbrs { r: 0, b: 7 }, &[(0, 0x00)], 0x00, &[], 0x00, 0x11, 1),
            (Bst { d: 0, b: 3 }, &[(0, 0x08)], 0x00, &[], 0x40, 0x11, 1),
            (Bld { d: 0, b: 0 }, &[(0, 0x00)], 0x40, &[(0, 0x01)], 0x40, 0x11, 1),
            (Bset { s: 7 }, &[], 0x00, &[], 0x80, 0x11, 1),
            (Bclr { s: 0 }, &[], 0xFF, &[], 0xFE, 0x11, 1),
            (Rjmp { k: -3 }, &[], 0x00, &[], 0x00, 0x0E, 2),
            (Rcall { k: 0x20 }, &[], 0x00, &[(0x0AF0, 0x11), (0x0AEF, 0x00), (0x5D, 0xEE)], 0x00, 0x31, 3),
            (Jmp { k: 0x1234 }, &[], 0x00, &[], 0x00, 0x1234, 3),
            (Call { k: 0x0400 }, &[], 0x00, &[(0x0AF0, 0x12), (0x0AEF, 0x00), (0x5D, 0xEE)], 0x00, 0x0400, 4),
            (Ijmp, &[(30, 0x21), (31, 0x03)], 0x00, &[], 0x00, 0x0321, 2),
            (Icall, &[(30, 0x21), (31, 0x03)], 0x00, &[(0x0AF0, 0x11), (0x0AEF, 0x00), (0x5D, 0xEE)], 0x00, 0x0321, 3),
            (Ret, &[(0x0AF1, 0x01), (0x0AF2, 0x23)], 0x00, &[(0x5D, 0xF2)], 0x00, 0x0123, 4),
            (Reti, &[(0x0AF1, 0x01), (0x0AF2, 0x23)], 0x00, &[(0x5D, 0xF2)], 0x80, 0x0123, 4),
            (Brbs { s: 1, k: -5 }, &[], 0x02, &[], 0x02, 0x0C, 2),
            (Brbc { s: 0, k: 4 }, &[], 0x01, &[], 0x01, 0x11, 1),
            (Sleep, &[], 0x00, &[], 0x00, 0x11, 1),
            (Break, &[], 0x00, &[], 0x00, 0x11, 1),
            (Wdr, &[], 0x00, &[], 0x00, 0x11, 1),
            (Spm, &[], 0x00, &[], 0x00, 0x11, 1),
            (Unknown(0xFFFF), &[], 0x00, &[], 0x00, 0x11, 1),
        ]
    };

    #[test]
    fn test_instruction_table() {
        for &(inst, before, sreg, after, want_sreg, want_pc, want_cycles) in INSTRUCTION_TABLE {
            let mut a = machine();
            a.program_end = 0x8000;
            // word 0x11: JMP 0x0000
            a.mem.flash[0x22] = 0x0C;
            a.mem.flash[0x23] = 0x94;
            a.decode_flash();
            a.mem.set_sp(0x0AF0);
            a.cpu.pc = 0x10;
            for &(addr, v) in before {
                a.mem.data[addr as usize] = v;
            }
            a.mem.set_sreg(sreg);

            let size = match inst {
                Instruction::Jmp { .. }
                | Instruction::Call { .. }
                | Instruction::Lds { .. }
                | Instruction::Sts { .. } => 2,
                _ => 1,
            };
            assert_eq!(a.execute_inst(inst, size), want_cycles, "{inst:?} cycles");
            assert_eq!(a.cpu.pc, want_pc, "{inst:?} pc");
            assert_eq!(a.mem.sreg(), want_sreg, "{inst:?} sreg");
            for &(addr, v) in after {
                assert_eq!(a.mem.data[addr as usize], v, "{inst:?} data[{addr:#06x}]");
            }
        }
    }

    #[test]
    fn test_instruction_table_covers_every_variant() {
        let covered: std::collections::HashSet<_> = INSTRUCTION_TABLE
            .iter()
            .map(|c| std::mem::discriminant(&c.0))
            .collect();
        assert_eq!(covered.len(), 71);
    }
}

