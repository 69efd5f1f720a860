//! AVR instruction decoder for the ATmega32u4 (AVRe+ core).
//!
//! [`decode`] turns one or two program words into an [`Instruction`] plus
//! its length in words. Register operands are register numbers (0–31), I/O
//! operands of IN/OUT/SBI/CBI/SBIC/SBIS are already translated to data-space
//! addresses (+0x20). Encodings the 32u4 does not implement decode to
//! [`Instruction::Unknown`].

/// Pointer register used by indirect loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ptr {
    X,
    Y,
    Z,
}

impl Ptr {
    /// Low register number of the pair.
    pub fn reg(self) -> u8 {
        match self {
            Ptr::X => 26,
            Ptr::Y => 28,
            Ptr::Z => 30,
        }
    }
}

/// Addressing mode of LD/ST through a pointer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMode {
    Plain,
    PostInc,
    PreDec,
}

/// Decoded AVR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Movw { d: u8, r: u8 },
    Muls { d: u8, r: u8 },
    Mulsu { d: u8, r: u8 },
    Fmul { d: u8, r: u8 },
    Fmuls { d: u8, r: u8 },
    Fmulsu { d: u8, r: u8 },
    Mul { d: u8, r: u8 },

    Add { d: u8, r: u8 },
    Adc { d: u8, r: u8 },
    Sub { d: u8, r: u8 },
    Sbc { d: u8, r: u8 },
    Cp { d: u8, r: u8 },
    Cpc { d: u8, r: u8 },
    Cpse { d: u8, r: u8 },
    And { d: u8, r: u8 },
    Or { d: u8, r: u8 },
    Eor { d: u8, r: u8 },
    Mov { d: u8, r: u8 },

    Cpi { d: u8, k: u8 },
    Sbci { d: u8, k: u8 },
    Subi { d: u8, k: u8 },
    Ori { d: u8, k: u8 },
    Andi { d: u8, k: u8 },
    Ldi { d: u8, k: u8 },
    Adiw { d: u8, k: u8 },
    Sbiw { d: u8, k: u8 },

    Com { d: u8 },
    Neg { d: u8 },
    Swap { d: u8 },
    Inc { d: u8 },
    Dec { d: u8 },
    Asr { d: u8 },
    Lsr { d: u8 },
    Ror { d: u8 },

    /// LDD Rd, Y+q / Z+q (q = 0 is plain LD Y / LD Z)
    Ldd { d: u8, ptr: Ptr, q: u8 },
    /// STD Y+q / Z+q, Rr
    Std { r: u8, ptr: Ptr, q: u8 },
    Ld { d: u8, ptr: Ptr, mode: PtrMode },
    St { r: u8, ptr: Ptr, mode: PtrMode },
    Lds { d: u8, k: u16 },
    Sts { k: u16, r: u8 },
    /// LPM Rd, Z / LPM Rd, Z+ (LPM with no operands is d = 0)
    Lpm { d: u8, inc: bool },
    Push { r: u8 },
    Pop { d: u8 },
    In { d: u8, a: u16 },
    Out { a: u16, r: u8 },

    Sbi { a: u16, b: u8 },
    Cbi { a: u16, b: u8 },
    Sbic { a: u16, b: u8 },
    Sbis { a: u16, b: u8 },
    Sbrc { r: u8, b: u8 },
    Sbrs { r: u8, b: u8 },
    Bst { d: u8, b: u8 },
    Bld { d: u8, b: u8 },
    Bset { s: u8 },
    Bclr { s: u8 },

    Rjmp { k: i16 },
    Rcall { k: i16 },
    Jmp { k: u16 },
    Call { k: u16 },
    Ijmp,
    Icall,
    Ret,
    Reti,
    Brbs { s: u8, k: i8 },
    Brbc { s: u8, k: i8 },

    Sleep,
    Break,
    Wdr,
    Spm,
    Unknown(u16),
}

impl Instruction {
    /// True for instructions after which execution does not simply fall
    /// through to the next word (jumps, calls, returns, branches, skips).
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instruction::Rjmp { .. }
                | Instruction::Rcall { .. }
                | Instruction::Jmp { .. }
                | Instruction::Call { .. }
                | Instruction::Ijmp
                | Instruction::Icall
                | Instruction::Ret
                | Instruction::Reti
                | Instruction::Brbs { .. }
                | Instruction::Brbc { .. }
                | Instruction::Cpse { .. }
                | Instruction::Sbrc { .. }
                | Instruction::Sbrs { .. }
                | Instruction::Sbic { .. }
                | Instruction::Sbis { .. }
        )
    }
}

/// 5-bit destination in bits 8..4.
#[inline(always)]
fn rd5(w: u16) -> u8 {
    ((w >> 4) & 0x1F) as u8
}

/// 5-bit source split across bit 9 and bits 3..0.
#[inline(always)]
fn rr5(w: u16) -> u8 {
    (((w >> 5) & 0x10) | (w & 0x0F)) as u8
}

/// Upper-half register (R16–R31) in bits 7..4.
#[inline(always)]
fn rd4(w: u16) -> u8 {
    16 + ((w >> 4) & 0x0F) as u8
}

/// 8-bit immediate split across bits 11..8 and 3..0.
#[inline(always)]
fn k8(w: u16) -> u8 {
    (((w >> 4) & 0xF0) | (w & 0x0F)) as u8
}

/// Sign-extended 12-bit RJMP/RCALL offset.
#[inline(always)]
fn k12(w: u16) -> i16 {
    ((w << 4) as i16) >> 4
}

/// Sign-extended 7-bit branch offset in bits 9..3.
#[inline(always)]
fn k7(w: u16) -> i8 {
    (((w >> 3) & 0x7F) as u8 as i8) << 1 >> 1
}

/// Decode one instruction. Returns the instruction and its size in words.
pub fn decode(w: u16, next: u16) -> (Instruction, u8) {
    use Instruction::*;
    let d5 = rd5(w);
    let r5 = rr5(w);
    let inst = match w >> 12 {
        0x0 => match (w >> 10) & 0x3 {
            0 => match (w >> 8) & 0x3 {
                0 if w == 0 => Nop,
                1 => Movw { d: ((w >> 4) & 0xF) as u8 * 2, r: (w & 0xF) as u8 * 2 },
                2 => Muls { d: rd4(w), r: 16 + (w & 0xF) as u8 },
                3 => {
                    let d = 16 + ((w >> 4) & 0x7) as u8;
                    let r = 16 + (w & 0x7) as u8;
                    match ((w >> 6) & 0x2) | ((w >> 3) & 0x1) {
                        0 => Mulsu { d, r },
                        1 => Fmul { d, r },
                        2 => Fmuls { d, r },
                        _ => Fmulsu { d, r },
                    }
                }
                _ => Unknown(w),
            },
            1 => Cpc { d: d5, r: r5 },
            2 => Sbc { d: d5, r: r5 },
            _ => Add { d: d5, r: r5 },
        },
        0x1 => match (w >> 10) & 0x3 {
            0 => Cpse { d: d5, r: r5 },
            1 => Cp { d: d5, r: r5 },
            2 => Sub { d: d5, r: r5 },
            _ => Adc { d: d5, r: r5 },
        },
        0x2 => match (w >> 10) & 0x3 {
            0 => And { d: d5, r: r5 },
            1 => Eor { d: d5, r: r5 },
            2 => Or { d: d5, r: r5 },
            _ => Mov { d: d5, r: r5 },
        },
        0x3 => Cpi { d: rd4(w), k: k8(w) },
        0x4 => Sbci { d: rd4(w), k: k8(w) },
        0x5 => Subi { d: rd4(w), k: k8(w) },
        0x6 => Ori { d: rd4(w), k: k8(w) },
        0x7 => Andi { d: rd4(w), k: k8(w) },
        0x8 | 0xA => {
            // 10q0 qqsd dddd yqqq
            let q = (((w >> 8) & 0x20) | ((w >> 7) & 0x18) | (w & 0x7)) as u8;
            let ptr = if w & 0x8 != 0 { Ptr::Y } else { Ptr::Z };
            if w & 0x0200 != 0 {
                Std { r: d5, ptr, q }
            } else {
                Ldd { d: d5, ptr, q }
            }
        }
        0x9 => decode_1001(w, next, d5, r5),
        0xB => {
            let a = 0x20 + (((w >> 5) & 0x30) | (w & 0xF));
            if w & 0x0800 != 0 {
                Out { a, r: d5 }
            } else {
                In { d: d5, a }
            }
        }
        0xC => Rjmp { k: k12(w) },
        0xD => Rcall { k: k12(w) },
        0xE => Ldi { d: rd4(w), k: k8(w) },
        _ => {
            let b = (w & 0x7) as u8;
            match (w >> 9) & 0x7 {
                0 | 1 => Brbs { s: b, k: k7(w) },
                2 | 3 => Brbc { s: b, k: k7(w) },
                4 if w & 0x8 == 0 => Bld { d: d5, b },
                5 if w & 0x8 == 0 => Bst { d: d5, b },
                6 if w & 0x8 == 0 => Sbrc { r: d5, b },
                7 if w & 0x8 == 0 => Sbrs { r: d5, b },
                _ => Unknown(w),
            }
        }
    };
    let size = match inst {
        Lds { .. } | Sts { .. } | Jmp { .. } | Call { .. } => 2,
        _ => 1,
    };
    (inst, size)
}

fn decode_1001(w: u16, next: u16, d5: u8, r5: u8) -> Instruction {
    use Instruction::*;
    let io = 0x20 + ((w >> 3) & 0x1F);
    let bit = (w & 0x7) as u8;
    match (w >> 8) & 0xF {
        0x0 | 0x1 => match w & 0xF {
            0x0 => Lds { d: d5, k: next },
            0x1 => Ld { d: d5, ptr: Ptr::Z, mode: PtrMode::PostInc },
            0x2 => Ld { d: d5, ptr: Ptr::Z, mode: PtrMode::PreDec },
            0x4 => Lpm { d: d5, inc: false },
            0x5 => Lpm { d: d5, inc: true },
            0x9 => Ld { d: d5, ptr: Ptr::Y, mode: PtrMode::PostInc },
            0xA => Ld { d: d5, ptr: Ptr::Y, mode: PtrMode::PreDec },
            0xC => Ld { d: d5, ptr: Ptr::X, mode: PtrMode::Plain },
            0xD => Ld { d: d5, ptr: Ptr::X, mode: PtrMode::PostInc },
            0xE => Ld { d: d5, ptr: Ptr::X, mode: PtrMode::PreDec },
            0xF => Pop { d: d5 },
            _ => Unknown(w),
        },
        0x2 | 0x3 => match w & 0xF {
            0x0 => Sts { k: next, r: d5 },
            0x1 => St { r: d5, ptr: Ptr::Z, mode: PtrMode::PostInc },
            0x2 => St { r: d5, ptr: Ptr::Z, mode: PtrMode::PreDec },
            0x9 => St { r: d5, ptr: Ptr::Y, mode: PtrMode::PostInc },
            0xA => St { r: d5, ptr: Ptr::Y, mode: PtrMode::PreDec },
            0xC => St { r: d5, ptr: Ptr::X, mode: PtrMode::Plain },
            0xD => St { r: d5, ptr: Ptr::X, mode: PtrMode::PostInc },
            0xE => St { r: d5, ptr: Ptr::X, mode: PtrMode::PreDec },
            0xF => Push { r: d5 },
            _ => Unknown(w),
        },
        0x4 | 0x5 => match w & 0xF {
            0x0 => Com { d: d5 },
            0x1 => Neg { d: d5 },
            0x2 => Swap { d: d5 },
            0x3 => Inc { d: d5 },
            0x5 => Asr { d: d5 },
            0x6 => Lsr { d: d5 },
            0x7 => Ror { d: d5 },
            0x8 => decode_misc(w),
            0x9 => match w {
                0x9409 => Ijmp,
                0x9509 => Icall,
                _ => Unknown(w),
            },
            0xA => Dec { d: d5 },
            0xC | 0xD => Jmp { k: jump_target(w, next) },
            0xE | 0xF => Call { k: jump_target(w, next) },
            _ => Unknown(w),
        },
        0x6 => Adiw { d: 24 + ((w >> 3) & 0x6) as u8, k: (((w >> 2) & 0x30) | (w & 0xF)) as u8 },
        0x7 => Sbiw { d: 24 + ((w >> 3) & 0x6) as u8, k: (((w >> 2) & 0x30) | (w & 0xF)) as u8 },
        0x8 => Cbi { a: io, b: bit },
        0x9 => Sbic { a: io, b: bit },
        0xA => Sbi { a: io, b: bit },
        0xB => Sbis { a: io, b: bit },
        _ => Mul { d: d5, r: r5 },
    }
}

/// 1001 010x xxxx 1000: SREG bit set/clear and the operand-less ops.
fn decode_misc(w: u16) -> Instruction {
    use Instruction::*;
    let s = ((w >> 4) & 0x7) as u8;
    if w & 0x0100 == 0 {
        return if w & 0x0080 == 0 { Bset { s } } else { Bclr { s } };
    }
    match w {
        0x9508 => Ret,
        0x9518 => Reti,
        0x9588 => Sleep,
        0x9598 => Break,
        0x95A8 => Wdr,
        0x95C8 => Lpm { d: 0, inc: false },
        0x95E8 => Spm,
        _ => Unknown(w),
    }
}

/// 22-bit JMP/CALL target; the 32u4 only uses the low 16 bits.
fn jump_target(w: u16, next: u16) -> u16 {
    let hi = (((w >> 3) & 0x3E) | (w & 0x1)) as u32;
    ((hi << 16) | next as u32) as u16
}

/// Decode every word of a program image; entry `i` is the instruction that
/// starts at word `i`. Two-word instructions take their operand from the
/// following word, wrapping at the end of flash.
pub fn decode_program(flash: &[u8]) -> Vec<(Instruction, u8)> {
    let words = flash.len() / 2;
    let word = |i: usize| {
        let i = (i % words) * 2;
        u16::from_le_bytes([flash[i], flash[i + 1]])
    };
    (0..words).map(|i| decode(word(i), word(i + 1))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_nop() {
        assert_eq!(decode(0x0000, 0), (Instruction::Nop, 1));
    }

    #[test]
    fn test_decode_ldi() {
        // LDI R16, 0xFF
        assert_eq!(decode(0xEF0F, 0).0, Instruction::Ldi { d: 16, k: 0xFF });
    }

    #[test]
    fn test_decode_rjmp_negative() {
        // RJMP .-2
        assert_eq!(decode(0xCFFF, 0).0, Instruction::Rjmp { k: -1 });
    }

    #[test]
    fn test_decode_jmp_call() {
        assert_eq!(decode(0x940C, 0x1234), (Instruction::Jmp { k: 0x1234 }, 2));
        assert_eq!(decode(0x940E, 0x0100), (Instruction::Call { k: 0x0100 }, 2));
    }

    #[test]
    fn test_decode_lds_sts() {
        assert_eq!(decode(0x9100, 0x0100), (Instruction::Lds { d: 16, k: 0x0100 }, 2));
        assert_eq!(decode(0x9310, 0x00F1), (Instruction::Sts { k: 0x00F1, r: 17 }, 2));
    }

    #[test]
    fn test_decode_add_high_regs() {
        assert_eq!(decode(0x0FFF, 0).0, Instruction::Add { d: 31, r: 31 });
    }

    #[test]
    fn test_decode_ldd_std() {
        // LDD R24, Y+1
        assert_eq!(decode(0x8189, 0).0, Instruction::Ldd { d: 24, ptr: Ptr::Y, q: 1 });
        // STD Z+63, R0
        assert_eq!(decode(0xAE07, 0).0, Instruction::Std { r: 0, ptr: Ptr::Z, q: 63 });
        // LD R2, Z
        assert_eq!(decode(0x8020, 0).0, Instruction::Ldd { d: 2, ptr: Ptr::Z, q: 0 });
    }

    #[test]
    fn test_decode_io() {
        // OUT SREG, R0
        assert_eq!(decode(0xBE0F, 0).0, Instruction::Out { a: 0x5F, r: 0 });
        // IN R24, SPL
        assert_eq!(decode(0xB78D, 0).0, Instruction::In { d: 24, a: 0x5D });
        // SBI PORTD, 1
        assert_eq!(decode(0x9A59, 0).0, Instruction::Sbi { a: 0x2B, b: 1 });
    }

    #[test]
    fn test_decode_word_immediates() {
        assert_eq!(decode(0x9601, 0).0, Instruction::Adiw { d: 24, k: 1 });
        assert_eq!(decode(0x97FF, 0).0, Instruction::Sbiw { d: 30, k: 63 });
    }

    #[test]
    fn test_decode_sreg_ops() {
        assert_eq!(decode(0x9478, 0).0, Instruction::Bset { s: 7 }); // SEI
        assert_eq!(decode(0x94F8, 0).0, Instruction::Bclr { s: 7 }); // CLI
        assert_eq!(decode(0x9598, 0).0, Instruction::Break);
        assert_eq!(decode(0x9588, 0).0, Instruction::Sleep);
    }

    #[test]
    fn test_decode_branch() {
        // BRNE .-4
        assert_eq!(decode(0xF7F1, 0).0, Instruction::Brbc { s: 1, k: -2 });
        // BREQ .+2
        assert_eq!(decode(0xF009, 0).0, Instruction::Brbs { s: 1, k: 1 });
    }

    #[test]
    fn test_decode_multiply_family() {
        assert_eq!(decode(0x9C12, 0).0, Instruction::Mul { d: 1, r: 2 });
        assert_eq!(decode(0x0312, 0).0, Instruction::Mulsu { d: 17, r: 18 });
        assert_eq!(decode(0x039A, 0).0, Instruction::Fmulsu { d: 17, r: 18 });
    }

    #[test]
    fn test_decode_unknown() {
        assert_eq!(decode(0xFFFF, 0).0, Instruction::Unknown(0xFFFF));
        // EIJMP does not exist on the 32u4
        assert_eq!(decode(0x9419, 0).0, Instruction::Unknown(0x9419));
    }
}
