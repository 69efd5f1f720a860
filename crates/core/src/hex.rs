//! Intel HEX file parser.
//!
//! Parses Intel HEX records (`:LLAAAATT[DD...]CC`) into a staging copy of
//! program flash. Supports record types 00 (data), 01 (EOF), 03 (start
//! segment address, ignored) and 04 (extended linear address). Text between
//! records is skipped.

use tracing::warn;

use crate::FLASH_SIZE;

/// Program image parsed from an Intel HEX file.
#[derive(Debug, Clone)]
pub struct HexImage {
    /// Full program flash, zero where no record wrote.
    pub flash: Vec<u8>,
    /// One past the highest byte address written.
    pub size: usize,
}

/// Reads hex digit pairs out of the record stream.
struct Cursor<'a> {
    text: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Skip to the byte following the next ':'. False at end of input.
    fn next_record(&mut self) -> bool {
        while self.pos < self.text.len() {
            self.pos += 1;
            if self.text[self.pos - 1] == b':' {
                return true;
            }
        }
        false
    }

    fn byte(&mut self) -> Option<u8> {
        let hi = hex_digit(*self.text.get(self.pos)?)?;
        let lo = hex_digit(*self.text.get(self.pos + 1)?)?;
        self.pos += 2;
        Some(hi << 4 | lo)
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse Intel HEX text into a fresh flash image.
pub fn parse_hex(text: &[u8]) -> Result<HexImage, String> {
    let mut image = HexImage { flash: vec![0u8; FLASH_SIZE], size: 0 };
    let mut cur = Cursor { text, pos: 0 };
    let mut addr_upper: u32 = 0;
    let mut num_records = 0;
    let mut ignored_high = false;

    while cur.next_record() {
        num_records += 1;
        let count = cur.byte().ok_or("HEX bad byte count")?;
        let mut checksum = count;
        let (hi, lo) = match (cur.byte(), cur.byte()) {
            (Some(hi), Some(lo)) => (hi, lo),
            _ => return Err("HEX: bad address".into()),
        };
        checksum = checksum.wrapping_add(hi).wrapping_add(lo);
        let addr = ((hi as u32) << 8 | lo as u32) + (addr_upper << 16);
        let kind = match cur.byte() {
            Some(t) if t <= 5 => t,
            _ => return Err("HEX: bad type".into()),
        };
        checksum = checksum.wrapping_add(kind);

        match kind {
            0x00 => {
                for i in 0..count as u32 {
                    let data = cur.byte().ok_or("HEX: bad data")?;
                    checksum = checksum.wrapping_add(data);
                    // data for the other AVR memory spaces (EEPROM, fuses)
                    if addr >= 0x80_0000 {
                        ignored_high = true;
                        continue;
                    }
                    let target = (addr + i) as usize;
                    if target >= FLASH_SIZE {
                        return Err("Too many instructions!".into());
                    }
                    image.flash[target] = data;
                    image.size = image.size.max(target + 1);
                }
            }
            0x01 => {
                if count != 0 {
                    return Err("HEX: non-zero byte count at end-of-file record".into());
                }
                break;
            }
            0x03 => {
                for _ in 0..count {
                    let data = cur.byte().ok_or("HEX: bad data")?;
                    checksum = checksum.wrapping_add(data);
                }
            }
            0x04 => {
                addr_upper = 0;
                for _ in 0..count {
                    let data = cur.byte().ok_or("HEX: bad data")?;
                    checksum = checksum.wrapping_add(data);
                    addr_upper = addr_upper << 8 | data as u32;
                }
            }
            _ => return Err("HEX: unsupported type".into()),
        }

        if cur.byte() != Some(checksum.wrapping_neg()) {
            return Err("HEX: bad checksum".into());
        }
    }

    if num_records == 0 {
        return Err("HEX: no records found".into());
    }
    if ignored_high {
        warn!("HEX: ignored data above program memory");
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_hex() {
        let hex = b":100000000C9434000C944E000C944E000C944E00A4\n:00000001FF\n";
        let image = parse_hex(hex).unwrap();
        assert_eq!(image.size, 16);
        assert_eq!(&image.flash[0..6], &[0x0C, 0x94, 0x34, 0x00, 0x0C, 0x94]);
    }

    #[test]
    fn test_checksum_error() {
        let hex = b":100000000C9434000C944E000C944E000C944E00FF\n:00000001FF\n";
        assert_eq!(parse_hex(hex).unwrap_err(), "HEX: bad checksum");
    }

    #[test]
    fn test_eof_only() {
        let image = parse_hex(b":00000001FF\n").unwrap();
        assert_eq!(image.size, 0);
    }

    #[test]
    fn test_no_records() {
        assert_eq!(parse_hex(b"\n\n").unwrap_err(), "HEX: no records found");
    }

    #[test]
    fn test_unsupported_and_bad_types() {
        assert_eq!(parse_hex(b":020000021000EC\n").unwrap_err(), "HEX: unsupported type");
        assert_eq!(parse_hex(b":00000009F7\n").unwrap_err(), "HEX: bad type");
    }

    #[test]
    fn test_bad_digits() {
        assert_eq!(parse_hex(b":zz").unwrap_err(), "HEX bad byte count");
        assert_eq!(parse_hex(b":01zz").unwrap_err(), "HEX: bad address");
        assert_eq!(parse_hex(b":01000000zz").unwrap_err(), "HEX: bad data");
    }

    #[test]
    fn test_nonzero_eof_count() {
        assert_eq!(
            parse_hex(b":01000001AA54\n").unwrap_err(),
            "HEX: non-zero byte count at end-of-file record"
        );
    }

    #[test]
    fn test_extended_linear_address() {
        // EEPROM section at 0x810000 is skipped
        let hex = b":02000004008179\n:01000000AA55\n:00000001FF\n";
        let image = parse_hex(hex).unwrap();
        assert_eq!(image.size, 0);
        assert!(image.flash.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_too_many_instructions() {
        // upper address 0x0001 puts the record at 0x10000
        let hex = b":020000040001F9\n:01000000AA55\n";
        assert_eq!(parse_hex(hex).unwrap_err(), "Too many instructions!");
    }
}
