//! Image loading.
//!
//! [`Arduboy::load_file`] picks the format from the file name and parses the
//! image into staging buffers; the machine is only modified once the whole
//! image is known to be good. Program images are scanned for the FX chip
//! wiring they use and for the avr-libc startup loops that reveal the end of
//! static data (the stack limit).

use tracing::{info, warn};

use crate::arduboy_file::{is_flashcart, parse_arduboy};
use crate::hex::{parse_hex, HexImage};
use crate::opcodes::{decode_program, Instruction, Ptr, PtrMode};
use crate::peripherals::fx_flash::{FX_SIZE, PAGE_BYTES, SECTOR_BYTES};
use crate::Arduboy;

/// Stack limit used when the startup code gives no better answer: the
/// bottom of SRAM.
pub const DEFAULT_STACK_LIMIT: u16 = 0x0100;

/// Arduboy hardware variants, which differ in how the FX chip select is
/// wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Arduboy,
    ArduboyFX,
    ArduboyMini,
    ArduboyFXDevKit,
}

impl Device {
    pub fn name(self) -> &'static str {
        match self {
            Device::Arduboy => "Arduboy",
            Device::ArduboyFX => "ArduboyFX",
            Device::ArduboyMini => "ArduboyMini",
            Device::ArduboyFXDevKit => "ArduboyFXDevKit",
        }
    }

    pub fn from_name(name: &str) -> Option<Device> {
        [Device::Arduboy, Device::ArduboyFX, Device::ArduboyMini, Device::ArduboyFXDevKit]
            .into_iter()
            .find(|d| d.name() == name)
    }

    /// FX chip select as (PORTx data address, pin mask).
    pub fn fx_wiring(self) -> (u8, u8) {
        match self {
            Device::Arduboy | Device::ArduboyFX => (0x2B, 1 << 1),
            Device::ArduboyMini => (0x2E, 1 << 2),
            Device::ArduboyFXDevKit => (0x2B, 1 << 2),
        }
    }
}

/// A parsed program with the facts derived from its code.
struct Program {
    image: HexImage,
    decoded: Vec<(Instruction, u8)>,
    fx_device: Option<Device>,
    stack_limit: u16,
}

impl Program {
    fn analyze(image: HexImage) -> Program {
        let decoded = decode_program(&image.flash);
        let fx_device = detect_fx_device(&decoded);
        let stack_limit = find_stack_limit(&decoded);
        Program { image, decoded, fx_device, stack_limit }
    }
}

/// True if the program drives the FX chip select on `port`/`bit`: either
/// the cart header check from `FX::begin` is present, or the pin is both
/// set and cleared with SBI/CBI.
fn uses_fx_pin(decoded: &[(Instruction, u8)], port: u8, bit: u8) -> bool {
    use Instruction::*;
    let (mut found_sbi, mut found_cbi) = (false, false);
    for (i, (inst, _)) in decoded.iter().enumerate() {
        if *inst == (Lpm { d: 18, inc: true }) && is_fx_begin(&decoded[i..]) {
            return true;
        }
        match *inst {
            Sbi { a, b } if a == port as u16 && b == bit => found_sbi = true,
            Cbi { a, b } if a == port as u16 && b == bit => found_cbi = true,
            _ => {}
        }
        if found_sbi && found_cbi {
            return true;
        }
    }
    false
}

/// The FX cart header check: `lpm r18..r21, Z+`, then compare the first
/// two bytes against the signature and `brne .+2`.
fn is_fx_begin(p: &[(Instruction, u8)]) -> bool {
    use Instruction::*;
    let Some(w) = p.get(..7) else {
        return false;
    };
    let w: Vec<Instruction> = w.iter().map(|x| x.0).collect();
    matches!(
        w.as_slice(),
        [
            Lpm { d: 18, inc: true },
            Lpm { d: 19, inc: true },
            Lpm { d: 21, inc: true },
            Lpm { d: 20, inc: true },
            Subi { d: 18, k: 0x18 },
            Sbci { d: 19, k: 0x95 },
            Brbc { s: 1, k: 1 },
        ]
    )
}

/// Which FX wiring the program uses, if any.
pub fn detect_fx_device(decoded: &[(Instruction, u8)]) -> Option<Device> {
    [(Device::ArduboyFX, 0x2B, 1), (Device::ArduboyMini, 0x2E, 2), (Device::ArduboyFXDevKit, 0x2B, 2)]
        .into_iter()
        .find(|&(_, port, bit)| uses_fx_pin(decoded, port, bit))
        .map(|(device, _, _)| device)
}

/// `__do_copy_data`: the end of .data is the CPI/CPC bound.
fn copy_data_end(p: &[(Instruction, u8)]) -> Option<u16> {
    use Instruction::*;
    let w: Vec<Instruction> = p.get(..11)?.iter().map(|x| x.0).collect();
    match w.as_slice() {
        [
            Ldi { d: r, k: hi },
            Ldi { d: 26, .. },
            Ldi { d: 27, .. },
            Ldi { d: 30, .. },
            Ldi { d: 31, .. },
            Rjmp { k: 2 },
            Lpm { d: 0, inc: true },
            St { r: 0, ptr: Ptr::X, mode: PtrMode::PostInc },
            Cpi { d: 26, k: lo },
            Cpc { d: 27, r: r2 },
            Brbc { s: 1, .. },
        ] if r == r2 => {
            Some(u16::from_le_bytes([*lo, *hi]))
        }
        _ => None,
    }
}

/// `__do_clear_bss`: the end of .bss is the CPI/CPC bound.
fn clear_bss_end(p: &[(Instruction, u8)]) -> Option<u16> {
    use Instruction::*;
    let w: Vec<Instruction> = p.get(..8)?.iter().map(|x| x.0).collect();
    match w.as_slice() {
        [
            Ldi { d: r, k: hi },
            Ldi { d: 26, .. },
            Ldi { d: 27, .. },
            Rjmp { k: 1 },
            St { r: 1, ptr: Ptr::X, mode: PtrMode::PostInc },
            Cpi { d: 26, k: lo },
            Cpc { d: 27, r: r2 },
            Brbc { s: 1, .. },
        ] if r == r2 => {
            Some(u16::from_le_bytes([*lo, *hi]))
        }
        _ => None,
    }
}

/// Lowest address the stack may grow down to: the end of static data as
/// found in the startup code reached from the reset vector.
pub fn find_stack_limit(decoded: &[(Instruction, u8)]) -> u16 {
    if decoded.is_empty() {
        return DEFAULT_STACK_LIMIT;
    }
    let start = match decoded[0].0 {
        Instruction::Jmp { k } => k as usize,
        Instruction::Rjmp { k } => (1 + k as i32).rem_euclid(decoded.len() as i32) as usize,
        _ => return DEFAULT_STACK_LIMIT,
    };
    (start..start + 32)
        .filter_map(|n| decoded.get(n..))
        .flat_map(|p| [copy_data_end(p), clear_bss_end(p)])
        .flatten()
        .fold(DEFAULT_STACK_LIMIT, u16::max)
}

impl Arduboy {
    /// Load an image, choosing the format by file name: `.hex`, `.bin`
    /// (FX data), `.arduboy`, `.snapshot` or `.save` (game save data over
    /// the loaded program). The machine is reset after a successful load
    /// and untouched after a failed one.
    pub fn load_file(&mut self, name: &str, data: &[u8]) -> Result<(), String> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".hex") {
            self.load_hex(data)
        } else if lower.ends_with(".bin") {
            self.load_fx_bin(data)
        } else if lower.ends_with(".arduboy") {
            self.load_arduboy(data)
        } else if lower.ends_with(".snapshot") {
            self.load_snapshot(data)
        } else if lower.ends_with(".save") {
            self.load_savedata(data)
        } else {
            Err(format!("Unsupported file type: {name}"))
        }
    }

    /// [`Arduboy::load_file`] with an empty string meaning success.
    pub fn load_file_msg(&mut self, name: &str, data: &[u8]) -> String {
        self.load_file(name, data).err().unwrap_or_default()
    }

    fn commit_program(&mut self, program: Program) {
        self.mem.flash = program.image.flash;
        self.mem.eeprom.fill(0xFF);
        self.decoded = program.decoded;
        self.program_end = program.image.size as u32;
        self.program_loaded = true;
        self.config.stack_limit = program.stack_limit;
        self.debugger.clear_breakpoints();
    }

    fn set_device(&mut self, device: Option<Device>) {
        let d = device.unwrap_or(Device::Arduboy);
        (self.config.fxport_reg, self.config.fxport_mask) = d.fx_wiring();
        self.device = device.map(|d| d.name().to_string()).unwrap_or_default();
    }

    fn load_hex(&mut self, data: &[u8]) -> Result<(), String> {
        let program = Program::analyze(parse_hex(data)?);
        let device = program.fx_device;
        let size = program.image.size;
        self.commit_program(program);
        self.title.clear();
        self.set_device(device);
        if device.is_none() {
            self.fx.erase_all();
        }
        info!(format = "hex", flash_bytes = size, device = %self.device, "image loaded");
        self.reset();
        Ok(())
    }

    fn load_fx_bin(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() >= FX_SIZE {
            return Err("BIN: FX data too large".into());
        }
        if is_flashcart(data) {
            self.fx.erase_all();
            self.fx.write_bytes(0, data);
            info!(format = "bin", fx_bytes = data.len(), "flashcart loaded");
        } else {
            self.load_fx_layout(data, None);
            info!(format = "bin", fx_bytes = data.len(), "FX data loaded");
        }
        self.reset();
        Ok(())
    }

    fn load_arduboy(&mut self, data: &[u8]) -> Result<(), String> {
        let package = parse_arduboy(data)?;
        let program = Program::analyze(parse_hex(&package.hex)?);
        let fx_len = package.fx_data.as_ref().map_or(0, Vec::len)
            + package.fx_save.as_ref().map_or(0, Vec::len);
        if fx_len >= FX_SIZE {
            return Err("BIN: FX data too large".into());
        }

        let device = if package.device.is_empty() {
            program.fx_device
        } else {
            Device::from_name(&package.device).or_else(|| {
                warn!(device = %package.device, "unrecognized device, detecting from program");
                program.fx_device
            })
        };
        let size = program.image.size;
        self.commit_program(program);
        self.set_device(device);
        self.title = package.title;
        match &package.fx_data {
            Some(fx) => {
                self.load_fx_layout(fx, package.fx_save.as_deref());
            }
            None => self.fx.erase_all(),
        }
        info!(
            format = "arduboy",
            title = %self.title,
            flash_bytes = size,
            fx_bytes = fx_len,
            device = %self.device,
            "image loaded"
        );
        self.reset();
        Ok(())
    }

    /// Replace the FX contents with game data and an optional save area
    /// using the standard layout:
    ///
    /// ```text
    /// [... empty ...][FX data (page-aligned)][FX save (4KB-aligned)][end = 16MB]
    /// ```
    ///
    /// Returns the byte offsets of the data and save areas.
    pub fn load_fx_layout(&mut self, data: &[u8], save: Option<&[u8]>) -> (usize, usize) {
        let save = save.unwrap_or_default();
        let save_bytes = save.len().div_ceil(SECTOR_BYTES) * SECTOR_BYTES;
        let data_bytes = data.len().div_ceil(PAGE_BYTES) * PAGE_BYTES;
        let save_offset = FX_SIZE.saturating_sub(save_bytes);
        let data_offset = save_offset.saturating_sub(data_bytes);

        self.fx.erase_all();
        self.fx.write_bytes(data_offset, data);
        self.fx.write_bytes(save_offset, save);
        (data_offset, save_offset)
    }
}
