//! Savestate encoding.
//!
//! Captures the full machine state with bincode serialization and deflate
//! compression. Restoring a savestate into any machine yields execution
//! that is cycle-identical to the machine it was taken from.
//!
//! ## Format
//!
//! ```text
//! +------------------+
//! | Magic "ABSS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```
//!
//! The debugger, profiler, serial output and observational config are not
//! part of the payload.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cpu::Cpu;
use crate::display::Ssd1306;
use crate::memory::Memory;
use crate::peripherals::fx_flash::FX_SIZE;
use crate::peripherals::{Adc, EepromCtrl, FxFlash, Pll, Spi, Timer16, Timer16Unit, Timer8};
use crate::Arduboy;

/// Magic bytes identifying a savestate.
pub const MAGIC: &[u8; 4] = b"ABSS";
/// Current savestate format version.
pub const FORMAT_VERSION: u32 = 1;

/// Largest payload a valid savestate can inflate to: a fully allocated FX
/// chip plus room for the rest of the machine.
const MAX_PAYLOAD: usize = FX_SIZE + (1 << 20);

/// Borrowed view of the machine used for encoding. Field order must match
/// [`State`].
#[derive(Serialize)]
struct StateRef<'a> {
    mem: &'a Memory,
    cpu: &'a Cpu,
    timer0: &'a Timer8,
    timer1: &'a Timer16,
    timer3: &'a Timer16,
    spi: &'a Spi,
    eeprom_ctrl: &'a EepromCtrl,
    pll: &'a Pll,
    adc: &'a Adc,
    display: &'a Ssd1306,
    fx: &'a FxFlash,
    ps_rem: i64,
    fxport_reg: u8,
    fxport_mask: u8,
    program_end: u32,
    title: &'a str,
    device: &'a str,
}

#[derive(Deserialize)]
struct State {
    mem: Memory,
    cpu: Cpu,
    timer0: Timer8,
    timer1: Timer16,
    timer3: Timer16,
    spi: Spi,
    eeprom_ctrl: EepromCtrl,
    pll: Pll,
    adc: Adc,
    display: Ssd1306,
    fx: FxFlash,
    ps_rem: i64,
    fxport_reg: u8,
    fxport_mask: u8,
    program_end: u32,
    title: String,
    device: String,
}

impl Arduboy {
    /// Encode the machine state.
    pub fn save_savestate(&self) -> Result<Vec<u8>, String> {
        let state = StateRef {
            mem: &self.mem,
            cpu: &self.cpu,
            timer0: &self.timer0,
            timer1: &self.timer1,
            timer3: &self.timer3,
            spi: &self.spi,
            eeprom_ctrl: &self.eeprom_ctrl,
            pll: &self.pll,
            adc: &self.adc,
            display: &self.display,
            fx: &self.fx,
            ps_rem: self.ps_rem,
            fxport_reg: self.config.fxport_reg,
            fxport_mask: self.config.fxport_mask,
            program_end: self.program_end,
            title: &self.title,
            device: &self.device,
        };
        let payload = bincode::serialize(&state).map_err(|e| format!("Savestate: {e}"))?;
        let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

        let mut out = Vec::with_capacity(8 + compressed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&compressed);
        info!(bytes = out.len(), cycle = self.cpu.cycle_count, "savestate saved");
        Ok(out)
    }

    /// Encode the machine state into `out`.
    pub fn write_savestate<W: Write>(&self, out: &mut W) -> Result<(), String> {
        let bytes = self.save_savestate()?;
        out.write_all(&bytes).map_err(|e| format!("Savestate: {e}"))
    }

    /// Replace the machine state with a decoded savestate. The machine is
    /// left unchanged on error.
    pub fn load_savestate(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() < 8 || &data[0..4] != MAGIC {
            return Err("Savestate: bad magic".into());
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != FORMAT_VERSION {
            return Err(format!(
                "Savestate: unsupported version {version} (expected {FORMAT_VERSION})"
            ));
        }
        let payload = miniz_oxide::inflate::decompress_to_vec_with_limit(&data[8..], MAX_PAYLOAD)
            .map_err(|e| format!("Savestate: decompress error: {e:?}"))?;
        let s: State = bincode::deserialize(&payload).map_err(|e| format!("Savestate: {e}"))?;
        s.validate()?;

        self.mem = s.mem;
        self.cpu = s.cpu;
        self.timer0 = s.timer0;
        self.timer1 = s.timer1;
        self.timer3 = s.timer3;
        self.spi = s.spi;
        self.eeprom_ctrl = s.eeprom_ctrl;
        self.pll = s.pll;
        self.adc = s.adc;
        let enable_filter = self.display.enable_filter;
        self.display = s.display;
        self.display.enable_filter = enable_filter;
        self.fx = s.fx;
        self.ps_rem = s.ps_rem;
        self.config.fxport_reg = s.fxport_reg;
        self.config.fxport_mask = s.fxport_mask;
        self.program_end = s.program_end;
        self.program_loaded = true;
        self.title = s.title;
        self.device = s.device;
        self.decode_flash();
        info!(cycle = self.cpu.cycle_count, "savestate loaded");
        Ok(())
    }

    /// [`Arduboy::load_savestate`] with an empty string meaning success.
    pub fn load_savestate_msg(&mut self, data: &[u8]) -> String {
        self.load_savestate(data).err().unwrap_or_default()
    }
}

impl State {
    /// Reject payloads whose buffers would index out of bounds.
    fn validate(&self) -> Result<(), String> {
        let ok = self.mem.data.len() == crate::DATA_SIZE
            && self.mem.flash.len() == crate::FLASH_SIZE
            && self.mem.eeprom.len() == crate::EEPROM_SIZE
            && self.timer1.unit() == Timer16Unit::Timer1
            && self.timer3.unit() == Timer16Unit::Timer3
            && self.display.is_consistent()
            && self.fx.is_consistent();
        if ok {
            Ok(())
        } else {
            Err("Savestate: corrupt machine state".into())
        }
    }
}
