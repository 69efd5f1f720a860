//! SSD1306 128×64 OLED display controller emulation.
//!
//! Command and data bytes arrive over SPI and update the controller's 1 KB
//! GDDRAM. Independently the panel is refreshed row by row at the rate set
//! by the oscillator, divide ratio and pre-charge phases, producing 8-bit
//! grayscale pixels that include contrast and a model of the driver's
//! current limiting. The Arduboy mounts the panel upside down, so row 0 of
//! the RAM ends up at the bottom-right of the pixel buffer.
//!
//! With the filter enabled the last four refreshed frames are kept and
//! blended into [`Ssd1306::filtered_pixels`] on every vsync.

use serde::{Deserialize, Serialize};

use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};

const NUM_PIXELS: usize = SCREEN_WIDTH * SCREEN_HEIGHT;
const HISTORY: usize = 4;

/// Oscillator frequency in kHz for each FOSC setting.
const FOSC: [f64; 16] = [
    200.0, 224.0, 248.0, 272.0, 296.0, 320.0, 344.0, 368.0, 392.0, 416.0, 440.0, 464.0, 488.0,
    512.0, 536.0, 570.0,
];

/// Total segment current the driver can deliver, in units of the reference
/// segment current scale.
const MAX_DRIVER_CURRENT: f32 = 15.0;

/// Frame weights of the persistence filter, sum 252.
const FILTER_WEIGHTS: [u32; HISTORY] = [42, 84, 84, 42];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrMode {
    Horizontal,
    Vertical,
    Page,
}

/// Parameter byte expected next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CmdState {
    Ready,
    SetAddrMode,
    SetColStart,
    SetColEnd,
    SetPageStart,
    SetPageEnd,
    SetContrast,
    SetChargePump,
    SetMuxRatio,
    SetOffset,
    SetClock,
    SetPrecharge,
    SetComPins,
    SetVcomh,
    /// Ignore this many parameter bytes (scroll setup)
    Skip(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ssd1306 {
    pub ram: Vec<u8>,
    /// Four frames of refreshed pixels, `NUM_PIXELS` each
    history: Vec<u8>,
    history_index: usize,
    filtered: Vec<u8>,

    ref_segment_current: f32,
    current_limit_slope: f32,
    pub enable_current_limiting: bool,
    prev_row_drive: f32,

    pub contrast: u8,
    pub entire_display_on: bool,
    pub inverse_display: bool,
    pub display_on: bool,
    pub enable_charge_pump: bool,
    pub addressing_mode: AddrMode,

    col_start: u8,
    col_end: u8,
    page_start: u8,
    page_end: u8,

    pub mux_ratio: u8,
    pub display_offset: u8,
    pub display_start: u8,
    com_scan_direction: bool,
    alternative_com: bool,
    com_remap: bool,
    segment_remap: bool,

    fosc_index: u8,
    divide_ratio: u8,
    phase_1: u8,
    phase_2: u8,
    vcomh_deselect: u8,

    pub row: u8,
    row_cycle: u32,
    cycles_per_row: u32,
    ps_per_clk: u64,
    ps_rem: u64,

    pub enable_filter: bool,
    vsync: bool,

    cmd_state: CmdState,

    data_page: u8,
    data_col: u8,
}

impl Ssd1306 {
    pub fn new() -> Self {
        let mut d = Ssd1306 {
            ram: vec![0; 1024],
            history: vec![0; NUM_PIXELS * HISTORY],
            history_index: 0,
            filtered: vec![0; NUM_PIXELS],
            ref_segment_current: 0.195,
            current_limit_slope: 0.75,
            enable_current_limiting: true,
            prev_row_drive: 0.0,
            contrast: 0x7F,
            entire_display_on: false,
            inverse_display: false,
            display_on: false,
            enable_charge_pump: false,
            addressing_mode: AddrMode::Page,
            col_start: 0,
            col_end: 127,
            page_start: 0,
            page_end: 7,
            mux_ratio: 63,
            display_offset: 0,
            display_start: 0,
            com_scan_direction: false,
            alternative_com: true,
            com_remap: false,
            segment_remap: false,
            fosc_index: 8,
            divide_ratio: 0,
            phase_1: 2,
            phase_2: 2,
            vcomh_deselect: 2,
            row: 0,
            row_cycle: 0,
            cycles_per_row: 0,
            ps_per_clk: 0,
            ps_rem: 0,
            enable_filter: false,
            vsync: false,
            cmd_state: CmdState::Ready,
            data_page: 0,
            data_col: 0,
        };
        d.update_clocking();
        d
    }

    pub fn reset(&mut self) {
        let enable_filter = self.enable_filter;
        *self = Ssd1306::new();
        self.enable_filter = enable_filter;
    }

    fn fosc(&self) -> f64 {
        FOSC[(self.fosc_index % 16) as usize] * 1000.0
    }

    fn update_clocking(&mut self) {
        self.cycles_per_row = self.phase_1 as u32 + self.phase_2 as u32 + 50;
        self.ps_per_clk = (1e12 * (self.divide_ratio as f64 + 1.0) / self.fosc()).round() as u64;
    }

    /// Frames per second with the current clock settings.
    pub fn refresh_rate(&self) -> f64 {
        let d = self.divide_ratio as f64 + 1.0;
        let k = self.cycles_per_row as f64;
        let mux = self.mux_ratio as f64 + 1.0;
        self.fosc() / (d * k * mux)
    }

    /// Receive a command byte (D/C low).
    pub fn send_command(&mut self, byte: u8) {
        let state = self.cmd_state;
        self.cmd_state = CmdState::Ready;
        match state {
            CmdState::Ready => self.start_command(byte),
            CmdState::SetAddrMode => {
                self.addressing_mode = match byte & 0x3 {
                    0 => AddrMode::Horizontal,
                    1 => AddrMode::Vertical,
                    2 => AddrMode::Page,
                    _ => self.addressing_mode,
                };
            }
            CmdState::SetColStart => {
                self.col_start = byte & 0x7F;
                self.data_col = self.col_start;
                self.cmd_state = CmdState::SetColEnd;
            }
            CmdState::SetColEnd => self.col_end = byte & 0x7F,
            CmdState::SetPageStart => {
                self.page_start = byte & 0x7;
                self.data_page = self.page_start;
                self.cmd_state = CmdState::SetPageEnd;
            }
            CmdState::SetPageEnd => self.page_end = byte & 0x7,
            CmdState::SetContrast => self.contrast = byte,
            CmdState::SetChargePump => self.enable_charge_pump = byte == 0x14,
            CmdState::SetMuxRatio => self.mux_ratio = byte & 0x3F,
            CmdState::SetOffset => self.display_offset = byte & 0x3F,
            CmdState::SetClock => {
                self.divide_ratio = byte & 0xF;
                self.fosc_index = byte >> 4;
                self.update_clocking();
            }
            CmdState::SetPrecharge => {
                self.phase_1 = byte & 0xF;
                self.phase_2 = byte >> 4;
                self.update_clocking();
            }
            CmdState::SetComPins => {
                self.alternative_com = byte & 0x10 != 0;
                self.com_remap = byte & 0x20 != 0;
            }
            CmdState::SetVcomh => self.vcomh_deselect = (byte >> 4) & 0x7,
            CmdState::Skip(n) => {
                if n > 1 {
                    self.cmd_state = CmdState::Skip(n - 1);
                }
            }
        }
    }

    fn start_command(&mut self, cmd: u8) {
        match cmd {
            // lower / higher nibble of the page mode column
            0x00..=0x0F => self.data_col = (self.data_col & 0xF0) | cmd,
            0x10..=0x1F => self.data_col = ((self.data_col & 0x0F) | (cmd << 4)) & 0x7F,
            0x20 => self.cmd_state = CmdState::SetAddrMode,
            0x21 => self.cmd_state = CmdState::SetColStart,
            0x22 => self.cmd_state = CmdState::SetPageStart,
            // scrolling is accepted but not rendered
            0x26 | 0x27 => self.cmd_state = CmdState::Skip(6),
            0x29 | 0x2A => self.cmd_state = CmdState::Skip(5),
            0xA3 => self.cmd_state = CmdState::Skip(2),
            0x2E | 0x2F => {}
            0x40..=0x7F => self.display_start = cmd & 0x3F,
            0x81 => self.cmd_state = CmdState::SetContrast,
            0x8D => self.cmd_state = CmdState::SetChargePump,
            0xA0 => self.segment_remap = false,
            0xA1 => self.segment_remap = true,
            0xA4 => self.entire_display_on = false,
            0xA5 => self.entire_display_on = true,
            0xA6 => self.inverse_display = false,
            0xA7 => self.inverse_display = true,
            0xA8 => self.cmd_state = CmdState::SetMuxRatio,
            0xAE => self.display_on = false,
            0xAF => self.display_on = true,
            0xB0..=0xB7 => self.data_page = cmd & 0x7,
            0xC0 => self.com_scan_direction = false,
            0xC8 => self.com_scan_direction = true,
            0xD3 => self.cmd_state = CmdState::SetOffset,
            0xD5 => self.cmd_state = CmdState::SetClock,
            0xD9 => self.cmd_state = CmdState::SetPrecharge,
            0xDA => self.cmd_state = CmdState::SetComPins,
            0xDB => self.cmd_state = CmdState::SetVcomh,
            // 0xE3 NOP and anything unknown
            _ => {}
        }
    }

    /// Receive a data byte (D/C high).
    pub fn send_data(&mut self, byte: u8) {
        let col = if self.segment_remap { 127 - self.data_col } else { self.data_col };
        let i = self.data_page as usize * 128 + col as usize;
        self.ram[i & 1023] = byte;

        match self.addressing_mode {
            AddrMode::Horizontal => {
                if self.data_col >= self.col_end {
                    self.data_col = self.col_start;
                    if self.data_page >= self.page_end {
                        self.data_page = self.page_start;
                    } else {
                        self.data_page = (self.data_page + 1) & 0x7;
                    }
                } else {
                    self.data_col = (self.data_col + 1) & 0x7F;
                }
            }
            AddrMode::Vertical => {
                if self.data_page >= self.page_end {
                    self.data_page = self.page_start;
                    if self.data_col >= self.col_end {
                        self.data_col = self.col_start;
                    } else {
                        self.data_col = (self.data_col + 1) & 0x7F;
                    }
                } else {
                    self.data_page = (self.data_page + 1) & 0x7;
                }
            }
            AddrMode::Page => {
                if self.data_col >= self.col_end {
                    self.data_col = self.col_start;
                } else {
                    self.data_col = (self.data_col + 1) & 0x7F;
                }
            }
        }
    }

    /// Gray level of the lit pixels in RAM row `ram_row`, after current
    /// limiting.
    fn row_drive_level(&mut self, rindex: usize, mask: u8) -> u8 {
        let contrast = self.contrast;
        let mut p1 = if self.enable_charge_pump { contrast } else { contrast >> 4 };
        if !self.enable_current_limiting {
            return p1;
        }

        let num_on = if self.entire_display_on {
            128
        } else {
            self.ram[rindex..rindex + 128]
                .iter()
                .filter(|&&b| (b & mask != 0) != self.inverse_display)
                .count()
        };
        let mut row_drive =
            self.ref_segment_current * (1.0 / 255.0) * num_on as f32 * contrast as f32;

        const DIFF: f32 = MAX_DRIVER_CURRENT * 0.5;
        const F: f32 = 0.35;
        let prev = self.prev_row_drive;
        if self.row != 0 && (row_drive - prev).abs() > DIFF {
            let target = if row_drive > prev { prev + DIFF } else { prev - DIFF };
            row_drive = F * target + (1.0 - F) * row_drive;
        }

        if row_drive > MAX_DRIVER_CURRENT {
            let mut t = MAX_DRIVER_CURRENT / row_drive;
            t += self.current_limit_slope * (1.0 - t);
            row_drive *= t;
        }

        if num_on > 0 {
            let segment_drive = row_drive / num_on as f32;
            let t = (segment_drive / self.ref_segment_current * 255.0).min(contrast as f32);
            p1 = t as u8;
        }

        self.prev_row_drive = row_drive;
        p1
    }

    fn update_pixels_row(&mut self) {
        let ram_row = self.row.wrapping_add(self.display_start) & 63;
        let mask = 1u8 << (ram_row % 8);
        let rindex = (ram_row as usize / 8) * 128;

        let mut out_row = self.row.wrapping_sub(self.display_offset);
        if self.com_scan_direction {
            out_row = self.mux_ratio.wrapping_sub(out_row);
        }
        out_row &= 63;

        if !self.enable_filter {
            self.history_index = 0;
        }
        let frame = self.history_index;

        let mux = self.mux_ratio;
        if (mux >= 16 && self.row == mux) || self.row >= 63 {
            if self.enable_filter {
                self.history_index = (self.history_index + 1) % HISTORY;
            }
            self.vsync = true;
        }

        let mut p0 = 0;
        let mut p1 = self.row_drive_level(rindex, mask);
        if self.inverse_display {
            std::mem::swap(&mut p0, &mut p1);
        }

        // the panel is upside down: walk the output row backwards
        let base = frame * NUM_PIXELS + (63 - out_row as usize) * 128;
        for i in 0..128 {
            let lit = self.entire_display_on || self.ram[rindex + i] & mask != 0;
            self.history[base + 127 - i] = if lit { p1 } else { p0 };
        }

        if self.vsync && self.enable_filter {
            self.filter_pixels();
        }
    }

    fn filter_pixels(&mut self) {
        let mut sums = vec![0u32; NUM_PIXELS];
        for n in 0..HISTORY {
            let c = FILTER_WEIGHTS[(7 - n + self.history_index) % HISTORY];
            let frame = &self.history[n * NUM_PIXELS..(n + 1) * NUM_PIXELS];
            for (s, &p) in sums.iter_mut().zip(frame) {
                *s += p as u32 * c;
            }
        }
        for (f, s) in self.filtered.iter_mut().zip(sums) {
            *f = (s / 256) as u8;
        }
    }

    /// Let `ps` picoseconds of panel time pass. Returns true if a frame
    /// completed (vsync).
    pub fn advance(&mut self, ps: u64) -> bool {
        self.vsync = false;
        let mut ps = ps + self.ps_rem;
        while ps >= self.ps_per_clk {
            self.row_cycle += 1;
            if self.row_cycle >= self.cycles_per_row {
                self.update_pixels_row();
                self.row_cycle = 0;
                self.row = if self.row == self.mux_ratio { 0 } else { (self.row + 1) % 64 };
            }
            ps -= self.ps_per_clk;
        }
        self.ps_rem = ps;
        self.vsync
    }

    /// Buffer sizes and clocking are usable (checked on savestate load).
    pub(crate) fn is_consistent(&self) -> bool {
        self.ram.len() == 1024
            && self.history.len() == NUM_PIXELS * HISTORY
            && self.filtered.len() == NUM_PIXELS
            && self.history_index < HISTORY
            && self.ps_per_clk != 0
            && self.cycles_per_row != 0
    }

    /// Raw pixels of the most recently refreshed frame, 128×64 gray levels.
    pub fn pixels(&self) -> &[u8] {
        let frame = if self.enable_filter {
            (self.history_index + HISTORY - 1) % HISTORY
        } else {
            0
        };
        &self.history[frame * NUM_PIXELS..(frame + 1) * NUM_PIXELS]
    }

    /// Filtered pixels when the filter is enabled, otherwise the raw ones.
    pub fn filtered_pixels(&self) -> &[u8] {
        if self.enable_filter {
            &self.filtered
        } else {
            self.pixels()
        }
    }
}

impl Default for Ssd1306 {
    fn default() -> Self {
        Self::new()
    }
}
