//! Game save data (`.save` files).
//!
//! Save data is what a game keeps between sessions on real hardware: the
//! EEPROM and every FX flash sector the game itself wrote. Sectors are
//! stored by index, so they land back in the save area of the FX image
//! the game was loaded with.
//!
//! ```text
//! "ABSD" | version u32 LE | bincode(eeprom, [(sector, 4 KB)])
//! ```

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::peripherals::fx_flash::{NUM_SECTORS, SECTOR_BYTES};
use crate::{Arduboy, EEPROM_SIZE};

/// Magic bytes identifying save data.
pub const MAGIC: &[u8; 4] = b"ABSD";
/// Current save data format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SaveData {
    eeprom: Vec<u8>,
    fx_sectors: Vec<(u32, Vec<u8>)>,
}

impl SaveData {
    fn is_consistent(&self) -> bool {
        self.eeprom.len() == EEPROM_SIZE
            && self
                .fx_sectors
                .iter()
                .all(|(i, s)| (*i as usize) < NUM_SECTORS && s.len() == SECTOR_BYTES)
    }
}

impl Arduboy {
    /// Encode the EEPROM and the FX sectors written by the running game.
    pub fn save_savedata(&self) -> Result<Vec<u8>, String> {
        let save = SaveData {
            eeprom: self.mem.eeprom.clone(),
            fx_sectors: self
                .fx
                .modified_sectors()
                .map(|i| (i as u32, self.fx.sector_data(i)))
                .collect(),
        };
        let payload = bincode::serialize(&save).map_err(|e| format!("Save data: {e}"))?;
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&payload);
        info!(bytes = out.len(), fx_sectors = save.fx_sectors.len(), "save data saved");
        Ok(out)
    }

    /// Restore save data over the loaded game and reset. The machine is
    /// left unchanged on error.
    pub fn load_savedata(&mut self, data: &[u8]) -> Result<(), String> {
        if !self.program_loaded {
            return Err("Save data: no program loaded".into());
        }
        if data.len() < 8 || &data[0..4] != MAGIC {
            return Err("Save data: bad magic".into());
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != FORMAT_VERSION {
            return Err(format!(
                "Save data: unsupported version {version} (expected {FORMAT_VERSION})"
            ));
        }
        let save: SaveData =
            bincode::deserialize(&data[8..]).map_err(|e| format!("Save data: {e}"))?;
        if !save.is_consistent() {
            return Err("Save data: corrupt".into());
        }

        self.mem.eeprom.copy_from_slice(&save.eeprom);
        for (index, sector) in &save.fx_sectors {
            self.fx.restore_sector(*index as usize, sector);
        }
        info!(fx_sectors = save.fx_sectors.len(), "save data loaded");
        self.reset();
        Ok(())
    }
}
