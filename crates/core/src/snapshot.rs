//! Debugger snapshots.
//!
//! A snapshot is a savestate plus the debugger session around it
//! (breakpoints, autobreak mask, step target) and the paused flag, so a
//! debugging session can be resumed exactly where it was left.
//!
//! ```text
//! "ABSN" | version u32 LE | savestate length u32 LE | savestate | bincode(debugger, paused)
//! ```

use tracing::info;

use crate::debugger::Debugger;
use crate::Arduboy;

/// Magic bytes identifying a snapshot.
pub const MAGIC: &[u8; 4] = b"ABSN";
/// Current snapshot format version.
pub const FORMAT_VERSION: u32 = 1;

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl Arduboy {
    pub fn save_snapshot(&self) -> Result<Vec<u8>, String> {
        let state = self.save_savestate()?;
        let session = bincode::serialize(&(&self.debugger, self.paused))
            .map_err(|e| format!("Snapshot: {e}"))?;

        let mut out = Vec::with_capacity(12 + state.len() + session.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(state.len() as u32).to_le_bytes());
        out.extend_from_slice(&state);
        out.extend_from_slice(&session);
        Ok(out)
    }

    /// Restore a snapshot. The debugger session is decoded before the
    /// machine state is replaced.
    pub fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() < 12 || &data[0..4] != MAGIC {
            return Err("Snapshot: bad magic".into());
        }
        let version = read_u32(data, 4).unwrap_or_default();
        if version != FORMAT_VERSION {
            return Err(format!(
                "Snapshot: unsupported version {version} (expected {FORMAT_VERSION})"
            ));
        }
        let len = read_u32(data, 8).unwrap_or_default() as usize;
        let state = data.get(12..12 + len).ok_or("Snapshot: truncated")?;
        let (debugger, paused): (Debugger, bool) = bincode::deserialize(&data[12 + len..])
            .map_err(|e| format!("Snapshot: {e}"))?;

        self.load_savestate(state)?;
        self.debugger = debugger;
        self.paused = paused;
        info!(paused, "snapshot loaded");
        Ok(())
    }
}
