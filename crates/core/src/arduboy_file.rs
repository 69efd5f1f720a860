//! `.arduboy` package reader and FX image inspection.
//!
//! An `.arduboy` file is a ZIP archive containing:
//! - `info.json`: metadata; `binaries[0]` names the program and FX files
//! - the Intel HEX program named by `binaries[0].filename`
//! - optional FX data (`flashdata`) and FX save (`flashsave`) images
//!
//! Parsing only extracts and validates; the machine is not touched until
//! the caller commits the result.

use std::io::{Cursor, Read};

use serde_json::Value;
use zip::ZipArchive;

/// Contents of an `.arduboy` package.
#[derive(Debug, Default, Clone)]
pub struct ArduboyPackage {
    /// Top-level `title`, empty if absent.
    pub title: String,
    /// `binaries[0].device`, empty if absent.
    pub device: String,
    /// Intel HEX text of the primary binary.
    pub hex: Vec<u8>,
    pub fx_data: Option<Vec<u8>>,
    pub fx_save: Option<Vec<u8>>,
}

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

fn read_entry(archive: &mut Archive, name: &str) -> Option<Vec<u8>> {
    let mut file = archive.by_name(name).ok()?;
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf).ok()?;
    Some(buf)
}

/// Read an optional file named by `key` in the binary entry.
fn optional_file(
    archive: &mut Archive,
    bin: &Value,
    key: &str,
    what: &str,
) -> Result<Option<Vec<u8>>, String> {
    let Some(name) = bin.get(key) else {
        return Ok(None);
    };
    let name = name
        .as_str()
        .ok_or_else(|| format!("ARDUBOY: {what} filename not string type"))?;
    read_entry(archive, name)
        .map(Some)
        .ok_or_else(|| format!("ARDUBOY: missing {what} file indicated in info.json"))
}

/// Parse a `.arduboy` archive from raw bytes.
pub fn parse_arduboy(data: &[u8]) -> Result<ArduboyPackage, String> {
    let mut archive = ZipArchive::new(Cursor::new(data)).map_err(|e| format!("ARDUBOY: {e}"))?;
    let info = read_entry(&mut archive, "info.json").ok_or("ARDUBOY: No info.json file")?;
    let info = info.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&info);
    let root: Value = serde_json::from_slice(info).map_err(|e| format!("ARDUBOY: {e}"))?;

    let bins = root.get("binaries").ok_or("ARDUBOY: info.json missing 'binaries'")?;
    let bins = bins.as_array().ok_or("ARDUBOY: 'binaries' not array")?;
    let bin = bins.first().ok_or("ARDUBOY: empty 'binaries'")?;
    let hexfile = bin
        .get("filename")
        .ok_or("ARDUBOY: primary binary missing 'filename'")?
        .as_str()
        .ok_or("ARDUBOY: primary binary filename not string type")?;

    let mut package = ArduboyPackage {
        title: root.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
        device: bin.get("device").and_then(Value::as_str).unwrap_or_default().to_string(),
        ..Default::default()
    };
    package.hex = read_entry(&mut archive, hexfile)
        .ok_or("ARDUBOY: missing hex file indicated in info.json")?;

    package.fx_data = optional_file(&mut archive, bin, "flashdata", "FX data")?;
    if package.fx_data.is_some() {
        package.fx_save = optional_file(&mut archive, bin, "flashsave", "FX save")?;
    }
    Ok(package)
}

/// True if an FX image is a full flashcart (bootloader menu header at
/// address 0) rather than a single game's data.
pub fn is_flashcart(d: &[u8]) -> bool {
    d.len() >= 1024
        && d.starts_with(b"ARDUBOY\0")
        && d[8] == 0xFF
        && d[9] == 0xFF
        && d[0x0F..0x39].iter().all(|&b| b == 0xFF)
        && d[0x39..].starts_with(b"Bootloader")
}
