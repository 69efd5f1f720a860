//! USB serial transmit sink.
//!
//! No USB stack is modeled. Every byte stored to UEDATX is appended to
//! [`Usb::serial`], which the host drains with [`Usb::take`]. The sink is an
//! observational output and is not part of a savestate.

#[derive(Debug, Clone, Default)]
pub struct Usb {
    pub serial: Vec<u8>,
}

impl Usb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) {
        self.serial.push(byte);
    }

    /// Drain everything sent so far.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.serial)
    }
}
