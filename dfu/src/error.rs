use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DfuError {
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),
    #[error("Transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),
    /// Transfer error raised after the last payload block was accepted,
    /// while the device was manifesting the firmware
    #[error("Transfer error during manifestation: {0}")]
    Manifestation(nusb::transfer::TransferError),
    #[error("DFU status error: code {0}")]
    Status(u8),
    #[error("Short DFU status reply ({0} bytes)")]
    ShortStatus(usize),
    #[error("No DFU alt setting named \"{0}\"")]
    NoSuchAltSetting(String),
    #[error("Cannot read firmware source: {0}")]
    Source(#[source] io::Error),
    #[error("Timeout")]
    Timeout,
}
