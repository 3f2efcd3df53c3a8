//! Run configuration
//!
//! Defaults target the TI J7 (AM68/TDA4) ROM DFU gadget and the timings
//! observed on that hardware.

use std::{path::PathBuf, time::Duration};

use crate::request::DEFAULT_BASE_URL;

/// TI J7 device USB ID
pub const TI_VENDOR_ID: u16 = 0x0451;
pub const TI_PRODUCT_ID: u16 = 0x6165;

const APP_DIR: &str = "gemflash";
const WORK_DIR: &str = "gem-imager";

#[derive(Clone, Debug)]
pub struct FlasherConfig {
    /// Directory holding `tiboot3.bin`, `tispl.bin` and `u-boot.img`
    pub source_dir: PathBuf,
    pub vendor_id: u16,
    pub product_id: u16,
    pub base_url: String,
    pub timing: Timing,
    pub discovery: Discovery,
    pub paths: Paths,
}

/// Dwell periods between stages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Between bootloader stages, while the device re-enumerates
    pub reconnect_dwell: Duration,
    /// Before the raw storage alt setting is expected to show up
    pub image_mode_dwell: Duration,
    /// How often a dwell checks for the device
    pub poll_interval: Duration,
}

/// Device discovery retries inside one transfer session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discovery {
    pub attempts: u32,
    pub delay: Duration,
}

/// Filesystem locations, resolved once at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    /// Holds the single cache slot and its persisted settings
    pub cache_dir: PathBuf,
    /// Scratch space for downloads and extracted images
    pub work_dir: PathBuf,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reconnect_dwell: Duration::from_secs(5),
            image_mode_dwell: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            attempts: 15,
            delay: Duration::from_secs(1),
        }
    }
}

impl Paths {
    /// Platform cache directory and the system temp directory
    pub fn platform() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        Self {
            cache_dir,
            work_dir: std::env::temp_dir().join(WORK_DIR),
        }
    }
}

impl FlasherConfig {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            vendor_id: TI_VENDOR_ID,
            product_id: TI_PRODUCT_ID,
            base_url: DEFAULT_BASE_URL.to_string(),
            timing: Timing::default(),
            discovery: Discovery::default(),
            paths: Paths::platform(),
        }
    }
}
