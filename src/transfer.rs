//! Transfer primitive
//!
//! One [TransferPrimitive] session pushes one file to one alt setting. The
//! [Transport] hands out sessions and can check the bus for a device between them.
//! [UsbTransport] implements both on top of the `dfu` crate.

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    thread,
};

use dfu::{DfuDevice, DfuError, check_backend, find_dfu_devices};
use log::{debug, info, warn};
use nusb::transfer::TransferError as UsbTransferError;
use thiserror::Error;

use crate::config::Discovery;
use crate::progress::CancelToken;

/// Timeout passed along with DFU_DETACH, in milliseconds
/// Used when the functional descriptor leaves `wDetachTimeOut` at zero
const DEFAULT_DETACH_TIMEOUT_MS: u16 = 1000;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("USB backend unavailable: {0}")]
    Init(#[source] DfuError),

    #[error(
        "No DFU device {vendor_id:04x}:{product_id:04x} with alt setting \"{alt}\" after {attempts} attempts"
    )]
    DeviceNotFound {
        vendor_id: u16,
        product_id: u16,
        alt: String,
        attempts: u32,
    },

    #[error("No DFU device selected")]
    NotConnected,

    #[error("Cannot claim DFU interface: {0}")]
    Claim(#[source] DfuError),

    #[error("Cannot bring DFU interface to idle: {0}")]
    Status(#[source] DfuError),

    #[error("Cannot open {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Transfer(#[source] DfuError),

    /// The device accepted every block, then dropped off the bus while
    /// manifesting. This is how ROM loaders that reboot straight into the
    /// next stage behave.
    #[error("I/O error after the full payload was sent: {0}")]
    IoAfterPayload(#[source] DfuError),

    #[error("Cancelled")]
    Cancelled,
}

impl TransferError {
    /// Sort a download failure into benign or fatal
    pub fn from_download(err: DfuError) -> Self {
        match err {
            // the device dropped off the bus while rebooting
            DfuError::Manifestation(
                e @ (UsbTransferError::Disconnected | UsbTransferError::Fault),
            ) => TransferError::IoAfterPayload(DfuError::Manifestation(e)),
            other => TransferError::Transfer(other),
        }
    }

    /// Whether the stage counts as flashed despite this error
    pub fn is_benign(&self) -> bool {
        matches!(self, TransferError::IoAfterPayload(_))
    }
}

/// Which device a session is looking for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchCriteria {
    pub vendor_id: u16,
    pub product_id: u16,
    pub alt_name: String,
}

impl MatchCriteria {
    pub fn new(vendor_id: u16, product_id: u16, alt_name: &str) -> Self {
        Self {
            vendor_id,
            product_id,
            alt_name: alt_name.to_string(),
        }
    }
}

/// One stage's worth of USB work: initialize, find, download, clean up.
///
/// `cleanup` may be called at any point and any number of times.
pub trait TransferPrimitive {
    fn initialize(&mut self) -> Result<(), TransferError>;

    fn find_device(&mut self, criteria: &MatchCriteria) -> Result<(), TransferError>;

    /// `progress` receives (bytes sent, total bytes)
    fn download_file(
        &mut self,
        path: &Path,
        alt_name: &str,
        reset_after: bool,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransferError>;

    fn cleanup(&mut self);
}

/// Source of fresh [TransferPrimitive] sessions
pub trait Transport {
    type Session: TransferPrimitive;

    fn session(&self, cancel: &CancelToken) -> Self::Session;

    /// Whether a device matching `criteria` is present right now.
    /// `None` means the transport cannot tell.
    fn device_present(&self, _criteria: &MatchCriteria) -> Option<bool> {
        None
    }
}

/// [Transport] over the host USB stack
#[derive(Clone, Debug, Default)]
pub struct UsbTransport {
    discovery: Discovery,
}

impl UsbTransport {
    pub fn new(discovery: Discovery) -> Self {
        Self { discovery }
    }
}

impl Transport for UsbTransport {
    type Session = UsbSession;

    fn session(&self, cancel: &CancelToken) -> UsbSession {
        UsbSession {
            discovery: self.discovery.clone(),
            cancel: cancel.clone(),
            device: None,
            initialized: false,
        }
    }

    fn device_present(&self, criteria: &MatchCriteria) -> Option<bool> {
        match lookup(criteria) {
            Ok(device) => Some(device.is_some()),
            Err(e) => {
                debug!("Device lookup failed: {e}");
                None
            }
        }
    }
}

pub struct UsbSession {
    discovery: Discovery,
    cancel: CancelToken,
    device: Option<DfuDevice>,
    initialized: bool,
}

impl TransferPrimitive for UsbSession {
    fn initialize(&mut self) -> Result<(), TransferError> {
        check_backend().map_err(TransferError::Init)?;
        self.initialized = true;
        Ok(())
    }

    fn find_device(&mut self, criteria: &MatchCriteria) -> Result<(), TransferError> {
        let attempts = self.discovery.attempts.max(1);
        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match lookup(criteria) {
                Ok(Some(device)) => {
                    info!(
                        "Found DFU device {:04x}:{:04x} on bus {} address {} with alt \"{}\"",
                        device.vendor_id(),
                        device.product_id(),
                        device.bus_id(),
                        device.device_address(),
                        criteria.alt_name,
                    );
                    self.device = Some(device);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => debug!("Device enumeration failed: {e}"),
            }
            debug!(
                "Waiting for DFU device... attempt {attempt}/{attempts}"
            );
            if attempt < attempts {
                thread::sleep(self.discovery.delay);
            }
        }
        Err(TransferError::DeviceNotFound {
            vendor_id: criteria.vendor_id,
            product_id: criteria.product_id,
            alt: criteria.alt_name.clone(),
            attempts,
        })
    }

    fn download_file(
        &mut self,
        path: &Path,
        alt_name: &str,
        reset_after: bool,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransferError> {
        let device = self.device.as_ref().ok_or(TransferError::NotConnected)?;
        let intf = device.find_alt_setting(alt_name).ok_or_else(|| {
            TransferError::Claim(DfuError::NoSuchAltSetting(alt_name.into()))
        })?;

        let file_error = |source| TransferError::File {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(file_error)?;
        let total = file.metadata().map_err(file_error)?.len();

        let connection = device
            .connect(intf.interface(), intf.alt_setting())
            .map_err(TransferError::Claim)?;
        connection.prepare().map_err(TransferError::Status)?;

        let descriptor = connection.descriptor();
        if !descriptor.can_download() {
            warn!("Alt \"{alt_name}\" does not advertise download support");
        }
        debug!(
            "DFU attributes: manifestation tolerant {}, will detach {}, detach timeout {} ms",
            descriptor.manifestation_tolerant(),
            descriptor.will_detach(),
            descriptor.detach_timeout(),
        );
        let detach_timeout = match descriptor.detach_timeout() {
            0 => DEFAULT_DETACH_TIMEOUT_MS,
            ms => ms,
        };

        info!(
            "Downloading {} ({total} bytes) to alt \"{alt_name}\" in {} byte blocks",
            path.display(),
            connection.transfer_size(),
        );
        let result = connection
            .download(BufReader::new(file), total, |sent, total| {
                progress(sent, total)
            })
            .map_err(TransferError::from_download);

        let result = match result {
            Ok(()) => {
                info!("Download of {} complete", path.display());
                Ok(())
            }
            Err(e) if e.is_benign() => {
                warn!("{e}; device is most likely rebooting into the next stage");
                Err(e)
            }
            Err(e) => return Err(e),
        };

        if reset_after {
            debug!("Detaching and resetting device");
            if let Err(e) = connection.detach(detach_timeout) {
                warn!("DFU detach failed: {e}");
            }
            // the device usually vanishes mid-reset
            if let Err(e) = connection.reset_device() {
                debug!("USB reset: {e}");
            }
        }
        result
    }

    fn cleanup(&mut self) {
        if self.device.take().is_some() || self.initialized {
            debug!("Releasing DFU session");
        }
        self.initialized = false;
    }
}

impl Drop for UsbSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn lookup(criteria: &MatchCriteria) -> Result<Option<DfuDevice>, DfuError> {
    let devices =
        find_dfu_devices(Some(criteria.vendor_id), Some(criteria.product_id))?;
    Ok(devices
        .into_iter()
        .find(|dev| dev.find_alt_setting(&criteria.alt_name).is_some()))
}
