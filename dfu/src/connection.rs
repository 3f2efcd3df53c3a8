use std::{
    io::{self, Read},
    thread,
    time::{Duration, Instant},
};

use log::debug;
use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::error::*;
use crate::{DEFAULT_TIMEOUT, DfuDescriptor};

const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DOWNLOAD: u8 = 1;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;
const DFU_CMD_ABORT: u8 = 6;

const DFU_STATUS_LEN: u16 = 6;

/// Device state as reported in `bState` (DFU 1.1, section 6.1.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DownloadSync,
            0x04 => DfuState::DownloadBusy,
            0x05 => DfuState::DownloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0a => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    status: u8,
    poll_timeout: u32,
    state: DfuState,
}

impl DfuStatus {
    pub(crate) fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::ShortStatus(data.len()));
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: DfuState::from(data[4]),
        })
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    /// `bwPollTimeout`: minimum delay before the next GETSTATUS
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout as u64)
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        if self.status != 0 {
            Err(DfuError::Status(self.status))
        } else {
            Ok(())
        }
    }
}

/// Claimed DFU interface with one alternate setting selected
pub struct DfuConnection {
    device: nusb::Device,
    interface: nusb::Interface,
    descriptor: DfuDescriptor,
    xfer_size: u16,
}

impl DfuConnection {
    pub(crate) fn new(
        device: nusb::Device,
        interface: nusb::Interface,
        descriptor: DfuDescriptor,
    ) -> Self {
        let xfer_size = match descriptor.transfer_size() {
            0 => crate::DEFAULT_TRANSFER_SIZE,
            size => size,
        };
        DfuConnection {
            device,
            interface,
            descriptor,
            xfer_size,
        }
    }

    pub fn transfer_size(&self) -> u16 {
        self.xfer_size
    }

    pub fn descriptor(&self) -> &DfuDescriptor {
        &self.descriptor
    }

    /// Bring the interface back to a state that accepts a new download:
    /// clear a pending error, abort a half-finished transfer.
    pub fn prepare(&self) -> Result<DfuStatus, DfuError> {
        let mut st = self.get_status()?;
        debug!("DFU state({:?}) status({})", st.state, st.status);
        if st.state == DfuState::Error {
            debug!("Clearing error status");
            self.clear_status()?;
            st = self.get_status()?;
        }
        if matches!(st.state, DfuState::DownloadIdle | DfuState::UploadIdle) {
            debug!("Aborting previous incomplete transfer");
            self.abort()?;
            st = self.get_status()?;
        }
        Ok(st)
    }

    pub fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)?;
        DfuStatus::from_raw(&data)
    }

    pub fn clear_status(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    pub fn abort(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[])
    }

    /// Stream `total` bytes from `reader` to the device, then run the
    /// manifestation phase. `progress` receives (sent, total) after each
    /// block.
    pub fn download<R: Read>(
        &self,
        mut reader: R,
        total: u64,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<(), DfuError> {
        let mut block = vec![0u8; self.xfer_size as usize];
        let mut block_nr: u16 = 0;
        let mut sent: u64 = 0;

        loop {
            let len =
                fill_block(&mut reader, &mut block).map_err(DfuError::Source)?;
            if len == 0 {
                break;
            }
            self.dfu_cmd_out(DFU_CMD_DOWNLOAD, block_nr, &block[..len])?;
            self.poll_until(|state| state == DfuState::DownloadIdle)?;
            block_nr = block_nr.wrapping_add(1);
            sent += len as u64;
            progress(sent, total);
        }
        debug!("Sent {sent} bytes in {block_nr} blocks, manifesting");

        self.manifest(block_nr)
    }

    /// Zero-length DNLOAD followed by status reads until the device is done.
    ///
    /// Devices that reset themselves here tear down the bus before the last
    /// status read, so transfer errors are reported as
    /// [`DfuError::Manifestation`].
    fn manifest(&self, block_nr: u16) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, block_nr, &[])
            .map_err(into_manifestation)?;
        self.poll_until(|state| {
            matches!(state, DfuState::DfuIdle | DfuState::ManifestWaitReset)
        })
        .map_err(into_manifestation)
    }

    /// Ask the device to leave DFU mode within `timeout_ms`
    pub fn detach(&self, timeout_ms: u16) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DETACH, timeout_ms, &[])
    }

    /// USB port reset, the host half of "detach + reset"
    pub fn reset_device(&self) -> Result<(), DfuError> {
        Ok(self.device.reset().wait()?)
    }

    fn poll_until(
        &self,
        done: impl Fn(DfuState) -> bool,
    ) -> Result<(), DfuError> {
        let start = Instant::now();
        loop {
            let st = self.get_status()?;
            st.ok()?;
            if done(st.state) {
                return Ok(());
            }
            if st.state == DfuState::Error {
                return Err(DfuError::Status(st.status));
            }
            if start.elapsed() >= DEFAULT_TIMEOUT * 2 {
                return Err(DfuError::Timeout);
            }
            thread::sleep(st.poll_timeout());
        }
    }

    fn dfu_cmd_out(
        &self,
        req: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: req,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn dfu_cmd_in(
        &self,
        req: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: req,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }
}

fn into_manifestation(err: DfuError) -> DfuError {
    match err {
        DfuError::Transfer(e) => DfuError::Manifestation(e),
        other => other,
    }
}

/// Read until `block` is full or the reader is exhausted
fn fill_block<R: Read>(reader: &mut R, block: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
