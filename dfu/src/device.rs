use log::debug;
use nusb::{self, MaybeFuture};

use crate::{
    DfuConnection, DfuError, descriptor::*, interface::*,
};

const DFU_CLASS: u8 = 0xFE;
const DFU_SUBCLASS: u8 = 0x1;

/// DFU device representation
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    interfaces: Vec<DfuInterface>,
}

impl DfuDevice {
    fn from_device_info(
        device: nusb::DeviceInfo,
    ) -> Result<Option<Self>, DfuError> {
        let open_dev: nusb::Device = device.open().wait()?;
        let dfu_interfaces: Vec<DfuInterface> = open_dev
            .configurations()
            .flat_map(|configuration| {
                let open_dev = open_dev.clone();
                configuration.interface_alt_settings().filter_map(
                    move |alt_setting| {
                        if alt_setting.class() != DFU_CLASS
                            || alt_setting.subclass() != DFU_SUBCLASS
                        {
                            None
                        } else {
                            Some(DfuInterface::new(
                                &open_dev,
                                alt_setting.interface_number(),
                                alt_setting.alternate_setting(),
                                alt_setting.string_index(),
                            ))
                        }
                    },
                )
            })
            .collect();

        if dfu_interfaces.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DfuDevice {
                dev: device,
                interfaces: dfu_interfaces,
            }))
        }
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn product_string(&self) -> Option<&str> {
        self.dev.product_string()
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &Vec<DfuInterface> {
        &self.interfaces
    }

    /// Find the alternate setting whose string descriptor equals `name`
    pub fn find_alt_setting(&self, name: &str) -> Option<&DfuInterface> {
        self.interfaces.iter().find(|intf| intf.name() == name)
    }

    pub(crate) fn open(&self) -> Result<nusb::Device, DfuError> {
        Ok(self.dev.open().wait()?)
    }

    /// Query the DFU functional descriptor for this device. If no descriptor
    /// can be found, [DfuDescriptor::default()] is returned.
    pub fn dfu_descriptor(&self) -> Result<DfuDescriptor, DfuError> {
        let open_dev = self.open()?;
        Ok(open_dev
            .configurations()
            .find_map(|config| {
                config.interface_alt_settings().find_map(|alt_setting| {
                    alt_setting.descriptors().find(is_dfu_descriptor)
                })
            })
            .and_then(|dfu_desc| DfuDescriptor::parse(&dfu_desc))
            .unwrap_or_default())
    }

    /// Connect to the DFU interface
    ///
    /// Claims `interface` and selects `alt_setting`, so the returned
    /// connection addresses exactly one flashable region.
    pub fn connect(
        &self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<DfuConnection, DfuError> {
        let descriptor = self.dfu_descriptor()?;
        let dev = self.open()?;
        debug!("Claiming USB DFU interface {interface}");
        let claimed = dev.claim_interface(interface).wait()?;
        debug!("Setting alternate interface #{alt_setting}");
        claimed.set_alt_setting(alt_setting).wait()?;
        Ok(DfuConnection::new(dev, claimed, descriptor))
    }
}

fn is_dfu_descriptor(desc: &nusb::descriptors::Descriptor) -> bool {
    desc.descriptor_len() == DFU_DESC_LEN
        && desc.descriptor_type() == DFU_DESC_TYPE
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Make sure the host USB stack can be enumerated at all
pub fn check_backend() -> Result<(), DfuError> {
    nusb::list_devices().wait()?;
    Ok(())
}

pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut dfu_devices = Vec::with_capacity(devices.len());
    for device in devices {
        if let Some(dfu_device) = DfuDevice::from_device_info(device)? {
            dfu_devices.push(dfu_device);
        }
    }
    Ok(dfu_devices)
}
