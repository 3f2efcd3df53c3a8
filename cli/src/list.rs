use dfu::{DfuDevice, find_dfu_devices};

use crate::CliError;

pub(crate) fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

fn print_devices(devices: &[DfuDevice]) {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} {}",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            device.product_string().unwrap_or_default(),
        );

        let transfer_size = device
            .dfu_descriptor()
            .map(|desc| desc.transfer_size())
            .unwrap_or_default();
        for interface in device.interfaces() {
            println!(
                "  \"{}\" (intf={}, alt={}, xfer={})",
                interface.name(),
                interface.interface(),
                interface.alt_setting(),
                transfer_size,
            );
        }
    }
}
