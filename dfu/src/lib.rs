//! USB Device Firmware Upgrade (DFU) client based on [`nusb`]
//!
//! Implements the host side of the DFU 1.1 download path as needed to push
//! multi-stage boot firmware and raw storage images to devices that expose
//! one alternate setting per flashable region (e.g. TI K3 ROM / SPL / U-Boot
//! DFU gadgets, where alt settings are addressed by name such as
//! `bootloader`, `tispl.bin`, `u-boot.img` or `rawemmc`).
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//!
//! # Example
//!
//! The following example looks up the alt setting named `bootloader` on a
//! TI J7 device:
//! ```no_run
//! use dfu::find_dfu_devices;
//!
//! let devices = find_dfu_devices(Some(0x0451), Some(0x6165))?;
//! match devices.iter().find_map(|d| d.find_alt_setting("bootloader")) {
//!     Some(intf) => println!("alt {} on interface {}", intf.alt_setting(), intf.interface()),
//!     None => println!("No matching DFU device found"),
//! }
//! # Ok::<(), dfu::DfuError>(())
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024;

mod connection;
mod descriptor;
mod device;
mod error;
mod interface;

use std::time::Duration;

// Re-exports
pub use connection::{DfuConnection, DfuState, DfuStatus};
pub use descriptor::DfuDescriptor;
pub use device::{DfuDevice, check_backend, find_dfu_devices};
pub use error::DfuError;
pub use interface::DfuInterface;
