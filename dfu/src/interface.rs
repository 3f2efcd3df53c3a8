use std::{num::NonZeroU8, time::Duration};

use nusb::{self, MaybeFuture};

/// One DFU interface / alternate setting pair, identified by the name the
/// device reports in the alt setting's string descriptor.
#[derive(Clone, Debug)]
pub struct DfuInterface {
    interface: u8,
    alt_setting: u8,
    name: String,
}

impl DfuInterface {
    pub(crate) fn new(
        device: &nusb::Device,
        interface: u8,
        alt_setting: u8,
        name_idx: Option<NonZeroU8>,
    ) -> Self {
        let name = name_idx
            .and_then(|idx| {
                get_string_descriptor(device, idx, crate::DEFAULT_TIMEOUT)
            })
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        Self {
            interface,
            alt_setting,
            name,
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    /// Alt setting name, empty when the device provides none
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}
