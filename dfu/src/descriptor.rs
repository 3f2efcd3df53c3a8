pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
/// Only the fields needed to drive a download are decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// Decode a raw functional descriptor, `None` if it is truncated.
    pub(crate) fn parse(raw_desc: &[u8]) -> Option<Self> {
        if raw_desc.len() < 7 {
            return None;
        }
        Some(Self {
            attributes: raw_desc[2],
            detach_timeout: u16::from_le_bytes([raw_desc[3], raw_desc[4]]),
            transfer_size: u16::from_le_bytes([raw_desc[5], raw_desc[6]]),
        })
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Device keeps talking USB after the manifestation phase
    /// (`bitManifestationTolerant`). Intolerant devices usually drop off the
    /// bus right after the last status read.
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device detaches on its own after `DFU_DETACH` (`bitWillDetach`)
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// `wDetachTimeOut`, in milliseconds
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes per control-write transaction (`wTransferSize`)
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_functional_descriptor() {
        // bmAttributes = can download + manifestation tolerant,
        // wDetachTimeOut = 1000, wTransferSize = 4096, bcdDFUVersion = 1.10
        let raw = [0x09, 0x21, 0x05, 0xE8, 0x03, 0x00, 0x10, 0x10, 0x01];
        let desc = DfuDescriptor::parse(&raw).unwrap();
        assert!(desc.can_download());
        assert!(desc.manifestation_tolerant());
        assert!(!desc.will_detach());
        assert_eq!(desc.detach_timeout(), 1000);
        assert_eq!(desc.transfer_size(), 4096);
    }

    #[test]
    fn test_truncated_descriptor() {
        assert_eq!(DfuDescriptor::parse(&[0x09, 0x21, 0x05]), None);
    }
}
