//! CRC-32 verification of transferred bytes.

use crc::{CRC_32_ISO_HDLC, Crc};
use tracing::debug;

/// Checksum function applied to an object prefix.
pub type Crc32Fn = fn(&[u8]) -> u32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Standard CRC-32 (IEEE 802.3), as computed by the bootloader.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Compares local data against CRCs reported by the device.
///
/// Without a function every comparison passes.
#[derive(Debug, Clone, Copy)]
pub struct Checksum {
    function: Option<Crc32Fn>,
}

impl Checksum {
    pub const fn new(function: Crc32Fn) -> Self {
        Self {
            function: Some(function),
        }
    }

    pub const fn crc32() -> Self {
        Self::new(crc32_ieee)
    }

    pub const fn disabled() -> Self {
        Self { function: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.function.is_some()
    }

    /// Device CRCs are signed on the wire; compare bit patterns.
    pub fn matches(&self, data: &[u8], reported: i32) -> bool {
        match self.function {
            Some(function) => function(data) as i32 == reported,
            None => {
                debug!(len = data.len(), "No CRC function set, skipping check");
                true
            }
        }
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::crc32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32_ieee(&[]), 0);
    }

    #[test]
    fn test_signed_comparison() {
        let data = b"123456789";
        let reported = 0xCBF4_3926u32 as i32;
        assert!(reported < 0);
        assert!(Checksum::crc32().matches(data, reported));
        assert!(!Checksum::crc32().matches(data, reported ^ 1));
    }

    #[test]
    fn test_disabled_always_matches() {
        let checksum = Checksum::disabled();
        assert!(!checksum.is_enabled());
        assert!(checksum.matches(b"anything", 42));
    }
}
