//! Object buffers, page math and resume reconciliation.

use tracing::debug;

use crate::checksum::Checksum;
use crate::protocol::{ObjectKind, PACKET_SIZE, SelectResponse};

/// One object to transfer and what the device reported about it.
#[derive(Debug, Clone)]
pub struct TransferObject<'a> {
    pub kind: ObjectKind,
    pub data: &'a [u8],
    /// Page size announced by Select.
    pub max_size: u32,
    /// Offset reported by Select.
    pub offset: u32,
    /// CRC over `data[..offset]` reported by Select.
    pub crc: i32,
}

impl<'a> TransferObject<'a> {
    pub fn new(kind: ObjectKind, data: &'a [u8], select: SelectResponse) -> Self {
        Self {
            kind,
            data,
            max_size: select.max_size,
            offset: select.offset,
            crc: select.crc,
        }
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Page containing `offset`.
    pub fn page(&self, offset: u32) -> PageBounds {
        page_bounds(offset, self.max_size, self.len())
    }

    /// Decide where to continue from, given what the device already holds.
    pub fn reconcile(&self, checksum: &Checksum) -> Resumption {
        let len = self.len();
        if self.offset == 0 {
            return Resumption::Fresh;
        }
        if self.offset > len {
            debug!(
                object = %self.kind,
                offset = self.offset,
                len,
                "Device holds more than the local object"
            );
            return Resumption::Fresh;
        }
        if !checksum.matches(&self.data[..self.offset as usize], self.crc) {
            debug!(object = %self.kind, offset = self.offset, "Device data does not match");
            return Resumption::Fresh;
        }
        if self.offset == len {
            return Resumption::Complete;
        }

        match self.kind {
            ObjectKind::Command => Resumption::Resume {
                offset: self.offset,
            },
            ObjectKind::Data => {
                // An aligned offset means a whole page arrived but may not
                // have been executed.
                if self.offset % self.max_size == 0 {
                    Resumption::ExecutePending {
                        offset: self.offset,
                    }
                } else {
                    Resumption::Resume {
                        offset: self.offset,
                    }
                }
            }
        }
    }
}

/// Where a transfer continues after Select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// Nothing usable on the device; start at 0.
    Fresh,
    /// Keep writing into the current page from `offset`, without Create.
    Resume { offset: u32 },
    /// A full page ends at `offset`; Execute it, then continue with the next.
    ExecutePending { offset: u32 },
    /// The whole object is on the device.
    Complete,
}

/// Byte range `[start, end)` of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBounds {
    pub start: u32,
    pub end: u32,
}

impl PageBounds {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Page of `max_size` bytes containing `offset`, clipped to `len`.
///
/// Requires `max_size > 0` and `offset <= len`.
pub fn page_bounds(offset: u32, max_size: u32, len: u32) -> PageBounds {
    let start = offset - offset % max_size;
    let end = start.saturating_add(max_size).min(len);
    PageBounds { start, end }
}

/// Split a page into packet-sized writes.
pub fn packets(data: &[u8]) -> std::slice::Chunks<'_, u8> {
    data.chunks(PACKET_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::crc32_ieee;

    fn object(kind: ObjectKind, data: &[u8], max_size: u32, offset: u32) -> TransferObject<'_> {
        let crc = crc32_ieee(&data[..(offset as usize).min(data.len())]) as i32;
        TransferObject::new(
            kind,
            data,
            SelectResponse {
                max_size,
                offset,
                crc,
            },
        )
    }

    #[test]
    fn test_page_bounds_invariant() {
        for len in [1u32, 19, 20, 4095, 4096, 4097, 10_000] {
            for max_size in [1u32, 20, 256, 4096] {
                for offset in (0..=len).step_by(7).chain([len]) {
                    let page = page_bounds(offset, max_size, len);
                    assert!(page.start <= offset, "{offset} {max_size} {len}");
                    assert!(offset <= page.end, "{offset} {max_size} {len}");
                    assert!(page.end <= len);
                    assert_eq!(page.start % max_size, 0);
                }
            }
        }
    }

    #[test]
    fn test_page_bounds_examples() {
        assert_eq!(page_bounds(0, 4096, 10_000), PageBounds { start: 0, end: 4096 });
        assert_eq!(
            page_bounds(5000, 4096, 10_000),
            PageBounds {
                start: 4096,
                end: 8192
            }
        );
        assert_eq!(
            page_bounds(9000, 4096, 10_000),
            PageBounds {
                start: 8192,
                end: 10_000
            }
        );
    }

    #[test]
    fn test_packets_cover_page() {
        for len in [0usize, 1, 19, 20, 21, 4096, 4097] {
            let page: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let chunks: Vec<&[u8]> = packets(&page).collect();
            assert_eq!(chunks.len(), len.div_ceil(PACKET_SIZE));
            assert!(chunks.iter().all(|c| c.len() <= PACKET_SIZE));
            assert_eq!(chunks.concat(), page);
        }
        assert_eq!(packets(&[0u8; 4096]).count(), 205);
    }

    #[test]
    fn test_reconcile_fresh_when_empty() {
        let data = [7u8; 100];
        let obj = object(ObjectKind::Data, &data, 4096, 0);
        assert_eq!(obj.reconcile(&Checksum::crc32()), Resumption::Fresh);
    }

    #[test]
    fn test_reconcile_resumes_matching_prefix() {
        let data: Vec<u8> = (0..200u8).collect();
        for k in 1..200u32 {
            let obj = object(ObjectKind::Command, &data, 256, k);
            assert_eq!(
                obj.reconcile(&Checksum::crc32()),
                Resumption::Resume { offset: k }
            );
        }
    }

    #[test]
    fn test_reconcile_mismatch_restarts() {
        let data = [1u8; 300];
        let mut obj = object(ObjectKind::Data, &data, 256, 150);
        obj.crc ^= 1;
        assert_eq!(obj.reconcile(&Checksum::crc32()), Resumption::Fresh);
    }

    #[test]
    fn test_reconcile_offset_beyond_local_length() {
        let data = [1u8; 100];
        let mut obj = object(ObjectKind::Data, &data, 256, 100);
        obj.offset = 120;
        assert_eq!(obj.reconcile(&Checksum::crc32()), Resumption::Fresh);
    }

    #[test]
    fn test_reconcile_complete() {
        let data = [9u8; 141];
        let obj = object(ObjectKind::Command, &data, 256, 141);
        assert_eq!(obj.reconcile(&Checksum::crc32()), Resumption::Complete);
    }

    #[test]
    fn test_reconcile_aligned_firmware_offset_executes_page() {
        let data = vec![3u8; 10_000];
        let obj = object(ObjectKind::Data, &data, 4096, 8192);
        assert_eq!(
            obj.reconcile(&Checksum::crc32()),
            Resumption::ExecutePending { offset: 8192 }
        );

        let obj = object(ObjectKind::Data, &data, 4096, 5000);
        assert_eq!(
            obj.reconcile(&Checksum::crc32()),
            Resumption::Resume { offset: 5000 }
        );
    }

    #[test]
    fn test_reconcile_without_checksum_trusts_device() {
        let data = [1u8; 64];
        let mut obj = object(ObjectKind::Command, &data, 256, 32);
        obj.crc = 0;
        assert_eq!(
            obj.reconcile(&Checksum::disabled()),
            Resumption::Resume { offset: 32 }
        );
    }
}
