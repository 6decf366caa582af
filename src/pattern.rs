//! Page-sampled pattern write and verify.
//!
//! The verifier writes the byte `offset % 255` at the first byte of every
//! page in a mapped region, then reads the same offsets back and compares.
//! Only the first byte of each page is touched: the reference behavior is a
//! deliberate speed/coverage trade-off (one fault and one check per page,
//! not full-page coverage), kept here as-is.
//!
//! All accesses are volatile so the round-trip cannot be folded away.

use crate::provider::{MappedRegion, PAGE_SIZE};
use thiserror::Error;

/// A pattern mismatch: the primary defect class this tool hunts for.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("Data verification failed at offset {offset}. Expected: {expected}, Got: {actual}")]
    Mismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },
}

/// The byte the pattern stores at `offset`.
pub fn expected_byte(offset: usize) -> u8 {
    (offset % 255) as u8
}

/// Write the pattern byte at the first byte of every page in the region.
pub fn write_pattern(region: &MappedRegion) {
    let addr = region.as_ptr();
    for offset in (0..region.size()).step_by(PAGE_SIZE) {
        // SAFETY: offset < region.size(), and the region is mapped
        // read-write for its whole size.
        unsafe {
            addr.add(offset).write_volatile(expected_byte(offset));
        }
    }
}

/// Read back every sampled offset and compare against the pattern.
///
/// Stops at the first mismatch, reporting the offset and both bytes.
pub fn verify_pattern(region: &MappedRegion) -> Result<(), PatternError> {
    let addr = region.as_ptr();
    for offset in (0..region.size()).step_by(PAGE_SIZE) {
        // SAFETY: offset < region.size(), and the region is mapped
        // read-write for its whole size.
        let actual = unsafe { addr.add(offset).read_volatile() };
        let expected = expected_byte(offset);
        if actual != expected {
            return Err(PatternError::Mismatch {
                offset,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Write the pattern across the region, then immediately verify it.
pub fn touch(region: &MappedRegion) -> Result<(), PatternError> {
    write_pattern(region);
    verify_pattern(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_byte_wraps_mod_255() {
        assert_eq!(expected_byte(0), 0);
        assert_eq!(expected_byte(PAGE_SIZE), 16); // 4096 % 255
        assert_eq!(expected_byte(16 * PAGE_SIZE), 1); // 65536 % 255
        // Mod 255, not 256.
        assert_eq!(expected_byte(255), 0);
        assert_eq!(expected_byte(510), 0);
    }

    #[test]
    fn touch_roundtrip_single_page() {
        let region = MappedRegion::anonymous(PAGE_SIZE).unwrap();
        touch(&region).unwrap();
        region.unmap().unwrap();
    }

    #[test]
    fn touch_roundtrip_max_region() {
        let region = MappedRegion::anonymous(512 * PAGE_SIZE).unwrap();
        touch(&region).unwrap();
        region.unmap().unwrap();
    }

    #[test]
    fn touch_roundtrip_odd_page_counts() {
        for pages in [1, 2, 3, 17, 255, 256, 511] {
            let region = MappedRegion::anonymous(pages * PAGE_SIZE).unwrap();
            touch(&region).unwrap();
            region.unmap().unwrap();
        }
    }

    #[test]
    fn only_first_byte_of_each_page_is_written() {
        let region = MappedRegion::anonymous(4 * PAGE_SIZE).unwrap();
        write_pattern(&region);
        for page in 0..4 {
            let base = page * PAGE_SIZE;
            // SAFETY: offsets are within the mapping.
            unsafe {
                let first = region.as_ptr().add(base).read_volatile();
                assert_eq!(first, expected_byte(base));
                // Anonymous memory starts zeroed; the rest of the page must
                // stay untouched.
                let second = region.as_ptr().add(base + 1).read_volatile();
                assert_eq!(second, 0, "page {page} byte 1 was written");
                let last = region.as_ptr().add(base + PAGE_SIZE - 1).read_volatile();
                assert_eq!(last, 0, "page {page} last byte was written");
            }
        }
        region.unmap().unwrap();
    }

    #[test]
    fn corrupted_byte_reports_exact_mismatch() {
        let region = MappedRegion::anonymous(8 * PAGE_SIZE).unwrap();
        write_pattern(&region);
        // SAFETY: offset within the mapping.
        unsafe {
            region.as_ptr().add(3 * PAGE_SIZE).write_volatile(0xaa);
        }
        let err = verify_pattern(&region).unwrap_err();
        assert_eq!(
            err,
            PatternError::Mismatch {
                offset: 3 * PAGE_SIZE,
                expected: expected_byte(3 * PAGE_SIZE),
                actual: 0xaa,
            }
        );
        region.unmap().unwrap();
    }

    #[test]
    fn mismatch_message_names_offset_and_bytes() {
        let err = PatternError::Mismatch {
            offset: 12288,
            expected: 48,
            actual: 170,
        };
        let msg = err.to_string();
        assert!(msg.contains("12288"), "got: {msg}");
        assert!(msg.contains("48"), "got: {msg}");
        assert!(msg.contains("170"), "got: {msg}");
    }

    #[test]
    fn verify_stops_at_first_mismatch() {
        let region = MappedRegion::anonymous(4 * PAGE_SIZE).unwrap();
        write_pattern(&region);
        // Corrupt two pages; only the earlier offset must be reported.
        // SAFETY: offsets within the mapping.
        unsafe {
            region.as_ptr().add(PAGE_SIZE).write_volatile(0xff);
            region.as_ptr().add(2 * PAGE_SIZE).write_volatile(0xff);
        }
        let err = verify_pattern(&region).unwrap_err();
        assert!(matches!(
            err,
            PatternError::Mismatch { offset, .. } if offset == PAGE_SIZE
        ));
        region.unmap().unwrap();
    }
}
