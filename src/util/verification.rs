//! Data generation and verification
//!
//! Written data is a per-I/O seed byte repeated over every block's data region
//! and metadata region. Blocks may carry metadata in two layouts:
//!
//! - **separate**: a second buffer holding `md_size` bytes per block
//! - **interleaved**: the last `md_size` bytes of each `block_size` block
//!
//! A separate metadata buffer is passed as `Some(..)`. When it is `None` and
//! `md_size` is non-zero, metadata is treated as interleaved.

/// Geometry of one I/O as seen by the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Bytes per block in the data buffer, including interleaved metadata
    pub block_size: usize,
    /// Metadata bytes per block (0 when the device has none)
    pub md_size: usize,
    pub num_blocks: usize,
}

impl BlockLayout {
    /// Data bytes per block and metadata stride for the given layout
    fn strides(&self, separate_md: bool) -> (usize, usize) {
        if separate_md {
            (self.block_size, self.md_size)
        } else {
            (self.block_size - self.md_size, self.block_size)
        }
    }

    /// Offset of block `i`'s metadata
    fn md_offset(&self, i: usize, separate_md: bool) -> usize {
        if separate_md {
            i * self.md_size
        } else {
            i * self.block_size + self.block_size - self.md_size
        }
    }
}

/// Region of a block where a mismatch was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Data,
    Metadata,
}

/// Verification result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// Read-back data matches what was written
    Success,
    /// First mismatch found
    Failure {
        /// Block index within the I/O
        block: usize,
        region: Region,
        /// Byte offset of the first differing byte within its buffer
        offset: usize,
        /// Word containing the first differing byte, as written
        expected: u32,
        /// The same word as read back
        actual: u32,
    },
}

impl VerificationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, VerificationResult::Success)
    }
}

/// Fill every block's data and metadata region with `seed`
pub fn generate_data(buf: &mut [u8], md_buf: Option<&mut [u8]>, layout: BlockLayout, seed: u8) {
    let separate = md_buf.is_some();
    let (data_block_size, _) = layout.strides(separate);

    for i in 0..layout.num_blocks {
        let start = i * layout.block_size;
        buf[start..start + data_block_size].fill(seed);
    }

    if layout.md_size == 0 {
        return;
    }
    match md_buf {
        Some(md) => md[..layout.num_blocks * layout.md_size].fill(seed),
        None => {
            for i in 0..layout.num_blocks {
                let start = layout.md_offset(i, false);
                buf[start..start + layout.md_size].fill(seed);
            }
        }
    }
}

/// Compare written data against read-back data block by block
///
/// Metadata is compared only when `check_md` is set. Stops at the first
/// mismatch. A buffer shorter than the layout fails at the first block it
/// does not fully cover.
pub fn verify_data(
    written: &[u8],
    written_md: Option<&[u8]>,
    read: &[u8],
    read_md: Option<&[u8]>,
    layout: BlockLayout,
    check_md: bool,
) -> VerificationResult {
    let separate = written_md.is_some();
    let (data_block_size, _) = layout.strides(separate);

    let data_len = layout.num_blocks * layout.block_size;
    let data_avail = written.len().min(read.len());
    if let Some(failure) = short_buffer(data_avail, data_len, layout.block_size, Region::Data) {
        return failure;
    }
    if check_md && layout.md_size > 0 {
        if let (Some(wr), Some(rd)) = (written_md, read_md) {
            let md_len = layout.num_blocks * layout.md_size;
            let md_avail = wr.len().min(rd.len());
            if let Some(failure) = short_buffer(md_avail, md_len, layout.md_size, Region::Metadata) {
                return failure;
            }
        }
    }

    for i in 0..layout.num_blocks {
        let start = i * layout.block_size;
        let range = start..start + data_block_size;
        if let Some(failure) = compare(&written[range.clone()], &read[range], start, i, Region::Data) {
            return failure;
        }

        if !check_md || layout.md_size == 0 {
            continue;
        }
        let md_start = layout.md_offset(i, separate);
        let md_range = md_start..md_start + layout.md_size;
        let (wr_md, rd_md) = match (written_md, read_md) {
            (Some(wr), Some(rd)) => (&wr[md_range.clone()], &rd[md_range]),
            (None, None) => (&written[md_range.clone()], &read[md_range]),
            // Layout disagreement between the two sides is a mismatch in itself.
            _ => {
                return VerificationResult::Failure {
                    block: i,
                    region: Region::Metadata,
                    offset: md_start,
                    expected: 0,
                    actual: 0,
                }
            }
        };
        if let Some(failure) = compare(wr_md, rd_md, md_start, i, Region::Metadata) {
            return failure;
        }
    }

    VerificationResult::Success
}

/// Copy data and metadata from `src` into `dst`
///
/// Used to stage a generated pattern into a backend-leased buffer before a
/// zero-copy write. Returns false if the destination is too small or the
/// metadata layouts differ.
pub fn copy_data(
    dst: &mut [u8],
    dst_md: Option<&mut [u8]>,
    src: &[u8],
    src_md: Option<&[u8]>,
    layout: BlockLayout,
) -> bool {
    let data_len = layout.num_blocks * layout.block_size;
    if dst.len() < data_len || src.len() < data_len {
        return false;
    }
    dst[..data_len].copy_from_slice(&src[..data_len]);

    match (dst_md, src_md) {
        (Some(dst_md), Some(src_md)) => {
            let md_len = layout.num_blocks * layout.md_size;
            if dst_md.len() < md_len || src_md.len() < md_len {
                return false;
            }
            dst_md[..md_len].copy_from_slice(&src_md[..md_len]);
            true
        }
        (None, None) => true,
        _ => false,
    }
}

fn short_buffer(len: usize, needed: usize, stride: usize, region: Region) -> Option<VerificationResult> {
    if len >= needed {
        return None;
    }
    Some(VerificationResult::Failure {
        block: len / stride.max(1),
        region,
        offset: len,
        expected: 0,
        actual: 0,
    })
}

fn compare(
    expected: &[u8],
    actual: &[u8],
    base: usize,
    block: usize,
    region: Region,
) -> Option<VerificationResult> {
    let pos = expected.iter().zip(actual).position(|(e, a)| e != a)?;
    let word = pos & !3;
    Some(VerificationResult::Failure {
        block,
        region,
        offset: base + pos,
        expected: load_word(expected, word),
        actual: load_word(actual, word),
    })
}

fn load_word(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    let end = (at + 4).min(buf.len());
    bytes[..end - at].copy_from_slice(&buf[at..end]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEPARATE: BlockLayout = BlockLayout {
        block_size: 512,
        md_size: 8,
        num_blocks: 4,
    };

    const INTERLEAVED: BlockLayout = BlockLayout {
        block_size: 520,
        md_size: 8,
        num_blocks: 4,
    };

    #[test]
    fn test_generate_separate_md() {
        let mut buf = vec![0u8; 2048];
        let mut md = vec![0u8; 32];
        generate_data(&mut buf, Some(&mut md), SEPARATE, 0x5A);
        assert!(buf.iter().all(|&b| b == 0x5A));
        assert!(md.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_generate_interleaved_md() {
        let mut buf = vec![0u8; 520 * 4];
        generate_data(&mut buf, None, INTERLEAVED, 0x11);
        assert!(buf.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_round_trip_every_byte_flip_fails() {
        let mut written = vec![0u8; 520 * 4];
        generate_data(&mut written, None, INTERLEAVED, 0xC3);
        assert!(verify_data(&written, None, &written.clone(), None, INTERLEAVED, true).is_success());

        for i in (0..written.len()).step_by(37) {
            let mut read = written.clone();
            read[i] ^= 0x01;
            assert!(
                !verify_data(&written, None, &read, None, INTERLEAVED, true).is_success(),
                "flip at {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_mismatch_reports_word() {
        let mut written = vec![0u8; 2048];
        let mut md = vec![0u8; 32];
        generate_data(&mut written, Some(&mut md), SEPARATE, 0xAA);
        let mut read = written.clone();
        read[1030] = 0x00;

        match verify_data(&written, Some(&md), &read, Some(&md), SEPARATE, true) {
            VerificationResult::Failure { block, region, offset, expected, actual } => {
                assert_eq!(block, 2);
                assert_eq!(region, Region::Data);
                assert_eq!(offset, 1030);
                assert_eq!(expected, 0xAAAA_AAAA);
                assert_eq!(actual, 0xAA00_AAAA);
            }
            VerificationResult::Success => panic!("Expected failure"),
        }
    }

    #[test]
    fn test_short_read_buffer_is_a_mismatch() {
        let mut written = vec![0u8; 2048];
        let mut md = vec![0u8; 32];
        generate_data(&mut written, Some(&mut md), SEPARATE, 0x3C);

        match verify_data(&written, Some(&md), &written[..1100], Some(&md), SEPARATE, true) {
            VerificationResult::Failure { block, region, offset, .. } => {
                assert_eq!(block, 2);
                assert_eq!(region, Region::Data);
                assert_eq!(offset, 1100);
            }
            VerificationResult::Success => panic!("Expected failure"),
        }

        match verify_data(&written, Some(&md), &written, Some(&md[..12]), SEPARATE, true) {
            VerificationResult::Failure { block, region, .. } => {
                assert_eq!(block, 1);
                assert_eq!(region, Region::Metadata);
            }
            VerificationResult::Success => panic!("Expected failure"),
        }
        assert!(verify_data(&written, Some(&md), &written, Some(&md[..12]), SEPARATE, false).is_success());
    }

    #[test]
    fn test_metadata_check_is_optional() {
        let mut written = vec![0u8; 2048];
        let mut md = vec![0u8; 32];
        generate_data(&mut written, Some(&mut md), SEPARATE, 0x42);
        let mut read_md = md.clone();
        read_md[9] = 0;

        assert!(verify_data(&written, Some(&md), &written, Some(&read_md), SEPARATE, false).is_success());
        match verify_data(&written, Some(&md), &written, Some(&read_md), SEPARATE, true) {
            VerificationResult::Failure { block, region, .. } => {
                assert_eq!(block, 1);
                assert_eq!(region, Region::Metadata);
            }
            VerificationResult::Success => panic!("Expected metadata failure"),
        }
    }

    #[test]
    fn test_interleaved_md_skipped_without_check() {
        let mut written = vec![0u8; 520 * 4];
        generate_data(&mut written, None, INTERLEAVED, 0x77);
        let mut read = written.clone();
        // last byte of block 0 is metadata
        read[519] = 0;
        assert!(verify_data(&written, None, &read, None, INTERLEAVED, false).is_success());
        assert!(!verify_data(&written, None, &read, None, INTERLEAVED, true).is_success());
    }

    #[test]
    fn test_copy_data() {
        let mut src = vec![0u8; 2048];
        let mut src_md = vec![0u8; 32];
        generate_data(&mut src, Some(&mut src_md), SEPARATE, 0x3C);

        let mut dst = vec![0u8; 2048];
        let mut dst_md = vec![0u8; 32];
        assert!(copy_data(&mut dst, Some(&mut dst_md), &src, Some(&src_md), SEPARATE));
        assert!(verify_data(&src, Some(&src_md), &dst, Some(&dst_md), SEPARATE, true).is_success());
    }

    #[test]
    fn test_copy_data_rejects_short_destination() {
        let src = vec![1u8; 2048];
        let mut dst = vec![0u8; 1024];
        let layout = BlockLayout { block_size: 512, md_size: 0, num_blocks: 4 };
        assert!(!copy_data(&mut dst, None, &src, None, layout));
    }
}
