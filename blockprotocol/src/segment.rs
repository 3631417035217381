use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, BytesMut};
use crate::error::TransferError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// The (block id, byte offset) pair that addresses a contiguous run of bytes in one block. On the
///  wire this is packed into 32 bits: bit 31 is reserved, bits 30-28 hold the block id and
///  bits 27-0 the offset.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentDescriptor {
    pub block: usize,
    pub offset: usize,
}
impl Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.block, self.offset)
    }
}

impl SegmentDescriptor {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    /// Descriptor value that marks a control message instead of payload
    pub const CONTROL_SENTINEL: u32 = 0xFFFF_FFFF;

    /// Reserved block id; on TCP it marks the start of the next header
    pub const RESERVED_BLOCK: usize = 7;

    pub const MAX_OFFSET: usize = 0x0FFF_FFFF;

    pub fn new(block: usize, offset: usize) -> SegmentDescriptor {
        SegmentDescriptor { block, offset }
    }

    pub fn merge(&self) -> u32 {
        let block: u32 = (self.block & 0x07).prechecked_cast();
        let offset: u32 = (self.offset & Self::MAX_OFFSET).prechecked_cast();
        (block << 28) | offset
    }

    pub fn split(raw: u32) -> SegmentDescriptor {
        // NB: bit 31 is reserved and ignored
        let block: usize = ((raw >> 28) & 0x07).safe_cast();
        let offset: usize = (raw & 0x0FFF_FFFF).safe_cast();
        SegmentDescriptor { block, offset }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.merge());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(Self::split(buf.try_get_u32()?))
    }
}

/// Checks that a block size can be addressed by segment descriptors
pub fn check_block_size(size: usize) -> Result<(), TransferError> {
    if size > SegmentDescriptor::MAX_OFFSET {
        return Err(TransferError::Misuse(format!("block size {} exceeds the addressable range of {} bytes", size, SegmentDescriptor::MAX_OFFSET)));
    }
    Ok(())
}

/// A run of bytes in a block that was not received (receiver) or that was requested for
///  retransmission (sender)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MissingSegment {
    pub start: SegmentDescriptor,
    pub len: usize,
}
impl Debug for MissingSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}+{}", self.start, self.len)
    }
}

impl MissingSegment {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();

    pub fn new(block: usize, offset: usize, len: usize) -> MissingSegment {
        MissingSegment {
            start: SegmentDescriptor::new(block, offset),
            len,
        }
    }

    pub fn end_offset(&self) -> usize {
        self.start.offset + self.len
    }

    /// Removes `len` bytes from the front of the segment, returning `true` if it is fully consumed
    pub fn consume_front(&mut self, len: usize) -> bool {
        let len = len.min(self.len);
        self.start.offset += len;
        self.len -= len;
        self.len == 0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.start.ser(buf);
        buf.put_u32(self.len.prechecked_cast());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let start = SegmentDescriptor::deser(buf)?;
        let len: usize = buf.try_get_u32()?.safe_cast();
        Ok(MissingSegment { start, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0, 0x0000_0000)]
    #[case::block_1(1, 0, 0x1000_0000)]
    #[case::block_7(7, 0, 0x7000_0000)]
    #[case::offset(3, 0x123_4567, 0x3123_4567)]
    #[case::max_offset(2, 0x0FFF_FFFF, 0x2FFF_FFFF)]
    fn test_merge(#[case] block: usize, #[case] offset: usize, #[case] expected: u32) {
        assert_eq!(SegmentDescriptor::new(block, offset).merge(), expected);
        assert_eq!(SegmentDescriptor::split(expected), SegmentDescriptor::new(block, offset));
    }

    #[test]
    fn test_merge_split_is_bijective() {
        for block in 0..8 {
            for offset in [0, 1, 1468, 0x7FFF, 0x10_0000, 0x0FFF_FFFE, 0x0FFF_FFFF] {
                let descriptor = SegmentDescriptor::new(block, offset);
                assert_eq!(SegmentDescriptor::split(descriptor.merge()), descriptor);
            }
        }
    }

    #[test]
    fn test_split_ignores_reserved_bit() {
        assert_eq!(SegmentDescriptor::split(0x9000_0010), SegmentDescriptor::new(1, 0x10));
    }

    #[test]
    fn test_sentinel_splits_to_reserved_block() {
        assert_eq!(SegmentDescriptor::split(SegmentDescriptor::CONTROL_SENTINEL).block, SegmentDescriptor::RESERVED_BLOCK);
    }

    #[rstest]
    #[case::ok(SegmentDescriptor::MAX_OFFSET, true)]
    #[case::too_big(SegmentDescriptor::MAX_OFFSET + 1, false)]
    fn test_check_block_size(#[case] size: usize, #[case] expected_ok: bool) {
        assert_eq!(check_block_size(size).is_ok(), expected_ok);
    }

    #[test]
    fn test_missing_segment_ser() {
        let segment = MissingSegment::new(2, 0x100, 0x5C4);
        let mut buf = BytesMut::new();
        segment.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0x20, 0, 1, 0, 0, 0, 5, 0xC4]);

        let mut b: &[u8] = &buf;
        assert_eq!(MissingSegment::deser(&mut b).unwrap(), segment);
        assert!(b.is_empty());
    }

    #[test]
    fn test_missing_segment_deser_truncated() {
        let mut b: &[u8] = &[0x20, 0, 1, 0, 0, 0, 5];
        assert!(MissingSegment::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::partial(100, false, 200, 200)]
    #[case::exact(300, true, 400, 0)]
    #[case::more_than_len(500, true, 400, 0)]
    fn test_consume_front(#[case] consumed: usize, #[case] expected_done: bool, #[case] expected_offset: usize, #[case] expected_len: usize) {
        let mut segment = MissingSegment::new(0, 100, 300);
        assert_eq!(segment.consume_front(consumed), expected_done);
        assert_eq!(segment.start.offset, expected_offset);
        assert_eq!(segment.len, expected_len);
    }
}
