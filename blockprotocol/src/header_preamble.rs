use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::segment::SegmentDescriptor;
use crate::MAX_DATA_BLOCKS;

/// The fixed-size part in front of every transfer header, declaring the size of the user
///  header that follows and the sizes of all blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderPreamble {
    pub user_header_len: usize,
    pub block_sizes: Vec<usize>,
}

impl HeaderPreamble {
    /// header size (u16) + legacy marker (i32) + block sizes (8 x u32)
    pub const SERIALIZED_LEN: usize = size_of::<u16>() + size_of::<i32>() + MAX_DATA_BLOCKS * size_of::<u32>();

    /// Number of leading bytes that are sufficient to know the total length of a header
    pub const SIZE_PREFIX_LEN: usize = size_of::<u16>() + size_of::<i32>();

    const NEW_STYLE_MARKER: i32 = -1;

    pub fn total_len(&self) -> usize {
        Self::SERIALIZED_LEN + self.user_header_len
    }

    pub fn num_blocks(&self) -> usize {
        self.block_sizes.len()
    }

    pub fn total_block_size(&self) -> usize {
        self.block_sizes.iter().sum()
    }

    /// The total length of the header starting at `buf`, or `None` if there are not enough bytes
    ///  to tell yet
    pub fn peek_total_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < Self::SIZE_PREFIX_LEN {
            return None;
        }
        let user_header_len: usize = u16::from_be_bytes([buf[0], buf[1]]).safe_cast();
        Some(Self::SERIALIZED_LEN + user_header_len)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.user_header_len.prechecked_cast());
        buf.put_i32(Self::NEW_STYLE_MARKER);
        for i in 0..MAX_DATA_BLOCKS {
            let size = self.block_sizes.get(i).copied().unwrap_or(0);
            buf.put_u32(size.prechecked_cast());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let user_header_len: usize = buf.try_get_u16()?.safe_cast();
        let marker = buf.try_get_i32()?;
        if marker >= 0 {
            bail!("legacy single-block transfers are not supported (declared size {})", marker);
        }

        let mut block_sizes = Vec::new();
        let mut saw_unused = false;
        for _ in 0..MAX_DATA_BLOCKS {
            let size: usize = buf.try_get_u32()?.safe_cast();
            if size == 0 {
                saw_unused = true;
                continue;
            }
            if saw_unused {
                bail!("declared block sizes are not contiguous");
            }
            if size > SegmentDescriptor::MAX_OFFSET {
                bail!("declared block size {} exceeds the addressable range", size);
            }
            block_sizes.push(size);
        }

        if block_sizes.is_empty() {
            bail!("received a transfer with zero blocks");
        }

        Ok(HeaderPreamble {
            user_header_len,
            block_sizes,
        })
    }
}
