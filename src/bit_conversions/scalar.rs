use super::packed_row_len;

/// Bounds must have been checked by the caller
pub(super) fn decode_rows(start_row: usize, stop_row: usize, src: &[u8], dst: &mut [u8],
                          src_stride: usize, dst_stride: usize, row_width: usize) {
    let packed_len = packed_row_len(row_width);
    for y in start_row..stop_row {
        let src_row = &src[y * src_stride..y * src_stride + packed_len];
        let dst_row = &mut dst[y * dst_stride..y * dst_stride + 2 * row_width];

        for (packed, samples) in src_row.chunks_exact(3).zip(dst_row.chunks_exact_mut(4)) {
            let s0 = u16::from(packed[0]) | (u16::from(packed[1] & 0x0F) << 8);
            let s1 = u16::from(packed[1] >> 4) | (u16::from(packed[2]) << 4);
            samples[..2].copy_from_slice(&s0.to_le_bytes());
            samples[2..].copy_from_slice(&s1.to_le_bytes());
        }
    }
}

pub(super) fn encode_rows(start_row: usize, stop_row: usize, src: &[u8], dst: &mut [u8],
                          src_stride: usize, dst_stride: usize, row_width: usize) {
    let packed_len = packed_row_len(row_width);
    for y in start_row..stop_row {
        let src_row = &src[y * src_stride..y * src_stride + 2 * row_width];
        let dst_row = &mut dst[y * dst_stride..y * dst_stride + packed_len];

        for (samples, packed) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(3)) {
            let s0 = u16::from_le_bytes([samples[0], samples[1]]);
            let s1 = u16::from_le_bytes([samples[2], samples[3]]);
            packed[0] = s0 as u8;
            packed[1] = ((s0 >> 8) & 0x0F) as u8 | (s1 << 4) as u8;
            packed[2] = (s1 >> 4) as u8;
        }
    }
}
