#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;
use super::packed_row_len;

/// Decodes 48 packed bytes (32 samples) per step.
///
/// Each group of three bytes `AA BA BB` is shuffled into four bytes `AA BA BA BB`, i.e. two
///  little-endian 16-bit lanes that each contain one sample at a nibble offset. Multiplying
///  the even lanes by 16 shifts their sample to the top, and a final right shift by 4 moves
///  both lanes into place.
///
/// # Safety
///
/// The CPU must support SSSE3, `row_width` must be a multiple of 32, and all rows must be in
///  bounds. With `ALIGNED`, every source row must start on a 16-byte boundary.
#[target_feature(enable = "ssse3")]
pub(super) unsafe fn decode_rows<const ALIGNED: bool>(start_row: usize, stop_row: usize, src: &[u8], dst: &mut [u8],
                                                      src_stride: usize, dst_stride: usize, row_width: usize) {
    let mask_1a = _mm_setr_epi8(0, 1, 1, 2, 3, 4, 4, 5, 6, 7, 7, 8, 9, 10, 10, 11);
    let mask_1b = _mm_setr_epi8(12, 13, 13, 14, 15, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1);
    let mask_2a = _mm_setr_epi8(-1, -1, -1, -1, -1, 0, 0, 1, 2, 3, 3, 4, 5, 6, 6, 7);
    let mask_2b = _mm_setr_epi8(8, 9, 9, 10, 11, 12, 12, 13, 14, 15, 15, -1, -1, -1, -1, -1);
    let mask_3a = _mm_setr_epi8(-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, 0, 1, 2, 2, 3);
    let mask_3b = _mm_setr_epi8(4, 5, 5, 6, 7, 8, 8, 9, 10, 11, 11, 12, 13, 14, 14, 15);

    // x16 for even lanes, x1 for odd lanes
    let shift_multiplier = _mm_set_epi16(1, 16, 1, 16, 1, 16, 1, 16);

    let packed_len = packed_row_len(row_width);
    for y in start_row..stop_row {
        let src_row = &src[y * src_stride..y * src_stride + packed_len];
        let dst_row = &mut dst[y * dst_stride..y * dst_stride + 2 * row_width];

        for (packed, samples) in src_row.chunks_exact(48).zip(dst_row.chunks_exact_mut(64)) {
            let p = packed.as_ptr() as *const __m128i;
            let (pixels_1, pixels_2, pixels_3) = if ALIGNED {
                (_mm_load_si128(p), _mm_load_si128(p.add(1)), _mm_load_si128(p.add(2)))
            }
            else {
                (_mm_loadu_si128(p), _mm_loadu_si128(p.add(1)), _mm_loadu_si128(p.add(2)))
            };

            // shuffle indices with the high bit set produce zero bytes, so the halves can be OR'ed
            let parts = [
                _mm_shuffle_epi8(pixels_1, mask_1a),
                _mm_or_si128(_mm_shuffle_epi8(pixels_1, mask_1b), _mm_shuffle_epi8(pixels_2, mask_2a)),
                _mm_or_si128(_mm_shuffle_epi8(pixels_2, mask_2b), _mm_shuffle_epi8(pixels_3, mask_3a)),
                _mm_shuffle_epi8(pixels_3, mask_3b),
            ];

            let out = samples.as_mut_ptr() as *mut __m128i;
            for (i, part) in parts.into_iter().enumerate() {
                let shifted = _mm_srli_epi16::<4>(_mm_mullo_epi16(part, shift_multiplier));
                _mm_storeu_si128(out.add(i), shifted);
            }
        }
    }
}
