#![cfg(all(target_arch = "aarch64", target_endian = "little"))]

use std::arch::aarch64::*;
use super::packed_row_len;

/// Table lookup indices for `vqtbl3q_u8` after a de-interleaving `vld3q_u8` load: source byte `n`
///  of a 48-byte step is found at `n / 3 + (n % 3) * 16`. Every group of three source bytes
///  `a b c` is expanded to the four output bytes `a b b c`.
const fn shuffle_masks() -> [[u8; 16]; 4] {
    const GROUP_PATTERN: [usize; 4] = [0, 1, 1, 2];

    let mut masks = [[0u8; 16]; 4];
    let mut i = 0;
    while i < 64 {
        let source = 3 * (i / 4) + GROUP_PATTERN[i % 4];
        masks[i / 16][i % 16] = (source / 3 + (source % 3) * 16) as u8;
        i += 1;
    }
    masks
}

const SHUFFLE_MASKS: [[u8; 16]; 4] = shuffle_masks();

/// # Safety
///
/// `row_width` must be a multiple of 32, and all rows must be in bounds.
pub(super) unsafe fn decode_rows(start_row: usize, stop_row: usize, src: &[u8], dst: &mut [u8],
                                 src_stride: usize, dst_stride: usize, row_width: usize) {
    let masks = [
        vld1q_u8(SHUFFLE_MASKS[0].as_ptr()),
        vld1q_u8(SHUFFLE_MASKS[1].as_ptr()),
        vld1q_u8(SHUFFLE_MASKS[2].as_ptr()),
        vld1q_u8(SHUFFLE_MASKS[3].as_ptr()),
    ];
    // even lanes carry their sample in the low 12 bits, odd lanes at a 4 bit offset
    let shift_left = vld1q_s16([4i16, 0, 4, 0, 4, 0, 4, 0].as_ptr());

    let packed_len = packed_row_len(row_width);
    for y in start_row..stop_row {
        let src_row = &src[y * src_stride..y * src_stride + packed_len];
        let dst_row = &mut dst[y * dst_stride..y * dst_stride + 2 * row_width];

        for (packed, samples) in src_row.chunks_exact(48).zip(dst_row.chunks_exact_mut(64)) {
            let pixels = vld3q_u8(packed.as_ptr());
            for (i, mask) in masks.iter().enumerate() {
                let part = vreinterpretq_u16_u8(vqtbl3q_u8(pixels, *mask));
                let shifted = vshrq_n_u16::<4>(vshlq_u16(part, shift_left));
                vst1q_u8(samples.as_mut_ptr().add(16 * i), vreinterpretq_u8_u16(shifted));
            }
        }
    }
}
