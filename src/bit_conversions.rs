//! Conversion between 12-bit packed pixel rows and 16-bit samples.
//!
//! Two samples share three bytes on the wire, low nibble order:
//!
//! ```ascii
//! byte 0: sample 0 bits 7-0
//! byte 1: sample 1 bits 3-0 | sample 0 bits 11-8
//! byte 2: sample 1 bits 11-4
//! ```
//!
//! Decoded samples are stored as little-endian `u16` in byte buffers, so decoded rows can be
//!  handed out as plain `&[u8]` image data.
//!
//! Decoding has vectorized implementations for SSSE3 (x86_64) and NEON (aarch64) that handle
//!  48 packed bytes per step. They are only used for row widths that are a multiple of 32
//!  samples, the scalar implementation covers everything else. All paths produce identical
//!  output.

mod neon;
mod scalar;
mod sse;

use blockprotocol::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
    /// x86_64 with SSSE3. Aligned loads are used if every source row starts on a 16-byte boundary.
    Sse { aligned_load: bool },
    Neon,
    Scalar,
}

/// Number of samples per vectorized decoding step
const SIMD_SAMPLES: usize = 32;

/// Selects the decoding implementation for a source buffer, based on the row width first, and on
///  the instruction set and alignment only if the width allows vectorization
pub fn decode_path(src: &[u8], src_stride: usize, row_width: usize) -> DecodePath {
    if row_width % SIMD_SAMPLES != 0 {
        return DecodePath::Scalar;
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("ssse3") {
            let aligned_load = (src.as_ptr() as usize) % 16 == 0 && src_stride % 16 == 0;
            return DecodePath::Sse { aligned_load };
        }
    }
    #[cfg(all(target_arch = "aarch64", target_endian = "little"))]
    {
        let _ = (src, src_stride);
        DecodePath::Neon
    }
    #[cfg(not(all(target_arch = "aarch64", target_endian = "little")))]
    {
        let _ = (src, src_stride);
        DecodePath::Scalar
    }
}

pub fn packed_row_len(row_width: usize) -> usize {
    row_width / 2 * 3
}

fn check_rows(name: &str, start_row: usize, stop_row: usize, buf_len: usize, stride: usize, row_len: usize) -> Result<(), TransferError> {
    if stride < row_len {
        return Err(TransferError::Misuse(format!("{} stride {} is smaller than a row of {} bytes", name, stride, row_len)));
    }
    if stop_row > start_row {
        let required = (stop_row - 1) * stride + row_len;
        if required > buf_len {
            return Err(TransferError::Misuse(format!("{} buffer of {} bytes is too small for rows {}..{} (requires {} bytes)", name, buf_len, start_row, stop_row, required)));
        }
    }
    Ok(())
}

fn check_args(start_row: usize, stop_row: usize, row_width: usize, packed: (usize, usize), unpacked: (usize, usize)) -> Result<(), TransferError> {
    if row_width % 2 != 0 {
        return Err(TransferError::Misuse(format!("12-bit packed rows must have an even width, got {}", row_width)));
    }
    check_rows("packed", start_row, stop_row, packed.0, packed.1, packed_row_len(row_width))?;
    check_rows("unpacked", start_row, stop_row, unpacked.0, unpacked.1, 2 * row_width)
}

/// Decodes rows `start_row..stop_row` of 12-bit packed data into 16-bit samples. Row `y` starts at
///  `y * src_stride` in `src` and at `y * dst_stride` in `dst`.
pub fn decode_12bit_packed(start_row: usize, stop_row: usize, src: &[u8], dst: &mut [u8],
                           src_stride: usize, dst_stride: usize, row_width: usize) -> Result<(), TransferError> {
    check_args(start_row, stop_row, row_width, (src.len(), src_stride), (dst.len(), dst_stride))?;
    if stop_row <= start_row {
        return Ok(());
    }

    match decode_path(src, src_stride, row_width) {
        #[cfg(target_arch = "x86_64")]
        DecodePath::Sse { aligned_load: true } => unsafe {
            // NB: bounds and SSSE3 support were checked above
            sse::decode_rows::<true>(start_row, stop_row, src, dst, src_stride, dst_stride, row_width)
        },
        #[cfg(target_arch = "x86_64")]
        DecodePath::Sse { aligned_load: false } => unsafe {
            sse::decode_rows::<false>(start_row, stop_row, src, dst, src_stride, dst_stride, row_width)
        },
        #[cfg(all(target_arch = "aarch64", target_endian = "little"))]
        DecodePath::Neon => unsafe {
            neon::decode_rows(start_row, stop_row, src, dst, src_stride, dst_stride, row_width)
        },
        _ => scalar::decode_rows(start_row, stop_row, src, dst, src_stride, dst_stride, row_width),
    }
    Ok(())
}

/// Packs rows `start_row..stop_row` of 16-bit samples (only the low 12 bits are kept)
pub fn encode_12bit_packed(start_row: usize, stop_row: usize, src: &[u8], dst: &mut [u8],
                           src_stride: usize, dst_stride: usize, row_width: usize) -> Result<(), TransferError> {
    check_args(start_row, stop_row, row_width, (dst.len(), dst_stride), (src.len(), src_stride))?;
    scalar::encode_rows(start_row, stop_row, src, dst, src_stride, dst_stride, row_width);
    Ok(())
}
