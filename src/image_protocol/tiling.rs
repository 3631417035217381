use anyhow::bail;
use blockprotocol::TransferError;
use crate::bit_conversions::decode_12bit_packed;
use crate::image_set::ImageFormat;

/// Column stripes in which a sender transmits a frame: a first tile, any number of identical
///  middle tiles and a last tile. Each tile is transmitted completely (all rows) before the
///  next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileWidths {
    pub first: usize,
    /// 0 if there are exactly two tiles
    pub middle: usize,
    /// 0 for untiled transfers
    pub last: usize,
}

impl TileWidths {
    pub const UNTILED: TileWidths = TileWidths { first: 0, middle: 0, last: 0 };

    pub fn is_tiled(&self) -> bool {
        self.last != 0
    }

    pub fn num_tiles(&self, width: usize) -> usize {
        if self.last == 0 {
            1
        }
        else if self.middle == 0 {
            2
        }
        else {
            2 + width.saturating_sub(self.first + self.last) / self.middle
        }
    }

    /// The widths of all tiles from left to right. Fails if they do not cover the row exactly.
    pub fn tile_layout(&self, width: usize) -> anyhow::Result<Vec<usize>> {
        if !self.is_tiled() {
            return Ok(vec![width]);
        }
        if self.first == 0 {
            bail!("first tile of {:?} is empty", self);
        }

        let n = self.num_tiles(width);
        let tiles: Vec<usize> = (0..n)
            .map(|i| if i == 0 {
                self.first
            }
            else if i == n - 1 {
                self.last
            }
            else {
                self.middle
            })
            .collect();

        let covered: usize = tiles.iter().sum();
        if covered != width {
            bail!("tiles {:?} cover {} of {} columns", self, covered, width);
        }
        Ok(tiles)
    }
}

/// Transfers the rows of a tiled channel that were received since the last call
///  (`last_received` bytes then, `received` bytes now) into a contiguous raster, decoding 12-bit
///  data on the way. Returns the number of complete rows.
///
/// The wire data holds the tiles one after the other, each with all of its rows.
pub(super) fn decode_tiled(tiles: &[usize], format: ImageFormat, width: usize, height: usize,
                           last_received: usize, received: usize, src: &[u8], dst: &mut [u8]) -> Result<usize, TransferError> {
    let bytes_per_pixel = format.bytes_per_pixel();
    let dst_stride = width * bytes_per_pixel;

    let mut payload_offset = 0;
    let mut decode_x = 0;
    let mut valid_rows = 0;
    for &tile_width in tiles {
        let tile_stride = format.wire_row_len(tile_width);
        let tile_start = last_received.saturating_sub(payload_offset) / tile_stride;
        let tile_stop = (received.saturating_sub(payload_offset) / tile_stride).min(height);

        let tile_src = &src[payload_offset.min(src.len())..];
        let tile_dst = &mut dst[decode_x..];
        if format == ImageFormat::Mono12 {
            decode_12bit_packed(tile_start, tile_stop, tile_src, tile_dst, tile_stride, dst_stride, tile_width)?;
        }
        else {
            let row_len = tile_width * bytes_per_pixel;
            for y in tile_start..tile_stop {
                tile_dst[y * dst_stride..y * dst_stride + row_len]
                    .copy_from_slice(&tile_src[y * tile_stride..y * tile_stride + row_len]);
            }
        }

        payload_offset += height * tile_stride;
        decode_x += tile_width * bytes_per_pixel;
        valid_rows = tile_stop;
    }
    Ok(valid_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::untiled(TileWidths::UNTILED, 100, vec![100])]
    #[case::untiled_with_first(TileWidths { first: 40, middle: 0, last: 0 }, 100, vec![100])]
    #[case::two_tiles(TileWidths { first: 60, middle: 0, last: 40 }, 100, vec![60, 40])]
    #[case::middle_tiles(TileWidths { first: 20, middle: 30, last: 20 }, 100, vec![20, 30, 30, 20])]
    #[case::single_middle(TileWidths { first: 36, middle: 32, last: 28 }, 96, vec![36, 32, 28])]
    fn test_tile_layout(#[case] tiles: TileWidths, #[case] width: usize, #[case] expected: Vec<usize>) {
        assert_eq!(tiles.num_tiles(width), expected.len());
        assert_eq!(tiles.tile_layout(width).unwrap(), expected);
    }

    #[rstest]
    #[case::gap(TileWidths { first: 50, middle: 0, last: 40 }, 100)]
    #[case::middle_remainder(TileWidths { first: 20, middle: 25, last: 20 }, 100)]
    #[case::too_wide(TileWidths { first: 80, middle: 10, last: 40 }, 100)]
    #[case::empty_first(TileWidths { first: 0, middle: 0, last: 100 }, 100)]
    fn test_tile_layout_invalid(#[case] tiles: TileWidths, #[case] width: usize) {
        assert!(tiles.tile_layout(width).is_err());
    }

    /// wire data for a tiled 8-bit channel where pixel (x, y) has the value `10 * y + x`
    fn tiled_mono8(tiles: &[usize], height: usize) -> Vec<u8> {
        let mut result = Vec::new();
        let mut x0 = 0;
        for &tile_width in tiles {
            for y in 0..height {
                for x in x0..x0 + tile_width {
                    result.push((10 * y + x) as u8);
                }
            }
            x0 += tile_width;
        }
        result
    }

    #[test]
    fn test_decode_tiled_mono8_incrementally() {
        let tiles = [4, 3, 3];
        let (width, height) = (10, 5);
        let src = tiled_mono8(&tiles, height);
        let mut dst = vec![0u8; width * height];

        // the first tile plus two rows of the second
        let received = 4 * height + 2 * 3;
        assert_eq!(decode_tiled(&tiles, ImageFormat::Mono8, width, height, 0, received, &src, &mut dst).unwrap(), 0);
        assert_eq!(dst[..4], [0, 1, 2, 3]);
        assert_eq!(dst[4..7], [4, 5, 6]);
        assert_eq!(dst[2 * width + 4], 0);

        let received_before = received;
        let received = src.len() - 3;
        assert_eq!(decode_tiled(&tiles, ImageFormat::Mono8, width, height, received_before, received, &src, &mut dst).unwrap(), 4);
        assert_eq!(decode_tiled(&tiles, ImageFormat::Mono8, width, height, received, src.len(), &src, &mut dst).unwrap(), 5);

        let expected: Vec<u8> = (0..height).flat_map(|y| (0..width).map(move |x| (10 * y + x) as u8)).collect();
        assert_eq!(dst, expected);
    }

    #[test]
    fn test_decode_tiled_rgb() {
        let tiles = [1, 1];
        let src = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let mut dst = [0u8; 12];
        assert_eq!(decode_tiled(&tiles, ImageFormat::Rgb8, 2, 2, 0, src.len(), &src, &mut dst).unwrap(), 2);
        assert_eq!(dst, [1, 2, 3, 7, 8, 9, 4, 5, 6, 10, 11, 12]);
    }

    #[test]
    fn test_decode_tiled_mono12() {
        // two tiles of two pixels, one row: samples 0x123 0x456 | 0x789 0xABC
        let tiles = [2, 2];
        let src = [0x23, 0x61, 0x45, 0x89, 0xC7, 0xAB];
        let mut dst = [0u8; 8];
        assert_eq!(decode_tiled(&tiles, ImageFormat::Mono12, 4, 1, 0, src.len(), &src, &mut dst).unwrap(), 1);
        assert_eq!(dst, [0x23, 0x01, 0x56, 0x04, 0x89, 0x07, 0xBC, 0x0A]);
    }
}
