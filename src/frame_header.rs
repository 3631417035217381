//! The frame header describes an image set and travels as the block transfer's user header.
//!
//! The header grew over several versions. Each version appended fields, and since version 2
//!  the header declares its own size and flags the extensions it carries, so a receiver reads
//!  what it knows and skips the rest. All numbers are big-endian:
//!
//! ```ascii
//!   0: magic 0x3D15 (u16)
//!   2: protocol version (u8)
//!   3: legacy raw image pair flag (u8) - channel 1 is 'right' if set, 'disparity' otherwise
//!   4: width (u16)
//!   6: height (u16)
//!   8: first tile width (u16)
//!  10: last tile width (u16) - 0 for untiled transfers
//!  12: format of channels 0 and 1 (2 x u8)
//!  14: min disparity (u16)
//!  16: max disparity (u16)
//!  18: subpixel factor (u8)
//!  19: sequence number (u32)
//!  23: timestamp sec, usec (2 x i32)
//!  31: Q matrix (16 x f32)
//!  --- 95: end of mandatory fields
//!  95: middle tiles width (u16)
//!  --- 97: end of legacy header
//!  97: total header size (u16)
//!  99: flags (u16)
//! 101: number of images (u8)
//! 102: format of channel 2 (u8)
//!  --- 103: end of V2
//! 103: image type per channel (8 x u8)
//!  --- 111: V3
//! 111: exposure time (i32)
//! 115: last sync pulse sec, usec (2 x i32)
//!  --- 123: V4
//! 123: format of channel 3 (u8)
//!  --- 124: V5
//! 124: trigger pulse sequence index (5 x u8)
//!  --- 129: V6
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use blockprotocol::TransferError;
use crate::image_protocol::TileWidths;
use crate::image_set::{ImageFormat, ImageSet, ImageType, MAX_SUPPORTED_IMAGES, MAX_TRIGGER_CHANNELS};

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct HeaderFlags: u16 {
        /// data blocks per channel instead of interleaved channels
        const NEW_STYLE_TRANSFER = 0x0001;
        const HEADER_V3 = 0x0002;
        const HEADER_V4 = 0x0004;
        const HEADER_V5 = 0x0008;
        const HEADER_V6 = 0x0010;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub protocol_version: u8,
    pub legacy_raw_image_pair: bool,
    pub width: u16,
    pub height: u16,
    pub first_tile_width: u16,
    pub middle_tiles_width: u16,
    pub last_tile_width: u16,
    /// raw pixel format per channel
    pub formats: [u8; MAX_SUPPORTED_IMAGES],
    pub min_disparity: u16,
    pub max_disparity: u16,
    pub subpixel_factor: u8,
    pub sequence_number: u32,
    pub time_sec: i32,
    pub time_usec: i32,
    pub q_matrix: [f32; 16],
    pub total_header_size: u16,
    /// may contain flags unknown to this implementation
    pub flags: HeaderFlags,
    pub number_of_images: u8,
    /// raw image type per channel
    pub image_types: [u8; 8],
    pub exposure_time: i32,
    pub last_sync_pulse_sec: i32,
    pub last_sync_pulse_usec: i32,
    pub trigger_pulse_sequence_index: [u8; MAX_TRIGGER_CHANNELS],
}

impl FrameHeader {
    pub const MAGIC: u16 = 0x3D15;
    pub const PROTOCOL_VERSION: u8 = 6;

    pub const MANDATORY_LEN: usize = 95;
    pub const LEGACY_LEN: usize = 97;
    pub const V2_LEN: usize = 103;
    pub const V3_LEN: usize = 111;
    pub const V4_LEN: usize = 123;
    pub const V5_LEN: usize = 124;
    pub const SERIALIZED_LEN: usize = 129;

    /// Describes an image set for sending
    pub fn for_image_set<D>(image_set: &ImageSet<D>, tiles: TileWidths) -> Result<FrameHeader, TransferError> {
        image_set.validate_geometry()?;
        tiles.tile_layout(image_set.width)
            .map_err(|e| TransferError::Misuse(format!("invalid tiles: {}", e)))?;

        let mut formats = [0u8; MAX_SUPPORTED_IMAGES];
        let mut image_types = [u8::from(ImageType::Undefined); 8];
        for (i, c) in image_set.channels().iter().enumerate() {
            formats[i] = c.format.into();
            image_types[i] = c.image_type.into();
        }

        Ok(FrameHeader {
            protocol_version: Self::PROTOCOL_VERSION,
            legacy_raw_image_pair: false,
            width: image_set.width as u16,
            height: image_set.height as u16,
            first_tile_width: Self::tile_field(tiles.first)?,
            middle_tiles_width: Self::tile_field(tiles.middle)?,
            last_tile_width: Self::tile_field(tiles.last)?,
            formats,
            min_disparity: image_set.min_disparity,
            max_disparity: image_set.max_disparity,
            subpixel_factor: image_set.subpixel_factor,
            sequence_number: image_set.sequence_number,
            time_sec: image_set.timestamp.sec,
            time_usec: image_set.timestamp.usec,
            q_matrix: image_set.q_matrix,
            total_header_size: Self::SERIALIZED_LEN as u16,
            flags: HeaderFlags::all(),
            number_of_images: image_set.num_images() as u8,
            image_types,
            exposure_time: image_set.exposure_time,
            last_sync_pulse_sec: image_set.last_sync_pulse.sec,
            last_sync_pulse_usec: image_set.last_sync_pulse.usec,
            trigger_pulse_sequence_index: image_set.trigger_pulse_sequence_index,
        })
    }

    fn tile_field(width: usize) -> Result<u16, TransferError> {
        u16::try_from(width)
            .map_err(|_| TransferError::Misuse(format!("tile width {} exceeds the header field", width)))
    }

    pub fn tile_widths(&self) -> TileWidths {
        TileWidths {
            first: self.first_tile_width.into(),
            middle: self.middle_tiles_width.into(),
            last: self.last_tile_width.into(),
        }
    }

    /// flags that were set by the sender but are unknown to this implementation
    pub fn unknown_flags(&self) -> u16 {
        self.flags.bits() & !HeaderFlags::all().bits()
    }

    pub fn channel_format(&self, channel: usize) -> anyhow::Result<ImageFormat> {
        let Some(&raw) = self.formats.get(channel) else {
            anyhow::bail!("no channel {}", channel);
        };
        ImageFormat::try_from(raw)
            .map_err(|_| anyhow::anyhow!("invalid pixel format {} for channel {}", raw, channel))
    }

    /// The semantics of each channel. Headers without the V3 extension have no explicit image
    ///  types: channel 0 is left, and channel 1 is either right or disparity depending on the
    ///  legacy raw image pair flag.
    pub fn channel_types(&self) -> anyhow::Result<Vec<ImageType>> {
        let n = self.number_of_images as usize;
        if n == 0 || n > MAX_SUPPORTED_IMAGES {
            anyhow::bail!("invalid number of images: {}", n);
        }
        if self.flags.contains(HeaderFlags::HEADER_V3) {
            return self.image_types[..n].iter()
                .map(|&t| ImageType::try_from(t).map_err(|_| anyhow::anyhow!("invalid image type {}", t)))
                .collect();
        }

        let second = if self.legacy_raw_image_pair { ImageType::Right } else { ImageType::Disparity };
        Ok((0..n)
            .map(|i| match i {
                0 => ImageType::Left,
                1 => second,
                _ => ImageType::Undefined,
            })
            .collect())
    }

    /// Writes the full current layout
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Self::MAGIC);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.legacy_raw_image_pair.into());
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u16(self.first_tile_width);
        buf.put_u16(self.last_tile_width);
        buf.put_u8(self.formats[0]);
        buf.put_u8(self.formats[1]);
        buf.put_u16(self.min_disparity);
        buf.put_u16(self.max_disparity);
        buf.put_u8(self.subpixel_factor);
        buf.put_u32(self.sequence_number);
        buf.put_i32(self.time_sec);
        buf.put_i32(self.time_usec);
        for q in self.q_matrix {
            buf.put_f32(q);
        }
        buf.put_u16(self.middle_tiles_width);
        buf.put_u16(self.total_header_size);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.number_of_images);
        buf.put_u8(self.formats[2]);
        buf.put_slice(&self.image_types);
        buf.put_i32(self.exposure_time);
        buf.put_i32(self.last_sync_pulse_sec);
        buf.put_i32(self.last_sync_pulse_usec);
        buf.put_u8(self.formats[3]);
        buf.put_slice(&self.trigger_pulse_sequence_index);
    }

    /// Parses a received header. Returns `None` if the data is too short for a header or does
    ///  not start with the magic number.
    ///
    /// Fields beyond the received (or declared) header size get their legacy defaults: two
    ///  images, no explicit image types, no exposure, sync or trigger data. Interpreting the
    ///  fields according to the flags is up to the caller.
    pub fn deser(raw: &[u8]) -> anyhow::Result<Option<FrameHeader>> {
        if raw.len() < Self::MANDATORY_LEN {
            return Ok(None);
        }
        let mut buf = raw;
        if buf.try_get_u16()? != Self::MAGIC {
            return Ok(None);
        }

        let protocol_version = buf.try_get_u8()?;
        if protocol_version != Self::PROTOCOL_VERSION {
            anyhow::bail!("protocol version mismatch: expected {}, got {}", Self::PROTOCOL_VERSION, protocol_version);
        }

        let mut header = FrameHeader {
            protocol_version,
            legacy_raw_image_pair: buf.try_get_u8()? != 0,
            width: buf.try_get_u16()?,
            height: buf.try_get_u16()?,
            first_tile_width: buf.try_get_u16()?,
            last_tile_width: buf.try_get_u16()?,
            formats: [buf.try_get_u8()?, buf.try_get_u8()?, 0, 0],
            min_disparity: buf.try_get_u16()?,
            max_disparity: buf.try_get_u16()?,
            subpixel_factor: buf.try_get_u8()?,
            sequence_number: buf.try_get_u32()?,
            time_sec: buf.try_get_i32()?,
            time_usec: buf.try_get_i32()?,
            q_matrix: [0.0; 16],
            middle_tiles_width: 0,
            total_header_size: Self::MANDATORY_LEN as u16,
            flags: HeaderFlags::empty(),
            number_of_images: 2,
            image_types: [u8::from(ImageType::Undefined); 8],
            exposure_time: 0,
            last_sync_pulse_sec: 0,
            last_sync_pulse_usec: 0,
            trigger_pulse_sequence_index: [0; MAX_TRIGGER_CHANNELS],
        };
        for q in header.q_matrix.iter_mut() {
            *q = buf.try_get_f32()?;
        }

        if raw.len() >= Self::LEGACY_LEN {
            header.middle_tiles_width = buf.try_get_u16()?;
            header.total_header_size = Self::LEGACY_LEN as u16;
        }
        if raw.len() < Self::V2_LEN {
            return Ok(Some(header));
        }

        header.total_header_size = buf.try_get_u16()?;
        header.flags = HeaderFlags::from_bits_retain(buf.try_get_u16()?);
        header.number_of_images = buf.try_get_u8()?;
        header.formats[2] = buf.try_get_u8()?;

        // a larger declared size belongs to a newer sender, a smaller one means fewer extensions
        let available = raw.len().min((header.total_header_size as usize).max(Self::V2_LEN));
        if available >= Self::V3_LEN {
            buf.try_copy_to_slice(&mut header.image_types)?;
        }
        if available >= Self::V4_LEN {
            header.exposure_time = buf.try_get_i32()?;
            header.last_sync_pulse_sec = buf.try_get_i32()?;
            header.last_sync_pulse_usec = buf.try_get_i32()?;
        }
        if available >= Self::V5_LEN {
            header.formats[3] = buf.try_get_u8()?;
        }
        if available >= Self::SERIALIZED_LEN {
            buf.try_copy_to_slice(&mut header.trigger_pulse_sequence_index)?;
        }
        Ok(Some(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::image_set::{Channel, Timestamp};

    fn sample_header() -> FrameHeader {
        let mut image_set = ImageSet::<()>::new(640, 480);
        image_set.add_channel(Channel::new(ImageFormat::Mono8, ImageType::Left, 640, ())).unwrap();
        image_set.add_channel(Channel::new(ImageFormat::Mono12, ImageType::Disparity, 640, ())).unwrap();
        image_set.add_channel(Channel::new(ImageFormat::Rgb8, ImageType::Color, 640, ())).unwrap();
        image_set.add_channel(Channel::new(ImageFormat::Mono8, ImageType::Right, 640, ())).unwrap();
        image_set.sequence_number = 0x0102_0304;
        image_set.timestamp = Timestamp { sec: 1_700_000_000, usec: 999_999 };
        image_set.q_matrix[0] = 1.0;
        image_set.q_matrix[15] = -0.5;
        image_set.min_disparity = 0;
        image_set.max_disparity = 255;
        image_set.exposure_time = 2000;
        image_set.last_sync_pulse = Timestamp { sec: 5, usec: 6 };
        image_set.trigger_pulse_sequence_index = [1, 2, 3, 4, 5];
        FrameHeader::for_image_set(&image_set, TileWidths::UNTILED).unwrap()
    }

    fn serialized(header: &FrameHeader) -> Vec<u8> {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_ser() {
        let raw = serialized(&sample_header());
        assert_eq!(raw.len(), FrameHeader::SERIALIZED_LEN);
        assert_eq!(raw[..13], [0x3D, 0x15, 6, 0, 0x02, 0x80, 0x01, 0xE0, 0, 0, 0, 0, 0]);
        assert_eq!(raw[13], 2);
        assert_eq!(raw[16..19], [0, 255, 16]);
        assert_eq!(raw[19..23], [1, 2, 3, 4]);
        assert_eq!(raw[31..35], 1.0f32.to_be_bytes());
        assert_eq!(raw[97..103], [0, 129, 0, 0x1F, 4, 1]);
        assert_eq!(raw[103..111], [1, 2, 4, 3, 0, 0, 0, 0]);
        assert_eq!(raw[111..115], [0, 0, 0x07, 0xD0]);
        assert_eq!(raw[123], 0);
        assert_eq!(raw[124..], [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_round_trip() {
        let header = sample_header();
        let parsed = FrameHeader::deser(&serialized(&header)).unwrap().unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.unknown_flags(), 0);
        assert_eq!(parsed.channel_types().unwrap(), vec![ImageType::Left, ImageType::Disparity, ImageType::Color, ImageType::Right]);
        assert_eq!(parsed.channel_format(2).unwrap(), ImageFormat::Rgb8);
    }

    #[rstest]
    #[case::mandatory(FrameHeader::MANDATORY_LEN, 95, 0)]
    #[case::legacy(FrameHeader::LEGACY_LEN, 97, 0)]
    #[case::between_legacy_and_v2(100, 97, 0)]
    fn test_legacy_defaults(#[case] len: usize, #[case] total_header_size: u16, #[case] middle_tiles_width: u16) {
        let mut header = sample_header();
        header.middle_tiles_width = middle_tiles_width;
        let raw = serialized(&header);

        let parsed = FrameHeader::deser(&raw[..len]).unwrap().unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.sequence_number, 0x0102_0304);
        assert_eq!(parsed.q_matrix, header.q_matrix);
        assert_eq!(parsed.total_header_size, total_header_size);
        assert_eq!(parsed.flags, HeaderFlags::empty());
        assert_eq!(parsed.number_of_images, 2);
        assert_eq!(parsed.formats[2..], [0, 0]);
        assert_eq!(parsed.exposure_time, 0);
        assert_eq!(parsed.last_sync_pulse_sec, 0);
        // no V3 flag: channel 1 is disparity unless the legacy raw pair flag is set
        assert_eq!(parsed.channel_types().unwrap(), vec![ImageType::Left, ImageType::Disparity]);
    }

    #[test]
    fn test_middle_tiles_width_needs_legacy_len() {
        let mut header = sample_header();
        header.middle_tiles_width = 100;
        let raw = serialized(&header);
        assert_eq!(FrameHeader::deser(&raw[..95]).unwrap().unwrap().middle_tiles_width, 0);
        assert_eq!(FrameHeader::deser(&raw[..97]).unwrap().unwrap().middle_tiles_width, 100);
    }

    #[rstest]
    #[case::v2(FrameHeader::V2_LEN, false, false, false)]
    #[case::v3(FrameHeader::V3_LEN, true, false, false)]
    #[case::v4(FrameHeader::V4_LEN, true, true, false)]
    #[case::v5(FrameHeader::V5_LEN, true, true, false)]
    fn test_older_declared_sizes(#[case] len: usize, #[case] has_types: bool, #[case] has_exposure: bool, #[case] has_trigger: bool) {
        let mut header = sample_header();
        header.total_header_size = len as u16;
        let raw = serialized(&header);

        let parsed = FrameHeader::deser(&raw).unwrap().unwrap();
        assert_eq!(parsed.image_types[0] != 0, has_types);
        assert_eq!(parsed.exposure_time != 0, has_exposure);
        assert_eq!(parsed.trigger_pulse_sequence_index[0] != 0, has_trigger);
    }

    #[test]
    fn test_legacy_raw_pair() {
        let mut header = sample_header();
        header.flags = HeaderFlags::NEW_STYLE_TRANSFER;
        header.number_of_images = 2;
        header.legacy_raw_image_pair = true;
        let parsed = FrameHeader::deser(&serialized(&header)).unwrap().unwrap();
        assert_eq!(parsed.channel_types().unwrap(), vec![ImageType::Left, ImageType::Right]);
    }

    #[test]
    fn test_unknown_flags_retained() {
        let mut header = sample_header();
        header.flags = HeaderFlags::from_bits_retain(0x0100 | HeaderFlags::all().bits());
        let parsed = FrameHeader::deser(&serialized(&header)).unwrap().unwrap();
        assert_eq!(parsed.unknown_flags(), 0x0100);
        assert!(parsed.flags.contains(HeaderFlags::HEADER_V6));
    }

    #[test]
    fn test_newer_sender_longer_header() {
        let mut header = sample_header();
        header.total_header_size = 140;
        let mut raw = serialized(&header);
        raw.extend_from_slice(&[0xEE; 11]);
        let parsed = FrameHeader::deser(&raw).unwrap().unwrap();
        assert_eq!(parsed.trigger_pulse_sequence_index, [1, 2, 3, 4, 5]);
    }

    #[rstest]
    #[case::too_short(&[0x3D, 0x15, 6][..])]
    #[case::wrong_magic(&[0u8; 129][..])]
    fn test_not_a_header(#[case] raw: &[u8]) {
        assert!(FrameHeader::deser(raw).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch() {
        let mut raw = serialized(&sample_header());
        raw[2] = 5;
        assert!(FrameHeader::deser(&raw).is_err());
    }

    #[rstest]
    #[case::invalid_format(|h: &mut FrameHeader| h.formats[0] = 7)]
    #[case::invalid_type(|h: &mut FrameHeader| h.image_types[1] = 9)]
    fn test_invalid_channel_fields(#[case] modify: fn(&mut FrameHeader)) {
        let mut header = sample_header();
        modify(&mut header);
        assert!(header.channel_format(0).is_err() || header.channel_types().is_err());
    }
}
