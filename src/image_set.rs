use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use blockprotocol::TransferError;

/// Maximum number of channels (images) in one image set
pub const MAX_SUPPORTED_IMAGES: usize = 4;

/// Number of external trigger channels with a pulse sequence index
pub const MAX_TRIGGER_CHANNELS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageFormat {
    Mono8 = 0,
    Rgb8 = 1,
    /// 12-bit samples, bit-packed on the wire and stored as 16-bit little-endian once decoded
    Mono12 = 2,
}

impl ImageFormat {
    /// Bits per pixel on the wire
    pub fn wire_bits(self) -> usize {
        match self {
            ImageFormat::Mono8 => 8,
            ImageFormat::Rgb8 => 24,
            ImageFormat::Mono12 => 12,
        }
    }

    /// Bytes per pixel in decoded image data
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageFormat::Mono8 => 1,
            ImageFormat::Rgb8 => 3,
            ImageFormat::Mono12 => 2,
        }
    }

    pub fn wire_row_len(self, width: usize) -> usize {
        width * self.wire_bits() / 8
    }

    pub fn wire_size(self, width: usize, height: usize) -> usize {
        width * height * self.wire_bits() / 8
    }

    pub fn decoded_size(self, width: usize, height: usize) -> usize {
        width * height * self.bytes_per_pixel()
    }

    /// `true` if decoded data is identical to the wire data
    pub fn is_pass_through(self) -> bool {
        self.wire_bits() == 8 * self.bytes_per_pixel()
    }
}

/// The semantics of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageType {
    Undefined = 0,
    Left = 1,
    Disparity = 2,
    Right = 3,
    Color = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: i32,
    pub usec: i32,
}

#[derive(Debug, Clone)]
pub struct Channel<D> {
    pub format: ImageFormat,
    /// distance between the starts of two consecutive rows in `data`, in bytes
    pub row_stride: usize,
    pub image_type: ImageType,
    pub data: D,
}

impl <D> Channel<D> {
    /// A channel without row padding
    pub fn new(format: ImageFormat, image_type: ImageType, width: usize, data: D) -> Channel<D> {
        Channel {
            format,
            row_stride: width * format.bytes_per_pixel(),
            image_type,
            data,
        }
    }
}

/// One captured moment: up to four images of identical size plus metadata.
///
/// The pixel data type is generic: image sets for sending own their data as [Bytes], received
///  image sets borrow it as `&[u8]`, and `()` describes an image set without data.
#[derive(Debug, Clone)]
pub struct ImageSet<D = Bytes> {
    pub width: usize,
    pub height: usize,
    channels: Vec<Channel<D>>,

    pub sequence_number: u32,
    pub timestamp: Timestamp,
    /// disparity-to-depth mapping, row major
    pub q_matrix: [f32; 16],
    pub min_disparity: u16,
    pub max_disparity: u16,
    pub subpixel_factor: u8,
    /// in microseconds
    pub exposure_time: i32,
    pub last_sync_pulse: Timestamp,
    pub trigger_pulse_sequence_index: [u8; MAX_TRIGGER_CHANNELS],
}

impl <D> ImageSet<D> {
    pub const DEFAULT_SUBPIXEL_FACTOR: u8 = 16;

    pub fn new(width: usize, height: usize) -> ImageSet<D> {
        ImageSet {
            width,
            height,
            channels: Vec::new(),
            sequence_number: 0,
            timestamp: Timestamp::default(),
            q_matrix: [0.0; 16],
            min_disparity: 0,
            max_disparity: 0,
            subpixel_factor: Self::DEFAULT_SUBPIXEL_FACTOR,
            exposure_time: 0,
            last_sync_pulse: Timestamp::default(),
            trigger_pulse_sequence_index: [0; MAX_TRIGGER_CHANNELS],
        }
    }

    pub fn add_channel(&mut self, channel: Channel<D>) -> Result<(), TransferError> {
        if self.channels.len() >= MAX_SUPPORTED_IMAGES {
            return Err(TransferError::Misuse(format!("an image set has at most {} channels", MAX_SUPPORTED_IMAGES)));
        }
        if channel.image_type != ImageType::Undefined && self.has_image_type(channel.image_type) {
            return Err(TransferError::Misuse(format!("duplicate channel of type {:?}", channel.image_type)));
        }
        self.channels.push(channel);
        Ok(())
    }

    pub fn num_images(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Channel<D>] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&Channel<D>> {
        self.channels.get(index)
    }

    /// The index of the channel with a given semantic, if present
    pub fn index_of(&self, image_type: ImageType) -> Option<usize> {
        self.channels.iter().position(|c| c.image_type == image_type)
    }

    pub fn has_image_type(&self, image_type: ImageType) -> bool {
        self.index_of(image_type).is_some()
    }

    pub fn channel_of_type(&self, image_type: ImageType) -> Option<&Channel<D>> {
        self.index_of(image_type).map(|i| &self.channels[i])
    }

    pub fn pixel_data(&self, index: usize) -> Option<&D> {
        self.channels.get(index).map(|c| &c.data)
    }

    /// The same image set with each channel's data transformed
    pub fn map_data<E>(&self, mut f: impl FnMut(&Channel<D>) -> E) -> ImageSet<E> {
        ImageSet {
            width: self.width,
            height: self.height,
            channels: self.channels.iter()
                .map(|c| Channel {
                    format: c.format,
                    row_stride: c.row_stride,
                    image_type: c.image_type,
                    data: f(c),
                })
                .collect(),
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            q_matrix: self.q_matrix,
            min_disparity: self.min_disparity,
            max_disparity: self.max_disparity,
            subpixel_factor: self.subpixel_factor,
            exposure_time: self.exposure_time,
            last_sync_pulse: self.last_sync_pulse,
            trigger_pulse_sequence_index: self.trigger_pulse_sequence_index,
        }
    }

    /// The image set's metadata without pixel data
    pub fn metadata(&self) -> ImageSet<()> {
        self.map_data(|_| ())
    }

    /// Checks that the image set can be described by a frame header: dimensions fit the 16-bit
    ///  header fields, there are 1 to 4 channels, and every channel has a distinct defined type.
    pub fn validate_geometry(&self) -> Result<(), TransferError> {
        if self.width == 0 || self.height == 0 || self.width > u16::MAX as usize || self.height > u16::MAX as usize {
            return Err(TransferError::Misuse(format!("invalid image size {}x{}", self.width, self.height)));
        }
        if self.channels.is_empty() {
            return Err(TransferError::Misuse("an image set needs at least one channel".to_string()));
        }

        for (i, c) in self.channels.iter().enumerate() {
            if c.image_type == ImageType::Undefined {
                return Err(TransferError::Misuse(format!("channel {} has no image type", i)));
            }
            if self.channels[..i].iter().any(|other| other.image_type == c.image_type) {
                return Err(TransferError::Misuse(format!("duplicate channel of type {:?}", c.image_type)));
            }
            if c.format == ImageFormat::Mono12 && self.width % 2 != 0 {
                return Err(TransferError::Misuse(format!("12-bit images need an even width, got {}", self.width)));
            }
        }
        Ok(())
    }
}

impl <D: AsRef<[u8]>> ImageSet<D> {
    /// [ImageSet::validate_geometry], plus checking that every channel's data covers all rows
    pub fn validate(&self) -> Result<(), TransferError> {
        self.validate_geometry()?;

        for (i, c) in self.channels.iter().enumerate() {
            let row_len = self.width * c.format.bytes_per_pixel();
            if c.row_stride < row_len {
                return Err(TransferError::Misuse(format!("row stride {} of channel {} is smaller than a row of {} bytes", c.row_stride, i, row_len)));
            }
            let required = (self.height - 1) * c.row_stride + row_len;
            if c.data.as_ref().len() < required {
                return Err(TransferError::Misuse(format!("channel {} has {} bytes of pixel data, {} are required", i, c.data.as_ref().len(), required)));
            }
        }
        Ok(())
    }

    /// The pixel rows of a channel, without row padding
    pub fn rows(&self, index: usize) -> impl Iterator<Item = &[u8]> {
        let (data, row_stride, row_len, num_rows) = match self.channels.get(index) {
            Some(c) => (c.data.as_ref(), c.row_stride, self.width * c.format.bytes_per_pixel(), self.height),
            None => (&[][..], 1, 0, 0),
        };
        (0..num_rows)
            .map(move |y| data.get(y * row_stride..y * row_stride + row_len).unwrap_or(&[]))
            .take_while(move |row| row.len() == row_len)
    }
}

impl ImageSet<&[u8]> {
    /// Copies the pixel data, e.g. to keep a received image set beyond the next call into the
    ///  protocol
    pub fn to_owned_data(&self) -> ImageSet<Bytes> {
        self.map_data(|c| Bytes::copy_from_slice(c.data))
    }
}
