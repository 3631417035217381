mod buffer_layout;
mod tiling;

use std::collections::VecDeque;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};
use blockprotocol::connection::ConnectionState;
use blockprotocol::{BlockProtocolConfig, DataBlockProtocol, ProtocolType, TransferError};
use buffer_layout::{BufferLayout, PartRequest};
use crate::bit_conversions::{decode_12bit_packed, encode_12bit_packed};
use crate::external_buffer::ExternalBufferSet;
use crate::frame_header::{FrameHeader, HeaderFlags};
use crate::image_set::{Channel, ImageFormat, ImageSet, ImageType, Timestamp, MAX_SUPPORTED_IMAGES};

pub use tiling::TileWidths;

/// Result of a query for the frame currently being received
pub struct PartialImageSet<'a> {
    pub image_set: ImageSet<&'a [u8]>,
    /// rows that are complete in all channels
    pub valid_rows: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeTarget {
    /// the engine's receive buffer holds the final pixel data
    PassThrough,
    /// decoded into an internal buffer
    Internal,
    /// decoded into a part of an external buffer set
    External,
}

struct ChannelReception {
    format: ImageFormat,
    image_type: ImageType,
    target: DecodeTarget,
    last_received_bytes: usize,
    valid_rows: usize,
}

/// Receive state derived from a frame header
struct FrameReception {
    header: FrameHeader,
    /// the engine's reception generation this frame belongs to
    generation: u64,
    width: usize,
    height: usize,
    /// tile widths, a single tile for untiled transfers
    tiles: Vec<usize>,
    channels: Vec<ChannelReception>,
    external: Option<BufferLayout>,
    /// the complete frame was handed to the caller
    delivered: bool,
}

impl FrameReception {
    fn is_tiled(&self) -> bool {
        self.tiles.len() > 1
    }

    fn build_image_set<D>(&self, mut data: impl FnMut(usize, &ChannelReception) -> D) -> Result<ImageSet<D>, TransferError> {
        let header = &self.header;
        let mut image_set = ImageSet::new(self.width, self.height);
        image_set.sequence_number = header.sequence_number;
        image_set.timestamp = Timestamp { sec: header.time_sec, usec: header.time_usec };
        image_set.q_matrix = header.q_matrix;
        image_set.min_disparity = header.min_disparity;
        image_set.max_disparity = header.max_disparity;
        image_set.subpixel_factor = header.subpixel_factor;
        if header.flags.contains(HeaderFlags::HEADER_V4) {
            image_set.exposure_time = header.exposure_time;
            image_set.last_sync_pulse = Timestamp { sec: header.last_sync_pulse_sec, usec: header.last_sync_pulse_usec };
        }
        if header.flags.contains(HeaderFlags::HEADER_V6) {
            image_set.trigger_pulse_sequence_index = header.trigger_pulse_sequence_index;
        }

        for (i, c) in self.channels.iter().enumerate() {
            image_set.add_channel(Channel::new(c.format, c.image_type, self.width, data(i, c)))?;
        }
        Ok(image_set)
    }

    fn metadata(&self) -> Result<ImageSet<()>, TransferError> {
        self.build_image_set(|_, _| ())
    }
}

/// Transfers image sets over the block transfer engine: every channel is a block, and a
///  [FrameHeader] describing the image set is the transfer's user header.
///
/// Like the engine, this is a synchronous state machine driven by the socket layer. A sender
///  sets an image set and pulls messages, a receiver pushes received data and queries the
///  image set received so far.
pub struct ImageProtocol {
    engine: DataBlockProtocol,
    header_buf: BytesMut,

    frame: Option<FrameReception>,
    /// reception generation of a transfer that is not received as a frame
    ignored_generation: Option<u64>,
    /// frames dropped by this layer rather than by the engine
    rejected_frames: u64,
    decode_buffers: Vec<Vec<u8>>,

    external_buffering_active: bool,
    free_buffer_sets: VecDeque<ExternalBufferSet>,
    filled_buffer_sets: VecDeque<ExternalBufferSet>,

    warned_unknown_flags: bool,
    warned_v2_header: bool,
}

impl ImageProtocol {
    pub fn new(config: BlockProtocolConfig) -> Result<ImageProtocol, TransferError> {
        Ok(ImageProtocol {
            engine: DataBlockProtocol::new(config)?,
            header_buf: BytesMut::with_capacity(FrameHeader::SERIALIZED_LEN),
            frame: None,
            ignored_generation: None,
            rejected_frames: 0,
            decode_buffers: vec![Vec::new(); MAX_SUPPORTED_IMAGES],
            external_buffering_active: false,
            free_buffer_sets: VecDeque::new(),
            filled_buffer_sets: VecDeque::new(),
            warned_unknown_flags: false,
            warned_v2_header: false,
        })
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.engine.protocol_type()
    }

    /// The buffer size the socket layer needs for a single read
    pub fn max_reception_size(&self) -> usize {
        self.engine.max_reception_size()
    }

    // ------------------------------------------------------------------ sending

    /// Starts transferring an image set. 12-bit channels are packed, all other channels are
    ///  sent from the image set's buffers without copying (unless they have row padding).
    pub fn set_transfer_image_set(&mut self, image_set: &ImageSet<Bytes>) -> Result<(), TransferError> {
        image_set.validate()?;
        let header = FrameHeader::for_image_set(image_set, TileWidths::UNTILED)?;

        let mut wire_data = Vec::with_capacity(image_set.num_images());
        for c in image_set.channels() {
            wire_data.push(Self::wire_data(image_set.width, image_set.height, c)?);
        }

        self.start_transfer(&header, image_set)?;
        for (i, data) in wire_data.into_iter().enumerate() {
            self.engine.set_transfer_data(i, data, None)?;
        }
        debug!("transferring image set #{} with {} channels", image_set.sequence_number, image_set.num_images());
        Ok(())
    }

    fn wire_data(width: usize, height: usize, channel: &Channel<Bytes>) -> Result<Bytes, TransferError> {
        let row_len = channel.format.wire_row_len(width);
        if channel.format == ImageFormat::Mono12 {
            let mut packed = BytesMut::zeroed(row_len * height);
            encode_12bit_packed(0, height, &channel.data, &mut packed, channel.row_stride, row_len, width)?;
            return Ok(packed.freeze());
        }

        if channel.row_stride == row_len {
            Ok(channel.data.slice(..row_len * height))
        }
        else {
            let mut unpadded = BytesMut::with_capacity(row_len * height);
            for y in 0..height {
                unpadded.extend_from_slice(&channel.data[y * channel.row_stride..y * channel.row_stride + row_len]);
            }
            Ok(unpadded.freeze())
        }
    }

    fn start_transfer<D>(&mut self, header: &FrameHeader, image_set: &ImageSet<D>) -> Result<(), TransferError> {
        self.header_buf.clear();
        header.ser(&mut self.header_buf);

        self.engine.reset_transfer();
        self.engine.set_transfer_header(&self.header_buf, image_set.num_images())?;
        for (i, c) in image_set.channels().iter().enumerate() {
            self.engine.set_transfer_block_size(i, c.format.wire_size(image_set.width, image_set.height))?;
        }
        Ok(())
    }

    /// Starts transferring data that is already in wire format, one buffer per channel of
    ///  `metadata`, optionally tiled. The buffers may be filled incrementally: bind them here,
    ///  fill them through [ImageProtocol::raw_transfer_buffer_mut] and publish the progress with
    ///  [ImageProtocol::set_raw_valid_bytes] before pulling messages.
    pub fn set_raw_transfer_data<D>(&mut self, metadata: &ImageSet<D>, buffers: Vec<BytesMut>, tiles: TileWidths) -> Result<(), TransferError> {
        if buffers.len() != metadata.num_images() {
            return Err(TransferError::Misuse(format!("{} buffers for an image set with {} channels", buffers.len(), metadata.num_images())));
        }
        let header = FrameHeader::for_image_set(metadata, tiles)?;
        for (i, (c, buffer)) in metadata.channels().iter().zip(buffers.iter()).enumerate() {
            let required = c.format.wire_size(metadata.width, metadata.height);
            if buffer.len() < required {
                return Err(TransferError::Misuse(format!("raw buffer {} has {} bytes, {} are required", i, buffer.len(), required)));
            }
        }

        self.start_transfer(&header, metadata)?;
        for (i, buffer) in buffers.into_iter().enumerate() {
            self.engine.set_transfer_buffer(i, buffer, None)?;
        }
        debug!("transferring raw image set #{} with {} channels, tiles {:?}", metadata.sequence_number, metadata.num_images(), tiles);
        Ok(())
    }

    pub fn raw_transfer_buffer_mut(&mut self, channel: usize) -> Result<&mut [u8], TransferError> {
        self.engine.transfer_buffer_mut(channel)
    }

    pub fn take_raw_transfer_buffer(&mut self, channel: usize) -> Option<BytesMut> {
        self.engine.take_transfer_buffer(channel)
    }

    /// Publishes how many leading bytes of each raw buffer are filled
    pub fn set_raw_valid_bytes(&mut self, valid_bytes: &[usize]) -> Result<(), TransferError> {
        for (i, &valid) in valid_bytes.iter().enumerate() {
            self.engine.set_transfer_valid_bytes(i, valid)?;
        }
        Ok(())
    }

    pub fn next_transfer_message(&mut self) -> Result<Option<&[u8]>, TransferError> {
        self.engine.next_transfer_message()
    }

    pub fn transfer_complete(&self) -> bool {
        self.engine.transfer_complete()
    }

    pub fn reset_transfer(&mut self) {
        self.engine.reset_transfer();
    }

    // ------------------------------------------------------------------ receiving

    /// Incorporates a received datagram (UDP) or chunk of stream data (TCP).
    ///
    /// Image data returned by previous queries is superseded by this call.
    pub fn process_received_message(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.retire_finished_frame();

        let mut data = data;
        loop {
            let generation = self.engine.reception_generation();
            let result = self.engine.process_received_message(data);
            self.drop_stale_frame();
            result?;

            if self.frame.is_none() && self.engine.header_received() {
                self.start_frame()?;
            }
            if self.engine.protocol_type() == ProtocolType::Udp {
                return Ok(());
            }
            // the engine pauses after a header and after the end of a transfer; continue with
            //  the buffered stream data unless there is a frame for the caller to pick up
            let header_parsed = self.engine.reception_generation() != generation;
            let ignored_transfer_done = self.frame.is_none() && self.engine.reception_complete();
            if !header_parsed && !ignored_transfer_done {
                return Ok(());
            }
            data = &[];
        }
    }

    /// Abandons frame state if the engine reset or replaced the reception
    fn drop_stale_frame(&mut self) {
        let stale = match &self.frame {
            Some(frame) => !self.engine.header_received() || self.engine.reception_generation() != frame.generation,
            None => false,
        };
        if stale {
            debug!("reception was reset by the block protocol");
            self.abandon_frame();
        }
    }

    fn abandon_frame(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        if let Some(layout) = frame.external {
            trace!("returning external buffer set {} to the queue", layout.handle());
            let set = layout.reclaim(&mut self.engine, None);
            self.free_buffer_sets.push_front(set);
        }
    }

    /// Finishes a frame that was completely received or delivered: a filled external buffer set
    ///  becomes available, and the engine's reception is reset for the next frame.
    fn retire_finished_frame(&mut self) {
        let finished = match &self.frame {
            Some(frame) => frame.delivered || self.engine.reception_complete(),
            None => false,
        };
        if !finished {
            return;
        }

        // a frame that was never queried has not been decoded yet
        let undelivered = self.frame.as_ref().is_some_and(|f| !f.delivered);
        if undelivered {
            if let Err(e) = self.decode_progress() {
                self.reject_frame(e);
                self.engine.reset_reception(false);
                return;
            }
        }

        if let Some(mut frame) = self.frame.take() {
            if let Some(layout) = frame.external.take() {
                let metadata = frame.metadata().ok();
                let set = layout.reclaim(&mut self.engine, metadata);
                debug!("external buffer set {} is ready", set.handle());
                self.filled_buffer_sets.push_back(set);
            }
        }
        self.engine.reset_reception(false);
    }

    /// Drops the current transfer. The engine keeps receiving its remaining payload, which is
    ///  ignored, so the stream stays in sync.
    fn reject_frame(&mut self, e: TransferError) -> TransferError {
        warn!("dropping frame: {}", e);
        self.abandon_frame();
        self.ignored_generation = Some(self.engine.reception_generation());
        self.rejected_frames += 1;
        e
    }

    /// Derives the frame reception from the engine's received header. Transfers whose header is
    ///  not a frame header are ignored.
    fn start_frame(&mut self) -> Result<(), TransferError> {
        let generation = self.engine.reception_generation();
        if self.ignored_generation == Some(generation) {
            return Ok(());
        }

        let parsed = match self.engine.received_header() {
            Some(raw) => FrameHeader::deser(raw),
            None => return Ok(()),
        };
        let header = match parsed {
            Ok(Some(header)) => header,
            Ok(None) => {
                debug!("received header is not a frame header, ignoring the transfer");
                self.ignored_generation = Some(generation);
                return Ok(());
            }
            Err(e) => return Err(self.reject_frame(TransferError::WireFormat(format!("invalid frame header: {}", e)))),
        };

        let mut frame = match self.describe_frame(header, generation) {
            Ok(frame) => frame,
            Err(e) => return Err(self.reject_frame(e)),
        };

        if self.external_buffering_active {
            if let Err(e) = self.assign_external_buffers(&mut frame) {
                return Err(self.reject_frame(e));
            }
        }
        for (i, c) in frame.channels.iter().enumerate() {
            if c.target == DecodeTarget::Internal {
                self.decode_buffers[i].resize(c.format.decoded_size(frame.width, frame.height), 0);
            }
        }

        debug!("receiving image set #{}: {}x{}, {} channels", frame.header.sequence_number, frame.width, frame.height, frame.channels.len());
        self.frame = Some(frame);
        Ok(())
    }

    fn describe_frame(&mut self, header: FrameHeader, generation: u64) -> Result<FrameReception, TransferError> {
        let wire = |e: anyhow::Error| TransferError::WireFormat(e.to_string());

        if !header.flags.contains(HeaderFlags::NEW_STYLE_TRANSFER) {
            return Err(TransferError::WireFormat("legacy interleaved transfers are not supported".to_string()));
        }
        if header.unknown_flags() != 0 && !self.warned_unknown_flags {
            warn!("frame header has unknown flags {:#06x}, processing the known fields only - the sender uses a newer protocol", header.unknown_flags());
            self.warned_unknown_flags = true;
        }
        if !header.flags.contains(HeaderFlags::HEADER_V3) && !self.warned_v2_header {
            info!("frame header without explicit image types, inferring channel semantics");
            self.warned_v2_header = true;
        }

        let width = header.width as usize;
        let height = header.height as usize;
        if width == 0 || height == 0 {
            return Err(TransferError::WireFormat(format!("invalid image size {}x{}", width, height)));
        }

        let image_types = header.channel_types().map_err(wire)?;
        for (i, t) in image_types.iter().enumerate() {
            if *t != ImageType::Undefined && image_types[..i].contains(t) {
                return Err(TransferError::WireFormat(format!("duplicate channel of type {:?}", t)));
            }
        }
        if self.engine.num_reception_blocks() != image_types.len() {
            return Err(TransferError::WireFormat(format!("{} blocks for {} channels", self.engine.num_reception_blocks(), image_types.len())));
        }

        let tiles = header.tile_widths().tile_layout(width).map_err(wire)?;
        let tiled = tiles.len() > 1;

        let mut channels = Vec::with_capacity(image_types.len());
        for (i, image_type) in image_types.into_iter().enumerate() {
            let format = header.channel_format(i).map_err(wire)?;
            if format == ImageFormat::Mono12 && tiles.iter().any(|t| t % 2 != 0) {
                return Err(TransferError::WireFormat(format!("12-bit channel {} with odd tile widths {:?}", i, tiles)));
            }
            let expected = format.wire_size(width, height);
            if self.engine.reception_block_size(i) != expected {
                return Err(TransferError::WireFormat(format!("block {} has {} bytes, a {}x{} {:?} image has {}",
                    i, self.engine.reception_block_size(i), width, height, format, expected)));
            }

            let target = if format.is_pass_through() && !tiled {
                DecodeTarget::PassThrough
            }
            else {
                DecodeTarget::Internal
            };
            channels.push(ChannelReception {
                format,
                image_type,
                target,
                last_received_bytes: 0,
                valid_rows: 0,
            });
        }

        Ok(FrameReception {
            header,
            generation,
            width,
            height,
            tiles,
            channels,
            external: None,
            delivered: false,
        })
    }

    fn assign_external_buffers(&mut self, frame: &mut FrameReception) -> Result<(), TransferError> {
        let Some(set) = self.free_buffer_sets.pop_front() else {
            return Err(TransferError::ExternalBuffer("no external buffer set is available".to_string()));
        };

        let requests: Vec<PartRequest> = frame.channels.iter()
            .map(|c| PartRequest {
                image_type: c.image_type,
                size: c.format.decoded_size(frame.width, frame.height),
                direct: c.target == DecodeTarget::PassThrough,
            })
            .collect();

        match BufferLayout::new(set, &requests, frame.width, frame.height, &mut self.engine) {
            Ok(layout) => {
                for c in frame.channels.iter_mut() {
                    if c.target == DecodeTarget::Internal {
                        c.target = DecodeTarget::External;
                    }
                }
                frame.external = Some(layout);
                Ok(())
            }
            Err((set, e)) => {
                self.free_buffer_sets.push_front(set);
                Err(e)
            }
        }
    }

    /// Decodes everything that arrived since the last call
    fn decode_progress(&mut self) -> Result<(), TransferError> {
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };
        let width = frame.width;
        let height = frame.height;
        let tiled = frame.is_tiled();

        for (i, c) in frame.channels.iter_mut().enumerate() {
            let received = self.engine.reception_valid_bytes(i);
            let src = self.engine.reception_data(i);
            let dst = match c.target {
                DecodeTarget::PassThrough => None,
                DecodeTarget::Internal => Some(&mut self.decode_buffers[i][..]),
                DecodeTarget::External => frame.external.as_mut().and_then(|l| l.decode_target_mut(i)),
            };

            c.valid_rows = match dst {
                None => (received / c.format.wire_row_len(width)).min(height),
                Some(dst) if tiled => tiling::decode_tiled(&frame.tiles, c.format, width, height, c.last_received_bytes, received, src, dst)?,
                Some(dst) => {
                    let row_stride = c.format.wire_row_len(width);
                    let valid_rows = (received / row_stride).min(height);
                    let last_row = (c.last_received_bytes / row_stride).min(valid_rows);
                    decode_12bit_packed(last_row, valid_rows, src, dst, row_stride, 2 * width, width)?;
                    valid_rows
                }
            };
            c.last_received_bytes = received;
        }
        Ok(())
    }

    /// The image set received so far, with the number of rows that are complete in all
    ///  channels. Returns `None` before a frame header was received, and after the complete
    ///  frame was returned once.
    pub fn partially_received_image_set(&mut self) -> Result<Option<PartialImageSet<'_>>, TransferError> {
        match &self.frame {
            Some(frame) if !frame.delivered => {}
            _ => return Ok(None),
        }
        if let Err(e) = self.decode_progress() {
            return Err(self.reject_frame(e));
        }

        let reception_done = self.engine.reception_complete();
        let Some(frame) = self.frame.as_mut() else {
            return Ok(None);
        };
        let valid_rows = frame.channels.iter()
            .map(|c| c.valid_rows)
            .min()
            .unwrap_or(0);
        let complete = valid_rows == frame.height || reception_done;
        if complete {
            trace!("image set #{} complete", frame.header.sequence_number);
            frame.delivered = true;
        }

        let Some(frame) = self.frame.as_ref() else {
            return Ok(None);
        };
        let engine = &self.engine;
        let decode_buffers = &self.decode_buffers;
        let image_set = frame.build_image_set(|i, c| match c.target {
            DecodeTarget::PassThrough => engine.reception_data(i),
            DecodeTarget::Internal => &decode_buffers[i][..],
            DecodeTarget::External => frame.external.as_ref().map(|l| l.decode_target(i)).unwrap_or(&[]),
        })?;

        Ok(Some(PartialImageSet {
            image_set,
            valid_rows,
            complete,
        }))
    }

    /// The received image set, if it is complete
    pub fn received_image_set(&mut self) -> Result<Option<ImageSet<&[u8]>>, TransferError> {
        Ok(self.partially_received_image_set()?
            .filter(|p| p.complete)
            .map(|p| p.image_set))
    }

    /// `true` if a complete image set is waiting to be retrieved
    pub fn images_received(&self) -> bool {
        match &self.frame {
            Some(frame) => !frame.delivered && self.engine.reception_complete(),
            None => false,
        }
    }

    /// Discards the current reception. On TCP the rest of the transfer is still read from the
    ///  stream, and ignored.
    pub fn reset_reception(&mut self) {
        self.retire_finished_frame();
        self.abandon_frame();
        match self.engine.protocol_type() {
            ProtocolType::Udp => self.engine.reset_reception(false),
            ProtocolType::Tcp => {
                if self.engine.header_received() {
                    self.ignored_generation = Some(self.engine.reception_generation());
                }
            }
        }
    }

    pub fn num_dropped_frames(&self) -> u64 {
        self.engine.dropped_receptions() + self.rejected_frames
    }

    // ------------------------------------------------------------------ external buffers

    /// With external buffering, received frames are decoded into caller-provided buffer sets
    ///  (see [ImageProtocol::queue_external_buffer_set]) instead of internal buffers
    pub fn set_external_buffering_active(&mut self, active: bool) {
        self.external_buffering_active = active;
    }

    /// Queues a buffer set for receiving a future frame, and activates external buffering. A set
    ///  that still holds a frame is handed back.
    pub fn queue_external_buffer_set(&mut self, set: ExternalBufferSet) -> Result<(), (TransferError, ExternalBufferSet)> {
        if set.is_ready() {
            let e = TransferError::Misuse(format!("external buffer set {} holds a frame and must be released first", set.handle()));
            return Err((e, set));
        }
        trace!("queueing external buffer set {}", set.handle());
        self.free_buffer_sets.push_back(set);
        self.external_buffering_active = true;
        Ok(())
    }

    /// The next buffer set holding a completely received frame
    pub fn take_external_buffer_set(&mut self) -> Option<ExternalBufferSet> {
        self.retire_finished_frame();
        self.filled_buffer_sets.pop_front()
    }

    pub fn num_queued_external_buffer_sets(&self) -> usize {
        self.free_buffer_sets.len()
    }

    // ------------------------------------------------------------------ connection

    pub fn next_control_message(&mut self) -> Option<&[u8]> {
        self.engine.next_control_message()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.connection_state()
    }

    pub fn new_client_connected(&mut self) -> bool {
        self.engine.new_client_connected()
    }

    pub fn status_report(&self) -> String {
        self.engine.status_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tcp_pair() -> (ImageProtocol, ImageProtocol) {
        (ImageProtocol::new(BlockProtocolConfig::default_tcp(true)).unwrap(),
         ImageProtocol::new(BlockProtocolConfig::default_tcp(false)).unwrap())
    }

    fn stream(sender: &mut ImageProtocol) -> Vec<u8> {
        let mut result = Vec::new();
        while let Some(msg) = sender.next_transfer_message().unwrap() {
            result.extend_from_slice(msg);
        }
        assert!(sender.transfer_complete());
        result
    }

    fn left_and_disparity(width: usize, height: usize) -> ImageSet {
        let left: Vec<u8> = (0..width * height).map(|i| i as u8).collect();
        let disparity: Vec<u8> = (0..width * height)
            .flat_map(|i| ((i * 37) as u16 & 0x0FFF).to_le_bytes())
            .collect();

        let mut image_set = ImageSet::new(width, height);
        image_set.sequence_number = 42;
        image_set.exposure_time = 1234;
        image_set.add_channel(Channel::new(ImageFormat::Mono8, ImageType::Left, width, Bytes::from(left))).unwrap();
        image_set.add_channel(Channel::new(ImageFormat::Mono12, ImageType::Disparity, width, Bytes::from(disparity))).unwrap();
        image_set
    }

    #[test]
    fn test_tcp_transfer() {
        let (mut sender, mut receiver) = tcp_pair();
        let image_set = left_and_disparity(32, 4);
        sender.set_transfer_image_set(&image_set).unwrap();
        let data = stream(&mut sender);
        // header preamble, frame header, fragment headers, 32x4 8-bit and 32x4 12-bit
        assert_eq!(data.len(), 38 + 129 + 2 * 8 + 128 + 192);

        assert!(receiver.partially_received_image_set().unwrap().is_none());
        receiver.process_received_message(&data).unwrap();
        assert!(receiver.images_received());

        let received = receiver.received_image_set().unwrap().unwrap();
        assert_eq!(received.sequence_number, 42);
        assert_eq!(received.exposure_time, 1234);
        assert_eq!(received.index_of(ImageType::Disparity), Some(1));
        assert_eq!(*received.pixel_data(0).unwrap(), &image_set.pixel_data(0).unwrap()[..]);
        assert_eq!(*received.pixel_data(1).unwrap(), &image_set.pixel_data(1).unwrap()[..]);
        assert_eq!(received.channel(1).unwrap().row_stride, 64);

        assert!(receiver.received_image_set().unwrap().is_none());
        assert!(!receiver.images_received());
    }

    #[test]
    fn test_partial_reception() {
        let (mut sender, mut receiver) = tcp_pair();
        let image_set = left_and_disparity(32, 4);
        let mut metadata = ImageSet::<()>::new(32, 4);
        metadata.add_channel(Channel::new(ImageFormat::Mono12, ImageType::Disparity, 32, ())).unwrap();

        let mut packed = BytesMut::zeroed(192);
        encode_12bit_packed(0, 4, image_set.pixel_data(1).unwrap(), &mut packed, 64, 48, 32).unwrap();
        sender.set_raw_transfer_data(&metadata, vec![BytesMut::zeroed(192)], TileWidths::UNTILED).unwrap();
        sender.raw_transfer_buffer_mut(0).unwrap().copy_from_slice(&packed);

        // two rows and a bit
        sender.set_raw_valid_bytes(&[2 * 48 + 10]).unwrap();
        while let Some(msg) = sender.next_transfer_message().unwrap() {
            receiver.process_received_message(msg).unwrap();
        }
        let partial = receiver.partially_received_image_set().unwrap().unwrap();
        assert_eq!(partial.valid_rows, 2);
        assert!(!partial.complete);
        assert_eq!(partial.image_set.pixel_data(0).unwrap()[..64], image_set.pixel_data(1).unwrap()[..64]);

        sender.set_raw_valid_bytes(&[192]).unwrap();
        while let Some(msg) = sender.next_transfer_message().unwrap() {
            receiver.process_received_message(msg).unwrap();
        }
        let partial = receiver.partially_received_image_set().unwrap().unwrap();
        assert_eq!(partial.valid_rows, 4);
        assert!(partial.complete);
        assert_eq!(*partial.image_set.pixel_data(0).unwrap(), &image_set.pixel_data(1).unwrap()[..]);
    }

    #[test]
    fn test_padded_rows() {
        let (mut sender, mut receiver) = tcp_pair();
        let mut image_set = ImageSet::new(2, 2);
        image_set.add_channel(Channel { format: ImageFormat::Mono8, row_stride: 3, image_type: ImageType::Right, data: Bytes::from_static(&[1, 2, 0, 3, 4]) }).unwrap();
        sender.set_transfer_image_set(&image_set).unwrap();
        receiver.process_received_message(&stream(&mut sender)).unwrap();

        let received = receiver.received_image_set().unwrap().unwrap();
        assert_eq!(*received.pixel_data(0).unwrap(), &[1u8, 2, 3, 4][..]);
        assert_eq!(received.index_of(ImageType::Right), Some(0));
    }

    #[rstest]
    #[case::no_channels(ImageSet::new(4, 4))]
    #[case::short_data({
        let mut s = ImageSet::new(4, 4);
        s.add_channel(Channel::new(ImageFormat::Mono8, ImageType::Left, 4, Bytes::from_static(&[0; 15]))).unwrap();
        s
    })]
    #[case::undefined_type({
        let mut s = ImageSet::new(4, 4);
        s.add_channel(Channel::new(ImageFormat::Mono8, ImageType::Undefined, 4, Bytes::from_static(&[0; 16]))).unwrap();
        s
    })]
    fn test_set_transfer_image_set_misuse(#[case] image_set: ImageSet) {
        let (mut sender, _) = tcp_pair();
        assert!(matches!(sender.set_transfer_image_set(&image_set), Err(TransferError::Misuse(_))));
    }

    #[test]
    fn test_raw_transfer_buffer_count() {
        let (mut sender, _) = tcp_pair();
        let metadata = left_and_disparity(32, 4).metadata();
        let result = sender.set_raw_transfer_data(&metadata, vec![BytesMut::zeroed(128)], TileWidths::UNTILED);
        assert!(matches!(result, Err(TransferError::Misuse(_))));
    }

    fn modified_header_stream(modify: impl FnOnce(&mut FrameHeader)) -> Vec<u8> {
        let (mut sender, _) = tcp_pair();
        let image_set = left_and_disparity(32, 4);
        let mut header = FrameHeader::for_image_set(&image_set, TileWidths::UNTILED).unwrap();
        modify(&mut header);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        sender.engine.set_transfer_header(&buf, 2).unwrap();
        sender.engine.set_transfer_block_size(0, 128).unwrap();
        sender.engine.set_transfer_block_size(1, 192).unwrap();
        sender.engine.set_transfer_data(0, Bytes::from(vec![0u8; 128]), None).unwrap();
        sender.engine.set_transfer_data(1, Bytes::from(vec![0u8; 192]), None).unwrap();
        stream(&mut sender)
    }

    #[rstest]
    #[case::legacy_interleaved(|h: &mut FrameHeader| h.flags = HeaderFlags::empty())]
    #[case::version_mismatch(|h: &mut FrameHeader| h.protocol_version = 5)]
    #[case::invalid_format(|h: &mut FrameHeader| h.formats[1] = 9)]
    #[case::format_size_mismatch(|h: &mut FrameHeader| h.formats[1] = 0)]
    #[case::too_many_images(|h: &mut FrameHeader| h.number_of_images = 3)]
    fn test_rejected_headers(#[case] modify: fn(&mut FrameHeader)) {
        let (_, mut receiver) = tcp_pair();
        let data = modified_header_stream(modify);

        let result = receiver.process_received_message(&data);
        assert!(matches!(result, Err(TransferError::WireFormat(_))));
        assert_eq!(receiver.num_dropped_frames(), 1);
        assert!(receiver.partially_received_image_set().unwrap().is_none());
    }

    #[test]
    fn test_unknown_flags_are_tolerated() {
        let (_, mut receiver) = tcp_pair();
        let data = modified_header_stream(|h| h.flags = HeaderFlags::from_bits_retain(0x8000) | HeaderFlags::all());

        receiver.process_received_message(&data).unwrap();
        assert!(receiver.received_image_set().unwrap().is_some());
        assert!(receiver.warned_unknown_flags);
    }

    #[test]
    fn test_v2_header_infers_channels() {
        let (_, mut receiver) = tcp_pair();
        let data = modified_header_stream(|h| {
            h.flags = HeaderFlags::NEW_STYLE_TRANSFER;
            h.exposure_time = 99;
        });

        receiver.process_received_message(&data).unwrap();
        let received = receiver.received_image_set().unwrap().unwrap();
        assert_eq!(received.index_of(ImageType::Left), Some(0));
        assert_eq!(received.index_of(ImageType::Disparity), Some(1));
        // exposure time requires the V4 flag
        assert_eq!(received.exposure_time, 0);
        assert!(receiver.warned_v2_header);
    }

    #[test]
    fn test_not_a_frame_header() {
        let (_, mut receiver) = tcp_pair();
        let data = modified_header_stream(|h| h.width = 32);
        let mut data = data;
        // corrupt the magic
        data[38] = 0;

        receiver.process_received_message(&data).unwrap();
        assert!(receiver.partially_received_image_set().unwrap().is_none());
        assert_eq!(receiver.num_dropped_frames(), 0);
    }

    #[test]
    fn test_reset_reception() {
        let (mut sender, mut receiver) = tcp_pair();
        sender.set_transfer_image_set(&left_and_disparity(32, 4)).unwrap();
        let data = stream(&mut sender);

        receiver.process_received_message(&data[..200]).unwrap();
        assert!(receiver.partially_received_image_set().unwrap().is_some());
        receiver.reset_reception();
        assert!(receiver.partially_received_image_set().unwrap().is_none());
    }
}
