use std::ops::Range;
use bytes::BytesMut;
use tracing::{debug, trace};
use blockprotocol::{DataBlockProtocol, TransferError};
use crate::external_buffer::ExternalBufferSet;
use crate::image_set::{ImageSet, ImageType};

/// What the current frame needs from the external buffers for one channel
pub(super) struct PartRequest {
    pub image_type: ImageType,
    /// decoded size of the channel
    pub size: usize,
    /// the engine receives the channel directly into its part, no decoding required
    pub direct: bool,
}

enum Region {
    /// not used by the current frame
    Idle(BytesMut),
    /// receive buffer of a block in the engine
    Lent { block: usize, len: usize },
    /// target for decoding a channel
    Decode(BytesMut),
}

/// An [ExternalBufferSet] split into per-channel regions for one frame. The regions are split
///  off the caller's buffers without copying and reunited when the frame is done.
pub(super) struct BufferLayout {
    set: ExternalBufferSet,
    /// per buffer: one region per part, plus the unused tail
    regions: Vec<Vec<Region>>,
    part_ranges: Vec<Vec<Range<usize>>>,
    /// per channel: buffer and part index
    targets: Vec<(usize, usize)>,
}

impl BufferLayout {
    /// Places every channel in the first unassigned part of its image type and lends the parts
    ///  of directly received channels to the engine. On failure, the set is returned unchanged.
    pub fn new(set: ExternalBufferSet, requests: &[PartRequest], width: usize, height: usize,
               engine: &mut DataBlockProtocol) -> Result<BufferLayout, (ExternalBufferSet, TransferError)> {
        if set.num_buffers() == 0 {
            return Err((set, TransferError::ExternalBuffer("external buffer set is empty".to_string())));
        }

        let mut targets: Vec<Option<(usize, usize)>> = vec![None; requests.len()];
        let mut part_sizes = Vec::new();
        for (b, buffer) in set.buffers().iter().enumerate() {
            let mut sizes = Vec::new();
            for (p, part) in buffer.parts().iter().enumerate() {
                let channel = (0..requests.len())
                    .find(|&c| targets[c].is_none() && requests[c].image_type == part.image_type);
                let size = match channel {
                    Some(c) => {
                        targets[c] = Some((b, p));
                        requests[c].size
                    }
                    None => part.reserve_bits
                        .map(|bits| width * height * bits as usize / 8)
                        .unwrap_or(0),
                };
                sizes.push(size);
            }

            let required: usize = sizes.iter().sum();
            if required > buffer.data().len() {
                let msg = format!("external buffer {} of set {} has {} bytes, the frame requires {}", b, set.handle(), buffer.data().len(), required);
                return Err((set, TransferError::ExternalBuffer(msg)));
            }
            part_sizes.push(sizes);
        }

        if let Some(c) = targets.iter().position(|t| t.is_none()) {
            let msg = format!("external buffers were not set up to handle image type {}", u8::from(requests[c].image_type));
            return Err((set, TransferError::ExternalBuffer(msg)));
        }

        let mut layout = BufferLayout {
            set,
            regions: Vec::new(),
            part_ranges: Vec::new(),
            targets: targets.into_iter().flatten().collect(),
        };
        for (b, sizes) in part_sizes.iter().enumerate() {
            let mut data = layout.set.buffers_mut()[b].take_data();
            let mut regions = Vec::new();
            let mut ranges = Vec::new();
            let mut offset = 0;
            for &size in sizes {
                regions.push(Region::Idle(data.split_to(size)));
                ranges.push(offset..offset + size);
                offset += size;
            }
            regions.push(Region::Idle(data));
            layout.regions.push(regions);
            layout.part_ranges.push(ranges);
        }

        for (c, request) in requests.iter().enumerate() {
            let (b, p) = layout.targets[c];
            let data = match std::mem::replace(&mut layout.regions[b][p], Region::Idle(BytesMut::new())) {
                Region::Idle(data) | Region::Decode(data) => data,
                Region::Lent { .. } => BytesMut::new(),
            };

            if request.direct {
                let len = data.len();
                let bound = engine.set_reception_buffer(c, data);
                // the engine owns a buffer for the block either way, it is taken back on reclaim
                layout.regions[b][p] = Region::Lent { block: c, len };
                if let Err(e) = bound {
                    let set = layout.reclaim(engine, None);
                    return Err((set, e));
                }
                trace!("channel {} is received into buffer {} part {}", c, b, p);
            }
            else {
                layout.regions[b][p] = Region::Decode(data);
                trace!("channel {} is decoded into buffer {} part {}", c, b, p);
            }
        }

        debug!("external buffer set {} holds the current frame", layout.set.handle());
        Ok(layout)
    }

    pub fn handle(&self) -> u64 {
        self.set.handle()
    }

    fn decode_region(&self, channel: usize) -> Option<&BytesMut> {
        let (b, p) = *self.targets.get(channel)?;
        match &self.regions[b][p] {
            Region::Decode(data) => Some(data),
            _ => None,
        }
    }

    pub fn decode_target(&self, channel: usize) -> &[u8] {
        self.decode_region(channel)
            .map(|d| &d[..])
            .unwrap_or(&[])
    }

    pub fn decode_target_mut(&mut self, channel: usize) -> Option<&mut [u8]> {
        let (b, p) = *self.targets.get(channel)?;
        match &mut self.regions[b][p] {
            Region::Decode(data) => Some(&mut data[..]),
            _ => None,
        }
    }

    /// Reunites the regions with their buffers. With a frame, the set is marked ready.
    pub fn reclaim(self, engine: &mut DataBlockProtocol, frame: Option<ImageSet<()>>) -> ExternalBufferSet {
        let BufferLayout { mut set, regions, part_ranges, .. } = self;

        for ((buffer, regions), ranges) in set.buffers_mut().iter_mut().zip(regions).zip(part_ranges) {
            let mut whole = BytesMut::new();
            for region in regions {
                let data = match region {
                    Region::Idle(data) | Region::Decode(data) => data,
                    Region::Lent { block, len } => {
                        let mut data = engine.take_reception_buffer(block);
                        data.resize(len, 0);
                        data
                    }
                };
                whole.unsplit(data);
            }
            buffer.restore_data(whole, ranges);
        }

        if let Some(frame) = frame {
            set.mark_ready(frame);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockprotocol::header_preamble::HeaderPreamble;
    use blockprotocol::BlockProtocolConfig;
    use crate::external_buffer::{BufferPart, ExternalBuffer};

    /// a TCP engine that has received the header for the given block sizes
    fn engine_with_header(block_sizes: &[usize]) -> DataBlockProtocol {
        let mut engine = DataBlockProtocol::new(BlockProtocolConfig::default_tcp(false)).unwrap();
        let mut header = BytesMut::new();
        HeaderPreamble { user_header_len: 0, block_sizes: block_sizes.to_vec() }.ser(&mut header);
        engine.process_received_message(&header).unwrap();
        assert!(engine.header_received());
        engine
    }

    fn request(image_type: ImageType, size: usize, direct: bool) -> PartRequest {
        PartRequest { image_type, size, direct }
    }

    #[test]
    fn test_layout_and_reclaim() {
        let mut engine = engine_with_header(&[6, 12]);
        let set = ExternalBufferSet::new(vec![
            ExternalBuffer::zeroed(32, vec![BufferPart::reserved(ImageType::Right, 8), BufferPart::new(ImageType::Left), BufferPart::new(ImageType::Disparity)]),
        ]);
        let requests = [request(ImageType::Left, 6, true), request(ImageType::Disparity, 12, false)];

        let mut layout = BufferLayout::new(set, &requests, 3, 2, &mut engine).ok().unwrap();
        assert_eq!(layout.decode_target(0), &[] as &[u8]);
        assert_eq!(layout.decode_target(1).len(), 12);
        layout.decode_target_mut(1).unwrap().fill(7);

        let mut fragment = BytesMut::new();
        fragment.extend_from_slice(&[0, 0, 0, 6, 0, 0, 0, 0]);
        fragment.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        engine.process_received_message(&fragment).unwrap();

        let set = layout.reclaim(&mut engine, Some(ImageSet::new(3, 2)));
        assert!(set.is_ready());
        let buffer = &set.buffers()[0];
        assert_eq!(buffer.data().len(), 32);
        // the reserved right image takes 6 bytes even though it is absent
        assert_eq!(buffer.part_data(0), Some(&[0u8; 6][..]));
        assert_eq!(buffer.part_data_of_type(ImageType::Left), Some(&[1, 2, 3, 4, 5, 6][..]));
        assert_eq!(set.part_data_of_type(ImageType::Disparity), Some(&[7u8; 12][..]));
    }

    #[test]
    fn test_absent_part_without_reservation_takes_no_space() {
        let mut engine = engine_with_header(&[4]);
        let set = ExternalBufferSet::new(vec![
            ExternalBuffer::zeroed(4, vec![BufferPart::new(ImageType::Color), BufferPart::new(ImageType::Left)]),
        ]);
        let layout = BufferLayout::new(set, &[request(ImageType::Left, 4, false)], 2, 2, &mut engine).ok().unwrap();
        let set = layout.reclaim(&mut engine, None);
        assert!(!set.is_ready());
        assert_eq!(set.buffers()[0].part_data(0), Some(&[][..]));
        assert_eq!(set.buffers()[0].part_data(1).map(|d| d.len()), Some(4));
    }

    #[test]
    fn test_second_buffer() {
        let mut engine = engine_with_header(&[4, 4]);
        let set = ExternalBufferSet::new(vec![
            ExternalBuffer::zeroed(4, vec![BufferPart::new(ImageType::Left)]),
            ExternalBuffer::zeroed(4, vec![BufferPart::new(ImageType::Right)]),
        ]);
        let requests = [request(ImageType::Right, 4, true), request(ImageType::Left, 4, true)];
        let layout = BufferLayout::new(set, &requests, 2, 2, &mut engine).ok().unwrap();
        assert_eq!(layout.targets, vec![(1, 0), (0, 0)]);
    }

    #[test]
    fn test_missing_image_type() {
        let mut engine = engine_with_header(&[4]);
        let set = ExternalBufferSet::new(vec![ExternalBuffer::zeroed(16, vec![BufferPart::new(ImageType::Left)])]);
        let handle = set.handle();

        let Err((set, e)) = BufferLayout::new(set, &[request(ImageType::Disparity, 4, false)], 2, 2, &mut engine) else {
            panic!("layout without a disparity part");
        };
        assert_eq!(set.handle(), handle);
        assert_eq!(e.to_string(), "external buffer error: external buffers were not set up to handle image type 2");
    }

    #[test]
    fn test_buffer_too_small() {
        let mut engine = engine_with_header(&[4]);
        let set = ExternalBufferSet::new(vec![ExternalBuffer::zeroed(3, vec![BufferPart::new(ImageType::Left)])]);
        let result = BufferLayout::new(set, &[request(ImageType::Left, 4, true)], 2, 2, &mut engine);
        assert!(matches!(result, Err((_, TransferError::ExternalBuffer(_)))));
    }

    #[test]
    fn test_empty_set() {
        let mut engine = engine_with_header(&[4]);
        let result = BufferLayout::new(ExternalBufferSet::new(vec![]), &[request(ImageType::Left, 4, true)], 2, 2, &mut engine);
        assert!(matches!(result, Err((_, TransferError::ExternalBuffer(_)))));
    }
}
