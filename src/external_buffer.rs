use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use bytes::BytesMut;
use crate::image_set::{ImageSet, ImageType};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// One channel's place in an [ExternalBuffer]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPart {
    pub image_type: ImageType,
    /// Bits per pixel to reserve if a frame has no channel of this type. Without a reservation
    ///  an absent channel takes no space, and the following parts move up.
    pub reserve_bits: Option<u8>,
}

impl BufferPart {
    pub fn new(image_type: ImageType) -> BufferPart {
        BufferPart { image_type, reserve_bits: None }
    }

    pub fn reserved(image_type: ImageType, reserve_bits: u8) -> BufferPart {
        BufferPart { image_type, reserve_bits: Some(reserve_bits) }
    }
}

/// Caller-provided memory that received channels are decoded into, one part after the other.
///  Each part takes the decoded size of its channel in the current frame.
#[derive(Debug)]
pub struct ExternalBuffer {
    data: BytesMut,
    parts: Vec<BufferPart>,
    /// where each part was placed for the last frame received into this buffer
    part_ranges: Vec<Range<usize>>,
}

impl ExternalBuffer {
    pub fn new(data: BytesMut, parts: Vec<BufferPart>) -> ExternalBuffer {
        ExternalBuffer {
            data,
            parts,
            part_ranges: Vec::new(),
        }
    }

    pub fn zeroed(len: usize, parts: Vec<BufferPart>) -> ExternalBuffer {
        ExternalBuffer::new(BytesMut::zeroed(len), parts)
    }

    pub fn parts(&self) -> &[BufferPart] {
        &self.parts
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The data of a part as placed for the last received frame
    pub fn part_data(&self, index: usize) -> Option<&[u8]> {
        self.part_ranges.get(index)
            .and_then(|r| self.data.get(r.clone()))
    }

    pub fn part_data_of_type(&self, image_type: ImageType) -> Option<&[u8]> {
        self.parts.iter()
            .position(|p| p.image_type == image_type)
            .and_then(|i| self.part_data(i))
    }

    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    pub(crate) fn take_data(&mut self) -> BytesMut {
        self.part_ranges.clear();
        std::mem::take(&mut self.data)
    }

    pub(crate) fn restore_data(&mut self, data: BytesMut, part_ranges: Vec<Range<usize>>) {
        self.data = data;
        self.part_ranges = part_ranges;
    }
}

/// A group of [ExternalBuffer]s that receives one frame. The handle identifies the set across
///  queueing and retrieval.
///
/// A set is *ready* after a frame was received into it. It must be released before it can be
///  queued for reception again.
#[derive(Debug)]
pub struct ExternalBufferSet {
    handle: u64,
    buffers: Vec<ExternalBuffer>,
    ready: bool,
    frame: Option<ImageSet<()>>,
}

impl ExternalBufferSet {
    pub fn new(buffers: Vec<ExternalBuffer>) -> ExternalBufferSet {
        ExternalBufferSet {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            buffers,
            ready: false,
            frame: None,
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn buffers(&self) -> &[ExternalBuffer] {
        &self.buffers
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Metadata of the received frame while the set is ready
    pub fn frame(&self) -> Option<&ImageSet<()>> {
        self.frame.as_ref()
    }

    /// The received data of a channel type, searching all buffers
    pub fn part_data_of_type(&self, image_type: ImageType) -> Option<&[u8]> {
        self.buffers.iter()
            .find_map(|b| b.part_data_of_type(image_type))
    }

    /// Marks the data as consumed so the set can be queued again
    pub fn release(&mut self) {
        self.ready = false;
        self.frame = None;
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut [ExternalBuffer] {
        &mut self.buffers
    }

    pub(crate) fn mark_ready(&mut self, frame: ImageSet<()>) {
        self.ready = true;
        self.frame = Some(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_distinct() {
        let a = ExternalBufferSet::new(vec![]);
        let b = ExternalBufferSet::new(vec![]);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_part_data() {
        let mut buffer = ExternalBuffer::zeroed(8, vec![BufferPart::new(ImageType::Left), BufferPart::reserved(ImageType::Right, 8)]);
        assert_eq!(buffer.part_data(0), None);

        let mut data = buffer.take_data();
        data.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buffer.restore_data(data, vec![0..3, 3..6]);
        assert_eq!(buffer.part_data(1), Some(&[4, 5, 6][..]));
        assert_eq!(buffer.part_data_of_type(ImageType::Left), Some(&[1, 2, 3][..]));
        assert_eq!(buffer.part_data_of_type(ImageType::Color), None);
    }

    #[test]
    fn test_ready_and_release() {
        let mut set = ExternalBufferSet::new(vec![ExternalBuffer::zeroed(4, vec![BufferPart::new(ImageType::Disparity)])]);
        assert!(!set.is_ready());
        set.mark_ready(ImageSet::new(2, 2));
        assert!(set.is_ready());
        assert_eq!(set.frame().unwrap().width, 2);

        set.release();
        assert!(!set.is_ready());
        assert!(set.frame().is_none());
    }
}
