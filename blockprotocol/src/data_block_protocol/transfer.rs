use std::collections::VecDeque;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::config::ProtocolType;
use crate::error::TransferError;
use crate::header_preamble::HeaderPreamble;
use crate::segment::{check_block_size, MissingSegment, SegmentDescriptor};
use crate::MAX_DATA_BLOCKS;

/// The source of a block's bytes on the send side
enum TransferData {
    Unbound,
    /// immutable data, typically shared with the producer's image buffers
    Shared(Bytes),
    /// a buffer owned by the engine that the producer fills in place
    Exclusive(BytesMut),
}
impl TransferData {
    fn as_slice(&self) -> &[u8] {
        match self {
            TransferData::Unbound => &[],
            TransferData::Shared(data) => data,
            TransferData::Exclusive(data) => data,
        }
    }
}

struct TransferBlock {
    data: TransferData,
    size: usize,
    /// send cursor for new data
    offset: usize,
    valid_bytes: usize,
}
impl TransferBlock {
    fn new() -> TransferBlock {
        TransferBlock {
            data: TransferData::Unbound,
            size: 0,
            offset: 0,
            valid_bytes: 0,
        }
    }

    fn unsent_valid_bytes(&self) -> usize {
        self.valid_bytes.min(self.size).saturating_sub(self.offset)
    }
}

/// The send side of a transfer: header, blocks with their send cursors, and the queue of
///  segments the receiver asked to have retransmitted
pub(super) struct TransferState {
    protocol_type: ProtocolType,
    max_payload_size: usize,
    /// Segments shorter than this are only sent if they complete a fully valid block. This
    ///  prevents incremental fills from producing runt datagrams.
    min_payload_size: usize,

    user_header: Vec<u8>,
    header_pending: bool,
    blocks: Vec<TransferBlock>,
    retransmissions: VecDeque<MissingSegment>,
    eof_pending: bool,
    last_transmitted_block: usize,
}

impl TransferState {
    pub fn new(protocol_type: ProtocolType, max_payload_size: usize) -> TransferState {
        let min_payload_size = match protocol_type {
            ProtocolType::Udp => max_payload_size,
            ProtocolType::Tcp => 0,
        };

        TransferState {
            protocol_type,
            max_payload_size,
            min_payload_size,
            user_header: Vec::new(),
            header_pending: false,
            blocks: Vec::new(),
            retransmissions: VecDeque::new(),
            eof_pending: false,
            last_transmitted_block: 0,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.offset >= b.size)
            && !self.eof_pending
            && !self.header_pending
            && self.retransmissions.is_empty()
    }

    pub fn is_active(&self) -> bool {
        !self.blocks.is_empty() && !self.is_complete()
    }

    pub fn reset(&mut self) {
        self.user_header.clear();
        self.header_pending = false;
        self.blocks.clear();
        self.retransmissions.clear();
        self.eof_pending = false;
        self.last_transmitted_block = 0;
    }

    pub fn set_header(&mut self, user_header: &[u8], num_blocks: usize, control_message_capacity: usize) -> Result<(), TransferError> {
        if num_blocks == 0 || num_blocks > MAX_DATA_BLOCKS {
            return Err(TransferError::Misuse(format!("a transfer must have 1 to {} blocks, requested {}", MAX_DATA_BLOCKS, num_blocks)));
        }
        if user_header.len() + HeaderPreamble::SERIALIZED_LEN + 9 > control_message_capacity {
            return Err(TransferError::Misuse(format!("transfer header of {} bytes is too large", user_header.len())));
        }

        if self.is_active() {
            debug!("new transfer header while the previous transfer is unfinished - dropping the previous transfer");
        }
        self.reset();

        self.user_header.extend_from_slice(user_header);
        self.header_pending = true;
        self.blocks = (0..num_blocks).map(|_| TransferBlock::new()).collect();
        Ok(())
    }

    fn block_mut(&mut self, block: usize) -> Result<&mut TransferBlock, TransferError> {
        let num_blocks = self.blocks.len();
        self.blocks.get_mut(block)
            .ok_or_else(|| TransferError::Misuse(format!("block index {} out of range for a transfer of {} blocks", block, num_blocks)))
    }

    pub fn set_block_size(&mut self, block: usize, size: usize) -> Result<(), TransferError> {
        if !self.header_pending {
            return Err(TransferError::Misuse("block sizes must be declared after setting the header and before it is sent".to_string()));
        }
        if size == 0 {
            return Err(TransferError::Misuse(format!("block {} must not be empty", block)));
        }
        check_block_size(size)?;

        let b = self.block_mut(block)?;
        b.size = size;
        b.valid_bytes = b.valid_bytes.min(size);
        Ok(())
    }

    fn check_data_len(size: usize, data_len: usize, block: usize) -> Result<(), TransferError> {
        if size == 0 {
            return Err(TransferError::Misuse(format!("size of block {} must be declared before binding data", block)));
        }
        if data_len < size {
            return Err(TransferError::Misuse(format!("buffer of {} bytes for block {} is smaller than its declared size {}", data_len, block, size)));
        }
        Ok(())
    }

    pub fn set_shared_data(&mut self, block: usize, data: Bytes, valid_bytes: Option<usize>) -> Result<(), TransferError> {
        let b = self.block_mut(block)?;
        Self::check_data_len(b.size, data.len(), block)?;
        b.valid_bytes = valid_bytes.unwrap_or(b.size).min(b.size);
        b.offset = 0;
        b.data = TransferData::Shared(data);
        Ok(())
    }

    pub fn set_exclusive_buffer(&mut self, block: usize, data: BytesMut, valid_bytes: Option<usize>) -> Result<(), TransferError> {
        let b = self.block_mut(block)?;
        Self::check_data_len(b.size, data.len(), block)?;
        b.valid_bytes = valid_bytes.unwrap_or(b.size).min(b.size);
        b.offset = 0;
        b.data = TransferData::Exclusive(data);
        Ok(())
    }

    pub fn buffer_mut(&mut self, block: usize) -> Result<&mut [u8], TransferError> {
        let b = self.block_mut(block)?;
        let size = b.size;
        match &mut b.data {
            TransferData::Exclusive(data) => Ok(&mut data[..size]),
            _ => Err(TransferError::Misuse(format!("block {} has no exclusive transfer buffer", block))),
        }
    }

    pub fn take_buffer(&mut self, block: usize) -> Option<BytesMut> {
        let b = self.blocks.get_mut(block)?;
        match std::mem::replace(&mut b.data, TransferData::Unbound) {
            TransferData::Exclusive(data) => {
                b.valid_bytes = 0;
                Some(data)
            }
            other => {
                b.data = other;
                None
            }
        }
    }

    /// Values of at least the declared size mean 'complete', values below 4 mean 'nothing yet'
    pub fn set_valid_bytes(&mut self, block: usize, valid_bytes: usize) -> Result<(), TransferError> {
        let b = self.block_mut(block)?;
        b.valid_bytes = if valid_bytes >= b.size {
            b.size
        }
        else if valid_bytes < size_of::<u32>() {
            0
        }
        else {
            valid_bytes
        };
        Ok(())
    }

    pub fn header_pending(&self) -> bool {
        self.header_pending
    }

    /// All block sizes must be declared before the header can go on the wire
    pub fn header_ready(&self) -> bool {
        self.header_pending && self.blocks.iter().all(|b| b.size > 0)
    }

    /// Serializes preamble plus user header and marks the header as sent
    pub fn take_header(&mut self, buf: &mut BytesMut) {
        let preamble = HeaderPreamble {
            user_header_len: self.user_header.len(),
            block_sizes: self.blocks.iter().map(|b| b.size).collect(),
        };
        preamble.ser(buf);
        buf.extend_from_slice(&self.user_header);
        self.header_pending = false;
    }

    pub fn take_eof(&mut self) -> Option<SegmentDescriptor> {
        if !self.eof_pending {
            return None;
        }
        self.eof_pending = false;
        let block = self.last_transmitted_block;
        Some(SegmentDescriptor::new(block, self.blocks.get(block).map(|b| b.size).unwrap_or(0)))
    }

    /// Replaces all pending retransmissions. Ranges outside the currently valid bytes of a block
    ///  are ignored.
    pub fn on_resend_request(&mut self, segments: Vec<MissingSegment>) {
        self.retransmissions.clear();
        for segment in segments {
            let valid = self.blocks.get(segment.start.block)
                .map(|b| segment.len > 0 && segment.end_offset() <= b.valid_bytes)
                .unwrap_or(false);
            if valid {
                self.retransmissions.push_back(segment);
            }
            else {
                debug!("ignoring resend request for {:?}", segment);
            }
        }
        debug!("received resend request for {} segments", self.retransmissions.len());
    }

    /// Chooses the next segment to send: retransmissions first, then new data from the block with
    ///  the most unsent valid bytes. Advances the send cursors.
    pub fn next_segment(&mut self) -> Option<(SegmentDescriptor, usize)> {
        if let Some(front) = self.retransmissions.front_mut() {
            let start = front.start;
            let len = front.len.min(self.max_payload_size);
            trace!("retransmitting {:?}+{}", start, len);
            if front.consume_front(len) {
                self.retransmissions.pop_front();
            }
            return Some((start, len));
        }

        let (block, amount) = self.blocks.iter()
            .enumerate()
            .map(|(i, b)| (i, b.unsent_valid_bytes()))
            .fold((0, 0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        let len = amount.min(self.max_payload_size);
        if len == 0 {
            return None;
        }
        let b = &self.blocks[block];
        if len < self.min_payload_size && b.valid_bytes != b.size {
            return None;
        }

        let start = SegmentDescriptor::new(block, b.offset);
        self.blocks[block].offset += len;
        self.last_transmitted_block = block;

        if self.protocol_type == ProtocolType::Udp && self.blocks.iter().all(|b| b.offset >= b.size) {
            self.eof_pending = true;
        }
        Some((start, len))
    }

    pub fn segment_data(&self, start: SegmentDescriptor, len: usize) -> &[u8] {
        &self.blocks[start.block].data.as_slice()[start.offset..start.offset + len]
    }

    pub fn status_report(&self) -> String {
        let mut result = format!("transfer of {} blocks:", self.blocks.len());
        let mut total_sent = 0;
        let mut total_size = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            result.push_str(&format!(" {}:(size {} sent {} valid {})", i, b.size, b.offset, b.valid_bytes));
            total_sent += b.offset;
            total_size += b.size;
        }
        result.push_str(&format!(", total {}/{}, {} retransmissions pending", total_sent, total_size, self.retransmissions.len()));
        result
    }
}
