use std::collections::VecDeque;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};
use crate::error::TransferError;
use crate::header_preamble::HeaderPreamble;
use crate::safe_converter::SafeCast;
use crate::segment::{MissingSegment, SegmentDescriptor};
use crate::statistics::ReceptionStatistics;
use crate::{MAX_DATA_BLOCKS, MAX_OUTSTANDING_BYTES, MAX_TCP_BYTES_TRANSFER};

struct ReceptionBlock {
    /// At least `size` bytes once a header was received. Buffers are kept across receptions
    ///  for reuse, unless the caller takes them.
    buffer: BytesMut,
    size: usize,
    /// the offset at which the next segment is expected
    cursor: usize,
    /// end of the highest range received so far
    high_water: usize,
    /// gaps in ascending order
    missing: VecDeque<MissingSegment>,
}
impl ReceptionBlock {
    fn new() -> ReceptionBlock {
        ReceptionBlock {
            buffer: BytesMut::new(),
            size: 0,
            cursor: 0,
            high_water: 0,
            missing: VecDeque::new(),
        }
    }

    /// The length of the gap-free prefix
    fn valid_size(&self) -> usize {
        self.missing.front()
            .map(|m| m.start.offset)
            .unwrap_or(self.high_water)
            .min(self.size)
    }

    fn write(&mut self, offset: usize, payload: &[u8]) {
        self.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        self.cursor = offset + payload.len();
        self.high_water = self.high_water.max(self.cursor);
    }
}

pub(super) struct ReceptionState {
    header: Option<Vec<u8>>,
    blocks: Vec<ReceptionBlock>,
    num_blocks: usize,

    /// set after an EOF revealed gaps: only retransmissions of the earliest gap per block are
    ///  accepted until all gaps are filled
    waiting_for_missing: bool,
    resend_pending: bool,
    finished: bool,
    lost_bytes: usize,
    /// payload arriving without a header is counted as one dropped reception, not per segment
    orphan_payload_seen: bool,

    /// TCP stream bytes that were not yet incorporated into a block
    pending: BytesMut,

    /// incremented for every parsed header
    headers_parsed: u64,

    statistics: ReceptionStatistics,
}

impl ReceptionState {
    pub fn new() -> ReceptionState {
        ReceptionState {
            header: None,
            blocks: (0..MAX_DATA_BLOCKS).map(|_| ReceptionBlock::new()).collect(),
            num_blocks: 0,
            waiting_for_missing: false,
            resend_pending: false,
            finished: false,
            lost_bytes: 0,
            orphan_payload_seen: false,
            pending: BytesMut::new(),
            headers_parsed: 0,
            statistics: ReceptionStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &ReceptionStatistics {
        &self.statistics
    }

    pub fn headers_parsed(&self) -> u64 {
        self.headers_parsed
    }

    pub fn header_received(&self) -> bool {
        self.header.is_some()
    }

    pub fn user_header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[cfg(test)]
    pub fn resend_pending(&self) -> bool {
        self.resend_pending
    }

    pub fn block_size(&self, block: usize) -> usize {
        if block < self.num_blocks { self.blocks[block].size } else { 0 }
    }

    pub fn block_valid_size(&self, block: usize) -> usize {
        if block < self.num_blocks { self.blocks[block].valid_size() } else { 0 }
    }

    pub fn block_data(&self, block: usize) -> &[u8] {
        if block < self.num_blocks {
            let b = &self.blocks[block];
            &b.buffer[..b.size.min(b.buffer.len())]
        }
        else {
            &[]
        }
    }

    pub fn any_payload_received(&self) -> bool {
        self.blocks[..self.num_blocks].iter().any(|b| b.high_water > 0)
    }

    /// Resets per-frame state. Buffered TCP stream bytes are kept since they belong to the next
    ///  frame.
    pub fn reset(&mut self, dropped: bool) {
        if dropped {
            warn!("dropping reception of {} blocks", self.num_blocks);
            self.statistics.on_dropped();
        }
        self.header = None;
        for b in self.blocks.iter_mut() {
            b.size = 0;
            b.cursor = 0;
            b.high_water = 0;
            b.missing.clear();
        }
        self.num_blocks = 0;
        self.waiting_for_missing = false;
        self.resend_pending = false;
        self.finished = false;
        self.lost_bytes = 0;
    }

    pub fn start_next_if_finished(&mut self) {
        if self.finished {
            self.reset(false);
        }
    }

    fn wire_error(&mut self, msg: String) -> TransferError {
        warn!("wire format error: {}", msg);
        self.reset(true);
        TransferError::WireFormat(msg)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.waiting_for_missing = false;
        let total = self.blocks[..self.num_blocks].iter().map(|b| b.size).sum();
        self.statistics.on_completed(self.lost_bytes, total);
        debug!("reception complete, {} bytes requested for resend", self.lost_bytes);
    }

    /// Parses preamble plus user header, returning the number of bytes consumed
    fn parse_header(&mut self, raw: &[u8]) -> Result<usize, TransferError> {
        let mut buf = raw;
        let preamble = match HeaderPreamble::deser(&mut buf) {
            Ok(p) => p,
            Err(e) => return Err(self.wire_error(format!("invalid header: {}", e))),
        };
        if buf.len() < preamble.user_header_len {
            return Err(self.wire_error(format!("header declares {} bytes, only {} present", preamble.user_header_len, buf.len())));
        }

        self.header = Some(buf[..preamble.user_header_len].to_vec());
        self.num_blocks = preamble.num_blocks();
        for (b, size) in self.blocks.iter_mut().zip(preamble.block_sizes.iter()) {
            b.size = *size;
            if b.buffer.len() < *size {
                b.buffer.resize(*size, 0);
            }
        }
        self.orphan_payload_seen = false;
        self.headers_parsed += 1;

        debug!("received header for blocks {:?}", preamble.block_sizes);
        Ok(preamble.total_len())
    }

    /// Replaces the receive buffer of a block. This is only possible after the header was parsed
    ///  and before any payload arrived for the block.
    pub fn bind_buffer(&mut self, block: usize, buffer: BytesMut) -> Result<(), TransferError> {
        if !self.header_received() || block >= self.num_blocks {
            return Err(TransferError::Misuse(format!("no block {} in the current reception", block)));
        }
        let b = &mut self.blocks[block];
        if b.high_water > 0 {
            return Err(TransferError::Misuse(format!("block {} already received payload", block)));
        }
        if buffer.len() < b.size {
            return Err(TransferError::Misuse(format!("receive buffer of {} bytes for block {} is smaller than its size {}", buffer.len(), block, b.size)));
        }
        b.buffer = buffer;
        Ok(())
    }

    /// Hands out a block's buffer. A block of the current reception gets a fresh zeroed buffer
    ///  so that payload can still be received.
    pub fn take_buffer(&mut self, block: usize) -> BytesMut {
        let active = block < self.num_blocks;
        match self.blocks.get_mut(block) {
            Some(b) => {
                let taken = std::mem::take(&mut b.buffer);
                if active {
                    b.buffer.resize(b.size, 0);
                }
                taken
            }
            None => BytesMut::new(),
        }
    }

    // ------------------------------------------------------------------ UDP

    pub fn on_header_message(&mut self, raw: &[u8]) -> Result<(), TransferError> {
        if self.any_payload_received() {
            if self.blocks[..self.num_blocks].iter().all(|b| b.high_water >= b.size) {
                debug!("header received before EOF of the previous frame");
            }
            else {
                debug!("header received while the previous frame is incomplete");
            }
            self.reset(true);
        }
        else if self.header_received() {
            self.reset(false);
        }

        self.parse_header(raw)?;
        Ok(())
    }

    pub fn on_udp_payload(&mut self, descriptor: SegmentDescriptor, payload: &[u8]) -> Result<(), TransferError> {
        if !self.header_received() {
            trace!("payload {:?} without header", descriptor);
            if !self.orphan_payload_seen {
                self.orphan_payload_seen = true;
                self.statistics.on_dropped();
            }
            return Ok(());
        }

        let block = descriptor.block;
        let offset = descriptor.offset;
        if block >= self.num_blocks {
            return Err(self.wire_error(format!("segment {:?} for undeclared block", descriptor)));
        }
        if offset + payload.len() > self.blocks[block].size {
            return Err(self.wire_error(format!("segment {:?}+{} exceeds block size {}", descriptor, payload.len(), self.blocks[block].size)));
        }

        let waiting = self.waiting_for_missing;
        let b = &mut self.blocks[block];
        if offset != b.cursor {
            if !waiting && offset > b.cursor {
                let gap = MissingSegment::new(block, b.cursor, offset - b.cursor);
                trace!("missing segment {:?}", gap);
                self.lost_bytes += gap.len;
                b.missing.push_back(gap);
                b.write(offset, payload);
            }
            else {
                let resend_failed = waiting && offset > 0;
                debug!("unexpected segment {:?}, expected offset {} - {}", descriptor, b.cursor,
                    if resend_failed { "resend failed" } else { "missed EOF" });
                let dropped = self.any_payload_received();
                self.reset(dropped);
            }
            return Ok(());
        }

        b.write(offset, payload);
        if waiting {
            self.integrate_retransmission(block, offset, payload.len());
        }
        Ok(())
    }

    fn integrate_retransmission(&mut self, block: usize, offset: usize, len: usize) {
        let b = &mut self.blocks[block];
        let Some(front) = b.missing.front_mut() else {
            return;
        };
        if front.start.offset != offset {
            debug!("invalid retransmission {}@{}, expected {:?}", block, offset, front);
            self.reset(true);
            return;
        }

        if front.consume_front(len) {
            b.missing.pop_front();
        }
        if let Some(next) = b.missing.front() {
            b.cursor = next.start.offset;
        }

        if self.blocks[..self.num_blocks].iter().all(|b| b.missing.is_empty()) {
            self.finish();
        }
    }

    pub fn on_eof(&mut self, descriptor: SegmentDescriptor) {
        if !self.header_received() || self.finished {
            trace!("ignoring EOF {:?}", descriptor);
            return;
        }
        if self.waiting_for_missing {
            debug!("duplicate EOF {:?}", descriptor);
            return;
        }

        for (block, b) in self.blocks[..self.num_blocks].iter_mut().enumerate() {
            if b.high_water < b.size {
                let gap = MissingSegment::new(block, b.high_water, b.size - b.high_water);
                self.lost_bytes += gap.len;
                b.missing.push_back(gap);
            }
        }

        let mut any_missing = false;
        for b in self.blocks[..self.num_blocks].iter_mut() {
            if let Some(first) = b.missing.front() {
                any_missing = true;
                b.cursor = first.start.offset;
            }
        }

        if any_missing {
            self.waiting_for_missing = true;
            self.resend_pending = true;
        }
        else {
            self.finish();
        }
    }

    /// Collects all gaps for a resend request. If they do not fit into a single control message,
    ///  the reception is dropped instead.
    pub fn take_resend_request(&mut self, max_segments: usize) -> Option<Vec<MissingSegment>> {
        if !self.resend_pending {
            return None;
        }
        self.resend_pending = false;

        let segments: Vec<MissingSegment> = self.blocks[..self.num_blocks].iter()
            .flat_map(|b| b.missing.iter().copied())
            .collect();
        if segments.len() > max_segments {
            debug!("{} missing segments do not fit into a resend request", segments.len());
            self.reset(true);
            return None;
        }
        for segment in &segments {
            trace!("requesting {:?}", segment);
        }
        Some(segments)
    }

    // ------------------------------------------------------------------ TCP

    /// Appends stream data and incorporates all complete fragments. Processing stops right after
    ///  a header was parsed so that the caller can bind receive buffers before payload is copied.
    pub fn on_tcp_data(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.pending.extend_from_slice(data);
        if self.pending.len() > 2 * MAX_TCP_BYTES_TRANSFER + MAX_OUTSTANDING_BYTES {
            self.pending.clear();
            return Err(self.wire_error("too many unprocessed stream bytes".to_string()));
        }

        if !self.header_received() {
            let Some(total_len) = HeaderPreamble::peek_total_len(&self.pending) else {
                return Ok(());
            };
            if self.pending.len() < total_len {
                return Ok(());
            }

            let raw = self.pending.split_to(total_len);
            if let Err(e) = self.parse_header(&raw) {
                self.pending.clear();
                return Err(e);
            }
            return Ok(());
        }

        const FRAGMENT_HEADER_LEN: usize = 2 * size_of::<u32>();
        while !self.finished && self.pending.len() >= FRAGMENT_HEADER_LEN {
            let mut peek: &[u8] = &self.pending[..FRAGMENT_HEADER_LEN];
            let fragment_len: usize = peek.get_u32().safe_cast();
            let descriptor = SegmentDescriptor::split(peek.get_u32());

            if descriptor.block == SegmentDescriptor::RESERVED_BLOCK {
                // this is the next header
                debug!("header received while the current frame is incomplete");
                self.reset(true);
                return Ok(());
            }
            if fragment_len > MAX_TCP_BYTES_TRANSFER {
                self.pending.clear();
                return Err(self.wire_error(format!("fragment length {} exceeds the maximum", fragment_len)));
            }
            if self.pending.len() < FRAGMENT_HEADER_LEN + fragment_len {
                break;
            }

            let block = descriptor.block;
            let valid = block < self.num_blocks
                && descriptor.offset == self.blocks[block].cursor
                && descriptor.offset + fragment_len <= self.blocks[block].size;
            if !valid {
                self.pending.clear();
                return Err(self.wire_error(format!("unexpected fragment {:?}+{}", descriptor, fragment_len)));
            }

            self.pending.advance(FRAGMENT_HEADER_LEN);
            let payload = self.pending.split_to(fragment_len);
            trace!("fragment {:?}+{}", descriptor, fragment_len);
            self.blocks[block].write(descriptor.offset, &payload);

            if self.blocks[..self.num_blocks].iter().all(|b| b.cursor >= b.size) {
                self.finish();
            }
        }
        Ok(())
    }

    pub fn status_report(&self) -> String {
        let mut result = format!("reception of {} blocks:", self.num_blocks);
        for (i, b) in self.blocks[..self.num_blocks].iter().enumerate() {
            result.push_str(&format!(" {}:(size {} valid {} gaps {})", i, b.size, b.valid_size(), b.missing.len()));
        }
        result
    }
}
