mod reception;
mod transfer;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::config::{BlockProtocolConfig, ProtocolType};
use crate::connection::{ConnectionState, ConnectionTracker};
use crate::control_messages::ControlMessage;
use crate::error::TransferError;
use crate::safe_converter::PrecheckedCast;
use crate::segment::{MissingSegment, SegmentDescriptor};
use crate::statistics::ReceptionStatistics;
use crate::{MAX_TCP_BYTES_TRANSFER, MAX_UDP_RECEPTION};
use reception::ReceptionState;
use transfer::TransferState;

/// The block transfer engine for one end of a connection. It is a synchronous state machine:
///  the caller pulls outgoing payload and control messages and pushes every received datagram
///  (UDP) or chunk of stream data (TCP).
///
/// Sending and receiving are independent. A typical sensor device only sends, and a typical
///  consumer only receives, but both directions work on every instance.
///
/// Returned message slices point into buffers owned by the engine and are valid until the next
///  call that produces a message.
pub struct DataBlockProtocol {
    config: BlockProtocolConfig,
    transfer: TransferState,
    reception: ReceptionState,
    connection: ConnectionTracker,

    control_buf: BytesMut,
    message_buf: BytesMut,
}

impl DataBlockProtocol {
    /// Length of the prefix in front of every TCP payload fragment
    const TCP_FRAGMENT_HEADER_LEN: usize = 2 * size_of::<u32>();

    pub fn new(config: BlockProtocolConfig) -> Result<DataBlockProtocol, TransferError> {
        config.validate()
            .map_err(|e| TransferError::Misuse(format!("invalid configuration: {}", e)))?;

        let max_payload_size = match config.protocol_type {
            ProtocolType::Udp => config.max_udp_packet_size - SegmentDescriptor::SERIALIZED_LEN,
            ProtocolType::Tcp => MAX_TCP_BYTES_TRANSFER - Self::TCP_FRAGMENT_HEADER_LEN,
        };
        debug!("block protocol over {:?}, server: {}, max payload size {}", config.protocol_type, config.is_server, max_payload_size);

        Ok(DataBlockProtocol {
            transfer: TransferState::new(config.protocol_type, max_payload_size),
            reception: ReceptionState::new(),
            connection: ConnectionTracker::new(&config),
            control_buf: BytesMut::with_capacity(config.control_message_capacity),
            message_buf: BytesMut::with_capacity(max_payload_size + Self::TCP_FRAGMENT_HEADER_LEN),
            config,
        })
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.config.protocol_type
    }

    pub fn max_payload_size(&self) -> usize {
        self.transfer.max_payload_size()
    }

    /// The buffer size a caller needs for receiving a single datagram or stream chunk
    pub fn max_reception_size(&self) -> usize {
        match self.config.protocol_type {
            ProtocolType::Udp => MAX_UDP_RECEPTION,
            ProtocolType::Tcp => MAX_TCP_BYTES_TRANSFER,
        }
    }

    // ------------------------------------------------------------------ sending

    /// Starts a new transfer. An unfinished previous transfer is abandoned.
    pub fn set_transfer_header(&mut self, user_header: &[u8], num_blocks: usize) -> Result<(), TransferError> {
        self.transfer.set_header(user_header, num_blocks, self.config.control_message_capacity)
    }

    pub fn set_transfer_block_size(&mut self, block: usize, size: usize) -> Result<(), TransferError> {
        self.transfer.set_block_size(block, size)
    }

    /// Binds immutable data to a block. `valid_bytes` defaults to the whole block.
    pub fn set_transfer_data(&mut self, block: usize, data: Bytes, valid_bytes: Option<usize>) -> Result<(), TransferError> {
        self.transfer.set_shared_data(block, data, valid_bytes)
    }

    /// Binds a buffer that the producer fills in place through [DataBlockProtocol::transfer_buffer_mut],
    ///  publishing progress with [DataBlockProtocol::set_transfer_valid_bytes]
    pub fn set_transfer_buffer(&mut self, block: usize, buffer: BytesMut, valid_bytes: Option<usize>) -> Result<(), TransferError> {
        self.transfer.set_exclusive_buffer(block, buffer, valid_bytes)
    }

    pub fn transfer_buffer_mut(&mut self, block: usize) -> Result<&mut [u8], TransferError> {
        self.transfer.buffer_mut(block)
    }

    pub fn take_transfer_buffer(&mut self, block: usize) -> Option<BytesMut> {
        self.transfer.take_buffer(block)
    }

    pub fn set_transfer_valid_bytes(&mut self, block: usize, valid_bytes: usize) -> Result<(), TransferError> {
        self.transfer.set_valid_bytes(block, valid_bytes)
    }

    /// `true` if all data was sent and no retransmission is pending
    pub fn transfer_complete(&self) -> bool {
        self.transfer.is_complete()
    }

    pub fn reset_transfer(&mut self) {
        self.transfer.reset();
    }

    /// The next payload message to send, or `None` if there is currently nothing to send.
    ///
    /// On UDP the header travels as a control message, so payload is held back until
    ///  [DataBlockProtocol::next_control_message] produced it.
    pub fn next_transfer_message(&mut self) -> Result<Option<&[u8]>, TransferError> {
        if self.transfer.num_blocks() == 0 {
            return Ok(None);
        }
        if self.transfer.header_pending() && !self.transfer.header_ready() {
            return Err(TransferError::Misuse("block sizes must be declared before transferring".to_string()));
        }

        match self.config.protocol_type {
            ProtocolType::Udp => {
                if !self.connection.is_connected() {
                    return Err(TransferError::NotConnected);
                }
                if self.transfer.header_pending() {
                    return Ok(None);
                }

                let Some((start, len)) = self.transfer.next_segment() else {
                    return Ok(None);
                };
                self.message_buf.clear();
                self.message_buf.put_slice(self.transfer.segment_data(start, len));
                start.ser(&mut self.message_buf);
            }
            ProtocolType::Tcp => {
                self.message_buf.clear();
                if self.transfer.header_pending() {
                    self.transfer.take_header(&mut self.message_buf);
                    trace!("sending header");
                    return Ok(Some(&self.message_buf[..]));
                }

                let Some((start, len)) = self.transfer.next_segment() else {
                    return Ok(None);
                };
                self.message_buf.put_u32(len.prechecked_cast());
                start.ser(&mut self.message_buf);
                self.message_buf.put_slice(self.transfer.segment_data(start, len));
            }
        }
        Ok(Some(&self.message_buf[..]))
    }

    /// The next control message to send, if any. Always `None` for TCP.
    ///
    /// This must be polled regularly, also when there is no payload to send: it drives the
    ///  connection handshake and heartbeats.
    pub fn next_control_message(&mut self) -> Option<&[u8]> {
        if self.config.protocol_type == ProtocolType::Tcp {
            return None;
        }

        let mut header_buf = BytesMut::new();
        let msg = if self.connection.take_confirmation_pending() {
            ControlMessage::Confirm
        }
        else if self.connection.poll_reconnect() {
            ControlMessage::Connect
        }
        else if self.transfer.header_ready() && self.connection.is_connected() {
            self.transfer.take_header(&mut header_buf);
            ControlMessage::Header(&header_buf)
        }
        else if let Some(descriptor) = self.transfer.take_eof() {
            ControlMessage::Eof(descriptor)
        }
        else if let Some(segments) = self.reception.take_resend_request(self.max_resend_segments()) {
            ControlMessage::Resend(segments)
        }
        else if self.connection.poll_heartbeat() {
            ControlMessage::Heartbeat
        }
        else {
            return None;
        };

        trace!("sending control message {:?}", msg.tag());
        self.control_buf.clear();
        msg.ser(&mut self.control_buf);
        Some(&self.control_buf[..])
    }

    fn max_resend_segments(&self) -> usize {
        (self.config.control_message_capacity - ControlMessage::OVERHEAD) / MissingSegment::SERIALIZED_LEN
    }

    // ------------------------------------------------------------------ receiving

    /// Incorporates a received datagram (UDP) or chunk of stream data (TCP).
    ///
    /// The data of a completed reception stays available until the next call of this function.
    ///  On TCP, processing pauses after a header was parsed so the caller can bind receive buffers;
    ///  pass an empty slice to continue with the remaining buffered data.
    pub fn process_received_message(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.connection.on_remote_activity();
        self.reception.start_next_if_finished();

        match self.config.protocol_type {
            ProtocolType::Tcp => self.reception.on_tcp_data(data),
            ProtocolType::Udp => self.process_datagram(data),
        }
    }

    fn process_datagram(&mut self, datagram: &[u8]) -> Result<(), TransferError> {
        if datagram.len() > MAX_UDP_RECEPTION {
            return Err(TransferError::WireFormat(format!("datagram of {} bytes exceeds the reception limit", datagram.len())));
        }
        if datagram.len() <= SegmentDescriptor::SERIALIZED_LEN {
            return Err(TransferError::WireFormat(format!("datagram of {} bytes is too short", datagram.len())));
        }

        if !ControlMessage::is_control_message(datagram) {
            let (payload, mut raw_descriptor) = datagram.split_at(datagram.len() - SegmentDescriptor::SERIALIZED_LEN);
            let descriptor = SegmentDescriptor::deser(&mut raw_descriptor)
                .map_err(TransferError::wire)?;
            return self.reception.on_udp_payload(descriptor, payload);
        }

        let msg = match ControlMessage::deser(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("invalid control message: {}", e);
                return Err(TransferError::wire(e));
            }
        };
        trace!("received control message {:?}", msg.tag());

        match msg {
            ControlMessage::Connect => self.connection.on_connect_received(),
            ControlMessage::Confirm => self.connection.on_confirm_received(),
            ControlMessage::Header(raw) => self.reception.on_header_message(raw)?,
            ControlMessage::Resend(segments) => self.transfer.on_resend_request(segments),
            ControlMessage::Eof(descriptor) => self.reception.on_eof(descriptor),
            ControlMessage::Heartbeat => {}
        }
        Ok(())
    }

    pub fn header_received(&self) -> bool {
        self.reception.header_received()
    }

    /// Counts the headers received so far. A changed value means that a new reception started,
    ///  possibly replacing an unfinished one.
    pub fn reception_generation(&self) -> u64 {
        self.reception.headers_parsed()
    }

    /// The user header of the current reception
    pub fn received_header(&self) -> Option<&[u8]> {
        self.reception.user_header()
    }

    pub fn num_reception_blocks(&self) -> usize {
        self.reception.num_blocks()
    }

    /// The declared size of a block in the current reception
    pub fn reception_block_size(&self, block: usize) -> usize {
        self.reception.block_size(block)
    }

    /// The number of bytes at the start of a block that were received without gaps
    pub fn reception_valid_bytes(&self, block: usize) -> usize {
        self.reception.block_valid_size(block)
    }

    /// The receive buffer of a block, truncated to its declared size. Only the first
    ///  [DataBlockProtocol::reception_valid_bytes] bytes are meaningful.
    pub fn reception_data(&self, block: usize) -> &[u8] {
        self.reception.block_data(block)
    }

    pub fn reception_complete(&self) -> bool {
        self.reception.is_finished()
    }

    /// Abandons the current reception, e.g. because the caller cannot process it
    pub fn reset_reception(&mut self, dropped: bool) {
        self.reception.reset(dropped);
    }

    /// Replaces the receive buffer of a block with a caller provided one. This is possible after
    ///  the header was received and before payload for this block arrived.
    pub fn set_reception_buffer(&mut self, block: usize, buffer: BytesMut) -> Result<(), TransferError> {
        self.reception.bind_buffer(block, buffer)
    }

    /// Hands the receive buffer of a block to the caller. The engine allocates a new one, right
    ///  away if the block belongs to the current reception.
    pub fn take_reception_buffer(&mut self, block: usize) -> BytesMut {
        self.reception.take_buffer(block)
    }

    // ------------------------------------------------------------------ connection, statistics

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Returns `true` once after a server accepted a connection request, so the socket layer can
    ///  pick up the client's address
    pub fn new_client_connected(&mut self) -> bool {
        self.connection.new_client_connected()
    }

    pub fn statistics(&self) -> &ReceptionStatistics {
        self.reception.statistics()
    }

    pub fn dropped_receptions(&self) -> u64 {
        self.reception.statistics().dropped_receptions()
    }

    pub fn completed_receptions(&self) -> u64 {
        self.reception.statistics().completed_receptions()
    }

    pub fn lost_segment_rate(&self) -> f64 {
        self.reception.statistics().lost_segment_rate()
    }

    pub fn status_report(&self) -> String {
        format!("{:?} {:?}; {}; {}", self.config.protocol_type, self.connection.state(), self.transfer.status_report(), self.reception.status_report())
    }
}
