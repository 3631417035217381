//! A point-to-point block transfer protocol for moving a small number of large, independently
//!  sized byte blocks (plus one header blob) from a producer to a consumer, either over UDP with
//!  its own loss recovery or over TCP with explicit framing.
//!
//! ## Design goals
//!
//! * One logical *transfer* consists of a header and 1 to 8 *blocks*. Blocks progress
//!   independently and are interleaved on the wire, so a block whose data is produced slowly
//!   does not stall the others
//! * The producer may hand in blocks that are only partially filled and publish more valid bytes
//!   as they become available
//! * Within a block, bytes are never exposed out of order. Gaps caused by lost datagrams are
//!   recorded and bridged by retransmission, never skipped
//! * Losing a frame is acceptable, stalling is not: anything that cannot be recovered resets the
//!   reception, counts it as dropped, and the next frame starts fresh
//! * The engine is synchronous and never blocks. Socket I/O, waiting and locking belong to the
//!   caller, which pulls outgoing messages and feeds incoming bytes
//! * Sending and receiving are independent directions on the same instance
//!
//! ## Header
//!
//! Every transfer starts with a preamble, followed by the opaque user header. All numbers in
//!  network byte order (BE):
//!
//! ```ascii
//!  0: user header size (u16)
//!  2: legacy marker (i32) - always -1. Non-negative values were used by legacy single-block
//!      senders and are rejected
//!  6: declared block sizes (8 x u32) - unused blocks have size 0
//! 38: user header
//! ```
//!
//! ## UDP
//!
//! Every datagram ends with a 32-bit descriptor:
//!
//! ```ascii
//! bit 31:     reserved (0)
//! bits 30-28: block id
//! bits 27-0:  byte offset inside the block
//! ```
//!
//! The descriptor value `0xFFFFFFFF` marks a control message. The byte preceding the descriptor
//!  is then the control tag, and everything before it is the control payload:
//!
//! ```ascii
//! 0x01 CONNECT    client -> server, (re-)establishes the connection
//! 0x02 CONFIRM    server -> client
//! 0x03 HEADER     payload is the preamble plus user header
//! 0x04 RESEND     payload is a list of (descriptor u32, length u32) pairs
//! 0x05 EOF        payload is the descriptor (last block, its size)
//! 0x06 HEARTBEAT  client -> server, once per heartbeat interval
//! ```
//!
//! The receiver detects gaps from descriptors that skip ahead of a block's expected offset. At
//!  EOF, all gaps (including unreceived block tails) are requested in a single RESEND message,
//!  and the sender serves retransmissions before any new data.
//!
//! ## TCP
//!
//! The header is sent first, as the plain preamble plus user header. Every payload fragment
//!  is prefixed with an 8-byte fragment header:
//!
//! ```ascii
//! 0: fragment length (u32)
//! 4: descriptor (u32)
//! ```
//!
//! Fragments arrive in order, so there are no gaps and no control messages. The preamble of the
//!  next transfer's header reads as a fragment header for the reserved block 7, which is how the
//!  receiver recognizes the end of the payload.

pub mod config;
pub mod connection;
pub mod control_messages;
pub mod data_block_protocol;
pub mod error;
pub mod header_preamble;
pub mod safe_converter;
pub mod segment;
pub mod statistics;

pub use config::{BlockProtocolConfig, ProtocolType};
pub use data_block_protocol::DataBlockProtocol;
pub use error::{ErrorKind, TransferError};

/// Maximum number of blocks in a single transfer
pub const MAX_DATA_BLOCKS: usize = 8;

/// Maximum number of bytes in a single TCP message, including the fragment header
pub const MAX_TCP_BYTES_TRANSFER: usize = 0xFFFF;

/// Maximum number of bytes in a single received UDP datagram
pub const MAX_UDP_RECEPTION: usize = 0x4000;

/// Upper bound for stream bytes that are buffered but not yet incorporated into a block
pub const MAX_OUTSTANDING_BYTES: usize = 2 * MAX_TCP_BYTES_TRANSFER;
