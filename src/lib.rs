//! Transfers stereo camera image sets (up to four images of identical size plus metadata) from a
//!  producer to a consumer over UDP or TCP.
//!
//! Three layers are involved:
//!
//! * The block transfer engine in the `blockprotocol` crate moves a header blob and up to eight
//!   independently sized byte blocks, with its own loss recovery on UDP
//! * [image_protocol::ImageProtocol] maps an image set onto one transfer: every channel is a
//!   block, and a [frame_header::FrameHeader] with the metadata is the transfer's user header.
//!   The receiving side assembles image sets, including partially received ones, optionally
//!   directly into caller-provided [external_buffer::ExternalBufferSet]s
//! * [bit_conversions] packs 12-bit images for the wire and unpacks them on reception
//!
//! Everything is synchronous: the caller owns the sockets, feeds received data in and pulls
//!  outgoing messages out.

pub mod bit_conversions;
pub mod external_buffer;
pub mod frame_header;
pub mod image_protocol;
pub mod image_set;

pub use blockprotocol::{BlockProtocolConfig, ErrorKind, ProtocolType, TransferError};
pub use blockprotocol::connection::ConnectionState;
pub use external_buffer::{BufferPart, ExternalBuffer, ExternalBufferSet};
pub use image_protocol::{ImageProtocol, PartialImageSet, TileWidths};
pub use image_set::{Channel, ImageFormat, ImageSet, ImageType, Timestamp};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
