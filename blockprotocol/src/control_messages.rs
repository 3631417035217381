use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::segment::{MissingSegment, SegmentDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlTag {
    Connect = 0x01,
    Confirm = 0x02,
    Header = 0x03,
    Resend = 0x04,
    Eof = 0x05,
    Heartbeat = 0x06,
}

/// A UDP control message: payload, followed by a tag byte and the control sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage<'a> {
    Connect,
    Confirm,
    /// header preamble plus user header
    Header(&'a [u8]),
    Resend(Vec<MissingSegment>),
    Eof(SegmentDescriptor),
    Heartbeat,
}

impl<'a> ControlMessage<'a> {
    /// tag + sentinel
    pub const OVERHEAD: usize = 1 + SegmentDescriptor::SERIALIZED_LEN;

    pub fn tag(&self) -> ControlTag {
        match self {
            ControlMessage::Connect => ControlTag::Connect,
            ControlMessage::Confirm => ControlTag::Confirm,
            ControlMessage::Header(_) => ControlTag::Header,
            ControlMessage::Resend(_) => ControlTag::Resend,
            ControlMessage::Eof(_) => ControlTag::Eof,
            ControlMessage::Heartbeat => ControlTag::Heartbeat,
        }
    }

    pub fn serialized_len(&self) -> usize {
        let payload_len = match self {
            ControlMessage::Header(header) => header.len(),
            ControlMessage::Resend(segments) => segments.len() * MissingSegment::SERIALIZED_LEN,
            ControlMessage::Eof(_) => SegmentDescriptor::SERIALIZED_LEN,
            _ => 0,
        };
        payload_len + Self::OVERHEAD
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ControlMessage::Header(header) => buf.put_slice(header),
            ControlMessage::Resend(segments) => {
                for segment in segments {
                    segment.ser(buf);
                }
            }
            ControlMessage::Eof(descriptor) => descriptor.ser(buf),
            _ => {}
        }
        buf.put_u8(self.tag().into());
        buf.put_u32(SegmentDescriptor::CONTROL_SENTINEL);
    }

    /// Checks whether a complete datagram is a control message, based on its trailing descriptor
    pub fn is_control_message(datagram: &[u8]) -> bool {
        datagram.len() >= SegmentDescriptor::SERIALIZED_LEN
            && datagram[datagram.len() - SegmentDescriptor::SERIALIZED_LEN..] == SegmentDescriptor::CONTROL_SENTINEL.to_be_bytes()
    }

    /// Parses a complete datagram including the trailing sentinel
    pub fn deser(datagram: &'a [u8]) -> anyhow::Result<Self> {
        if !Self::is_control_message(datagram) {
            bail!("not a control message");
        }
        if datagram.len() < Self::OVERHEAD {
            bail!("control message is too short");
        }

        let tag_pos = datagram.len() - Self::OVERHEAD;
        let payload = &datagram[..tag_pos];
        let tag = ControlTag::try_from(datagram[tag_pos])
            .map_err(|_| anyhow!("invalid control message tag {:#x}", datagram[tag_pos]))?;

        let result = match tag {
            ControlTag::Connect => ControlMessage::Connect,
            ControlTag::Confirm => ControlMessage::Confirm,
            ControlTag::Header => ControlMessage::Header(payload),
            ControlTag::Resend => {
                let mut buf = payload;
                let mut segments = Vec::with_capacity(payload.len() / MissingSegment::SERIALIZED_LEN);
                while buf.len() >= MissingSegment::SERIALIZED_LEN {
                    segments.push(MissingSegment::deser(&mut buf)?);
                }
                ControlMessage::Resend(segments)
            }
            ControlTag::Eof => {
                let mut buf = payload;
                ControlMessage::Eof(SegmentDescriptor::deser(&mut buf)?)
            }
            ControlTag::Heartbeat => ControlMessage::Heartbeat,
        };
        Ok(result)
    }
}
