use std::time::Duration;
use anyhow::bail;
use crate::header_preamble::HeaderPreamble;
use crate::MAX_UDP_RECEPTION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Udp,
    Tcp,
}

#[derive(Debug, Clone)]
pub struct BlockProtocolConfig {
    pub protocol_type: ProtocolType,

    /// The server is the side that waits for connection requests. On UDP it answers CONNECT
    ///  messages with CONFIRM and watches the client's heartbeats; the client sends CONNECT and
    ///  HEARTBEAT messages autonomously.
    ///
    /// This is independent of the direction of data: typically the server is the sensor device
    ///  producing frames, but the protocol does not require that.
    pub is_server: bool,

    /// The UDP payload size the engine assumes for outgoing datagrams, including the 4-byte
    ///  segment descriptor. There is no MTU discovery, so this must be supported by all network
    ///  hardware between the peers.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4. Choosing it too big causes datagrams to be dropped or fragmented, choosing it
    ///  too small wastes bandwidth.
    ///
    /// Ignored for TCP.
    pub max_udp_packet_size: usize,

    /// Clients send a heartbeat at this interval; a server considers the client gone after twice
    ///  this interval without a heartbeat.
    pub heartbeat_interval: Duration,

    /// A client re-sends its connection request if it has not seen the start of a frame for
    ///  this long.
    pub reconnect_interval: Duration,

    /// Capacity of a single control message. This limits the size of the header and the number
    ///  of ranges in a single resend request.
    pub control_message_capacity: usize,
}

impl BlockProtocolConfig {
    pub const DEFAULT_MAX_UDP_PACKET_SIZE: usize = 1472;
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
    pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(2000);
    pub const DEFAULT_CONTROL_MESSAGE_CAPACITY: usize = 16 * 1024;

    /// UDP with full Ethernet MTU and no optional IP headers
    pub fn default_udp(is_server: bool) -> BlockProtocolConfig {
        BlockProtocolConfig {
            protocol_type: ProtocolType::Udp,
            is_server,
            max_udp_packet_size: Self::DEFAULT_MAX_UDP_PACKET_SIZE,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_interval: Self::DEFAULT_RECONNECT_INTERVAL,
            control_message_capacity: Self::DEFAULT_CONTROL_MESSAGE_CAPACITY,
        }
    }

    pub fn default_tcp(is_server: bool) -> BlockProtocolConfig {
        BlockProtocolConfig {
            protocol_type: ProtocolType::Tcp,
            ..Self::default_udp(is_server)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol_type == ProtocolType::Udp {
            if self.max_udp_packet_size <= size_of::<u32>() {
                bail!("UDP packet size is too small to carry any payload");
            }
            if self.max_udp_packet_size > MAX_UDP_RECEPTION {
                bail!("UDP packet size {} exceeds the reception limit of {} bytes", self.max_udp_packet_size, MAX_UDP_RECEPTION);
            }
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must not be zero");
        }
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must not be zero");
        }
        if self.control_message_capacity < HeaderPreamble::SERIALIZED_LEN + 9 {
            bail!("control message capacity is too small to hold a header");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::udp_client(BlockProtocolConfig::default_udp(false), true)]
    #[case::tcp_server(BlockProtocolConfig::default_tcp(true), true)]
    #[case::tiny_packet(BlockProtocolConfig { max_udp_packet_size: 4, ..BlockProtocolConfig::default_udp(false) }, false)]
    #[case::huge_packet(BlockProtocolConfig { max_udp_packet_size: 65000, ..BlockProtocolConfig::default_udp(false) }, false)]
    #[case::huge_packet_ignored_for_tcp(BlockProtocolConfig { max_udp_packet_size: 65000, ..BlockProtocolConfig::default_tcp(false) }, true)]
    #[case::zero_heartbeat(BlockProtocolConfig { heartbeat_interval: Duration::ZERO, ..BlockProtocolConfig::default_udp(true) }, false)]
    #[case::zero_reconnect(BlockProtocolConfig { reconnect_interval: Duration::ZERO, ..BlockProtocolConfig::default_udp(true) }, false)]
    #[case::small_control(BlockProtocolConfig { control_message_capacity: 40, ..BlockProtocolConfig::default_udp(true) }, false)]
    fn test_validate(#[case] config: BlockProtocolConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
