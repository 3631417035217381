use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use crate::config::{BlockProtocolConfig, ProtocolType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A client sent a connection request and waits for confirmation
    HandshakePending,
    Connected,
}

/// Connection and heartbeat bookkeeping for UDP. TCP connections are managed by the socket
///  layer, so they are always considered connected here.
///
/// The client drives the handshake: it sends CONNECT at startup and whenever the server has been
///  silent for the reconnect interval, and a HEARTBEAT once per heartbeat interval. The server
///  confirms every CONNECT and considers the client gone if it sees no activity for twice the
///  heartbeat interval.
pub struct ConnectionTracker {
    protocol_type: ProtocolType,
    is_server: bool,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,

    confirmed: bool,
    confirmation_pending: bool,
    /// one-shot flag for the server's socket layer, which needs to learn the client's address
    client_connection_pending: bool,

    /// client only: `None` until the first connection request was sent
    last_remote_host_activity: Option<Instant>,
    /// client only
    last_sent_heartbeat: Option<Instant>,
    /// server only: any message from the client counts as a heartbeat
    last_received_heartbeat: Instant,
}

impl ConnectionTracker {
    pub fn new(config: &BlockProtocolConfig) -> ConnectionTracker {
        ConnectionTracker {
            protocol_type: config.protocol_type,
            is_server: config.is_server,
            heartbeat_interval: config.heartbeat_interval,
            reconnect_interval: config.reconnect_interval,
            confirmed: false,
            confirmation_pending: false,
            client_connection_pending: false,
            last_remote_host_activity: None,
            last_sent_heartbeat: None,
            last_received_heartbeat: Instant::now(),
        }
    }

    pub fn disconnect_threshold(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    pub fn state(&self) -> ConnectionState {
        if self.protocol_type == ProtocolType::Tcp {
            return ConnectionState::Connected;
        }

        if self.is_server {
            if self.confirmed && self.last_received_heartbeat.elapsed() < self.disconnect_threshold() {
                ConnectionState::Connected
            }
            else {
                ConnectionState::Disconnected
            }
        }
        else if self.confirmed {
            ConnectionState::Connected
        }
        else if self.last_remote_host_activity.is_some() {
            ConnectionState::HandshakePending
        }
        else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn on_connect_received(&mut self) {
        if !self.is_server {
            debug!("ignoring connection request received by a client");
            return;
        }
        info!("client connection request received");
        self.confirmed = true;
        self.confirmation_pending = true;
        self.client_connection_pending = true;
        self.last_received_heartbeat = Instant::now();
    }

    pub fn on_confirm_received(&mut self) {
        if !self.confirmed {
            info!("connection confirmed by server");
        }
        self.confirmed = true;
        self.last_remote_host_activity = Some(Instant::now());
    }

    /// Called for every message received from the peer, including heartbeats
    pub fn on_remote_activity(&mut self) {
        if self.is_server {
            self.last_received_heartbeat = Instant::now();
        }
        else {
            self.last_remote_host_activity = Some(Instant::now());
        }
    }

    pub fn take_confirmation_pending(&mut self) -> bool {
        std::mem::replace(&mut self.confirmation_pending, false)
    }

    /// Returns `true` if a client should send a (new) connection request now. Sending the request
    ///  restarts the handshake, i.e. the client is no longer connected until it is confirmed.
    pub fn poll_reconnect(&mut self) -> bool {
        if self.is_server || self.protocol_type == ProtocolType::Tcp {
            return false;
        }

        let due = match self.last_remote_host_activity {
            None => true,
            Some(t) => t.elapsed() > self.reconnect_interval,
        };
        if due {
            if self.confirmed {
                info!("no activity from server for {:?}, reconnecting", self.reconnect_interval);
            }
            let now = Instant::now();
            self.confirmed = false;
            self.last_remote_host_activity = Some(now);
            self.last_sent_heartbeat = Some(now);
        }
        due
    }

    pub fn poll_heartbeat(&mut self) -> bool {
        if self.is_server || self.protocol_type == ProtocolType::Tcp {
            return false;
        }

        let due = match self.last_sent_heartbeat {
            None => true,
            Some(t) => t.elapsed() > self.heartbeat_interval,
        };
        if due {
            self.last_sent_heartbeat = Some(Instant::now());
        }
        due
    }

    pub fn new_client_connected(&mut self) -> bool {
        std::mem::replace(&mut self.client_connection_pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_client_handshake() {
        let mut tracker = ConnectionTracker::new(&BlockProtocolConfig::default_udp(false));
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        assert!(tracker.poll_reconnect());
        assert_eq!(tracker.state(), ConnectionState::HandshakePending);
        assert!(!tracker.poll_reconnect());

        tracker.on_confirm_received();
        assert_eq!(tracker.state(), ConnectionState::Connected);

        advance(Duration::from_millis(2001)).await;
        assert!(tracker.poll_reconnect());
        assert_eq!(tracker.state(), ConnectionState::HandshakePending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_activity_prevents_reconnect() {
        let mut tracker = ConnectionTracker::new(&BlockProtocolConfig::default_udp(false));
        assert!(tracker.poll_reconnect());
        tracker.on_confirm_received();

        for _ in 0..10 {
            advance(Duration::from_millis(1500)).await;
            tracker.on_remote_activity();
            assert!(!tracker.poll_reconnect());
            assert!(tracker.is_connected());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_heartbeat_interval() {
        let mut tracker = ConnectionTracker::new(&BlockProtocolConfig::default_udp(false));
        assert!(tracker.poll_reconnect());
        assert!(!tracker.poll_heartbeat());

        advance(Duration::from_millis(1000)).await;
        assert!(!tracker.poll_heartbeat());
        advance(Duration::from_millis(1)).await;
        assert!(tracker.poll_heartbeat());
        assert!(!tracker.poll_heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_heartbeat_timeout() {
        let mut tracker = ConnectionTracker::new(&BlockProtocolConfig::default_udp(true));
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
        assert!(!tracker.poll_reconnect());
        assert!(!tracker.poll_heartbeat());

        tracker.on_connect_received();
        assert!(tracker.is_connected());
        assert!(tracker.take_confirmation_pending());
        assert!(!tracker.take_confirmation_pending());
        assert!(tracker.new_client_connected());
        assert!(!tracker.new_client_connected());

        for _ in 0..5 {
            advance(Duration::from_millis(1999)).await;
            assert!(tracker.is_connected());
            tracker.on_remote_activity();
        }

        advance(Duration::from_millis(2000)).await;
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        tracker.on_connect_received();
        assert!(tracker.is_connected());
    }

    #[test]
    fn test_tcp_is_always_connected() {
        let mut tracker = ConnectionTracker::new(&BlockProtocolConfig::default_tcp(false));
        assert!(tracker.is_connected());
        assert!(!tracker.poll_reconnect());
        assert!(!tracker.poll_heartbeat());
    }
}
