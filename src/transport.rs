//! Pub/sub transport seam.
//!
//! [`Transport`] is the seam, [`MqttTransport`] the one real
//! implementation, and tests drive the seam with an in-memory fake instead
//! of a broker.
//!
//! `MqttTransport` owns a plain `TcpStream` and speaks just enough MQTT
//! v3.1.1 (`wire`, below) to CONNECT, SUBSCRIBE/UNSUBSCRIBE, PUBLISH, and
//! keep the connection alive — mirroring how the original wires a raw
//! socket (`NetworkConnectURI`) to `MQTTClient-C`'s packet
//! serialize/deserialize calls rather than delegating the transport to the
//! library. Once connected, the socket is configured for signal-driven
//! I/O exactly like the tether and log-fanin sockets elsewhere in this
//! crate (`client/signal.c`'s `yodi_setsig`, here `SIGMQTT = SIGRTMIN`):
//! activity on it raises a realtime signal, and `yield_now` blocks on that
//! signal rather than on a second thread polling the socket. This keeps
//! the client role single-threaded, the way every role in this agent is.

use crate::signal::{self, SigSet};
use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    fn wire(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

#[derive(Debug)]
pub enum Inbound {
    Message { topic: String, payload: Vec<u8> },
    /// Either the wait timed out or the socket woke us for something with
    /// nothing to hand back (a SUBACK, a PINGRESP, ...); the caller just
    /// loops again.
    Idle,
}

pub trait Transport {
    type Error: std::error::Error + Send + Sync + 'static;

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), Self::Error>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error>;
    fn publish(&mut self, topic: &str, qos: Qos, payload: &[u8]) -> Result<(), Self::Error>;
    /// Block up to `timeout` for the next inbound event.
    fn yield_now(&mut self, timeout: Duration) -> Result<Inbound, Self::Error>;
    fn disconnect(&mut self) -> Result<(), Self::Error>;
}

pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub broker_uri: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keepalive: Duration,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("signal setup failed: {0}")]
    Signal(#[from] signal::SignalError),
    #[error("broker refused the connection")]
    Refused,
    #[error("malformed packet: {0}")]
    Wire(&'static str),
    #[error("connection closed by the broker")]
    Closed,
}

pub struct MqttTransport {
    stream: TcpStream,
    /// Selects just the MQTT socket's signal for `timed_wait`; the signal
    /// itself is blocked once, process-wide, by the role's startup code
    /// (alongside `SIGTERM`) before this is ever waited on.
    sig: SigSet,
    recv_buf: Vec<u8>,
    pending: VecDeque<Inbound>,
    next_pid: u16,
    last_activity: Instant,
    keepalive: Duration,
}

impl MqttTransport {
    /// Opens one MQTT connection: TCP connect, CONNECT/CONNACK handshake
    /// over the still-blocking socket, then arms signal-driven I/O for
    /// everything after. Retrying a failed attempt is the caller's job
    /// (see `client::connect_with_retry`).
    pub fn connect(cfg: &MqttConfig) -> Result<Self, MqttError> {
        let addr = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| MqttError::Io(io::Error::new(io::ErrorKind::NotFound, "could not resolve broker address")))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        let _ = stream.set_nodelay(true);

        let keep_alive_secs = u16::try_from(cfg.keepalive.as_secs()).unwrap_or(u16::MAX);
        let connect_pkt = wire::encode_connect(&cfg.client_id, &cfg.username, &cfg.password, keep_alive_secs);
        write_all_blocking(&stream, &connect_pkt)?;

        let mut header = [0u8; 4];
        read_exact_blocking(&stream, &mut header)?;
        match wire::decode_one(&header).map_err(MqttError::Wire)? {
            Some((wire::Incoming::ConnAck { accepted: true }, _)) => {}
            Some((wire::Incoming::ConnAck { accepted: false }, _)) => return Err(MqttError::Refused),
            _ => return Err(MqttError::Wire("expected a CONNACK")),
        }

        let sigmqtt = signal::rtmin();
        let mut sig = SigSet::empty()?;
        sig.add(sigmqtt)?;

        signal::set_async_signal(stream.as_raw_fd(), sigmqtt)?;
        stream.set_nonblocking(true)?;

        Ok(MqttTransport {
            stream,
            sig,
            recv_buf: Vec::new(),
            pending: VecDeque::new(),
            next_pid: 1,
            last_activity: Instant::now(),
            keepalive: cfg.keepalive,
        })
    }

    fn next_pid(&mut self) -> u16 {
        let pid = self.next_pid;
        self.next_pid = if self.next_pid == u16::MAX { 1 } else { self.next_pid + 1 };
        pid
    }

    fn write(&self, buf: &[u8]) -> Result<(), MqttError> {
        write_all_nonblocking(&self.stream, buf)
    }

    /// Drains every byte currently available on the socket (non-blocking —
    /// the signal already told us there's something there) and decodes as
    /// many complete control packets as it can.
    fn drain_socket(&mut self) -> Result<(), MqttError> {
        use io::Read;
        let mut tmp = [0u8; 4096];
        loop {
            match (&self.stream).read(&mut tmp) {
                Ok(0) => return Err(MqttError::Closed),
                Ok(n) => self.recv_buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(MqttError::Io(e)),
            }
        }
        loop {
            match wire::decode_one(&self.recv_buf).map_err(MqttError::Wire)? {
                None => break,
                Some((incoming, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    if let wire::Incoming::Publish { topic, payload } = incoming {
                        self.pending.push_back(Inbound::Message { topic, payload });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Transport for MqttTransport {
    type Error = MqttError;

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), MqttError> {
        let pid = self.next_pid();
        self.write(&wire::encode_subscribe(pid, topic, qos.wire()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        let pid = self.next_pid();
        self.write(&wire::encode_unsubscribe(pid, topic))
    }

    fn publish(&mut self, topic: &str, qos: Qos, payload: &[u8]) -> Result<(), MqttError> {
        let pid = matches!(qos, Qos::AtLeastOnce).then(|| self.next_pid());
        self.write(&wire::encode_publish(topic, qos.wire(), pid, payload))
    }

    fn yield_now(&mut self, timeout: Duration) -> Result<Inbound, MqttError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        match self.sig.timed_wait(timeout)? {
            Some(_) => {
                self.drain_socket()?;
                self.last_activity = Instant::now();
            }
            None if self.last_activity.elapsed() >= self.keepalive => {
                self.write(&wire::encode_pingreq())?;
                self.last_activity = Instant::now();
            }
            None => {}
        }
        Ok(self.pending.pop_front().unwrap_or(Inbound::Idle))
    }

    fn disconnect(&mut self) -> Result<(), MqttError> {
        self.write(&wire::encode_disconnect())
    }
}

fn write_all_blocking(stream: &TcpStream, buf: &[u8]) -> Result<(), MqttError> {
    use io::Write;
    (&mut &*stream).write_all(buf)?;
    Ok(())
}

fn read_exact_blocking(stream: &TcpStream, buf: &mut [u8]) -> Result<(), MqttError> {
    use io::Read;
    let mut read = 0;
    while read < buf.len() {
        let n = (&*stream).read(&mut buf[read..])?;
        if n == 0 {
            return Err(MqttError::Closed);
        }
        read += n;
    }
    Ok(())
}

/// The socket is non-blocking by the time this is ever called; small
/// control packets essentially always go out in one `write`, so a short
/// busy-retry on `WouldBlock` is enough rather than a full write-readiness
/// wait.
fn write_all_nonblocking(stream: &TcpStream, mut buf: &[u8]) -> Result<(), MqttError> {
    use io::Write;
    while !buf.is_empty() {
        match (&*stream).write(buf) {
            Ok(0) => return Err(MqttError::Closed),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(WRITE_RETRY_DELAY),
            Err(e) => return Err(MqttError::Io(e)),
        }
    }
    Ok(())
}

/// Minimal MQTT v3.1.1 control packet codec: just enough to CONNECT,
/// SUBSCRIBE/UNSUBSCRIBE, PUBLISH, and PINGREQ, and to parse back
/// CONNACK/PUBLISH/SUBACK/UNSUBACK/PUBACK/PINGRESP. Plays the same role
/// `MQTTClient-C`'s `MQTTPacket` serialize/deserialize functions play in
/// the original: pure pack/unpack over bytes, no opinion about the socket.
mod wire {
    const CONNECT: u8 = 1;
    const CONNACK: u8 = 2;
    const PUBLISH: u8 = 3;
    const PUBACK: u8 = 4;
    const SUBSCRIBE: u8 = 8;
    const SUBACK: u8 = 9;
    const UNSUBSCRIBE: u8 = 10;
    const UNSUBACK: u8 = 11;
    const PINGREQ: u8 = 12;
    const PINGRESP: u8 = 13;
    const DISCONNECT: u8 = 14;

    fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if len == 0 {
                break;
            }
        }
    }

    /// `(remaining_length, bytes_consumed_by_the_length_field)`, or `None`
    /// if `buf` doesn't yet hold the whole variable-length field.
    fn decode_remaining_length(buf: &[u8]) -> Option<(usize, usize)> {
        let mut multiplier = 1usize;
        let mut value = 0usize;
        for (i, &byte) in buf.iter().enumerate().take(4) {
            value += (byte as usize & 0x7F) * multiplier;
            if byte & 0x80 == 0 {
                return Some((value, i + 1));
            }
            multiplier *= 128;
        }
        None
    }

    fn encode_str(s: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    pub fn encode_connect(client_id: &str, username: &str, password: &str, keep_alive_secs: u16) -> Vec<u8> {
        let mut body = Vec::new();
        encode_str("MQTT", &mut body);
        body.push(4); // protocol level: MQTT 3.1.1
        let has_user = !username.is_empty();
        let has_pass = !password.is_empty();
        let mut flags = 0x02u8; // clean session
        if has_user {
            flags |= 0x80;
        }
        if has_pass {
            flags |= 0x40;
        }
        body.push(flags);
        body.extend_from_slice(&keep_alive_secs.to_be_bytes());
        encode_str(client_id, &mut body);
        if has_user {
            encode_str(username, &mut body);
        }
        if has_pass {
            encode_str(password, &mut body);
        }

        let mut packet = Vec::with_capacity(body.len() + 5);
        packet.push(CONNECT << 4);
        encode_remaining_length(body.len(), &mut packet);
        packet.extend_from_slice(&body);
        packet
    }

    pub fn encode_subscribe(pid: u16, topic: &str, qos: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        encode_str(topic, &mut body);
        body.push(qos);

        let mut packet = Vec::with_capacity(body.len() + 5);
        packet.push((SUBSCRIBE << 4) | 0x02);
        encode_remaining_length(body.len(), &mut packet);
        packet.extend_from_slice(&body);
        packet
    }

    pub fn encode_unsubscribe(pid: u16, topic: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        encode_str(topic, &mut body);

        let mut packet = Vec::with_capacity(body.len() + 5);
        packet.push((UNSUBSCRIBE << 4) | 0x02);
        encode_remaining_length(body.len(), &mut packet);
        packet.extend_from_slice(&body);
        packet
    }

    pub fn encode_publish(topic: &str, qos: u8, pid: Option<u16>, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        encode_str(topic, &mut body);
        if let Some(pid) = pid {
            body.extend_from_slice(&pid.to_be_bytes());
        }
        body.extend_from_slice(payload);

        let mut packet = Vec::with_capacity(body.len() + 5);
        packet.push((PUBLISH << 4) | (qos << 1));
        encode_remaining_length(body.len(), &mut packet);
        packet.extend_from_slice(&body);
        packet
    }

    pub fn encode_pingreq() -> [u8; 2] {
        [PINGREQ << 4, 0]
    }

    pub fn encode_disconnect() -> [u8; 2] {
        [DISCONNECT << 4, 0]
    }

    #[derive(Debug)]
    pub enum Incoming {
        ConnAck { accepted: bool },
        Publish { topic: String, payload: Vec<u8> },
        PubAck,
        SubAck,
        UnsubAck,
        PingResp,
        Unknown,
    }

    /// Tries to decode one complete control packet from the front of
    /// `buf`. `Ok(None)` means `buf` doesn't yet hold a whole packet.
    pub fn decode_one(buf: &[u8]) -> Result<Option<(Incoming, usize)>, &'static str> {
        if buf.is_empty() {
            return Ok(None);
        }
        let packet_type = buf[0] >> 4;
        let Some((remaining_len, len_field_size)) = decode_remaining_length(&buf[1..]) else {
            return Ok(None);
        };
        let header_len = 1 + len_field_size;
        let total_len = header_len + remaining_len;
        if buf.len() < total_len {
            return Ok(None);
        }
        let body = &buf[header_len..total_len];

        let incoming = match packet_type {
            CONNACK => {
                if body.len() < 2 {
                    return Err("truncated CONNACK");
                }
                Incoming::ConnAck { accepted: body[1] == 0 }
            }
            PUBLISH => {
                let qos = (buf[0] >> 1) & 0x03;
                if body.len() < 2 {
                    return Err("truncated PUBLISH topic length");
                }
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let mut offset = 2 + topic_len;
                if body.len() < offset {
                    return Err("truncated PUBLISH topic");
                }
                let topic = String::from_utf8_lossy(&body[2..offset]).into_owned();
                if qos > 0 {
                    offset += 2;
                }
                if body.len() < offset {
                    return Err("truncated PUBLISH packet id");
                }
                let payload = body[offset..].to_vec();
                Incoming::Publish { topic, payload }
            }
            PUBACK => Incoming::PubAck,
            SUBACK => Incoming::SubAck,
            UNSUBACK => Incoming::UnsubAck,
            PINGRESP => Incoming::PingResp,
            _ => Incoming::Unknown,
        };
        Ok(Some((incoming, total_len)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn connect_then_connack_round_trips_through_decode() {
            let connect = encode_connect("agent-1", "u", "p", 20);
            assert_eq!(connect[0] >> 4, CONNECT);

            let connack = [CONNACK << 4, 2, 0, 0];
            match decode_one(&connack).unwrap() {
                Some((Incoming::ConnAck { accepted: true }, 4)) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }

        #[test]
        fn publish_qos0_round_trips() {
            let pkt = encode_publish("/a/commands", 0, None, b"hi");
            match decode_one(&pkt).unwrap() {
                Some((Incoming::Publish { topic, payload }, n)) => {
                    assert_eq!(topic, "/a/commands");
                    assert_eq!(payload, b"hi");
                    assert_eq!(n, pkt.len());
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        #[test]
        fn publish_qos1_skips_the_packet_id_when_decoding_payload() {
            let pkt = encode_publish("/a/results", 1, Some(7), b"result");
            match decode_one(&pkt).unwrap() {
                Some((Incoming::Publish { topic, payload }, _)) => {
                    assert_eq!(topic, "/a/results");
                    assert_eq!(payload, b"result");
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        #[test]
        fn decode_reports_incomplete_packets_as_none() {
            let pkt = encode_publish("/a/commands", 0, None, b"hi");
            assert!(decode_one(&pkt[..pkt.len() - 1]).unwrap().is_none());
        }

        #[test]
        fn pingreq_is_two_bytes() {
            assert_eq!(encode_pingreq(), [PINGREQ << 4, 0]);
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-memory [`Transport`] for exercising `client::run`'s drain and
    //! dispatch logic without a broker.
    use super::*;
    use std::convert::Infallible;

    #[derive(Default)]
    pub struct FakeTransport {
        pub published: Vec<(String, Qos, Vec<u8>)>,
        pub inbound: VecDeque<Inbound>,
        pub subscriptions: Vec<String>,
    }

    impl Transport for FakeTransport {
        type Error = Infallible;

        fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), Infallible> {
            self.subscriptions.push(topic.to_string());
            Ok(())
        }

        fn unsubscribe(&mut self, _topic: &str) -> Result<(), Infallible> {
            Ok(())
        }

        fn publish(&mut self, topic: &str, qos: Qos, payload: &[u8]) -> Result<(), Infallible> {
            self.published.push((topic.to_string(), qos, payload.to_vec()));
            Ok(())
        }

        fn yield_now(&mut self, _timeout: Duration) -> Result<Inbound, Infallible> {
            Ok(self.inbound.pop_front().unwrap_or(Inbound::Idle))
        }

        fn disconnect(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }
}
