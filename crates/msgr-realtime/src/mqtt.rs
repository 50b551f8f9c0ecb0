//! MQTT 3.1 packet codec — the envelope carried inside WebSocket frames.
//!
//! Only the packets the realtime stream exchanges are supported. Each
//! WebSocket binary message carries exactly one packet.

use msgr_core::{Error, Result};

pub const PROTOCOL_NAME: &str = "MQIsdp";
pub const PROTOCOL_LEVEL: u8 = 3;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_CLEAN_SESSION: u8 = 0x02;

/// CONNACK return codes that mean the credentials were refused.
pub const CONNACK_BAD_CREDENTIALS: u8 = 4;
pub const CONNACK_NOT_AUTHORIZED: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: String,
    pub keep_alive: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    /// Present when `qos > 0`.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl Publish {
    pub fn new(topic: &str, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_string(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
            payload,
        }
    }

    pub fn with_qos1(mut self, packet_id: u16) -> Self {
        self.qos = 1;
        self.packet_id = Some(packet_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, return_code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, topics: Vec<(String, u8)> },
    SubAck { packet_id: u16, granted: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck { .. } => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck { .. } => "PUBACK",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::SubAck { .. } => "SUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }

    // ---------------------------------------------------------------
    // Encoding
    // ---------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let header = match self {
            Self::Connect(c) => {
                put_str(&mut body, PROTOCOL_NAME);
                body.push(PROTOCOL_LEVEL);
                let mut flags = FLAG_USERNAME;
                if c.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                body.push(flags);
                body.extend_from_slice(&c.keep_alive.to_be_bytes());
                put_str(&mut body, &c.client_id);
                put_str(&mut body, &c.username);
                CONNECT << 4
            }
            Self::ConnAck {
                session_present,
                return_code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*return_code);
                CONNACK << 4
            }
            Self::Publish(p) => {
                put_str(&mut body, &p.topic);
                if p.qos > 0 {
                    body.extend_from_slice(&p.packet_id.unwrap_or(0).to_be_bytes());
                }
                body.extend_from_slice(&p.payload);
                (PUBLISH << 4)
                    | (u8::from(p.dup) << 3)
                    | ((p.qos & 0x03) << 1)
                    | u8::from(p.retain)
            }
            Self::PubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                PUBACK << 4
            }
            Self::Subscribe { packet_id, topics } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for (topic, qos) in topics {
                    put_str(&mut body, topic);
                    body.push(*qos);
                }
                (SUBSCRIBE << 4) | 0x02
            }
            Self::SubAck { packet_id, granted } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                body.extend_from_slice(granted);
                SUBACK << 4
            }
            Self::PingReq => PINGREQ << 4,
            Self::PingResp => PINGRESP << 4,
            Self::Disconnect => DISCONNECT << 4,
        };

        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(header);
        put_remaining_length(&mut out, body.len());
        out.extend_from_slice(&body);
        out
    }

    // ---------------------------------------------------------------
    // Decoding
    // ---------------------------------------------------------------

    /// Decode one complete packet. Trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        let (&header, rest) = bytes
            .split_first()
            .ok_or_else(|| protocol("empty frame"))?;
        let (length, consumed) = read_remaining_length(rest)?;
        let body = &rest[consumed..];
        if body.len() != length {
            return Err(protocol(&format!(
                "length mismatch: header says {}, frame has {}",
                length,
                body.len()
            )));
        }

        let mut r = Reader { buf: body, pos: 0 };
        let packet = match header >> 4 {
            CONNECT => {
                let name = r.string()?;
                if name != PROTOCOL_NAME && name != "MQTT" {
                    return Err(protocol(&format!("unknown protocol {}", name)));
                }
                let _level = r.u8()?;
                let flags = r.u8()?;
                let keep_alive = r.u16()?;
                let client_id = r.string()?;
                let username = if flags & FLAG_USERNAME != 0 {
                    r.string()?
                } else {
                    String::new()
                };
                Packet::Connect(Connect {
                    client_id,
                    username,
                    keep_alive,
                    clean_session: flags & FLAG_CLEAN_SESSION != 0,
                })
            }
            CONNACK => Packet::ConnAck {
                session_present: r.u8()? & 0x01 != 0,
                return_code: r.u8()?,
            },
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                if qos > 2 {
                    return Err(protocol("invalid QoS 3"));
                }
                let topic = r.string()?;
                let packet_id = if qos > 0 { Some(r.u16()?) } else { None };
                Packet::Publish(Publish {
                    topic,
                    qos,
                    retain: header & 0x01 != 0,
                    dup: header & 0x08 != 0,
                    packet_id,
                    payload: r.rest().to_vec(),
                })
            }
            PUBACK => Packet::PubAck {
                packet_id: r.u16()?,
            },
            SUBSCRIBE => {
                let packet_id = r.u16()?;
                let mut topics = Vec::new();
                while !r.is_empty() {
                    let topic = r.string()?;
                    topics.push((topic, r.u8()?));
                }
                Packet::Subscribe { packet_id, topics }
            }
            SUBACK => Packet::SubAck {
                packet_id: r.u16()?,
                granted: r.rest().to_vec(),
            },
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            other => return Err(protocol(&format!("unsupported packet type {}", other))),
        };

        if !r.is_empty() {
            return Err(protocol(&format!("trailing bytes after {}", packet.name())));
        }
        Ok(packet)
    }
}

fn protocol(msg: &str) -> Error {
    Error::Protocol(format!("MQTT: {}", msg))
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&bytes[..len]);
}

fn put_remaining_length(out: &mut Vec<u8>, mut len: usize) {
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

fn read_remaining_length(buf: &[u8]) -> Result<(usize, usize)> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, &byte) in buf.iter().enumerate().take(4) {
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
    }
    Err(protocol("malformed remaining length"))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(protocol("truncated packet"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| protocol("string is not UTF-8"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_layout() {
        let packet = Packet::Connect(Connect {
            client_id: "mqttwsclient".into(),
            username: r#"{"u":"1"}"#.into(),
            keep_alive: 10,
            clean_session: true,
        });
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0x10);
        // Protocol name follows the two-byte length.
        assert_eq!(&bytes[2..4], &[0x00, 0x06]);
        assert_eq!(&bytes[4..10], b"MQIsdp");
        assert_eq!(bytes[10], 3);
        assert_eq!(bytes[11], 0x82);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_fixed_packets() {
        assert_eq!(Packet::PingReq.encode(), vec![0xC0, 0x00]);
        assert_eq!(Packet::PingResp.encode(), vec![0xD0, 0x00]);
        assert_eq!(Packet::Disconnect.encode(), vec![0xE0, 0x00]);
        assert_eq!(Packet::decode(&[0xD0, 0x00]).unwrap(), Packet::PingResp);
    }

    #[test]
    fn test_publish_flags_and_long_payload() {
        let payload = vec![b'x'; 300];
        let packet = Packet::Publish(Publish::new("/t_ms", payload.clone()).with_qos1(7));
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0x32);
        // 300 + 2 + 5 + 2 = 309 needs two length bytes.
        assert_eq!(&bytes[1..3], &[0xB5, 0x02]);
        match Packet::decode(&bytes).unwrap() {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "/t_ms");
                assert_eq!(p.qos, 1);
                assert_eq!(p.packet_id, Some(7));
                assert_eq!(p.payload, payload);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_layout() {
        let packet = Packet::Subscribe {
            packet_id: 1,
            topics: vec![("/t_ms".into(), 0), ("/orca_presence".into(), 0)],
        };
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Packet::decode(&[]), Err(Error::Protocol(_))));
        assert!(Packet::decode(&[0x30, 0x05, 0x00]).is_err());
        assert!(Packet::decode(&[0xF0, 0x00]).is_err());
        assert!(Packet::decode(&[0x20, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(Packet::decode(&[0x20, 0x03, 0x00, 0x00, 0x00]).is_err());
        assert!(Packet::decode(b"{\"not\":\"mqtt\"}").is_err());
    }
}
