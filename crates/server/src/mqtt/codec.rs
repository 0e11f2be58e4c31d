//! MQTT 3.1.1 packet framing.
//!
//! Only the packets a read-only QoS 0 broker needs are understood; anything
//! else is a protocol error and ends the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strum::{Display, EnumDiscriminants};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

/// Largest value the remaining-length varint can express
const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("packet of {0} bytes exceeds the limit")]
    PacketTooLarge(usize),

    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    #[error("invalid fixed header flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("invalid QoS level {0}")]
    InvalidQos(u8),

    #[error("reserved connect flag set")]
    ReservedConnectFlag,

    #[error("unknown connect return code {0}")]
    UnknownReturnCode(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("packet body ended early")]
    Truncated,

    #[error("subscription packet without topic filters")]
    NoTopicFilters,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUsernameOrPassword,
            5 => Self::NotAuthorized,
            other => return Err(ProtocolError::UnknownReturnCode(other)),
        })
    }
}

/// SUBACK return code for a refused filter
pub const SUBSCRIPTION_FAILURE: u8 = 0x80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub client_id: String,
    pub clean_session: bool,
    /// Seconds; 0 disables the keep-alive
    pub keep_alive: u16,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
}

impl Publish {
    /// Fire-and-forget publish
    pub fn at_most_once(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filter and requested QoS
    pub filters: Vec<(String, u8)>,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(PacketType), derive(Display))]
pub enum Packet {
    Connect(Connect),
    ConnAck {
        session_present: bool,
        code: ConnectReturnCode,
    },
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

/// Take one complete packet off the front of `buf`, or `None` if more bytes
/// are needed
pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let Some((remaining, length_bytes)) = remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    if remaining > max_packet_size {
        return Err(ProtocolError::PacketTooLarge(remaining));
    }
    let header = 1 + length_bytes;
    if buf.len() < header + remaining {
        return Ok(None);
    }

    buf.advance(header);
    let mut body = buf.split_to(remaining).freeze();
    parse(first >> 4, first & 0x0f, &mut body).map(Some)
}

fn remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in bytes.iter().take(4).enumerate() {
        value += usize::from(byte & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        Err(ProtocolError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

fn parse(packet_type: u8, flags: u8, body: &mut Bytes) -> Result<Packet, ProtocolError> {
    let expect_flags = |expected: u8| {
        if flags == expected {
            Ok(())
        } else {
            Err(ProtocolError::InvalidFlags { packet_type, flags })
        }
    };

    match packet_type {
        1 => {
            expect_flags(0)?;
            parse_connect(body).map(Packet::Connect)
        }
        2 => {
            expect_flags(0)?;
            let session_present = read_u8(body)? & 0x01 != 0;
            let code = ConnectReturnCode::try_from(read_u8(body)?)?;
            Ok(Packet::ConnAck {
                session_present,
                code,
            })
        }
        3 => parse_publish(flags, body).map(Packet::Publish),
        8 => {
            expect_flags(0b0010)?;
            let packet_id = read_u16(body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(body)?;
                let qos = read_u8(body)?;
                if qos > 2 {
                    return Err(ProtocolError::InvalidQos(qos));
                }
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(ProtocolError::NoTopicFilters);
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
        }
        9 => {
            expect_flags(0)?;
            let packet_id = read_u16(body)?;
            let codes = body.split_to(body.len()).to_vec();
            Ok(Packet::SubAck { packet_id, codes })
        }
        10 => {
            expect_flags(0b0010)?;
            let packet_id = read_u16(body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(body)?);
            }
            if filters.is_empty() {
                return Err(ProtocolError::NoTopicFilters);
            }
            Ok(Packet::Unsubscribe { packet_id, filters })
        }
        11 => {
            expect_flags(0)?;
            Ok(Packet::UnsubAck {
                packet_id: read_u16(body)?,
            })
        }
        12 => expect_flags(0).map(|_| Packet::PingReq),
        13 => expect_flags(0).map(|_| Packet::PingResp),
        14 => expect_flags(0).map(|_| Packet::Disconnect),
        other => Err(ProtocolError::UnsupportedPacketType(other)),
    }
}

fn parse_connect(body: &mut Bytes) -> Result<Connect, ProtocolError> {
    let protocol_name = read_string(body)?;
    let protocol_level = read_u8(body)?;
    let flags = read_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::ReservedConnectFlag);
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    let will = if flags & 0x04 != 0 {
        Some(LastWill {
            topic: read_string(body)?,
            message: read_bytes(body)?,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_bytes(body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        will,
        username,
        password,
    })
}

fn parse_publish(flags: u8, body: &mut Bytes) -> Result<Publish, ProtocolError> {
    let qos = (flags >> 1) & 0b11;
    if qos == 3 {
        return Err(ProtocolError::InvalidQos(qos));
    }
    let topic = read_string(body)?;
    let packet_id = if qos > 0 { Some(read_u16(body)?) } else { None };
    Ok(Publish {
        topic,
        payload: body.split_to(body.len()),
        qos,
        retain: flags & 0x01 != 0,
        dup: flags & 0x08 != 0,
        packet_id,
    })
}

fn read_u8(body: &mut Bytes) -> Result<u8, ProtocolError> {
    if body.remaining() < 1 {
        return Err(ProtocolError::Truncated);
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, ProtocolError> {
    if body.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    Ok(body.get_u16())
}

fn read_bytes(body: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = usize::from(read_u16(body)?);
    if body.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(read_bytes(body)?.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Append the wire form of `packet` to `out`
pub fn encode(packet: &Packet, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    let header: u8 = match packet {
        Packet::Connect(connect) => {
            write_string(&mut body, &connect.protocol_name);
            body.put_u8(connect.protocol_level);
            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if connect.will.is_some() {
                flags |= 0x04;
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive);
            write_string(&mut body, &connect.client_id);
            if let Some(will) = &connect.will {
                write_string(&mut body, &will.topic);
                write_bytes(&mut body, &will.message);
            }
            if let Some(username) = &connect.username {
                write_string(&mut body, username);
            }
            if let Some(password) = &connect.password {
                write_bytes(&mut body, password);
            }
            0x10
        }
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(*code as u8);
            0x20
        }
        Packet::Publish(publish) => {
            write_string(&mut body, &publish.topic);
            if let Some(packet_id) = publish.packet_id {
                body.put_u16(packet_id);
            }
            body.extend_from_slice(&publish.payload);
            0x30 | (u8::from(publish.dup) << 3) | (publish.qos << 1) | u8::from(publish.retain)
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                write_string(&mut body, filter);
                body.put_u8(*qos);
            }
            0x82
        }
        Packet::SubAck { packet_id, codes } => {
            body.put_u16(*packet_id);
            body.extend_from_slice(codes);
            0x90
        }
        Packet::Unsubscribe { packet_id, filters } => {
            body.put_u16(*packet_id);
            for filter in filters {
                write_string(&mut body, filter);
            }
            0xa2
        }
        Packet::UnsubAck { packet_id } => {
            body.put_u16(*packet_id);
            0xb0
        }
        Packet::PingReq => 0xc0,
        Packet::PingResp => 0xd0,
        Packet::Disconnect => 0xe0,
    };

    out.reserve(5 + body.len());
    out.put_u8(header);
    write_remaining_length(out, body.len().min(MAX_REMAINING_LENGTH));
    out.extend_from_slice(&body);
}

/// Encode into a standalone buffer
pub fn to_bytes(packet: &Packet) -> Bytes {
    let mut out = BytesMut::new();
    encode(packet, &mut out);
    out.freeze()
}

fn write_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn write_bytes(out: &mut BytesMut, bytes: &[u8]) {
    let len = bytes.len().min(usize::from(u16::MAX));
    out.put_u16(len as u16);
    out.extend_from_slice(&bytes[..len]);
}

fn write_string(out: &mut BytesMut, value: &str) {
    write_bytes(out, value.as_bytes());
}
