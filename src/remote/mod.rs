//! Remote sync protocol
//!
//! Store events are mirrored to a remote observer as length-prefixed binary
//! packets: `code:u8 ++ length:u32 ++ body`. The code identifies the event
//! kind; the body is a compact binary encoding distinct from the persisted
//! representation. Transport is out of scope: this module only frames and
//! codecs. Decode errors are local to one packet and never invalidate the
//! packets around it.

mod codec;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::events::StoreEvent;
use crate::model::{Session, SessionInfo};

/// Remote protocol version exchanged in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Packet header size: code byte + big-endian body length
pub const PACKET_HEADER_SIZE: usize = 5;

/// Maximum accepted packet body length
pub const BODY_LEN_MAX: u32 = 32 * 1024 * 1024;

/// Packet kind discriminants.
///
/// Values are stable and versioned: once assigned, a code never changes
/// meaning. New codes may be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    /// Handshake: client introduces itself
    ClientHello = 0,
    /// Handshake: server responds
    ServerHello = 1,
    /// Control: stop sending store events
    Pause = 2,
    /// Control: resume sending store events
    Resume = 3,
    /// Keep-alive
    Ping = 6,
    /// A message was logged
    MessageStored = 7,
    /// A network task was created
    TaskCreated = 8,
    /// A network task reported progress
    TaskProgressUpdated = 9,
    /// A network task completed
    TaskCompleted = 10,
}

impl PacketCode {
    /// Parse a packet code byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ClientHello),
            1 => Some(Self::ServerHello),
            2 => Some(Self::Pause),
            3 => Some(Self::Resume),
            6 => Some(Self::Ping),
            7 => Some(Self::MessageStored),
            8 => Some(Self::TaskCreated),
            9 => Some(Self::TaskProgressUpdated),
            10 => Some(Self::TaskCompleted),
            _ => None,
        }
    }
}

/// Handshake document sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Protocol version the client speaks
    pub protocol_version: u32,
    /// Stable device identity
    pub device_id: Uuid,
    /// Application/environment metadata
    pub info: SessionInfo,
    /// The client's current session, if one is active
    #[serde(default)]
    pub session: Option<Session>,
}

/// Handshake document sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Protocol version the server speaks
    pub protocol_version: u32,
}

/// Frame a packet: code byte, big-endian body length, body.
#[must_use]
pub fn encode_packet(code: PacketCode, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + body.len());
    packet.push(code as u8);
    packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
    packet.extend_from_slice(body);
    packet
}

/// Decode one packet: `(code, body)`.
///
/// Bytes past the declared body length are ignored, so a decoder upgraded
/// before its peer keeps working.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the header is truncated, the code unknown,
/// or the declared length out of bounds
pub fn decode_packet(packet: &[u8]) -> std::result::Result<(PacketCode, &[u8]), DecodeError> {
    if packet.len() < PACKET_HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: PACKET_HEADER_SIZE,
            available: packet.len(),
        });
    }

    let code = PacketCode::from_u8(packet[0]).ok_or(DecodeError::UnknownCode(packet[0]))?;
    let len = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
    if len > BODY_LEN_MAX {
        return Err(DecodeError::LengthOutOfBounds(len));
    }

    let end = PACKET_HEADER_SIZE + len as usize;
    if packet.len() < end {
        return Err(DecodeError::Truncated {
            needed: end,
            available: packet.len(),
        });
    }

    Ok((code, &packet[PACKET_HEADER_SIZE..end]))
}

/// Encode a store event as a complete packet.
#[must_use]
pub fn encode_event(event: &StoreEvent) -> Vec<u8> {
    match event {
        StoreEvent::MessageStored(event) => {
            encode_packet(PacketCode::MessageStored, &codec::encode_message_stored(event))
        }
        StoreEvent::NetworkTaskCreated(event) => {
            encode_packet(PacketCode::TaskCreated, &codec::encode_task_created(event))
        }
        StoreEvent::NetworkTaskProgressUpdated(event) => encode_packet(
            PacketCode::TaskProgressUpdated,
            &codec::encode_task_progress(event),
        ),
        StoreEvent::NetworkTaskCompleted(event) => {
            encode_packet(PacketCode::TaskCompleted, &codec::encode_task_completed(event))
        }
    }
}

/// Decode a store event from a packet body.
///
/// # Errors
///
/// Returns a [`DecodeError`] if `code` is not a store-event code or the
/// body is malformed
pub fn decode_event(
    code: PacketCode,
    body: &[u8],
) -> std::result::Result<StoreEvent, DecodeError> {
    match code {
        PacketCode::MessageStored => {
            codec::decode_message_stored(body).map(StoreEvent::MessageStored)
        }
        PacketCode::TaskCreated => {
            codec::decode_task_created(body).map(StoreEvent::NetworkTaskCreated)
        }
        PacketCode::TaskProgressUpdated => {
            codec::decode_task_progress(body).map(StoreEvent::NetworkTaskProgressUpdated)
        }
        PacketCode::TaskCompleted => {
            codec::decode_task_completed(body).map(StoreEvent::NetworkTaskCompleted)
        }
        _ => Err(DecodeError::InvalidValue("store event code")),
    }
}

/// Encode the client handshake packet.
///
/// Handshake bodies are JSON documents: they are rare, small, and benefit
/// from being self-describing across protocol versions.
#[must_use]
pub fn encode_client_hello(hello: &ClientHello) -> Vec<u8> {
    let body = serde_json::to_vec(hello).unwrap_or_default();
    encode_packet(PacketCode::ClientHello, &body)
}

/// Decode the client handshake body.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the document is malformed
pub fn decode_client_hello(body: &[u8]) -> std::result::Result<ClientHello, DecodeError> {
    serde_json::from_slice(body).map_err(|_| DecodeError::InvalidValue("client hello"))
}

/// Encode the server handshake packet.
#[must_use]
pub fn encode_server_hello(hello: &ServerHello) -> Vec<u8> {
    let body = serde_json::to_vec(hello).unwrap_or_default();
    encode_packet(PacketCode::ServerHello, &body)
}

/// Decode the server handshake body.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the document is malformed
pub fn decode_server_hello(body: &[u8]) -> std::result::Result<ServerHello, DecodeError> {
    serde_json::from_slice(body).map_err(|_| DecodeError::InvalidValue("server hello"))
}

/// A packet carved out of a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPacket {
    /// Packet kind
    pub code: PacketCode,
    /// Packet body bytes
    pub body: Vec<u8>,
}

/// Split a buffer into packets.
///
/// Returns the decoded packets (each independently `Ok` or `Err`) and the
/// number of bytes consumed. An incomplete packet at the tail is left
/// unconsumed for the caller to retry once more bytes arrive. An unknown
/// code with a valid length is skipped and splitting continues; a length
/// prefix out of bounds poisons the remainder of this buffer but nothing
/// before it.
#[must_use]
pub fn split_packets(buf: &[u8]) -> (Vec<std::result::Result<OwnedPacket, DecodeError>>, usize) {
    let mut packets = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= PACKET_HEADER_SIZE {
        let code_byte = buf[offset];
        let len = u32::from_be_bytes([
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
            buf[offset + 4],
        ]);

        if len > BODY_LEN_MAX {
            packets.push(Err(DecodeError::LengthOutOfBounds(len)));
            offset = buf.len();
            break;
        }

        let end = offset + PACKET_HEADER_SIZE + len as usize;
        if buf.len() < end {
            break; // incomplete tail, wait for more bytes
        }

        match PacketCode::from_u8(code_byte) {
            Some(code) => packets.push(Ok(OwnedPacket {
                code,
                body: buf[offset + PACKET_HEADER_SIZE..end].to_vec(),
            })),
            None => packets.push(Err(DecodeError::UnknownCode(code_byte))),
        }
        offset = end;
    }

    (packets, offset)
}

/// Incremental packet splitter over a stream of byte chunks.
pub struct PacketFeed {
    buf: Vec<u8>,
}

impl PacketFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Push incoming bytes and return every packet that completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<std::result::Result<OwnedPacket, DecodeError>> {
        self.buf.extend_from_slice(bytes);
        let (packets, consumed) = split_packets(&self.buf);
        self.buf.drain(..consumed);
        packets
    }

    /// Bytes buffered waiting for a complete packet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for PacketFeed {
    fn default() -> Self {
        Self::new()
    }
}
