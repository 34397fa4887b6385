//! libvirt RPC protocol data types and constants.
//!
//! # Protocol
//! libvirt remote protocol, version 1

use bytes::Bytes;
use enum_primitive::*;
use tokio_util::codec::LengthDelimitedCodec;

/// Program number of the main libvirt remote protocol
pub const PROGRAM_REMOTE: u32 = 0x2000_8086;

/// Program number of the QEMU extension protocol
pub const PROGRAM_QEMU: u32 = 0x2000_8087;

/// Protocol version expected by client and server
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the length prefix, in bytes
///
/// The prefix is a big-endian u32 counting the whole packet, itself
/// included.
pub const PACKET_LENGTH_SIZE: usize = 4;

/// Size of the fixed packet header, in bytes
///
/// program[4] version[4] procedure[4] type[4] serial[4] status[4]
pub const HEADER_SIZE: usize = 24;

/// Maximum packet size accepted on the wire, length prefix included
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Largest stream chunk carried by a single packet
///
/// Keeps the whole packet, length prefix included, within the 4 MiB limit
/// enforced by the libvirt server.
pub const STREAM_CHUNK_MAX: usize = MAX_PACKET_SIZE - PACKET_LENGTH_SIZE - HEADER_SIZE;

/// Size of a raw domain UUID
pub const UUID_SIZE: usize = 16;

/*
 * QEMU extension procedures the transport itself knows about
 */
/// Stop delivery of monitor events for one callback id
pub const QEMU_PROC_CONNECT_DOMAIN_MONITOR_EVENT_DEREGISTER: u32 = 5;

/// Asynchronous domain monitor event notification
pub const QEMU_PROC_DOMAIN_MONITOR_EVENT: u32 = 6;

enum_from_primitive! {
    #[doc = "Packet type, the role a packet plays in an exchange"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum PacketType {
        // Request made by a client
        Call = 0,
        // Server reply to a call
        Reply,
        // Asynchronous notification
        Message,
        // Stream data packet belonging to an ongoing call
        Stream,
        // Call whose arguments carry file descriptors
        CallWithFDs,
        // Reply whose results carry file descriptors
        ReplyWithFDs,
    }
}

enum_from_primitive! {
    #[doc = "Packet status; its meaning depends on the packet type"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum PacketStatus {
        // Always set on calls and events. On replies, the method
        // completed; on streams, confirmation of end of stream.
        Ok = 0,
        // On replies, the method failed and the payload is an error
        // record; on streams, the stream was aborted.
        Error,
        // Only used for streams: further data packets follow.
        Continue,
    }
}

/// Fixed header carried by every packet
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Program identifier
    pub program: u32,
    /// Program version
    pub version: u32,
    /// Procedure within the program
    pub procedure: u32,
    /// Packet type, e.g. `Reply`
    pub typ: PacketType,
    /// Caller-assigned serial number correlating replies with calls
    pub serial: u32,
    /// Packet status, e.g. `Ok`
    pub status: PacketStatus,
}

impl Header {
    pub fn new(
        program: u32,
        procedure: u32,
        typ: PacketType,
        serial: u32,
        status: PacketStatus,
    ) -> Header {
        Header {
            program,
            version: PROTOCOL_VERSION,
            procedure,
            typ,
            serial,
            status,
        }
    }
}

/// Reply delivered to the task owning a call serial
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Raw payload, still XDR-encoded
    pub payload: Bytes,
    /// Status carried by the reply header
    pub status: PacketStatus,
}

/// A guest domain as named by event notifications
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub uuid: [u8; UUID_SIZE],
    pub id: i32,
}

/// QEMU domain monitor event
///
/// Routed to subscribers by `callback_id`, the identifier the server
/// assigned when the subscription was registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEvent {
    pub callback_id: u32,
    pub domain: Domain,
    /// Name of the monitor event
    pub event: String,
    pub seconds: u64,
    pub micros: u32,
    pub details: Option<String>,
}

/// Build the frame codec used on the wire
///
/// The length field is big-endian and counts itself, so a frame handed to
/// upper layers is exactly `header + payload`.
pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_offset(0)
        .length_field_length(PACKET_LENGTH_SIZE)
        .length_adjustment(-(PACKET_LENGTH_SIZE as isize))
        .max_frame_length(MAX_PACKET_SIZE)
        .new_codec()
}

#[test]
fn packet_type_from_wire1() {
    use num_traits::FromPrimitive;

    assert_eq!(PacketType::from_u32(0), Some(PacketType::Call));
    assert_eq!(PacketType::from_u32(3), Some(PacketType::Stream));
    assert_eq!(PacketType::from_u32(6), None);
    assert_eq!(PacketStatus::from_u32(2), Some(PacketStatus::Continue));
    assert_eq!(PacketStatus::from_u32(3), None);
}

#[test]
fn frame_length_includes_itself() {
    use bytes::BytesMut;
    use tokio_util::codec::Encoder;

    let mut codec = codec();
    let mut wire = BytesMut::new();
    codec
        .encode(Bytes::from_static(b"\x01\x02\x03"), &mut wire)
        .unwrap();

    assert_eq!(&wire[..], &[0, 0, 0, 7, 1, 2, 3]);
}

#[test]
fn frame_roundtrip1() {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    let body: Vec<u8> = (0..48).collect();

    let mut codec = codec();
    let mut wire = BytesMut::new();
    codec
        .encode(Bytes::copy_from_slice(&body), &mut wire)
        .unwrap();

    let frame = codec.decode(&mut wire).unwrap().unwrap();
    assert_eq!(&frame[..], &body[..]);
    assert!(wire.is_empty());
}
