//! XDR (RFC 4506) wire encoding for the protocol structures the
//! transport itself understands.
//!
//! Procedure payloads pass through the transport untouched; only the
//! packet header, the server error record and the domain event record are
//! encoded or decoded here. XDR is big-endian throughout and aligns every
//! item to a four-byte word.

use crate::error::ServerError;
use crate::packet::{Domain, DomainEvent, Header, PacketStatus, PacketType, UUID_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self, Cursor, Result};

/// XDR aligns every item to this many bytes.
const WORD: usize = 4;

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Zero bytes required after `len` bytes of opaque data.
fn pad_len(len: usize) -> usize {
    (WORD - len % WORD) % WORD
}

// Header type and status travel as plain words. The error names the enum
// so a bad status word is not blamed on the type field.
macro_rules! wire_enum {
    ($enum:ident, $r:expr) => {
        $enum::from_u32(u32::read_xdr($r)?)
            .ok_or_else(|| invalid_data(concat!("unknown ", stringify!($enum), " value")))?
    };
}

/// A value the transport can put on the wire in XDR form.
pub trait XdrEncode {
    /// Append the XDR encoding of `self` to `w`.
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()>;
}

/// A value the transport can recover from its XDR form.
pub trait XdrDecode: Sized {
    /// Consume the XDR encoding of one `Self` from `r`.
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

/// Length-prefixed bytes plus padding, the layout shared by XDR strings
/// and variable-length opaque data.
fn write_opaque<W: WriteBytesExt>(w: &mut W, data: &[u8]) -> Result<()> {
    (data.len() as u32).write_xdr(w)?;
    w.write_all(data)?;
    w.write_all(&[0u8; WORD][..pad_len(data.len())])
}

fn read_opaque<R: ReadBytesExt>(r: &mut R) -> Result<Vec<u8>> {
    let len = u32::read_xdr(r)? as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    let mut pad = [0u8; WORD];
    r.read_exact(&mut pad[..pad_len(len)])?;
    Ok(data)
}

impl XdrEncode for u32 {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(*self)
    }
}

impl XdrDecode for u32 {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<BigEndian>()
    }
}

impl XdrEncode for i32 {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<BigEndian>(*self)
    }
}

impl XdrDecode for i32 {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<BigEndian>()
    }
}

impl XdrEncode for u64 {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<BigEndian>(*self)
    }
}

impl XdrDecode for u64 {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<BigEndian>()
    }
}

impl XdrEncode for u8 {
    // XDR has no narrow integers; a lone byte occupies a whole word
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        u32::from(*self).write_xdr(w)
    }
}

impl XdrDecode for u8 {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let word = u32::read_xdr(r)?;
        u8::try_from(word).map_err(|_| invalid_data("byte word out of range"))
    }
}

impl XdrEncode for bool {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        u32::from(*self).write_xdr(w)
    }
}

impl XdrDecode for bool {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        match u32::read_xdr(r)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(invalid_data("boolean word out of range")),
        }
    }
}

impl XdrEncode for String {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        write_opaque(w, self.as_bytes())
    }
}

impl XdrDecode for String {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        String::from_utf8(read_opaque(r)?).map_err(|_| invalid_data("string is not valid UTF-8"))
    }
}

impl XdrEncode for Vec<u8> {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        write_opaque(w, self)
    }
}

impl XdrDecode for Vec<u8> {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        read_opaque(r)
    }
}

impl XdrEncode for [u8; UUID_SIZE] {
    // Fixed-length opaque data, already word aligned
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        w.write_all(self)
    }
}

impl XdrDecode for [u8; UUID_SIZE] {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut uuid = [0u8; UUID_SIZE];
        r.read_exact(&mut uuid)?;
        Ok(uuid)
    }
}

impl<T: XdrEncode> XdrEncode for Option<T> {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        match self {
            Some(value) => {
                true.write_xdr(w)?;
                value.write_xdr(w)
            }
            None => false.write_xdr(w),
        }
    }
}

impl<T: XdrDecode> XdrDecode for Option<T> {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        if bool::read_xdr(r)? {
            Ok(Some(T::read_xdr(r)?))
        } else {
            Ok(None)
        }
    }
}

impl XdrEncode for Header {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        self.program.write_xdr(w)?;
        self.version.write_xdr(w)?;
        self.procedure.write_xdr(w)?;
        (self.typ as u32).write_xdr(w)?;
        self.serial.write_xdr(w)?;
        (self.status as u32).write_xdr(w)
    }
}

impl XdrDecode for Header {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Header {
            program: u32::read_xdr(r)?,
            version: u32::read_xdr(r)?,
            procedure: u32::read_xdr(r)?,
            typ: wire_enum!(PacketType, r),
            serial: u32::read_xdr(r)?,
            status: wire_enum!(PacketStatus, r),
        })
    }
}

impl XdrEncode for ServerError {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        self.code.write_xdr(w)?;
        self.domain.write_xdr(w)?;
        self.padding.write_xdr(w)?;
        self.message.write_xdr(w)?;
        self.level.write_xdr(w)
    }
}

impl XdrDecode for ServerError {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(ServerError {
            code: u32::read_xdr(r)?,
            domain: u32::read_xdr(r)?,
            padding: u8::read_xdr(r)?,
            message: String::read_xdr(r)?,
            level: u32::read_xdr(r)?,
        })
    }
}

impl XdrEncode for Domain {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        self.name.write_xdr(w)?;
        self.uuid.write_xdr(w)?;
        self.id.write_xdr(w)
    }
}

impl XdrDecode for Domain {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Domain {
            name: String::read_xdr(r)?,
            uuid: <[u8; UUID_SIZE]>::read_xdr(r)?,
            id: i32::read_xdr(r)?,
        })
    }
}

impl XdrEncode for DomainEvent {
    fn write_xdr<W: WriteBytesExt>(&self, w: &mut W) -> Result<()> {
        self.callback_id.write_xdr(w)?;
        self.domain.write_xdr(w)?;
        self.event.write_xdr(w)?;
        self.seconds.write_xdr(w)?;
        self.micros.write_xdr(w)?;
        self.details.write_xdr(w)
    }
}

impl XdrDecode for DomainEvent {
    fn read_xdr<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DomainEvent {
            callback_id: u32::read_xdr(r)?,
            domain: Domain::read_xdr(r)?,
            event: String::read_xdr(r)?,
            seconds: u64::read_xdr(r)?,
            micros: u32::read_xdr(r)?,
            details: Option::read_xdr(r)?,
        })
    }
}

/// XDR-encode a single value into a fresh buffer.
pub fn to_bytes<T: XdrEncode>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.write_xdr(&mut buf)?;
    Ok(buf)
}

/// XDR-decode a single value from the front of a byte slice.
///
/// Trailing bytes are ignored; server records routinely carry fields the
/// transport has no use for.
pub fn from_bytes<T: XdrDecode>(buf: &[u8]) -> Result<T> {
    T::read_xdr(&mut Cursor::new(buf))
}

#[test]
fn words_are_big_endian() {
    assert_eq!(to_bytes(&0xdeadbeefu32).unwrap(), [0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(from_bytes::<u32>(&[0, 0, 0, 42]).unwrap(), 42);
}

#[test]
fn strings_pad_to_word_boundary() {
    let encoded = to_bytes(&"abc".to_owned()).unwrap();
    assert_eq!(encoded, [0, 0, 0, 3, b'a', b'b', b'c', 0]);
    assert_eq!(from_bytes::<String>(&encoded).unwrap(), "abc");

    // already aligned, no padding
    assert_eq!(to_bytes(&"abcd".to_owned()).unwrap().len(), 8);
}

#[test]
fn lone_byte_occupies_a_word() {
    let encoded = to_bytes(&0x7fu8).unwrap();
    assert_eq!(encoded, [0, 0, 0, 0x7f]);
    assert_eq!(from_bytes::<u8>(&encoded).unwrap(), 0x7f);
}

#[test]
fn opaque_roundtrip() {
    let data = vec![1u8, 2, 3, 4, 5];
    let encoded = to_bytes(&data).unwrap();
    // length word + five bytes + three bytes padding
    assert_eq!(encoded.len(), 12);
    assert_eq!(from_bytes::<Vec<u8>>(&encoded).unwrap(), data);
}

#[test]
fn option_carries_presence_word() {
    let present = Some("details".to_owned());
    let encoded = to_bytes(&present).unwrap();
    assert_eq!(from_bytes::<Option<String>>(&encoded).unwrap(), present);

    assert_eq!(to_bytes(&None::<String>).unwrap(), [0, 0, 0, 0]);
    assert_eq!(from_bytes::<Option<String>>(&[0, 0, 0, 0]).unwrap(), None);
}

#[test]
fn header_roundtrip() {
    use crate::packet::{HEADER_SIZE, PROGRAM_REMOTE};

    let expected = Header::new(
        PROGRAM_REMOTE,
        40,
        PacketType::Call,
        0xdead,
        PacketStatus::Ok,
    );

    let buf = to_bytes(&expected).unwrap();
    assert_eq!(buf.len(), HEADER_SIZE);
    assert_eq!(from_bytes::<Header>(&buf).unwrap(), expected);
}

#[test]
fn unknown_type_and_status_name_their_field() {
    let mut bad_type = Vec::new();
    for word in [1u32, 1, 1, 9, 1, 0] {
        word.write_xdr(&mut bad_type).unwrap();
    }
    let err = from_bytes::<Header>(&bad_type).unwrap_err();
    assert!(err.to_string().contains("PacketType"));

    let mut bad_status = Vec::new();
    for word in [1u32, 1, 1, 1, 1, 9] {
        word.write_xdr(&mut bad_status).unwrap();
    }
    let err = from_bytes::<Header>(&bad_status).unwrap_err();
    assert!(err.to_string().contains("PacketStatus"));
}

#[test]
fn server_error_roundtrip() {
    let expected = ServerError {
        code: 42,
        domain: 10,
        padding: 1,
        message: "domain not found".to_owned(),
        level: 2,
    };

    let buf = to_bytes(&expected).unwrap();
    assert_eq!(&buf[..4], &[0, 0, 0, 42]);
    assert_eq!(from_bytes::<ServerError>(&buf).unwrap(), expected);
}

#[test]
fn domain_event_roundtrip() {
    let expected = DomainEvent {
        callback_id: 7,
        domain: Domain {
            name: "worker-01".to_owned(),
            uuid: [0xab; UUID_SIZE],
            id: 3,
        },
        event: "SHUTDOWN".to_owned(),
        seconds: 1_700_000_000,
        micros: 250_000,
        details: Some("guest".to_owned()),
    };

    let actual: DomainEvent = from_bytes(&to_bytes(&expected).unwrap()).unwrap();
    assert_eq!(expected, actual);
}

#[test]
fn trailing_bytes_are_ignored() {
    let mut buf = to_bytes(&0x55u32).unwrap();
    buf.extend_from_slice(&[9, 9, 9, 9]);

    assert_eq!(from_bytes::<u32>(&buf).unwrap(), 0x55);
}
