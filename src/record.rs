//! record -- FCGI record framing.
//!
//! One record is an 8-byte header, then content, then padding.
//!
//! ```text
//! version:1  type:1  request_id:2  content_length:2  padding_length:1  reserved:1
//! ```
//!
//! All multi-byte fields are big-endian.
//!
//! Ref: https://www.mit.edu/~yandros/doc/specs/fcgi-spec.html
//
use crate::error::FcgiError;
use crate::transport::{Transport, read_exactly};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::time::Duration;

/// Protocol version. The only one there is.
pub const FCGI_VERSION_1: u8 = 1;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = 0xFFFF;

/// Type of FCGI record.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
    /// Extended stdin. Content is a 4-byte size of a raw stream that follows.
    XStdin = 50,
}

/// Role from BEGIN_REQUEST. Only Responder gets real use.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Respond and execute commands
    Responder = 1,
    /// Authorization
    Authorizer = 2,
    /// Filter
    Filter = 3,
}

/// Protocol status in END_REQUEST.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Normal
    RequestComplete = 0,
    /// Saw more than one ID
    CantMultiplex = 1,
    Overloaded = 2,
    /// Something other than Responder.
    UnknownRole = 3,
}

/// FCGI header record, deserialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    /// Raw record type. See `RecordType`.
    pub rec_type: u8,
    pub request_id: u16,
    /// Length of content, in bytes.
    pub content_length: u16,
    /// Length of padding, in bytes. Read but never used.
    pub padding_length: u8,
    /// For unlikely future extension.
    pub reserved: u8,
}

impl RecordHeader {
    /// Length of header
    pub const LENGTH: usize = 8;

    /// Deserialize 8 bytes to an FCGI header.
    pub fn from_bytes(b: &[u8; 8]) -> RecordHeader {
        RecordHeader {
            version: b[0],
            rec_type: b[1],
            request_id: u16::from_be_bytes([b[2], b[3]]),
            content_length: u16::from_be_bytes([b[4], b[5]]),
            padding_length: b[6],
            reserved: b[7],
        }
    }

    /// Serialize an FCGI header to 8 bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let id_bytes = self.request_id.to_be_bytes();
        let content_length_bytes = self.content_length.to_be_bytes();
        [
            self.version,
            self.rec_type,
            id_bytes[0],
            id_bytes[1],
            content_length_bytes[0],
            content_length_bytes[1],
            self.padding_length,
            self.reserved,
        ]
    }

    /// Known record type, if any.
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.rec_type)
    }
}

/// Padding needed to round `content_length` up to the next multiple of 8.
pub fn calc_padding_length(content_length: usize) -> u8 {
    ((8 - (content_length & 0x7)) & 0x7) as u8
}

/// One header and its data. Input is a stream of these.
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Vec<u8>,
    pub padding: Vec<u8>,
}

impl Record {
    /// Read one record. Header, content and padding are each one read step
    /// with its own `timeout`. Any failure fails the whole record.
    pub fn read_from<T: Transport + ?Sized>(
        stream: &mut T,
        timeout: Duration,
    ) -> Result<Record, FcgiError> {
        let mut header_bytes = [0u8; RecordHeader::LENGTH];
        read_exactly(stream, &mut header_bytes, timeout)?;
        let header = RecordHeader::from_bytes(&header_bytes);
        log::debug!("FCGI header: {:?}", header);
        if header.version != FCGI_VERSION_1 {
            log::warn!(
                "FCGI version {} in record header, expected {}",
                header.version,
                FCGI_VERSION_1
            );
        }
        let mut content = vec![0; header.content_length as usize];
        if !content.is_empty() {
            read_exactly(stream, &mut content, timeout)?;
        }
        let mut padding = vec![0; header.padding_length as usize];
        if !padding.is_empty() {
            read_exactly(stream, &mut padding, timeout)?;
        }
        Ok(Record {
            header,
            content,
            padding,
        })
    }

    /// Known record type, if any.
    pub fn record_type(&self) -> Option<RecordType> {
        self.header.record_type()
    }

    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }
}

/// Append one complete record, padded to a multiple of 8, to `out`.
///
/// `content` must fit in one record. Callers split larger data first.
pub fn encode_record(out: &mut Vec<u8>, rec_type: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LENGTH);
    let padding_length = calc_padding_length(content.len());
    let header = RecordHeader {
        version: FCGI_VERSION_1,
        rec_type: rec_type as u8,
        request_id,
        content_length: content.len() as u16,
        padding_length,
        reserved: 0,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(content);
    out.resize(out.len() + padding_length as usize, 0);
}

#[test]
fn header_round_trip() {
    let header = RecordHeader {
        version: 1,
        rec_type: RecordType::Params as u8,
        request_id: 0x1234,
        content_length: 0xABCD,
        padding_length: 3,
        reserved: 0,
    };
    let bytes = header.to_bytes();
    assert_eq!(bytes, [1, 4, 0x12, 0x34, 0xAB, 0xCD, 3, 0]);
    assert_eq!(RecordHeader::from_bytes(&bytes), header);
    assert_eq!(header.record_type(), Some(RecordType::Params));
}

#[test]
fn padding_lengths() {
    assert_eq!(calc_padding_length(0), 0);
    assert_eq!(calc_padding_length(1), 7);
    assert_eq!(calc_padding_length(8), 0);
    assert_eq!(calc_padding_length(13), 3);
    assert_eq!(calc_padding_length(MAX_CONTENT_LENGTH), 1);
}

#[test]
fn read_record_with_padding() {
    use crate::transport::MockStream;
    let mut wire = Vec::new();
    encode_record(&mut wire, RecordType::Stdin, 7, b"hello");
    assert_eq!(wire.len(), 16);
    let mut stream = MockStream::new(wire).trickle(2);
    let rec = Record::read_from(&mut stream, Duration::from_secs(1)).expect("read failed");
    assert_eq!(rec.record_type(), Some(RecordType::Stdin));
    assert_eq!(rec.request_id(), 7);
    assert_eq!(rec.content, b"hello");
    assert_eq!(rec.padding, vec![0; 3]);
}

#[test]
fn read_record_unknown_type_kept() {
    use crate::transport::MockStream;
    let header = RecordHeader {
        version: 1,
        rec_type: 99,
        request_id: 1,
        content_length: 0,
        padding_length: 0,
        reserved: 0,
    };
    let mut stream = MockStream::new(header.to_bytes().to_vec());
    let rec = Record::read_from(&mut stream, Duration::from_secs(1)).expect("read failed");
    assert_eq!(rec.header.rec_type, 99);
    assert_eq!(rec.record_type(), None);
}

#[test]
fn read_record_truncated_content_fails() {
    use crate::transport::MockStream;
    let mut wire = Vec::new();
    encode_record(&mut wire, RecordType::Params, 1, b"0123456789");
    wire.truncate(12);
    let mut stream = MockStream::new(wire);
    assert!(matches!(
        Record::read_from(&mut stream, Duration::from_secs(1)),
        Err(FcgiError::ConnectionClosed)
    ));
    let mut wire = Vec::new();
    encode_record(&mut wire, RecordType::Params, 1, b"0123456789");
    wire.truncate(12);
    let mut stream = MockStream::new(wire).stalling();
    assert!(matches!(
        Record::read_from(&mut stream, Duration::from_secs(1)),
        Err(FcgiError::Timeout)
    ));
}
