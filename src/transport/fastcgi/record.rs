//! FastCGI record framing.
//!
//! ```text
//! +---------+------+------------+---------------+---------+----------+
//! | version | type | request id | content length| padding | reserved |
//! |   u8    |  u8  |  u16 (BE)  |   u16 (BE)    |   u8    |    u8    |
//! +---------+------+------------+---------------+---------+----------+
//! | content (content length bytes) | padding (padding bytes)          |
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 65535;

/// Bit in [`BeginRequest::flags`] asking us to keep the socket open.
pub const FLAG_KEEP_CONN: u8 = 1;

pub const ROLE_RESPONDER: u16 = 1;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unsupported FastCGI version {0}")]
    Version(u8),

    #[error("malformed {0} record")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(val: u8) -> Self {
        match val {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }
}

impl RecordType {
    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(other) => other,
        }
    }
}

/// `protocolStatus` of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMultiplex = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

/// Read one record. `Ok(None)` on a clean EOF between records.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    if header[0] != VERSION_1 {
        return Err(FrameError::Version(header[0]));
    }
    let kind = RecordType::from(header[1]);
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut body = vec![0u8; content_len + padding_len];
    reader.read_exact(&mut body).await?;
    body.truncate(content_len);

    Ok(Some(Record {
        kind,
        request_id,
        content: Bytes::from(body),
    }))
}

/// Append records carrying `content`, split at the 64 KiB content limit.
/// Empty content produces one empty record, which ends a stream.
pub fn encode(kind: RecordType, request_id: u16, content: &[u8], out: &mut BytesMut) {
    if content.is_empty() {
        put_record(kind, request_id, &[], out);
        return;
    }
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        put_record(kind, request_id, chunk, out);
    }
}

fn put_record(kind: RecordType, request_id: u16, content: &[u8], out: &mut BytesMut) {
    // Pad content to a multiple of eight bytes.
    let padding = (8 - content.len() % 8) % 8;
    out.reserve(HEADER_LEN + content.len() + padding);
    out.put_u8(VERSION_1);
    out.put_u8(kind.as_u8());
    out.put_u16(request_id);
    out.put_u16(content.len() as u16);
    out.put_u8(padding as u8);
    out.put_u8(0);
    out.put_slice(content);
    out.put_bytes(0, padding);
}

/// BEGIN_REQUEST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> Result<Self, FrameError> {
        if content.len() < 8 {
            return Err(FrameError::Malformed("BEGIN_REQUEST"));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

pub fn end_request_body(app_status: u32, status: ProtocolStatus) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = status as u8;
    body
}

pub fn unknown_type_body(kind: u8) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[0] = kind;
    body
}

/// Decode a name-value pair stream (PARAMS, GET_VALUES).
pub fn parse_pairs(mut content: &[u8]) -> Result<Vec<(String, String)>, FrameError> {
    let mut pairs = Vec::new();
    while !content.is_empty() {
        let name_len = read_length(&mut content)?;
        let value_len = read_length(&mut content)?;
        if content.len() < name_len + value_len {
            return Err(FrameError::Malformed("name-value pair"));
        }
        let name = String::from_utf8_lossy(&content[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&content[name_len..name_len + value_len]).into_owned();
        content = &content[name_len + value_len..];
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn read_length(content: &mut &[u8]) -> Result<usize, FrameError> {
    let first = *content
        .first()
        .ok_or(FrameError::Malformed("name-value pair"))?;
    if first & 0x80 == 0 {
        *content = &content[1..];
        return Ok(first as usize);
    }
    if content.len() < 4 {
        return Err(FrameError::Malformed("name-value pair"));
    }
    let len = u32::from_be_bytes([content[0] & 0x7f, content[1], content[2], content[3]]);
    *content = &content[4..];
    Ok(len as usize)
}

pub fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>, out: &mut BytesMut) {
    for (name, value) in pairs {
        put_length(name.len(), out);
        put_length(value.len(), out);
        out.put_slice(name.as_bytes());
        out.put_slice(value.as_bytes());
    }
}

fn put_length(len: usize, out: &mut BytesMut) {
    if len < 0x80 {
        out.put_u8(len as u8);
    } else {
        out.put_u32(len as u32 | 0x8000_0000);
    }
}
