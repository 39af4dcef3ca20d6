//! # Memcached Text Protocol
//!
//! Purpose: Encode storage/retrieval commands and parse server replies,
//! keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed line by line with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Data blocks are read by length, never scanned.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ClientError, ClientResult};

/// Longest key memcached accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Largest item memcached can be configured to hold (`-I 1024m`).
pub const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

/// Initial buffer for a data block; larger blocks grow as bytes arrive.
const DATA_CHUNK: usize = 64 * 1024;

/// Flag stored alongside plain text values.
pub const FLAG_TEXT: u32 = 0;
/// Flag stored alongside JSON records.
pub const FLAG_JSON: u32 = 1;
/// Flag stored alongside JSON lists.
pub const FLAG_LIST: u32 = 2;

/// Reply to a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReply {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

/// One item returned by a retrieval command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub flags: u32,
    pub data: Vec<u8>,
}

/// Checks a key against memcached's text-protocol rules.
pub fn validate_key(key: &str) -> ClientResult<()> {
    let bytes = key.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.len() <= MAX_KEY_LEN
        && bytes.iter().all(|&b| b > b' ' && b != 0x7f);
    if valid {
        Ok(())
    } else {
        Err(ClientError::InvalidKey {
            key: key.to_string(),
        })
    }
}

/// Encodes `set <key> <flags> <exptime> <bytes>` followed by the data block.
pub fn encode_set(key: &str, flags: u32, exptime: u32, data: &[u8], out: &mut BytesMut) {
    out.reserve(key.len() + data.len() + 48);
    out.put_slice(b"set ");
    out.put_slice(key.as_bytes());
    out.put_slice(format!(" {} {} {}\r\n", flags, exptime, data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Encodes `get <key>`.
pub fn encode_get(key: &str, out: &mut BytesMut) {
    out.reserve(key.len() + 6);
    out.put_slice(b"get ");
    out.put_slice(key.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encodes `gat <exptime> <key>`, which fetches and refreshes expiry.
pub fn encode_gat(exptime: u32, key: &str, out: &mut BytesMut) {
    out.reserve(key.len() + 18);
    out.put_slice(format!("gat {} ", exptime).as_bytes());
    out.put_slice(key.as_bytes());
    out.put_slice(b"\r\n");
}

/// Reads the single-line reply to a storage command.
pub async fn read_store_reply<R>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<StoreReply>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader, line_buf).await?;
    match line_buf.as_slice() {
        b"STORED" => Ok(StoreReply::Stored),
        b"NOT_STORED" => Ok(StoreReply::NotStored),
        b"EXISTS" => Ok(StoreReply::Exists),
        b"NOT_FOUND" => Ok(StoreReply::NotFound),
        line => Err(error_reply(line)),
    }
}

/// Reads the reply to a single-key `get`/`gat` for `key`.
///
/// Returns `Ok(None)` on a bare `END` (cache miss).
pub async fn read_item<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    key: &str,
) -> ClientResult<Option<Item>>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader, line_buf).await?;
    if line_buf.as_slice() == b"END" {
        return Ok(None);
    }
    if !line_buf.starts_with(b"VALUE ") {
        return Err(error_reply(line_buf.as_slice()));
    }

    let (flags, len) = parse_value_header(&line_buf[6..], key)?;
    let mut data = Vec::with_capacity(len.min(DATA_CHUNK));
    let read = (&mut *reader).take(len as u64).read_to_end(&mut data).await?;
    if read != len {
        return Err(ClientError::Protocol("truncated data block"));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol("data block not terminated by CRLF"));
    }

    read_line(reader, line_buf).await?;
    if line_buf.as_slice() != b"END" {
        // A single-key request must yield exactly one item.
        return Err(ClientError::UnexpectedResponse);
    }
    Ok(Some(Item { flags, data }))
}

/// Parses `<key> <flags> <bytes> [<cas unique>]`.
fn parse_value_header(rest: &[u8], expected_key: &str) -> ClientResult<(u32, usize)> {
    let mut fields = rest.split(|&b| b == b' ').filter(|field| !field.is_empty());
    let key = fields.next().ok_or(ClientError::Protocol("VALUE line missing key"))?;
    if key != expected_key.as_bytes() {
        // A reply to some earlier request; the stream is out of sync.
        return Err(ClientError::UnexpectedResponse);
    }
    let flags = fields
        .next()
        .ok_or(ClientError::Protocol("VALUE line missing flags"))
        .and_then(parse_u64)?;
    let len = fields
        .next()
        .ok_or(ClientError::Protocol("VALUE line missing length"))
        .and_then(parse_u64)?;
    let flags = u32::try_from(flags).map_err(|_| ClientError::Protocol("flags out of range"))?;
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_VALUE_LEN)
        .ok_or(ClientError::Protocol("value too large"))?;
    Ok((flags, len))
}

fn error_reply(line: &[u8]) -> ClientError {
    if line == b"ERROR" {
        return ClientError::Server {
            message: "unknown command".to_string(),
        };
    }
    if let Some(message) = line.strip_prefix(b"SERVER_ERROR ") {
        return ClientError::Server {
            message: String::from_utf8_lossy(message).into_owned(),
        };
    }
    if let Some(message) = line.strip_prefix(b"CLIENT_ERROR ") {
        return ClientError::Request {
            message: String::from_utf8_lossy(message).into_owned(),
        };
    }
    ClientError::UnexpectedResponse
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).await?;
    if bytes == 0 {
        return Err(ClientError::Protocol("connection closed by server"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol("line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_u64(data: &[u8]) -> ClientResult<u64> {
    if data.is_empty() {
        return Err(ClientError::Protocol("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol("invalid digit"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(ClientError::Protocol("number overflow"))?;
    }
    Ok(value)
}
