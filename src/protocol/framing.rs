use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EdgeError, Result};

/// Maximum message size (1GB) - prevents memory exhaustion from malformed length fields
/// This is more than enough.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Maximum startup packet size. Startup packets carry a short parameter list;
/// anything larger is a confused client.
pub const MAX_STARTUP_SIZE: usize = 10_000;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// SSLRequest sentinel sent in place of a protocol version.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// CancelRequest sentinel sent in place of a protocol version.
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// A tagged message read by a client from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

impl BackendMessage {
    /// Returns true if this is an ErrorResponse ('E')
    #[inline]
    pub fn is_error(&self) -> bool {
        self.tag == b'E'
    }

    /// Returns true if this is a ReadyForQuery ('Z')
    #[inline]
    pub fn is_ready_for_query(&self) -> bool {
        self.tag == b'Z'
    }

    /// Returns true if this is CopyBothResponse ('W')
    #[inline]
    pub fn is_copy_both_response(&self) -> bool {
        self.tag == b'W'
    }

    /// Returns true if this is CopyData ('d')
    #[inline]
    pub fn is_copy_data(&self) -> bool {
        self.tag == b'd'
    }

    /// Returns true if this is AuthenticationRequest ('R')
    #[inline]
    pub fn is_auth_request(&self) -> bool {
        self.tag == b'R'
    }
}

/// A tagged message read by the server from a client. Same framing as
/// [`BackendMessage`]; kept as a distinct type so the two directions don't
/// get mixed up at call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendMessage {
    pub tag: u8,
    pub payload: Bytes,
}

/// The untagged first packet of a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    /// SSLRequest; answer with a single `N` and read the next startup packet.
    Ssl,
    /// CancelRequest; this connection carries no further messages.
    Cancel,
    /// StartupMessage with its parameter list in wire order.
    Startup { params: Vec<(String, String)> },
}

async fn read_tagged<R: AsyncRead + Unpin>(rd: &mut R) -> Result<(u8, Bytes)> {
    let mut hdr = [0u8; 5];
    rd.read_exact(&mut hdr).await?;
    let tag = hdr[0];
    let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);

    if len < 4 {
        return Err(EdgeError::Protocol(format!(
            "invalid message length: {len}"
        )));
    }

    let payload_len = (len - 4) as usize;

    if payload_len > MAX_MESSAGE_SIZE {
        return Err(EdgeError::Protocol(format!(
            "message too large: {payload_len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }

    let mut buf = vec![0u8; payload_len];
    rd.read_exact(&mut buf).await?;
    Ok((tag, Bytes::from(buf)))
}

pub async fn read_backend_message<R: AsyncRead + Unpin>(rd: &mut R) -> Result<BackendMessage> {
    let (tag, payload) = read_tagged(rd).await?;
    Ok(BackendMessage { tag, payload })
}

pub async fn read_frontend_message<R: AsyncRead + Unpin>(rd: &mut R) -> Result<FrontendMessage> {
    let (tag, payload) = read_tagged(rd).await?;
    Ok(FrontendMessage { tag, payload })
}

/// Read and classify the untagged startup packet of a fresh client
/// connection: a 4-byte length including itself, then the body whose leading
/// int distinguishes SSLRequest, CancelRequest, and StartupMessage.
pub async fn read_startup_request<R: AsyncRead + Unpin>(rd: &mut R) -> Result<StartupRequest> {
    let mut len_buf = [0u8; 4];
    rd.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf);

    if len < 8 || len as usize > MAX_STARTUP_SIZE {
        return Err(EdgeError::Protocol(format!(
            "invalid startup packet length: {len}"
        )));
    }

    let mut body = vec![0u8; (len - 4) as usize];
    rd.read_exact(&mut body).await?;

    let mut b = &body[..];
    let code = b.get_i32();
    match code {
        SSL_REQUEST_CODE => Ok(StartupRequest::Ssl),
        CANCEL_REQUEST_CODE => Ok(StartupRequest::Cancel),
        PROTOCOL_VERSION => Ok(StartupRequest::Startup {
            params: parse_startup_params(b)?,
        }),
        other => Err(EdgeError::Protocol(format!(
            "unsupported protocol version: {other}"
        ))),
    }
}

/// Parse the null-terminated key/value pairs of a StartupMessage body.
fn parse_startup_params(mut b: &[u8]) -> Result<Vec<(String, String)>> {
    fn take_cstr<'a>(b: &mut &'a [u8]) -> Result<&'a [u8]> {
        let pos = b
            .iter()
            .position(|&x| x == 0)
            .ok_or_else(|| EdgeError::Protocol("unterminated startup parameter".into()))?;
        let s = &b[..pos];
        *b = &b[pos + 1..];
        Ok(s)
    }

    let mut params = Vec::new();
    while !b.is_empty() && b[0] != 0 {
        let key = take_cstr(&mut b)?;
        let value = take_cstr(&mut b)?;
        params.push((
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    Ok(params)
}

pub async fn write_ssl_request<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&(8i32).to_be_bytes());
    buf[4..8].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    protocol_version: i32,
    params: &[(&str, &str)],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);

    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut buf = BytesMut::with_capacity(sql.len() + 64);
    buf.put_u8(b'Q');
    buf.put_i32(0);
    buf.extend_from_slice(sql.as_bytes());
    buf.put_u8(0);

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    buf.put_u8(b'p');
    buf.put_i32(0);
    buf.extend_from_slice(payload);

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_copy_data<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    buf.put_u8(b'd');
    buf.put_i32(0);
    buf.extend_from_slice(payload);

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_copy_done<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(b'c'); // CopyDone
    buf.put_i32(4); // length includes itself; CopyDone has no payload
    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}
