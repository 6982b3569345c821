//! The CONNECT-style preamble exchanged on the tunnel before any capsule.
//!
//! The host HTTP/2 layer supplies the byte stream; this preamble carries
//! the extended-CONNECT pseudo-headers in-band as varint-framed fields so
//! the server can route on the target and reject unsupported protocols
//! before the capsule sub-protocol starts.

use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::varint;

/// Longest accepted header field, in bytes.
const MAX_FIELD_LEN: u64 = 8192;

/// Most header fields accepted in one preamble.
const MAX_FIELDS: u64 = 64;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connect stream closed early")]
    UnexpectedEnd,

    #[error("malformed connect preamble: {0}")]
    Malformed(&'static str),

    #[error("not a webtransport CONNECT request")]
    WrongProtocol,

    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

/// The client's upgrade request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
}

impl ConnectRequest {
    pub(crate) async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), ConnectError> {
        let fields = [
            (":method", http::Method::CONNECT.as_str()),
            (":protocol", crate::PROTOCOL),
            (":scheme", self.url.scheme()),
            (":authority", self.url.authority()),
            (":path", self.url.path()),
        ];

        let mut buf = Vec::new();
        varint::write(fields.len() as u64, &mut buf);
        for (name, value) in fields {
            write_field(name, &mut buf);
            write_field(value, &mut buf);
        }
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    pub(crate) async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ConnectError> {
        let fields = read_fields(r).await?;
        let field = |name: &str| fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str());

        if field(":method") != Some(http::Method::CONNECT.as_str())
            || field(":protocol") != Some(crate::PROTOCOL)
        {
            return Err(ConnectError::WrongProtocol);
        }
        let scheme = field(":scheme").ok_or(ConnectError::Malformed("missing :scheme"))?;
        let authority = field(":authority").ok_or(ConnectError::Malformed("missing :authority"))?;
        let path = field(":path").ok_or(ConnectError::Malformed("missing :path"))?;

        let url = Url::parse(&format!("{scheme}://{authority}{path}"))
            .map_err(|_| ConnectError::Malformed("unparseable target"))?;
        Ok(Self { url })
    }
}

/// The server's answer. Anything non-2xx rejects the session.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub status: StatusCode,
}

impl ConnectResponse {
    pub(crate) async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), ConnectError> {
        let mut buf = Vec::new();
        varint::write(u64::from(self.status.as_u16()), &mut buf);
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    pub(crate) async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ConnectError> {
        let raw = read_varint(r).await?;
        let raw = u16::try_from(raw).map_err(|_| ConnectError::Malformed("status out of range"))?;
        let status =
            StatusCode::from_u16(raw).map_err(|_| ConnectError::Malformed("invalid status"))?;
        Ok(Self { status })
    }
}

fn write_field(s: &str, buf: &mut Vec<u8>) {
    varint::write(s.len() as u64, buf);
    buf.extend_from_slice(s.as_bytes());
}

async fn read_fields<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Vec<(String, String)>, ConnectError> {
    let count = read_varint(r).await?;
    if count > MAX_FIELDS {
        return Err(ConnectError::Malformed("too many fields"));
    }
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_string(r).await?;
        let value = read_string(r).await?;
        fields.push((name, value));
    }
    Ok(fields)
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ConnectError> {
    let len = read_varint(r).await?;
    if len > MAX_FIELD_LEN {
        return Err(ConnectError::Malformed("field too long"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await.map_err(eof)?;
    String::from_utf8(buf).map_err(|_| ConnectError::Malformed("field is not valid UTF-8"))
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, ConnectError> {
    let first = r.read_u8().await.map_err(eof)?;
    let len = 1usize << (first >> 6);
    let mut bytes = [0u8; 8];
    bytes[0] = first;
    r.read_exact(&mut bytes[1..len]).await.map_err(eof)?;
    let (value, _) = varint::read(&bytes[..len]).ok_or(ConnectError::UnexpectedEnd)?;
    Ok(value)
}

fn eof(e: std::io::Error) -> ConnectError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ConnectError::UnexpectedEnd
    } else {
        ConnectError::Io(e)
    }
}
