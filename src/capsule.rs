//! Capsule framing for WebTransport over an HTTP/2 tunnel.
//!
//! Every capsule is `[type: varint][length: varint][payload]`. Capsules are
//! strictly ordered on the single byte stream that carries them; this is the
//! sole serialization point for all logical streams and datagrams in
//! fallback mode.
//!
//! Unknown capsule types are skipped using the declared length so peers can
//! deploy new types without breaking us. A length that exceeds the
//! configured bound is fatal: once the framing is unverifiable the session
//! cannot be trusted.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::varint;

/// Close the session with an error code and reason string.
pub const CLOSE_SESSION: u64 = 0x2843;

/// Ask the peer to stop opening streams but keep existing ones running.
pub const DRAIN_SESSION: u64 = 0x78ae;

/// Abruptly terminate the sending side of a stream.
pub const STREAM_RESET: u64 = 0x190b4d39;

/// Ask the peer to stop sending on a stream.
pub const STOP_SENDING: u64 = 0x190b4d3a;

/// Stream payload bytes.
pub const STREAM_DATA: u64 = 0x190b4d3b;

/// Stream payload bytes carrying the final flag.
pub const STREAM_DATA_FIN: u64 = 0x190b4d3c;

/// Raise the bidirectional concurrent-stream limit.
pub const MAX_STREAMS_BIDI: u64 = 0x190b4d3f;

/// Raise the unidirectional concurrent-stream limit.
pub const MAX_STREAMS_UNI: u64 = 0x190b4d40;

/// An HTTP datagram (RFC 9297).
pub const DATAGRAM: u64 = 0x00;

/// Longest close reason accepted for encode or decode, in bytes.
pub const MAX_REASON_LEN: usize = 1024;

/// A decoding or encoding failure. Decode failures are fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("capsule length {0} exceeds the {1} byte limit")]
    OversizedCapsule(u64, usize),

    #[error("malformed {kind:#x} capsule: {detail}")]
    Malformed { kind: u64, detail: &'static str },

    #[error("close reason exceeds {MAX_REASON_LEN} bytes")]
    ReasonTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    Datagram(Bytes),
    StreamData { id: u64, fin: bool, data: Bytes },
    StreamReset { id: u64, code: u32 },
    StopSending { id: u64, code: u32 },
    MaxStreamsBidi(u64),
    MaxStreamsUni(u64),
    CloseSession { code: u32, reason: String },
    DrainSession,
}

/// Outcome of one [`Capsule::decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Capsule(Capsule),
    /// A complete capsule of a type we do not understand was skipped.
    Ignored { kind: u64 },
    /// The buffer ends mid-capsule; feed more bytes and retry.
    NeedMoreData,
}

impl Capsule {
    fn kind(&self) -> u64 {
        match self {
            Capsule::Datagram(_) => DATAGRAM,
            Capsule::StreamData { fin: false, .. } => STREAM_DATA,
            Capsule::StreamData { fin: true, .. } => STREAM_DATA_FIN,
            Capsule::StreamReset { .. } => STREAM_RESET,
            Capsule::StopSending { .. } => STOP_SENDING,
            Capsule::MaxStreamsBidi(_) => MAX_STREAMS_BIDI,
            Capsule::MaxStreamsUni(_) => MAX_STREAMS_UNI,
            Capsule::CloseSession { .. } => CLOSE_SESSION,
            Capsule::DrainSession => DRAIN_SESSION,
        }
    }

    /// Append the encoding of this capsule to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        varint::write(self.kind(), buf);

        match self {
            Capsule::Datagram(data) => {
                varint::write(data.len() as u64, buf);
                buf.extend_from_slice(data);
            }
            Capsule::StreamData { id, data, .. } => {
                varint::write((varint::size(*id) + data.len()) as u64, buf);
                varint::write(*id, buf);
                buf.extend_from_slice(data);
            }
            Capsule::StreamReset { id, code } | Capsule::StopSending { id, code } => {
                let code = u64::from(*code);
                varint::write((varint::size(*id) + varint::size(code)) as u64, buf);
                varint::write(*id, buf);
                varint::write(code, buf);
            }
            Capsule::MaxStreamsBidi(max) | Capsule::MaxStreamsUni(max) => {
                varint::write(varint::size(*max) as u64, buf);
                varint::write(*max, buf);
            }
            Capsule::CloseSession { code, reason } => {
                if reason.len() > MAX_REASON_LEN {
                    return Err(CodecError::ReasonTooLong);
                }
                let code = u64::from(*code);
                varint::write((varint::size(code) + reason.len()) as u64, buf);
                varint::write(code, buf);
                buf.extend_from_slice(reason.as_bytes());
            }
            Capsule::DrainSession => {
                varint::write(0, buf);
            }
        }

        Ok(())
    }

    /// Decode one capsule from the front of `buf`.
    ///
    /// Returns the decode outcome plus the number of bytes consumed, which
    /// is zero for [`Decoded::NeedMoreData`]; the caller keeps the remainder
    /// for the next call. `max_payload` bounds the declared payload length.
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<(Decoded, usize), CodecError> {
        let Some((kind, kind_len)) = varint::read(buf) else {
            return Ok((Decoded::NeedMoreData, 0));
        };
        let Some((len, len_len)) = varint::read(&buf[kind_len..]) else {
            return Ok((Decoded::NeedMoreData, 0));
        };

        if len > max_payload as u64 {
            return Err(CodecError::OversizedCapsule(len, max_payload));
        }

        let header = kind_len + len_len;
        let len = len as usize;
        if buf.len() < header + len {
            return Ok((Decoded::NeedMoreData, 0));
        }
        let payload = &buf[header..header + len];
        let consumed = header + len;

        let capsule = match kind {
            DATAGRAM => Capsule::Datagram(Bytes::copy_from_slice(payload)),
            STREAM_DATA | STREAM_DATA_FIN => {
                let (id, n) = read_field(kind, payload, "truncated stream id")?;
                Capsule::StreamData {
                    id,
                    fin: kind == STREAM_DATA_FIN,
                    data: Bytes::copy_from_slice(&payload[n..]),
                }
            }
            STREAM_RESET | STOP_SENDING => {
                let (id, n) = read_field(kind, payload, "truncated stream id")?;
                let (code, _) = read_field(kind, &payload[n..], "truncated error code")?;
                let code = u32::try_from(code).map_err(|_| CodecError::Malformed {
                    kind,
                    detail: "error code exceeds 32 bits",
                })?;
                if kind == STREAM_RESET {
                    Capsule::StreamReset { id, code }
                } else {
                    Capsule::StopSending { id, code }
                }
            }
            MAX_STREAMS_BIDI | MAX_STREAMS_UNI => {
                let (max, _) = read_field(kind, payload, "truncated limit")?;
                if kind == MAX_STREAMS_BIDI {
                    Capsule::MaxStreamsBidi(max)
                } else {
                    Capsule::MaxStreamsUni(max)
                }
            }
            CLOSE_SESSION => {
                let (code, n) = read_field(kind, payload, "truncated error code")?;
                let code = u32::try_from(code).map_err(|_| CodecError::Malformed {
                    kind,
                    detail: "error code exceeds 32 bits",
                })?;
                let reason_bytes = &payload[n..];
                if reason_bytes.len() > MAX_REASON_LEN {
                    return Err(CodecError::ReasonTooLong);
                }
                let reason =
                    String::from_utf8(reason_bytes.to_vec()).map_err(|_| CodecError::Malformed {
                        kind,
                        detail: "reason is not valid UTF-8",
                    })?;
                Capsule::CloseSession { code, reason }
            }
            DRAIN_SESSION => {
                if len != 0 {
                    return Err(CodecError::Malformed {
                        kind,
                        detail: "payload must be empty",
                    });
                }
                Capsule::DrainSession
            }
            _ => return Ok((Decoded::Ignored { kind }, consumed)),
        };

        Ok((Decoded::Capsule(capsule), consumed))
    }
}

fn read_field(kind: u64, buf: &[u8], detail: &'static str) -> Result<(u64, usize), CodecError> {
    varint::read(buf).ok_or(CodecError::Malformed { kind, detail })
}

/// Incremental decoder over arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer another chunk from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete capsule, skipping ignored types.
    ///
    /// Returns `Ok(None)` once the buffered bytes no longer contain a whole
    /// capsule.
    pub fn next(&mut self, max_payload: usize) -> Result<Option<Capsule>, CodecError> {
        loop {
            let (decoded, consumed) = Capsule::decode(&self.buf, max_payload)?;
            let _ = self.buf.split_to(consumed);
            match decoded {
                Decoded::Capsule(capsule) => return Ok(Some(capsule)),
                Decoded::Ignored { kind } => {
                    tracing::warn!("ignoring unknown capsule: type={kind:#x}");
                }
                Decoded::NeedMoreData => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(capsule: Capsule) {
        let mut buf = Vec::new();
        capsule.encode(&mut buf).unwrap();
        let (decoded, consumed) = Capsule::decode(&buf, 1 << 20).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, Decoded::Capsule(capsule));
    }

    #[test]
    fn stream_data_roundtrip() {
        roundtrip(Capsule::StreamData {
            id: 4,
            fin: false,
            data: Bytes::from_static(b"hello"),
        });
        roundtrip(Capsule::StreamData {
            id: 16384,
            fin: true,
            data: Bytes::new(),
        });
    }

    #[test]
    fn signal_roundtrips() {
        roundtrip(Capsule::StreamReset { id: 3, code: 77 });
        roundtrip(Capsule::StopSending { id: 3, code: u32::MAX });
        roundtrip(Capsule::MaxStreamsBidi(99));
        roundtrip(Capsule::MaxStreamsUni(1 << 40));
        roundtrip(Capsule::DrainSession);
        roundtrip(Capsule::Datagram(Bytes::from_static(b"dgram")));
    }

    #[test]
    fn close_session_roundtrip() {
        roundtrip(Capsule::CloseSession {
            code: 0,
            reason: String::new(),
        });
        roundtrip(Capsule::CloseSession {
            code: 7,
            reason: "this is the reason".into(),
        });
    }

    #[test]
    fn close_reason_bounded() {
        let capsule = Capsule::CloseSession {
            code: 0,
            reason: "x".repeat(MAX_REASON_LEN + 1),
        };
        assert_eq!(
            capsule.encode(&mut Vec::new()),
            Err(CodecError::ReasonTooLong)
        );
    }

    #[test]
    fn partial_second_capsule_left_in_buffer() {
        let first = Capsule::StreamData {
            id: 0,
            fin: false,
            data: Bytes::from_static(b"abc"),
        };
        let mut buf = Vec::new();
        first.encode(&mut buf).unwrap();
        let first_len = buf.len();
        Capsule::DrainSession.encode(&mut buf).unwrap();

        // Chop one byte off the trailing capsule.
        let (decoded, consumed) = Capsule::decode(&buf[..buf.len() - 1], 1 << 20).unwrap();
        assert_eq!(decoded, Decoded::Capsule(first));
        assert_eq!(consumed, first_len);

        let (decoded, consumed) = Capsule::decode(&buf[consumed..buf.len() - 1], 1 << 20).unwrap();
        assert_eq!(decoded, Decoded::NeedMoreData);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn unknown_type_skipped_exactly() {
        let mut buf = Vec::new();
        varint::write(0x5f5f, &mut buf);
        varint::write(4, &mut buf);
        buf.extend_from_slice(&[9, 9, 9, 9]);
        let header_plus_payload = buf.len();
        Capsule::DrainSession.encode(&mut buf).unwrap();

        let (decoded, consumed) = Capsule::decode(&buf, 1 << 20).unwrap();
        assert_eq!(decoded, Decoded::Ignored { kind: 0x5f5f });
        assert_eq!(consumed, header_plus_payload);

        let (decoded, _) = Capsule::decode(&buf[consumed..], 1 << 20).unwrap();
        assert_eq!(decoded, Decoded::Capsule(Capsule::DrainSession));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut buf = Vec::new();
        varint::write(STREAM_DATA, &mut buf);
        varint::write(1 << 40, &mut buf);
        assert!(matches!(
            Capsule::decode(&buf, 1 << 20),
            Err(CodecError::OversizedCapsule(_, _))
        ));
    }

    #[test]
    fn decoder_reassembles_byte_by_byte() {
        let capsules = [
            Capsule::StreamData {
                id: 8,
                fin: true,
                data: Bytes::from_static(b"tail"),
            },
            Capsule::CloseSession {
                code: 1,
                reason: "bye".into(),
            },
        ];
        let mut wire = Vec::new();
        for c in &capsules {
            c.encode(&mut wire).unwrap();
        }

        let mut decoder = Decoder::new();
        let mut seen = Vec::new();
        for &b in &wire {
            decoder.push(&[b]);
            while let Some(c) = decoder.next(1 << 20).unwrap() {
                seen.push(c);
            }
        }
        assert_eq!(seen, capsules);
    }
}
