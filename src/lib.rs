//! WebTransport is a multiplexed, bidirectional, partially-reliable
//! session protocol for client-server communication.
//!
//! This crate implements the session and stream layer independently of the
//! transport that carries it. A session can run over a native QUIC/HTTP-3
//! engine attached through [`Session::attach`], or be emulated over an
//! HTTP/2 `CONNECT`-style tunnel using a capsule-framed sub-protocol via
//! [`Client`] and [`Server`].
//!
//! The native engine is never linked here: an adapter feeds normalized
//! [`TransportEvent`]s into the session and applies the
//! [`TransportAction`]s it emits. Each session runs its own driver task,
//! so no two callbacks ever mutate the same stream or session state
//! concurrently.
//!
//! # Limitations
//!
//! In fallback mode every logical stream and datagram shares one HTTP/2
//! byte stream, so a stalled tunnel stalls all of them until it clears.
//! Ordering within each stream is still preserved.

mod bridge;
mod capsule;
mod client;
mod config;
mod connect;
mod error;
mod fallback;
mod recv;
mod send;
mod server;
mod session;
mod stream;
mod varint;
#[cfg(test)]
mod tests;

pub use bridge::{TransportAction, TransportEvent};
pub use capsule::{Capsule, CodecError, Decoded, Decoder, MAX_REASON_LEN};
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use connect::{ConnectError, ConnectRequest, ConnectResponse};
pub use error::*;
pub use recv::RecvStream;
pub use send::SendStream;
pub use server::{Request, Server};
pub use session::{Role, Session, SessionStats};
pub use stream::Dir;

/// The protocol token carried in the extended CONNECT request.
pub const PROTOCOL: &str = "webtransport";

/// Re-export the http crate because it's in the public API.
pub use http;
