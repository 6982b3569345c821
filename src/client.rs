use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::config::Config;
use crate::connect::{ConnectRequest, ConnectResponse};
use crate::error::ClientError;
use crate::session::{Role, Session};

/// Construct a WebTransport [`Client`] using sane defaults.
///
/// This is optional; advanced users may use [`Client::new`] directly.
pub struct ClientBuilder {
    config: Config,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// How long the CONNECT preamble and handshake may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Concurrent locally-initiated stream limits, per direction.
    pub fn with_stream_limits(mut self, bidi: u64, uni: u64) -> Self {
        self.config.max_streams_bidi = bidi;
        self.config.max_streams_uni = uni;
        self
    }

    /// Outgoing and incoming datagram queue capacities.
    pub fn with_datagram_queues(mut self, send: usize, recv: usize) -> Self {
        self.config.datagram_send_queue = send;
        self.config.datagram_recv_queue = recv;
        self
    }

    pub fn build(self) -> Client {
        Client::new(self.config)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A client for establishing WebTransport sessions over the fallback
/// tunnel. For a native QUIC engine, use [`Session::attach`] instead.
pub struct Client {
    config: Config,
}

impl Client {
    /// Manually create a client from a full [`Config`].
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Establish a session over an HTTP/2 `CONNECT` stream (or any other
    /// reliable duplex byte channel) that the host environment already
    /// opened.
    ///
    /// Issues the pseudo-CONNECT preamble with the `webtransport` protocol
    /// token; a non-2xx response rejects the upgrade and no session is
    /// created.
    pub async fn connect<IO>(&self, mut io: IO, url: Url) -> Result<Session, ClientError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !url.has_authority() {
            return Err(ClientError::InvalidUrl);
        }

        let request = ConnectRequest { url: url.clone() };
        let handshake = async {
            tracing::debug!("sending CONNECT request: {request:?}");
            request.write(&mut io).await?;
            let response = ConnectResponse::read(&mut io).await?;
            tracing::debug!("received CONNECT response: {response:?}");
            Ok::<_, ClientError>(response)
        };

        let response = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| ClientError::Timeout)??;

        if !response.status.is_success() {
            return Err(ClientError::Rejected(response.status));
        }

        Ok(crate::fallback::spawn_session(
            io,
            Role::Client,
            self.config.clone(),
            Some(url),
        ))
    }
}
