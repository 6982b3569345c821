use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::config::Config;
use crate::connect::{ConnectRequest, ConnectResponse};
use crate::error::ServerError;
use crate::session::{Role, Session};

/// Accepts WebTransport sessions arriving over fallback tunnels.
///
/// The host environment terminates HTTP/2 and hands each upgraded
/// `CONNECT` stream to [`Server::accept`].
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Read the client's pseudo-CONNECT preamble from a fresh tunnel.
    ///
    /// The returned [`Request`] lets the application decide, based on the
    /// URL, whether to accept or reject the session.
    pub async fn accept<IO>(&self, mut io: IO) -> Result<Request<IO>, ServerError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request = tokio::time::timeout(
            self.config.connect_timeout,
            ConnectRequest::read(&mut io),
        )
        .await
        .map_err(|_| ServerError::Timeout)??;
        tracing::debug!("received CONNECT request: {request:?}");

        Ok(Request {
            url: request.url,
            io,
            config: self.config.clone(),
        })
    }
}

/// A mostly complete WebTransport handshake, awaiting the server's
/// decision on whether to accept or reject the session based on the URL.
pub struct Request<IO> {
    url: Url,
    io: IO,
    config: Config,
}

impl<IO> Request<IO>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Returns the URL provided by the client.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Accept the session, returning a 200 OK.
    pub async fn ok(mut self) -> Result<Session, ServerError> {
        ConnectResponse {
            status: StatusCode::OK,
        }
        .write(&mut self.io)
        .await?;

        Ok(crate::fallback::spawn_session(
            self.io,
            Role::Server,
            self.config,
            Some(self.url),
        ))
    }

    /// Reject the session with your favorite HTTP status code.
    pub async fn close(mut self, status: StatusCode) -> Result<(), ServerError> {
        ConnectResponse { status }.write(&mut self.io).await?;
        Ok(())
    }
}
