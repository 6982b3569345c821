//! Emulates a WebTransport carrier on one HTTP/2 `CONNECT` stream.
//!
//! Two pump tasks sit between the tunnel and the session driver: the read
//! pump feeds tunnel bytes through the capsule [`Decoder`] and forwards the
//! resulting events; the write pump encodes every [`TransportAction`] as a
//! capsule and writes it to the same tunnel. All logical streams and
//! datagrams share this single byte channel, so a stalled tunnel stalls
//! every stream until it clears (head-of-line blocking); ordering is still
//! preserved per stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use url::Url;

use crate::bridge::{TransportAction, TransportEvent};
use crate::capsule::{Capsule, Decoder};
use crate::config::Config;
use crate::session::{Role, Session};
use crate::stream::Dir;

/// Capsules and events buffered between the pumps and the driver.
const CHANNEL_DEPTH: usize = 64;

/// Wire up an upgraded tunnel as a session carrier. The preamble must have
/// been exchanged already; the session reports ready immediately.
pub(crate) fn spawn_session<IO>(io: IO, role: Role, config: Config, url: Option<Url>) -> Session
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (action_tx, action_rx) = mpsc::channel(CHANNEL_DEPTH);

    let max_payload = config.max_capsule_payload;
    let session = crate::bridge::spawn(role, config, event_rx, action_tx, url, true);

    // The channel is fresh, so this cannot fail.
    let _ = event_tx.try_send(TransportEvent::Ready);

    tokio::spawn(read_pump(read_half, event_tx.clone(), max_payload));
    tokio::spawn(write_pump(write_half, action_rx, event_tx));

    session
}

async fn read_pump<R>(mut tunnel: ReadHalf<R>, events: mpsc::Sender<TransportEvent>, max_payload: usize)
where
    R: AsyncRead + Send + 'static,
{
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 4096];
    loop {
        match tunnel.read(&mut buf).await {
            Ok(0) => {
                let _ = events
                    .send(TransportEvent::TransportError {
                        message: "tunnel closed".into(),
                    })
                    .await;
                return;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next(max_payload) {
                        Ok(Some(capsule)) => {
                            if events.send(event_for(capsule)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            // Framing is unverifiable from here on: fatal.
                            let _ = events
                                .send(TransportEvent::ProtocolViolation {
                                    message: err.to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                let _ = events
                    .send(TransportEvent::TransportError {
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}

fn event_for(capsule: Capsule) -> TransportEvent {
    match capsule {
        Capsule::StreamData { id, fin, data } => TransportEvent::StreamData { id, data, fin },
        Capsule::StreamReset { id, code } => TransportEvent::StreamReset { id, code },
        Capsule::StopSending { id, code } => TransportEvent::StopSending { id, code },
        Capsule::Datagram(data) => TransportEvent::Datagram(data),
        Capsule::MaxStreamsBidi(max) => TransportEvent::MaxStreams { dir: Dir::Bi, max },
        Capsule::MaxStreamsUni(max) => TransportEvent::MaxStreams { dir: Dir::Uni, max },
        Capsule::CloseSession { code, reason } => TransportEvent::Closed { code, reason },
        Capsule::DrainSession => TransportEvent::GoAway,
    }
}

async fn write_pump<W>(
    mut tunnel: WriteHalf<W>,
    mut actions: mpsc::Receiver<TransportAction>,
    events: mpsc::Sender<TransportEvent>,
) where
    W: AsyncWrite + Send + 'static,
{
    // A drain notification that could not be delivered yet. This task must
    // never park on the event channel: the driver may be waiting for the
    // action channel to empty, and this task is its only consumer.
    let mut owed_drain = false;
    loop {
        if owed_drain {
            match events.try_send(TransportEvent::SendDrained) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => owed_drain = false,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }
        let next = if owed_drain {
            // Keep draining actions while retrying the owed notification.
            match tokio::time::timeout(std::time::Duration::from_millis(1), actions.recv()).await
            {
                Ok(next) => next,
                Err(_) => continue,
            }
        } else {
            actions.recv().await
        };
        let Some(action) = next else {
            break;
        };
        // Batch whatever else is already queued into one tunnel write.
        let mut batch = vec![action];
        while let Ok(action) = actions.try_recv() {
            batch.push(action);
        }

        let mut buf = Vec::new();
        let mut wrote_stream_data = false;
        let mut closing = false;
        for action in batch {
            let capsule = match action {
                // Streams come into being with their first capsule here.
                TransportAction::OpenStream { .. } => continue,
                TransportAction::Write { id, data, fin } => {
                    wrote_stream_data = true;
                    Capsule::StreamData { id, fin, data }
                }
                TransportAction::Reset { id, code } => Capsule::StreamReset { id, code },
                TransportAction::StopSending { id, code } => Capsule::StopSending { id, code },
                TransportAction::Datagram(data) => Capsule::Datagram(data),
                TransportAction::Drain => Capsule::DrainSession,
                TransportAction::Close { code, reason } => {
                    closing = true;
                    Capsule::CloseSession { code, reason }
                }
            };
            if let Err(err) = capsule.encode(&mut buf) {
                tracing::warn!("skipping unencodable capsule: {err}");
            }
        }

        if !buf.is_empty() {
            if let Err(err) = write_flush(&mut tunnel, &buf).await {
                // Best effort: if this is lost, the dropped action receiver
                // or the read pump reports the broken tunnel instead.
                let _ = events.try_send(TransportEvent::TransportError {
                    message: err.to_string(),
                });
                return;
            }
        }
        if wrote_stream_data {
            // The tunnel accepted everything queued; refill send credit.
            owed_drain = true;
        }
        if closing {
            let _ = tunnel.shutdown().await;
            return;
        }
    }

    // The session went terminal without a graceful close.
    let _ = tunnel.shutdown().await;
}

async fn write_flush<W>(tunnel: &mut WriteHalf<W>, buf: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite,
{
    tunnel.write_all(buf).await?;
    tunnel.flush().await
}
