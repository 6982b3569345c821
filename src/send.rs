use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::Command;
use crate::error::{SessionError, WriteError};

struct InFlight {
    ack: oneshot::Receiver<Result<(), WriteError>>,
    len: usize,
    fin: bool,
}

/// The sending half of a stream.
///
/// Writes resolve once the transport accepts the bytes into its send
/// buffer, not when the peer acknowledges them; writes beyond the current
/// flow-control credit queue and resolve as credit arrives.
#[derive(Debug)]
pub struct SendStream {
    id: u64,
    cmd: mpsc::UnboundedSender<Command>,
    fin_sent: bool,
    // In-flight ack for the poll-based writer.
    pending: Option<InFlight>,
}

impl SendStream {
    pub(crate) fn new(id: u64, cmd: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            cmd,
            fin_sent: false,
            pending: None,
        }
    }

    /// Write all of `buf` to the stream.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        self.transfer(Bytes::copy_from_slice(buf), false).await
    }

    /// Write a chunk without copying.
    pub async fn write_chunk(&mut self, data: Bytes) -> Result<(), WriteError> {
        self.transfer(data, false).await
    }

    /// Send the final flag, half-closing the local side.
    pub async fn finish(&mut self) -> Result<(), WriteError> {
        let res = self.transfer(Bytes::new(), true).await;
        self.fin_sent = true;
        res
    }

    /// Abruptly terminate the sending side with an application error code.
    pub fn reset(&mut self, code: u32) {
        let _ = self.cmd.send(Command::ResetSend { id: self.id, code });
        self.fin_sent = true;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    async fn transfer(&mut self, data: Bytes, fin: bool) -> Result<(), WriteError> {
        let ack = self.submit(data, fin)?;
        ack.await.unwrap_or_else(|_| {
            Err(WriteError::Session(SessionError::TransportIo(
                "session dropped".into(),
            )))
        })
    }

    fn submit(
        &mut self,
        data: Bytes,
        fin: bool,
    ) -> Result<oneshot::Receiver<Result<(), WriteError>>, WriteError> {
        if self.fin_sent {
            return Err(WriteError::ClosedStream);
        }
        let (ack, rx) = oneshot::channel();
        self.cmd
            .send(Command::Write {
                id: self.id,
                data,
                fin,
                ack,
            })
            .map_err(|_| WriteError::Session(SessionError::TransportIo("session dropped".into())))?;
        Ok(rx)
    }
}

impl tokio::io::AsyncWrite for SendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            // Finish any write left in flight by an earlier Pending return
            // before accepting new bytes; its length is what we report.
            if let Some(inflight) = &mut self.pending {
                let res = std::task::ready!(Pin::new(&mut inflight.ack).poll(cx));
                let len = inflight.len;
                let fin = inflight.fin;
                self.pending = None;
                if fin {
                    self.fin_sent = true;
                }
                return Poll::Ready(match res {
                    Ok(Ok(())) => Ok(len),
                    Ok(Err(err)) => Err(io::Error::other(err)),
                    Err(_) => Err(io::Error::other(WriteError::Session(
                        SessionError::TransportIo("session dropped".into()),
                    ))),
                });
            }
            match self.submit(Bytes::copy_from_slice(buf), false) {
                Ok(ack) => {
                    self.pending = Some(InFlight {
                        ack,
                        len: buf.len(),
                        fin: false,
                    });
                }
                Err(err) => return Poll::Ready(Err(io::Error::other(err))),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes already resolve on transport acceptance.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if let Some(inflight) = &mut self.pending {
                let res = std::task::ready!(Pin::new(&mut inflight.ack).poll(cx));
                let fin = inflight.fin;
                self.pending = None;
                if fin {
                    self.fin_sent = true;
                    return Poll::Ready(match res {
                        Ok(Ok(())) | Err(_) => Ok(()),
                        Ok(Err(err)) => Err(io::Error::other(err)),
                    });
                }
                if let Ok(Err(err)) = res {
                    return Poll::Ready(Err(io::Error::other(err)));
                }
                continue;
            }
            if self.fin_sent {
                return Poll::Ready(Ok(()));
            }
            match self.submit(Bytes::new(), true) {
                Ok(ack) => {
                    self.pending = Some(InFlight {
                        ack,
                        len: 0,
                        fin: true,
                    })
                }
                Err(err) => return Poll::Ready(Err(io::Error::other(err))),
            }
        }
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InFlight(len={}, fin={})", self.len, self.fin)
    }
}
