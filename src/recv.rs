use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::bridge::Command;
use crate::error::{ReadError, ReadToEndError, SessionError};
use crate::stream::ReadEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadState {
    Readable,
    /// Final flag seen; end-of-stream once the buffer drains.
    FinPending,
    Reset(u32),
    Failed(SessionError),
}

/// The receiving half of a stream.
///
/// Bytes arrive strictly in send order; end-of-stream is signalled once,
/// after the final flag is observed and everything buffered has been read.
/// A reset discards whatever was buffered but not yet read.
#[derive(Debug)]
pub struct RecvStream {
    id: u64,
    cmd: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<ReadEvent>,
    buffered: VecDeque<Bytes>,
    state: ReadState,
}

impl RecvStream {
    pub(crate) fn new(
        id: u64,
        cmd: mpsc::UnboundedSender<Command>,
        rx: mpsc::UnboundedReceiver<ReadEvent>,
    ) -> Self {
        Self {
            id,
            cmd,
            rx,
            buffered: VecDeque::new(),
            state: ReadState::Readable,
        }
    }

    /// Read some bytes into `buf`, suspending until data or end-of-stream.
    ///
    /// Returns `Ok(None)` at end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        match self.read_chunk(buf.len()).await? {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(Some(chunk.len()))
            }
            None => Ok(None),
        }
    }

    /// Read the next chunk of at most `max` bytes.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, ReadError> {
        loop {
            // Absorb everything already delivered, so a reset sitting
            // behind buffered data can discard it before we hand it out.
            while let Ok(ev) = self.rx.try_recv() {
                self.absorb(ev);
            }

            match &self.state {
                ReadState::Reset(code) => return Err(ReadError::Reset(*code)),
                ReadState::Failed(err) => return Err(ReadError::Session(err.clone())),
                ReadState::Readable | ReadState::FinPending => {}
            }
            if let Some(front) = self.buffered.front_mut() {
                let take = max.min(front.len());
                let chunk = front.split_to(take);
                if front.is_empty() {
                    self.buffered.pop_front();
                }
                return Ok(Some(chunk));
            }
            if self.state == ReadState::FinPending {
                return Ok(None);
            }

            match self.rx.recv().await {
                Some(ev) => self.absorb(ev),
                None => self.absorb(ReadEvent::Session(SessionError::TransportIo(
                    "session dropped".into(),
                ))),
            }
        }
    }

    /// Read until end-of-stream, failing if more than `size_limit` bytes
    /// arrive.
    pub async fn read_to_end(&mut self, size_limit: usize) -> Result<Vec<u8>, ReadToEndError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk(usize::MAX).await? {
            if out.len() + chunk.len() > size_limit {
                return Err(ReadToEndError::TooLong);
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Tell the peer to stop sending, with an application error code.
    ///
    /// Anything not yet read is discarded and later reads fail.
    pub fn stop(&mut self, code: u32) {
        let _ = self.cmd.send(Command::StopRecv { id: self.id, code });
        if matches!(self.state, ReadState::Readable | ReadState::FinPending) {
            self.state = ReadState::Reset(code);
            self.buffered.clear();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn absorb(&mut self, ev: ReadEvent) {
        match ev {
            ReadEvent::Data(data) => {
                if self.state == ReadState::Readable && !data.is_empty() {
                    self.buffered.push_back(data);
                }
            }
            ReadEvent::Fin => {
                if self.state == ReadState::Readable {
                    self.state = ReadState::FinPending;
                }
            }
            ReadEvent::Reset(code) => {
                if matches!(self.state, ReadState::Readable) {
                    self.buffered.clear();
                    self.state = ReadState::Reset(code);
                }
            }
            ReadEvent::Session(err) => {
                if matches!(self.state, ReadState::Readable) {
                    self.buffered.clear();
                    self.state = ReadState::Failed(err);
                }
            }
        }
    }
}

impl tokio::io::AsyncRead for RecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf,
    ) -> Poll<io::Result<()>> {
        loop {
            while let Ok(ev) = self.rx.try_recv() {
                self.absorb(ev);
            }
            match &self.state {
                ReadState::Reset(code) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        ReadError::Reset(*code),
                    )))
                }
                ReadState::Failed(err) => {
                    return Poll::Ready(Err(io::Error::other(ReadError::Session(err.clone()))))
                }
                ReadState::Readable | ReadState::FinPending => {}
            }
            if let Some(front) = self.buffered.front_mut() {
                let take = buf.remaining().min(front.len());
                buf.put_slice(&front[..take]);
                front.advance(take);
                if front.is_empty() {
                    self.buffered.pop_front();
                }
                return Poll::Ready(Ok(()));
            }
            if self.state == ReadState::FinPending {
                return Poll::Ready(Ok(()));
            }

            match std::task::ready!(self.rx.poll_recv(cx)) {
                Some(ev) => self.absorb(ev),
                None => self.absorb(ReadEvent::Session(SessionError::TransportIo(
                    "session dropped".into(),
                ))),
            }
        }
    }
}
