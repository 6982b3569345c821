use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SessionError, WriteError};

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Bi,
    Uni,
}

/// Which endpoint opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Initiator {
    Local,
    Remote,
}

/// Ordered delivery to the reader handle. The channel itself is the inbound
/// buffer: the controller pushes in arrival order and never reorders.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    Data(Bytes),
    Fin,
    Reset(u32),
    Session(SessionError),
}

pub(crate) struct PendingWrite {
    pub data: Bytes,
    pub fin: bool,
    pub ack: oneshot::Sender<Result<(), WriteError>>,
}

enum SendHalf {
    /// `max_offset - sent` is the available credit. Writes beyond it queue.
    Open {
        sent: u64,
        max_offset: u64,
        queue: VecDeque<PendingWrite>,
        fin_queued: bool,
    },
    /// Final write flushed.
    Finished,
    /// Peer sent stop-sending.
    Stopped(u32),
    /// Locally reset.
    Reset,
    /// Receive-only stream.
    Absent,
}

enum RecvHalf {
    Open { reader: mpsc::UnboundedSender<ReadEvent> },
    /// Final flag forwarded.
    Finished,
    /// Local stop-receiving; later data is discarded.
    Stopped,
    /// Peer reset forwarded.
    Reset,
    /// Send-only stream.
    Absent,
}

/// Per-stream state machine, independent of which transport carries it.
///
/// Owned and driven exclusively by the session's event bridge; all methods
/// are synchronous state transitions that hand back whatever must reach the
/// transport or the caller.
pub(crate) struct StreamCtrl {
    pub id: u64,
    pub dir: Dir,
    pub initiator: Initiator,
    send: SendHalf,
    recv: RecvHalf,
}

impl StreamCtrl {
    pub fn new(
        id: u64,
        dir: Dir,
        initiator: Initiator,
        send_credit: u64,
        reader: Option<mpsc::UnboundedSender<ReadEvent>>,
    ) -> Self {
        let has_send = dir == Dir::Bi || initiator == Initiator::Local;
        Self {
            id,
            dir,
            initiator,
            send: if has_send {
                SendHalf::Open {
                    sent: 0,
                    max_offset: send_credit,
                    queue: VecDeque::new(),
                    fin_queued: false,
                }
            } else {
                SendHalf::Absent
            },
            recv: match reader {
                Some(reader) => RecvHalf::Open { reader },
                None => RecvHalf::Absent,
            },
        }
    }

    /// Queue a write. The ack fires once the bytes are accepted by the
    /// transport, or immediately with an error if the half is terminal.
    pub fn queue_write(&mut self, write: PendingWrite) {
        match &mut self.send {
            SendHalf::Open {
                queue, fin_queued, ..
            } => {
                if *fin_queued {
                    let _ = write.ack.send(Err(WriteError::ClosedStream));
                    return;
                }
                *fin_queued = write.fin;
                queue.push_back(write);
            }
            SendHalf::Stopped(code) => {
                let _ = write.ack.send(Err(WriteError::Stopped(*code)));
            }
            SendHalf::Finished | SendHalf::Reset | SendHalf::Absent => {
                let _ = write.ack.send(Err(WriteError::ClosedStream));
            }
        }
    }

    /// Release queued writes covered by the current credit, acking each one
    /// as accepted. A write larger than the remaining window is split; its
    /// ack stays pending until the tail flushes.
    pub fn pump_send(&mut self) -> Vec<(Bytes, bool)> {
        let SendHalf::Open {
            sent,
            max_offset,
            queue,
            ..
        } = &mut self.send
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut finished = false;
        while let Some(front) = queue.front_mut() {
            let available = *max_offset - *sent;
            if front.data.is_empty() {
                // Credit-free: a bare fin or empty write.
                let write = queue.pop_front().expect("front exists");
                if write.fin {
                    finished = true;
                }
                out.push((write.data, write.fin));
                let _ = write.ack.send(Ok(()));
                if finished {
                    break;
                }
                continue;
            }
            if available == 0 {
                break;
            }
            if (front.data.len() as u64) <= available {
                let write = queue.pop_front().expect("front exists");
                *sent += write.data.len() as u64;
                if write.fin {
                    finished = true;
                }
                out.push((write.data, write.fin));
                let _ = write.ack.send(Ok(()));
                if finished {
                    break;
                }
            } else {
                let head = front.data.split_to(available as usize);
                *sent += available;
                out.push((head, false));
                break;
            }
        }

        if finished {
            self.send = SendHalf::Finished;
        }
        out
    }

    /// Raise the absolute send-credit offset (native credit update).
    pub fn grant_credit(&mut self, new_max: u64) {
        if let SendHalf::Open { max_offset, .. } = &mut self.send {
            *max_offset = (*max_offset).max(new_max);
        }
    }

    /// Refill the window to `window` bytes past what was already sent
    /// (fallback transport, after the tunnel drains).
    pub fn refill_credit(&mut self, window: u64) {
        if let SendHalf::Open {
            sent, max_offset, ..
        } = &mut self.send
        {
            *max_offset = (*max_offset).max(*sent + window);
        }
    }

    pub fn has_queued_writes(&self) -> bool {
        matches!(&self.send, SendHalf::Open { queue, .. } if !queue.is_empty())
    }

    /// Inbound data from the transport, in arrival order.
    pub fn on_data(&mut self, data: Bytes, fin: bool) {
        match &self.recv {
            RecvHalf::Open { reader } => {
                if !data.is_empty() {
                    let _ = reader.send(ReadEvent::Data(data));
                }
                if fin {
                    let _ = reader.send(ReadEvent::Fin);
                    self.recv = RecvHalf::Finished;
                }
            }
            // Stopped or already terminal: discard, never re-emit.
            _ => {}
        }
    }

    /// Peer reset its sending side.
    pub fn on_reset(&mut self, code: u32) {
        if let RecvHalf::Open { reader } = &self.recv {
            let _ = reader.send(ReadEvent::Reset(code));
        }
        if !matches!(self.recv, RecvHalf::Absent) {
            self.recv = RecvHalf::Reset;
        }
    }

    /// Peer no longer wants our data; queued writes fail, and the caller
    /// should answer with a reset on the wire.
    pub fn on_stop_sending(&mut self, code: u32) -> bool {
        match std::mem::replace(&mut self.send, SendHalf::Stopped(code)) {
            SendHalf::Open { queue, .. } => {
                for write in queue {
                    let _ = write.ack.send(Err(WriteError::Stopped(code)));
                }
                true
            }
            other => {
                self.send = other;
                false
            }
        }
    }

    /// Local abrupt termination of the sending side.
    pub fn reset_send(&mut self) -> bool {
        match std::mem::replace(&mut self.send, SendHalf::Reset) {
            SendHalf::Open { queue, .. } => {
                for write in queue {
                    let _ = write.ack.send(Err(WriteError::ClosedStream));
                }
                true
            }
            other => {
                self.send = other;
                false
            }
        }
    }

    /// Local stop-receiving; discards anything still buffered upstream.
    pub fn stop_recv(&mut self) -> bool {
        match self.recv {
            RecvHalf::Open { .. } => {
                self.recv = RecvHalf::Stopped;
                true
            }
            _ => false,
        }
    }

    /// Session died: force both halves terminal, propagating the error.
    pub fn fail(&mut self, err: &SessionError) {
        tracing::trace!("stream {} reset by session failure", self.id);
        if let RecvHalf::Open { reader } = &self.recv {
            let _ = reader.send(ReadEvent::Session(err.clone()));
        }
        if !matches!(self.recv, RecvHalf::Absent) {
            self.recv = RecvHalf::Reset;
        }
        match std::mem::replace(&mut self.send, SendHalf::Reset) {
            SendHalf::Open { queue, .. } => {
                for write in queue {
                    let _ = write.ack.send(Err(WriteError::Session(err.clone())));
                }
            }
            other => self.send = other,
        }
    }

    /// Both directions terminal: the bridge may drop this entry.
    pub fn is_terminal(&self) -> bool {
        let send_done = !matches!(self.send, SendHalf::Open { .. });
        let recv_done = !matches!(self.recv, RecvHalf::Open { .. });
        send_done && recv_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(data: &'static [u8], fin: bool) -> (PendingWrite, oneshot::Receiver<Result<(), WriteError>>) {
        let (ack, rx) = oneshot::channel();
        (
            PendingWrite {
                data: Bytes::from_static(data),
                fin,
                ack,
            },
            rx,
        )
    }

    #[test]
    fn writes_release_in_order_within_credit() {
        let mut ctrl = StreamCtrl::new(0, Dir::Bi, Initiator::Local, 8, None);
        let (w1, mut a1) = write(b"hello", false);
        let (w2, mut a2) = write(b"world", true);
        ctrl.queue_write(w1);
        ctrl.queue_write(w2);

        // 8 bytes of credit: "hello" flushes whole, "world" splits.
        let out = ctrl.pump_send();
        assert_eq!(out, vec![(Bytes::from_static(b"hello"), false), (Bytes::from_static(b"wor"), false)]);
        assert_eq!(a1.try_recv().unwrap(), Ok(()));
        assert!(a2.try_recv().is_err());

        ctrl.grant_credit(10);
        let out = ctrl.pump_send();
        assert_eq!(out, vec![(Bytes::from_static(b"ld"), true)]);
        assert_eq!(a2.try_recv().unwrap(), Ok(()));
        assert!(ctrl.is_terminal());
    }

    #[test]
    fn write_after_fin_rejected() {
        let mut ctrl = StreamCtrl::new(0, Dir::Uni, Initiator::Local, 100, None);
        let (w1, mut a1) = write(b"bye", true);
        ctrl.queue_write(w1);
        let (w2, mut a2) = write(b"more", false);
        ctrl.queue_write(w2);
        assert_eq!(a2.try_recv().unwrap(), Err(WriteError::ClosedStream));

        ctrl.pump_send();
        assert_eq!(a1.try_recv().unwrap(), Ok(()));
        assert!(ctrl.is_terminal());
    }

    #[test]
    fn stop_sending_fails_queued_writes() {
        let mut ctrl = StreamCtrl::new(4, Dir::Bi, Initiator::Local, 0, None);
        let (w, mut ack) = write(b"stuck", false);
        ctrl.queue_write(w);
        assert!(ctrl.has_queued_writes());

        assert!(ctrl.on_stop_sending(9));
        assert_eq!(ack.try_recv().unwrap(), Err(WriteError::Stopped(9)));

        let (w, mut ack) = write(b"late", false);
        ctrl.queue_write(w);
        assert_eq!(ack.try_recv().unwrap(), Err(WriteError::Stopped(9)));
    }

    #[test]
    fn reset_reaches_reader_and_silences_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctrl = StreamCtrl::new(1, Dir::Uni, Initiator::Remote, 0, Some(tx));
        ctrl.on_data(Bytes::from_static(b"early"), false);
        ctrl.on_reset(3);
        ctrl.on_data(Bytes::from_static(b"late"), true);

        assert!(matches!(rx.try_recv().unwrap(), ReadEvent::Data(d) if &d[..] == b"early"));
        assert!(matches!(rx.try_recv().unwrap(), ReadEvent::Reset(3)));
        assert!(rx.try_recv().is_err());
        assert!(ctrl.is_terminal());
    }

    #[test]
    fn fin_closes_recv_half_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctrl = StreamCtrl::new(1, Dir::Uni, Initiator::Remote, 0, Some(tx));
        ctrl.on_data(Bytes::from_static(b"tail"), true);
        ctrl.on_data(Bytes::from_static(b"ghost"), true);

        assert!(matches!(rx.try_recv().unwrap(), ReadEvent::Data(_)));
        assert!(matches!(rx.try_recv().unwrap(), ReadEvent::Fin));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn session_failure_forces_reset() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctrl = StreamCtrl::new(0, Dir::Bi, Initiator::Local, 0, Some(tx));
        let (w, mut ack) = write(b"queued", false);
        ctrl.queue_write(w);

        let err = SessionError::TransportIo("socket died".into());
        ctrl.fail(&err);
        assert!(matches!(rx.try_recv().unwrap(), ReadEvent::Session(_)));
        assert_eq!(ack.try_recv().unwrap(), Err(WriteError::Session(err)));
        assert!(ctrl.is_terminal());
    }
}
