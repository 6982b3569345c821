use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use url::Url;

use crate::config::Config;
use crate::error::{SessionError, WriteError};
use crate::recv::RecvStream;
use crate::send::SendStream;
use crate::session::{PendingOpen, Phase, Role, Session, SessionCore, SessionStats};
use crate::stream::{Dir, Initiator, PendingWrite, StreamCtrl};

/// Error code used when rejecting a peer-initiated stream.
const STREAM_REJECTED: u32 = 1;

/// A notification from the underlying transport, normalized into a closed
/// set of variants. The native engine adapter (or the fallback pumps) feeds
/// these through an `mpsc` channel; the bridge applies them one at a time.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake succeeded; the session may carry traffic.
    Ready,
    /// Handshake failed before the session became ready.
    HandshakeFailed { message: String },
    /// The peer opened a stream.
    StreamOpened { id: u64, dir: Dir },
    /// Ordered bytes arrived on a stream.
    StreamData { id: u64, data: Bytes, fin: bool },
    /// The peer reset its sending side of a stream.
    StreamReset { id: u64, code: u32 },
    /// The peer no longer wants our data on a stream.
    StopSending { id: u64, code: u32 },
    /// The peer raised the concurrent-stream limit for a direction.
    MaxStreams { dir: Dir, max: u64 },
    /// The peer raised a stream's absolute send-credit offset.
    StreamCredit { id: u64, max: u64 },
    /// A datagram arrived.
    Datagram(Bytes),
    /// The peer will not accept new streams (GOAWAY equivalent).
    GoAway,
    /// The peer closed the session gracefully.
    Closed { code: u32, reason: String },
    /// The transport's send buffer drained; queued work may proceed.
    SendDrained,
    /// The peer violated the protocol; fatal.
    ProtocolViolation { message: String },
    /// The socket or HTTP layer failed; fatal.
    TransportError { message: String },
    /// A fresh round-trip estimate.
    RttSample(Duration),
}

/// An operation the session asks the underlying transport to perform.
#[derive(Debug, Clone)]
pub enum TransportAction {
    /// Reserve a locally-initiated stream. Ids follow QUIC numbering, so a
    /// carrier with implicit stream creation may ignore this.
    OpenStream { id: u64, dir: Dir },
    Write { id: u64, data: Bytes, fin: bool },
    Reset { id: u64, code: u32 },
    StopSending { id: u64, code: u32 },
    Datagram(Bytes),
    /// Stop accepting new peer streams.
    Drain,
    Close { code: u32, reason: String },
}

/// A request from a caller-facing handle.
pub(crate) enum Command {
    OpenBi {
        reply: oneshot::Sender<Result<(SendStream, RecvStream), SessionError>>,
    },
    OpenUni {
        reply: oneshot::Sender<Result<SendStream, SessionError>>,
    },
    Write {
        id: u64,
        data: Bytes,
        fin: bool,
        ack: oneshot::Sender<Result<(), WriteError>>,
    },
    ResetSend {
        id: u64,
        code: u32,
    },
    StopRecv {
        id: u64,
        code: u32,
    },
    SendDatagram(Bytes),
    Close {
        code: u32,
        reason: String,
    },
    Drain,
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Spawn the per-session driver task and hand back the caller-facing
/// session. `refill_on_drain` makes [`TransportEvent::SendDrained`] restore
/// each stream's credit window, for carriers without explicit credit.
pub(crate) fn spawn(
    role: Role,
    config: Config,
    events: mpsc::Receiver<TransportEvent>,
    actions: mpsc::Sender<TransportAction>,
    url: Option<Url>,
    refill_on_drain: bool,
) -> Session {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(Phase::Connecting);
    let (bi_tx, bi_rx) = mpsc::unbounded_channel();
    let (uni_tx, uni_rx) = mpsc::unbounded_channel();
    let (dgram_tx, dgram_rx) = mpsc::channel(config.datagram_recv_queue.max(1));

    let deadline = Instant::now() + config.connect_timeout;
    let driver = Driver {
        core: SessionCore::new(role, config),
        streams: HashMap::new(),
        // Weak so that dropping the last handle closes the session instead
        // of the driver keeping its own command channel alive forever.
        cmd_tx: cmd_tx.downgrade(),
        cmd_rx,
        events,
        events_done: false,
        actions: Some(actions),
        phase_tx,
        incoming_bi: Some(bi_tx),
        incoming_uni: Some(uni_tx),
        dgram_in: Some(dgram_tx),
        deadline,
        refill_on_drain,
    };
    tokio::spawn(driver.run());

    Session::new(cmd_tx, phase_rx, bi_rx, uni_rx, dgram_rx, url)
}

/// The single consumer for one session. Every controller mutation happens
/// on this task, in the order events and commands are dequeued, so no two
/// callbacks ever interleave their effects on the same entity.
struct Driver {
    core: SessionCore,
    // Arena of live streams keyed by transport id; entries leave on
    // terminal state so ids are never resurrected.
    streams: HashMap<u64, StreamCtrl>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Receiver<TransportEvent>,
    events_done: bool,
    actions: Option<mpsc::Sender<TransportAction>>,
    phase_tx: watch::Sender<Phase>,
    incoming_bi: Option<mpsc::UnboundedSender<(SendStream, RecvStream)>>,
    incoming_uni: Option<mpsc::UnboundedSender<RecvStream>>,
    dgram_in: Option<mpsc::Sender<Bytes>>,
    deadline: Instant,
    refill_on_drain: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let connecting = matches!(self.core.phase(), Phase::Connecting);
            tokio::select! {
                biased;
                ev = self.events.recv(), if !self.events_done => match ev {
                    Some(ev) => {
                        let mut next = Some(ev);
                        while let Some(ev) = next.take() {
                            if matches!(ev, TransportEvent::SendDrained) {
                                // Coalesce a burst of drain notifications;
                                // only the final state matters.
                                loop {
                                    match self.events.try_recv() {
                                        Ok(TransportEvent::SendDrained) => {}
                                        Ok(other) => {
                                            next = Some(other);
                                            break;
                                        }
                                        Err(_) => break,
                                    }
                                }
                            }
                            self.handle_event(ev).await;
                        }
                    }
                    None => {
                        self.events_done = true;
                        if self.core.terminal_error().is_none() {
                            self.fail(SessionError::TransportIo(
                                "transport event channel closed".into(),
                            ));
                        }
                    }
                },
                _ = tokio::time::sleep_until(self.deadline), if connecting => {
                    self.fail(SessionError::HandshakeTimeout);
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Every handle is gone; close politely and stop.
                        self.graceful_close(0, String::new()).await;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, ev: TransportEvent) {
        if self.core.terminal_error().is_some() {
            // Late events after the terminal transition are dropped.
            return;
        }
        match ev {
            TransportEvent::Ready => {
                if self.core.on_ready() {
                    tracing::debug!("session ready");
                    self.phase_tx.send_replace(Phase::Connected);
                    self.pump_opens().await;
                }
            }
            TransportEvent::HandshakeFailed { message } => {
                self.fail(SessionError::HandshakeFailed(message));
            }
            TransportEvent::StreamOpened { id, dir } => {
                self.remote_open(id, dir).await;
            }
            TransportEvent::StreamData { id, data, fin } => {
                self.core.stats.bytes_recv += data.len() as u64;
                if !self.streams.contains_key(&id) && !self.ensure_remote(id).await {
                    return;
                }
                if let Some(ctrl) = self.streams.get_mut(&id) {
                    ctrl.on_data(data, fin);
                    self.remove_if_terminal(id).await;
                }
            }
            TransportEvent::StreamReset { id, code } => {
                if let Some(ctrl) = self.streams.get_mut(&id) {
                    ctrl.on_reset(code);
                    self.remove_if_terminal(id).await;
                } else {
                    tracing::trace!("reset for unknown stream {id}");
                }
            }
            TransportEvent::StopSending { id, code } => {
                if let Some(ctrl) = self.streams.get_mut(&id) {
                    if ctrl.on_stop_sending(code) {
                        // Answer with a reset carrying the same code.
                        self.send_action(TransportAction::Reset { id, code }).await;
                    }
                    self.remove_if_terminal(id).await;
                }
            }
            TransportEvent::MaxStreams { dir, max } => {
                self.core.raise_limit(dir, max);
                self.pump_opens().await;
            }
            TransportEvent::StreamCredit { id, max } => {
                if let Some(ctrl) = self.streams.get_mut(&id) {
                    ctrl.grant_credit(max);
                    self.flush_stream(id).await;
                }
            }
            TransportEvent::Datagram(data) => {
                self.core.stats.datagrams_recv += 1;
                if let Some(tx) = &self.dgram_in {
                    if tx.try_send(data).is_err() {
                        // Caller is not reading; datagrams are droppable.
                        self.core.stats.datagrams_dropped += 1;
                    }
                }
            }
            TransportEvent::GoAway => {
                if self.core.on_goaway() {
                    tracing::debug!("peer is draining the session");
                    self.phase_tx.send_replace(Phase::Draining);
                } else {
                    tracing::trace!("goaway ignored in current phase");
                }
            }
            TransportEvent::Closed { code, reason } => {
                self.terminal(SessionError::Closed { code, reason });
            }
            TransportEvent::SendDrained => {
                if self.refill_on_drain {
                    let ids: Vec<u64> = self.streams.keys().copied().collect();
                    for id in ids {
                        if let Some(ctrl) = self.streams.get_mut(&id) {
                            ctrl.refill_credit(self.core.config.initial_send_credit);
                            if ctrl.has_queued_writes() {
                                self.flush_stream(id).await;
                            }
                        }
                    }
                }
                self.flush_datagrams();
            }
            TransportEvent::ProtocolViolation { message } => {
                self.fail(SessionError::Protocol(message));
            }
            TransportEvent::TransportError { message } => {
                self.fail(SessionError::TransportIo(message));
            }
            TransportEvent::RttSample(rtt) => {
                self.core.stats.rtt = Some(rtt);
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenBi { reply } => {
                self.core.queue_open(PendingOpen::Bi(reply));
                self.pump_opens().await;
            }
            Command::OpenUni { reply } => {
                self.core.queue_open(PendingOpen::Uni(reply));
                self.pump_opens().await;
            }
            Command::Write { id, data, fin, ack } => {
                match self.streams.get_mut(&id) {
                    Some(ctrl) => {
                        ctrl.queue_write(PendingWrite { data, fin, ack });
                        self.flush_stream(id).await;
                    }
                    None => {
                        let err = match self.core.terminal_error() {
                            Some(e) => WriteError::Session(e.clone()),
                            None => WriteError::ClosedStream,
                        };
                        let _ = ack.send(Err(err));
                    }
                }
            }
            Command::ResetSend { id, code } => {
                if let Some(ctrl) = self.streams.get_mut(&id) {
                    if ctrl.reset_send() {
                        self.send_action(TransportAction::Reset { id, code }).await;
                    }
                    self.remove_if_terminal(id).await;
                }
            }
            Command::StopRecv { id, code } => {
                if let Some(ctrl) = self.streams.get_mut(&id) {
                    if ctrl.stop_recv() {
                        self.send_action(TransportAction::StopSending { id, code })
                            .await;
                    }
                    self.remove_if_terminal(id).await;
                }
            }
            Command::SendDatagram(data) => {
                if self.core.terminal_error().is_some() {
                    return;
                }
                if data.len() > self.core.config.max_capsule_payload {
                    tracing::warn!("dropping oversized datagram of {} bytes", data.len());
                    self.core.stats.datagrams_dropped += 1;
                    return;
                }
                self.core.push_dgram_out(data);
                self.flush_datagrams();
            }
            Command::Close { code, reason } => {
                self.graceful_close(code, reason).await;
            }
            Command::Drain => {
                self.send_action(TransportAction::Drain).await;
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.core.stats.clone());
            }
        }
    }

    /// Grant queued opens while credit allows, fabricating handles.
    async fn pump_opens(&mut self) {
        while let Some((dir, id, open)) = self.core.next_grant() {
            let Some(cmd_tx) = self.cmd_tx.upgrade() else {
                // Every handle is gone; the caller behind this open is too.
                open.fail(SessionError::TransportIo("session dropped".into()));
                continue;
            };
            self.send_action(TransportAction::OpenStream { id, dir }).await;
            match open {
                PendingOpen::Bi(reply) => {
                    let (read_tx, read_rx) = mpsc::unbounded_channel();
                    self.streams.insert(
                        id,
                        StreamCtrl::new(
                            id,
                            dir,
                            Initiator::Local,
                            self.core.config.initial_send_credit,
                            Some(read_tx),
                        ),
                    );
                    let send = SendStream::new(id, cmd_tx.clone());
                    let recv = RecvStream::new(id, cmd_tx, read_rx);
                    if reply.send(Ok((send, recv))).is_err() {
                        self.abandon_granted(id).await;
                    }
                }
                PendingOpen::Uni(reply) => {
                    self.streams.insert(
                        id,
                        StreamCtrl::new(
                            id,
                            dir,
                            Initiator::Local,
                            self.core.config.initial_send_credit,
                            None,
                        ),
                    );
                    let send = SendStream::new(id, cmd_tx);
                    if reply.send(Ok(send)).is_err() {
                        self.abandon_granted(id).await;
                    }
                }
            }
        }
    }

    /// The caller vanished between grant and delivery; tear the stream down.
    async fn abandon_granted(&mut self, id: u64) {
        let Some(ctrl) = self.streams.get_mut(&id) else {
            return;
        };
        let needs_reset = ctrl.reset_send();
        ctrl.stop_recv();
        if needs_reset {
            self.send_action(TransportAction::Reset {
                id,
                code: STREAM_REJECTED,
            })
            .await;
        }
        self.remove_if_terminal(id).await;
    }

    /// Register a peer-initiated stream, or reject it on the wire.
    async fn remote_open(&mut self, id: u64, dir: Dir) {
        if self.streams.contains_key(&id) {
            return;
        }
        match self.core.accept_remote(id, dir) {
            Ok(()) => {
                let Some(cmd_tx) = self.cmd_tx.upgrade() else {
                    // Nobody is left to accept it; the session is closing.
                    return;
                };
                let (read_tx, read_rx) = mpsc::unbounded_channel();
                self.streams.insert(
                    id,
                    StreamCtrl::new(
                        id,
                        dir,
                        Initiator::Remote,
                        self.core.config.initial_send_credit,
                        Some(read_tx),
                    ),
                );
                let recv = RecvStream::new(id, cmd_tx.clone(), read_rx);
                match dir {
                    Dir::Bi => {
                        if let Some(tx) = &self.incoming_bi {
                            let send = SendStream::new(id, cmd_tx);
                            let _ = tx.send((send, recv));
                        }
                    }
                    Dir::Uni => {
                        if let Some(tx) = &self.incoming_uni {
                            let _ = tx.send(recv);
                        }
                    }
                }
            }
            Err(reason) => {
                tracing::warn!("rejecting incoming stream {id}: {reason}");
                self.send_action(TransportAction::StopSending {
                    id,
                    code: STREAM_REJECTED,
                })
                .await;
                if dir == Dir::Bi {
                    self.send_action(TransportAction::Reset {
                        id,
                        code: STREAM_REJECTED,
                    })
                    .await;
                }
            }
        }
    }

    /// Data arrived for an id we have no entry for. Peer-initiated ids are
    /// implicitly opened (the fallback carrier never sends an explicit open
    /// signal); anything else belongs to an already-terminal stream.
    async fn ensure_remote(&mut self, id: u64) -> bool {
        let peer_bits = match self.core.role() {
            Role::Client => 0x1,
            Role::Server => 0x0,
        };
        if id & 0x1 != peer_bits {
            tracing::trace!("data for unknown local stream {id}");
            return false;
        }
        let dir = if id & 0x2 == 0 { Dir::Bi } else { Dir::Uni };
        self.remote_open(id, dir).await;
        self.streams.contains_key(&id)
    }

    /// Flush whatever the stream's credit allows, then reap it if done.
    async fn flush_stream(&mut self, id: u64) {
        let Some(ctrl) = self.streams.get_mut(&id) else {
            return;
        };
        let out = ctrl.pump_send();
        for (data, fin) in out {
            self.core.stats.bytes_sent += data.len() as u64;
            self.send_action(TransportAction::Write { id, data, fin }).await;
        }
        self.remove_if_terminal(id).await;
    }

    /// Drop-oldest, never-block delivery of queued datagrams.
    fn flush_datagrams(&mut self) {
        let Some(actions) = &self.actions else {
            return;
        };
        while let Some(data) = self.core.pop_dgram_out() {
            match actions.try_send(TransportAction::Datagram(data)) {
                Ok(()) => self.core.stats.datagrams_sent += 1,
                Err(mpsc::error::TrySendError::Full(TransportAction::Datagram(data))) => {
                    // Transport is busy; requeue and retry on the next drain.
                    self.core.push_dgram_out_front(data);
                    break;
                }
                Err(_) => break,
            }
        }
    }

    async fn remove_if_terminal(&mut self, id: u64) {
        let terminal = self
            .streams
            .get(&id)
            .map(|ctrl| ctrl.is_terminal())
            .unwrap_or(false);
        if !terminal {
            return;
        }
        if let Some(ctrl) = self.streams.remove(&id) {
            if ctrl.initiator == Initiator::Local {
                self.core.release_local(ctrl.dir);
                Box::pin(self.pump_opens()).await;
            }
        }
    }

    /// Local graceful close; idempotent after the first call.
    async fn graceful_close(&mut self, code: u32, reason: String) {
        if self.core.terminal_error().is_some() {
            return;
        }
        self.send_action(TransportAction::Close {
            code,
            reason: reason.clone(),
        })
        .await;
        self.terminal(SessionError::Closed { code, reason });
    }

    /// Transition to `failed` without telling the peer anything; dropping
    /// the action channel makes the carrier shut the byte stream down.
    fn fail(&mut self, err: SessionError) {
        self.terminal(err);
    }

    fn terminal(&mut self, err: SessionError) {
        if !self.core.terminate(err.clone()) {
            return;
        }
        tracing::debug!("session terminal: {err}");
        self.core.drain_pending_opens(&err);
        for (_, mut ctrl) in self.streams.drain() {
            ctrl.fail(&err);
        }
        self.phase_tx.send_replace(Phase::Terminal(err));
        // Closing these tells accept/read loops the sequence is finite.
        self.incoming_bi = None;
        self.incoming_uni = None;
        self.dgram_in = None;
        self.actions = None;
    }

    async fn send_action(&mut self, action: TransportAction) {
        let Some(actions) = &self.actions else {
            return;
        };
        if actions.send(action).await.is_err() {
            // Carrier is gone; everything below us is dead.
            self.actions = None;
            self.fail(SessionError::TransportIo(
                "transport action channel closed".into(),
            ));
        }
    }
}
