use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use url::Url;

use crate::bridge::{Command, TransportAction, TransportEvent};
use crate::capsule::MAX_REASON_LEN;
use crate::config::Config;
use crate::error::SessionError;
use crate::recv::RecvStream;
use crate::send::SendStream;
use crate::stream::Dir;

/// Endpoint role. Decides stream-id parity so both peers can allocate ids
/// without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle phase, published through a watch channel so every observer
/// sees the terminal transition exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    Connected,
    Draining,
    Terminal(SessionError),
}

/// Aggregate counters for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub datagrams_sent: u64,
    pub datagrams_recv: u64,
    /// Outgoing datagrams discarded under queue pressure plus incoming ones
    /// discarded because the caller was not reading.
    pub datagrams_dropped: u64,
    pub streams_opened: u64,
    pub streams_accepted: u64,
    /// Latest round-trip estimate reported by the transport, if any.
    pub rtt: Option<Duration>,
}

pub(crate) enum PendingOpen {
    Bi(oneshot::Sender<Result<(SendStream, RecvStream), SessionError>>),
    Uni(oneshot::Sender<Result<SendStream, SessionError>>),
}

impl PendingOpen {
    fn abandoned(&self) -> bool {
        match self {
            PendingOpen::Bi(reply) => reply.is_closed(),
            PendingOpen::Uni(reply) => reply.is_closed(),
        }
    }

    pub(crate) fn fail(self, err: SessionError) {
        match self {
            PendingOpen::Bi(reply) => {
                let _ = reply.send(Err(err));
            }
            PendingOpen::Uni(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Concurrent-stream window for locally-initiated streams of one direction.
/// `limit` starts at the configured value and only ever rises; a stream
/// reaching a terminal state releases exactly one slot.
struct StreamWindow {
    limit: u64,
    opened: u64,
    released: u64,
}

impl StreamWindow {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            opened: 0,
            released: 0,
        }
    }

    fn has_room(&self) -> bool {
        self.opened - self.released < self.limit
    }
}

/// The per-connection state machine. Owned and mutated only by the event
/// bridge, which serializes every transition.
pub(crate) struct SessionCore {
    role: Role,
    pub config: Config,
    phase: Phase,
    pub stats: SessionStats,

    bidi: StreamWindow,
    uni: StreamWindow,
    next_bidi_id: u64,
    next_uni_id: u64,
    pending_bidi: VecDeque<PendingOpen>,
    pending_uni: VecDeque<PendingOpen>,

    // Highest peer-initiated id seen, per direction, for the
    // monotonic-increase acceptance rule.
    peer_high_bidi: Option<u64>,
    peer_high_uni: Option<u64>,

    dgram_out: VecDeque<Bytes>,
}

impl SessionCore {
    pub fn new(role: Role, config: Config) -> Self {
        // Two low bits of a stream id: initiator parity and direction.
        let (bidi_bits, uni_bits) = match role {
            Role::Client => (0x0, 0x2),
            Role::Server => (0x1, 0x3),
        };
        Self {
            role,
            bidi: StreamWindow::new(config.max_streams_bidi),
            uni: StreamWindow::new(config.max_streams_uni),
            config,
            phase: Phase::Connecting,
            stats: SessionStats::default(),
            next_bidi_id: bidi_bits,
            next_uni_id: uni_bits,
            pending_bidi: VecDeque::new(),
            pending_uni: VecDeque::new(),
            peer_high_bidi: None,
            peer_high_uni: None,
            dgram_out: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn terminal_error(&self) -> Option<&SessionError> {
        match &self.phase {
            Phase::Terminal(err) => Some(err),
            _ => None,
        }
    }

    /// Handshake success. True only on the first report.
    pub fn on_ready(&mut self) -> bool {
        if self.phase == Phase::Connecting {
            self.phase = Phase::Connected;
            true
        } else {
            false
        }
    }

    /// Peer will not accept new streams; existing ones keep working.
    pub fn on_goaway(&mut self) -> bool {
        if self.phase == Phase::Connected {
            self.phase = Phase::Draining;
            true
        } else {
            false
        }
    }

    /// Enter the terminal phase. True only on the first transition; every
    /// later close or failure is a no-op.
    pub fn terminate(&mut self, err: SessionError) -> bool {
        if matches!(self.phase, Phase::Terminal(_)) {
            return false;
        }
        self.phase = Phase::Terminal(err);
        true
    }

    /// Queue a locally-requested open. Granting happens in FIFO order per
    /// direction as credit allows; see [`Self::next_grant`].
    pub fn queue_open(&mut self, open: PendingOpen) {
        if let Some(err) = self.terminal_error() {
            open.fail(err.clone());
            return;
        }
        match open {
            PendingOpen::Bi(_) => self.pending_bidi.push_back(open),
            PendingOpen::Uni(_) => self.pending_uni.push_back(open),
        }
    }

    /// Pop the next open request that can be satisfied right now, assigning
    /// its stream id. Abandoned requests release their slot silently.
    pub fn next_grant(&mut self) -> Option<(Dir, u64, PendingOpen)> {
        if self.phase != Phase::Connected {
            return None;
        }
        for dir in [Dir::Bi, Dir::Uni] {
            let (queue, window, next_id) = match dir {
                Dir::Bi => (
                    &mut self.pending_bidi,
                    &mut self.bidi,
                    &mut self.next_bidi_id,
                ),
                Dir::Uni => (&mut self.pending_uni, &mut self.uni, &mut self.next_uni_id),
            };
            while let Some(front) = queue.front() {
                if front.abandoned() {
                    queue.pop_front();
                    continue;
                }
                if !window.has_room() {
                    break;
                }
                let open = queue.pop_front().expect("front exists");
                window.opened += 1;
                self.stats.streams_opened += 1;
                let id = *next_id;
                *next_id += 4;
                return Some((dir, id, open));
            }
        }
        None
    }

    /// A locally-initiated stream reached a terminal state; one queued open
    /// may now proceed.
    pub fn release_local(&mut self, dir: Dir) {
        match dir {
            Dir::Bi => self.bidi.released += 1,
            Dir::Uni => self.uni.released += 1,
        }
    }

    /// Peer raised the concurrent-stream limit. Limits never decrease.
    pub fn raise_limit(&mut self, dir: Dir, max: u64) {
        let window = match dir {
            Dir::Bi => &mut self.bidi,
            Dir::Uni => &mut self.uni,
        };
        window.limit = window.limit.max(max);
    }

    /// Validate a peer-initiated stream id: correct parity for the peer's
    /// role and direction, strictly increasing per initiator.
    pub fn accept_remote(&mut self, id: u64, dir: Dir) -> Result<(), String> {
        let expected_bits = match (self.role, dir) {
            (Role::Client, Dir::Bi) => 0x1,
            (Role::Client, Dir::Uni) => 0x3,
            (Role::Server, Dir::Bi) => 0x0,
            (Role::Server, Dir::Uni) => 0x2,
        };
        if id & 0x3 != expected_bits {
            return Err(format!("stream id {id:#x} has wrong initiator/direction bits"));
        }
        let high = match dir {
            Dir::Bi => &mut self.peer_high_bidi,
            Dir::Uni => &mut self.peer_high_uni,
        };
        if high.is_some_and(|h| id <= h) {
            return Err(format!("stream id {id:#x} not monotonically increasing"));
        }
        *high = Some(id);
        self.stats.streams_accepted += 1;
        Ok(())
    }

    /// Queue an outgoing datagram, dropping the oldest queued one when the
    /// queue is saturated. Never blocks the sender.
    pub fn push_dgram_out(&mut self, data: Bytes) {
        if self.dgram_out.len() >= self.config.datagram_send_queue {
            self.dgram_out.pop_front();
            self.stats.datagrams_dropped += 1;
        }
        self.dgram_out.push_back(data);
    }

    pub fn pop_dgram_out(&mut self) -> Option<Bytes> {
        self.dgram_out.pop_front()
    }

    /// Put back a datagram the transport could not take yet.
    pub fn push_dgram_out_front(&mut self, data: Bytes) {
        self.dgram_out.push_front(data);
    }

    /// Fail every queued open with the terminal error.
    pub fn drain_pending_opens(&mut self, err: &SessionError) {
        for open in self.pending_bidi.drain(..).chain(self.pending_uni.drain(..)) {
            open.fail(err.clone());
        }
    }
}

/// An established WebTransport session.
///
/// Cheap to clone; all clones drive the same connection. Dropping every
/// clone closes the session with code 0.
#[derive(Clone, Debug)]
pub struct Session {
    cmd: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
    incoming_bi: Arc<Mutex<mpsc::UnboundedReceiver<(SendStream, RecvStream)>>>,
    incoming_uni: Arc<Mutex<mpsc::UnboundedReceiver<RecvStream>>>,
    datagrams: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    url: Option<Url>,
}

impl Session {
    pub(crate) fn new(
        cmd: mpsc::UnboundedSender<Command>,
        phase: watch::Receiver<Phase>,
        incoming_bi: mpsc::UnboundedReceiver<(SendStream, RecvStream)>,
        incoming_uni: mpsc::UnboundedReceiver<RecvStream>,
        datagrams: mpsc::Receiver<Bytes>,
        url: Option<Url>,
    ) -> Self {
        Self {
            cmd,
            phase,
            incoming_bi: Arc::new(Mutex::new(incoming_bi)),
            incoming_uni: Arc::new(Mutex::new(incoming_uni)),
            datagrams: Arc::new(Mutex::new(datagrams)),
            url,
        }
    }

    /// Drive a session over a native QUIC engine, or any other transport
    /// shim: the adapter feeds normalized [`TransportEvent`]s into `events`
    /// and applies every [`TransportAction`] it receives from `actions`.
    ///
    /// The returned session resolves [`Self::ready`] once the adapter
    /// reports [`TransportEvent::Ready`], or fails it after the configured
    /// connect timeout.
    pub fn attach(
        role: Role,
        config: Config,
        events: mpsc::Receiver<TransportEvent>,
        actions: mpsc::Sender<TransportAction>,
        url: Option<Url>,
    ) -> Session {
        crate::bridge::spawn(role, config, events, actions, url, false)
    }

    /// The URL this session was connected or accepted with, when known.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Resolves once the handshake completes, or with the failure that
    /// prevented it. Resolves immediately on an already-ready session.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut phase = self.phase.clone();
        let result = phase
            .wait_for(|p| !matches!(p, Phase::Connecting))
            .await
            .map_err(|_| SessionError::TransportIo("session dropped".into()))?;
        match &*result {
            Phase::Terminal(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Resolves when the session reaches its terminal state. Every caller
    /// observes the same single resolution.
    pub async fn closed(&self) -> SessionError {
        let mut phase = self.phase.clone();
        let result = match phase.wait_for(|p| matches!(p, Phase::Terminal(_))).await {
            Ok(p) => match &*p {
                Phase::Terminal(err) => err.clone(),
                _ => unreachable!("wait_for matched terminal"),
            },
            Err(_) => SessionError::TransportIo("session dropped".into()),
        };
        result
    }

    /// Resolves when the peer stops accepting new streams. Errors with the
    /// terminal outcome if the session ends without draining first.
    pub async fn draining(&self) -> Result<(), SessionError> {
        let mut phase = self.phase.clone();
        let result = phase
            .wait_for(|p| matches!(p, Phase::Draining | Phase::Terminal(_)))
            .await
            .map_err(|_| SessionError::TransportIo("session dropped".into()))?;
        match &*result {
            Phase::Terminal(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Why the session ended, or `None` while it is still live.
    pub fn close_reason(&self) -> Option<SessionError> {
        match &*self.phase.borrow() {
            Phase::Terminal(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Open a bidirectional stream.
    ///
    /// When the peer's concurrent-stream credit is exhausted the request
    /// queues and resolves in FIFO order as streams close or the limit
    /// rises. Dropping the future releases its place in line.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Command::OpenBi { reply })?;
        rx.await
            .map_err(|_| self.terminal_or_dropped())?
    }

    /// Open a unidirectional (send-only) stream. Queues like [`Self::open_bi`].
    pub async fn open_uni(&self) -> Result<SendStream, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Command::OpenUni { reply })?;
        rx.await
            .map_err(|_| self.terminal_or_dropped())?
    }

    /// Accept the next peer-initiated bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), SessionError> {
        self.incoming_bi
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.terminal_or_dropped())
    }

    /// Accept the next peer-initiated unidirectional stream.
    pub async fn accept_uni(&self) -> Result<RecvStream, SessionError> {
        self.incoming_uni
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.terminal_or_dropped())
    }

    /// Send a best-effort datagram. Never blocks: under transport pressure
    /// the oldest not-yet-sent datagram is dropped instead.
    pub fn send_datagram(&self, data: Bytes) -> Result<(), SessionError> {
        if let Some(err) = self.close_reason() {
            return Err(err);
        }
        self.send_cmd(Command::SendDatagram(data))
    }

    /// Receive the next datagram. The sequence is unordered and finite only
    /// at session close, which surfaces as the terminal error.
    pub async fn read_datagram(&self) -> Result<Bytes, SessionError> {
        self.datagrams
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.terminal_or_dropped())
    }

    /// Close the session with a code and reason. Idempotent: only the first
    /// close takes effect. The reason is bounded by the wire format.
    pub fn close(&self, code: u32, reason: &str) -> Result<(), SessionError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(SessionError::ReasonTooLong);
        }
        // Ignore send failures: the driver is gone only once terminal.
        let _ = self.cmd.send(Command::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Stop accepting new streams from the peer while letting existing
    /// streams finish.
    pub fn drain(&self) {
        let _ = self.cmd.send(Command::Drain);
    }

    /// Snapshot of the session counters.
    pub async fn stats(&self) -> SessionStats {
        let (reply, rx) = oneshot::channel();
        if self.send_cmd(Command::Stats { reply }).is_err() {
            return SessionStats::default();
        }
        rx.await.unwrap_or_default()
    }

    fn send_cmd(&self, cmd: Command) -> Result<(), SessionError> {
        self.cmd
            .send(cmd)
            .map_err(|_| self.terminal_or_dropped())
    }

    fn terminal_or_dropped(&self) -> SessionError {
        self.close_reason()
            .unwrap_or_else(|| SessionError::TransportIo("session dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(limit_bidi: u64) -> SessionCore {
        let config = Config {
            max_streams_bidi: limit_bidi,
            ..Config::default()
        };
        SessionCore::new(Role::Client, config)
    }

    fn bi_open() -> (
        PendingOpen,
        oneshot::Receiver<Result<(SendStream, RecvStream), SessionError>>,
    ) {
        let (reply, rx) = oneshot::channel();
        (PendingOpen::Bi(reply), rx)
    }

    #[test]
    fn grants_fifo_within_limit_then_queues() {
        let mut core = core(2);
        assert!(core.on_ready());
        let mut replies = Vec::new();
        for _ in 0..3 {
            let (open, rx) = bi_open();
            core.queue_open(open);
            replies.push(rx);
        }

        let first = core.next_grant().map(|(d, id, _)| (d, id));
        let second = core.next_grant().map(|(d, id, _)| (d, id));
        assert_eq!(first, Some((Dir::Bi, 0)));
        assert_eq!(second, Some((Dir::Bi, 4)));
        assert!(core.next_grant().is_none());

        // One stream closing releases exactly one queued request.
        core.release_local(Dir::Bi);
        let third = core.next_grant().map(|(d, id, _)| (d, id));
        assert_eq!(third, Some((Dir::Bi, 8)));
        assert!(core.next_grant().is_none());
        drop(replies);
    }

    #[test]
    fn no_grants_before_ready() {
        let mut core = core(2);
        let (open, _rx) = bi_open();
        core.queue_open(open);
        assert!(core.next_grant().is_none());
        core.on_ready();
        assert!(core.next_grant().is_some());
    }

    #[test]
    fn raised_limit_unblocks_queue() {
        let mut core = core(1);
        core.on_ready();
        let mut replies = Vec::new();
        for _ in 0..2 {
            let (open, rx) = bi_open();
            core.queue_open(open);
            replies.push(rx);
        }
        assert!(core.next_grant().is_some());
        assert!(core.next_grant().is_none());
        core.raise_limit(Dir::Bi, 2);
        assert!(core.next_grant().is_some());
        drop(replies);
    }

    #[test]
    fn abandoned_request_releases_slot() {
        let mut core = core(1);
        core.on_ready();
        let (open, rx) = bi_open();
        core.queue_open(open);
        let (open2, _rx2) = bi_open();
        core.queue_open(open2);

        // First caller walks away; the second gets the slot.
        drop(rx);
        let granted = core.next_grant().map(|(d, id, _)| (d, id));
        assert_eq!(granted, Some((Dir::Bi, 0)));
    }

    #[test]
    fn remote_ids_must_increase() {
        let mut core = core(10);
        core.on_ready();
        assert!(core.accept_remote(1, Dir::Bi).is_ok());
        assert!(core.accept_remote(5, Dir::Bi).is_ok());
        assert!(core.accept_remote(5, Dir::Bi).is_err());
        assert!(core.accept_remote(1, Dir::Bi).is_err());
        // Wrong parity: client-initiated bidi id offered to a client.
        assert!(core.accept_remote(8, Dir::Bi).is_err());
    }

    #[test]
    fn terminal_transition_happens_once() {
        let mut core = core(1);
        assert!(core.terminate(SessionError::Closed {
            code: 0,
            reason: String::new(),
        }));
        assert!(!core.terminate(SessionError::HandshakeTimeout));
        assert_eq!(
            core.terminal_error(),
            Some(&SessionError::Closed {
                code: 0,
                reason: String::new(),
            })
        );
    }

    #[test]
    fn datagram_queue_drops_oldest() {
        let mut core = core(1);
        core.config.datagram_send_queue = 2;
        core.push_dgram_out(Bytes::from_static(b"a"));
        core.push_dgram_out(Bytes::from_static(b"b"));
        core.push_dgram_out(Bytes::from_static(b"c"));
        assert_eq!(core.stats.datagrams_dropped, 1);
        assert_eq!(core.pop_dgram_out().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(core.pop_dgram_out().unwrap(), Bytes::from_static(b"c"));
        assert!(core.pop_dgram_out().is_none());
    }
}
