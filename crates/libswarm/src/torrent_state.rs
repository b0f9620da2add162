// The live state of one torrent: the peer table, availability stats,
// assignments, the block assembler and the piece store, plus the
// periodic tasks (choker, PEX producer, assignment expiry) that drive
// them. Lock order is peers first, then the global state; never the
// reverse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bencode::{ByteBuf, ByteBufOwned, CloneToOwned};
use parking_lot::RwLock;
use peer_wire::extended::handshake::ExtendedHandshake;
use peer_wire::extended::pex::UtPex;
use peer_wire::extended::{ExtendedMessage, PeerExtendedMessageIds};
use peer_wire::{Handshake, MessageBorrowed, MessageOwned, Piece, Request};
use swarm_core::hash_id::Id20;
use swarm_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};
use swarm_core::spawn_utils::spawn_with_cancel;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn};

use crate::assembler::{BlockAssembler, BlockMarkingResult};
use crate::assignments::Assignments;
use crate::availability::PieceStatistics;
use crate::choker::{Choker, ChokerPeer};
use crate::config::{Config, EncryptionPolicy};
use crate::connection_state::{BlockRead, ConnectionKey};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::metainfo::Torrent;
use crate::peer_connection::{
    PeerConnection, PeerConnectionHandler, PeerConnectionOptions, PeerRx, PeerTx, WriterRequest,
};
use crate::peers::{PeerState, PeerStates};
use crate::pex_source::PexSource;
use crate::piece_store::{DataDescriptor, PieceCommitResult};
use crate::selector::Selector;
use crate::type_aliases::{PeerHandle, BF};

/// Consecutive storage failures on one piece before the descriptor is
/// declared stalled.
const MAX_PIECE_IO_FAILURES: u32 = 3;

struct SessionLocked {
    assembler: BlockAssembler,
    assignments: Assignments,
    piece_stats: PieceStatistics,
    /// Pieces wanted by the current file selection.
    selected: BF,
    io_failures: HashMap<u32, u32>,
}

#[derive(Default)]
struct AtomicSessionStats {
    fetched_bytes: AtomicU64,
    uploaded_bytes: AtomicU64,
}

pub struct TorrentSession {
    torrent: Arc<Torrent>,
    lengths: Lengths,
    data: Arc<DataDescriptor>,
    config: Arc<Config>,
    selector: Selector,
    peers: PeerStates,
    locked: RwLock<SessionLocked>,
    stats: AtomicSessionStats,
    pex: Arc<PexSource>,
    event_bus: EventBus,
    my_peer_id: Id20,
    extended_handshake: ExtendedHandshake<ByteBufOwned>,
    peer_queue_tx: UnboundedSender<PeerHandle>,
    completion_tx: tokio::sync::watch::Sender<bool>,
    cancellation_token: CancellationToken,
    /// Engine-wide monotonic epoch; PEX instants are milliseconds
    /// since this point.
    epoch: Instant,
}

/// Builds the extended handshake advertised for a torrent. The
/// encryption-policy switch this mirrors falls through between cases,
/// so the 0 written for the plaintext policies is overwritten and
/// every policy ends up advertising e=1.
fn build_extended_handshake(config: &Config) -> ExtendedHandshake<ByteBufOwned> {
    let mut h: ExtendedHandshake<ByteBufOwned> = ExtendedHandshake::new();
    if matches!(
        config.encryption_policy,
        EncryptionPolicy::RequirePlaintext | EncryptionPolicy::PreferPlaintext
    ) {
        h.e = Some(0);
    }
    h.e = Some(1);
    h.p = Some(config.acceptor_port as u32);
    h.v = Some(ByteBufOwned::from(config.client_version.as_bytes()));
    h
}

fn selected_pieces_for_files(torrent: &Torrent, lengths: &Lengths, only_files: &[usize]) -> BF {
    let mut bf = BF::repeat(false, lengths.total_pieces() as usize);
    let mut offset = 0u64;
    for (idx, file) in torrent.files.iter().enumerate() {
        if file.length > 0 && only_files.contains(&idx) {
            let first = (offset / lengths.default_piece_length() as u64) as usize;
            let last = ((offset + file.length - 1) / lengths.default_piece_length() as u64) as usize;
            for piece in first..=last {
                bf.set(piece, true);
            }
        }
        offset += file.length;
    }
    bf
}

impl TorrentSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        torrent: Arc<Torrent>,
        data: Arc<DataDescriptor>,
        config: Arc<Config>,
        selector: Selector,
        pex: Arc<PexSource>,
        event_bus: EventBus,
        my_peer_id: Id20,
        epoch: Instant,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let lengths = *data.lengths();
        let (peer_queue_tx, peer_queue_rx) = unbounded_channel();
        let (completion_tx, _) = tokio::sync::watch::channel(data.is_complete());

        let session = Arc::new(Self {
            extended_handshake: build_extended_handshake(&config),
            lengths,
            data,
            selector,
            peers: PeerStates::default(),
            locked: RwLock::new(SessionLocked {
                assembler: BlockAssembler::new(lengths),
                assignments: Assignments::new(
                    config.max_assigned_pieces_per_peer,
                    config.assignment_deadline,
                ),
                piece_stats: PieceStatistics::new(lengths.total_pieces()),
                selected: BF::repeat(true, lengths.total_pieces() as usize),
                io_failures: HashMap::new(),
            }),
            stats: AtomicSessionStats::default(),
            pex,
            event_bus,
            my_peer_id,
            config,
            torrent,
            peer_queue_tx,
            completion_tx,
            cancellation_token,
            epoch,
        });

        session.spawn(
            debug_span!("peer_adder", torrent = %session.info_hash()),
            session.clone().task_peer_adder(peer_queue_rx),
        );
        session.spawn(
            debug_span!("choker", torrent = %session.info_hash()),
            session.clone().task_choker(),
        );
        session.spawn(
            debug_span!("pex_producer", torrent = %session.info_hash()),
            session.clone().task_pex_producer(),
        );
        session.spawn(
            debug_span!("assignment_expiry", torrent = %session.info_hash()),
            session.clone().task_assignment_expiry(),
        );
        Ok(session)
    }

    fn spawn(
        &self,
        span: tracing::Span,
        fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        spawn_with_cancel(span, self.cancellation_token.clone(), fut);
    }

    pub fn info_hash(&self) -> Id20 {
        self.torrent.info_hash
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn data(&self) -> &Arc<DataDescriptor> {
        &self.data
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn connection_key(&self, addr: PeerHandle) -> ConnectionKey {
        ConnectionKey {
            torrent_id: self.info_hash(),
            peer: addr,
        }
    }

    pub fn is_finished(&self) -> bool {
        let g = self.locked.read();
        self.selection_finished(&g)
    }

    fn selection_finished(&self, g: &SessionLocked) -> bool {
        let verified = self.data.verified_bitfield();
        g.selected
            .iter_ones()
            .all(|idx| verified.get(idx).map(|b| *b).unwrap_or(false))
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.data.verified_bytes()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.stats.uploaded_bytes.load(Ordering::Relaxed)
    }

    /// Restricts the download to the given files (by index).
    pub fn update_only_files(&self, only_files: &[usize]) {
        let selected = selected_pieces_for_files(&self.torrent, &self.lengths, only_files);
        let mut g = self.locked.write();
        g.selected = selected;
        self.event_bus.emit(self.info_hash(), EventKind::FilesChosen);
    }

    /// Queues a discovered peer; false if we already know it.
    pub fn add_peer(&self, addr: PeerHandle) -> bool {
        if !self.peers.add_if_not_seen(addr) {
            return false;
        }
        self.event_bus
            .emit(self.info_hash(), EventKind::PeerDiscovered(addr));
        if self.peer_queue_tx.send(addr).is_err() {
            return false;
        }
        true
    }

    pub async fn wait_until_completed(&self) {
        let mut rx = self.completion_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn completion_receiver(&self) -> tokio::sync::watch::Receiver<bool> {
        self.completion_tx.subscribe()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stop the torrent: cancels every task of this session, which
    /// closes the connections they own. In-flight storage operations
    /// complete but their results are discarded with the tasks.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
        for addr in self.peers.live_addrs() {
            self.peers.with_live(addr, |live| {
                let _ = live.tx.send(WriterRequest::Disconnect);
            });
        }
    }

    async fn task_peer_adder(
        self: Arc<Self>,
        mut peer_queue_rx: UnboundedReceiver<PeerHandle>,
    ) -> anyhow::Result<()> {
        loop {
            let addr = match peer_queue_rx.recv().await {
                Some(addr) => addr,
                None => return Ok(()),
            };
            if self.is_finished() && self.data.is_complete() {
                debug!("ignoring peer {} as we are finished", addr);
                self.peers.mark_not_needed(addr);
                continue;
            }
            let session = self.clone();
            self.spawn(
                debug_span!("manage_peer", peer = %addr),
                async move { session.task_manage_outgoing_peer(addr).await },
            );
        }
    }

    async fn task_manage_outgoing_peer(self: Arc<Self>, addr: PeerHandle) -> anyhow::Result<()> {
        let (rx, tx) = match self.peers.mark_peer_connecting(addr) {
            Some(pair) => pair,
            None => return Ok(()),
        };

        let handler = PeerHandler::new(self.clone(), addr, tx, false);
        let options = PeerConnectionOptions {
            connect_timeout: self.config.peer_connect_timeout,
            keep_alive_interval: self.config.keep_alive_interval,
        };
        let conn = PeerConnection::new(addr, self.info_hash(), self.my_peer_id, &handler, options);

        let res = tokio::select! {
            r = conn.manage_peer_outgoing(rx) => r,
            r = handler.task_request_producer() => r.map_err(Error::Anyhow),
        };

        match res {
            Ok(()) => handler.on_peer_died(None),
            Err(e) => {
                debug!("error managing peer {}: {:#}", addr, e);
                handler.on_peer_died(Some(e));
            }
        }
        Ok(())
    }

    /// Hands an accepted connection (handshake already consumed by the
    /// acceptor) to this torrent.
    pub(crate) fn add_incoming_peer(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        handshake: Handshake,
        read_buf: Vec<u8>,
        read_so_far: usize,
    ) -> Result<()> {
        let addr = stream.peer_addr().map_err(Error::Connect)?;
        let (tx, rx) = unbounded_channel();
        if !self.peers.incoming_to_live(addr, handshake.peer_id, tx.clone()) {
            return Err(Error::Anyhow(anyhow::anyhow!("peer {addr} already active")));
        }
        self.on_peer_live(addr, false);

        let session = self.clone();
        self.spawn(debug_span!("manage_incoming_peer", peer = %addr), async move {
            let handler = PeerHandler::new(session.clone(), addr, tx, true);
            let options = PeerConnectionOptions {
                connect_timeout: session.config.peer_connect_timeout,
                keep_alive_interval: session.config.keep_alive_interval,
            };
            let conn = PeerConnection::new(
                addr,
                session.info_hash(),
                session.my_peer_id,
                &handler,
                options,
            );
            let res = tokio::select! {
                r = conn.manage_peer_incoming(stream, handshake, read_buf, read_so_far, rx) => r,
                r = handler.task_request_producer() => r.map_err(Error::Anyhow),
            };
            match res {
                Ok(()) => handler.on_peer_died(None),
                Err(e) => {
                    debug!("error managing incoming peer {}: {:#}", addr, e);
                    handler.on_peer_died(Some(e));
                }
            }
            Ok(())
        });
        Ok(())
    }

    /// Common bookkeeping once a connection reaches the live state.
    /// Only peers we dialed have a known listening port worth
    /// gossiping; an incoming peer's is learned from its extended
    /// handshake later.
    fn on_peer_live(&self, addr: PeerHandle, outgoing: bool) {
        self.event_bus
            .emit(self.info_hash(), EventKind::PeerConnected(addr));
        if outgoing {
            self.pex.on_peer_connected(self.info_hash(), addr, self.now_ms());
        }
    }

    async fn task_choker(self: Arc<Self>) -> anyhow::Result<()> {
        let mut choker = Choker::new(
            self.config.regular_unchoke_slots,
            self.config.optimistic_unchoke_every,
        );
        let mut interval = tokio::time::interval(self.config.choke_interval);
        loop {
            interval.tick().await;
            self.run_choker_tick(&mut choker);
        }
    }

    fn run_choker_tick(&self, choker: &mut Choker) {
        let seeding = self.data.is_complete();
        let mut inputs = Vec::new();
        for addr in self.peers.live_addrs() {
            let entry = self.peers.with_peer(addr, |p| {
                let transferred = if seeding {
                    p.stats.uploaded.load(Ordering::Relaxed)
                } else {
                    p.stats.downloaded.load(Ordering::Relaxed)
                };
                (transferred, matches!(&p.state, PeerState::Live(_)))
            });
            if let Some((transferred, true)) = entry {
                let (interested, choked) = self
                    .peers
                    .with_live(addr, |l| (l.conn.peer_interested, l.conn.choking))
                    .unwrap_or((false, true));
                inputs.push(ChokerPeer {
                    peer: addr,
                    interested,
                    choked,
                    transferred,
                });
            }
        }

        for decision in choker.tick(&inputs) {
            self.peers.with_live_mut(decision.peer, |live| {
                if live.conn.choking == decision.should_choke {
                    return;
                }
                live.conn.choking = decision.should_choke;
                let msg = if decision.should_choke {
                    live.conn.last_choked = Some(Instant::now());
                    MessageOwned::Choke
                } else {
                    MessageOwned::Unchoke
                };
                let _ = live.tx.send(WriterRequest::Message(msg));
            });
        }
    }

    async fn task_pex_producer(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(7));
        loop {
            interval.tick().await;
            let now_ms = self.now_ms();
            for addr in self.peers.live_addrs() {
                let key = self.connection_key(addr);
                if let Some(msg) = self.pex.produce(&key, now_ms) {
                    self.peers.with_live(addr, |live| {
                        let _ = live
                            .tx
                            .send(WriterRequest::Message(MessageOwned::Extended(
                                ExtendedMessage::UtPex(msg),
                            )));
                    });
                }
            }
        }
    }

    async fn task_assignment_expiry(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.expire_assignments();
        }
    }

    fn expire_assignments(&self) {
        let expired = {
            let mut g = self.locked.write();
            g.assignments.expire(Instant::now())
        };
        for (piece, addr) in expired {
            debug!("assignment of piece {} to {} expired", piece, addr);
            self.peers.with_peer(addr, |p| {
                p.stats.failures.fetch_add(1, Ordering::Relaxed);
            });
            self.cancel_pending_for_piece(addr, piece);
        }
    }

    /// Sends CANCEL for (and forgets) everything pending towards
    /// `addr` for `piece`; used when the piece got verified elsewhere
    /// or the assignment moved on.
    fn cancel_pending_for_piece(&self, addr: PeerHandle, piece: ValidPieceIndex) {
        self.peers.with_live_mut(addr, |live| {
            let obsolete: Vec<BlockInfo> = live
                .conn
                .pending_requests
                .iter()
                .filter(|b| b.piece_index == piece)
                .copied()
                .collect();
            for block in obsolete {
                live.conn.pending_requests.remove(&block);
                let _ = live.tx.send(WriterRequest::Message(MessageOwned::Cancel(
                    Request::from(&block),
                )));
            }
            live.conn
                .request_queue
                .retain(|b| b.piece_index != piece);
        });
    }

    fn broadcast_have(&self, piece: ValidPieceIndex, exclude: PeerHandle) {
        for addr in self.peers.live_addrs() {
            if addr == exclude {
                continue;
            }
            self.peers.with_live(addr, |live| {
                if !live.conn.has_piece(piece.get()) {
                    let _ = live
                        .tx
                        .send(WriterRequest::Message(MessageOwned::Have(piece.get())));
                }
            });
        }
    }

    fn on_download_finished(&self) {
        info!("torrent {:?} finished downloading", self.info_hash());
        let _ = self.completion_tx.send(true);
        self.event_bus
            .emit(self.info_hash(), EventKind::DownloadComplete);

        // Nothing left to say to peers that also have everything.
        for addr in self.peers.live_addrs() {
            let full = self
                .peers
                .with_live(addr, |live| {
                    live.conn
                        .bitfield
                        .get(0..self.lengths.total_pieces() as usize)
                        .map(|s| s.all())
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if full {
                self.peers.with_live(addr, |live| {
                    let _ = live.tx.send(WriterRequest::Disconnect);
                });
                self.peers.mark_not_needed(addr);
            }
        }
    }
}

/// Per-connection driver: receives the decoded messages and produces
/// requests. One of these exists per connection task.
pub(crate) struct PeerHandler {
    session: Arc<TorrentSession>,
    addr: PeerHandle,
    tx: PeerTx,
    incoming: bool,

    on_bitfield_notify: Notify,
    unchoke_notify: Notify,
    /// Pinged whenever the pending-request window may have freed up.
    requests_notify: Notify,
}

impl PeerHandler {
    pub(crate) fn new(
        session: Arc<TorrentSession>,
        addr: PeerHandle,
        tx: PeerTx,
        incoming: bool,
    ) -> Self {
        Self {
            session,
            addr,
            tx,
            incoming,
            on_bitfield_notify: Notify::new(),
            unchoke_notify: Notify::new(),
            requests_notify: Notify::new(),
        }
    }

    fn touch(&self) {
        let epoch = self.session.epoch;
        self.session.peers.with_peer(self.addr, |p| {
            p.stats.touch(epoch);
        });
    }

    pub(crate) fn on_peer_died(&self, error: Option<Error>) {
        let session = &self.session;
        let prev = match session.peers.take_for_death(self.addr) {
            Some(prev) => prev,
            None => return,
        };

        if let PeerState::Live(live) = prev {
            {
                let mut g = session.locked.write();
                if !live.conn.bitfield.is_empty() {
                    g.piece_stats.on_peer_disconnected(&live.conn.bitfield);
                }
                g.assignments.remove_peer(self.addr);
            }
            let key = session.connection_key(self.addr);
            session
                .pex
                .on_peer_disconnected(&key, self.addr, session.now_ms());
            session
                .event_bus
                .emit(session.info_hash(), EventKind::PeerDisconnected(self.addr));
        }

        let error = match error {
            Some(e) => e,
            None => {
                trace!("peer {} closed without errors, not re-queueing", self.addr);
                session.peers.mark_not_needed(self.addr);
                return;
            }
        };

        if session.is_finished() {
            session.peers.mark_not_needed(self.addr);
            return;
        }

        debug!("peer {} died: {:#}; scheduling reconnect", self.addr, error);
        match session.peers.next_backoff(self.addr) {
            Some(backoff) => {
                let session = session.clone();
                let addr = self.addr;
                session.clone().spawn(
                    debug_span!("peer_backoff", peer = %addr),
                    async move {
                        tokio::time::sleep(backoff).await;
                        if session.peers.mark_queued(addr) {
                            let _ = session.peer_queue_tx.send(addr);
                        }
                        Ok(())
                    },
                );
            }
            None => {
                debug!("dropping peer {}, backoff exhausted", self.addr);
                session.peers.drop_peer(self.addr);
            }
        }
    }

    // ---- incoming message handlers (called from the reader task) ----

    fn on_bitfield(&self, bitfield: &[u8]) -> anyhow::Result<()> {
        if bitfield.len() != self.session.lengths.piece_bitfield_bytes() {
            anyhow::bail!(
                "dropping peer: bitfield has {} bytes, expected {}",
                bitfield.len(),
                self.session.lengths.piece_bitfield_bytes()
            );
        }
        let bf = BF::from_slice(bitfield);
        self.session.peers.with_live_mut(self.addr, |live| {
            let mut g = self.session.locked.write();
            if !live.conn.bitfield.is_empty() {
                g.piece_stats.on_peer_disconnected(&live.conn.bitfield);
            }
            g.piece_stats.on_bitfield(&bf);
            live.conn.bitfield = bf;
        });
        self.session
            .event_bus
            .emit(self.session.info_hash(), EventKind::PeerBitfieldUpdated(self.addr));
        self.update_interest();
        self.on_bitfield_notify.notify_waiters();
        Ok(())
    }

    fn on_have(&self, have: u32) {
        let total = self.session.lengths.total_pieces();
        if have >= total {
            warn!("received have {} out of range", have);
            return;
        }
        self.session.peers.with_live_mut(self.addr, |live| {
            if live.conn.bitfield.is_empty() {
                live.conn.bitfield = BF::repeat(false, total as usize);
            }
            if !live.conn.bitfield[have as usize] {
                live.conn.bitfield.set(have as usize, true);
                self.session.locked.write().piece_stats.on_have(have);
            }
        });
        self.update_interest();
        self.on_bitfield_notify.notify_waiters();
    }

    fn on_choked(&self) {
        trace!("we are choked by {}", self.addr);
        self.session.peers.with_live_mut(self.addr, |live| {
            live.conn.peer_choking = true;
            // The peer is free to discard what we asked for; the
            // blocks go back to the pool and get re-queued on unchoke.
            live.conn.pending_requests.clear();
            live.conn.request_queue.clear();
        });
    }

    fn on_unchoked(&self) {
        trace!("we are unchoked by {}", self.addr);
        self.session.peers.with_live_mut(self.addr, |live| {
            live.conn.peer_choking = false;
        });
        self.unchoke_notify.notify_waiters();
        self.requests_notify.notify_waiters();
    }

    fn on_peer_interested(&self, interested: bool) {
        self.session.peers.with_live_mut(self.addr, |live| {
            live.conn.peer_interested = interested;
        });
    }

    /// Decides whether we want anything this peer has, announcing the
    /// change when the answer flips.
    fn update_interest(&self) {
        let session = &self.session;
        let needed = session
            .peers
            .with_live(self.addr, |live| {
                let g = session.locked.read();
                let verified = session.data.verified_bitfield();
                live.conn
                    .bitfield
                    .iter_ones()
                    .take_while(|idx| *idx < session.lengths.total_pieces() as usize)
                    .any(|idx| g.selected[idx] && !verified[idx])
            })
            .unwrap_or(false);

        session.peers.with_live_mut(self.addr, |live| {
            if live.conn.interested != needed {
                live.conn.interested = needed;
                let msg = if needed {
                    MessageOwned::Interested
                } else {
                    MessageOwned::NotInterested
                };
                let _ = live.tx.send(WriterRequest::Message(msg));
            }
        });
    }

    fn on_extended_handshake(&self, handshake: &ExtendedHandshake<ByteBuf>) {
        let session = &self.session;
        let key = session.connection_key(self.addr);
        if handshake.ut_pex().is_some() {
            session.pex.mark_capable(key);
        }
        // An incoming peer's listen port only becomes known here;
        // that's the address worth gossiping.
        if self.incoming {
            if let Some(port) = handshake.port() {
                let reachable = std::net::SocketAddr::new(self.addr.ip(), port);
                session
                    .pex
                    .on_peer_connected(session.info_hash(), reachable, session.now_ms());
            }
        }
        session.peers.with_live_mut(self.addr, |live| {
            live.conn.merge_extended_handshake(handshake.clone_to_owned());
        });
    }

    fn on_pex_message(&self, msg: &UtPex<ByteBuf>) {
        let session = &self.session;
        session.pex.on_pex_message(session.info_hash(), msg);
        for addr in session.pex.take_discovered(session.info_hash()) {
            session.add_peer(addr);
        }
    }

    // ---- upload path ----

    fn on_peer_request(&self, request: Request) -> anyhow::Result<()> {
        let session = &self.session;
        let block = match session.lengths.block_info_from_received_piece(
            request.index,
            request.begin,
            request.length,
        ) {
            Some(block) => block,
            None => anyhow::bail!("received invalid request {:?}", request),
        };
        if !session.data.is_verified(block.piece_index) {
            // the request is rejected, the connection stays up
            warn!(
                "peer {} requested piece {} which we don't have, dropping the request",
                self.addr, block.piece_index
            );
            return Ok(());
        }

        let accepted = session
            .peers
            .with_live_mut(self.addr, |live| {
                if live.conn.choking {
                    trace!("dropping request {:?} from choked peer", request);
                    return false;
                }
                if live.conn.enqueued_peer_requests.len()
                    >= session.config.max_enqueued_peer_requests
                {
                    warn!("peer {} has too many requests queued, dropping", self.addr);
                    return false;
                }
                live.conn.enqueued_peer_requests.insert(request)
            })
            .unwrap_or(false);
        if !accepted {
            return Ok(());
        }

        // Read on the blocking pool; the completed block lands in the
        // connection's outgoing queue via the writer channel.
        let session = self.session.clone();
        let addr = self.addr;
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; block.size as usize];
            match session
                .data
                .read_block(block.piece_index, block.offset, &mut buf)
            {
                Ok(()) => {
                    let _ = tx.send(WriterRequest::Block(BlockRead {
                        block,
                        data: buf.into(),
                    }));
                }
                Err(e) => {
                    warn!("error reading block {:?} for {}: {:#}", block, addr, e);
                    session.peers.with_live_mut(addr, |live| {
                        live.conn.enqueued_peer_requests.remove(&request);
                    });
                }
            }
        });
        Ok(())
    }

    fn on_peer_cancel(&self, request: Request) {
        self.session.peers.with_live_mut(self.addr, |live| {
            live.conn.on_peer_cancel(request);
        });
    }

    // ---- download path ----

    fn on_received_piece(&self, piece: Piece<ByteBuf>) -> anyhow::Result<()> {
        let session = &self.session;
        let block = match session.lengths.block_info_from_received_piece(
            piece.index,
            piece.begin,
            piece.len() as u32,
        ) {
            Some(block) => block,
            None => anyhow::bail!("peer sent an invalid piece {:?}", piece),
        };

        self.touch();
        let was_pending = session
            .peers
            .with_live_mut(self.addr, |live| live.conn.pending_requests.remove(&block))
            .unwrap_or(false);
        self.session.peers.with_peer(self.addr, |p| {
            p.stats.add_downloaded(piece.len() as u64);
        });
        session
            .stats
            .fetched_bytes
            .fetch_add(piece.len() as u64, Ordering::Relaxed);
        self.requests_notify.notify_waiters();

        if !was_pending {
            let endgame = session.locked.read().assignments.endgame();
            if endgame || session.data.is_verified(block.piece_index) {
                // a duplicate from the endgame race, the CANCEL lost
                trace!("duplicate block {:?} in endgame, ignoring", block);
                return Ok(());
            }
            anyhow::bail!("peer sent piece {:?} we did not ask for", piece);
        }

        let completed = {
            let mut g = session.locked.write();
            g.assembler.record_block(&block, piece.block.as_ref())
        };

        match completed {
            BlockMarkingResult::Completed(data) => {
                self.on_piece_assembled(block.piece_index, &data)?;
            }
            BlockMarkingResult::NotCompleted | BlockMarkingResult::Duplicate => {}
        }
        Ok(())
    }

    fn on_piece_assembled(&self, piece: ValidPieceIndex, data: &[u8]) -> anyhow::Result<()> {
        let session = &self.session;
        match session.data.commit_piece(piece, data) {
            Ok(PieceCommitResult::Verified) => {
                let losers: Vec<PeerHandle> = {
                    let mut g = session.locked.write();
                    g.io_failures.remove(&piece.get());
                    g.assignments
                        .complete(piece)
                        .into_iter()
                        .filter(|p| *p != self.addr)
                        .collect()
                };
                for loser in losers {
                    session.cancel_pending_for_piece(loser, piece);
                }
                session
                    .event_bus
                    .emit(session.info_hash(), EventKind::PieceVerified(piece.get()));
                debug!("piece={} downloaded and verified", piece);
                session.broadcast_have(piece, self.addr);

                if session.is_finished() {
                    session.on_download_finished();
                }
            }
            Ok(PieceCommitResult::AlreadyVerified) => {}
            Ok(PieceCommitResult::HashMismatch) => {
                // attributed to the peer that completed the piece
                session.peers.with_peer(self.addr, |p| {
                    p.stats.failures.fetch_add(1, Ordering::Relaxed);
                });
                let mut g = session.locked.write();
                g.assembler.discard(piece);
                g.assignments.fail(piece);
                warn!("piece={} failed verification, re-queueing", piece);
            }
            Err(e) => {
                // storage trouble: the piece goes back to the pool,
                // and too many strikes stall the whole descriptor
                let failures = {
                    let mut g = session.locked.write();
                    g.assembler.discard(piece);
                    g.assignments.fail(piece);
                    let failures = g.io_failures.entry(piece.get()).or_insert(0);
                    *failures += 1;
                    *failures
                };
                warn!("storage error committing piece {}: {:#}", piece, e);
                if failures >= MAX_PIECE_IO_FAILURES {
                    let err = Error::DescriptorStalled(failures, piece.get());
                    session
                        .event_bus
                        .emit(session.info_hash(), EventKind::TorrentError(err.to_string()));
                    session.cancellation_token.cancel();
                    return Err(anyhow::anyhow!(err));
                }
            }
        }
        Ok(())
    }

    // ---- outgoing request production ----

    /// Fills this peer's request queue from its assignments and sends
    /// REQUESTs up to the window. Returns how many were sent.
    pub(crate) fn produce_requests(&self) -> anyhow::Result<usize> {
        let session = &self.session;
        let window = session.config.max_pending_requests_per_peer;
        let mut sent = 0;

        loop {
            let block = session.peers.with_live_mut(self.addr, |live| {
                if live.conn.peer_choking {
                    return None;
                }
                if !live.conn.interested {
                    return None;
                }
                if live.conn.pending_requests.len() >= window {
                    return None;
                }
                loop {
                    match live.conn.request_queue.pop_front() {
                        Some(block) => {
                            if session.data.is_verified(block.piece_index) {
                                continue;
                            }
                            return Some(block);
                        }
                        None => break,
                    }
                }
                // queue empty: try to reserve more pieces for this peer
                let mut g = session.locked.write();
                self.refill_assignments(live, &mut g);
                live.conn.request_queue.pop_front()
            });

            let block = match block {
                Some(Some(block)) => block,
                _ => break,
            };

            let pushed = session
                .peers
                .with_live_mut(self.addr, |live| live.conn.pending_requests.insert(block))
                .unwrap_or(false);
            if !pushed {
                continue;
            }
            if self
                .tx
                .send(WriterRequest::Message(MessageOwned::Request(Request::from(
                    &block,
                ))))
                .is_err()
            {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Reserves new pieces for this peer under rarest-first (or
    /// whatever the configured strategy is) and queues their missing
    /// blocks. Caller holds both the peer entry and the global lock.
    fn refill_assignments(&self, live: &mut crate::peers::LivePeer, g: &mut SessionLocked) {
        let session = &self.session;
        let verified = session.data.verified_bitfield();

        // First re-queue blocks of pieces already reserved for this
        // peer: a CHOKE clears the pending set, but the reservation
        // survives until it expires.
        for piece in g.assignments.pieces_for(self.addr) {
            if verified[piece.get() as usize] {
                continue;
            }
            for block in g.assembler.missing_blocks(piece) {
                if !live.conn.pending_requests.contains(&block)
                    && !live.conn.request_queue.contains(&block)
                {
                    live.conn.request_queue.push_back(block);
                }
            }
        }

        // endgame: few unverified selected pieces left, duplicate
        // outstanding blocks across peers. The threshold scales with
        // the torrent: the configured floor or 5% of the pieces,
        // whichever is larger.
        let remaining = g
            .selected
            .iter_ones()
            .filter(|idx| !verified[*idx])
            .count() as u32;
        let threshold = std::cmp::max(
            session.config.endgame_threshold_pieces,
            session.lengths.total_pieces() / 20,
        );
        if remaining <= threshold {
            g.assignments.set_endgame(true);
        }

        // pieces we have or don't want are equally unselectable
        let mut mask = verified;
        for idx in 0..mask.len() {
            if !g.selected[idx] {
                mask.set(idx, true);
            }
        }

        let candidates: Vec<u32> = session
            .selector
            .iter_pieces(&g.piece_stats, &mask)
            .collect();
        for idx in candidates {
            if !g.assignments.peer_has_capacity(self.addr) {
                break;
            }
            if !live.conn.has_piece(idx) {
                continue;
            }
            let piece = match session.lengths.validate_piece_index(idx) {
                Some(piece) => piece,
                None => continue,
            };
            if !g.assignments.try_assign(self.addr, piece) {
                continue;
            }
            trace!("assigned piece {} to {}", piece, self.addr);
            for block in g.assembler.missing_blocks(piece) {
                if !live.conn.pending_requests.contains(&block) {
                    live.conn.request_queue.push_back(block);
                }
            }
        }
    }

    async fn wait_for_notify(&self, notify: &Notify, check: impl Fn() -> bool) {
        let notified = notify.notified();
        if check() {
            return;
        }
        notified.await;
    }

    pub(crate) async fn task_request_producer(&self) -> anyhow::Result<()> {
        let session = &self.session;
        self.wait_for_notify(&self.on_bitfield_notify, || {
            session
                .peers
                .with_live(self.addr, |l| !l.conn.bitfield.is_empty())
                .unwrap_or(false)
        })
        .await;

        loop {
            if session.is_finished() {
                self.update_interest();
                tokio::time::sleep(Duration::from_secs(60)).await;
                continue;
            }

            self.wait_for_notify(&self.unchoke_notify, || {
                session
                    .peers
                    .with_live(self.addr, |l| !l.conn.peer_choking)
                    .unwrap_or(false)
            })
            .await;

            self.update_interest();
            self.produce_requests()?;

            // wake up when a block arrives (window freed) or a piece
            // becomes assignable; poll occasionally regardless
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                self.requests_notify.notified(),
            )
            .await;
        }
    }
}

impl<'a> PeerConnectionHandler for &'a PeerHandler {
    fn on_handshake(&self, handshake: &Handshake) -> Result<()> {
        if !self.incoming {
            if !self.session.peers.connecting_to_live(self.addr, handshake.peer_id) {
                return Err(Error::TorrentIsNotLive);
            }
            self.session.on_peer_live(self.addr, true);
        }
        Ok(())
    }

    fn on_received_message(&self, msg: MessageBorrowed<'_>) -> anyhow::Result<()> {
        self.touch();
        match msg {
            MessageBorrowed::Request(request) => self.on_peer_request(request)?,
            MessageBorrowed::Cancel(request) => self.on_peer_cancel(request),
            MessageBorrowed::Bitfield(b) => self.on_bitfield(b.as_ref())?,
            MessageBorrowed::Choke => self.on_choked(),
            MessageBorrowed::Unchoke => self.on_unchoked(),
            MessageBorrowed::Interested => self.on_peer_interested(true),
            MessageBorrowed::NotInterested => self.on_peer_interested(false),
            MessageBorrowed::Have(h) => self.on_have(h),
            MessageBorrowed::Piece(piece) => self.on_received_piece(piece)?,
            MessageBorrowed::KeepAlive => trace!("keepalive received"),
            MessageBorrowed::Port(_) => trace!("PORT received, no DHT to tell"),
            MessageBorrowed::Extended(ExtendedMessage::Handshake(h)) => {
                self.on_extended_handshake(&h)
            }
            MessageBorrowed::Extended(ExtendedMessage::UtPex(msg)) => self.on_pex_message(&msg),
            MessageBorrowed::Extended(ExtendedMessage::Dyn(id, _)) => {
                trace!("unknown extended message id {}, ignoring", id)
            }
        }
        Ok(())
    }

    fn serialize_bitfield_message_to_buf(&self, buf: &mut Vec<u8>) -> anyhow::Result<Option<usize>> {
        if self.session.data.verified_pieces() == 0 {
            return Ok(None);
        }
        let bytes = self.session.data.verified_bitfield_bytes();
        let msg = MessageBorrowed::Bitfield(ByteBuf(&bytes));
        let len = msg.serialize(buf, &PeerExtendedMessageIds::default)?;
        Ok(Some(len))
    }

    fn extended_handshake(&self) -> Option<ExtendedHandshake<ByteBufOwned>> {
        Some(self.session.extended_handshake.clone_to_owned())
    }

    fn peer_extended_msg_ids(&self) -> PeerExtendedMessageIds {
        self.session
            .peers
            .with_live(self.addr, |l| l.conn.peer_extended_msg_ids())
            .unwrap_or_default()
    }

    fn should_send_block(&self, block: &BlockRead) -> bool {
        let request = Request::from(&block.block);
        self.session
            .peers
            .with_live_mut(self.addr, |live| {
                live.conn.enqueued_peer_requests.remove(&request);
                if live.conn.cancelled_peer_requests.remove(&request) {
                    return false;
                }
                !live.conn.choking
            })
            .unwrap_or(false)
    }

    fn on_uploaded_bytes(&self, bytes: u32) {
        self.touch();
        self.session.peers.with_peer(self.addr, |p| {
            p.stats.add_uploaded(bytes as u64);
        });
        self.session
            .stats
            .uploaded_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::test_util::single_file_torrent;
    use crate::storage::InMemoryStorage;
    use tokio::sync::mpsc::error::TryRecvError;

    fn make_session(content: &[u8], piece_length: u32) -> Arc<TorrentSession> {
        let config = Arc::new(Config::default());
        let torrent = Arc::new(single_file_torrent(content, piece_length));
        let data = Arc::new(DataDescriptor::new(&torrent, &InMemoryStorage).unwrap());
        TorrentSession::new(
            torrent,
            data,
            config.clone(),
            Selector::RarestFirst,
            Arc::new(PexSource::from_config(&config)),
            EventBus::new(),
            Id20::new([1u8; 20]),
            Instant::now(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    struct FakePeer {
        handler: PeerHandler,
        rx: PeerRx,
    }

    fn connect_fake_peer(session: &Arc<TorrentSession>, addr: &str) -> FakePeer {
        let addr: PeerHandle = addr.parse().unwrap();
        let (tx, rx) = unbounded_channel();
        assert!(session.peers.incoming_to_live(addr, Id20::default(), tx.clone()));
        FakePeer {
            handler: PeerHandler::new(session.clone(), addr, tx, false),
            rx,
        }
    }

    fn drain(rx: &mut PeerRx) -> Vec<WriterRequest> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(req) => out.push(req),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
            }
        }
    }

    fn sent_messages(reqs: &[WriterRequest]) -> Vec<&MessageOwned> {
        reqs.iter()
            .filter_map(|r| match r {
                WriterRequest::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_piece_transfer() {
        let content = vec![b'A'; 16384];
        let session = make_session(&content, 16384);
        let mut events = session.event_bus().subscribe();

        let mut peer = connect_fake_peer(&session, "10.0.0.1:6881");
        let mut other = connect_fake_peer(&session, "10.0.0.2:6881");

        let h = &peer.handler;
        h.on_received_message(MessageBorrowed::Bitfield(ByteBuf(&[0x80])))
            .unwrap();
        let sent = drain(&mut peer.rx);
        assert!(
            sent_messages(&sent)
                .iter()
                .any(|m| matches!(m, MessageOwned::Interested)),
            "expected INTERESTED after learning the peer has what we need"
        );

        h.on_received_message(MessageBorrowed::Unchoke).unwrap();
        peer.handler.produce_requests().unwrap();
        let sent = drain(&mut peer.rx);
        let requests: Vec<&Request> = sent_messages(&sent)
            .iter()
            .filter_map(|m| match m {
                MessageOwned::Request(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(**requests.first().unwrap(), Request::new(0, 0, 16384));

        h.on_received_message(MessageBorrowed::Piece(Piece::from_data(0, 0, &content[..])))
            .unwrap();

        let piece0 = session.data().lengths().validate_piece_index(0).unwrap();
        assert!(session.data().is_verified(piece0));
        assert!(session.is_finished());

        let mut verified_events = 0;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::PieceVerified(0) {
                verified_events += 1;
            }
        }
        assert_eq!(verified_events, 1);

        // every other connection learns via HAVE
        let other_sent = drain(&mut other.rx);
        assert!(
            sent_messages(&other_sent)
                .iter()
                .any(|m| matches!(m, MessageOwned::Have(0))),
            "expected HAVE(0) broadcast to the other peer"
        );
    }

    #[tokio::test]
    async fn test_hash_mismatch_requeues_and_blames() {
        let content = vec![b'A'; 16384];
        let session = make_session(&content, 16384);
        let mut events = session.event_bus().subscribe();
        let mut peer = connect_fake_peer(&session, "10.0.0.1:6881");

        let h = &peer.handler;
        h.on_received_message(MessageBorrowed::Bitfield(ByteBuf(&[0x80])))
            .unwrap();
        h.on_received_message(MessageBorrowed::Unchoke).unwrap();
        peer.handler.produce_requests().unwrap();
        drain(&mut peer.rx);

        let bad = vec![b'B'; 16384];
        h.on_received_message(MessageBorrowed::Piece(Piece::from_data(0, 0, &bad[..])))
            .unwrap();

        let piece0 = session.data().lengths().validate_piece_index(0).unwrap();
        assert!(!session.data().is_verified(piece0));
        while let Ok(ev) = events.try_recv() {
            assert_ne!(ev.kind, EventKind::PieceVerified(0));
        }

        let failures = session
            .peers
            .with_peer(peer.handler.addr, |p| p.stats.failures.load(Ordering::Relaxed))
            .unwrap();
        assert_eq!(failures, 1);

        // the piece went back to the pool and is re-requestable
        assert_eq!(peer.handler.produce_requests().unwrap(), 1);
        let sent = drain(&mut peer.rx);
        assert!(sent_messages(&sent)
            .iter()
            .any(|m| matches!(m, MessageOwned::Request(r) if r.index == 0)));
    }

    #[tokio::test]
    async fn test_upload_path_honors_cancel() {
        let content = vec![b'C'; 16384];
        let session = make_session(&content, 16384);
        let piece0 = session.data().lengths().validate_piece_index(0).unwrap();
        session.data().commit_piece(piece0, &content).unwrap();

        let mut peer = connect_fake_peer(&session, "10.0.0.1:6881");
        let h = &peer.handler;

        // requests are only honored when the peer is unchoked
        session.peers.with_live_mut(h.addr, |live| live.conn.choking = false);
        h.on_received_message(MessageBorrowed::Interested).unwrap();

        let request = Request::new(0, 0, 16384);
        h.on_received_message(MessageBorrowed::Request(request)).unwrap();

        // the storage read happens on the blocking pool
        let block = tokio::time::timeout(Duration::from_secs(5), peer.rx.recv())
            .await
            .expect("timed out waiting for the block read")
            .expect("peer channel closed");
        let block = match block {
            WriterRequest::Block(b) => b,
            other => panic!("expected a block, got {other:?}"),
        };
        assert_eq!(&block.data[..], &content[..]);
        assert!(h.should_send_block(&block), "not cancelled: should go out");

        // same request again, but cancelled before the producer phase
        h.on_received_message(MessageBorrowed::Request(request)).unwrap();
        let block = tokio::time::timeout(Duration::from_secs(5), peer.rx.recv())
            .await
            .unwrap()
            .unwrap();
        let block = match block {
            WriterRequest::Block(b) => b,
            other => panic!("expected a block, got {other:?}"),
        };
        h.on_received_message(MessageBorrowed::Cancel(request)).unwrap();
        assert!(!h.should_send_block(&block), "cancelled block must be dropped");
    }

    #[tokio::test]
    async fn test_choked_peer_requests_are_dropped() {
        let content = vec![b'C'; 16384];
        let session = make_session(&content, 16384);
        let piece0 = session.data().lengths().validate_piece_index(0).unwrap();
        session.data().commit_piece(piece0, &content).unwrap();

        let mut peer = connect_fake_peer(&session, "10.0.0.1:6881");
        let h = &peer.handler;
        // initial state is choking: the request goes nowhere
        h.on_received_message(MessageBorrowed::Request(Request::new(0, 0, 16384)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut peer.rx)
            .iter()
            .all(|r| !matches!(r, WriterRequest::Block(_))));
    }

    #[tokio::test]
    async fn test_choke_clears_pending_requests() {
        let content = vec![b'A'; 16384 * 2];
        let session = make_session(&content, 16384 * 2);
        let mut peer = connect_fake_peer(&session, "10.0.0.1:6881");
        let h = &peer.handler;

        h.on_received_message(MessageBorrowed::Bitfield(ByteBuf(&[0x80])))
            .unwrap();
        h.on_received_message(MessageBorrowed::Unchoke).unwrap();
        peer.handler.produce_requests().unwrap();
        let pending = session
            .peers
            .with_live(h.addr, |l| l.conn.pending_requests.len())
            .unwrap();
        assert_eq!(pending, 2);

        h.on_received_message(MessageBorrowed::Choke).unwrap();
        let pending = session
            .peers
            .with_live(h.addr, |l| l.conn.pending_requests.len())
            .unwrap();
        assert_eq!(pending, 0);

        // on re-unchoke the same blocks are requested again
        h.on_received_message(MessageBorrowed::Unchoke).unwrap();
        assert_eq!(peer.handler.produce_requests().unwrap(), 2);
    }

    #[test]
    fn test_extended_handshake_advertises_last_wins_encryption_flag() {
        for policy in [
            EncryptionPolicy::RequirePlaintext,
            EncryptionPolicy::PreferPlaintext,
            EncryptionPolicy::PreferEncrypted,
            EncryptionPolicy::RequireEncrypted,
        ] {
            let config = Config {
                encryption_policy: policy,
                acceptor_port: 7001,
                ..Default::default()
            };
            let h = build_extended_handshake(&config);
            assert_eq!(h.e, Some(1), "policy {policy:?}");
            assert_eq!(h.p, Some(7001));
            assert!(h.ut_pex().is_some());
        }
    }
}
