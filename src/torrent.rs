//! The torrent: the authoritative swarm state and the single event router
//! task that mutates it.
//!
//! Peer sessions never touch the piece store or the peer registry; they only
//! produce events into the router's queue. The router applies each event to
//! swarm state and issues all outbound reactions through the sessions' write
//! halves before dequeuing the next event, so no locking is needed anywhere.

use {
    futures::{future, select, FutureExt, SinkExt},
    std::{
        collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration,
    },
    tokio::{
        net::TcpListener,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot,
        },
        task,
    },
};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    peer::{
        self,
        codec::{ExtendedHandshake, Message},
        MessageSink, PeerSession,
    },
    piece::{BlockWrite, PieceStore},
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

/// Information about the torrent shared with every peer session.
pub(crate) struct SharedStatus {
    /// The info hash that identifies the swarm.
    pub info_hash: Sha1Hash,
    /// The id this client presents in handshakes.
    pub client_id: PeerId,
    /// How long an outbound TCP connect may take.
    pub connect_timeout: Duration,
}

/// The channel on which peer sessions (and the router itself, for internal
/// events) push events into the router's queue.
pub(crate) type EventSender = UnboundedSender<Event>;
type EventReceiver = UnboundedReceiver<Event>;

/// Everything the router reacts to. Events from one session arrive in the
/// order that session produced them; events of different sessions interleave
/// arbitrarily.
pub(crate) enum Event {
    /// A session completed its handshake and hands over its write half.
    Connected {
        peer_id: PeerId,
        addr: SocketAddr,
        sink: MessageSink,
        cmd: peer::Sender,
    },
    /// A session decoded an inbound frame.
    Message { peer_id: PeerId, message: Message },
    /// A session ended on an error or EOF.
    Disconnected { peer_id: PeerId },
    /// A piece was fully assembled and passed its digest check.
    PieceCompleted { index: PieceIndex },
}

/// The router side of a live peer session: the wire flags, the pieces the
/// peer claims, and the handles for writing to and shutting down the
/// session.
struct PeerHandle {
    addr: SocketAddr,
    /// The write half of the session's socket. All outbound traffic to this
    /// peer is issued here, by the router only.
    sink: MessageSink,
    cmd: peer::Sender,
    /// Whether the peer is choking us. Requests may only be sent while this
    /// is false.
    peer_choking: bool,
    peer_interested: bool,
    am_choking: bool,
    am_interested: bool,
    /// The pieces the peer has advertised via bitfield or have messages,
    /// one bit per piece.
    pieces_claimed: Bitfield,
}

impl PeerHandle {
    fn new(
        addr: SocketAddr,
        sink: MessageSink,
        cmd: peer::Sender,
        piece_count: usize,
    ) -> Self {
        // both sides of a fresh connection start choked and uninterested
        Self {
            addr,
            sink,
            cmd,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            pieces_claimed: Bitfield::repeat(false, piece_count),
        }
    }
}

/// The hook invoked with every freshly completed piece, e.g. to persist it.
type PieceHook = Box<dyn FnMut(PieceIndex, &[u8]) + Send>;

/// A single torrent download: piece store, peer registry and event router
/// in one.
pub struct Torrent {
    conf: Conf,
    /// Torrent information shared with the session tasks.
    status: Arc<SharedStatus>,
    /// The accounting of every piece, owned exclusively by the router.
    store: PieceStore,
    /// All connected peer sessions, keyed by the id from their handshake.
    peers: HashMap<PeerId, PeerHandle>,
    event_chan: EventSender,
    event_port: EventReceiver,
    listener: Option<TcpListener>,
    piece_hook: Option<PieceHook>,
    /// The number of piece completions that are queued but not yet
    /// announced. The router only declares the download finished once every
    /// completed piece has had its have broadcast.
    pending_completions: usize,
}

impl Torrent {
    /// Creates the swarm state for the given metainfo, with every piece
    /// missing.
    pub fn new(metainfo: &Metainfo, conf: Conf) -> Result<Self> {
        let info_hash = metainfo.create_info_hash()?;
        let store = PieceStore::new(&metainfo.info)?;
        let (event_chan, event_port) = mpsc::unbounded_channel();
        Ok(Self {
            status: Arc::new(SharedStatus {
                info_hash,
                client_id: conf.client_id,
                connect_timeout: conf.connect_timeout,
            }),
            conf,
            store,
            peers: HashMap::new(),
            event_chan,
            event_port,
            listener: None,
            piece_hook: None,
            pending_completions: 0,
        })
    }

    /// Registers a hook that is called with the bytes of every piece right
    /// after it completes, e.g. to write it to disk.
    pub fn on_piece_complete(
        &mut self,
        hook: impl FnMut(PieceIndex, &[u8]) + Send + 'static,
    ) {
        self.piece_hook = Some(Box::new(hook));
    }

    /// Presents already held content (e.g. read back from disk) for the
    /// given piece. The data must match the declared digest.
    pub fn seed_piece(&mut self, index: PieceIndex, data: &[u8]) -> Result<()> {
        self.store.accept_piece(index, data)
    }

    /// True once every piece is complete and digest valid.
    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    /// The assembled bytes of a piece, available once it is complete.
    pub fn piece_data(&self, index: PieceIndex) -> Option<&[u8]> {
        self.store.piece(index).and_then(|piece| piece.data())
    }

    /// Binds the configured listen address and returns the bound address
    /// (useful when listening on port 0). Must be called before [`start`]
    /// for the torrent to accept inbound peers.
    ///
    /// [`start`]: Self::start
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = self.conf.listen_addr.ok_or_else(|| {
            Error::Bind(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no listen address configured",
            ))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;
        let addr = listener.local_addr().map_err(Error::Bind)?;
        log::info!("Listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Starts the swarm: accepts inbound connections (if a listen address is
    /// configured), connects to the given peers, and runs the event router
    /// until the download completes.
    pub async fn start(&mut self, peers: &[SocketAddr]) -> Result<()> {
        if self.conf.listen_addr.is_some() && self.listener.is_none() {
            self.bind().await?;
        }

        let (stop_chan, stop_port) = oneshot::channel();
        let accept_task = self.listener.take().map(|listener| {
            let status = Arc::clone(&self.status);
            let events = self.event_chan.clone();
            task::spawn(accept_peers(listener, status, events, stop_port))
        });

        for &addr in peers {
            let status = Arc::clone(&self.status);
            let events = self.event_chan.clone();
            task::spawn(async move {
                let mut session = PeerSession::new(status, events, addr);
                if let Err(e) = session.start_outbound().await {
                    log::warn!("Peer {} session stopped: {}", addr, e);
                }
            });
        }

        let res = self.run().await;

        let _ = stop_chan.send(());
        self.shutdown();
        if let Some(accept_task) = accept_task {
            let _ = accept_task.await;
        }
        res
    }

    /// The event router. The sole consumer of the queue and the sole mutator
    /// of swarm state; returns once the download is complete.
    async fn run(&mut self) -> Result<()> {
        log::info!("Starting torrent event loop");
        while let Some(event) = self.event_port.recv().await {
            match event {
                Event::Connected {
                    peer_id,
                    addr,
                    sink,
                    cmd,
                } => {
                    if let Err(e) =
                        self.handle_connect(peer_id, addr, sink, cmd).await
                    {
                        log::warn!("Closing peer {} session: {}", addr, e);
                        self.remove_peer(&peer_id);
                    }
                }
                Event::Message { peer_id, message } => {
                    if let Err(e) = self.handle_message(peer_id, message).await
                    {
                        log::warn!("Closing peer session: {}", e);
                        self.remove_peer(&peer_id);
                    }
                }
                Event::Disconnected { peer_id } => {
                    self.remove_peer(&peer_id);
                }
                Event::PieceCompleted { index } => {
                    self.pending_completions -= 1;
                    self.handle_piece_completed(index).await;
                    // terminate only once every completed piece has been
                    // announced, so that pieces finishing back to back all
                    // get their have broadcast
                    if self.store.is_complete()
                        && self.pending_completions == 0
                    {
                        log::info!("Download complete");
                        self.shutdown();
                        // completion is sticky: whatever is still queued is
                        // drained without further outbound traffic
                        while self.event_port.try_recv().is_ok() {}
                        return Ok(());
                    }
                }
            }
        }
        Err(Error::Channel)
    }

    /// Registers a freshly handshaken session and greets it: our bitfield
    /// (if we have anything to advertise) followed by an unchoke. These are
    /// written before any of the peer's own frames are dequeued.
    async fn handle_connect(
        &mut self,
        peer_id: PeerId,
        addr: SocketAddr,
        sink: MessageSink,
        cmd: peer::Sender,
    ) -> Result<()> {
        log::info!(
            "Peer {} joined the swarm as {}",
            addr,
            String::from_utf8_lossy(&peer_id)
        );

        // a second handshake with a known id supersedes the older session
        if let Some(old) = self.peers.remove(&peer_id) {
            log::warn!(
                "Peer id {} reconnected from {}, superseding session to {}",
                String::from_utf8_lossy(&peer_id),
                addr,
                old.addr
            );
            let _ = old.cmd.send(peer::Command::Shutdown);
        }

        let handle =
            PeerHandle::new(addr, sink, cmd, self.store.piece_count());
        let peer = self.peers.entry(peer_id).or_insert(handle);

        let have = self.store.have();
        if have.any() {
            peer.sink
                .send(Message::Bitfield(have))
                .await
                .map_err(|e| Error::from_session_io(addr, e))?;
        }
        if peer.am_choking {
            peer.sink
                .send(Message::Unchoke)
                .await
                .map_err(|e| Error::from_session_io(addr, e))?;
            peer.am_choking = false;
        }
        Ok(())
    }

    /// Applies one inbound protocol event to swarm state and issues its
    /// outbound reactions.
    async fn handle_message(
        &mut self,
        peer_id: PeerId,
        message: Message,
    ) -> Result<()> {
        // the session may race its own disconnect; stale events are dropped
        let peer = match self.peers.get_mut(&peer_id) {
            Some(peer) => peer,
            None => {
                log::debug!("Dropping event from unregistered peer");
                return Ok(());
            }
        };

        match message {
            // consumed by the session, but harmless here
            Message::KeepAlive => {}
            Message::Choke => {
                if !peer.peer_choking {
                    log::info!("Peer {} choked us", peer.addr);
                }
                peer.peer_choking = true;
            }
            Message::Unchoke => {
                if peer.peer_choking {
                    log::info!("Peer {} unchoked us", peer.addr);
                }
                peer.peer_choking = false;
                // the pipeline may now be filled for everything the peer
                // claims that we still miss
                request_claimed_pieces(&self.store, peer).await?;
            }
            Message::Interested => {
                if !peer.peer_interested {
                    log::info!("Peer {} is interested", peer.addr);
                }
                peer.peer_interested = true;
            }
            Message::NotInterested => {
                if peer.peer_interested {
                    log::info!("Peer {} is not interested", peer.addr);
                }
                peer.peer_interested = false;
            }
            Message::Have { piece_index } => {
                if piece_index >= self.store.piece_count() {
                    return Err(Error::Protocol {
                        addr: peer.addr,
                        violation: Violation::InvalidPieceIndex(piece_index),
                    });
                }
                peer.pieces_claimed.set(piece_index, true);

                let complete = self
                    .store
                    .piece(piece_index)
                    .map_or(false, |piece| piece.is_complete());
                if !complete {
                    if peer.peer_choking {
                        send_interested(peer).await?;
                    } else {
                        request_piece(&self.store, peer, piece_index).await?;
                    }
                }
            }
            Message::Bitfield(mut bitfield) => {
                log::info!("Peer {} sent its bitfield", peer.addr);
                // The bitfield raw data that is sent over the wire may be
                // longer than the logical pieces it represents, if the
                // number of pieces in torrent is not a multiple of 8.
                // Therefore we need to slice off the last part of the
                // bitfield.
                bitfield.resize(self.store.piece_count(), false);
                peer.pieces_claimed = bitfield;

                if !claimed_incomplete(&self.store, &peer.pieces_claimed)
                    .is_empty()
                {
                    if peer.peer_choking {
                        send_interested(peer).await?;
                    } else {
                        request_claimed_pieces(&self.store, peer).await?;
                    }
                }
            }
            Message::Request(block) => {
                let data = self
                    .store
                    .piece(block.piece_index)
                    .and_then(|piece| piece.block(block.offset, block.len))
                    .map(<[u8]>::to_vec);
                match data {
                    Some(data) => {
                        log::debug!(
                            "Serving block {:?} to peer {}",
                            block,
                            peer.addr
                        );
                        peer.sink
                            .send(Message::Block {
                                piece_index: block.piece_index,
                                offset: block.offset,
                                data,
                            })
                            .await
                            .map_err(|e| {
                                Error::from_session_io(peer.addr, e)
                            })?;
                    }
                    None => log::debug!(
                        "Dropping request {:?} from peer {}: not available",
                        block,
                        peer.addr
                    ),
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                log::debug!(
                    "Received block for piece {} at {} from peer {}",
                    piece_index,
                    offset,
                    peer.addr
                );
                match self.store.add_block(piece_index, offset, &data) {
                    Ok(BlockWrite::Accepted) => {}
                    Ok(BlockWrite::Completed) => {
                        log::info!("Piece {} complete", piece_index);
                        self.pending_completions += 1;
                        self.event_chan
                            .send(Event::PieceCompleted { index: piece_index })
                            .map_err(|_| Error::Channel)?;
                    }
                    Ok(BlockWrite::DigestMismatch { expected, actual }) => {
                        // the store already reset the piece; it will be
                        // requested again on the next unchoke or have
                        log::warn!(
                            "{}",
                            Error::DigestMismatch {
                                index: piece_index,
                                expected,
                                actual,
                            }
                        );
                    }
                    Err(violation) => {
                        return Err(Error::Protocol {
                            addr: peer.addr,
                            violation,
                        });
                    }
                }
            }
            Message::Cancel(block) => {
                // nothing tracks in-flight serves, so there is nothing to
                // revoke
                log::debug!("Peer {} cancelled {:?}", peer.addr, block);
            }
            Message::Extended { id, payload } => {
                if id == 0 {
                    match ExtendedHandshake::from_bytes(&payload) {
                        Ok(handshake) => log::debug!(
                            "Peer {} extended handshake: {:?}",
                            peer.addr,
                            handshake
                        ),
                        Err(e) => log::debug!(
                            "Peer {} sent undecodable extended handshake: {}",
                            peer.addr,
                            e
                        ),
                    }
                } else {
                    log::debug!(
                        "Ignoring extended message {} from peer {}",
                        id,
                        peer.addr
                    );
                }
            }
        }
        Ok(())
    }

    /// Invokes the persistence hook and broadcasts our new piece to the
    /// whole swarm. The fan-out is awaited collectively; peers whose send
    /// failed are dropped afterwards.
    async fn handle_piece_completed(&mut self, index: PieceIndex) {
        if let Some(hook) = &mut self.piece_hook {
            if let Some(data) =
                self.store.piece(index).and_then(|piece| piece.data())
            {
                hook(index, data);
            }
        }

        let sends = self.peers.iter_mut().map(|(id, peer)| {
            let message = Message::Have { piece_index: index };
            async move { (*id, peer.sink.send(message).await) }
        });
        let failed: Vec<PeerId> = future::join_all(sends)
            .await
            .into_iter()
            .filter_map(|(id, res)| {
                res.err().map(|e| {
                    log::warn!("Broadcasting have failed: {}", e);
                    id
                })
            })
            .collect();
        for peer_id in failed {
            self.remove_peer(&peer_id);
        }
    }

    /// Drops a peer from the registry and tells its session to shut down.
    /// Closing the socket terminates the session's pending read.
    fn remove_peer(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.remove(peer_id) {
            log::info!("Removing peer {} from the swarm", peer.addr);
            let _ = peer.cmd.send(peer::Command::Shutdown);
        }
    }

    /// Cascades a shutdown to every session and clears the registry.
    fn shutdown(&mut self) {
        for (_, peer) in self.peers.drain() {
            let _ = peer.cmd.send(peer::Command::Shutdown);
        }
    }
}

/// The indices of the pieces the peer claims that we have not completed,
/// in ascending order.
fn claimed_incomplete(
    store: &PieceStore,
    pieces_claimed: &Bitfield,
) -> Vec<PieceIndex> {
    pieces_claimed
        .iter()
        .enumerate()
        .filter(|(_, has)| **has)
        .map(|(index, _)| index)
        .filter(|&index| {
            store
                .piece(index)
                .map_or(false, |piece| !piece.is_complete())
        })
        .collect()
}

async fn send_interested(peer: &mut PeerHandle) -> Result<()> {
    if !peer.am_interested {
        log::info!("Interested in peer {}", peer.addr);
    }
    peer.sink
        .send(Message::Interested)
        .await
        .map_err(|e| Error::from_session_io(peer.addr, e))?;
    peer.am_interested = true;
    Ok(())
}

/// Requests every still missing block of the piece from the peer, in
/// ascending offset order. Only valid while the peer is not choking us.
async fn request_piece(
    store: &PieceStore,
    peer: &mut PeerHandle,
    index: PieceIndex,
) -> Result<()> {
    debug_assert!(!peer.peer_choking);
    for block in store.missing_blocks(index) {
        log::debug!("Requesting block {:?} from peer {}", block, peer.addr);
        peer.sink
            .send(Message::Request(block))
            .await
            .map_err(|e| Error::from_session_io(peer.addr, e))?;
    }
    Ok(())
}

/// Requests the missing blocks of every incomplete piece the peer claims,
/// in ascending (piece, offset) order.
async fn request_claimed_pieces(
    store: &PieceStore,
    peer: &mut PeerHandle,
) -> Result<()> {
    for index in claimed_incomplete(store, &peer.pieces_claimed) {
        request_piece(store, peer, index).await?;
    }
    Ok(())
}

/// Accepts inbound connections until the stop signal fires, spawning a
/// session task per accepted socket.
async fn accept_peers(
    mut listener: TcpListener,
    status: Arc<SharedStatus>,
    events: EventSender,
    stop_port: oneshot::Receiver<()>,
) {
    let mut stop_port = stop_port.fuse();
    loop {
        select! {
            accepted = listener.accept().fuse() => {
                match accepted {
                    Ok((socket, addr)) => {
                        log::info!("Accepted connection from {}", addr);
                        let status = Arc::clone(&status);
                        let events = events.clone();
                        task::spawn(async move {
                            let mut session =
                                PeerSession::new(status, events, addr);
                            if let Err(e) =
                                session.start_inbound(socket).await
                            {
                                log::warn!(
                                    "Peer {} session stopped: {}",
                                    addr,
                                    e
                                );
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = stop_port => {
                log::info!("Stopping listener");
                break;
            }
        }
    }
}
