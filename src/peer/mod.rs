//! One peer session per live TCP connection.
//!
//! A session owns its socket, performs the handshake and then loops, decoding
//! inbound frames and forwarding them to the torrent's event router. It never
//! interprets messages itself: all swarm state lives with the router, which
//! also holds the session's write half after registration.

pub(crate) mod codec;

use {
    futures::{
        select,
        stream::{SplitSink, SplitStream},
        SinkExt, StreamExt,
    },
    std::{io, net::SocketAddr, sync::Arc},
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time::timeout,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        error::*,
        torrent::{Event, EventSender, SharedStatus},
        PeerId,
    },
    codec::*,
};

/// The channel on which the torrent can send a command to the peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The write half of a peer's framed socket. It is handed to the router when
/// the session reaches the active state, so that all outbound messages are
/// issued by the single task that owns the swarm state.
pub(crate) type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The normal state of a peer session in which messages are exchanged.
    Active,
    /// The session has ended, due to an error, the remote side hanging up,
    /// or a shutdown command.
    Closed,
}

impl Default for State {
    fn default() -> Self {
        Self::Connecting
    }
}

/// How a session's read loop came to an end without an error.
enum Stop {
    /// The router told the session to shut down.
    Shutdown,
    /// The remote side closed the connection.
    Eof,
}

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The producer half of the router's event queue. This is the session's
    /// only link to the rest of the engine.
    events: EventSender,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The current state of the session.
    state: State,
    /// The remote peer's id, set after a successful handshake.
    peer_id: Option<PeerId>,
}

impl PeerSession {
    pub fn new(
        torrent: Arc<SharedStatus>,
        events: EventSender,
        addr: SocketAddr,
    ) -> Self {
        Self {
            torrent,
            events,
            addr,
            state: State::default(),
            peer_id: None,
        }
    }

    /// Starts an outbound session: connects to the peer (bounded by the
    /// configured timeout) and, as the initiator, sends the first handshake.
    ///
    /// Returns once the connection is closed or an error occurs.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = timeout(
            self.torrent.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::Transport {
            addr: self.addr,
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ),
        })?
        .map_err(|e| Error::Transport {
            addr: self.addr,
            source: e,
        })?;
        log::info!("Connected to peer {}", self.addr);

        self.establish(socket, true).await
    }

    /// Starts a session on a connection accepted by the listener. The remote
    /// side is the initiator, so we read its handshake before replying.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        self.establish(socket, false).await
    }

    /// Exchanges handshakes, switches to the message codec, registers with
    /// the router and runs the session's read loop.
    async fn establish(
        &mut self,
        socket: TcpStream,
        outbound: bool,
    ) -> Result<()> {
        self.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        // the connection initiator speaks first
        let peer_handshake = if outbound {
            log::info!("Sending handshake to peer {}", self.addr);
            socket
                .send(handshake)
                .await
                .map_err(|e| Error::from_session_io(self.addr, e))?;
            self.recv_handshake(&mut socket).await?
        } else {
            let peer_handshake = self.recv_handshake(&mut socket).await?;
            log::info!("Sending handshake to peer {}", self.addr);
            socket
                .send(handshake)
                .await
                .map_err(|e| Error::from_session_io(self.addr, e))?;
            peer_handshake
        };

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::Protocol {
                addr: self.addr,
                violation: Violation::InfoHashMismatch,
            });
        }
        let peer_id = peer_handshake.peer_id;
        self.peer_id = Some(peer_id);
        if peer_handshake.supports_extended() {
            // we don't advertise extension support ourselves, so the peer
            // won't open an extended handshake; noted for the log only
            log::debug!("Peer {} supports protocol extensions", self.addr);
        }

        // Now that we have the handshake, we need to switch to the peer
        // message codec. Note that we need to keep the buffers of the
        // original codec as they may contain bytes of any message the peer
        // may have sent after the handshake.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.state = State::Active;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        // register with the router, handing over the write half; the router
        // reacts by sending our bitfield (if we have anything) and an
        // unchoke before it touches any frame of this peer
        let (sink, stream) = socket.split();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        self.events
            .send(Event::Connected {
                peer_id,
                addr: self.addr,
                sink,
                cmd: cmd_chan,
            })
            .map_err(|_| Error::Channel)?;

        let res = self.run(stream, cmd_port, peer_id).await;
        self.state = State::Closed;
        if let Some(id) = &self.peer_id {
            log::info!(
                "Peer {} ({}) session closed",
                self.addr,
                String::from_utf8_lossy(id)
            );
        }
        match res {
            // the router initiated the shutdown and already dropped us from
            // its registry
            Ok(Stop::Shutdown) => Ok(()),
            Ok(Stop::Eof) => {
                let _ = self.events.send(Event::Disconnected { peer_id });
                Ok(())
            }
            Err(e) => {
                let _ = self.events.send(Event::Disconnected { peer_id });
                Err(e)
            }
        }
    }

    async fn recv_handshake(
        &self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
    ) -> Result<Handshake> {
        log::info!("Waiting for peer {} handshake", self.addr);
        match socket.next().await {
            Some(Ok(peer_handshake)) => {
                log::debug!(
                    "Peer {} handshake: {:?}",
                    self.addr,
                    peer_handshake
                );
                Ok(peer_handshake)
            }
            Some(Err(e)) => Err(Error::from_session_io(self.addr, e)),
            None => Err(Error::Transport {
                addr: self.addr,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection during handshake",
                ),
            }),
        }
    }

    /// The session's read loop: frames are decoded in arrival order and
    /// forwarded to the router's queue, which preserves their order. The
    /// loop suspends only on socket reads and ends on EOF, an error, or a
    /// shutdown command.
    async fn run(
        &mut self,
        stream: SplitStream<Framed<TcpStream, PeerCodec>>,
        cmd_port: Receiver,
        peer_id: PeerId,
    ) -> Result<Stop> {
        let mut stream = stream.fuse();
        let mut cmd_port = cmd_port.fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg.map_err(|e| {
                            Error::from_session_io(self.addr, e)
                        })?,
                        None => {
                            log::info!("Peer {} closed connection", self.addr);
                            return Ok(Stop::Eof);
                        }
                    };
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    match msg {
                        // keep-alives are consumed here, they carry no event
                        Message::KeepAlive => {}
                        msg => self
                            .events
                            .send(Event::Message {
                                peer_id,
                                message: msg,
                            })
                            .map_err(|_| Error::Channel)?,
                    }
                }
                cmd = cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            return Ok(Stop::Shutdown);
                        }
                    }
                }
            }
        }
    }
}
