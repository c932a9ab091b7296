//! A minimal UDP tracker client (BEP 15): one connect round trip to obtain a
//! connection id, one announce round trip to obtain the peer list.
//!
//! The engine consumes the returned endpoint list opaquely; failures here are
//! scoped to the announce attempt so the caller can move on to the next
//! tracker.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::{net::UdpSocket, time::timeout};
use url::Url;

use crate::{error::*, PeerId, Sha1Hash};

/// The magic constant identifying the UDP tracker protocol.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// The announce event signalling that the download has just started.
const EVENT_STARTED: u32 = 2;

/// The fields of an announce request that vary per call.
#[derive(Debug)]
struct AnnounceRequest {
    connection_id: u64,
    transaction_id: u32,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    key: u32,
    port: u16,
}

/// What the tracker returns alongside the peer list.
#[derive(Debug, PartialEq)]
pub struct AnnounceResponse {
    /// How long the tracker wants us to wait before re-announcing, in
    /// seconds.
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// Announces the torrent to the given UDP tracker and returns the endpoints
/// of peers in its swarm.
///
/// Each of the two receive round trips is bounded by `recv_timeout`.
pub async fn request_peers(
    info_hash: Sha1Hash,
    peer_id: PeerId,
    tracker_url: &str,
    port: u16,
    recv_timeout: Duration,
    rng: &mut impl Rng,
) -> Result<Vec<SocketAddr>> {
    announce(info_hash, peer_id, tracker_url, port, recv_timeout, rng)
        .await
        .map(|response| response.peers)
}

/// Like [`request_peers`], but returns the full tracker response.
pub async fn announce(
    info_hash: Sha1Hash,
    peer_id: PeerId,
    tracker_url: &str,
    port: u16,
    recv_timeout: Duration,
    rng: &mut impl Rng,
) -> Result<AnnounceResponse> {
    let url = Url::parse(tracker_url)
        .map_err(|e| Error::Tracker(format!("invalid url: {}", e)))?;
    if url.scheme() != "udp" {
        return Err(Error::Tracker(format!(
            "unsupported tracker scheme {}",
            url.scheme()
        )));
    }
    let addr = url
        .socket_addrs(|| None)
        .map_err(|e| {
            Error::Tracker(format!("could not resolve tracker: {}", e))
        })?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::Tracker("tracker resolved to no address".into())
        })?;
    log::info!("Announcing to tracker {} at {}", tracker_url, addr);

    let mut socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::Tracker(format!("udp bind failed: {}", e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| Error::Tracker(format!("udp connect failed: {}", e)))?;

    // first round trip establishes a connection id
    let transaction_id = rng.gen();
    let request = connect_request(transaction_id);
    socket
        .send(&request)
        .await
        .map_err(|e| Error::Tracker(format!("send failed: {}", e)))?;
    let mut buf = [0; 2048];
    let len = recv(&mut socket, &mut buf, recv_timeout).await?;
    let connection_id = parse_connect_response(transaction_id, &buf[..len])?;
    log::debug!("Tracker {} connection id {}", tracker_url, connection_id);

    // second round trip announces us and yields the swarm's peers
    let announce_req = AnnounceRequest {
        connection_id,
        transaction_id: rng.gen(),
        info_hash,
        peer_id,
        key: rng.gen(),
        port,
    };
    let request = announce_request(&announce_req);
    socket
        .send(&request)
        .await
        .map_err(|e| Error::Tracker(format!("send failed: {}", e)))?;
    let len = recv(&mut socket, &mut buf, recv_timeout).await?;
    let response = parse_announce_response(&announce_req, &buf[..len])?;
    log::info!(
        "Tracker {} returned {} peers ({} seeders, {} leechers)",
        tracker_url,
        response.peers.len(),
        response.seeders,
        response.leechers
    );
    Ok(response)
}

async fn recv(
    socket: &mut UdpSocket,
    buf: &mut [u8],
    recv_timeout: Duration,
) -> Result<usize> {
    timeout(recv_timeout, socket.recv(buf))
        .await
        .map_err(|_| Error::Tracker("tracker response timed out".into()))?
        .map_err(|e| Error::Tracker(format!("recv failed: {}", e)))
}

fn connect_request(transaction_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

fn parse_connect_response(
    transaction_id: u32,
    mut buf: &[u8],
) -> Result<u64> {
    if buf.len() < 16 {
        return Err(Error::Tracker(format!(
            "connect response too short: {} bytes",
            buf.len()
        )));
    }
    let action = buf.get_u32();
    let response_transaction_id = buf.get_u32();
    let connection_id = buf.get_u64();
    if action != ACTION_CONNECT {
        return Err(Error::Tracker(format!(
            "unexpected connect response action {}",
            action
        )));
    }
    if response_transaction_id != transaction_id {
        return Err(Error::Tracker("transaction id mismatch".into()));
    }
    Ok(connection_id)
}

fn announce_request(request: &AnnounceRequest) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(request.connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(request.transaction_id);
    buf.extend_from_slice(&request.info_hash);
    buf.extend_from_slice(&request.peer_id);
    // downloaded
    buf.put_u64(0);
    // left: unknown, the tracker treats -1 as "everything"
    buf.put_i64(-1);
    // uploaded
    buf.put_u64(0);
    buf.put_u32(EVENT_STARTED);
    // ip address: 0 tells the tracker to use the packet's source
    buf.put_u32(0);
    buf.put_u32(request.key);
    // num_want: -1 requests the tracker's default
    buf.put_i32(-1);
    buf.put_u16(request.port);
    debug_assert_eq!(buf.len(), 98);
    buf
}

fn parse_announce_response(
    request: &AnnounceRequest,
    mut buf: &[u8],
) -> Result<AnnounceResponse> {
    if buf.len() < 20 {
        return Err(Error::Tracker(format!(
            "announce response too short: {} bytes",
            buf.len()
        )));
    }
    let action = buf.get_u32();
    let transaction_id = buf.get_u32();
    if action != ACTION_ANNOUNCE {
        return Err(Error::Tracker(format!(
            "unexpected announce response action {}",
            action
        )));
    }
    if transaction_id != request.transaction_id {
        return Err(Error::Tracker("transaction id mismatch".into()));
    }
    let interval = buf.get_u32();
    let leechers = buf.get_u32();
    let seeders = buf.get_u32();

    // what follows is a list of 6 byte compact peer entries: a big endian
    // IPv4 address and a port
    let mut peers = Vec::with_capacity(buf.len() / 6);
    while buf.len() >= 6 {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}
