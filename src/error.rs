//! The error types used throughout the engine.
//!
//! Errors are scoped: a [`Error::Protocol`] or [`Error::Transport`] tears down
//! a single peer session, a digest mismatch resets a single piece, while the
//! remaining variants abort the whole download and surface to the caller.

use std::{fmt, io, net::SocketAddr};

use crate::{PieceIndex, Sha1Hash};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer at the given address broke a framing or message rule. Only
    /// that session is closed; the swarm carries on.
    Protocol {
        addr: SocketAddr,
        violation: Violation,
    },
    /// The TCP connection to the peer failed: connect timeout, read or write
    /// error, or EOF in the middle of a frame. Only that session is closed.
    Transport {
        addr: SocketAddr,
        source: io::Error,
    },
    /// A fully received piece hashed to something other than the digest the
    /// metainfo declares for it. The piece is reset and downloaded again.
    DigestMismatch {
        index: PieceIndex,
        expected: Sha1Hash,
        actual: Sha1Hash,
    },
    /// A piece index outside the torrent was passed to the engine.
    InvalidPieceIndex(PieceIndex),
    /// The metainfo could not be parsed as bencode.
    Bencode(serde_bencode::Error),
    /// The metainfo parsed but its fields are structurally inconsistent.
    InvalidMetainfo(String),
    /// The magnet URI is malformed or not a v1 btih magnet.
    InvalidMagnet(String),
    /// The tracker could not be reached or replied with garbage.
    Tracker(String),
    /// The listening socket could not be bound.
    Bind(io::Error),
    /// A channel between engine tasks died, which means the other end was
    /// dropped mid-download.
    Channel,
}

/// The ways a remote peer can violate the wire protocol. Carried inside
/// [`Error::Protocol`] together with the offending peer's address.
#[derive(Debug)]
#[non_exhaustive]
pub enum Violation {
    /// The handshake or a message frame could not be decoded.
    Framing(io::Error),
    /// The handshake advertised a different torrent than ours.
    InfoHashMismatch,
    /// The peer referred to a piece index at or past the piece count.
    InvalidPieceIndex(PieceIndex),
    /// A block write would extend past the end of its piece.
    BlockOutOfBounds {
        index: PieceIndex,
        offset: u32,
        len: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol { addr, violation } => {
                write!(f, "peer {} violated protocol: {}", addr, violation)
            }
            Self::Transport { addr, source } => {
                write!(f, "transport failure with peer {}: {}", addr, source)
            }
            Self::DigestMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "piece {} digest mismatch: expected {}, got {}",
                index,
                hex::encode(expected),
                hex::encode(actual)
            ),
            Self::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index {}", index)
            }
            Self::Bencode(e) => write!(f, "invalid bencode: {}", e),
            Self::InvalidMetainfo(reason) => {
                write!(f, "invalid metainfo: {}", reason)
            }
            Self::InvalidMagnet(reason) => {
                write!(f, "invalid magnet URI: {}", reason)
            }
            Self::Tracker(reason) => write!(f, "tracker failure: {}", reason),
            Self::Bind(e) => write!(f, "could not bind listener: {}", e),
            Self::Channel => write!(f, "engine channel closed unexpectedly"),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Framing(e) => write!(f, "framing error: {}", e),
            Self::InfoHashMismatch => write!(f, "info hash mismatch"),
            Self::InvalidPieceIndex(index) => {
                write!(f, "piece index {} out of range", index)
            }
            Self::BlockOutOfBounds { index, offset, len } => write!(
                f,
                "block at offset {} with length {} overruns piece {}",
                offset, len, index
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            Self::Bencode(e) => Some(e),
            Self::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl Error {
    /// Classifies an IO error raised on a peer socket: decode failures are
    /// flagged by the codecs as `InvalidData` and count as protocol
    /// violations, everything else is a transport fault.
    pub(crate) fn from_session_io(addr: SocketAddr, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::Protocol {
                addr,
                violation: Violation::Framing(e),
            }
        } else {
            Self::Transport { addr, source: e }
        }
    }
}
