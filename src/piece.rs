//! In-memory accounting of the torrent's pieces.
//!
//! Each piece keeps its expected digest, a zero-filled assembly buffer and a
//! byte-granular received map. Blocks may arrive from any number of peers in
//! any order; once every byte of a piece is present the buffer is hashed and
//! either committed for good or thrown away for a fresh download.

use sha1::{Digest, Sha1};

use crate::{error::*, metainfo::Info, Bitfield, PieceIndex, Sha1Hash};

/// The block length used when requesting piece data: 16 KiB, the size the
/// ecosystem has settled on. A piece's final block is shorter whenever the
/// piece length is not an exact multiple of it.
pub(crate) const BLOCK_LEN: u32 = 16 * 1024;

/// Identifies one block, the unit of request and transfer: a sub range of
/// a piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The piece the block belongs to.
    pub piece_index: PieceIndex,
    /// The block's byte offset within its piece.
    pub offset: u32,
    /// The number of bytes in the block.
    pub len: u32,
}

/// The outcome of writing one block into its piece.
#[derive(Debug, PartialEq)]
pub(crate) enum BlockWrite {
    /// The bytes were recorded (or swallowed, for an already complete piece)
    /// and the piece is not newly complete.
    Accepted,
    /// This block supplied the last missing bytes and the assembled piece
    /// matched its digest.
    Completed,
    /// This block supplied the last missing bytes but the assembled piece
    /// hashed to something else; the piece was reset for re-download.
    DigestMismatch {
        expected: Sha1Hash,
        actual: Sha1Hash,
    },
}

/// A single piece of the download.
pub(crate) struct Piece {
    /// The piece's zero based index in the torrent.
    index: PieceIndex,
    /// The SHA-1 digest the metainfo declares for this piece.
    digest: Sha1Hash,
    /// The piece's length. Equal to the torrent's piece length for all but
    /// possibly the last piece.
    len: u32,
    /// The assembly buffer. Bytes not marked in `received` are zero filler
    /// and must not be read.
    buf: Vec<u8>,
    /// One bit per buffer byte; a set bit means that byte has been written.
    received: Bitfield,
    /// Set once the whole buffer is present and digest checked. Never unset.
    complete: bool,
}

impl Piece {
    fn new(index: PieceIndex, digest: Sha1Hash, len: u32) -> Self {
        Self {
            index,
            digest,
            len,
            buf: vec![0; len as usize],
            received: Bitfield::repeat(false, len as usize),
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Walks the piece in block length steps and returns one entry per
    /// chunk that still contains at least one unreceived byte, in ascending
    /// offset order. The final chunk is cut down to the piece length, so no
    /// returned block ever extends past the piece.
    pub fn missing_blocks(&self) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < self.len {
            let len = BLOCK_LEN.min(self.len - offset);
            let range = offset as usize..(offset + len) as usize;
            if !self.received[range].all() {
                blocks.push(BlockInfo {
                    piece_index: self.index,
                    offset,
                    len,
                });
            }
            offset += len;
        }
        blocks
    }

    /// Writes a block into the assembly buffer and marks its bytes received.
    /// Re-receiving bytes is permitted and idempotent. When the write fills
    /// the last gap, the piece is digest checked: a match completes it for
    /// good, a mismatch resets it for a fresh download.
    fn add_block(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> std::result::Result<BlockWrite, Violation> {
        let begin = offset as usize;
        let end = begin + data.len();
        if end > self.len as usize {
            return Err(Violation::BlockOutOfBounds {
                index: self.index,
                offset,
                len: data.len() as u32,
            });
        }

        // extra bytes for an already complete piece are swallowed; they never
        // overwrite verified data or trigger re-verification
        if self.complete {
            return Ok(BlockWrite::Accepted);
        }

        self.buf[begin..end].copy_from_slice(data);
        for i in begin..end {
            self.received.set(i, true);
        }

        if !self.received.all() {
            return Ok(BlockWrite::Accepted);
        }

        let digest = Sha1::digest(&self.buf);
        if digest.as_slice() == self.digest {
            self.complete = true;
            Ok(BlockWrite::Completed)
        } else {
            let mut actual = [0; 20];
            actual.copy_from_slice(&digest);
            log::warn!(
                "Piece {} digest mismatch, resetting for re-download",
                self.index
            );
            self.buf = vec![0; self.len as usize];
            self.received = Bitfield::repeat(false, self.len as usize);
            Ok(BlockWrite::DigestMismatch {
                expected: self.digest,
                actual,
            })
        }
    }

    /// Sets the whole piece at once. Used when already held content (e.g.
    /// read back from disk) is presented to the store.
    fn accept(&mut self, data: &[u8]) -> Result<()> {
        let digest = Sha1::digest(data);
        if data.len() != self.len as usize
            || digest.as_slice() != self.digest
        {
            let mut actual = [0; 20];
            actual.copy_from_slice(&digest);
            return Err(Error::DigestMismatch {
                index: self.index,
                expected: self.digest,
                actual,
            });
        }
        self.buf.copy_from_slice(data);
        self.received = Bitfield::repeat(true, self.len as usize);
        self.complete = true;
        Ok(())
    }

    /// Reads a block back for serving a peer's request.
    ///
    /// The historical availability check is loose: only the first requested
    /// byte needs to have been received. The range is bounds checked so a
    /// reply can never read past the piece.
    pub fn block(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let begin = offset as usize;
        let end = begin + len as usize;
        if begin >= self.len as usize || end > self.len as usize {
            return None;
        }
        if !self.received[begin] {
            return None;
        }
        Some(&self.buf[begin..end])
    }

    /// The assembled piece bytes, available only once complete.
    pub fn data(&self) -> Option<&[u8]> {
        if self.complete {
            Some(&self.buf)
        } else {
            None
        }
    }
}

/// The authoritative store of all pieces, owned by the torrent's event
/// router and never touched from session tasks.
pub(crate) struct PieceStore {
    pieces: Vec<Piece>,
}

impl PieceStore {
    /// Builds the store from the metainfo's piece digests, with every piece
    /// incomplete. The last piece holds the remainder of the download.
    pub fn new(info: &Info) -> Result<Self> {
        let mut pieces = Vec::with_capacity(info.piece_count());
        for index in 0..info.piece_count() {
            pieces.push(Piece::new(
                index,
                info.piece_hash(index)?,
                info.piece_len(index)?,
            ));
        }
        Ok(Self { pieces })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: PieceIndex) -> Option<&Piece> {
        self.pieces.get(index)
    }

    /// True once every piece is complete and digest valid.
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Piece::is_complete)
    }

    /// Our piece availability, one bit per piece.
    pub fn have(&self) -> Bitfield {
        self.pieces.iter().map(Piece::is_complete).collect()
    }

    pub fn missing_blocks(&self, index: PieceIndex) -> Vec<BlockInfo> {
        self.pieces
            .get(index)
            .map(Piece::missing_blocks)
            .unwrap_or_default()
    }

    pub fn add_block(
        &mut self,
        index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> std::result::Result<BlockWrite, Violation> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Violation::InvalidPieceIndex(index))?;
        piece.add_block(offset, data)
    }

    pub fn accept_piece(
        &mut self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<()> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        piece.accept(data)
    }
}
