// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod error;
pub mod magnet;
pub mod metainfo;
mod peer;
mod piece;
pub mod torrent;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

/// Pieces are addressed by their zero based position in the torrent.
///
/// The wire carries these as big endian u32s; in code they are widened to
/// `usize` so they can index straight into the piece vector.
pub type PieceIndex = usize;

/// The 20 byte id a client presents to trackers and peers.
///
/// See http://bittorrent.org/beps/bep_0020.html for the conventions clients
/// follow when picking one.
pub type PeerId = [u8; 20];

/// A SHA-1 digest, 20 bytes.
pub type Sha1Hash = [u8; 20];

/// Piece availability, one bit per piece, with piece 0 in the most
/// significant bit of the first byte.
///
/// This is exactly the wire layout of the bitfield message, so packing and
/// unpacking against raw bytes are the vector's own `from_vec`/`into_vec`.
pub type Bitfield = BitVec<Msb0, u8>;

#[cfg(test)]
mod tests {
    use super::*;

    // The wire representation of a bitfield is MSB first: bit i of the
    // logical piece vector lives at bit (7 - i % 8) of byte i / 8.
    #[test]
    fn test_bitfield_wire_order() {
        let bitfield = Bitfield::from_vec(vec![0b1100_0001]);
        assert_eq!(bitfield.len(), 8);
        assert!(bitfield[0]);
        assert!(bitfield[1]);
        assert!(!bitfield[2]);
        assert!(bitfield[7]);

        // round-trip on a length multiple of 8 is the identity
        let raw = vec![0xC0, 0x01, 0x55];
        let bitfield = Bitfield::from_vec(raw.clone());
        assert_eq!(bitfield.into_vec(), raw);
    }
}
