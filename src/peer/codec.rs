//! The codecs for the two framing layers of the peer wire protocol: the
//! fixed 68 byte handshake and the length prefixed messages that follow it.
//!
//! All multi byte integers are network byte order. Decoding is the single
//! point where raw bytes become typed messages; the router only ever matches
//! on the [`Message`] variants.

use std::{
    collections::HashMap,
    convert::TryFrom,
    io::{self, Cursor},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{piece::BlockInfo, Bitfield, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake frame exchanged once at connection start, 68 bytes in
/// total.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved extension bits. We never advertise any.
    pub reserved: [u8; 8],
    /// The torrent's info hash; a mismatch is fatal to the session.
    pub info_hash: Sha1Hash,
    /// The remote peer's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Whether the peer advertises extension protocol support: bit 20,
    /// counted from the least significant bit of the 8 reserved bytes.
    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

/// Codec for the handshake.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.put_u8(handshake.prot.len() as u8);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek the protocol string length before committing to the frame
        let mut tmp = Cursor::new(&buf[..]);
        let prot_len = tmp.get_u8() as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string length must be 19",
            ));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if buf.len() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string mismatch",
            ));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The payload of an extended handshake (message id 20, sub id 0): a
/// bencoded dictionary. Decoded for completeness, not acted upon.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension names to the message sub ids the peer chose for them.
    pub m: Option<HashMap<String, i64>>,
    /// The size of the metadata the peer can serve, if it supports BEP 9.
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshake {
    pub fn from_bytes(
        buf: &[u8],
    ) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }
}

/// The id bytes of the peer messages (all but keep-alive, which has none).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            20 => Ok(Extended),
            id => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message id {}", id),
            )),
        }
    }
}

/// A peer message, one variant per wire id plus the id-less keep-alive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the message's wire id, or `None` for a keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        use Message::*;
        match self {
            KeepAlive => None,
            Choke => Some(MessageId::Choke),
            Unchoke => Some(MessageId::Unchoke),
            Interested => Some(MessageId::Interested),
            NotInterested => Some(MessageId::NotInterested),
            Have { .. } => Some(MessageId::Have),
            Bitfield(_) => Some(MessageId::Bitfield),
            Request(_) => Some(MessageId::Request),
            Block { .. } => Some(MessageId::Block),
            Cancel(_) => Some(MessageId::Cancel),
            Extended { .. } => Some(MessageId::Extended),
        }
    }
}

impl BlockInfo {
    /// Writes the block info as the 3 by 4 byte payload shared by the
    /// request and cancel messages.
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece_index as u32);
        buf.put_u32(self.offset);
        buf.put_u32(self.len);
    }

    fn decode(buf: &mut BytesMut) -> Self {
        let piece_index = buf.get_u32() as PieceIndex;
        let offset = buf.get_u32();
        let len = buf.get_u32();
        Self {
            piece_index,
            offset,
            len,
        }
    }
}

/// Codec for all peer messages after the handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let raw = bitfield.as_slice();
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(raw);
            }
            Request(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                block.encode(buf);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                block.encode(buf);
            }
            Extended { id, payload } => {
                buf.put_u32(1 + 1 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut tmp = Cursor::new(&buf[..]);
        let msg_len = tmp.get_u32() as usize;
        if buf.len() < 4 + msg_len {
            return Ok(None);
        }
        buf.advance(4);

        // a zero length frame is a keep-alive, it carries no id
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len - 1;

        // the payload length must match the message kind
        let payload_len_valid = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => payload_len == 0,
            MessageId::Have => payload_len == 4,
            MessageId::Request | MessageId::Cancel => payload_len == 3 * 4,
            MessageId::Block => payload_len >= 2 * 4,
            MessageId::Bitfield => payload_len > 0,
            MessageId::Extended => payload_len > 0,
        };
        if !payload_len_valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid payload length {} for message id {:?}",
                    payload_len, id
                ),
            ));
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Bitfield => {
                let mut raw = vec![0; payload_len];
                buf.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            }
            MessageId::Request => Message::Request(BlockInfo::decode(buf)),
            MessageId::Block => {
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 2 * 4];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(BlockInfo::decode(buf)),
            MessageId::Extended => {
                let id = buf.get_u8();
                let mut payload = vec![0; payload_len - 1];
                buf.copy_to_slice(&mut payload);
                Message::Extended { id, payload }
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_message(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0xAB; 20], *b"pi-01234567890123456");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_needs_all_68_bytes() {
        let handshake = Handshake::new([0xAB; 20], *b"pi-01234567890123456");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(40);

        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(
            HandshakeCodec.decode(&mut partial).unwrap().unwrap(),
            handshake
        );
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.extend_from_slice(b"HTTP!");
        let err = HandshakeCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut handshake = Handshake::new([0; 20], [b'x'; 20]);
        handshake.prot[18] = b'!';
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let err = HandshakeCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_handshake_extended_support_bit() {
        let mut handshake = Handshake::new([0; 20], [b'x'; 20]);
        assert!(!handshake.supports_extended());
        handshake.reserved[5] = 0x10;
        assert!(handshake.supports_extended());
    }

    // every recognized message kind must survive an encode/decode round trip
    #[test]
    fn test_message_round_trip() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000, 0x0F])),
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: 0x4000,
                len: 0x4000,
            }),
            Message::Block {
                piece_index: 1,
                offset: 0x4000,
                data: b"a block of piece one".to_vec(),
            },
            Message::Cancel(BlockInfo {
                piece_index: 9,
                offset: 0,
                len: 0x4000,
            }),
            Message::Extended {
                id: 0,
                payload: b"d1:md11:ut_metadatai1eee".to_vec(),
            },
        ];

        for msg in messages {
            let mut buf = encode_message(msg.clone());
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_keep_alive_is_a_zero_length_frame() {
        let buf = encode_message(Message::KeepAlive);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut full = encode_message(Message::Have { piece_index: 3 });
        let mut partial = full.split_to(6);

        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap().unwrap(),
            Message::Have { piece_index: 3 }
        );
    }

    #[test]
    fn test_decode_consumes_consecutive_frames() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();

        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        );
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unchoke
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_message_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        let err = PeerCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_payload_length_mismatch_is_rejected() {
        // a choke frame carrying a stray payload byte
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(MessageId::Choke as u8);
        buf.put_u8(0xFF);
        let err = PeerCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // a request frame one byte short of its fixed payload
        let mut buf = BytesMut::new();
        buf.put_u32(12);
        buf.put_u8(MessageId::Request as u8);
        buf.extend_from_slice(&[0; 11]);
        let err = PeerCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_extended_handshake_payload() {
        let payload = b"d1:md11:ut_metadatai3ee13:metadata_sizei31235ee";
        let handshake = ExtendedHandshake::from_bytes(payload).unwrap();
        assert_eq!(
            handshake.m.unwrap().get("ut_metadata").copied(),
            Some(3)
        );
        assert_eq!(handshake.metadata_size, Some(31235));
    }

    #[test]
    fn test_bitfield_decode_keeps_wire_bit_order() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(MessageId::Bitfield as u8);
        buf.put_u8(0b1010_0000);

        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(bitfield) => {
                assert_eq!(bitfield.len(), 8);
                assert!(bitfield[0]);
                assert!(!bitfield[1]);
                assert!(bitfield[2]);
            }
            msg => panic!("unexpected message: {:?}", msg),
        }
    }
}
