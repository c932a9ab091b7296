//! Parsing of `.torrent` metainfo files.
//!
//! The metainfo is a bencoded dictionary; a single deserialization pass
//! produces plain value records and everything else (info hash, piece
//! digests, per piece lengths) is derived from those.

use sha1::{Digest, Sha1};

use crate::{error::*, PieceIndex, Sha1Hash};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses the raw bytes of a `.torrent` file and checks that the fields
    /// needed to drive a download are structurally consistent.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.info.validate()?;
        Ok(metainfo)
    }

    /// Computes the SHA-1 digest of the canonically bencoded info dictionary,
    /// which identifies the swarm.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns all tracker URLs in announce order: the main announce URL
    /// first, then the flattened announce-list tiers.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(announce) = &self.announce {
            trackers.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                trackers.extend(tier.iter().cloned());
            }
        }
        trackers
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

impl Info {
    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The declared SHA-1 digest of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.pieces.len() {
            return Err(Error::InvalidPieceIndex(index));
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[pos..pos + 20]);
        Ok(hash)
    }

    /// The sum of the length of all files in the torrent.
    pub fn total_len(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => {
                files.iter().map(|f| f.length.max(0) as u64).sum()
            }
            (None, None) => 0,
        }
    }

    /// Returns the length of the piece at the given index. All pieces share
    /// the nominal piece length except the last one, which holds whatever
    /// remains of the download.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        let piece_count = self.piece_count();
        if index + 1 == piece_count {
            let last_piece_len = self.total_len()
                - self.piece_length * (piece_count as u64 - 1);
            Ok(last_piece_len as u32)
        } else if index + 1 < piece_count {
            Ok(self.piece_length as u32)
        } else {
            Err(Error::InvalidPieceIndex(index))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(Error::InvalidMetainfo(
                "piece length must be positive".into(),
            ));
        }
        if self.piece_length > u32::MAX as u64 {
            return Err(Error::InvalidMetainfo(
                "piece length too large".into(),
            ));
        }
        if self.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "piece digest string is not a multiple of 20 bytes".into(),
            ));
        }
        let total_len = self.total_len();
        if total_len == 0 {
            return Err(Error::InvalidMetainfo(
                "torrent has no length or files".into(),
            ));
        }
        // every piece but the last must be full length, the last must hold
        // the remainder
        let expected_count =
            (total_len + self.piece_length - 1) / self.piece_length;
        if expected_count != self.piece_count() as u64 {
            return Err(Error::InvalidMetainfo(format!(
                "expected {} piece digests, found {}",
                expected_count,
                self.piece_count()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    // A two piece single file torrent: 32 bytes of payload split into 16 byte
    // pieces, bencoded by hand with keys in canonical sorted order.
    fn fixture() -> Vec<u8> {
        let digest_a = Sha1::digest(&[b'A'; 16]);
        let digest_b = Sha1::digest(&[b'B'; 16]);

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:udp://tracker.io:80");
        buf.extend_from_slice(
            b"13:announce-listll19:udp://tracker.io:80ee",
        );
        buf.extend_from_slice(
            b"4:infod6:lengthi32e4:name4:test12:piece lengthi16e6:pieces40:",
        );
        buf.extend_from_slice(&digest_a);
        buf.extend_from_slice(&digest_b);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&fixture()).unwrap();

        assert_eq!(metainfo.announce.as_deref(), Some("udp://tracker.io:80"));
        assert_eq!(
            metainfo.trackers(),
            vec![
                "udp://tracker.io:80".to_string(),
                "udp://tracker.io:80".to_string()
            ]
        );
        assert_eq!(metainfo.info.name, "test");
        assert_eq!(metainfo.info.piece_length, 16);
        assert_eq!(metainfo.info.piece_count(), 2);
        assert_eq!(metainfo.info.total_len(), 32);
        assert_eq!(metainfo.info.piece_len(0).unwrap(), 16);
        assert_eq!(metainfo.info.piece_len(1).unwrap(), 16);
        assert!(metainfo.info.piece_len(2).is_err());

        let mut digest_a = [0; 20];
        digest_a.copy_from_slice(&Sha1::digest(&[b'A'; 16]));
        assert_eq!(metainfo.info.piece_hash(0).unwrap(), digest_a);
    }

    #[test]
    fn test_short_last_piece() {
        // 20 bytes of payload in 16 byte pieces: the second piece is 4 bytes
        let digest_a = Sha1::digest(&[b'A'; 16]);
        let digest_b = Sha1::digest(&[b'B'; 4]);

        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi20e4:name4:test12:piece lengthi16e6:pieces40:",
        );
        buf.extend_from_slice(&digest_a);
        buf.extend_from_slice(&digest_b);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.info.piece_len(0).unwrap(), 16);
        assert_eq!(metainfo.info.piece_len(1).unwrap(), 4);
    }

    #[test]
    fn test_info_hash_covers_canonical_info_dict() {
        let buf = fixture();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        // the info dict is the bencoded substring starting right after the
        // "4:info" key and running to the closing 'e' of the outer dict
        let key_pos = buf
            .windows(6)
            .position(|w| w == b"4:info")
            .unwrap();
        let info_slice = &buf[key_pos + 6..buf.len() - 1];

        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(info_slice));
        assert_eq!(metainfo.create_info_hash().unwrap(), expected);
    }

    #[test]
    fn test_piece_digest_count_must_match_length() {
        // 32 bytes of payload but only one digest
        let digest_a = Sha1::digest(&[b'A'; 16]);
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi32e4:name4:test12:piece lengthi16e6:pieces20:",
        );
        buf.extend_from_slice(&digest_a);
        buf.extend_from_slice(b"ee");

        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
