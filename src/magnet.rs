//! Magnet URI parsing.
//!
//! Only the fields the engine consumes are extracted: the v1 info hash from
//! the `xt` topic and the tracker list from the `tr` parameters.

use url::Url;

use crate::{error::*, Sha1Hash};

#[derive(Clone, Debug, PartialEq)]
pub struct Magnet {
    /// The SHA-1 info hash identifying the swarm.
    pub info_hash: Sha1Hash,
    /// The tracker URLs listed in the magnet, in order of appearance.
    pub trackers: Vec<String>,
}

impl Magnet {
    pub fn from_url(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidMagnet(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(Error::InvalidMagnet(format!(
                "unexpected scheme {}",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    // the topic is of the form urn:btih:<40 hex digit hash>
                    let digest = value.rsplit(':').next().unwrap_or_default();
                    let digest = hex::decode(digest).map_err(|e| {
                        Error::InvalidMagnet(format!("bad info hash: {}", e))
                    })?;
                    if digest.len() != 20 {
                        return Err(Error::InvalidMagnet(format!(
                            "info hash is {} bytes, expected 20",
                            digest.len()
                        )));
                    }
                    let mut hash = [0; 20];
                    hash.copy_from_slice(&digest);
                    info_hash = Some(hash);
                }
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            Error::InvalidMagnet("missing xt topic".into())
        })?;
        Ok(Self {
            info_hash,
            trackers,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_magnet() {
        let magnet = Magnet::from_url(
            "magnet:?xt=urn:btih:aabbccddeeff00112233445566778899aabbccdd\
             &tr=udp%3A%2F%2Ftracker.io%3A80&tr=udp%3A%2F%2Fbackup.io%3A80",
        )
        .unwrap();

        let mut expected = [0; 20];
        expected.copy_from_slice(
            &hex::decode("aabbccddeeff00112233445566778899aabbccdd").unwrap(),
        );
        assert_eq!(magnet.info_hash, expected);
        assert_eq!(
            magnet.trackers,
            vec!["udp://tracker.io:80", "udp://backup.io:80"]
        );
    }

    #[test]
    fn test_rejects_non_magnet_scheme() {
        assert!(matches!(
            Magnet::from_url("http://example.com"),
            Err(Error::InvalidMagnet(_))
        ));
    }

    #[test]
    fn test_rejects_short_info_hash() {
        assert!(matches!(
            Magnet::from_url("magnet:?xt=urn:btih:aabbcc"),
            Err(Error::InvalidMagnet(_))
        ));
    }

    #[test]
    fn test_rejects_missing_topic() {
        assert!(matches!(
            Magnet::from_url("magnet:?tr=udp%3A%2F%2Ftracker.io%3A80"),
            Err(Error::InvalidMagnet(_))
        ));
    }
}
