//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The two character client prefix baked into generated peer ids.
pub const CLIENT_PREFIX: &str = "pi";

/// The configuration of a single swarm engine instance.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The address on which incoming peer connections are accepted. If not
    /// set, the engine does not listen and only makes outbound connections.
    pub listen_addr: Option<SocketAddr>,

    /// How long an outbound TCP connect may take before the session is
    /// abandoned.
    pub connect_timeout: Duration,
}

impl Conf {
    /// Returns a configuration with reasonable defaults and a freshly
    /// generated peer id.
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            client_id: generate_peer_id(rng),
            listen_addr: None,
            // the conventional bound on peer connects; reads themselves are
            // unbounded and only terminated by closing the socket
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Synthesizes a 20 byte peer id: the client prefix, a `-` delimiter and 17
/// uniformly random decimal digits.
///
/// The rng is passed in rather than taken from a global source so that tests
/// can seed it.
pub fn generate_peer_id(rng: &mut impl Rng) -> PeerId {
    let mut id = String::with_capacity(20);
    id.push_str(CLIENT_PREFIX);
    id.push('-');
    for _ in 0..17 {
        id.push(char::from(b'0' + rng.gen_range(0..10)));
    }
    debug_assert_eq!(id.len(), 20);

    let mut peer_id = [0; 20];
    peer_id.copy_from_slice(id.as_bytes());
    peer_id
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let mut rng = StdRng::seed_from_u64(42);
        let id = generate_peer_id(&mut rng);

        assert_eq!(&id[..2], CLIENT_PREFIX.as_bytes());
        assert_eq!(id[2], b'-');
        assert!(id[3..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn test_generate_peer_id_deterministic_with_seed() {
        let mut rng = StdRng::seed_from_u64(7);
        let first = generate_peer_id(&mut rng);
        let mut rng = StdRng::seed_from_u64(7);
        let second = generate_peer_id(&mut rng);
        assert_eq!(first, second);
    }
}
