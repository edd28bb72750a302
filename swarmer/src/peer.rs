use std::{
    cmp::Ordering,
    net::{IpAddr, SocketAddr},
};

use rand::Rng as _;

const PEER_ID_PREFIX: &[u8; 8] = b"-SW0100-";

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub const LENGTH: usize = 20;

    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// A random id carrying this client's prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        rand::thread_rng().fill(&mut id[PEER_ID_PREFIX.len()..]);
        Self(id)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(slice).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The all-zero id stands for "not known yet".
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerId(")?;
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        f.write_str(")")?;
        Ok(())
    }
}

/// Who a peer is: its id plus the address it can be reached at.
///
/// Before the handshake the id is unknown (zero) and the identity is provisional,
/// so equality falls back to the address when either id is zero.
#[derive(Debug, Clone, Copy)]
pub struct PeerIdentity {
    id: PeerId,
    ip: IpAddr,
    port: u16,
}

impl PeerIdentity {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn provisional(addr: SocketAddr) -> Self {
        Self::new(PeerId::default(), addr)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn with_id(self, id: PeerId) -> Self {
        Self { id, ..self }
    }

    /// Address, then port, then id bytes.
    pub fn ordering(&self, other: &Self) -> Ordering {
        self.ip
            .cmp(&other.ip)
            .then(self.port.cmp(&other.port))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        if !self.id.is_zero() && !other.id.is_zero() {
            self.id == other.id
        } else {
            self.ip == other.ip && self.port == other.port
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr())
    }
}
