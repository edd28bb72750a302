use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use crate::{PeerIdentity, Sha1};

use super::{Event, ScrapeStats, DEFAULT_ANNOUNCE_INTERVAL};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// interval handed out to clients, entries expire after 1.5 times this
    pub interval: Duration,
    /// most peers returned by a single announce
    pub max_peers: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ANNOUNCE_INTERVAL,
            max_peers: 50,
        }
    }
}

impl TrackerConfig {
    pub fn expiration(&self) -> Duration {
        self.interval * 3 / 2
    }
}

/// Reason an announce was refused, sent back as `failure reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRejected(pub String);

impl std::fmt::Display for AnnounceRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AnnounceRejected {}

impl AnnounceRejected {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Sha1,
    pub identity: PeerIdentity,
    pub event: Event,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub num_want: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AnnounceReply {
    pub interval: Duration,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<PeerIdentity>,
}

#[derive(Debug, Clone)]
struct TrackedPeer {
    identity: PeerIdentity,
    event: Event,
    left: u64,
    expires: Instant,
}

impl TrackedPeer {
    fn seeder(&self) -> bool {
        self.event == Event::Completed || self.left == 0
    }
}

#[derive(Debug, Default, Clone)]
struct TrackedTorrent {
    name: Option<String>,
    completed: u64,
    peers: Vec<TrackedPeer>,
}

impl TrackedTorrent {
    fn purge(&mut self, now: Instant) {
        self.peers.retain(|peer| peer.expires > now);
    }

    fn find(&mut self, identity: &PeerIdentity) -> Option<&mut TrackedPeer> {
        self.peers.iter_mut().find(|peer| &peer.identity == identity)
    }

    fn stats(&self) -> ScrapeStats {
        let complete = self.peers.iter().filter(|p| p.seeder()).count() as u32;
        ScrapeStats {
            downloaded: self.completed,
            complete,
            incomplete: self.peers.len() as u32 - complete,
            name: self.name.clone(),
        }
    }
}

/// Peers known to the tracker, per info hash.
#[derive(Debug, Default)]
pub struct TrackerRegistry {
    config: TrackerConfig,
    torrents: HashMap<Sha1, TrackedTorrent>,
}

impl TrackerRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            torrents: Default::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Register a torrent ahead of any announce so scrapes can report its name.
    pub fn track(&mut self, info_hash: Sha1, name: Option<String>) {
        let torrent = self.torrents.entry(info_hash).or_default();
        if name.is_some() {
            torrent.name = name;
        }
    }

    pub fn announce(
        &mut self,
        request: AnnounceRequest,
        now: Instant,
    ) -> Result<AnnounceReply, AnnounceRejected> {
        let expires = now + self.config.expiration();
        let identity = request.identity;

        match request.event {
            Event::Stopped => {
                if let Some(torrent) = self.torrents.get_mut(&request.info_hash) {
                    torrent.purge(now);
                    torrent.peers.retain(|peer| peer.identity != identity);
                    tracing::debug!(peer = %identity, info_hash = %request.info_hash, "peer stopped");
                }
                return Ok(AnnounceReply {
                    interval: self.config.interval,
                    complete: 0,
                    incomplete: 0,
                    peers: Vec::new(),
                });
            }
            Event::None => {
                let refreshed = self
                    .torrents
                    .get_mut(&request.info_hash)
                    .and_then(|torrent| {
                        torrent.purge(now);
                        torrent.find(&identity)
                    })
                    .map(|peer| {
                        peer.identity = identity;
                        peer.left = request.left;
                        peer.expires = expires;
                    })
                    .is_some();
                if !refreshed {
                    return Err(AnnounceRejected::new("peer not started"));
                }
            }
            Event::Started | Event::Completed => {
                let torrent = self.torrents.entry(request.info_hash).or_default();
                torrent.purge(now);
                if request.event == Event::Completed && request.downloaded > 0 {
                    torrent.completed += 1;
                }
                match torrent.find(&identity) {
                    Some(peer) => {
                        peer.identity = identity;
                        peer.event = request.event;
                        peer.left = request.left;
                        peer.expires = expires;
                    }
                    None => {
                        tracing::debug!(peer = %identity, info_hash = %request.info_hash, event = ?request.event, "peer registered");
                        torrent.peers.push(TrackedPeer {
                            identity,
                            event: request.event,
                            left: request.left,
                            expires,
                        });
                    }
                }
            }
        }

        let Some(torrent) = self.torrents.get(&request.info_hash) else {
            return Err(AnnounceRejected::new("unknown torrent"));
        };
        let stats = torrent.stats();
        let max_peers = request
            .num_want
            .unwrap_or(self.config.max_peers)
            .min(self.config.max_peers);
        let peers = torrent
            .peers
            .iter()
            .filter(|peer| peer.identity != identity)
            .take(max_peers)
            .map(|peer| peer.identity)
            .collect();

        Ok(AnnounceReply {
            interval: self.config.interval,
            complete: stats.complete,
            incomplete: stats.incomplete,
            peers,
        })
    }

    /// Statistics for the requested torrents, or for all of them if `info_hashes` is empty.
    /// Unknown info hashes are left out.
    pub fn scrape(&mut self, info_hashes: &[Sha1], now: Instant) -> Vec<(Sha1, ScrapeStats)> {
        let mut result = Vec::new();
        for (hash, torrent) in self.torrents.iter_mut() {
            if info_hashes.is_empty() || info_hashes.contains(hash) {
                torrent.purge(now);
                result.push((*hash, torrent.stats()));
            }
        }
        result.sort_by_key(|(hash, _)| *hash);
        result
    }
}

/// Address to register for a peer seen at `observed`.
///
/// Peers behind a private address must tell us where they can be reached with the `ip` parameter.
pub fn resolve_peer_ip(observed: IpAddr, ip: Option<IpAddr>) -> Result<IpAddr, AnnounceRejected> {
    if !is_private(observed) {
        return Ok(observed);
    }
    ip.ok_or_else(|| AnnounceRejected::new("ip parameter required for peers on a private network"))
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
