use std::net::SocketAddr;

use crate::{NetworkStats, PeerId, TorrentInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TorrentViewState {
    Downloading,
    Seeding,
    Stopped,
    /// storage failed, the torrent no longer exchanges pieces
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    /// nothing heard back yet
    Pending,
    Ok { peers: usize },
    Error(String),
    /// too many consecutive failures, no more announces are made
    Unreachable,
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerStatus::Pending => f.write_str("pending"),
            TrackerStatus::Ok { peers } => write!(f, "ok ({peers} peers)"),
            TrackerStatus::Error(error) => write!(f, "error: {error}"),
            TrackerStatus::Unreachable => f.write_str("unreachable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TorrentViewPeer {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// handshake completed
    pub active: bool,
    /// we are choking the peer
    pub choking: bool,
    /// the peer is choking us
    pub choked: bool,
    /// the peer is interested in us
    pub interested: bool,
    /// we are interested in the peer
    pub interesting: bool,
    pub outstanding: usize,
    pub upload_rate: u32,
    pub download_rate: u32,
}

#[derive(Debug, Clone)]
pub struct TorrentViewTracker {
    pub url: String,
    pub status: TrackerStatus,
    pub failures: u32,
}

#[derive(Debug, Clone)]
pub struct TorrentView {
    pub info: TorrentInfo,
    pub peers: Vec<TorrentViewPeer>,
    pub trackers: Vec<TorrentViewTracker>,
    pub progress: f64,
    /// pieces still missing
    pub needed: u32,
    pub stats: NetworkStats,
    pub state: TorrentViewState,
}

impl TorrentView {
    pub fn complete(&self) -> bool {
        self.needed == 0
    }
}
