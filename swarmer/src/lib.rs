mod bencode;

mod hash;
pub use hash::Sha1;

mod piece;
pub use piece::{OutOfBounds, PieceBitfield, PieceIdx};

mod request;
pub use request::{Request, CHUNK_LENGTH, MAX_REQUEST_LENGTH};

mod peer;
pub use peer::{PeerId, PeerIdentity};

mod info;
pub use info::{TorrentFile, TorrentFileRange, TorrentInfo, TorrentInfoParts};

mod creator;
pub use creator::{TorrentCreator, TorrentCreatorConfig, TorrentCreatorFile};

mod storage;
pub use storage::Storage;

mod network_stats;
pub use network_stats::{NetworkStats, NetworkStatsAccum};

pub mod wire;

pub mod tracker;
pub use tracker::{
    registry::{TrackerConfig, TrackerRegistry},
    server::TrackerServer,
    Announce, AnnounceParams, AnnouncePeer, Event, Scrape, ScrapeStats, TrackerClient,
};

mod session;
pub use session::{Session, SessionConfig, Torrent, TorrentConfig, KEEP_ALIVE_PERIOD};

mod view;
pub use view::{TorrentView, TorrentViewPeer, TorrentViewState, TorrentViewTracker, TrackerStatus};
