use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use slotmap::{SecondaryMap, SlotMap};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::AbortHandle,
};

use crate::{wire, Announce, PeerId, PieceIdx, Sha1, Storage, TorrentInfo, TorrentView};

mod listener;
use listener::ListenerProc;

pub(crate) mod peer;

mod connection;
use connection::ConnectionProc;
pub use connection::KEEP_ALIVE_PERIOD;

mod tracker;
use tracker::TrackerProc;

mod disk;
use disk::DiskProc;

pub(crate) mod coordinator;
pub use coordinator::TorrentConfig;
use coordinator::{PeerKey, SessionCoordinator, TorrentCmd, TrackerKey};

type Sender<T> = UnboundedSender<T>;
type Receiver<T> = UnboundedReceiver<T>;
type SessionSender = Sender<SessionMsg>;
type SessionReceiver = Receiver<SessionMsg>;

const TICK_PERIOD: Duration = Duration::from_secs(1);

slotmap::new_key_type! {
    pub struct TorrentKey;
}

macro_rules! torrent_or_return {
    ($state:expr, $key:expr) => {
        match $state.torrents.get($key) {
            Some(torrent) => torrent,
            None => return,
        }
    };
    ($state:expr, mut $key:expr) => {
        match $state.torrents.get_mut($key) {
            Some(torrent) => torrent,
            None => return,
        }
    };
}

type PeerReader = Pin<Box<dyn AsyncRead + Send + 'static>>;
type PeerWriter = Pin<Box<dyn AsyncWrite + Send + 'static>>;

struct PeerIo {
    reader: PeerReader,
    writer: PeerWriter,
}

impl PeerIo {
    fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }
}

enum SessionMsg {
    ListenerIncoming {
        peer_id: PeerId,
        peer_addr: SocketAddr,
        info_hash: Sha1,
        peer_io: PeerIo,
    },
    PeerHandshake {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        peer_id: PeerId,
    },
    PeerMessage {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        message: wire::Message,
    },
    PeerFailure {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        error: std::io::Error,
    },
    TrackerAnnounce {
        torrent_key: TorrentKey,
        tracker_key: TrackerKey,
        announce: Announce,
    },
    TrackerError {
        torrent_key: TorrentKey,
        tracker_key: TrackerKey,
        error: std::io::Error,
    },
    PieceRead {
        torrent_key: TorrentKey,
        piece_idx: PieceIdx,
        result: std::io::Result<Option<Bytes>>,
    },
    PieceWrite {
        torrent_key: TorrentKey,
        piece_idx: PieceIdx,
        result: std::io::Result<bool>,
    },
    TorrentTick,
    TorrentAdd {
        storage: Arc<Storage>,
        config: TorrentConfig,
        response: oneshot::Sender<std::io::Result<Torrent>>,
    },
    TorrentConnect {
        torrent_key: TorrentKey,
        address: SocketAddr,
    },
    TorrentView {
        torrent_key: TorrentKey,
        response: oneshot::Sender<TorrentView>,
    },
    TorrentQuit {
        torrent_key: TorrentKey,
    },
    Shutdown,
}

impl SessionMsg {
    fn torrent_key(&self) -> Option<TorrentKey> {
        match self {
            SessionMsg::ListenerIncoming { .. } => None,
            SessionMsg::PeerHandshake { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::PeerMessage { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::PeerFailure { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::TrackerAnnounce { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::TrackerError { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::PieceRead { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::PieceWrite { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::TorrentTick => None,
            SessionMsg::TorrentAdd { .. } => None,
            SessionMsg::TorrentConnect { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::TorrentView { torrent_key, .. } => Some(*torrent_key),
            SessionMsg::TorrentQuit { torrent_key } => Some(*torrent_key),
            SessionMsg::Shutdown => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionConfig {
    /// accept incoming peers on this address, port 0 picks a free one
    pub listen_addr: Option<SocketAddr>,
    /// a random id is generated when absent
    pub peer_id: Option<PeerId>,
}

pub struct Session {
    sender: SessionSender,
    peer_id: PeerId,
    listen_addr: Option<SocketAddr>,
    tick_handle: AbortHandle,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.tick_handle.abort();
        let _ = self.sender.send(SessionMsg::Shutdown);
    }
}

impl Session {
    pub async fn new() -> std::io::Result<Self> {
        Self::new_with(Default::default()).await
    }

    pub async fn new_with(config: SessionConfig) -> std::io::Result<Self> {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let peer_id = config.peer_id.unwrap_or_else(PeerId::generate);
        let listener = match config.listen_addr {
            Some(addr) => Some(ListenerProc::bind(sender.clone(), addr).await?),
            None => None,
        };
        let listen_addr = listener.as_ref().map(ListenerProc::local_addr);
        tracing::info!(?peer_id, ?listen_addr, "starting session");

        let state = SessionState::new(peer_id, listen_addr, sender.clone(), listener);
        tokio::task::spawn_blocking(move || session_run(state, receiver));
        let tick_handle = tokio::task::spawn({
            let sender = sender.clone();
            async move {
                while sender.send(SessionMsg::TorrentTick).is_ok() {
                    tokio::time::sleep(TICK_PERIOD).await;
                }
            }
        })
        .abort_handle();
        Ok(Self {
            sender,
            peer_id,
            listen_addr,
            tick_handle,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The address incoming peers connect to, if the session listens.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub async fn torrent_add(&self, info: TorrentInfo) -> std::io::Result<Torrent> {
        self.torrent_add_with(info, Default::default()).await
    }

    /// Open the torrent's storage below `config.root`, check what is already there
    /// and start exchanging pieces.
    pub async fn torrent_add_with(
        &self,
        info: TorrentInfo,
        config: TorrentConfig,
    ) -> std::io::Result<Torrent> {
        let root = config.root.clone();
        let storage = tokio::task::spawn_blocking(move || Storage::open(info, &root))
            .await
            .map_err(std::io::Error::other)??;

        let (sender, receiver) = oneshot::channel();
        self.send(SessionMsg::TorrentAdd {
            storage: Arc::new(storage),
            config,
            response: sender,
        })?;
        receiver.await.map_err(|_| session_closed())?
    }

    fn send(&self, message: SessionMsg) -> std::io::Result<()> {
        self.sender.send(message).map_err(|_| session_closed())
    }
}

fn session_closed() -> std::io::Error {
    std::io::Error::other("session is closed")
}

struct SessionTorrentEntry {
    state: SessionCoordinator,
    disk: DiskProc,
    trackers: SecondaryMap<TrackerKey, TrackerProc>,
    peers: SecondaryMap<PeerKey, ConnectionProc>,
    complete: watch::Sender<bool>,
}

struct SessionState {
    peer_id: PeerId,
    listen_addr: Option<SocketAddr>,
    sender: SessionSender,
    // kept alive for as long as the session runs
    _listener: Option<ListenerProc>,
    torrents: SlotMap<TorrentKey, SessionTorrentEntry>,
}

impl SessionState {
    fn new(
        peer_id: PeerId,
        listen_addr: Option<SocketAddr>,
        sender: SessionSender,
        listener: Option<ListenerProc>,
    ) -> Self {
        Self {
            peer_id,
            listen_addr,
            sender,
            _listener: listener,
            torrents: Default::default(),
        }
    }
}

fn session_run(mut state: SessionState, mut receiver: SessionReceiver) {
    while let Some(msg) = receiver.blocking_recv() {
        let shutdown = session_process(&mut state, msg);
        if shutdown {
            break;
        }
    }
    tracing::info!("session stopped");
}

fn session_process(state: &mut SessionState, msg: SessionMsg) -> bool {
    let torrent_key = msg.torrent_key();

    match msg {
        SessionMsg::ListenerIncoming {
            peer_id,
            peer_addr,
            info_hash,
            peer_io,
        } => session_process_listener_incoming(state, peer_id, peer_addr, info_hash, peer_io),
        SessionMsg::PeerHandshake {
            torrent_key,
            peer_key,
            peer_id,
        } => session_process_peer_handshake(state, torrent_key, peer_key, peer_id),
        SessionMsg::PeerMessage {
            torrent_key,
            peer_key,
            message,
        } => session_process_peer_message(state, torrent_key, peer_key, message),
        SessionMsg::PeerFailure {
            torrent_key,
            peer_key,
            error,
        } => session_process_peer_failure(state, torrent_key, peer_key, error),
        SessionMsg::TrackerAnnounce {
            torrent_key,
            tracker_key,
            announce,
        } => session_process_tracker_announce(state, torrent_key, tracker_key, announce),
        SessionMsg::TrackerError {
            torrent_key,
            tracker_key,
            error,
        } => session_process_tracker_error(state, torrent_key, tracker_key, error),
        SessionMsg::PieceRead {
            torrent_key,
            piece_idx,
            result,
        } => session_process_piece_read(state, torrent_key, piece_idx, result),
        SessionMsg::PieceWrite {
            torrent_key,
            piece_idx,
            result,
        } => session_process_piece_write(state, torrent_key, piece_idx, result),
        SessionMsg::TorrentTick => session_process_torrent_tick(state),
        SessionMsg::TorrentAdd {
            storage,
            config,
            response,
        } => session_process_torrent_add(state, storage, config, response),
        SessionMsg::TorrentConnect {
            torrent_key,
            address,
        } => session_process_torrent_connect(state, torrent_key, address),
        SessionMsg::TorrentView {
            torrent_key,
            response,
        } => session_process_torrent_view(state, torrent_key, response),
        SessionMsg::TorrentQuit { torrent_key } => {
            session_process_torrent_quit(state, torrent_key)
        }
        SessionMsg::Shutdown => {
            session_process_shutdown(state);
            return true;
        }
    }

    if let Some(torrent_key) = torrent_key {
        session_torrent_drain_and_execute(state, torrent_key);
    }

    false
}

fn session_process_listener_incoming(
    state: &mut SessionState,
    peer_id: PeerId,
    peer_addr: SocketAddr,
    info_hash: Sha1,
    peer_io: PeerIo,
) {
    let found = state
        .torrents
        .iter()
        .find(|(_, torrent)| torrent.state.info_hash() == info_hash)
        .map(|(key, _)| key);
    let Some(torrent_key) = found else {
        tracing::debug!(%peer_addr, %info_hash, "incoming peer for unknown torrent");
        return;
    };

    let torrent = &mut state.torrents[torrent_key];
    let Some(peer_key) = torrent
        .state
        .on_peer_accept(peer_id, peer_addr, Instant::now())
    else {
        return;
    };
    let handshake = wire::Handshake {
        info_hash,
        peer_id: state.peer_id,
    };
    let connection = ConnectionProc::accept(
        state.sender.clone(),
        torrent_key,
        peer_key,
        handshake,
        peer_io,
    );
    torrent.peers.insert(peer_key, connection);
    session_torrent_drain_and_execute(state, torrent_key);
}

fn session_process_peer_handshake(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    peer_id: PeerId,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.on_peer_handshake(peer_key, peer_id);
}

fn session_process_peer_message(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    message: wire::Message,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.on_peer_message(peer_key, message);
}

fn session_process_peer_failure(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    error: std::io::Error,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.on_peer_failure(peer_key, error);
}

fn session_process_tracker_announce(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    tracker_key: TrackerKey,
    announce: Announce,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent
        .state
        .on_tracker_announce(tracker_key, announce, Instant::now());
}

fn session_process_tracker_error(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    tracker_key: TrackerKey,
    error: std::io::Error,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent
        .state
        .on_tracker_error(tracker_key, error, Instant::now());
}

fn session_process_piece_read(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    piece_idx: PieceIdx,
    result: std::io::Result<Option<Bytes>>,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.on_piece_read(piece_idx, result);
}

fn session_process_piece_write(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    piece_idx: PieceIdx,
    result: std::io::Result<bool>,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.on_piece_write(piece_idx, result);
}

fn session_process_torrent_tick(state: &mut SessionState) {
    let now = Instant::now();
    let keys = state.torrents.keys().collect::<Vec<_>>();
    for key in keys {
        state.torrents[key].state.tick(now);
        session_torrent_drain_and_execute(state, key);
    }
}

fn session_process_torrent_add(
    state: &mut SessionState,
    storage: Arc<Storage>,
    mut config: TorrentConfig,
    response: oneshot::Sender<std::io::Result<Torrent>>,
) {
    let info = storage.info().clone();
    let duplicate = state
        .torrents
        .values()
        .any(|torrent| torrent.state.info_hash() == info.info_hash());
    if duplicate {
        let _ = response.send(Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("torrent {} was already added", info.info_hash()),
        )));
        return;
    }
    let bitfield = match storage.bitfield() {
        Ok(bitfield) => bitfield,
        Err(error) => {
            let _ = response.send(Err(error));
            return;
        }
    };
    if config.port.is_none() {
        config.port = state.listen_addr.map(|addr| addr.port());
    }

    let now = Instant::now();
    let (complete, complete_receiver) = watch::channel(false);
    let key = state.torrents.insert_with_key(|key| SessionTorrentEntry {
        state: SessionCoordinator::new(state.peer_id, info, bitfield, config, now),
        disk: DiskProc::spawn(state.sender.clone(), key, storage),
        trackers: Default::default(),
        peers: Default::default(),
        complete,
    });

    state.torrents[key].state.start(now);
    session_torrent_drain_and_execute(state, key);

    let _ = response.send(Ok(Torrent {
        sender: state.sender.clone(),
        key,
        complete: complete_receiver,
    }));
}

fn session_process_torrent_connect(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    address: SocketAddr,
) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.connect(address, Instant::now());
}

fn session_process_torrent_view(
    state: &mut SessionState,
    torrent_key: TorrentKey,
    response: oneshot::Sender<TorrentView>,
) {
    let torrent = torrent_or_return!(state, torrent_key);
    let view = torrent.state.view();
    let _ = response.send(view);
}

fn session_process_torrent_quit(state: &mut SessionState, torrent_key: TorrentKey) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    torrent.state.quit();
}

fn session_process_shutdown(state: &mut SessionState) {
    let keys = state.torrents.keys().collect::<Vec<_>>();
    for key in keys {
        state.torrents[key].state.quit();
        session_torrent_drain_and_execute(state, key);
    }
    // the `stopped` announces outlive the session
    for (_, mut torrent) in state.torrents.drain() {
        for (_, tracker) in torrent.trackers.drain() {
            tracker.detach();
        }
    }
}

fn session_torrent_drain_and_execute(state: &mut SessionState, torrent_key: TorrentKey) {
    let torrent = torrent_or_return!(state, mut torrent_key);
    let mut exit = false;
    while !exit {
        exit = true;
        let commands = torrent.state.drain().collect::<Vec<_>>();
        for command in commands {
            exit = false;
            match command {
                TorrentCmd::PieceRead { piece_idx } => torrent.disk.read(piece_idx),
                TorrentCmd::PieceWrite {
                    piece_idx,
                    piece_data,
                } => torrent.disk.write(piece_idx, piece_data),
                TorrentCmd::PeerConnect { peer_key, address } => {
                    let handshake = wire::Handshake {
                        info_hash: torrent.state.info_hash(),
                        peer_id: torrent.state.id(),
                    };
                    let connection = ConnectionProc::connect(
                        state.sender.clone(),
                        torrent_key,
                        peer_key,
                        handshake,
                        address,
                    );
                    torrent.peers.insert(peer_key, connection);
                }
                TorrentCmd::PeerDisconnect { peer_key } => {
                    torrent.peers.remove(peer_key);
                }
                TorrentCmd::PeerSend { peer_key, message } => {
                    if let Some(connection) = torrent.peers.get(peer_key) {
                        connection.send(message);
                    }
                }
                TorrentCmd::TrackerConnect {
                    tracker_key,
                    tracker_url,
                } => {
                    let tracker = TrackerProc::spawn(
                        state.sender.clone(),
                        torrent_key,
                        tracker_key,
                        tracker_url,
                    );
                    torrent.trackers.insert(tracker_key, tracker);
                }
                TorrentCmd::TrackerAnnounce {
                    tracker_key,
                    params,
                } => {
                    if let Some(tracker) = torrent.trackers.get(tracker_key) {
                        tracker.announce(&params);
                    }
                }
                TorrentCmd::Completed => {
                    torrent.complete.send_replace(true);
                }
            }
        }
    }
}

///////// TORRENT ///////////////

/// Handle to a torrent running inside a [`Session`].
#[derive(Clone)]
pub struct Torrent {
    sender: SessionSender,
    key: TorrentKey,
    complete: watch::Receiver<bool>,
}

impl Torrent {
    pub fn connect(&self, addr: SocketAddr) {
        self.send(SessionMsg::TorrentConnect {
            torrent_key: self.key,
            address: addr,
        });
    }

    pub async fn view(&self) -> std::io::Result<TorrentView> {
        let (sender, receiver) = oneshot::channel();
        self.send(SessionMsg::TorrentView {
            torrent_key: self.key,
            response: sender,
        });
        receiver.await.map_err(|_| session_closed())
    }

    /// Announce `stopped` and drop every peer. The torrent keeps its view.
    pub fn quit(&self) {
        self.send(SessionMsg::TorrentQuit {
            torrent_key: self.key,
        });
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Resolves once every piece is verified.
    pub async fn wait_complete(&self) -> std::io::Result<()> {
        let mut complete = self.complete.clone();
        complete
            .wait_for(|complete| *complete)
            .await
            .map(|_| ())
            .map_err(|_| session_closed())
    }

    fn send(&self, message: SessionMsg) {
        if self.sender.send(message).is_err() {
            tracing::debug!("torrent handle used after the session stopped");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{PeerId, TorrentCreator, TorrentCreatorConfig, TorrentViewState};

    use super::*;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn create(data: &[u8]) -> TorrentInfo {
        let mut creator = TorrentCreator::new(TorrentCreatorConfig {
            name: Some("data.bin".to_string()),
            piece_length: Some(32 * 1024),
            ..Default::default()
        });
        creator.file("data.bin").push_data(data);
        TorrentInfo::decode(&creator.finish().unwrap()).unwrap()
    }

    async fn listening(id: u8) -> Session {
        Session::new_with(SessionConfig {
            listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            peer_id: Some(PeerId::new([id; 20])),
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn seed_to_leech_over_loopback() {
        let data = content(100 * 1024 + 123);
        let info = create(&data);

        let seed_dir = tempfile::tempdir().unwrap();
        std::fs::write(seed_dir.path().join("data.bin"), &data).unwrap();
        let leech_dir = tempfile::tempdir().unwrap();

        let seed = listening(1).await;
        let seed_torrent = seed
            .torrent_add_with(
                info.clone(),
                TorrentConfig {
                    root: seed_dir.path().to_path_buf(),
                    use_trackers: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(seed_torrent.is_complete());

        let leech = listening(2).await;
        let leech_torrent = leech
            .torrent_add_with(
                info.clone(),
                TorrentConfig {
                    root: leech_dir.path().to_path_buf(),
                    use_trackers: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!leech_torrent.is_complete());

        leech_torrent.connect(seed.listen_addr().unwrap());
        tokio::time::timeout(Duration::from_secs(30), leech_torrent.wait_complete())
            .await
            .expect("download timed out")
            .unwrap();

        let view = leech_torrent.view().await.unwrap();
        assert_eq!(view.state, TorrentViewState::Seeding);
        assert_eq!(view.needed, 0);
        let downloaded = std::fs::read(leech_dir.path().join("data.bin")).unwrap();
        assert_eq!(downloaded, data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_torrent_is_rejected() {
        let data = content(1000);
        let info = create(&data);
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new().await.unwrap();
        let config = TorrentConfig {
            root: dir.path().to_path_buf(),
            use_trackers: false,
            ..Default::default()
        };
        session
            .torrent_add_with(info.clone(), config.clone())
            .await
            .unwrap();
        let error = session
            .torrent_add_with(info, config)
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quit_stops_torrent() {
        let data = content(1000);
        let info = create(&data);
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new().await.unwrap();
        let torrent = session
            .torrent_add_with(
                info,
                TorrentConfig {
                    root: dir.path().to_path_buf(),
                    use_trackers: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            torrent.view().await.unwrap().state,
            TorrentViewState::Downloading
        );
        torrent.quit();
        assert_eq!(torrent.view().await.unwrap().state, TorrentViewState::Stopped);
    }
}
