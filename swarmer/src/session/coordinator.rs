use std::{
    collections::{hash_map::Entry, HashMap, HashSet, VecDeque},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::{Duration, Instant},
};

use bytes::Bytes;
use slotmap::SlotMap;

use crate::{
    tracker::DEFAULT_ANNOUNCE_INTERVAL, wire, Announce, AnnounceParams, Event, NetworkStatsAccum,
    PeerId, PeerIdentity, PieceBitfield, PieceIdx, Sha1, TorrentInfo, TorrentView,
    TorrentViewPeer, TorrentViewState, TorrentViewTracker, TrackerStatus,
};

use super::peer::{Peer, PeerCtx, PeerEvent};

mod choke;
pub use choke::{CHOKE_PERIOD, STATS_PERIOD};

/// Most peers we keep connected per torrent.
pub const MAX_CONNECTIONS: usize = 24;

/// Most peers we upload to at the same time.
pub const MAX_UPLOADERS: usize = 4;

/// Peers that have not finished the handshake after this long are dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive announce failures before a tracker is considered unreachable.
pub const MAX_TRACKER_FAILURES: u32 = 5;

pub const TRACKER_RETRY_DELAY: Duration = Duration::from_secs(15);

slotmap::new_key_type! {
    pub struct PeerKey;
    pub struct TrackerKey;
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// directory the torrent's files live in
    pub root: PathBuf,
    pub use_trackers: bool,
    /// address reported to trackers, for when they would see a private one
    pub announce_ip: Option<IpAddr>,
    /// port reported to trackers, defaults to the session's listen port
    pub port: Option<u16>,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            use_trackers: true,
            announce_ip: None,
            port: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TorrentCmd {
    PieceRead {
        piece_idx: PieceIdx,
    },
    PieceWrite {
        piece_idx: PieceIdx,
        piece_data: Bytes,
    },
    PeerConnect {
        peer_key: PeerKey,
        address: SocketAddr,
    },
    PeerDisconnect {
        peer_key: PeerKey,
    },
    PeerSend {
        peer_key: PeerKey,
        message: wire::Message,
    },
    TrackerConnect {
        tracker_key: TrackerKey,
        tracker_url: String,
    },
    TrackerAnnounce {
        tracker_key: TrackerKey,
        params: AnnounceParams,
    },
    /// every piece is verified, fired once
    Completed,
}

#[derive(Debug, Default, Clone)]
pub struct CommandQueue(VecDeque<TorrentCmd>);

impl CommandQueue {
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = TorrentCmd> + '_ {
        self.0.drain(..)
    }

    pub(crate) fn send(&mut self, peer_key: PeerKey, message: wire::Message) {
        self.push(TorrentCmd::PeerSend { peer_key, message });
    }

    fn read(&mut self, piece_idx: PieceIdx) {
        self.push(TorrentCmd::PieceRead { piece_idx });
    }

    fn write(&mut self, piece_idx: PieceIdx, piece_data: Bytes) {
        self.push(TorrentCmd::PieceWrite {
            piece_idx,
            piece_data,
        });
    }

    fn connect(&mut self, peer_key: PeerKey, address: SocketAddr) {
        self.push(TorrentCmd::PeerConnect { peer_key, address });
    }

    fn disconnect(&mut self, peer_key: PeerKey) {
        self.push(TorrentCmd::PeerDisconnect { peer_key });
    }

    fn announce(&mut self, tracker_key: TrackerKey, params: AnnounceParams) {
        self.push(TorrentCmd::TrackerAnnounce {
            tracker_key,
            params,
        });
    }

    fn tracker_connect(&mut self, tracker_key: TrackerKey, tracker_url: String) {
        self.push(TorrentCmd::TrackerConnect {
            tracker_key,
            tracker_url,
        });
    }

    fn push(&mut self, command: TorrentCmd) {
        self.0.push_back(command);
    }
}

/// Pieces we still need, in selection order.
#[derive(Debug, Default)]
pub struct WantedPieces {
    pieces: VecDeque<PieceIdx>,
    /// pieces handed to storage for verification, with the peer that delivered them
    verifying: HashMap<PieceIdx, PeerKey>,
}

impl WantedPieces {
    pub fn new(pieces: impl IntoIterator<Item = PieceIdx>) -> Self {
        Self {
            pieces: pieces.into_iter().collect(),
            verifying: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn contains(&self, piece: PieceIdx) -> bool {
        self.pieces.contains(&piece)
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        self.pieces.iter().copied()
    }

    /// Does the bitfield have any piece we want.
    pub fn any_in(&self, bitfield: &PieceBitfield) -> bool {
        self.pieces.iter().any(|&piece| bitfield.has_piece(piece))
    }

    /// First wanted piece present in `bitfield`, skipping pieces under verification and
    /// pieces rejected by `exclude`. The selected piece moves to the back of the list.
    pub fn select(
        &mut self,
        bitfield: &PieceBitfield,
        exclude: impl Fn(PieceIdx) -> bool,
    ) -> Option<PieceIdx> {
        let position = self.pieces.iter().position(|&piece| {
            bitfield.has_piece(piece) && !self.verifying.contains_key(&piece) && !exclude(piece)
        })?;
        let piece = self.pieces.remove(position)?;
        self.pieces.push_back(piece);
        Some(piece)
    }

    pub fn remove(&mut self, piece: PieceIdx) -> bool {
        match self.pieces.iter().position(|&p| p == piece) {
            Some(position) => {
                self.pieces.remove(position);
                true
            }
            None => false,
        }
    }

    /// Claim a complete piece for verification, false if another peer already did.
    pub fn begin_verify(&mut self, piece: PieceIdx, source: PeerKey) -> bool {
        match self.verifying.entry(piece) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(source);
                true
            }
        }
    }

    fn end_verify(&mut self, piece: PieceIdx) -> Option<PeerKey> {
        self.verifying.remove(&piece)
    }
}

#[derive(Debug)]
struct TrackerState {
    url: String,
    next_announce: Instant,
    failures: u32,
    status: TrackerStatus,
    /// events of the announces sent and not answered yet, oldest first
    pending: VecDeque<Event>,
    started: bool,
    completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TorrentMode {
    Running,
    Stopped,
    Failed,
}

/// Per torrent state: the connected peers, the pieces we still want and the trackers.
///
/// Nothing in here performs I/O, every side effect is queued as a [`TorrentCmd`].
#[derive(Debug)]
pub struct SessionCoordinator {
    id: PeerId,
    mode: TorrentMode,
    config: TorrentConfig,
    info: TorrentInfo,
    queue: CommandQueue,
    bitfield: PieceBitfield,
    wanted: WantedPieces,
    peers: SlotMap<PeerKey, Peer>,
    /// unchoke order, recently unchoked peers at the back
    peer_order: VecDeque<PeerKey>,
    trackers: SlotMap<TrackerKey, TrackerState>,
    /// pieces we are reading from storage to serve requests
    reads: HashSet<PieceIdx>,
    network_stats: NetworkStatsAccum,
    quitting: bool,
    completion_notified: bool,
    last_choke: Instant,
    last_report: Instant,
}

impl SessionCoordinator {
    /// `bitfield` holds the pieces already verified in storage.
    pub fn new(
        id: PeerId,
        info: TorrentInfo,
        bitfield: PieceBitfield,
        config: TorrentConfig,
        now: Instant,
    ) -> Self {
        let wanted = WantedPieces::new(bitfield.missing_pieces());
        Self {
            id,
            mode: TorrentMode::Running,
            config,
            info,
            queue: Default::default(),
            bitfield,
            wanted,
            peers: Default::default(),
            peer_order: Default::default(),
            trackers: Default::default(),
            reads: Default::default(),
            network_stats: Default::default(),
            quitting: false,
            completion_notified: false,
            last_choke: now,
            last_report: now,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn info_hash(&self) -> Sha1 {
        self.info.info_hash()
    }

    #[cfg(test)]
    pub fn bitfield(&self) -> &PieceBitfield {
        &self.bitfield
    }

    pub fn is_complete(&self) -> bool {
        self.wanted.is_empty()
    }

    #[cfg(test)]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = TorrentCmd> + '_ {
        self.queue.drain()
    }

    pub fn start(&mut self, now: Instant) {
        tracing::info!(
            name = self.info.name(),
            info_hash = %self.info.info_hash(),
            needed = self.wanted.len(),
            "starting torrent"
        );
        if self.config.use_trackers {
            for url in self.info.tracker_urls() {
                self.tracker_add(url, now);
            }
        }
        if self.wanted.is_empty() {
            self.notify_complete();
        }
        self.trackers_announce(now);
    }

    pub fn tick(&mut self, now: Instant) {
        if self.quitting {
            return;
        }
        if now.saturating_duration_since(self.last_choke) >= CHOKE_PERIOD {
            self.last_choke = now;
            self.choke_pass(now);
        }
        if now.saturating_duration_since(self.last_report) >= STATS_PERIOD {
            self.last_report = now;
            self.report_stats();
        }
        self.trackers_announce(now);
    }

    /// Pick a piece for a peer with the given bitfield.
    #[cfg(test)]
    pub fn get_wanted_piece(&mut self, bitfield: &PieceBitfield) -> Option<PieceIdx> {
        if self.quitting {
            return None;
        }
        self.wanted.select(bitfield, |_| false)
    }

    /// Start an outgoing connection.
    pub fn connect(&mut self, address: SocketAddr, now: Instant) -> Option<PeerKey> {
        let identity = PeerIdentity::provisional(address);
        if let Err(reason) = self.admission(&identity) {
            tracing::debug!(peer = %identity, "not connecting: {reason}");
            return None;
        }
        let key = self.peers.insert(Peer::outgoing(identity, now));
        self.peer_order.push_back(key);
        self.queue.connect(key, address);
        tracing::debug!(peer = %identity, "connecting");
        Some(key)
    }

    /// An incoming connection whose handshake was already read.
    pub fn on_peer_accept(
        &mut self,
        peer_id: PeerId,
        address: SocketAddr,
        now: Instant,
    ) -> Option<PeerKey> {
        let identity = PeerIdentity::new(peer_id, address);
        if let Err(reason) = self.admission(&identity) {
            tracing::debug!(peer = %identity, "rejecting incoming peer: {reason}");
            return None;
        }
        let key = self.peers.insert(Peer::incoming(identity, now));
        self.peer_order.push_back(key);
        tracing::info!(peer = %identity, "peer connected");
        // our handshake goes out as soon as the connection is accepted
        if let Some(Err(error)) = self.with_peer(key, |peer, ctx| peer.on_handshake(ctx, peer_id)) {
            tracing::warn!(peer = %identity, "handshake failed: {error}");
            self.disconnect_peer(key);
            return None;
        }
        Some(key)
    }

    pub fn on_peer_handshake(&mut self, peer_key: PeerKey, peer_id: PeerId) {
        let Some(peer) = self.peers.get(peer_key) else {
            return;
        };
        let identity = peer.identity().with_id(peer_id);
        if peer_id == self.id {
            tracing::debug!(peer = %identity, "connected to ourselves");
            self.disconnect_peer(peer_key);
            return;
        }
        let duplicate = self
            .peers
            .iter()
            .any(|(key, other)| key != peer_key && other.identity().id() == peer_id);
        if duplicate {
            tracing::debug!(peer = %identity, "already connected to peer");
            self.disconnect_peer(peer_key);
            return;
        }

        tracing::info!(peer = %identity, "peer connected");
        if let Some(Err(error)) =
            self.with_peer(peer_key, |peer, ctx| peer.on_handshake(ctx, peer_id))
        {
            tracing::warn!(peer = %identity, "handshake failed: {error}");
            self.disconnect_peer(peer_key);
        }
    }

    pub fn on_peer_message(&mut self, peer_key: PeerKey, message: wire::Message) {
        if !self.peers.contains_key(peer_key) {
            return;
        }
        let result = self.with_peer(peer_key, |peer, ctx| {
            let identity = *peer.identity();
            peer.on_message(ctx, message).map_err(|error| (identity, error))
        });
        if let Some(Err((identity, error))) = result {
            tracing::warn!(peer = %identity, "peer protocol error: {error}");
            self.disconnect_peer(peer_key);
        }
    }

    pub fn on_peer_failure(&mut self, peer_key: PeerKey, error: std::io::Error) {
        let Some(peer) = self.peers.get(peer_key) else {
            return;
        };
        tracing::warn!(peer = %peer.identity(), "peer failure: {error}");
        self.disconnect_peer(peer_key);
    }

    pub fn on_piece_read(&mut self, piece: PieceIdx, result: std::io::Result<Option<Bytes>>) {
        self.reads.remove(&piece);
        match result {
            Ok(Some(data)) => {
                let keys = self.peer_order.iter().copied().collect::<Vec<_>>();
                let mut uploaded = 0u64;
                for key in keys {
                    uploaded += self
                        .with_peer(key, |peer, ctx| peer.serve(ctx, piece, &data))
                        .unwrap_or_default();
                }
                if uploaded > 0 {
                    self.network_stats
                        .add_upload(u32::try_from(uploaded).unwrap_or(u32::MAX));
                }
            }
            Ok(None) => {
                tracing::warn!(%piece, "requested piece is missing from storage");
                for peer in self.peers.values_mut() {
                    peer.drop_requests_for(piece);
                }
            }
            Err(error) => self.fail(error),
        }
    }

    /// Result of handing a completed piece to storage.
    /// `Ok(false)` means the data did not match the piece hash.
    pub fn on_piece_write(&mut self, piece: PieceIdx, result: std::io::Result<bool>) {
        let source = self.wanted.end_verify(piece);
        match result {
            Ok(true) => self.piece_verified(piece),
            Ok(false) => {
                tracing::warn!(%piece, "piece failed hash verification");
                if let Some(key) = source {
                    self.disconnect_peer(key);
                }
                self.peers_add_requests();
            }
            Err(error) => self.fail(error),
        }
    }

    pub fn on_tracker_announce(&mut self, tracker_key: TrackerKey, announce: Announce, now: Instant) {
        let Some(tracker) = self.trackers.get_mut(tracker_key) else {
            return;
        };
        let event = tracker.pending.pop_front().unwrap_or_default();
        if event == Event::Stopped {
            return;
        }

        let interval = match announce.interval {
            0 => DEFAULT_ANNOUNCE_INTERVAL,
            interval => Duration::from_secs(u64::from(interval)),
        };
        tracker.failures = 0;
        tracker.next_announce = now + interval;
        tracker.status = TrackerStatus::Ok {
            peers: announce.peers.len(),
        };
        if let Some(warning) = &announce.warning {
            tracing::warn!(tracker = %tracker.url, "tracker warning: {warning}");
        }
        tracing::info!(tracker = %tracker.url, peers = announce.peers.len(), ?event, "announce succeeded");

        for peer in announce.peers {
            if peer.id == Some(self.id) {
                continue;
            }
            if self.peers.len() >= MAX_CONNECTIONS {
                break;
            }
            self.connect(peer.addr, now);
        }
    }

    pub fn on_tracker_error(&mut self, tracker_key: TrackerKey, error: std::io::Error, now: Instant) {
        let Some(tracker) = self.trackers.get_mut(tracker_key) else {
            return;
        };
        let event = tracker.pending.pop_front().unwrap_or_default();
        match event {
            Event::Stopped => {
                tracing::debug!(tracker = %tracker.url, "stopped announce failed: {error}");
                return;
            }
            // try the event again on the next announce
            Event::Started => tracker.started = false,
            Event::Completed => tracker.completed = false,
            Event::None => {}
        }

        tracker.failures += 1;
        if tracker.failures >= MAX_TRACKER_FAILURES {
            tracing::error!(tracker = %tracker.url, failures = tracker.failures, "tracker unreachable: {error}");
            tracker.status = TrackerStatus::Unreachable;
        } else {
            tracing::warn!(tracker = %tracker.url, failures = tracker.failures, "announce failed: {error}");
            tracker.status = TrackerStatus::Error(error.to_string());
            tracker.next_announce = now + TRACKER_RETRY_DELAY;
        }
    }

    /// Unchoke interested peers until every upload slot is taken,
    /// peers that are not choking us go first.
    pub fn unchoke_peers(&mut self) {
        self.unchoke_peers_excluding(&[]);
    }

    fn unchoke_peers_excluding(&mut self, skip: &[PeerKey]) {
        if self.quitting {
            return;
        }
        let mut uploaders = self.uploaders();
        if uploaders >= MAX_UPLOADERS {
            return;
        }

        let mut candidates = VecDeque::new();
        for &key in self.peer_order.iter() {
            let Some(peer) = self.peers.get(key) else {
                continue;
            };
            if skip.contains(&key) {
                continue;
            }
            if peer.is_active() && peer.is_choking() && peer.is_interested() {
                if peer.is_choked() {
                    candidates.push_back(key);
                } else {
                    candidates.push_front(key);
                }
            }
        }

        while uploaders < MAX_UPLOADERS {
            let Some(key) = candidates.pop_front() else {
                break;
            };
            self.with_peer(key, |peer, ctx| peer.set_choking(ctx, false));
            self.rotate_to_back(key);
            uploaders += 1;
        }
    }

    pub fn disconnect_peer(&mut self, peer_key: PeerKey) {
        let Some(mut peer) = self.peers.remove(peer_key) else {
            return;
        };
        peer.close();
        self.peer_order.retain(|&key| key != peer_key);
        self.queue.disconnect(peer_key);
        tracing::info!(peer = %peer.identity(), "peer disconnected");
        self.unchoke_peers();
    }

    /// Stop the torrent: tell the trackers and drop every peer.
    pub fn quit(&mut self) {
        if self.quitting {
            return;
        }
        tracing::info!(name = self.info.name(), "stopping torrent");
        self.quitting = true;
        if self.mode == TorrentMode::Running {
            self.mode = TorrentMode::Stopped;
        }

        let trackers = self
            .trackers
            .iter()
            .filter(|(_, t)| t.started && t.status != TrackerStatus::Unreachable)
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in trackers {
            self.trackers[key].pending.push_back(Event::Stopped);
            let params = self.announce_params(Event::Stopped);
            self.queue.announce(key, params);
        }

        let keys = self.peers.keys().collect::<Vec<_>>();
        for key in keys {
            self.disconnect_peer(key);
        }
    }

    pub fn view(&self) -> TorrentView {
        let peers = self
            .peer_order
            .iter()
            .filter_map(|&key| self.peers.get(key))
            .map(|peer| TorrentViewPeer {
                id: peer.identity().id(),
                addr: peer.identity().addr(),
                active: peer.is_active(),
                choking: peer.is_choking(),
                choked: peer.is_choked(),
                interested: peer.is_interested(),
                interesting: peer.is_interesting(),
                outstanding: peer.outstanding_len(),
                upload_rate: peer.stats().upload_rate(),
                download_rate: peer.stats().download_rate(),
            })
            .collect();

        let trackers = self
            .trackers
            .values()
            .map(|tracker| TorrentViewTracker {
                url: tracker.url.clone(),
                status: tracker.status.clone(),
                failures: tracker.failures,
            })
            .collect();

        let progress = if self.bitfield.is_empty() {
            1.0
        } else {
            f64::from(self.bitfield.num_set()) / f64::from(self.bitfield.len())
        };

        TorrentView {
            info: self.info.clone(),
            peers,
            trackers,
            progress,
            needed: self.wanted.len() as u32,
            stats: self.network_stats.stats(),
            state: match self.mode {
                TorrentMode::Failed => TorrentViewState::Failed,
                TorrentMode::Stopped => TorrentViewState::Stopped,
                TorrentMode::Running if self.wanted.is_empty() => TorrentViewState::Seeding,
                TorrentMode::Running => TorrentViewState::Downloading,
            },
        }
    }
}

impl SessionCoordinator {
    fn with_peer<R>(
        &mut self,
        peer_key: PeerKey,
        f: impl FnOnce(&mut Peer, &mut PeerCtx) -> R,
    ) -> Option<R> {
        let peer = self.peers.get_mut(peer_key)?;
        let mut events = Vec::new();
        let result = {
            let mut ctx = PeerCtx {
                key: peer_key,
                info: &self.info,
                bitfield: &self.bitfield,
                wanted: &mut self.wanted,
                queue: &mut self.queue,
                events: &mut events,
                network_stats: &mut self.network_stats,
                quitting: self.quitting,
            };
            f(peer, &mut ctx)
        };
        self.process_peer_events(peer_key, events);
        Some(result)
    }

    fn process_peer_events(&mut self, peer_key: PeerKey, events: Vec<PeerEvent>) {
        for event in events {
            match event {
                PeerEvent::Activated => self.unchoke_peers(),
                PeerEvent::InterestChanged(true) => self.unchoke_peers(),
                PeerEvent::InterestChanged(false) => {}
                PeerEvent::ServeRequest { piece } => {
                    if self.reads.insert(piece) {
                        self.queue.read(piece);
                    }
                }
                PeerEvent::PieceComplete { piece, data } => {
                    self.on_piece_complete(peer_key, piece, data)
                }
            }
        }
    }

    fn admission(&self, identity: &PeerIdentity) -> Result<(), &'static str> {
        if self.quitting {
            Err("torrent is stopping")
        } else if self.peers.len() >= MAX_CONNECTIONS {
            Err("connection limit reached")
        } else if identity.id() == self.id {
            Err("peer has our own id")
        } else if self.peers.values().any(|peer| peer.identity() == identity) {
            Err("already connected")
        } else {
            Ok(())
        }
    }

    fn uploaders(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.is_active() && !peer.is_choking())
            .count()
    }

    fn rotate_to_back(&mut self, peer_key: PeerKey) {
        if let Some(position) = self.peer_order.iter().position(|&key| key == peer_key) {
            self.peer_order.remove(position);
            self.peer_order.push_back(peer_key);
        }
    }

    fn peers_add_requests(&mut self) {
        let keys = self.peer_order.iter().copied().collect::<Vec<_>>();
        for key in keys {
            self.with_peer(key, |peer, ctx| {
                peer.recheck_interest(ctx);
                peer.add_requests(ctx);
            });
        }
    }

    fn on_piece_complete(&mut self, peer_key: PeerKey, piece: PieceIdx, data: Bytes) {
        // the peer claimed the piece for verification when the last chunk arrived
        if self.quitting || !self.wanted.contains(piece) {
            tracing::debug!(%piece, "discarding complete piece");
            self.wanted.end_verify(piece);
            return;
        }
        tracing::trace!(%piece, source = ?peer_key, "verifying piece");
        self.queue.write(piece, data);
    }

    fn piece_verified(&mut self, piece: PieceIdx) {
        if !self.wanted.remove(piece) || self.bitfield.set(piece).is_err() {
            return;
        }
        tracing::debug!(%piece, remaining = self.wanted.len(), "piece verified");

        let keys = self.peer_order.iter().copied().collect::<Vec<_>>();
        for key in keys {
            self.with_peer(key, |peer, ctx| peer.on_piece_verified(ctx, piece));
        }

        if self.wanted.is_empty() {
            self.notify_complete();
            let now = Instant::now();
            let trackers = self
                .trackers
                .iter()
                .filter(|(_, t)| t.status != TrackerStatus::Unreachable)
                .map(|(key, _)| key)
                .collect::<Vec<_>>();
            for key in trackers {
                self.tracker_announce(key, now);
            }
        }
    }

    fn notify_complete(&mut self) {
        if self.completion_notified {
            return;
        }
        self.completion_notified = true;
        tracing::info!(name = self.info.name(), "torrent complete");
        self.queue.push(TorrentCmd::Completed);
    }

    fn fail(&mut self, error: std::io::Error) {
        tracing::error!(name = self.info.name(), "storage failure: {error}");
        self.mode = TorrentMode::Failed;
        self.quit();
    }

    fn bytes_left(&self) -> u64 {
        self.wanted
            .iter()
            .map(|piece| u64::from(self.info.piece_length_from_index(piece)))
            .sum()
    }

    fn announce_params(&self, event: Event) -> AnnounceParams {
        AnnounceParams {
            info_hash: self.info.info_hash(),
            peer_id: self.id,
            port: self.config.port.unwrap_or_default(),
            uploaded: self.network_stats.total_upload(),
            downloaded: self.network_stats.total_download(),
            left: self.bytes_left(),
            event,
            ip: self.config.announce_ip,
            num_want: None,
        }
    }

    fn tracker_add(&mut self, url: String, now: Instant) {
        if self.trackers.values().any(|t| t.url == url) {
            tracing::warn!("tracker with url {url} already exists");
            return;
        }
        tracing::info!("adding tracker {url}");
        let key = self.trackers.insert(TrackerState {
            url: url.clone(),
            next_announce: now,
            failures: 0,
            status: TrackerStatus::Pending,
            pending: Default::default(),
            started: false,
            // a torrent that starts complete never announces completion
            completed: self.wanted.is_empty(),
        });
        self.queue.tracker_connect(key, url);
    }

    fn trackers_announce(&mut self, now: Instant) {
        if self.quitting {
            return;
        }
        let due = self
            .trackers
            .iter()
            .filter(|(_, t)| {
                t.status != TrackerStatus::Unreachable
                    && t.pending.is_empty()
                    && t.next_announce <= now
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in due {
            self.tracker_announce(key, now);
        }
    }

    fn tracker_announce(&mut self, tracker_key: TrackerKey, now: Instant) {
        let complete = self.wanted.is_empty();
        let Some(tracker) = self.trackers.get_mut(tracker_key) else {
            return;
        };
        let event = if !tracker.started {
            tracker.started = true;
            Event::Started
        } else if complete && !tracker.completed {
            tracker.completed = true;
            Event::Completed
        } else {
            Event::None
        };
        tracker.pending.push_back(event);
        // replaced by the interval the tracker answers with
        tracker.next_announce = now + DEFAULT_ANNOUNCE_INTERVAL;
        let params = self.announce_params(event);
        self.queue.announce(tracker_key, params);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{AnnouncePeer, Storage, TorrentInfoParts, CHUNK_LENGTH};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn info(pieces: u32, announce: &str) -> TorrentInfo {
        TorrentInfo::from_parts(TorrentInfoParts {
            announce: announce.to_string(),
            name: "test".to_string(),
            piece_length: CHUNK_LENGTH,
            pieces: vec![Sha1::default(); pieces as usize],
            files: vec![("test".into(), u64::from(pieces * CHUNK_LENGTH))],
            ..Default::default()
        })
        .unwrap()
    }

    fn no_trackers() -> TorrentConfig {
        TorrentConfig {
            use_trackers: false,
            ..Default::default()
        }
    }

    fn coordinator(pieces: u32, complete: bool) -> SessionCoordinator {
        let bitfield = if complete {
            PieceBitfield::full(pieces)
        } else {
            PieceBitfield::with_size(pieces)
        };
        SessionCoordinator::new(
            PeerId::new([0xEE; 20]),
            info(pieces, ""),
            bitfield,
            no_trackers(),
            Instant::now(),
        )
    }

    fn remote(n: u8) -> (PeerId, SocketAddr) {
        (
            PeerId::new([n; 20]),
            SocketAddr::new([10, 0, 0, n].into(), 6881),
        )
    }

    fn sent_to(commands: &[TorrentCmd], key: PeerKey) -> Vec<wire::Message> {
        commands
            .iter()
            .filter_map(|cmd| match cmd {
                TorrentCmd::PeerSend { peer_key, message } if *peer_key == key => {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wanted_piece_rotates() {
        let mut coordinator = coordinator(4, false);
        let mut bitfield = PieceBitfield::with_size(4);
        bitfield.set(PieceIdx::new(1)).unwrap();
        bitfield.set(PieceIdx::new(3)).unwrap();

        let picks = (0..4)
            .map(|_| coordinator.get_wanted_piece(&bitfield).map(u32::from))
            .collect::<Vec<_>>();
        assert_eq!(picks, vec![Some(1), Some(3), Some(1), Some(3)]);
        assert_eq!(
            coordinator.get_wanted_piece(&PieceBitfield::with_size(4)),
            None
        );

        coordinator.quit();
        assert_eq!(coordinator.get_wanted_piece(&bitfield), None);
    }

    #[test]
    fn wanted_piece_is_in_bitfield() {
        let mut coordinator = coordinator(16, false);
        for mask in [0b1u32, 0b1010_0000_0000_0000, 0xFFFF, 0b0100_0010_0001_0000] {
            let mut bitfield = PieceBitfield::with_size(16);
            for i in 0..16 {
                if mask & (1 << i) != 0 {
                    bitfield.set(PieceIdx::new(i)).unwrap();
                }
            }
            for _ in 0..20 {
                if let Some(piece) = coordinator.get_wanted_piece(&bitfield) {
                    assert!(bitfield.has_piece(piece));
                }
            }
        }
    }

    #[test]
    fn admission() {
        let mut coordinator = coordinator(1, true);
        let (id, address) = remote(1);

        assert!(coordinator
            .on_peer_accept(coordinator.id(), address, Instant::now())
            .is_none());
        assert!(coordinator.on_peer_accept(id, address, Instant::now()).is_some());
        // same id from a different port
        assert!(coordinator
            .on_peer_accept(id, addr("10.0.0.1:7000"), Instant::now())
            .is_none());
        // already connected to that address
        assert!(coordinator.connect(address, Instant::now()).is_none());

        for n in 2..=MAX_CONNECTIONS as u8 {
            let (id, address) = remote(n);
            assert!(coordinator.on_peer_accept(id, address, Instant::now()).is_some());
        }
        assert_eq!(coordinator.peer_count(), MAX_CONNECTIONS);
        assert!(coordinator.connect(addr("10.0.1.1:6881"), Instant::now()).is_none());

        coordinator.quit();
        assert_eq!(coordinator.peer_count(), 0);
        assert!(coordinator.connect(addr("10.0.1.1:6881"), Instant::now()).is_none());
    }

    #[test]
    fn handshake_with_own_id_disconnects() {
        let mut coordinator = coordinator(1, false);
        let key = coordinator
            .connect(addr("10.0.0.1:6881"), Instant::now())
            .unwrap();
        coordinator.on_peer_handshake(key, coordinator.id());
        assert_eq!(coordinator.peer_count(), 0);
        let commands = coordinator.drain().collect::<Vec<_>>();
        assert!(matches!(
            commands.last(),
            Some(TorrentCmd::PeerDisconnect { peer_key }) if *peer_key == key
        ));
    }

    #[test]
    fn never_more_than_max_uploaders() {
        let mut coordinator = coordinator(4, true);
        let keys = (1..=10)
            .map(|n| {
                let (id, address) = remote(n);
                coordinator.on_peer_accept(id, address, Instant::now()).unwrap()
            })
            .collect::<Vec<_>>();

        for _ in 0..3 {
            for &key in keys.iter() {
                coordinator.on_peer_message(key, wire::Message::Interested);
                assert!(coordinator.uploaders() <= MAX_UPLOADERS);
                coordinator.on_peer_message(key, wire::Message::NotInterested);
                assert!(coordinator.uploaders() <= MAX_UPLOADERS);
                coordinator.on_peer_message(key, wire::Message::Interested);
                assert!(coordinator.uploaders() <= MAX_UPLOADERS);
            }
        }
        assert_eq!(coordinator.uploaders(), MAX_UPLOADERS);
    }

    #[test]
    fn unchoke_prefers_peers_not_choking_us() {
        let mut coordinator = coordinator(2, false);
        let keys = (1..=6)
            .map(|n| {
                let (id, address) = remote(n);
                coordinator.on_peer_accept(id, address, Instant::now()).unwrap()
            })
            .collect::<Vec<_>>();
        // the last peer unchokes us before anybody shows interest
        coordinator.on_peer_message(keys[5], wire::Message::Unchoke);
        coordinator.quitting = true;
        for &key in keys.iter() {
            coordinator.on_peer_message(key, wire::Message::Interested);
        }
        coordinator.quitting = false;
        coordinator.unchoke_peers();

        let unchoked = keys
            .iter()
            .filter(|&&key| !coordinator.peers[key].is_choking())
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(unchoked.len(), MAX_UPLOADERS);
        assert_eq!(unchoked, vec![keys[0], keys[1], keys[2], keys[5]]);
        // unchoked peers rotate to the back, in unchoke order
        assert_eq!(coordinator.peer_order.back(), Some(&keys[2]));
    }

    #[test]
    fn hash_mismatch_disconnects_source() {
        let mut coordinator = coordinator(2, false);
        let (id, address) = remote(1);
        let key = coordinator.on_peer_accept(id, address, Instant::now()).unwrap();
        coordinator.on_peer_message(
            key,
            wire::Message::Bitfield {
                bitfield: Bytes::from_static(&[0b1100_0000]),
            },
        );
        coordinator.on_peer_message(key, wire::Message::Unchoke);
        coordinator.drain().for_each(drop);

        coordinator.on_peer_message(
            key,
            wire::Message::Piece {
                index: PieceIdx::new(0),
                begin: 0,
                data: Bytes::from(vec![0u8; CHUNK_LENGTH as usize]),
            },
        );
        let commands = coordinator.drain().collect::<Vec<_>>();
        assert!(commands.iter().any(|cmd| matches!(
            cmd,
            TorrentCmd::PieceWrite { piece_idx, .. } if *piece_idx == PieceIdx::new(0)
        )));

        // a second delivery while verifying is discarded
        coordinator.on_piece_complete(key, PieceIdx::new(0), Bytes::new());
        assert_eq!(coordinator.drain().count(), 0);

        coordinator.on_piece_write(PieceIdx::new(0), Ok(false));
        assert_eq!(coordinator.peer_count(), 0);
        assert!(coordinator.wanted.contains(PieceIdx::new(0)));
        assert!(!coordinator.bitfield().has_piece(PieceIdx::new(0)));
    }

    #[test]
    fn storage_failure_is_fatal() {
        let mut coordinator = coordinator(1, false);
        let (id, address) = remote(1);
        coordinator.on_peer_accept(id, address, Instant::now()).unwrap();
        coordinator.on_piece_write(PieceIdx::new(0), Err(std::io::Error::other("disk full")));
        assert_eq!(coordinator.peer_count(), 0);
        assert_eq!(coordinator.view().state, TorrentViewState::Failed);
    }

    #[test]
    fn tracker_schedule() {
        let now = Instant::now();
        let mut coordinator = SessionCoordinator::new(
            PeerId::new([0xEE; 20]),
            info(1, "http://tracker.local/announce"),
            PieceBitfield::with_size(1),
            TorrentConfig {
                port: Some(6881),
                ..Default::default()
            },
            now,
        );
        coordinator.start(now);
        let commands = coordinator.drain().collect::<Vec<_>>();
        let tracker_key = match &commands[0] {
            TorrentCmd::TrackerConnect {
                tracker_key,
                tracker_url,
            } => {
                assert_eq!(tracker_url, "http://tracker.local/announce");
                *tracker_key
            }
            other => panic!("unexpected command {other:?}"),
        };
        match &commands[1] {
            TorrentCmd::TrackerAnnounce { params, .. } => {
                assert_eq!(params.event, Event::Started);
                assert_eq!(params.port, 6881);
                assert_eq!(params.left, u64::from(CHUNK_LENGTH));
            }
            other => panic!("unexpected command {other:?}"),
        }

        // nothing new while the announce is in flight
        coordinator.tick(now + Duration::from_secs(60));
        assert_eq!(coordinator.drain().count(), 0);

        coordinator.on_tracker_announce(
            tracker_key,
            Announce {
                interval: 60,
                seeders: None,
                leechers: None,
                warning: None,
                peers: vec![
                    AnnouncePeer {
                        id: Some(coordinator.id()),
                        addr: addr("10.0.0.100:6881"),
                    },
                    AnnouncePeer {
                        id: None,
                        addr: addr("10.0.0.1:6881"),
                    },
                ],
            },
            now,
        );
        let commands = coordinator.drain().collect::<Vec<_>>();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0],
            TorrentCmd::PeerConnect { address, .. } if address == addr("10.0.0.1:6881")
        ));

        coordinator.tick(now + Duration::from_secs(61));
        let commands = coordinator.drain().collect::<Vec<_>>();
        assert!(matches!(
            &commands[..],
            [TorrentCmd::TrackerAnnounce { params, .. }] if params.event == Event::None
        ));
    }

    #[test]
    fn tracker_becomes_unreachable() {
        let now = Instant::now();
        let mut coordinator = SessionCoordinator::new(
            PeerId::new([0xEE; 20]),
            info(1, "http://tracker.local/announce"),
            PieceBitfield::with_size(1),
            Default::default(),
            now,
        );
        coordinator.start(now);
        let tracker_key = coordinator.trackers.keys().next().unwrap();
        coordinator.drain().for_each(drop);

        let mut time = now;
        for attempt in 1..=MAX_TRACKER_FAILURES {
            coordinator.on_tracker_error(tracker_key, std::io::Error::other("refused"), time);
            time += TRACKER_RETRY_DELAY;
            coordinator.tick(time);
            let commands = coordinator.drain().collect::<Vec<_>>();
            if attempt < MAX_TRACKER_FAILURES {
                // the started event is retried
                assert!(matches!(
                    &commands[..],
                    [TorrentCmd::TrackerAnnounce { params, .. }] if params.event == Event::Started
                ));
            } else {
                assert!(commands.is_empty());
            }
        }
        let view = coordinator.view();
        assert_eq!(view.trackers[0].status, TrackerStatus::Unreachable);
        assert_eq!(view.trackers[0].failures, MAX_TRACKER_FAILURES);
    }

    #[test]
    fn complete_at_start_never_announces_completed() {
        let now = Instant::now();
        let mut coordinator = SessionCoordinator::new(
            PeerId::new([0xEE; 20]),
            info(1, "http://tracker.local/announce"),
            PieceBitfield::full(1),
            Default::default(),
            now,
        );
        coordinator.start(now);
        let commands = coordinator.drain().collect::<Vec<_>>();
        assert!(commands.iter().any(|c| matches!(c, TorrentCmd::Completed)));
        let events = commands
            .iter()
            .filter_map(|c| match c {
                TorrentCmd::TrackerAnnounce { params, .. } => Some(params.event),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(events, vec![Event::Started]);

        coordinator.quit();
        let events = coordinator
            .drain()
            .filter_map(|c| match c {
                TorrentCmd::TrackerAnnounce { params, .. } => Some(params.event),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(events, vec![Event::Stopped]);
    }

    struct Node {
        coordinator: SessionCoordinator,
        storage: Storage,
        address: SocketAddr,
        log: Vec<TorrentCmd>,
        _dir: tempfile::TempDir,
    }

    impl Node {
        fn new(info: &TorrentInfo, content: Option<&[u8]>, n: u8) -> Self {
            let dir = tempfile::tempdir().unwrap();
            if let Some(content) = content {
                std::fs::write(dir.path().join(info.name()), content).unwrap();
            }
            let storage = Storage::open(info.clone(), dir.path()).unwrap();
            let mut coordinator = SessionCoordinator::new(
                PeerId::new([n; 20]),
                info.clone(),
                storage.bitfield().unwrap(),
                no_trackers(),
                Instant::now(),
            );
            coordinator.start(Instant::now());
            Self {
                coordinator,
                storage,
                address: SocketAddr::new([127, 0, 0, n].into(), 6881),
                log: Vec::new(),
                _dir: dir,
            }
        }

        /// Run local commands, forwarding messages for `local` to `remote` on `other`.
        /// Everything but storage commands ends up in the log.
        fn step(&mut self, local: PeerKey, other: &mut Node, remote: PeerKey) -> bool {
            let commands = self.coordinator.drain().collect::<Vec<_>>();
            let progress = !commands.is_empty();
            for command in commands {
                match command {
                    TorrentCmd::PeerSend { peer_key, message } if peer_key == local => {
                        other.coordinator.on_peer_message(remote, message.clone());
                        self.log.push(TorrentCmd::PeerSend { peer_key, message });
                    }
                    TorrentCmd::PieceRead { piece_idx } => {
                        let result = self.storage.get_piece(piece_idx);
                        self.coordinator.on_piece_read(piece_idx, result);
                    }
                    TorrentCmd::PieceWrite {
                        piece_idx,
                        piece_data,
                    } => {
                        let result = self.storage.put_piece(piece_idx, &piece_data);
                        self.coordinator.on_piece_write(piece_idx, result);
                    }
                    command => self.log.push(command),
                }
            }
            progress
        }
    }

    #[test]
    fn seed_to_leech_exchange() {
        let content = (0..CHUNK_LENGTH).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let info = TorrentInfo::from_parts(TorrentInfoParts {
            name: "single".to_string(),
            piece_length: CHUNK_LENGTH,
            pieces: vec![Sha1::hash(&content)],
            files: vec![("single".into(), u64::from(CHUNK_LENGTH))],
            ..Default::default()
        })
        .unwrap();

        let mut seed = Node::new(&info, Some(&content), 1);
        let mut leech = Node::new(&info, None, 2);
        assert!(seed.coordinator.is_complete());
        assert_eq!(leech.storage.needed_piece_count().unwrap(), 1);

        // a bystander connected to the leech
        let (bystander_id, bystander_addr) = remote(9);
        let bystander = leech
            .coordinator
            .on_peer_accept(bystander_id, bystander_addr, Instant::now())
            .unwrap();

        let leech_side = leech
            .coordinator
            .connect(seed.address, Instant::now())
            .unwrap();
        let seed_side = seed
            .coordinator
            .on_peer_accept(leech.coordinator.id(), leech.address, Instant::now())
            .unwrap();
        leech
            .coordinator
            .on_peer_handshake(leech_side, seed.coordinator.id());

        for _ in 0..32 {
            let a = seed.step(seed_side, &mut leech, leech_side);
            let b = leech.step(leech_side, &mut seed, seed_side);
            if !a && !b {
                break;
            }
        }

        assert_eq!(leech.storage.needed_piece_count().unwrap(), 0);
        assert!(leech.coordinator.bitfield().has_piece(PieceIdx::new(0)));
        assert_eq!(
            leech.storage.get_piece(PieceIdx::new(0)).unwrap().as_deref(),
            Some(content.as_slice())
        );
        assert!(leech.log.iter().any(|c| matches!(c, TorrentCmd::Completed)));
        assert!(sent_to(&leech.log, bystander).contains(&wire::Message::Have {
            index: PieceIdx::new(0)
        }));

        let view = leech.coordinator.view();
        assert_eq!(view.state, TorrentViewState::Seeding);
        assert_eq!(view.needed, 0);
        assert_eq!(view.stats.download, u64::from(CHUNK_LENGTH));
        assert_eq!(seed.coordinator.view().stats.upload, u64::from(CHUNK_LENGTH));
        let requests = sent_to(&leech.log, leech_side)
            .into_iter()
            .filter(|message| matches!(message, wire::Message::Request { .. }))
            .count();
        assert_eq!(requests, 1);
    }
}
