use std::{
    collections::{HashMap, VecDeque},
    time::Instant,
};

use bytes::{Bytes, BytesMut};

use crate::{
    wire, NetworkStatsAccum, PeerId, PeerIdentity, PieceBitfield, PieceIdx, Request, TorrentInfo,
    MAX_REQUEST_LENGTH,
};

use super::coordinator::{CommandQueue, PeerKey, WantedPieces};

/// Most requests we keep outstanding with a single peer.
pub const PIPELINE_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerPhase {
    /// outgoing connection, our handshake goes out first
    HandshakeSent,
    /// incoming connection, we already read the remote handshake
    HandshakeReceived,
    Active,
    Disconnected,
}

/// Things a peer needs the coordinator to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Activated,
    /// the remote peer changed its interest in us
    InterestChanged(bool),
    /// the remote peer queued a request for a piece we have
    ServeRequest { piece: PieceIdx },
    /// every chunk of a piece arrived, it still needs to be verified
    PieceComplete { piece: PieceIdx, data: Bytes },
}

/// The parts of the coordinator a peer reads or updates while handling a message.
pub struct PeerCtx<'a> {
    pub key: PeerKey,
    pub info: &'a TorrentInfo,
    /// pieces we have
    pub bitfield: &'a PieceBitfield,
    pub wanted: &'a mut WantedPieces,
    pub queue: &'a mut CommandQueue,
    pub events: &'a mut Vec<PeerEvent>,
    /// torrent wide transfer totals
    pub network_stats: &'a mut NetworkStatsAccum,
    pub quitting: bool,
}

impl PeerCtx<'_> {
    fn send(&mut self, message: wire::Message) {
        self.queue.send(self.key, message);
    }
}

#[derive(Debug)]
struct PieceBuffer {
    data: BytesMut,
    received: u32,
}

/// Protocol state of one remote peer.
#[derive(Debug)]
pub struct Peer {
    identity: PeerIdentity,
    phase: PeerPhase,
    created: Instant,
    /// are we interested in the peer
    interesting: bool,
    /// are we choking the peer
    choking: bool,
    /// is the peer interested in us
    interested: bool,
    /// is the peer choking us
    choked: bool,
    /// outstanding requests must be sent again once the peer unchokes us
    resend: bool,
    /// absent until the first bitfield or have message
    bitfield: Option<PieceBitfield>,
    bitfield_received: bool,
    outstanding: VecDeque<Request>,
    last_request: Option<Request>,
    buffers: HashMap<PieceIdx, PieceBuffer>,
    remote_requests: VecDeque<Request>,
    stats: NetworkStatsAccum,
}

impl Peer {
    fn new(identity: PeerIdentity, phase: PeerPhase, now: Instant) -> Self {
        Self {
            identity,
            phase,
            created: now,
            interesting: false,
            choking: true,
            interested: false,
            choked: true,
            resend: false,
            bitfield: None,
            bitfield_received: false,
            outstanding: Default::default(),
            last_request: None,
            buffers: Default::default(),
            remote_requests: Default::default(),
            stats: Default::default(),
        }
    }

    pub fn outgoing(identity: PeerIdentity, now: Instant) -> Self {
        Self::new(identity, PeerPhase::HandshakeSent, now)
    }

    pub fn incoming(identity: PeerIdentity, now: Instant) -> Self {
        Self::new(identity, PeerPhase::HandshakeReceived, now)
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn phase(&self) -> PeerPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == PeerPhase::Active
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_interesting(&self) -> bool {
        self.interesting
    }

    pub fn is_choking(&self) -> bool {
        self.choking
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    #[cfg(test)]
    pub fn bitfield(&self) -> Option<&PieceBitfield> {
        self.bitfield.as_ref()
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> impl Iterator<Item = &Request> {
        self.outstanding.iter()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn stats(&self) -> &NetworkStatsAccum {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStatsAccum {
        &mut self.stats
    }

    /// Both handshakes were exchanged: announce our pieces.
    pub fn on_handshake(&mut self, ctx: &mut PeerCtx, peer_id: PeerId) -> std::io::Result<()> {
        if self.phase == PeerPhase::Active || self.phase == PeerPhase::Disconnected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected handshake",
            ));
        }
        self.identity = self.identity.with_id(peer_id);
        self.phase = PeerPhase::Active;
        ctx.send(wire::Message::Bitfield {
            bitfield: Bytes::copy_from_slice(ctx.bitfield.bytes()),
        });
        ctx.events.push(PeerEvent::Activated);
        Ok(())
    }

    pub fn close(&mut self) {
        self.phase = PeerPhase::Disconnected;
        self.outstanding.clear();
        self.buffers.clear();
        self.remote_requests.clear();
    }

    /// Handle a message from the remote peer.
    /// Protocol anomalies are logged and dropped, an error means the connection must be closed.
    pub fn on_message(&mut self, ctx: &mut PeerCtx, message: wire::Message) -> std::io::Result<()> {
        if self.phase != PeerPhase::Active {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message received before handshake",
            ));
        }

        match message {
            wire::Message::KeepAlive => {}
            wire::Message::Choke => self.on_choke(),
            wire::Message::Unchoke => self.on_unchoke(ctx),
            wire::Message::Interested => self.on_interest(ctx, true),
            wire::Message::NotInterested => self.on_interest(ctx, false),
            wire::Message::Have { index } => self.on_have(ctx, index),
            wire::Message::Bitfield { bitfield } => self.on_bitfield(ctx, &bitfield),
            wire::Message::Request {
                index,
                begin,
                length,
            } => self.on_request(ctx, index, begin, length),
            wire::Message::Piece { index, begin, data } => self.on_piece(ctx, index, begin, data),
            wire::Message::Cancel {
                index,
                begin,
                length,
            } => self.on_cancel(index, begin, length),
        }
        Ok(())
    }

    pub fn set_interesting(&mut self, ctx: &mut PeerCtx, interesting: bool) {
        if self.interesting == interesting {
            return;
        }
        self.interesting = interesting;
        if interesting {
            ctx.send(wire::Message::Interested);
            self.add_requests(ctx);
        } else {
            ctx.send(wire::Message::NotInterested);
        }
    }

    pub fn set_choking(&mut self, ctx: &mut PeerCtx, choking: bool) {
        if self.choking == choking {
            return;
        }
        self.choking = choking;
        if choking {
            // a choked peer has to ask again
            self.remote_requests.clear();
            ctx.send(wire::Message::Choke);
        } else {
            ctx.send(wire::Message::Unchoke);
        }
    }

    /// Re-evaluate whether the peer has anything we still want.
    pub fn recheck_interest(&mut self, ctx: &mut PeerCtx) {
        let wanted = match self.bitfield.as_ref() {
            Some(bitfield) => ctx.wanted.any_in(bitfield),
            None => false,
        };
        self.set_interesting(ctx, wanted);
    }

    /// Stop downloading `piece` from this peer, it was obtained elsewhere.
    pub fn cancel_piece(&mut self, ctx: &mut PeerCtx, piece: PieceIdx) {
        if self.buffers.remove(&piece).is_none() {
            return;
        }
        let mut cancelled = Vec::new();
        self.outstanding.retain(|request| {
            if request.piece() == piece {
                cancelled.push(*request);
                false
            } else {
                true
            }
        });
        for request in cancelled {
            ctx.send(request.to_cancel_message());
        }
        if self.last_request.map(|r| r.piece()) == Some(piece) {
            self.last_request = None;
        }
        self.add_requests(ctx);
    }

    /// We verified `piece`: announce it and stop fetching it from this peer.
    pub fn on_piece_verified(&mut self, ctx: &mut PeerCtx, piece: PieceIdx) {
        if !self.is_active() {
            return;
        }
        ctx.send(wire::Message::Have { index: piece });
        self.cancel_piece(ctx, piece);
        self.recheck_interest(ctx);
    }

    /// Answer the queued requests for `piece` with its data.
    /// Returns how many bytes were sent.
    pub fn serve(&mut self, ctx: &mut PeerCtx, piece: PieceIdx, data: &Bytes) -> u64 {
        let mut pending = Vec::new();
        self.remote_requests.retain(|request| {
            if request.piece() == piece {
                pending.push(*request);
                false
            } else {
                true
            }
        });

        let mut uploaded = 0;
        for request in pending {
            if request.end() as usize > data.len() {
                continue;
            }
            ctx.send(wire::Message::Piece {
                index: piece,
                begin: request.begin(),
                data: data.slice(request.range()),
            });
            self.stats.add_upload(request.length());
            uploaded += u64::from(request.length());
        }
        uploaded
    }

    /// Forget queued requests for a piece we could not read.
    pub fn drop_requests_for(&mut self, piece: PieceIdx) {
        self.remote_requests.retain(|request| request.piece() != piece);
    }

    /// Keep the pipeline full: extend the current piece first, then ask for a new one.
    pub fn add_requests(&mut self, ctx: &mut PeerCtx) {
        if !self.interesting || self.choked || self.phase != PeerPhase::Active {
            return;
        }

        while self.outstanding.len() < PIPELINE_DEPTH {
            let request = match self.next_chunk(ctx.info) {
                Some(request) => request,
                None => match self.next_piece(ctx) {
                    Some(request) => request,
                    None => break,
                },
            };
            self.outstanding.push_back(request);
            self.last_request = Some(request);
            ctx.send(request.to_request_message());
        }
    }

    fn next_chunk(&self, info: &TorrentInfo) -> Option<Request> {
        let last = self.last_request?;
        if !self.buffers.contains_key(&last.piece()) {
            return None;
        }
        last.next_chunk(info.piece_length_from_index(last.piece()))
    }

    fn next_piece(&mut self, ctx: &mut PeerCtx) -> Option<Request> {
        if ctx.quitting {
            return None;
        }
        let bitfield = self.bitfield.as_ref()?;
        let buffers = &self.buffers;
        let piece = ctx
            .wanted
            .select(bitfield, |piece| buffers.contains_key(&piece))?;
        let length = ctx.info.piece_length_from_index(piece);
        tracing::trace!(peer = %self.identity, %piece, "requesting new piece");
        self.buffers.insert(
            piece,
            PieceBuffer {
                data: BytesMut::zeroed(length as usize),
                received: 0,
            },
        );
        Request::chunk(piece, 0, length)
    }

    fn on_choke(&mut self) {
        self.choked = true;
        if !self.outstanding.is_empty() {
            self.resend = true;
        }
    }

    fn on_unchoke(&mut self, ctx: &mut PeerCtx) {
        self.choked = false;
        if self.resend {
            self.resend = false;
            for request in self.outstanding.iter() {
                ctx.send(request.to_request_message());
            }
        }
        self.add_requests(ctx);
    }

    fn on_interest(&mut self, ctx: &mut PeerCtx, interested: bool) {
        if self.interested != interested {
            self.interested = interested;
            ctx.events.push(PeerEvent::InterestChanged(interested));
        }
    }

    fn on_have(&mut self, ctx: &mut PeerCtx, piece: PieceIdx) {
        if !ctx.info.piece_index_valid(piece) {
            tracing::debug!(peer = %self.identity, %piece, "have for piece out of range");
            return;
        }
        let bitfield = self
            .bitfield
            .get_or_insert_with(|| PieceBitfield::with_size(ctx.info.pieces_count()));
        if bitfield.set(piece).is_err() {
            return;
        }
        if ctx.wanted.contains(piece) {
            self.set_interesting(ctx, true);
        }
    }

    fn on_bitfield(&mut self, ctx: &mut PeerCtx, bytes: &[u8]) {
        if self.bitfield_received {
            tracing::warn!(peer = %self.identity, "dropping duplicate bitfield");
            return;
        }
        self.bitfield_received = true;

        let mut bitfield = PieceBitfield::from_bytes(bytes, ctx.info.pieces_count());
        // keep pieces announced with have messages before the bitfield
        if let Some(previous) = self.bitfield.take() {
            for piece in previous.pieces() {
                let _ = bitfield.set(piece);
            }
        }
        let wanted = ctx.wanted.any_in(&bitfield);
        self.bitfield = Some(bitfield);
        self.set_interesting(ctx, wanted);
    }

    fn on_request(&mut self, ctx: &mut PeerCtx, piece: PieceIdx, begin: u32, length: u32) {
        if self.choking {
            tracing::debug!(peer = %self.identity, %piece, "request while choked");
            return;
        }
        if length == 0
            || length > MAX_REQUEST_LENGTH
            || !ctx.info.piece_request_valid(piece, begin, length)
        {
            tracing::debug!(peer = %self.identity, %piece, begin, length, "invalid request");
            return;
        }
        if !ctx.bitfield.has_piece(piece) {
            tracing::debug!(peer = %self.identity, %piece, "request for piece we do not have");
            return;
        }

        let request = Request::new(piece, begin, length);
        if !self.remote_requests.contains(&request) {
            self.remote_requests.push_back(request);
            ctx.events.push(PeerEvent::ServeRequest { piece });
        }
    }

    fn on_piece(&mut self, ctx: &mut PeerCtx, piece: PieceIdx, begin: u32, data: Bytes) {
        let position = self.outstanding.iter().position(|request| {
            request.piece() == piece
                && request.begin() == begin
                && request.length() as usize == data.len()
        });
        let Some(position) = position else {
            // might have been cancelled after the peer sent it
            tracing::debug!(peer = %self.identity, %piece, begin, "unrequested chunk");
            return;
        };

        // the peer skipped the requests in front of this one, ask for them again
        for _ in 0..position {
            if let Some(lost) = self.outstanding.pop_front() {
                tracing::debug!(peer = %self.identity, piece = %lost.piece(), begin = lost.begin(), "requeueing lost request");
                self.outstanding.push_back(lost);
                ctx.send(lost.to_request_message());
            }
        }
        let Some(request) = self.outstanding.pop_front() else {
            return;
        };

        self.stats.add_download(request.length());
        ctx.network_stats.add_download(request.length());
        if let Some(buffer) = self.buffers.get_mut(&piece) {
            buffer.data[request.range()].copy_from_slice(&data);
            buffer.received += request.length();
            if buffer.received as usize == buffer.data.len() {
                if let Some(buffer) = self.buffers.remove(&piece) {
                    // claim the piece before refilling so it is not selected again
                    if ctx.wanted.begin_verify(piece, ctx.key) {
                        ctx.events.push(PeerEvent::PieceComplete {
                            piece,
                            data: buffer.data.freeze(),
                        });
                    } else {
                        tracing::debug!(peer = %self.identity, %piece, "piece already being verified");
                    }
                }
            }
        }

        self.add_requests(ctx);
    }

    fn on_cancel(&mut self, piece: PieceIdx, begin: u32, length: u32) {
        tracing::debug!(peer = %self.identity, %piece, begin, length, "peer cancelled request");
        let request = Request::new(piece, begin, length);
        self.remote_requests.retain(|r| r != &request);
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::{session::coordinator::TorrentCmd, Sha1, TorrentInfoParts, CHUNK_LENGTH};

    const PIECE_LENGTH: u32 = 2 * CHUNK_LENGTH;

    fn info(pieces: u32) -> TorrentInfo {
        TorrentInfo::from_parts(TorrentInfoParts {
            name: "test".to_string(),
            piece_length: PIECE_LENGTH,
            pieces: vec![Sha1::default(); pieces as usize],
            files: vec![("test".into(), u64::from(pieces * PIECE_LENGTH))],
            ..Default::default()
        })
        .unwrap()
    }

    struct Harness {
        info: TorrentInfo,
        bitfield: PieceBitfield,
        wanted: WantedPieces,
        queue: CommandQueue,
        events: Vec<PeerEvent>,
        network_stats: NetworkStatsAccum,
        peer: Peer,
    }

    impl Harness {
        fn new(pieces: u32) -> Self {
            let info = info(pieces);
            let bitfield = PieceBitfield::with_size(pieces);
            let wanted = WantedPieces::new(bitfield.missing_pieces());
            let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
            let mut harness = Self {
                info,
                bitfield,
                wanted,
                queue: Default::default(),
                events: Default::default(),
                network_stats: Default::default(),
                peer: Peer::outgoing(PeerIdentity::provisional(addr), Instant::now()),
            };
            harness.with(|peer, ctx| peer.on_handshake(ctx, PeerId::new([1; 20])).unwrap());
            harness.sent();
            harness.events.clear();
            harness
        }

        fn with<R>(&mut self, f: impl FnOnce(&mut Peer, &mut PeerCtx) -> R) -> R {
            let mut ctx = PeerCtx {
                key: PeerKey::default(),
                info: &self.info,
                bitfield: &self.bitfield,
                wanted: &mut self.wanted,
                queue: &mut self.queue,
                events: &mut self.events,
                network_stats: &mut self.network_stats,
                quitting: false,
            };
            f(&mut self.peer, &mut ctx)
        }

        fn recv(&mut self, message: wire::Message) {
            self.with(|peer, ctx| peer.on_message(ctx, message)).unwrap();
        }

        fn sent(&mut self) -> Vec<wire::Message> {
            self.queue
                .drain()
                .filter_map(|cmd| match cmd {
                    TorrentCmd::PeerSend { message, .. } => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    fn request(piece: u32, begin: u32) -> wire::Message {
        wire::Message::Request {
            index: PieceIdx::new(piece),
            begin,
            length: CHUNK_LENGTH,
        }
    }

    fn piece(piece: u32, begin: u32, fill: u8) -> wire::Message {
        wire::Message::Piece {
            index: PieceIdx::new(piece),
            begin,
            data: Bytes::from(vec![fill; CHUNK_LENGTH as usize]),
        }
    }

    fn seed_bitfield(pieces: u32) -> wire::Message {
        wire::Message::Bitfield {
            bitfield: Bytes::from(PieceBitfield::full(pieces).into_vec()),
        }
    }

    #[test]
    fn handshake_sends_bitfield() {
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let mut harness = Harness::new(3);
        harness.peer = Peer::incoming(PeerIdentity::provisional(addr), Instant::now());
        harness.with(|peer, ctx| peer.on_handshake(ctx, PeerId::new([2; 20])).unwrap());
        assert_eq!(
            harness.sent(),
            vec![wire::Message::Bitfield {
                bitfield: Bytes::from_static(&[0])
            }]
        );
        assert_eq!(harness.events, vec![PeerEvent::Activated]);
        assert!(harness.peer.is_active());
        assert_eq!(harness.peer.identity().id(), PeerId::new([2; 20]));
        assert!(harness
            .with(|peer, ctx| peer.on_handshake(ctx, PeerId::new([2; 20])))
            .is_err());
    }

    #[test]
    fn message_before_handshake() {
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let mut harness = Harness::new(3);
        harness.peer = Peer::outgoing(PeerIdentity::provisional(addr), Instant::now());
        assert!(harness
            .with(|peer, ctx| peer.on_message(ctx, wire::Message::Unchoke))
            .is_err());
    }

    #[test]
    fn pipeline_extends_current_piece_first() {
        let mut harness = Harness::new(4);
        harness.recv(seed_bitfield(4));
        assert_eq!(harness.sent(), vec![wire::Message::Interested]);
        harness.recv(wire::Message::Unchoke);
        assert_eq!(
            harness.sent(),
            vec![
                request(0, 0),
                request(0, CHUNK_LENGTH),
                request(1, 0),
                request(1, CHUNK_LENGTH),
                request(2, 0),
            ]
        );
        assert_eq!(harness.peer.outstanding_len(), PIPELINE_DEPTH);
    }

    #[test]
    fn pipeline_depth_is_bounded() {
        let mut harness = Harness::new(8);
        harness.recv(seed_bitfield(8));
        harness.recv(wire::Message::Unchoke);
        harness.sent();
        for _ in 0..3 {
            harness.with(|peer, ctx| peer.add_requests(ctx));
            assert!(harness.peer.outstanding_len() <= PIPELINE_DEPTH);
        }
        harness.recv(piece(0, 0, 1));
        assert_eq!(harness.peer.outstanding_len(), PIPELINE_DEPTH);
        assert_eq!(harness.sent(), vec![request(2, CHUNK_LENGTH)]);
    }

    #[test]
    fn complete_piece_is_delivered() {
        let mut harness = Harness::new(1);
        harness.recv(seed_bitfield(1));
        harness.recv(wire::Message::Unchoke);
        harness.recv(piece(0, 0, 1));
        assert!(harness.events.is_empty());
        harness.recv(piece(0, CHUNK_LENGTH, 2));

        let mut expected = vec![1u8; CHUNK_LENGTH as usize];
        expected.extend(vec![2u8; CHUNK_LENGTH as usize]);
        assert_eq!(
            harness.events,
            vec![PeerEvent::PieceComplete {
                piece: PieceIdx::new(0),
                data: Bytes::from(expected),
            }]
        );
        assert_eq!(harness.peer.outstanding_len(), 0);
        assert_eq!(harness.peer.stats().total_download(), u64::from(PIECE_LENGTH));
        assert_eq!(harness.network_stats.total_download(), u64::from(PIECE_LENGTH));
    }

    #[test]
    fn completed_piece_is_not_requested_again() {
        let mut harness = Harness::new(2);
        harness.recv(seed_bitfield(2));
        harness.recv(wire::Message::Unchoke);
        assert_eq!(
            harness.sent(),
            vec![
                request(0, 0),
                request(0, CHUNK_LENGTH),
                request(1, 0),
                request(1, CHUNK_LENGTH),
            ]
        );
        harness.recv(piece(0, 0, 1));
        harness.recv(piece(0, CHUNK_LENGTH, 1));
        assert!(harness.sent().is_empty());
        assert_eq!(harness.peer.outstanding_len(), 2);
        assert!(harness
            .peer
            .outstanding()
            .all(|request| request.piece() == PieceIdx::new(1)));
    }

    #[test]
    fn piece_claimed_by_another_peer_is_dropped() {
        let mut harness = Harness::new(1);
        let mut other_peers = slotmap::SlotMap::<PeerKey, ()>::with_key();
        let other = other_peers.insert(());
        assert!(harness.wanted.begin_verify(PieceIdx::new(0), other));
        harness.recv(seed_bitfield(1));
        harness.recv(wire::Message::Unchoke);
        // nothing to select while the piece is being verified
        assert_eq!(harness.sent(), vec![wire::Message::Interested]);
        assert_eq!(harness.peer.outstanding_len(), 0);
    }

    #[test]
    fn unrequested_chunk_is_not_counted() {
        let mut harness = Harness::new(2);
        harness.recv(seed_bitfield(2));
        harness.recv(wire::Message::Unchoke);
        harness.recv(piece(1, 7, 1));
        assert_eq!(harness.peer.stats().total_download(), 0);
        assert_eq!(harness.network_stats.total_download(), 0);
    }

    #[test]
    fn skipped_requests_are_requeued() {
        let mut harness = Harness::new(4);
        harness.recv(seed_bitfield(4));
        harness.recv(wire::Message::Unchoke);
        harness.sent();

        harness.recv(piece(1, 0, 1));
        let sent = harness.sent();
        assert_eq!(&sent[..2], &[request(0, 0), request(0, CHUNK_LENGTH)]);
        let outstanding = harness.peer.outstanding().copied().collect::<Vec<_>>();
        assert_eq!(outstanding.len(), PIPELINE_DEPTH);
        assert_eq!(outstanding[0], Request::new(PieceIdx::new(1), CHUNK_LENGTH, CHUNK_LENGTH));
        assert!(outstanding.contains(&Request::new(PieceIdx::new(0), 0, CHUNK_LENGTH)));
    }

    #[test]
    fn unrequested_chunk_is_dropped() {
        let mut harness = Harness::new(2);
        harness.recv(seed_bitfield(2));
        harness.recv(wire::Message::Unchoke);
        harness.sent();
        harness.recv(piece(1, 7, 1));
        assert!(harness.sent().is_empty());
        assert_eq!(harness.peer.outstanding_len(), 4);
    }

    #[test]
    fn choke_then_unchoke_resends() {
        let mut harness = Harness::new(1);
        harness.recv(seed_bitfield(1));
        assert_eq!(harness.sent(), vec![wire::Message::Interested]);
        harness.recv(wire::Message::Unchoke);
        let first = harness.sent();
        harness.recv(wire::Message::Choke);
        assert!(harness.peer.is_choked());
        harness.with(|peer, ctx| peer.add_requests(ctx));
        assert!(harness.sent().is_empty());
        harness.recv(wire::Message::Unchoke);
        assert_eq!(harness.sent(), first);
        assert_eq!(harness.peer.outstanding_len(), 2);
    }

    #[test]
    fn have_out_of_range_is_ignored() {
        let mut harness = Harness::new(2);
        harness.recv(wire::Message::Have {
            index: PieceIdx::new(2),
        });
        assert!(harness.peer.bitfield().is_none());
        harness.recv(wire::Message::Have {
            index: PieceIdx::new(1),
        });
        assert!(harness.peer.bitfield().unwrap().has_piece(PieceIdx::new(1)));
        assert_eq!(harness.sent(), vec![wire::Message::Interested]);
    }

    #[test]
    fn second_bitfield_is_dropped() {
        let mut harness = Harness::new(9);
        harness.recv(wire::Message::Have {
            index: PieceIdx::new(8),
        });
        harness.recv(wire::Message::Bitfield {
            bitfield: Bytes::from_static(&[0b1000_0000, 0]),
        });
        let bitfield = harness.peer.bitfield().unwrap().clone();
        assert_eq!(bitfield.pieces().map(u32::from).collect::<Vec<_>>(), vec![0, 8]);

        harness.recv(seed_bitfield(9));
        assert_eq!(harness.peer.bitfield(), Some(&bitfield));
    }

    #[test]
    fn requests_are_served_only_when_unchoked() {
        let mut harness = Harness::new(2);
        harness.bitfield = PieceBitfield::full(2);
        harness.recv(request(0, 0));
        assert!(harness.events.is_empty());

        harness.with(|peer, ctx| peer.set_choking(ctx, false));
        assert_eq!(harness.sent(), vec![wire::Message::Unchoke]);
        harness.recv(request(0, CHUNK_LENGTH));
        assert_eq!(
            harness.events,
            vec![PeerEvent::ServeRequest {
                piece: PieceIdx::new(0)
            }]
        );

        let data = Bytes::from(vec![5u8; PIECE_LENGTH as usize]);
        let uploaded = harness.with(|peer, ctx| peer.serve(ctx, PieceIdx::new(0), &data));
        assert_eq!(uploaded, u64::from(CHUNK_LENGTH));
        assert_eq!(
            harness.sent(),
            vec![wire::Message::Piece {
                index: PieceIdx::new(0),
                begin: CHUNK_LENGTH,
                data: data.slice(CHUNK_LENGTH as usize..),
            }]
        );
    }

    #[test]
    fn invalid_requests_are_dropped() {
        let mut harness = Harness::new(2);
        harness.bitfield = PieceBitfield::full(2);
        harness.with(|peer, ctx| peer.set_choking(ctx, false));
        harness.sent();

        // past the end of the piece
        harness.recv(wire::Message::Request {
            index: PieceIdx::new(1),
            begin: PIECE_LENGTH,
            length: 1,
        });
        harness.recv(wire::Message::Request {
            index: PieceIdx::new(0),
            begin: 0,
            length: 0,
        });
        harness.recv(wire::Message::Request {
            index: PieceIdx::new(5),
            begin: 0,
            length: 1,
        });
        assert!(harness.events.is_empty());
        assert!(harness.sent().is_empty());
        assert!(harness.peer.is_active());
    }

    #[test]
    fn cancel_piece_sends_cancels() {
        let mut harness = Harness::new(1);
        harness.recv(seed_bitfield(1));
        harness.recv(wire::Message::Unchoke);
        harness.sent();

        harness.with(|peer, ctx| peer.cancel_piece(ctx, PieceIdx::new(0)));
        assert_eq!(
            harness.sent(),
            vec![
                wire::Message::Cancel {
                    index: PieceIdx::new(0),
                    begin: 0,
                    length: CHUNK_LENGTH
                },
                wire::Message::Cancel {
                    index: PieceIdx::new(0),
                    begin: CHUNK_LENGTH,
                    length: CHUNK_LENGTH
                },
                request(0, 0),
                request(0, CHUNK_LENGTH),
            ]
        );
    }

    #[test]
    fn incoming_cancel_removes_queued_upload() {
        let mut harness = Harness::new(1);
        harness.bitfield = PieceBitfield::full(1);
        harness.with(|peer, ctx| peer.set_choking(ctx, false));
        harness.recv(request(0, 0));
        harness.recv(wire::Message::Cancel {
            index: PieceIdx::new(0),
            begin: 0,
            length: CHUNK_LENGTH,
        });
        harness.sent();
        let data = Bytes::from(vec![0u8; PIECE_LENGTH as usize]);
        assert_eq!(
            harness.with(|peer, ctx| peer.serve(ctx, PieceIdx::new(0), &data)),
            0
        );
    }
}
