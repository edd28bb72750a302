use std::time::{Duration, Instant};

use crate::session::peer::PeerPhase;

use super::{PeerKey, SessionCoordinator, HANDSHAKE_TIMEOUT, MAX_UPLOADERS};

/// How often upload slots are re-evaluated.
pub const CHOKE_PERIOD: Duration = Duration::from_secs(20);

/// How often transfer statistics are logged.
pub const STATS_PERIOD: Duration = Duration::from_secs(10);

impl SessionCoordinator {
    /// Prune dead peers, free an upload slot when more peers want one than we have,
    /// then hand out free slots again.
    pub fn choke_pass(&mut self, now: Instant) {
        let dead = self
            .peer_order
            .iter()
            .copied()
            .filter(|&key| match self.peers.get(key) {
                Some(peer) => {
                    peer.phase() == PeerPhase::Disconnected
                        || (!peer.is_active()
                            && now.saturating_duration_since(peer.created()) >= HANDSHAKE_TIMEOUT)
                }
                None => true,
            })
            .collect::<Vec<_>>();
        for key in dead {
            match self.peers.get(key) {
                Some(peer) => {
                    tracing::debug!(peer = %peer.identity(), "handshake timed out");
                    self.disconnect_peer(key);
                }
                None => self.peer_order.retain(|&k| k != key),
            }
        }

        let interested = self
            .peers
            .values()
            .filter(|peer| peer.is_active() && peer.is_interested())
            .count();
        let mut uploaders = self.uploaders();
        let mut choked = Vec::new();
        let mut worst: Option<(PeerKey, u64)> = None;

        let keys = self.peer_order.iter().copied().collect::<Vec<_>>();
        for key in keys {
            if uploaders < MAX_UPLOADERS || interested <= MAX_UPLOADERS {
                break;
            }
            let Some(peer) = self.peers.get(key) else {
                continue;
            };
            if !peer.is_active() || peer.is_choking() {
                continue;
            }

            let downloaded = peer.stats().period_download();
            let reason = if !peer.is_interested() {
                Some("not interested")
            } else if peer.is_choked() {
                Some("choking us")
            } else if peer.is_interesting() && downloaded == 0 {
                Some("nothing downloaded")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tracing::debug!(peer = %peer.identity(), reason, "choking peer");
                    self.with_peer(key, |peer, ctx| peer.set_choking(ctx, true));
                    choked.push(key);
                    uploaders -= 1;
                }
                None => {
                    if worst.map_or(true, |(_, least)| downloaded < least) {
                        worst = Some((key, downloaded));
                    }
                }
            }
        }

        if uploaders >= MAX_UPLOADERS && interested > MAX_UPLOADERS {
            if let Some((key, downloaded)) = worst {
                tracing::debug!(downloaded, "choking worst downloader");
                self.with_peer(key, |peer, ctx| peer.set_choking(ctx, true));
                choked.push(key);
            }
        }

        for peer in self.peers.values_mut() {
            peer.stats_mut().reset_period();
        }
        self.network_stats.reset_period();

        self.unchoke_peers_excluding(&choked);
        for key in choked {
            self.rotate_to_back(key);
        }
    }

    pub fn report_stats(&self) {
        let active = self.peers.values().filter(|peer| peer.is_active());
        let (mut peers, mut downloaders, mut interested, mut interesting) = (0, 0, 0, 0);
        let (mut choking, mut choked) = (0, 0);
        for peer in active {
            peers += 1;
            if peer.is_interesting() && !peer.is_choked() {
                downloaders += 1;
            }
            if peer.is_interested() {
                interested += 1;
            }
            if peer.is_interesting() {
                interesting += 1;
            }
            if peer.is_choking() {
                choking += 1;
            }
            if peer.is_choked() {
                choked += 1;
            }
        }

        let stats = self.network_stats.stats();
        let progress = if self.bitfield.is_empty() {
            100.0
        } else {
            100.0 * f64::from(self.bitfield.num_set()) / f64::from(self.bitfield.len())
        };
        tracing::info!(
            name = self.info.name(),
            peers,
            uploaders = self.uploaders(),
            downloaders,
            interested,
            interesting,
            choking,
            choked,
            upload_rate = stats.upload_rate,
            download_rate = stats.download_rate,
            "progress {progress:.1}%"
        );
    }
}
