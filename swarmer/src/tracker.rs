use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

pub mod http;
pub mod registry;
pub mod server;

use crate::{PeerId, Sha1};

/// Announce interval used when the tracker does not tell us otherwise.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How long we wait for a tracker to answer a single request.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    /// Value of the `event` query parameter, `None` for a regular announce.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "empty" => Some(Event::None),
            "started" => Some(Event::Started),
            "completed" => Some(Event::Completed),
            "stopped" => Some(Event::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AnnounceParams {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    /// our own address, for when the tracker would otherwise see a private one
    pub ip: Option<IpAddr>,
    pub num_want: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncePeer {
    /// compact peer lists do not carry ids
    pub id: Option<PeerId>,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct Announce {
    pub interval: u32,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub warning: Option<String>,
    pub peers: Vec<AnnouncePeer>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    /// number of times the torrent was completed
    pub downloaded: u64,
    pub complete: u32,
    pub incomplete: u32,
    pub name: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Scrape {
    pub files: HashMap<Sha1, ScrapeStats>,
}

#[derive(Debug)]
pub enum TrackerClient {
    Http(http::TrackerHttpClient),
}

impl TrackerClient {
    pub fn new(url: &str) -> std::io::Result<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(http::TrackerHttpClient::new(url)?))
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported tracker protocol: {url}"),
            ))
        }
    }

    pub async fn announce(&self, params: &AnnounceParams) -> std::io::Result<Announce> {
        match self {
            Self::Http(client) => client.announce(params).await,
        }
    }

    /// Statistics for the given torrents, or for every torrent the tracker knows if empty.
    pub async fn scrape(&self, info_hashes: &[Sha1]) -> std::io::Result<Scrape> {
        match self {
            Self::Http(client) => client.scrape(info_hashes).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_names() {
        for event in [Event::Started, Event::Completed, Event::Stopped] {
            assert_eq!(Event::parse(event.as_str().unwrap()), Some(event));
        }
        assert_eq!(Event::None.as_str(), None);
        assert_eq!(Event::parse(""), Some(Event::None));
        assert_eq!(Event::parse("paused"), None);
    }

    #[test]
    fn unsupported_protocol() {
        let err = TrackerClient::new("udp://tracker.local:6969").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
