use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, RawQuery, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_bytes::ByteBuf;

use crate::{bencode, PeerId, PeerIdentity, Sha1};

use super::{
    registry::{resolve_peer_ip, AnnounceRejected, AnnounceRequest, TrackerRegistry},
    Event,
};

type SharedRegistry = Arc<Mutex<TrackerRegistry>>;

#[derive(Serialize)]
struct FailureOut {
    #[serde(rename = "failure reason")]
    reason: String,
}

#[derive(Serialize)]
struct AnnounceOut {
    complete: u32,
    incomplete: u32,
    interval: u64,
    peers: PeersOut,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PeersOut {
    Compact(ByteBuf),
    Full(Vec<PeerOut>),
}

#[derive(Serialize)]
struct PeerOut {
    ip: String,
    #[serde(rename = "peer id")]
    peer_id: ByteBuf,
    port: u16,
}

#[derive(Serialize)]
struct ScrapeOut {
    files: BTreeMap<ByteBuf, ScrapeFileOut>,
}

#[derive(Serialize)]
struct ScrapeFileOut {
    complete: u32,
    downloaded: u64,
    incomplete: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// HTTP tracker serving `/announce` and `/scrape` from a shared registry.
#[derive(Debug, Clone)]
pub struct TrackerServer {
    registry: SharedRegistry,
}

impl TrackerServer {
    pub fn new(registry: TrackerRegistry) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn track(&self, info_hash: Sha1, name: Option<String>) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.track(info_hash, name);
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/announce", get(announce_handler))
            .route("/scrape", get(scrape_handler))
            .with_state(self.registry.clone())
    }

    pub async fn serve(self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("tracker listening on {addr}");
        }
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

async fn announce_handler(
    State(registry): State<SharedRegistry>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = parse_query(query.as_deref().unwrap_or_default());
    let result = parse_announce(&query, remote.ip()).and_then(|(request, compact)| {
        let mut registry = registry
            .lock()
            .map_err(|_| AnnounceRejected("tracker unavailable".to_string()))?;
        let interval = registry.config().interval;
        registry
            .announce(request, Instant::now())
            .map(|reply| (reply, compact, interval))
    });

    match result {
        Ok((reply, compact, interval)) => {
            let peers = if compact {
                let mut buf = Vec::with_capacity(reply.peers.len() * 6);
                for peer in reply.peers.iter() {
                    if let IpAddr::V4(ip) = peer.ip() {
                        buf.extend_from_slice(&ip.octets());
                        buf.extend_from_slice(&peer.port().to_be_bytes());
                    }
                }
                PeersOut::Compact(ByteBuf::from(buf))
            } else {
                PeersOut::Full(
                    reply
                        .peers
                        .iter()
                        .map(|peer| PeerOut {
                            ip: peer.ip().to_string(),
                            peer_id: ByteBuf::from(peer.id().as_bytes().to_vec()),
                            port: peer.port(),
                        })
                        .collect(),
                )
            };
            bencoded(&AnnounceOut {
                complete: reply.complete,
                incomplete: reply.incomplete,
                interval: interval.as_secs(),
                peers,
            })
        }
        Err(rejected) => {
            tracing::debug!(remote = %remote, "announce rejected: {rejected}");
            bencoded(&FailureOut {
                reason: rejected.0,
            })
        }
    }
}

async fn scrape_handler(
    State(registry): State<SharedRegistry>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = parse_query(query.as_deref().unwrap_or_default());
    let mut hashes = Vec::new();
    for (key, value) in query.iter() {
        if key == "info_hash" {
            match Sha1::from_slice(value) {
                Some(hash) => hashes.push(hash),
                None => {
                    return bencoded(&FailureOut {
                        reason: "invalid info_hash".to_string(),
                    })
                }
            }
        }
    }

    let stats = match registry.lock() {
        Ok(mut registry) => registry.scrape(&hashes, Instant::now()),
        Err(_) => {
            return bencoded(&FailureOut {
                reason: "tracker unavailable".to_string(),
            })
        }
    };
    let files = stats
        .into_iter()
        .map(|(hash, stats)| {
            (
                ByteBuf::from(hash.as_bytes().to_vec()),
                ScrapeFileOut {
                    complete: stats.complete,
                    downloaded: stats.downloaded,
                    incomplete: stats.incomplete,
                    name: stats.name,
                },
            )
        })
        .collect();
    bencoded(&ScrapeOut { files })
}

fn bencoded<T: Serialize>(value: &T) -> Response {
    match bencode::encode(value) {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain")], body).into_response(),
        Err(err) => {
            tracing::error!("failed to encode tracker response: {err}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Split a raw query string into percent-decoded pairs, values stay binary.
fn parse_query(query: &str) -> Vec<(String, Vec<u8>)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = String::from_utf8_lossy(&urlencoding::decode_binary(key.as_bytes()))
                .into_owned();
            let value = urlencoding::decode_binary(value.as_bytes()).into_owned();
            (key, value)
        })
        .collect()
}

fn query_value<'a>(query: &'a [(String, Vec<u8>)], key: &str) -> Option<&'a [u8]> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_slice())
}

fn query_str<'a>(query: &'a [(String, Vec<u8>)], key: &str) -> Option<&'a str> {
    query_value(query, key).and_then(|v| std::str::from_utf8(v).ok())
}

fn query_u64(query: &[(String, Vec<u8>)], key: &str) -> Result<Option<u64>, AnnounceRejected> {
    match query_str(query, key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AnnounceRejected(format!("invalid {key}"))),
        None => Ok(None),
    }
}

fn parse_announce(
    query: &[(String, Vec<u8>)],
    observed: IpAddr,
) -> Result<(AnnounceRequest, bool), AnnounceRejected> {
    let missing = |key: &str| AnnounceRejected(format!("missing {key}"));

    let info_hash = query_value(query, "info_hash")
        .ok_or_else(|| missing("info_hash"))
        .and_then(|v| {
            Sha1::from_slice(v).ok_or_else(|| AnnounceRejected("invalid info_hash".to_string()))
        })?;
    let peer_id = query_value(query, "peer_id")
        .ok_or_else(|| missing("peer_id"))
        .and_then(|v| {
            PeerId::from_slice(v).ok_or_else(|| AnnounceRejected("invalid peer_id".to_string()))
        })?;
    let port = query_u64(query, "port")?
        .ok_or_else(|| missing("port"))
        .and_then(|p| u16::try_from(p).map_err(|_| AnnounceRejected("invalid port".to_string())))?;
    let left = query_u64(query, "left")?.ok_or_else(|| missing("left"))?;
    let event = match query_str(query, "event") {
        Some(value) => {
            Event::parse(value).ok_or_else(|| AnnounceRejected(format!("invalid event {value}")))?
        }
        None => Event::None,
    };
    let ip = match query_str(query, "ip") {
        Some(value) => Some(
            value
                .parse::<IpAddr>()
                .map_err(|_| AnnounceRejected("invalid ip".to_string()))?,
        ),
        None => None,
    };
    let ip = resolve_peer_ip(observed, ip)?;
    let compact = query_str(query, "compact") == Some("1");

    let request = AnnounceRequest {
        info_hash,
        identity: PeerIdentity::new(peer_id, SocketAddr::new(ip, port)),
        event,
        uploaded: query_u64(query, "uploaded")?.unwrap_or_default(),
        downloaded: query_u64(query, "downloaded")?.unwrap_or_default(),
        left,
        num_want: query_u64(query, "numwant")?.map(|n| n as usize),
    };
    Ok((request, compact))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracker::{http::TrackerHttpClient, AnnounceParams};

    #[test]
    fn query_parsing() {
        let query = parse_query("info_hash=%01%02abc&event=started&compact=1&flag");
        assert_eq!(query_value(&query, "info_hash"), Some(&b"\x01\x02abc"[..]));
        assert_eq!(query_str(&query, "event"), Some("started"));
        assert_eq!(query_str(&query, "flag"), Some(""));
        assert_eq!(query_value(&query, "missing"), None);
    }

    #[test]
    fn announce_parameters() {
        let hash = "%AA".repeat(20);
        let id = "%BB".repeat(20);
        let query = parse_query(&format!(
            "info_hash={hash}&peer_id={id}&port=7000&left=5&event=completed&downloaded=9"
        ));
        let (request, compact) = parse_announce(&query, "127.0.0.1".parse().unwrap()).unwrap();
        assert!(!compact);
        assert_eq!(request.info_hash, Sha1::from_bytes([0xAA; 20]));
        assert_eq!(request.identity.id(), PeerId::new([0xBB; 20]));
        assert_eq!(request.identity.addr(), "127.0.0.1:7000".parse().unwrap());
        assert_eq!(request.event, Event::Completed);
        assert_eq!(request.left, 5);
        assert_eq!(request.downloaded, 9);

        let query = parse_query(&format!("info_hash={hash}&peer_id={id}&left=5"));
        let err = parse_announce(&query, "127.0.0.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.0, "missing port");
    }

    async fn spawn_server(server: TrackerServer) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        format!("http://{addr}/announce")
    }

    #[tokio::test]
    async fn announce_and_scrape_over_http() {
        let info_hash = Sha1::from_bytes([3; 20]);
        let server = TrackerServer::new(TrackerRegistry::default());
        server.track(info_hash, Some("data".to_string()));
        let url = spawn_server(server).await;
        let client = TrackerHttpClient::new(url).unwrap();

        let first = AnnounceParams {
            info_hash,
            peer_id: PeerId::new([1; 20]),
            port: 7001,
            left: 0,
            event: Event::Started,
            ..Default::default()
        };
        let announce = client.announce(&first).await.unwrap();
        assert!(announce.peers.is_empty());
        assert_eq!(announce.seeders, Some(1));

        let second = AnnounceParams {
            peer_id: PeerId::new([2; 20]),
            port: 7002,
            left: 10,
            ..first.clone()
        };
        let announce = client.announce(&second).await.unwrap();
        assert_eq!(announce.interval, 900);
        assert_eq!(announce.peers.len(), 1);
        assert_eq!(announce.peers[0].addr, "127.0.0.1:7001".parse().unwrap());

        let err = client
            .announce(&AnnounceParams {
                peer_id: PeerId::new([3; 20]),
                event: Event::None,
                ..first.clone()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("peer not started"));

        let scrape = client.scrape(&[info_hash]).await.unwrap();
        let stats = &scrape.files[&info_hash];
        assert_eq!((stats.complete, stats.incomplete), (1, 1));
        assert_eq!(stats.name.as_deref(), Some("data"));

        let scrape = client.scrape(&[]).await.unwrap();
        assert_eq!(scrape.files.len(), 1);
    }
}
