use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{
    bencode::{self, Dict, Value},
    PeerId, Sha1,
};

use super::{Announce, AnnounceParams, AnnouncePeer, Scrape, ScrapeStats, ANNOUNCE_TIMEOUT};

const DEFAULT_NUM_WANT: u32 = 50;

#[derive(Debug)]
pub struct TrackerHttpClient {
    announce_url: String,
    client: reqwest::Client,
}

impl TrackerHttpClient {
    pub fn new(announce_url: impl Into<String>) -> std::io::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(std::io::Error::other)?;
        Ok(Self {
            announce_url: announce_url.into(),
            client,
        })
    }

    pub async fn announce(&self, params: &AnnounceParams) -> std::io::Result<Announce> {
        let response = self.get(&announce_url(&self.announce_url, params)).await?;
        decode_announce(&response)
    }

    pub async fn scrape(&self, info_hashes: &[Sha1]) -> std::io::Result<Scrape> {
        let url = scrape_url(&self.announce_url).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("tracker {} does not support scrape", self.announce_url),
            )
        })?;
        let query = info_hashes
            .iter()
            .map(|hash| format!("info_hash={}", urlencoding::encode_binary(hash.as_bytes())))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query.is_empty() {
            url
        } else {
            format!("{url}{}{query}", query_separator(&url))
        };
        let response = self.get(&url).await?;
        decode_scrape(&response)
    }

    async fn get(&self, url: &str) -> std::io::Result<bytes::Bytes> {
        tracing::trace!("tracker request {url}");
        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                std::io::Error::new(std::io::ErrorKind::TimedOut, err)
            } else {
                std::io::Error::other(err)
            }
        })?;
        response.bytes().await.map_err(std::io::Error::other)
    }
}

fn query_separator(url: &str) -> char {
    if url.contains('?') {
        '&'
    } else {
        '?'
    }
}

fn announce_url(base: &str, params: &AnnounceParams) -> String {
    let mut url = format!(
        "{base}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        query_separator(base),
        urlencoding::encode_binary(params.info_hash.as_bytes()),
        urlencoding::encode_binary(params.peer_id.as_bytes()),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        params.num_want.unwrap_or(DEFAULT_NUM_WANT),
    );
    if let Some(event) = params.event.as_str() {
        url.push_str("&event=");
        url.push_str(event);
    }
    if let Some(ip) = params.ip {
        url.push_str("&ip=");
        url.push_str(&urlencoding::encode(&ip.to_string()));
    }
    url
}

/// `http://host/announce?x` becomes `http://host/scrape?x`, only if the last path segment starts with `announce`.
fn scrape_url(announce_url: &str) -> Option<String> {
    let (path, query) = match announce_url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (announce_url, None),
    };
    let slash = path.rfind('/')?;
    let rest = path[slash + 1..].strip_prefix("announce")?;
    let mut url = format!("{}/scrape{rest}", &path[..slash]);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    Some(url)
}

fn failure(dict: &Dict) -> std::io::Result<()> {
    match dict.find_str(b"failure reason")? {
        Some(reason) => Err(std::io::Error::other(format!("tracker failure: {reason}"))),
        None => Ok(()),
    }
}

fn optional_u32(dict: &Dict, key: &[u8]) -> std::io::Result<Option<u32>> {
    Ok(dict
        .find_int(key)?
        .map(|v| u32::try_from(v).unwrap_or_default()))
}

pub(crate) fn decode_announce(data: &[u8]) -> std::io::Result<Announce> {
    let value = bencode::decode(data)?;
    let dict = Dict::from_value(&value)?;
    failure(&dict)?;

    let interval = u32::try_from(dict.require_int(b"interval")?)
        .map_err(|_| bencode::invalid("invalid announce interval"))?;

    let mut peers = match dict.find_value(b"peers") {
        Some(Value::Bytes(compact)) => decode_compact_v4(compact)?,
        Some(Value::List(list)) => list
            .iter()
            .filter_map(|peer| match decode_peer_dict(peer) {
                Ok(peer) => Some(peer),
                Err(err) => {
                    tracing::debug!("ignoring malformed peer entry: {err}");
                    None
                }
            })
            .collect(),
        Some(_) => return Err(bencode::invalid("invalid peers field")),
        None => Vec::new(),
    };
    if let Some(compact) = dict.find_value(b"peers6") {
        peers.extend(decode_compact_v6(bencode::as_bytes(compact)?)?);
    }

    Ok(Announce {
        interval,
        seeders: optional_u32(&dict, b"complete")?,
        leechers: optional_u32(&dict, b"incomplete")?,
        warning: dict.find_str(b"warning message")?.map(str::to_string),
        peers,
    })
}

fn decode_compact_v4(data: &[u8]) -> std::io::Result<Vec<AnnouncePeer>> {
    if data.len() % 6 != 0 {
        return Err(bencode::invalid("compact peer list is not a multiple of 6"));
    }
    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            AnnouncePeer {
                id: None,
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            }
        })
        .collect())
}

fn decode_compact_v6(data: &[u8]) -> std::io::Result<Vec<AnnouncePeer>> {
    if data.len() % 18 != 0 {
        return Err(bencode::invalid("compact peer6 list is not a multiple of 18"));
    }
    Ok(data
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            AnnouncePeer {
                id: None,
                addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
            }
        })
        .collect())
}

fn decode_peer_dict(value: &Value) -> std::io::Result<AnnouncePeer> {
    let dict = Dict::from_value(value)?;
    let ip = dict
        .require_str(b"ip")?
        .parse::<IpAddr>()
        .map_err(|err| bencode::invalid(format!("invalid peer ip: {err}")))?;
    let port = u16::try_from(dict.require_int(b"port")?)
        .map_err(|_| bencode::invalid("invalid peer port"))?;
    let id = match dict.find_value(b"peer id") {
        Some(id) => PeerId::from_slice(bencode::as_bytes(id)?),
        None => None,
    };
    Ok(AnnouncePeer {
        id,
        addr: SocketAddr::new(ip, port),
    })
}

pub(crate) fn decode_scrape(data: &[u8]) -> std::io::Result<Scrape> {
    let value = bencode::decode(data)?;
    let dict = Dict::from_value(&value)?;
    failure(&dict)?;

    let mut scrape = Scrape::default();
    let files = match dict.find_value(b"files") {
        Some(Value::Dict(files)) => files,
        Some(_) => return Err(bencode::invalid("invalid files field")),
        None => return Ok(scrape),
    };
    for (hash, stats) in files {
        let hash = Sha1::from_slice(hash).ok_or_else(|| bencode::invalid("invalid info hash"))?;
        let stats = Dict::from_value(stats)?;
        scrape.files.insert(
            hash,
            ScrapeStats {
                downloaded: u64::try_from(stats.find_int(b"downloaded")?.unwrap_or_default())
                    .unwrap_or_default(),
                complete: optional_u32(&stats, b"complete")?.unwrap_or_default(),
                incomplete: optional_u32(&stats, b"incomplete")?.unwrap_or_default(),
                name: stats.find_str(b"name")?.map(str::to_string),
            },
        );
    }
    Ok(scrape)
}
