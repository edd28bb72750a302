use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    bencode::{self, Dict, Value},
    PieceIdx, Sha1,
};

struct TorrentInfoInner {
    announce: String,
    trackers: Vec<String>,
    name: String,
    comment: Option<String>,
    creator: Option<String>,
    piece_length: u32,
    pieces: Vec<Sha1>,
    info_hash: Sha1,
    files: Vec<TorrentFile>,
    multi_file: bool,
    total_size: u64,
}

impl std::fmt::Debug for TorrentInfoInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentInfo")
            .field("announce", &self.announce)
            .field("name", &self.name)
            .field("comment", &self.comment)
            .field("creator", &self.creator)
            .field("piece_length", &self.piece_length)
            .field("pieces", &self.pieces.len())
            .field("files", &self.files)
            .finish()
    }
}

/// Read-only description of a torrent: its pieces, their hashes and how they map onto files.
///
/// Cheap to clone, every clone shares the same data.
#[derive(Clone)]
pub struct TorrentInfo(Arc<TorrentInfoInner>);

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TorrentInfo {
    pub fn decode(buf: &[u8]) -> std::io::Result<Self> {
        let value = bencode::decode(buf)?;
        let metainfo = Dict::from_value(&value)?;
        let info_value = metainfo.require_value(b"info")?;
        let info_bytes = bencode::raw_dict_value(buf, b"info")?
            .ok_or_else(|| bencode::invalid("missing key 'info'"))?;
        let info_hash = Sha1::hash(info_bytes);
        let info = Dict::from_value(info_value)?;

        let name = info.require_str(b"name")?;
        check_path_component(name)?;
        let name = name.to_string();
        let piece_length = u32::try_from(info.require_int(b"piece length")?)
            .ok()
            .filter(|l| *l > 0)
            .ok_or_else(|| bencode::invalid("invalid piece length"))?;

        let pieces_bytes = info.require_bytes(b"pieces")?;
        if pieces_bytes.len() % Sha1::LENGTH != 0 {
            return Err(bencode::invalid(
                "size of pieces byte string is not a multiple of 20",
            ));
        }
        let pieces = pieces_bytes
            .chunks_exact(Sha1::LENGTH)
            .filter_map(Sha1::from_slice)
            .collect::<Vec<_>>();

        let multi_file = info.find_value(b"files").is_some();
        let files = match (info.find_value(b"length"), info.find_value(b"files")) {
            (Some(length), None) => vec![(PathBuf::from(&name), decode_length(length)?)],
            (None, Some(files)) => bencode::as_list(files)?
                .iter()
                .map(decode_file)
                .collect::<std::io::Result<Vec<_>>>()?,
            (Some(_), Some(_)) => {
                return Err(bencode::invalid(
                    "info dictionary cannot contain both files and length field",
                ))
            }
            (None, None) => {
                return Err(bencode::invalid(
                    "info dictionary must contain either files or length field",
                ))
            }
        };

        let mut trackers = Vec::new();
        if let Some(tiers) = metainfo.find_value(b"announce-list") {
            for tier in bencode::as_list(tiers)? {
                for url in bencode::as_list(tier)? {
                    trackers.push(bencode::as_str(url)?.to_string());
                }
            }
        }

        let info = Self::from_parts(TorrentInfoParts {
            announce: metainfo
                .find_str(b"announce")?
                .unwrap_or_default()
                .to_string(),
            trackers,
            name,
            comment: metainfo.find_str(b"comment")?.map(str::to_string),
            creator: metainfo.find_str(b"created by")?.map(str::to_string),
            piece_length,
            pieces,
            info_hash,
            files,
            multi_file,
        })?;
        Ok(info)
    }

    /// Assemble a descriptor from already parsed fields, checking that the pieces cover the files exactly.
    pub fn from_parts(parts: TorrentInfoParts) -> std::io::Result<Self> {
        let mut files = Vec::with_capacity(parts.files.len());
        let mut offset = 0;
        for (index, (path, length)) in parts.files.into_iter().enumerate() {
            files.push(TorrentFile {
                index,
                start: offset,
                length,
                path,
            });
            offset += length;
        }

        let expected_pieces = offset.div_ceil(u64::from(parts.piece_length));
        if expected_pieces != parts.pieces.len() as u64 {
            return Err(bencode::invalid(format!(
                "torrent of {} bytes with piece length {} needs {} pieces, found {}",
                offset,
                parts.piece_length,
                expected_pieces,
                parts.pieces.len()
            )));
        }

        Ok(Self(Arc::new(TorrentInfoInner {
            announce: parts.announce,
            trackers: parts.trackers,
            name: parts.name,
            comment: parts.comment,
            creator: parts.creator,
            piece_length: parts.piece_length,
            pieces: parts.pieces,
            info_hash: parts.info_hash,
            files,
            multi_file: parts.multi_file,
            total_size: offset,
        })))
    }

    pub fn announce(&self) -> &str {
        &self.0.announce
    }

    pub fn trackers(&self) -> &[String] {
        &self.0.trackers
    }

    /// Announce urls to use, the announce list takes precedence over the single announce url.
    pub fn tracker_urls(&self) -> Vec<String> {
        if !self.0.trackers.is_empty() {
            self.0.trackers.clone()
        } else if !self.0.announce.is_empty() {
            vec![self.0.announce.clone()]
        } else {
            Vec::new()
        }
    }

    pub fn name(&self) -> &str {
        self.0.name.as_str()
    }

    pub fn comment(&self) -> Option<&str> {
        self.0.comment.as_deref()
    }

    pub fn creator(&self) -> Option<&str> {
        self.0.creator.as_deref()
    }

    pub fn total_size(&self) -> u64 {
        self.0.total_size
    }

    pub fn info_hash(&self) -> Sha1 {
        self.0.info_hash
    }

    pub fn piece_length(&self) -> u32 {
        self.0.piece_length
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = PieceIdx> {
        (0..self.pieces_count()).map(PieceIdx::new)
    }

    /// Length of a given piece, every piece but the last has `piece_length` bytes.
    /// Zero for indices past the end.
    pub fn piece_length_from_index(&self, piece_index: PieceIdx) -> u32 {
        let start = u64::from(piece_index.0) * u64::from(self.piece_length());
        self.total_size()
            .saturating_sub(start)
            .min(u64::from(self.piece_length())) as u32
    }

    pub fn piece_index_valid(&self, piece_index: PieceIdx) -> bool {
        piece_index.0 < self.pieces_count()
    }

    pub fn piece_request_valid(&self, piece_index: PieceIdx, begin: u32, length: u32) -> bool {
        if !self.piece_index_valid(piece_index) {
            return false;
        }

        let piece_length = self.piece_length_from_index(piece_index);
        match begin.checked_add(length) {
            Some(end) => begin < piece_length && end <= piece_length,
            None => false,
        }
    }

    pub fn piece_hash(&self, piece_index: PieceIdx) -> Option<Sha1> {
        self.0.pieces.get(piece_index.0 as usize).copied()
    }

    /// The parts of each file covered by a piece, in file order.
    pub fn files_from_piece(
        &self,
        piece_index: PieceIdx,
    ) -> impl Iterator<Item = TorrentFileRange<'_>> {
        let piece_start = u64::from(piece_index.0) * u64::from(self.piece_length());
        let piece_end = piece_start + u64::from(self.piece_length_from_index(piece_index));
        self.0.files.iter().filter_map(move |file| {
            let start = piece_start.max(file.start);
            let end = piece_end.min(file.start + file.length);
            (start < end).then(|| TorrentFileRange {
                file,
                file_start: start - file.start,
                piece_start: (start - piece_start) as u32,
                chunk_length: (end - start) as u32,
            })
        })
    }

    pub fn pieces_count(&self) -> u32 {
        self.0.pieces.len() as u32
    }

    pub fn pieces(&self) -> &[Sha1] {
        &self.0.pieces
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.0.files
    }

    /// Location of `file` when the torrent content is stored below `root`.
    pub fn file_path(&self, root: &Path, file: &TorrentFile) -> PathBuf {
        if self.0.multi_file {
            root.join(&self.0.name).join(&file.path)
        } else {
            root.join(&file.path)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TorrentInfoParts {
    pub announce: String,
    pub trackers: Vec<String>,
    pub name: String,
    pub comment: Option<String>,
    pub creator: Option<String>,
    pub piece_length: u32,
    pub pieces: Vec<Sha1>,
    pub info_hash: Sha1,
    /// relative path and length of each file, in torrent order
    pub files: Vec<(PathBuf, u64)>,
    /// multi-file torrents keep their files in a directory named after the torrent
    pub multi_file: bool,
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    index: usize,
    start: u64,
    length: u64,
    path: PathBuf,
}

impl TorrentFile {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct TorrentFileRange<'a> {
    /// The file a given piece belongs to
    pub file: &'a TorrentFile,
    /// Where in the file should this piece be placed
    pub file_start: u64,
    /// Where in the piece does this file start
    pub piece_start: u32,
    /// How much of the piece belongs to this file
    pub chunk_length: u32,
}

impl TorrentFileRange<'_> {
    pub fn piece_range(&self) -> std::ops::Range<usize> {
        self.piece_start as usize..(self.piece_start + self.chunk_length) as usize
    }
}

fn decode_length(value: &Value) -> std::io::Result<u64> {
    u64::try_from(bencode::as_int(value)?).map_err(|_| bencode::invalid("negative file length"))
}

fn decode_file(value: &Value) -> std::io::Result<(PathBuf, u64)> {
    let dict = Dict::from_value(value)?;
    let length = decode_length(dict.require_value(b"length")?)?;
    let mut path = PathBuf::new();
    for component in bencode::as_list(dict.require_value(b"path")?)? {
        let component = bencode::as_str(component)?;
        check_path_component(component)?;
        path.push(component);
    }
    if path.as_os_str().is_empty() {
        return Err(bencode::invalid("empty file path"));
    }
    Ok((path, length))
}

/// Keep every file inside the download root.
fn check_path_component(component: &str) -> std::io::Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
    {
        return Err(bencode::invalid(format!(
            "invalid path component '{component}'"
        )));
    }
    Ok(())
}
