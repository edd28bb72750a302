use std::{io::Read as _, path::Path};

use serde::Serialize;

use crate::{bencode, Sha1};

const DEFAULT_PIECE_LENGTH: u32 = 256 * 1024;

#[derive(Debug, Default, Clone)]
pub struct TorrentCreatorConfig {
    pub name: Option<String>,
    pub announce: Option<String>,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub creator: Option<String>,
    pub comment: Option<String>,
    pub piece_length: Option<u32>,
}

pub struct TorrentCreatorFile<'a> {
    creator: &'a mut TorrentCreator,
    path: String,
    length: u64,
}

impl TorrentCreatorFile<'_> {
    pub fn push_data(&mut self, data: &[u8]) {
        self.length += data.len() as u64;
        self.creator.push_data(data);
    }

    pub fn finish(self) {}
}

impl Drop for TorrentCreatorFile<'_> {
    fn drop(&mut self) {
        self.creator.files.push(FileEntry {
            path: std::mem::take(&mut self.path),
            length: self.length,
        });
    }
}

#[derive(Debug)]
struct FileEntry {
    path: String,
    length: u64,
}

#[derive(Serialize)]
struct MetainfoOut<'a> {
    announce: &'a str,
    #[serde(rename = "announce-list", skip_serializing_if = "Option::is_none")]
    announce_list: Option<&'a Vec<Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
    #[serde(rename = "created by", skip_serializing_if = "Option::is_none")]
    created_by: Option<&'a str>,
    info: InfoOut<'a>,
}

#[derive(Serialize)]
struct InfoOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<FileOut<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: &'a str,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
}

#[derive(Serialize)]
struct FileOut<'a> {
    length: u64,
    path: Vec<&'a str>,
}

/// Hashes content into pieces and produces the bencoded metainfo describing it.
#[derive(Debug)]
pub struct TorrentCreator {
    config: TorrentCreatorConfig,
    piece_length: u32,
    pieces: Vec<Sha1>,
    files: Vec<FileEntry>,
    buffer: Vec<u8>,
}

impl TorrentCreator {
    pub fn new(config: TorrentCreatorConfig) -> Self {
        let piece_length = config.piece_length.unwrap_or(DEFAULT_PIECE_LENGTH);
        Self {
            config,
            piece_length,
            pieces: Default::default(),
            files: Default::default(),
            buffer: Default::default(),
        }
    }

    /// Hash a file, or every regular file below a directory in sorted order.
    pub fn from_path(path: &Path, mut config: TorrentCreatorConfig) -> std::io::Result<Vec<u8>> {
        if config.name.is_none() {
            config.name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }

        let mut creator = Self::new(config);
        if path.is_dir() {
            let mut files = Vec::new();
            collect_files(path, path, &mut files)?;
            files.sort();
            for relative in files {
                creator.push_file(&path.join(&relative), &relative)?;
            }
        } else {
            let name = creator.config.name.clone().unwrap_or_default();
            creator.push_file(path, &name)?;
        }
        creator.finish()
    }

    fn push_file(&mut self, path: &Path, relative: &str) -> std::io::Result<()> {
        let mut file = std::fs::File::open(path)?;
        let mut entry = self.file(relative);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            entry.push_data(&buf[..n]);
        }
        Ok(())
    }

    fn push_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        let piece_length = self.piece_length as usize;
        while self.buffer.len() >= piece_length {
            let piece_hash = Sha1::hash(&self.buffer[0..piece_length]);
            self.buffer.drain(0..piece_length);
            self.pieces.push(piece_hash);
        }
    }

    /// Start a new file, `path` uses `/` as separator.
    pub fn file<'a>(&'a mut self, path: &str) -> TorrentCreatorFile<'a> {
        TorrentCreatorFile {
            creator: self,
            path: path.to_string(),
            length: 0,
        }
    }

    pub fn finish(mut self) -> std::io::Result<Vec<u8>> {
        if !self.buffer.is_empty() {
            self.pieces.push(Sha1::hash(&self.buffer));
        }

        let name = self.config.name.clone().unwrap_or_default();
        let pieces = self
            .pieces
            .iter()
            .flat_map(|piece| piece.as_bytes().iter().copied())
            .collect::<Vec<_>>();

        let (files, length) = match self.files.len() {
            0 => (None, Some(0)),
            1 => (None, Some(self.files[0].length)),
            _ => (
                Some(
                    self.files
                        .iter()
                        .map(|file| FileOut {
                            length: file.length,
                            path: file.path.split('/').collect(),
                        })
                        .collect(),
                ),
                None,
            ),
        };

        let metainfo = MetainfoOut {
            announce: self.config.announce.as_deref().unwrap_or_default(),
            announce_list: self.config.announce_list.as_ref(),
            comment: self.config.comment.as_deref(),
            created_by: self.config.creator.as_deref(),
            info: InfoOut {
                files,
                length,
                name: &name,
                piece_length: self.piece_length,
                pieces,
            },
        };
        bencode::encode(&metainfo)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(std::io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(relative);
        }
    }
    Ok(())
}
