use std::{
    fs::File,
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
    sync::Mutex,
};

use bytes::{Bytes, BytesMut};

use crate::{PieceBitfield, PieceIdx, Sha1, TorrentInfo};

#[derive(Debug)]
struct StorageState {
    bitfield: PieceBitfield,
    needed: u32,
}

/// Pieces of one torrent laid out over its backing files.
///
/// Writes to the same file are serialized by that file's lock, distinct files
/// can be written concurrently. The bitfield has a lock of its own.
#[derive(Debug)]
pub struct Storage {
    info: TorrentInfo,
    files: Vec<Mutex<File>>,
    state: Mutex<StorageState>,
}

impl Storage {
    /// Open (or create) every file below `root`, resize it to its declared length
    /// and check which pieces are already present.
    pub fn open(info: TorrentInfo, root: &Path) -> std::io::Result<Self> {
        let mut files = Vec::with_capacity(info.files().len());
        for file in info.files() {
            let path = info.file_path(root, file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            handle.set_len(file.length())?;
            tracing::debug!(path = %path.display(), length = file.length(), "allocated file");
            files.push(Mutex::new(handle));
        }

        let storage = Self {
            state: Mutex::new(StorageState {
                bitfield: PieceBitfield::with_size(info.pieces_count()),
                needed: info.pieces_count(),
            }),
            info,
            files,
        };
        storage.check()?;
        Ok(storage)
    }

    fn check(&self) -> std::io::Result<()> {
        let mut present = PieceBitfield::with_size(self.info.pieces_count());
        for piece in self.info.piece_indices() {
            let data = self.read_piece(piece)?;
            if Some(Sha1::hash(&data)) == self.info.piece_hash(piece) {
                present.set(piece)?;
            }
        }

        let mut state = self.lock_state()?;
        state.needed = present.num_unset();
        state.bitfield = present;
        tracing::info!(
            name = self.info.name(),
            have = state.bitfield.num_set(),
            total = state.bitfield.len(),
            "checked torrent storage"
        );
        Ok(())
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    /// Verify and persist a piece.
    ///
    /// Returns `Ok(false)` if the data does not match the expected hash, nothing is written in that case.
    /// Storing a piece that is already complete succeeds without writing.
    pub fn put_piece(&self, piece: PieceIdx, data: &[u8]) -> std::io::Result<bool> {
        let expected = self.info.piece_hash(piece).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{piece} does not exist"),
            )
        })?;
        if self.lock_state()?.bitfield.get(piece)? {
            return Ok(true);
        }
        if data.len() != self.info.piece_length_from_index(piece) as usize
            || Sha1::hash(data) != expected
        {
            return Ok(false);
        }

        for range in self.info.files_from_piece(piece) {
            let mut file = self.lock_file(range.file.index())?;
            file.seek(SeekFrom::Start(range.file_start))?;
            file.write_all(&data[range.piece_range()])?;
        }

        let mut state = self.lock_state()?;
        // another writer may have stored the same piece while we held the file locks
        if !state.bitfield.get(piece)? {
            state.bitfield.set(piece)?;
            state.needed -= 1;
        }
        Ok(true)
    }

    /// Bytes of a complete piece, `None` if we do not have it.
    pub fn get_piece(&self, piece: PieceIdx) -> std::io::Result<Option<Bytes>> {
        if !self.lock_state()?.bitfield.get(piece)? {
            return Ok(None);
        }
        self.read_piece(piece).map(Some)
    }

    pub fn bitfield(&self) -> std::io::Result<PieceBitfield> {
        Ok(self.lock_state()?.bitfield.clone())
    }

    pub fn needed_piece_count(&self) -> std::io::Result<u32> {
        Ok(self.lock_state()?.needed)
    }

    pub fn complete(&self) -> std::io::Result<bool> {
        Ok(self.needed_piece_count()? == 0)
    }

    fn read_piece(&self, piece: PieceIdx) -> std::io::Result<Bytes> {
        let mut data = BytesMut::zeroed(self.info.piece_length_from_index(piece) as usize);
        for range in self.info.files_from_piece(piece) {
            let mut file = self.lock_file(range.file.index())?;
            file.seek(SeekFrom::Start(range.file_start))?;
            file.read_exact(&mut data[range.piece_range()])?;
        }
        Ok(data.freeze())
    }

    fn lock_file(&self, index: usize) -> std::io::Result<std::sync::MutexGuard<'_, File>> {
        self.files[index]
            .lock()
            .map_err(|_| std::io::Error::other("file lock poisoned"))
    }

    fn lock_state(&self) -> std::io::Result<std::sync::MutexGuard<'_, StorageState>> {
        self.state
            .lock()
            .map_err(|_| std::io::Error::other("storage lock poisoned"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{TorrentCreator, TorrentCreatorConfig};

    // 55 bytes over three files with 16 byte pieces
    fn content() -> Vec<Vec<u8>> {
        vec![
            (0..10).collect(),
            (10..50).collect(),
            (50..55).collect(),
        ]
    }

    fn three_files() -> TorrentInfo {
        let mut creator = TorrentCreator::new(TorrentCreatorConfig {
            name: Some("bundle".to_string()),
            piece_length: Some(16),
            ..Default::default()
        });
        for (name, data) in ["a", "b", "c"].iter().zip(content()) {
            creator.file(name).push_data(&data);
        }
        TorrentInfo::decode(&creator.finish().unwrap()).unwrap()
    }

    fn piece_data(piece: u32) -> Vec<u8> {
        let all = content().concat();
        let start = piece as usize * 16;
        all[start..(start + 16).min(all.len())].to_vec()
    }

    #[test]
    fn fresh_storage_needs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(three_files(), dir.path()).unwrap();
        assert_eq!(storage.needed_piece_count().unwrap(), 4);
        assert!(!storage.complete().unwrap());
        assert_eq!(
            std::fs::metadata(dir.path().join("bundle").join("b"))
                .unwrap()
                .len(),
            40
        );
        assert_eq!(storage.get_piece(PieceIdx::new(0)).unwrap(), None);
    }

    #[test]
    fn put_piece_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(three_files(), dir.path()).unwrap();

        assert!(storage.put_piece(PieceIdx::new(3), &piece_data(3)).unwrap());
        assert!(storage.bitfield().unwrap().has_piece(PieceIdx::new(3)));
        assert_eq!(storage.needed_piece_count().unwrap(), 3);

        let b = std::fs::read(dir.path().join("bundle").join("b")).unwrap();
        assert_eq!(&b[38..], &[48, 49]);
        let c = std::fs::read(dir.path().join("bundle").join("c")).unwrap();
        assert_eq!(c, vec![50, 51, 52, 53, 54]);

        let read = storage.get_piece(PieceIdx::new(3)).unwrap().unwrap();
        assert_eq!(&read[..], &piece_data(3)[..]);
    }

    #[test]
    fn put_piece_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(three_files(), dir.path()).unwrap();

        assert!(!storage.put_piece(PieceIdx::new(0), &[0xFF; 16]).unwrap());
        assert!(!storage.put_piece(PieceIdx::new(0), &piece_data(1)).unwrap());
        assert_eq!(storage.needed_piece_count().unwrap(), 4);
        assert!(!storage.bitfield().unwrap().has_piece(PieceIdx::new(0)));
        let a = std::fs::read(dir.path().join("bundle").join("a")).unwrap();
        assert_eq!(a, vec![0u8; 10]);
    }

    #[test]
    fn put_piece_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(three_files(), dir.path()).unwrap();
        assert!(storage.put_piece(PieceIdx::new(1), &piece_data(1)).unwrap());
        assert!(storage.put_piece(PieceIdx::new(1), &piece_data(1)).unwrap());
        assert_eq!(storage.needed_piece_count().unwrap(), 3);
    }

    #[test]
    fn out_of_range_piece() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(three_files(), dir.path()).unwrap();
        assert!(storage.put_piece(PieceIdx::new(4), &[]).is_err());
        assert!(storage.get_piece(PieceIdx::new(4)).is_err());
    }

    #[test]
    fn resumes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::open(three_files(), dir.path()).unwrap();
            for piece in [0, 2] {
                assert!(storage
                    .put_piece(PieceIdx::new(piece), &piece_data(piece))
                    .unwrap());
            }
        }

        let storage = Storage::open(three_files(), dir.path()).unwrap();
        let bitfield = storage.bitfield().unwrap();
        assert_eq!(
            bitfield.pieces().map(u32::from).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(storage.needed_piece_count().unwrap(), 2);
    }

    #[test]
    fn existing_content_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bundle");
        std::fs::create_dir_all(&root).unwrap();
        for (name, data) in ["a", "b", "c"].iter().zip(content()) {
            std::fs::write(root.join(name), data).unwrap();
        }
        let storage = Storage::open(three_files(), dir.path()).unwrap();
        assert!(storage.complete().unwrap());
    }
}
