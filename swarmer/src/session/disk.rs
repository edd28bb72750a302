use std::sync::Arc;

use bytes::Bytes;
use tokio::{sync::mpsc, task::AbortHandle};

use crate::{PieceIdx, Storage};

use super::{SessionMsg, SessionSender, TorrentKey};

type DiskSender = mpsc::UnboundedSender<DiskMsg>;
type DiskReceiver = mpsc::UnboundedReceiver<DiskMsg>;

enum DiskMsg {
    ReadPiece { idx: PieceIdx },
    WritePiece { idx: PieceIdx, data: Bytes },
}

/// Serves piece reads and verified writes for one torrent, in the order they were issued.
#[derive(Debug)]
pub struct DiskProc {
    sender: DiskSender,
    handle: AbortHandle,
}

impl Drop for DiskProc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl DiskProc {
    pub fn spawn(sender: SessionSender, torrent_key: TorrentKey, storage: Arc<Storage>) -> Self {
        let (disk_sender, disk_receiver) = mpsc::unbounded_channel();
        let state = State {
            sender,
            receiver: disk_receiver,
            torrent_key,
            storage,
        };
        let handle = tokio::spawn(run(state)).abort_handle();
        Self {
            sender: disk_sender,
            handle,
        }
    }

    pub fn read(&self, piece_idx: PieceIdx) {
        self.send(DiskMsg::ReadPiece { idx: piece_idx });
    }

    pub fn write(&self, piece_idx: PieceIdx, data: Bytes) {
        self.send(DiskMsg::WritePiece {
            idx: piece_idx,
            data,
        });
    }

    fn send(&self, msg: DiskMsg) {
        if self.sender.send(msg).is_err() {
            tracing::error!("disk task exited before its torrent");
        }
    }
}

struct State {
    sender: SessionSender,
    receiver: DiskReceiver,
    torrent_key: TorrentKey,
    storage: Arc<Storage>,
}

async fn run(mut state: State) {
    while let Some(msg) = state.receiver.recv().await {
        match msg {
            DiskMsg::ReadPiece { idx } => read(&state, idx).await,
            DiskMsg::WritePiece { idx, data } => write(&state, idx, data).await,
        }
    }
}

async fn read(state: &State, idx: PieceIdx) {
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.get_piece(idx))
        .await
        .unwrap_or_else(|error| Err(std::io::Error::other(error)));
    if let Err(error) = &result {
        tracing::error!(piece = %idx, "failed to read piece: {error}");
    }
    let _ = state.sender.send(SessionMsg::PieceRead {
        torrent_key: state.torrent_key,
        piece_idx: idx,
        result,
    });
}

async fn write(state: &State, idx: PieceIdx, data: Bytes) {
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.put_piece(idx, &data))
        .await
        .unwrap_or_else(|error| Err(std::io::Error::other(error)));
    if let Err(error) = &result {
        tracing::error!(piece = %idx, "failed to write piece: {error}");
    }
    let _ = state.sender.send(SessionMsg::PieceWrite {
        torrent_key: state.torrent_key,
        piece_idx: idx,
        result,
    });
}
