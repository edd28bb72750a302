use tokio::{sync::mpsc, task::AbortHandle};

use crate::{tracker::TrackerClient, AnnounceParams};

use super::{SessionMsg, SessionSender, TorrentKey, TrackerKey};

type TrackerSender = mpsc::UnboundedSender<TrackerMsg>;
type TrackerReceiver = mpsc::UnboundedReceiver<TrackerMsg>;

enum TrackerMsg {
    Announce(AnnounceParams),
}

/// Announces to one tracker, one request at a time so replies arrive in order.
#[derive(Debug)]
pub struct TrackerProc {
    sender: TrackerSender,
    handle: Option<AbortHandle>,
}

impl TrackerProc {
    pub fn spawn(
        sender: SessionSender,
        torrent_key: TorrentKey,
        tracker_key: TrackerKey,
        url: String,
    ) -> Self {
        let (tracker_sender, tracker_receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(
            sender,
            tracker_receiver,
            torrent_key,
            tracker_key,
            url,
        ))
        .abort_handle();
        Self {
            sender: tracker_sender,
            handle: Some(handle),
        }
    }

    pub fn announce(&self, params: &AnnounceParams) {
        let _ = self.sender.send(TrackerMsg::Announce(params.clone()));
    }

    /// Let queued announces finish, then exit. Used for the final `stopped` event.
    pub fn detach(mut self) {
        self.handle = None;
    }
}

impl Drop for TrackerProc {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    sender: SessionSender,
    mut receiver: TrackerReceiver,
    torrent_key: TorrentKey,
    tracker_key: TrackerKey,
    url: String,
) {
    let client = match TrackerClient::new(&url) {
        Ok(client) => Some(client),
        Err(error) => {
            tracing::warn!(tracker = %url, "unsupported tracker: {error}");
            None
        }
    };

    while let Some(msg) = receiver.recv().await {
        match msg {
            TrackerMsg::Announce(params) => {
                let result = match &client {
                    Some(client) => client.announce(&params).await,
                    None => Err(std::io::Error::other(format!(
                        "unsupported tracker url: {url}"
                    ))),
                };
                let msg = match result {
                    Ok(announce) => SessionMsg::TrackerAnnounce {
                        torrent_key,
                        tracker_key,
                        announce,
                    },
                    Err(error) => SessionMsg::TrackerError {
                        torrent_key,
                        tracker_key,
                        error,
                    },
                };
                let _ = sender.send(msg);
            }
        }
    }
}
