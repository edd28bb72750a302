use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncWriteExt, BufWriter},
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
};

use crate::{wire, PeerId};

use super::{
    coordinator::HANDSHAKE_TIMEOUT, PeerIo, PeerKey, PeerReader, PeerWriter, SessionMsg,
    SessionSender, TorrentKey,
};

/// An idle connection sends a keep-alive after this long.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(120);

type ConnectionSender = mpsc::UnboundedSender<wire::Message>;
type ConnectionReceiver = mpsc::UnboundedReceiver<wire::Message>;

#[derive(Clone, Copy)]
struct Route {
    torrent_key: TorrentKey,
    peer_key: PeerKey,
}

impl Route {
    fn failure(&self, sender: &SessionSender, error: std::io::Error) {
        let _ = sender.send(SessionMsg::PeerFailure {
            torrent_key: self.torrent_key,
            peer_key: self.peer_key,
            error,
        });
    }
}

/// The socket side of a peer. Dropping it closes the connection.
#[derive(Debug)]
pub struct ConnectionProc {
    sender: ConnectionSender,
    // aborts the connect/handshake task, the reader and writer stop once `sender` is dropped
    handle: AbortHandle,
}

impl Drop for ConnectionProc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ConnectionProc {
    /// Take over an incoming connection whose handshake was already read.
    pub fn accept(
        sender: SessionSender,
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        handshake: wire::Handshake,
        peer_io: PeerIo,
    ) -> Self {
        let (connection_sender, connection_receiver) = mpsc::unbounded_channel();
        let route = Route {
            torrent_key,
            peer_key,
        };
        let handle = tokio::spawn(accept(
            sender,
            connection_receiver,
            route,
            handshake,
            peer_io,
        ))
        .abort_handle();
        Self {
            sender: connection_sender,
            handle,
        }
    }

    pub fn connect(
        sender: SessionSender,
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        handshake: wire::Handshake,
        address: SocketAddr,
    ) -> Self {
        let (connection_sender, connection_receiver) = mpsc::unbounded_channel();
        let route = Route {
            torrent_key,
            peer_key,
        };
        let handle = tokio::spawn(connect(
            sender,
            connection_receiver,
            route,
            handshake,
            address,
        ))
        .abort_handle();
        Self {
            sender: connection_sender,
            handle,
        }
    }

    pub fn send(&self, message: wire::Message) {
        let _ = self.sender.send(message);
    }
}

async fn connect(
    sender: SessionSender,
    receiver: ConnectionReceiver,
    route: Route,
    handshake: wire::Handshake,
    address: SocketAddr,
) {
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_handshake(handshake, address)).await;
    let (stream, remote) = match result {
        Ok(Ok(connected)) => connected,
        Ok(Err(error)) => {
            route.failure(&sender, error);
            return;
        }
        Err(_) => {
            route.failure(
                &sender,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"),
            );
            return;
        }
    };

    let _ = sender.send(SessionMsg::PeerHandshake {
        torrent_key: route.torrent_key,
        peer_key: route.peer_key,
        peer_id: remote,
    });

    let (reader, writer) = stream.into_split();
    spawn_reader_writer(sender, receiver, route, PeerIo::new(reader, writer));
}

async fn connect_handshake(
    handshake: wire::Handshake,
    address: SocketAddr,
) -> std::io::Result<(TcpStream, PeerId)> {
    let mut stream = TcpStream::connect(address).await?;
    wire::write_handshake_async(&mut stream, &handshake).await?;
    let remote = wire::read_handshake_async(&mut stream).await?;
    if remote.info_hash != handshake.info_hash {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "peer sent invalid info_hash in handshake",
        ));
    }
    Ok((stream, remote.peer_id))
}

async fn accept(
    sender: SessionSender,
    receiver: ConnectionReceiver,
    route: Route,
    handshake: wire::Handshake,
    mut peer_io: PeerIo,
) {
    if let Err(error) = wire::write_handshake_async(&mut peer_io.writer, &handshake).await {
        route.failure(&sender, error);
        return;
    }
    spawn_reader_writer(sender, receiver, route, peer_io);
}

fn spawn_reader_writer(
    sender: SessionSender,
    receiver: ConnectionReceiver,
    route: Route,
    peer_io: PeerIo,
) {
    let reader_handle = tokio::spawn(reader_task(sender.clone(), route, peer_io.reader)).abort_handle();
    tokio::spawn(writer_task(
        sender,
        receiver,
        route,
        peer_io.writer,
        reader_handle,
    ));
}

async fn reader_task(sender: SessionSender, route: Route, mut reader: PeerReader) {
    loop {
        match wire::read_message_async(&mut reader).await {
            Ok(message) => {
                let _ = sender.send(SessionMsg::PeerMessage {
                    torrent_key: route.torrent_key,
                    peer_key: route.peer_key,
                    message,
                });
            }
            Err(error) => {
                route.failure(&sender, error);
                return;
            }
        }
    }
}

async fn writer_task(
    sender: SessionSender,
    mut receiver: ConnectionReceiver,
    route: Route,
    writer: PeerWriter,
    // the reader is aborted once the ConnectionProc is dropped
    reader_handle: AbortHandle,
) {
    let mut writer = BufWriter::new(writer);
    loop {
        let message = match tokio::time::timeout(KEEP_ALIVE_PERIOD, receiver.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => wire::Message::KeepAlive,
        };
        let write_result = wire::write_message_async(&mut writer, &message).await;
        let flush_result = writer.flush().await;
        if let Err(error) = write_result.and(flush_result) {
            tracing::warn!("failed to write message to peer: {error}");
            route.failure(&sender, error);
            break;
        }
    }
    reader_handle.abort();
}
