use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    task::AbortHandle,
};

use crate::wire;

use super::{PeerIo, SessionMsg, SessionSender};

/// Incoming connections must send their handshake within this long.
const ACCEPT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ListenerProc {
    local_addr: SocketAddr,
    handle: AbortHandle,
}

impl Drop for ListenerProc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ListenerProc {
    pub async fn bind(sender: SessionSender, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening for peers");
        let handle = tokio::spawn(run(sender, listener)).abort_handle();
        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn run(sender: SessionSender, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(accept(sender.clone(), stream, addr));
            }
            Err(err) => {
                tracing::warn!("failed to accept connection: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept(sender: SessionSender, mut stream: TcpStream, addr: SocketAddr) {
    let read_future = wire::read_handshake_async(&mut stream);
    let handshake = match tokio::time::timeout(ACCEPT_HANDSHAKE_TIMEOUT, read_future).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(err)) => {
            tracing::debug!("failed to read handshake from {addr}: {err}");
            return;
        }
        Err(_) => {
            tracing::debug!("timed out waiting for handshake from {addr}");
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    let peer_io = PeerIo::new(reader, writer);
    let _ = sender.send(SessionMsg::ListenerIncoming {
        peer_id: handshake.peer_id,
        peer_addr: addr,
        info_hash: handshake.info_hash,
        peer_io,
    });
}
