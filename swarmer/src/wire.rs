//! Framing of the peer wire protocol: the fixed size handshake followed by
//! length prefixed messages.

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::{PeerId, PieceIdx, Sha1};

const HANDSHAKE_PREFIX_LENGTH: usize = 20;
const HANDSHAKE_PREFIX: &[u8; HANDSHAKE_PREFIX_LENGTH] = b"\x13BitTorrent protocol";
const HANDSHAKE_RESERVED_LENGTH: usize = 8;

pub const HANDSHAKE_LENGTH: usize = HANDSHAKE_PREFIX_LENGTH
    + HANDSHAKE_RESERVED_LENGTH // 8 reserved bytes, currently all zero
    + 20 // 20 byte sha1 info_hash
    + 20; // 20 byte peer id

/// Largest frame we accept. Covers a piece message for the biggest request we
/// serve and the bitfield of any sane torrent.
pub const MAX_MESSAGE_LENGTH: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: PieceIdx,
    },
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
    Piece {
        index: PieceIdx,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageKind {
    fn from_u8(kind: u8) -> Option<MessageKind> {
        Some(match kind {
            0 => MessageKind::Choke,
            1 => MessageKind::Unchoke,
            2 => MessageKind::Interested,
            3 => MessageKind::NotInterested,
            4 => MessageKind::Have,
            5 => MessageKind::Bitfield,
            6 => MessageKind::Request,
            7 => MessageKind::Piece,
            8 => MessageKind::Cancel,
            _ => return None,
        })
    }
}

fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

pub fn serialize_handshake(handshake: &Handshake) -> [u8; HANDSHAKE_LENGTH] {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    let mut cursor = &mut buf[..];
    cursor.put_slice(HANDSHAKE_PREFIX);
    cursor.put_bytes(0, HANDSHAKE_RESERVED_LENGTH);
    cursor.put_slice(handshake.info_hash.as_bytes());
    cursor.put_slice(handshake.peer_id.as_bytes());
    buf
}

pub fn deserialize_handshake(buf: &[u8; HANDSHAKE_LENGTH]) -> std::io::Result<Handshake> {
    let (prefix, rest) = buf.split_at(HANDSHAKE_PREFIX_LENGTH);
    if prefix != HANDSHAKE_PREFIX {
        return Err(invalid("invalid handshake prefix"));
    }
    let (_reserved, rest) = rest.split_at(HANDSHAKE_RESERVED_LENGTH);
    let (info_hash, peer_id) = rest.split_at(20);
    Ok(Handshake {
        info_hash: Sha1::from_slice(info_hash).ok_or_else(|| invalid("short info hash"))?,
        peer_id: PeerId::from_slice(peer_id).ok_or_else(|| invalid("short peer id"))?,
    })
}

pub async fn write_handshake_async<W>(writer: &mut W, handshake: &Handshake) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&serialize_handshake(handshake)).await?;
    writer.flush().await
}

pub async fn read_handshake_async<R>(reader: &mut R) -> std::io::Result<Handshake>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    deserialize_handshake(&buf)
}

/// Decode the body of a frame, without its length prefix.
pub fn decode_message(mut buf: Bytes) -> std::io::Result<Message> {
    if buf.is_empty() {
        return Ok(Message::KeepAlive);
    }

    let kind = buf.get_u8();
    let message_kind =
        MessageKind::from_u8(kind).ok_or_else(|| invalid(format!("unknown message kind: {kind}")))?;
    let expect_len = |buf: &Bytes, len: usize| {
        if buf.len() == len {
            Ok(())
        } else {
            Err(invalid(format!(
                "{message_kind:?} message with {} byte payload, expected {len}",
                buf.len()
            )))
        }
    };

    let message = match message_kind {
        MessageKind::Choke => {
            expect_len(&buf, 0)?;
            Message::Choke
        }
        MessageKind::Unchoke => {
            expect_len(&buf, 0)?;
            Message::Unchoke
        }
        MessageKind::Interested => {
            expect_len(&buf, 0)?;
            Message::Interested
        }
        MessageKind::NotInterested => {
            expect_len(&buf, 0)?;
            Message::NotInterested
        }
        MessageKind::Have => {
            expect_len(&buf, 4)?;
            Message::Have {
                index: PieceIdx::from(buf.get_u32()),
            }
        }
        MessageKind::Bitfield => Message::Bitfield { bitfield: buf },
        MessageKind::Request | MessageKind::Cancel => {
            expect_len(&buf, 12)?;
            let index = PieceIdx::from(buf.get_u32());
            let begin = buf.get_u32();
            let length = buf.get_u32();
            if message_kind == MessageKind::Request {
                Message::Request {
                    index,
                    begin,
                    length,
                }
            } else {
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
        }
        MessageKind::Piece => {
            if buf.len() < 8 {
                return Err(invalid("piece message too short"));
            }
            let index = PieceIdx::from(buf.get_u32());
            let begin = buf.get_u32();
            Message::Piece {
                index,
                begin,
                data: buf,
            }
        }
    };
    Ok(message)
}

/// Append the full frame, length prefix included.
pub fn encode_message(message: &Message, buf: &mut BytesMut) {
    match message {
        Message::KeepAlive => buf.put_u32(0),
        Message::Choke => put_header(buf, 0, MessageKind::Choke),
        Message::Unchoke => put_header(buf, 0, MessageKind::Unchoke),
        Message::Interested => put_header(buf, 0, MessageKind::Interested),
        Message::NotInterested => put_header(buf, 0, MessageKind::NotInterested),
        Message::Have { index } => {
            put_header(buf, 4, MessageKind::Have);
            buf.put_u32(u32::from(*index));
        }
        Message::Bitfield { bitfield } => {
            put_header(buf, bitfield.len(), MessageKind::Bitfield);
            buf.put_slice(bitfield);
        }
        Message::Request {
            index,
            begin,
            length,
        } => {
            put_header(buf, 12, MessageKind::Request);
            buf.put_u32(u32::from(*index));
            buf.put_u32(*begin);
            buf.put_u32(*length);
        }
        Message::Piece { index, begin, data } => {
            put_header(buf, 8 + data.len(), MessageKind::Piece);
            buf.put_u32(u32::from(*index));
            buf.put_u32(*begin);
            buf.put_slice(data);
        }
        Message::Cancel {
            index,
            begin,
            length,
        } => {
            put_header(buf, 12, MessageKind::Cancel);
            buf.put_u32(u32::from(*index));
            buf.put_u32(*begin);
            buf.put_u32(*length);
        }
    }
}

fn put_header(buf: &mut BytesMut, payload_len: usize, kind: MessageKind) {
    buf.put_u32(payload_len as u32 + 1);
    buf.put_u8(kind as u8);
}

pub async fn read_message_async<R>(reader: &mut R) -> std::io::Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_LENGTH {
        return Err(invalid(format!("message of {len} bytes exceeds limit")));
    }
    let mut buf = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut buf).await?;
    decode_message(buf.freeze())
}

pub async fn write_message_async<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    encode_message(message, &mut buf);
    writer.write_all(&buf).await
}
