use crate::{wire, PieceIdx};

/// Length of a single sub-piece transfer.
pub const CHUNK_LENGTH: u32 = 16 * 1024;

/// Largest request we are willing to serve to a remote peer.
pub const MAX_REQUEST_LENGTH: u32 = 4 * CHUNK_LENGTH;

/// One sub-piece transfer: `length` bytes starting at `begin` inside `piece`.
///
/// The bytes land in the assembly buffer of `piece`, owned by whoever issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    piece: PieceIdx,
    begin: u32,
    length: u32,
}

impl Request {
    pub fn new(piece: PieceIdx, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }

    /// The chunk of `piece` that starts at `begin`, shortened to fit `piece_length`.
    /// Returns `None` once `begin` is past the end of the piece.
    pub fn chunk(piece: PieceIdx, begin: u32, piece_length: u32) -> Option<Self> {
        if begin >= piece_length {
            return None;
        }
        let length = (piece_length - begin).min(CHUNK_LENGTH);
        Some(Self::new(piece, begin, length))
    }

    pub fn piece(&self) -> PieceIdx {
        self.piece
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn end(&self) -> u32 {
        self.begin + self.length
    }

    /// The chunk that follows this one in the same piece, if any.
    pub fn next_chunk(&self, piece_length: u32) -> Option<Self> {
        Self::chunk(self.piece, self.end(), piece_length)
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.begin as usize..self.end() as usize
    }

    pub fn to_request_message(&self) -> wire::Message {
        wire::Message::Request {
            index: self.piece,
            begin: self.begin,
            length: self.length,
        }
    }

    pub fn to_cancel_message(&self) -> wire::Message {
        wire::Message::Cancel {
            index: self.piece,
            begin: self.begin,
            length: self.length,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunks_cover_piece() {
        let piece = PieceIdx::new(3);
        let piece_length = 2 * CHUNK_LENGTH + 100;
        let mut chunks = Vec::new();
        let mut current = Request::chunk(piece, 0, piece_length);
        while let Some(chunk) = current {
            chunks.push(chunk);
            current = chunk.next_chunk(piece_length);
        }

        assert_eq!(
            chunks,
            vec![
                Request::new(piece, 0, CHUNK_LENGTH),
                Request::new(piece, CHUNK_LENGTH, CHUNK_LENGTH),
                Request::new(piece, 2 * CHUNK_LENGTH, 100),
            ]
        );
    }

    #[test]
    fn chunk_past_end() {
        assert_eq!(Request::chunk(PieceIdx::new(0), 10, 10), None);
    }
}
