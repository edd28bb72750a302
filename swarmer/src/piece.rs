#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceIdx(pub(crate) u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }
}

/// A bit index outside of `[0, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    pub index: u32,
    pub size: u32,
}

impl std::fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "piece index {} out of bounds for bitfield of size {}",
            self.index, self.size
        )
    }
}

impl std::error::Error for OutOfBounds {}

impl From<OutOfBounds> for std::io::Error {
    fn from(value: OutOfBounds) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, value)
    }
}

/// Records which pieces are available. Bits are only ever set, never cleared.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct PieceBitfield {
    data: Vec<u8>,
    size: u32,
}

impl PieceBitfield {
    // size is the number of bits required
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_vec_capacity(size)];
        Self { data, size }
    }

    /// Build a bitfield from the raw bytes of a wire `Bitfield` message.
    /// Missing bytes are treated as zero, extra bytes and spare bits past `size` are ignored.
    pub fn from_bytes(bytes: &[u8], size: u32) -> Self {
        let mut data = bytes.to_vec();
        data.resize(Self::required_vec_capacity(size), 0);
        let spare = data.len() as u32 * 8 - size;
        if let Some(last) = data.last_mut() {
            *last &= 0xFFu8.checked_shl(spare).unwrap_or(0);
        }
        Self { data, size }
    }

    pub fn full(size: u32) -> Self {
        let mut bitfield = Self::with_size(size);
        for i in 0..size {
            bitfield.data[i as usize / 8] |= 1 << (7 - i % 8);
        }
        bitfield
    }

    pub fn get(&self, index: PieceIdx) -> Result<bool, OutOfBounds> {
        let (byte_index, bit_index) = self.get_indices(index)?;
        Ok((self.data[byte_index] & (1 << bit_index)) > 0)
    }

    pub fn set(&mut self, index: PieceIdx) -> Result<(), OutOfBounds> {
        let (byte_index, bit_index) = self.get_indices(index)?;
        self.data[byte_index] |= 1 << bit_index;
        Ok(())
    }

    /// Like [`PieceBitfield::get`] but out of range indices read as absent.
    pub fn has_piece(&self, index: PieceIdx) -> bool {
        self.get(index).unwrap_or(false)
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn num_set(&self) -> u32 {
        self.data.iter().map(|b| b.count_ones()).sum()
    }

    pub fn num_unset(&self) -> u32 {
        self.size - self.num_set()
    }

    pub fn complete(&self) -> bool {
        self.num_set() == self.size
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Iterator over pieces that this bitfield contains
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.size)
            .map(PieceIdx::new)
            .filter(move |p| self.has_piece(*p))
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.size)
            .map(PieceIdx::new)
            .filter(move |p| !self.has_piece(*p))
    }

    // returns (byte_index, bit_index)
    fn get_indices(&self, index: PieceIdx) -> Result<(usize, usize), OutOfBounds> {
        if index.0 >= self.size {
            return Err(OutOfBounds {
                index: index.0,
                size: self.size,
            });
        }
        let byte_index = index.0 as usize / 8;
        let bit_index = 7 - index.0 as usize % 8;
        Ok((byte_index, bit_index))
    }

    fn required_vec_capacity(num_bits: u32) -> usize {
        num_bits.div_ceil(8) as usize
    }
}

impl std::fmt::Debug for PieceBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceBitfield")
            .field("bits", &self.size)
            .field("set", &self.num_set())
            .finish()
    }
}

impl AsRef<[u8]> for PieceBitfield {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
