//! Object number bitmap
//!
//! One bit per object number. Used for the set of locally present objects
//! and for the copy-on-write "already copied" flags of a file handle.

/// Bitmap indexed by object number
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectBitmap {
    data: Vec<u8>,
    len: u64,
}

impl ObjectBitmap {
    /// Create a bitmap of `len` cleared bits
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            data: vec![0u8; len.div_ceil(8) as usize],
            len,
        }
    }

    /// Number of addressable bits
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether a bit is set; bits beyond `len` read as cleared
    #[must_use]
    pub fn get(&self, bit: u64) -> bool {
        if bit >= self.len {
            return false;
        }
        Self::is_set_in_slice(&self.data, bit)
    }

    /// Set a bit, growing the bitmap if needed
    pub fn set(&mut self, bit: u64) {
        if bit >= self.len {
            self.grow(bit + 1);
        }
        Self::set_in_slice(&mut self.data, bit);
    }

    /// Set a bit only if it is within the current length
    ///
    /// Returns false if the bit is out of range.
    pub fn set_within(&mut self, bit: u64) -> bool {
        if bit >= self.len {
            return false;
        }
        Self::set_in_slice(&mut self.data, bit);
        true
    }

    /// Clear a bit; out of range bits are already clear
    pub fn clear(&mut self, bit: u64) {
        if bit < self.len {
            Self::clear_in_slice(&mut self.data, bit);
        }
    }

    /// Number of set bits
    #[must_use]
    pub fn count_ones(&self) -> u64 {
        self.data.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// Iterate over set bit indices in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(|&bit| Self::is_set_in_slice(&self.data, bit))
    }

    /// Highest set bit
    #[must_use]
    pub fn last_one(&self) -> Option<u64> {
        (0..self.len)
            .rev()
            .find(|&bit| Self::is_set_in_slice(&self.data, bit))
    }

    /// Raw bytes, least significant bit first
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn grow(&mut self, len: u64) {
        self.data.resize(len.div_ceil(8) as usize, 0);
        self.len = len;
    }

    fn is_set_in_slice(data: &[u8], bit: u64) -> bool {
        let byte_idx = (bit / 8) as usize;
        let bit_idx = (bit % 8) as u8;
        data[byte_idx] & (1 << bit_idx) != 0
    }

    fn set_in_slice(data: &mut [u8], bit: u64) {
        let byte_idx = (bit / 8) as usize;
        let bit_idx = (bit % 8) as u8;
        data[byte_idx] |= 1 << bit_idx;
    }

    fn clear_in_slice(data: &mut [u8], bit: u64) {
        let byte_idx = (bit / 8) as usize;
        let bit_idx = (bit % 8) as u8;
        data[byte_idx] &= !(1 << bit_idx);
    }
}

impl FromIterator<u64> for ObjectBitmap {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut bitmap = Self::default();
        for bit in iter {
            bitmap.set(bit);
        }
        bitmap
    }
}
