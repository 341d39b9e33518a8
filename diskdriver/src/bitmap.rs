use thiserror::Error;

/// Allocation state of a single block as recorded by its bit.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    #[error("bit {index} out of range for bitmap of {num_bits} bits")]
    OutOfRange { index: usize, num_bits: usize },
    #[error("bitmap of {num_bits} bits needs {needed} bytes, buffer holds {len}")]
    BufferTooSmall {
        num_bits: usize,
        needed: usize,
        len: usize,
    },
}

/// Number of bytes needed to hold `num_bits` bits.
pub fn bytes_for(num_bits: usize) -> usize {
    num_bits.div_ceil(8)
}

/// A packed bit-per-block map over any byte buffer. Bit `i` lives in byte
/// `i >> 3` at position `i & 7`, least significant bit first. A clear bit
/// means the block is free, a set bit means it holds data.
///
/// The bitmap knows nothing about where its bytes come from, so the same type
/// serves an owned `Vec<u8>` in tests and a slice of the mapped disk image.
pub struct Bitmap<B> {
    entries: B,
    num_bits: usize,
}

impl<B: AsRef<[u8]>> Bitmap<B> {
    pub fn new(entries: B, num_bits: usize) -> Result<Self, BitmapError> {
        let needed = bytes_for(num_bits);
        let len = entries.as_ref().len();
        if len < needed {
            return Err(BitmapError::BufferTooSmall {
                num_bits,
                needed,
                len,
            });
        }
        Ok(Self { entries, num_bits })
    }

    /// The number of bits tracked, which is also one past the highest index.
    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Tests the bit at `index` directly.
    pub fn state(&self, index: usize) -> Result<State, BitmapError> {
        self.check(index)?;
        Ok(self.bit(index))
    }

    /// Scans forward from `start` (inclusive) and returns the first index whose
    /// bit matches `desired`, or `None` if the scan reaches the end.
    pub fn get(&self, start: usize, desired: State) -> Option<usize> {
        let bytes = self.entries.as_ref();
        // A byte with every bit in the opposite state cannot hold a match.
        let skip = match desired {
            State::Free => 0xff,
            State::Used => 0x00,
        };

        let mut index = start;
        while index < self.num_bits {
            if index & 7 == 0 && bytes[index >> 3] == skip {
                index += 8;
                continue;
            }
            if self.bit(index) == desired {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Counts the bits in `state`. Padding bits past `len()` are ignored.
    pub fn count(&self, state: State) -> usize {
        let bytes = &self.entries.as_ref()[..bytes_for(self.num_bits)];
        let mut used: usize = bytes.iter().map(|b| b.count_ones() as usize).sum();
        let tail = self.num_bits & 7;
        if tail != 0 {
            if let Some(last) = bytes.last() {
                used -= (last >> tail).count_ones() as usize;
            }
        }
        match state {
            State::Used => used,
            State::Free => self.num_bits - used,
        }
    }

    fn check(&self, index: usize) -> Result<(), BitmapError> {
        if index >= self.num_bits {
            return Err(BitmapError::OutOfRange {
                index,
                num_bits: self.num_bits,
            });
        }
        Ok(())
    }

    fn bit(&self, index: usize) -> State {
        let byte = self.entries.as_ref()[index >> 3];
        match (byte >> (index & 7)) & 0b1 {
            0 => State::Free,
            _ => State::Used,
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bitmap<B> {
    /// Sets the bit at `index` to `state` regardless of its current value.
    /// Out of range indexes leave the bitmap untouched.
    pub fn set(&mut self, index: usize, state: State) -> Result<(), BitmapError> {
        self.check(index)?;
        let mask = 0b1_u8 << (index & 7);
        let byte = &mut self.entries.as_mut()[index >> 3];
        match state {
            State::Free => *byte &= !mask,
            State::Used => *byte |= mask,
        }
        Ok(())
    }

    /// Marks every tracked bit free.
    pub fn clear(&mut self) {
        let len = bytes_for(self.num_bits);
        self.entries.as_mut()[..len].fill(0);
    }
}
