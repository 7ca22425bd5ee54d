//! Per-timestep completion bitmap.
//!
//! One bit per timestep, packed into 32-bit words. Padding bits above `len` always stay zero so
//! the words can be persisted and compared without masking.

/// Number of 32-bit words needed to store `n` bits.
pub const fn words_for_bits(n: usize) -> usize {
    n.div_ceil(32)
}

/// Completion bitmap for one simulation group on one (field, client rank).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepBitmap {
    words: Vec<u32>,
    len: usize,
}

impl StepBitmap {
    /// Returns an empty bitmap able to track `len` timesteps.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; words_for_bits(len)],
            len,
        }
    }

    /// Rebuilds a bitmap from persisted words.
    ///
    /// Returns `None` if the word count does not match `len` or a padding bit is set.
    pub fn from_words(words: Vec<u32>, len: usize) -> Option<Self> {
        if words.len() != words_for_bits(len) {
            return None;
        }
        let bitmap = Self { words, len };
        if bitmap.last_word_padding() != 0 {
            return None;
        }
        Some(bitmap)
    }

    /// Number of timesteps tracked.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing words, lowest timestep first.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Returns whether the bit for `step` is set.
    ///
    /// Panics if `step >= len`.
    #[inline]
    pub fn test(&self, step: usize) -> bool {
        assert!(step < self.len, "step {} out of range {}", step, self.len);
        self.words[step / 32] & (1 << (step % 32)) != 0
    }

    /// Sets the bit for `step`, returning `true` if it was previously clear.
    ///
    /// Panics if `step >= len`.
    #[inline]
    pub fn set(&mut self, step: usize) -> bool {
        assert!(step < self.len, "step {} out of range {}", step, self.len);
        let word = &mut self.words[step / 32];
        let mask = 1 << (step % 32);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns whether every timestep has been seen.
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    fn last_word_padding(&self) -> u32 {
        let remaining = self.len % 32;
        match (self.words.last(), remaining) {
            (Some(last), r) if r != 0 => last & !((1u32 << r) - 1),
            _ => 0,
        }
    }
}
