//! Per-record bit vector carried by record locks.

use smallvec::SmallVec;

use crate::types::HeapNo;

/// One bit per heap number on a page. Grows on demand.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeapBitmap {
    words: SmallVec<[u64; 2]>,
}

impl HeapBitmap {
    /// Empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap with a single bit set.
    pub fn with_bit(heap: HeapNo) -> Self {
        let mut bitmap = Self::new();
        bitmap.set(heap);
        bitmap
    }

    #[inline]
    fn split(heap: HeapNo) -> (usize, u64) {
        let n = heap.0 as usize;
        (n / 64, 1u64 << (n % 64))
    }

    /// Sets the bit. Returns true if it was previously clear.
    pub fn set(&mut self, heap: HeapNo) -> bool {
        let (word, mask) = Self::split(heap);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    /// Clears the bit. Returns true if it was previously set.
    pub fn clear(&mut self, heap: HeapNo) -> bool {
        let (word, mask) = Self::split(heap);
        match self.words.get_mut(word) {
            Some(w) if *w & mask != 0 => {
                *w &= !mask;
                true
            }
            _ => false,
        }
    }

    /// Tests the bit.
    #[inline]
    pub fn get(&self, heap: HeapNo) -> bool {
        let (word, mask) = Self::split(heap);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Clears every bit.
    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest set heap number, if any.
    pub fn first_set(&self) -> Option<HeapNo> {
        self.iter().next()
    }

    /// Iterates set heap numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = HeapNo> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros();
                rest &= rest - 1;
                Some(HeapNo((i * 64 + bit as usize) as u16))
            })
        })
    }
}

impl std::fmt::Debug for HeapBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter().map(|h| h.0)).finish()
    }
}
