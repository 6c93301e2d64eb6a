//! Outstanding-slot bitmap
//!
//! Marks the logical slots of a job that currently have a write/read-back
//! cycle in flight. Only verify-mode jobs carry one.

/// Fixed-size bit array over `len` slots
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: u64,
}

impl SlotBitmap {
    pub fn new(len: u64) -> Self {
        let words = len.div_ceil(64) as usize;
        SlotBitmap {
            words: vec![0; words],
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, slot: u64) -> bool {
        debug_assert!(slot < self.len);
        self.words[(slot / 64) as usize] & (1u64 << (slot % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, slot: u64) {
        debug_assert!(slot < self.len);
        self.words[(slot / 64) as usize] |= 1u64 << (slot % 64);
    }

    #[inline]
    pub fn clear(&mut self, slot: u64) {
        debug_assert!(slot < self.len);
        self.words[(slot / 64) as usize] &= !(1u64 << (slot % 64));
    }

    /// Index of the lowest clear slot, if any
    pub fn first_clear(&self) -> Option<u64> {
        for (i, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                let slot = i as u64 * 64 + (!word).trailing_zeros() as u64;
                return (slot < self.len).then_some(slot);
            }
        }
        None
    }

    /// Number of set slots
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear() {
        let mut bitmap = SlotBitmap::new(130);
        assert!(!bitmap.get(129));
        bitmap.set(129);
        bitmap.set(0);
        assert!(bitmap.get(129));
        assert!(bitmap.get(0));
        assert_eq!(bitmap.count_ones(), 2);
        bitmap.clear(129);
        assert!(!bitmap.get(129));
        assert_eq!(bitmap.count_ones(), 1);
    }

    #[test]
    fn test_first_clear() {
        let mut bitmap = SlotBitmap::new(3);
        assert_eq!(bitmap.first_clear(), Some(0));
        bitmap.set(0);
        bitmap.set(1);
        assert_eq!(bitmap.first_clear(), Some(2));
        bitmap.set(2);
        assert_eq!(bitmap.first_clear(), None);
    }

    #[test]
    fn test_first_clear_across_words() {
        let mut bitmap = SlotBitmap::new(70);
        for slot in 0..65 {
            bitmap.set(slot);
        }
        assert_eq!(bitmap.first_clear(), Some(65));
    }

    #[test]
    fn test_full_word_boundary() {
        let mut bitmap = SlotBitmap::new(64);
        for slot in 0..64 {
            bitmap.set(slot);
        }
        assert_eq!(bitmap.first_clear(), None);
        assert_eq!(bitmap.count_ones(), 64);
    }
}
