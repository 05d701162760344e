//! Track which attributes of an entity were modified since it was last persisted.
//!
//! Indices refer to positions in the entity class' attribute list.

/// A compact bitset of "attribute is dirty" flags for indices `0..len`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldsSet {
    len: usize,
    bits: Box<[u64]>,
}

impl FieldsSet {
    /// Create an empty (all-clean) set for `len` attributes.
    #[must_use]
    pub fn empty(len: usize) -> Self {
        let words = len.div_ceil(64);
        Self {
            len,
            bits: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Number of attributes represented by this set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if `len == 0`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flag an attribute index. Out-of-range indices are ignored.
    pub fn set(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        if let Some(w) = self.bits.get_mut(idx / 64) {
            *w |= 1u64 << (idx % 64);
        }
    }

    /// Unflag an attribute index.
    pub fn clear(&mut self, idx: usize) {
        if let Some(w) = self.bits.get_mut(idx / 64) {
            *w &= !(1u64 << (idx % 64));
        }
    }

    /// Unflag every attribute.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    #[must_use]
    pub fn is_set(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.bits
            .get(idx / 64)
            .is_some_and(|w| (w & (1u64 << (idx % 64))) != 0)
    }

    /// True if at least one attribute is flagged.
    #[must_use]
    pub fn any(&self) -> bool {
        self.bits.iter().any(|w| *w != 0)
    }

    /// Iterate over the flagged indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|idx| self.is_set(*idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_has_nothing_flagged() {
        let set = FieldsSet::empty(3);
        assert_eq!(set.len(), 3);
        assert!(!set.any());
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn test_set_and_clear() {
        let mut set = FieldsSet::empty(70);
        set.set(1);
        set.set(65);
        assert!(set.is_set(1));
        assert!(set.is_set(65));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 65]);

        set.clear(1);
        assert!(!set.is_set(1));
        assert!(set.any());

        set.clear_all();
        assert!(!set.any());
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut set = FieldsSet::empty(2);
        set.set(5);
        assert!(!set.any());
        assert!(!set.is_set(5));
    }

    #[test]
    fn test_zero_len() {
        let set = FieldsSet::empty(0);
        assert!(set.is_empty());
        assert!(!set.any());
    }
}
