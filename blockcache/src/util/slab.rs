use std::ops::{Index, IndexMut};

/// Index of an occupied slot in an [`EntrySlab`]. The index stays stable for
/// the whole lifetime of the slot's occupant, so it can be stored in link
/// fields the way an intrusive structure stores pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryId(u32);

impl EntryId {
    /// The null index, used to terminate chains.
    pub(crate) const NIL: EntryId = EntryId(u32::MAX);

    pub(crate) fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

/// A slot arena with a free list. Removed slots are recycled before the
/// backing vector grows.
pub(crate) struct EntrySlab<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> EntrySlab<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> EntryId {
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(value);
            idx
        } else {
            assert!(self.slots.len() < u32::MAX as usize);
            self.slots.push(Some(value));
            (self.slots.len() - 1) as u32
        };
        self.len += 1;
        EntryId(idx)
    }

    /// Vacates the slot and returns its occupant. Panics if the slot is
    /// already vacant.
    pub(crate) fn remove(&mut self, id: EntryId) -> T {
        let value = self.slots[id.0 as usize].take().expect("slot is vacant");
        self.free.push(id.0);
        self.len -= 1;
        value
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl<T> Index<EntryId> for EntrySlab<T> {
    type Output = T;

    fn index(&self, id: EntryId) -> &T {
        self.slots[id.0 as usize].as_ref().expect("slot is vacant")
    }
}

impl<T> IndexMut<EntryId> for EntrySlab<T> {
    fn index_mut(&mut self, id: EntryId) -> &mut T {
        self.slots[id.0 as usize].as_mut().expect("slot is vacant")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_recycle() {
        let mut slab = EntrySlab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);
        assert_eq!(slab[a], "a");
        assert_eq!(slab.remove(a), "a");
        assert_eq!(slab.len(), 1);

        // The vacated slot is reused.
        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab[c], "c");
        assert_eq!(slab[b], "b");
    }

    #[test]
    #[should_panic(expected = "slot is vacant")]
    fn index_vacant_slot() {
        let mut slab = EntrySlab::new();
        let a = slab.insert(1);
        slab.remove(a);
        let _ = slab[a];
    }

    #[test]
    fn nil_is_nil() {
        assert!(EntryId::NIL.is_nil());
        let mut slab = EntrySlab::new();
        assert!(!slab.insert(0).is_nil());
    }
}
