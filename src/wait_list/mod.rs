//! # Wait list
//!
//! Every primitive here keeps its waiters in arrival order and needs to drop one from the middle
//! (timeouts, terminated threads) without walking the whole list.
//!
//! The list is an arena of slots linked by indices. A slot index handed out by a push stays valid
//! until that very entry is removed, so a waiter can remember where it sits and remove itself in O(1).
//! Freed slots are recycled through a free list.

use std::collections::TryReserveError;

struct Slot<Y> {
    value: Option<Y>,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct WaitList<Y> {
    slots: Vec<Slot<Y>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<Y> WaitList<Y> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends to the tail and returns the slot index.
    /// Nothing is modified if the allocation fails.
    pub fn try_push_back(&mut self, value: Y) -> Result<usize, TryReserveError> {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Slot {
                    value: Some(value),
                    prev: None,
                    next: None,
                };
                idx
            }
            None => {
                // reserve room in the free list too, so a later remove never allocates
                let need = self.slots.len() + 1;
                if self.free.capacity() < need {
                    self.free.try_reserve(need - self.free.len())?;
                }
                self.slots.try_reserve(1)?;
                self.slots.push(Slot {
                    value: Some(value),
                    prev: None,
                    next: None,
                });
                self.slots.len() - 1
            }
        };
        self.link_back(idx);
        Ok(idx)
    }

    /// Same as [WaitList::try_push_back], but aborts like any other collection on allocation failure.
    pub fn push_back(&mut self, value: Y) -> usize {
        match self.try_push_back(value) {
            Ok(idx) => idx,
            Err(_) => std::alloc::handle_alloc_error(std::alloc::Layout::new::<Slot<Y>>()),
        }
    }

    fn link_back(&mut self, idx: usize) {
        self.slots[idx].prev = self.tail;
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Unlinks the entry at `idx`, `None` if that slot is vacant.
    pub fn remove(&mut self, idx: usize) -> Option<Y> {
        let slot = self.slots.get_mut(idx)?;
        let value = slot.value.take()?;
        let (prev, next) = (slot.prev.take(), slot.next.take());
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        // capacity was reserved on push
        self.free.push(idx);
        Some(value)
    }

    pub fn front(&self) -> Option<usize> {
        self.head
    }

    pub fn pop_front(&mut self) -> Option<Y> {
        self.remove(self.head?)
    }

    pub fn get(&self, idx: usize) -> Option<&Y> {
        self.slots.get(idx)?.value.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Y> {
        self.slots.get_mut(idx)?.value.as_mut()
    }

    /// Slot index of the oldest entry matching `pred`.
    pub fn position(&self, mut pred: impl FnMut(&Y) -> bool) -> Option<usize> {
        self.iter().find(|(_, y)| pred(y)).map(|(idx, _)| idx)
    }

    /// Oldest first, together with the slot indices.
    pub fn iter(&self) -> Iter<'_, Y> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

impl<Y> Default for WaitList<Y> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, Y> {
    list: &'a WaitList<Y>,
    cursor: Option<usize>,
}

impl<'a, Y> Iterator for Iter<'a, Y> {
    type Item = (usize, &'a Y);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let slot = &self.list.slots[idx];
        self.cursor = slot.next;
        slot.value.as_ref().map(|y| (idx, y))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn values(list: &WaitList<u32>) -> Vec<u32> {
        list.iter().map(|(_, y)| *y).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut list = WaitList::new();
        for i in 0..4 {
            list.push_back(i);
        }
        assert_eq!(values(&list), [0, 1, 2, 3]);
        assert_eq!(list.pop_front(), Some(0));
        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_from_the_middle() {
        let mut list = WaitList::new();
        let a = list.push_back(1);
        let b = list.push_back(2);
        let c = list.push_back(3);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(values(&list), [1, 3]);
        // the slot is vacant now
        assert_eq!(list.remove(b), None);

        assert_eq!(list.remove(c), Some(3));
        assert_eq!(list.remove(a), Some(1));
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut list = WaitList::new();
        let a = list.push_back(1);
        list.push_back(2);
        list.remove(a);
        let c = list.push_back(3);
        // the vacant slot is reused, but the order is still by arrival
        assert_eq!(a, c);
        assert_eq!(values(&list), [2, 3]);
        assert_eq!(list.position(|y| *y == 3), Some(c));
    }
}
