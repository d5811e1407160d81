//! The spill area allocator.

use crate::ir::Ty;
use vob::Vob;

/// The size of one allocation unit in bytes.
const WORD_SIZE: u32 = 4;

/// Tracks which 4-byte words of the spill area are in use.
///
/// Offsets are relative to the frame base and grow downwards: the slot occupying words `[i, i +
/// n)` starts at byte offset `-(4 * (i + n))`. Slots of 1, 2, and 4 words are naturally aligned;
/// larger ones are aligned to 16 bytes. The spill area grows on demand: [StackAllocator::size] is
/// the high-water mark.
#[derive(Debug, Default)]
pub struct StackAllocator {
    /// One bit per word: set if the word is in use. Words beyond the end of the [Vob] are free.
    used: Vob,
    /// The number of words ever used.
    high: usize,
}

/// How many words a slot of `nbytes` occupies. Slots bigger than 8 bytes are padded to a
/// multiple of 16 bytes so that the (negative) offset of their first byte stays aligned.
fn words_for(nbytes: u32) -> usize {
    match nbytes.div_ceil(WORD_SIZE) as usize {
        x @ (1 | 2) => x,
        x => x.next_multiple_of(4),
    }
}

fn align_for(nwords: usize) -> usize {
    nwords.min(4)
}

impl StackAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot big enough for a value of type `ty`.
    pub fn allocate(&mut self, ty: Ty) -> i32 {
        self.allocate_bytes(ty.byte_size())
    }

    /// Allocate a slot of at least `nbytes` bytes.
    ///
    /// # Panics
    ///
    /// If `nbytes` is zero.
    pub fn allocate_bytes(&mut self, nbytes: u32) -> i32 {
        assert!(nbytes > 0);
        let nwords = words_for(nbytes);
        let align = align_for(nwords);
        let mut first = 0;
        while !self.is_free(first, nwords) {
            first += align;
        }
        if self.used.len() < first + nwords {
            self.used.resize(first + nwords, false);
        }
        for i in first..first + nwords {
            self.used.set(i, true);
        }
        self.high = self.high.max(first + nwords);
        offset_for(first, nwords)
    }

    /// Release the slot at `offset` previously returned for a `nbytes` allocation.
    ///
    /// # Panics
    ///
    /// If any part of the slot is not currently allocated.
    pub fn free(&mut self, offset: i32, nbytes: u32) {
        let nwords = words_for(nbytes);
        assert!(offset < 0 && offset % 4 == 0);
        let end = usize::try_from(-offset / 4).unwrap();
        let first = end - nwords;
        for i in first..end {
            assert!(self.used.get(i) == Some(true), "Freeing an unallocated slot");
            self.used.set(i, false);
        }
    }

    /// The size of the spill area in bytes.
    pub fn size(&self) -> u32 {
        u32::try_from(self.high).unwrap() * WORD_SIZE
    }

    fn is_free(&self, first: usize, nwords: usize) -> bool {
        (first..first + nwords).all(|i| self.used.get(i) != Some(true))
    }
}

fn offset_for(first: usize, nwords: usize) -> i32 {
    -(i32::try_from(first + nwords).unwrap() * WORD_SIZE as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate() {
        let mut s = StackAllocator::new();
        assert_eq!(s.allocate(Ty::I32), -4);
        // The 8 byte slot must be 8 byte aligned, so word 1 is skipped.
        assert_eq!(s.allocate(Ty::I64), -16);
        // ...but a 4 byte slot can use it.
        assert_eq!(s.allocate(Ty::F32), -8);
        assert_eq!(s.allocate(Ty::V128), -32);
        assert_eq!(s.size(), 32);
        assert_eq!(s.allocate_bytes(20), -64);
        assert_eq!(s.size(), 64);
    }

    #[test]
    fn free_and_reuse() {
        let mut s = StackAllocator::new();
        let a = s.allocate(Ty::I64);
        let b = s.allocate(Ty::I64);
        assert_eq!((a, b), (-8, -16));
        s.free(a, 8);
        assert_eq!(s.allocate(Ty::I32), -4);
        assert_eq!(s.allocate(Ty::I32), -8);
        assert_eq!(s.allocate(Ty::I64), -24);
        s.free(b, 8);
        assert_eq!(s.allocate(Ty::V128), -48);
        assert_eq!(s.allocate(Ty::I64), -16);
        assert_eq!(s.size(), 48);
    }

    #[test]
    fn no_overlap() {
        let mut s = StackAllocator::new();
        let mut slots = Vec::new();
        for (i, ty) in [Ty::I32, Ty::V128, Ty::I64, Ty::I32, Ty::F64, Ty::V128, Ty::I32]
            .into_iter()
            .enumerate()
        {
            let off = s.allocate(ty);
            assert!(off < 0 && off % 4 == 0);
            assert_eq!(off % ty.byte_size() as i32, 0);
            slots.push((off, ty.byte_size() as i32));
            if i == 2 {
                let (off, size) = slots.remove(0);
                s.free(off, size as u32);
            }
        }
        for (i, (a, asz)) in slots.iter().enumerate() {
            for (b, bsz) in &slots[i + 1..] {
                // Slots are `[off, off + size)`.
                assert!(a + asz <= *b || b + bsz <= *a, "{a} and {b} overlap");
            }
        }
    }

    #[test]
    #[should_panic(expected = "Freeing an unallocated slot")]
    fn double_free() {
        let mut s = StackAllocator::new();
        let a = s.allocate(Ty::I32);
        s.free(a, 4);
        s.free(a, 4);
    }
}
