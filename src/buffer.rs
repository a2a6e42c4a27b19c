//! The edit buffer: a growable, paged byte space backing memory segments.
//!
//! The buffer is an append-only logical address space carved into page-sized
//! slots. New slots live on the heap until the buffer's resident heap volume
//! reaches the spill threshold; past that point, new slots take pages from
//! the swap file so arbitrarily large edits stay within bounded memory.
//!
//! Each slot tracks how many of its bytes are referenced by live segments.
//! When a removal drops a slot's live count to zero, its storage is released
//! (swap pages back to the allocator's free-list) and the slot becomes a
//! hole; its content is undefined until the page is reallocated. Sweeps of
//! the swap file hand back relocations which must be applied to every buffer
//! via [`EditBuffer::apply_page_moves`].

use crate::{
    error::Result,
    swap::{PageIndex, PageMove, SwapFile},
};

enum Slot {
    Heap(Box<[u8]>),
    Swap(PageIndex),
    /// Storage released; reads yield zeroes.
    Released,
}

pub(crate) struct EditBuffer {
    page_size: usize,
    spill_threshold: usize,
    /// The append cursor: the logical end of the buffer.
    len: u64,
    /// Resident heap volume, in bytes.
    heap_bytes: usize,
    slots: Vec<(Slot, u32)>,
}

impl EditBuffer {
    pub fn new(page_size: usize, spill_threshold: usize) -> Self {
        EditBuffer {
            page_size,
            spill_threshold,
            len: 0,
            heap_bytes: 0,
            slots: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }

    /// Append `bytes` at the end of the buffer, spilling to swap pages past
    /// the threshold. Returns the offset the bytes were written at.
    pub fn append(&mut self, swap: &mut SwapFile, bytes: &[u8]) -> Result<u64> {
        let offset = self.reserve(swap, bytes.len() as u64)?;
        self.write(swap, offset, bytes)?;
        Ok(offset)
    }

    /// Append `length` zero bytes. Returns the offset of the reserved run.
    pub fn append_zeroed(&mut self, swap: &mut SwapFile, length: u64) -> Result<u64> {
        let offset = self.reserve(swap, length)?;
        // Heap slots start zeroed; swap slots may hold stale bytes from a
        // previous allocation and must be cleared explicitly.
        let zeroes = vec![0u8; self.page_size];
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = ((self.page_size - in_page) as u64).min(end - pos) as usize;
            let slot = (pos / self.page_size as u64) as usize;
            if let (Slot::Swap(index), _) = &self.slots[slot] {
                swap.write(*index, in_page, &zeroes[..chunk])?;
            }
            pos += chunk as u64;
        }
        Ok(offset)
    }

    /// Extend the buffer by `length` bytes, materializing slots, and mark the
    /// new run live. Content of the run is unspecified until written.
    fn reserve(&mut self, swap: &mut SwapFile, length: u64) -> Result<u64> {
        // A released tail slot cannot be written into; round the cursor up to
        // the next slot boundary so the run lands on live storage.
        let slot = (self.len / self.page_size as u64) as usize;
        if slot < self.slots.len() {
            if let (Slot::Released, _) = &self.slots[slot] {
                self.len = (slot as u64 + 1) * self.page_size as u64;
            }
        }

        let offset = self.len;
        let end = offset + length;
        while (self.slots.len() as u64) * (self.page_size as u64) < end {
            let slot = if self.heap_bytes < self.spill_threshold {
                self.heap_bytes += self.page_size;
                Slot::Heap(vec![0u8; self.page_size].into_boxed_slice())
            } else {
                Slot::Swap(swap.allocate())
            };
            self.slots.push((slot, 0));
        }

        // Mark the run live, slot by slot.
        let mut pos = offset;
        while pos < end {
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = ((self.page_size - in_page) as u64).min(end - pos) as u32;
            let slot = (pos / self.page_size as u64) as usize;
            self.slots[slot].1 += chunk;
            pos += chunk as u64;
        }
        self.len = end;
        Ok(offset)
    }

    /// Overwrite live bytes at `offset`.
    pub fn write(&mut self, swap: &mut SwapFile, offset: u64, bytes: &[u8]) -> Result<()> {
        debug_assert!(offset + bytes.len() as u64 <= self.len);
        let mut pos = offset;
        let mut written = 0;
        while written < bytes.len() {
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = (self.page_size - in_page).min(bytes.len() - written);
            let slot = (pos / self.page_size as u64) as usize;
            match &mut self.slots[slot] {
                (Slot::Heap(page), _) => {
                    page[in_page..in_page + chunk].copy_from_slice(&bytes[written..written + chunk]);
                }
                (Slot::Swap(index), _) => {
                    swap.write(*index, in_page, &bytes[written..written + chunk])?;
                }
                (Slot::Released, _) => debug_assert!(false, "write into released slot"),
            }
            pos += chunk as u64;
            written += chunk;
        }
        Ok(())
    }

    /// Read bytes at `offset` into `buf`. Released slots read as zeroes.
    pub fn read(&self, swap: &mut SwapFile, offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset + buf.len() as u64 <= self.len);
        let mut pos = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = (self.page_size - in_page).min(buf.len() - filled);
            let slot = (pos / self.page_size as u64) as usize;
            match &self.slots[slot] {
                (Slot::Heap(page), _) => {
                    buf[filled..filled + chunk].copy_from_slice(&page[in_page..in_page + chunk]);
                }
                (Slot::Swap(index), _) => {
                    swap.read(*index, in_page, &mut buf[filled..filled + chunk])?;
                }
                (Slot::Released, _) => buf[filled..filled + chunk].fill(0),
            }
            pos += chunk as u64;
            filled += chunk;
        }
        Ok(())
    }

    /// Drop the live marks of a byte run. Slots whose live count reaches zero
    /// release their storage; any swap-page relocations triggered by the
    /// releases are returned.
    pub fn release_range(
        &mut self,
        swap: &mut SwapFile,
        offset: u64,
        length: u64,
    ) -> Result<Vec<PageMove>> {
        debug_assert!(offset + length <= self.len);
        let mut moves = Vec::new();
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = ((self.page_size - in_page) as u64).min(end - pos) as u32;
            let slot = (pos / self.page_size as u64) as usize;
            let (storage, live) = &mut self.slots[slot];
            debug_assert!(*live >= chunk);
            *live -= chunk;
            if *live == 0 {
                match std::mem::replace(storage, Slot::Released) {
                    Slot::Heap(_) => self.heap_bytes -= self.page_size,
                    Slot::Swap(index) => moves.extend(swap.release(index)?),
                    Slot::Released => {}
                }
            }
            pos += chunk as u64;
        }
        if !moves.is_empty() {
            self.apply_page_moves(&moves);
        }
        Ok(moves)
    }

    /// Release every slot, returning the buffer to its empty state.
    pub fn reset(&mut self, swap: &mut SwapFile) -> Result<Vec<PageMove>> {
        let mut moves = Vec::new();
        for (storage, live) in &mut self.slots {
            *live = 0;
            match std::mem::replace(storage, Slot::Released) {
                Slot::Heap(_) => self.heap_bytes -= self.page_size,
                Slot::Swap(index) => moves.extend(swap.release(index)?),
                Slot::Released => {}
            }
        }
        self.slots.clear();
        self.len = 0;
        Ok(moves)
    }

    /// Rebind swap slots after a sweep of the swap file.
    pub fn apply_page_moves(&mut self, moves: &[PageMove]) {
        for m in moves {
            for (storage, _) in &mut self.slots {
                if let Slot::Swap(index) = storage {
                    if *index == m.old {
                        *index = m.new;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EditBuffer;
    use crate::swap::SwapFile;
    use anyhow::Result;

    const PAGE: usize = 64;

    fn fixture(spill_threshold: usize) -> Result<(SwapFile, EditBuffer)> {
        let swap = SwapFile::create(None, PAGE)?;
        let buffer = EditBuffer::new(PAGE, spill_threshold);
        Ok((swap, buffer))
    }

    #[test]
    fn append_read_round_trip_across_pages() -> Result<()> {
        let (mut swap, mut buffer) = fixture(usize::MAX)?;
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let offset = buffer.append(&mut swap, &data)?;
        assert_eq!(offset, 0);

        let mut out = vec![0u8; 200];
        buffer.read(&mut swap, 0, &mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn spills_to_swap_past_threshold() -> Result<()> {
        // Two heap pages allowed; everything after lands in the swap file.
        let (mut swap, mut buffer) = fixture(2 * PAGE)?;
        let data = vec![7u8; 5 * PAGE];
        buffer.append(&mut swap, &data)?;

        assert_eq!(buffer.heap_bytes(), 2 * PAGE);
        assert_eq!(swap.page_count(), 3);

        let mut out = vec![0u8; 5 * PAGE];
        buffer.read(&mut swap, 0, &mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn append_zeroed_clears_reused_swap_pages() -> Result<()> {
        let (mut swap, mut buffer) = fixture(0)?;
        let offset = buffer.append(&mut swap, &[0xff; PAGE])?;
        buffer.release_range(&mut swap, offset, PAGE as u64)?;

        // The freed page is reused and must read back as zeroes.
        let offset = buffer.append_zeroed(&mut swap, PAGE as u64)?;
        let mut out = [0xaau8; PAGE];
        buffer.read(&mut swap, offset, &mut out)?;
        assert_eq!(out, [0u8; PAGE]);
        Ok(())
    }

    #[test]
    fn release_returns_pages_and_reads_zero() -> Result<()> {
        let (mut swap, mut buffer) = fixture(0)?;
        let data = vec![3u8; 2 * PAGE];
        buffer.append(&mut swap, &data)?;
        assert_eq!(swap.page_count(), 2);

        buffer.release_range(&mut swap, 0, PAGE as u64)?;
        assert_eq!(swap.free_len(), 1);

        let mut out = vec![0xffu8; 2 * PAGE];
        buffer.read(&mut swap, 0, &mut out)?;
        assert_eq!(&out[..PAGE], &vec![0u8; PAGE][..]);
        assert_eq!(&out[PAGE..], &vec![3u8; PAGE][..]);
        Ok(())
    }

    #[test]
    fn partial_release_keeps_slot_alive() -> Result<()> {
        let (mut swap, mut buffer) = fixture(usize::MAX)?;
        buffer.append(&mut swap, &[9u8; PAGE])?;
        buffer.release_range(&mut swap, 0, 10)?;

        // 10 of the page's bytes are dead but the slot still holds the rest.
        let mut out = [0u8; PAGE];
        buffer.read(&mut swap, 0, &mut out)?;
        assert_eq!(&out[10..], &[9u8; PAGE - 10][..]);
        Ok(())
    }

    #[test]
    fn append_after_released_tail_skips_the_hole() -> Result<()> {
        let (mut swap, mut buffer) = fixture(usize::MAX)?;
        buffer.append(&mut swap, &[1u8; 10])?;
        buffer.release_range(&mut swap, 0, 10)?;

        // The tail slot is a hole; the next run starts on a fresh slot.
        let offset = buffer.append(&mut swap, &[2u8; 10])?;
        assert_eq!(offset, PAGE as u64);
        let mut out = [0u8; 10];
        buffer.read(&mut swap, offset, &mut out)?;
        assert_eq!(out, [2u8; 10]);
        Ok(())
    }
}
