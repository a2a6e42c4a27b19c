//! The swap file: a fixed-size page store backing large edit buffers.
//!
//! Pages are concatenated fixed-size blocks with no header; page `i` lives at
//! byte offset `i * page_size`. The allocator hands out page indices from a
//! bounded free-list, extending the file when the list is empty. Once the
//! free-list reaches capacity, a release triggers a sweep: the highest live
//! pages are physically relocated into the lowest free slots and the file is
//! truncated to the packed extent. Every relocation is returned to the caller
//! so page references can be rebound; after a sweep completes, no live
//! reference may hold a stale index.
//!
//! The backing file is a temporary file, deleted when the allocator closes.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use tempfile::NamedTempFile;

use crate::error::Result;

/// The maximum number of entries the free-list holds before a release
/// triggers a sweep.
pub(crate) const FREE_LIST_CAPACITY: usize = 20;

/// The index of a page within the swap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIndex(pub u32);

/// A page relocation performed by a sweep.
///
/// The page previously at `old` now lives at `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMove {
    pub old: PageIndex,
    pub new: PageIndex,
}

pub(crate) struct SwapFile {
    /// `None` after close.
    file: Option<NamedTempFile>,
    page_size: usize,
    /// The allocation extent in pages. Every allocated page index is below
    /// this and absent from the free-list. The physical file may be shorter;
    /// reads past its end are zero-filled.
    page_count: u32,
    /// Released page indices available for reuse, kept sorted ascending.
    free: Vec<PageIndex>,
}

impl SwapFile {
    /// Create a swap file in the given directory, or the system temporary
    /// directory if `None`.
    pub fn create(dir: Option<&Path>, page_size: usize) -> Result<Self> {
        let file = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        log::debug!("created swap file at {}", file.path().display());
        Ok(SwapFile {
            file: Some(file),
            page_size,
            page_count: 0,
            free: Vec::with_capacity(FREE_LIST_CAPACITY),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The current extent of the swap file, in pages.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Allocate a page, reusing a freed slot when one is available and
    /// extending the file otherwise. Performs no I/O; the physical file grows
    /// lazily on first write.
    pub fn allocate(&mut self) -> PageIndex {
        if let Some(index) = self.free.pop() {
            return index;
        }
        let index = PageIndex(self.page_count);
        self.page_count += 1;
        index
    }

    /// Return a page to the free-list. When the free-list is full, sweeps the
    /// file and returns the relocations performed; callers must rebind every
    /// reference to a moved page before touching the swap file again.
    pub fn release(&mut self, index: PageIndex) -> Result<Vec<PageMove>> {
        debug_assert!(index.0 < self.page_count);
        debug_assert!(!self.free.contains(&index));
        let pos = self.free.partition_point(|&p| p < index);
        self.free.insert(pos, index);
        if self.free.len() >= FREE_LIST_CAPACITY {
            self.sweep()
        } else {
            Ok(Vec::new())
        }
    }

    /// Pack live pages into the lowest slots and truncate the file.
    ///
    /// Repeatedly moves the highest live page into the lowest free slot until
    /// the free-list is drained. Free slots already at the top of the extent
    /// are dropped without a copy.
    fn sweep(&mut self) -> Result<Vec<PageMove>> {
        let mut moves = Vec::new();
        let mut page = vec![0u8; self.page_size];
        loop {
            // Drop trailing free slots; they need no relocation.
            while self
                .free
                .last()
                .map_or(false, |&p| p.0 + 1 == self.page_count)
            {
                self.free.pop();
                self.page_count -= 1;
            }
            if self.free.is_empty() {
                break;
            }
            let dst = self.free.remove(0);
            let src = PageIndex(self.page_count - 1);
            self.read(src, 0, &mut page)?;
            self.write(dst, 0, &page)?;
            self.page_count -= 1;
            moves.push(PageMove { old: src, new: dst });
        }
        let len = self.page_count as u64 * self.page_size as u64;
        let file = self.file()?;
        if file.metadata()?.len() > len {
            file.set_len(len)?;
        }
        log::trace!(
            "swap sweep: {} relocations, extent now {} pages",
            moves.len(),
            self.page_count
        );
        Ok(moves)
    }

    /// Read `buf.len()` bytes starting at `offset` within page `index`.
    /// Reads past the physical end of the file are zero-filled.
    pub fn read(&mut self, index: PageIndex, offset: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset + buf.len() <= self.page_size);
        let pos = index.0 as u64 * self.page_size as u64 + offset as u64;
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Write `bytes` starting at `offset` within page `index`, extending the
    /// physical file as needed.
    pub fn write(&mut self, index: PageIndex, offset: usize, bytes: &[u8]) -> Result<()> {
        debug_assert!(offset + bytes.len() <= self.page_size);
        debug_assert!(index.0 < self.page_count);
        let pos = index.0 as u64 * self.page_size as u64 + offset as u64;
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Delete the backing file. The allocator is considered closed whether or
    /// not deletion succeeds.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => Ok(file.close()?),
            None => Ok(()),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file.as_file_mut()),
            None => Err(crate::Error::SourceUnavailable),
        }
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to delete swap file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PageIndex, PageMove, SwapFile, FREE_LIST_CAPACITY};
    use anyhow::Result;

    fn new_swap() -> Result<SwapFile> {
        Ok(SwapFile::create(None, 64)?)
    }

    #[test]
    fn allocate_extends_then_reuses() -> Result<()> {
        let mut swap = new_swap()?;
        assert_eq!(swap.allocate(), PageIndex(0));
        assert_eq!(swap.allocate(), PageIndex(1));
        assert_eq!(swap.allocate(), PageIndex(2));

        let moves = swap.release(PageIndex(1))?;
        assert!(moves.is_empty());
        assert_eq!(swap.allocate(), PageIndex(1));
        assert_eq!(swap.allocate(), PageIndex(3));
        Ok(())
    }

    #[test]
    fn read_past_extent_is_zero_filled() -> Result<()> {
        let mut swap = new_swap()?;
        let p = swap.allocate();
        let mut buf = [0xffu8; 64];
        swap.read(p, 0, &mut buf)?;
        assert_eq!(buf, [0u8; 64]);

        // A partial write zero-fills the remainder of the page.
        swap.write(p, 0, &[1, 2, 3])?;
        swap.read(p, 0, &mut buf)?;
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(&buf[3..], &[0u8; 61]);
        Ok(())
    }

    #[test]
    fn page_round_trip() -> Result<()> {
        let mut swap = new_swap()?;
        let a = swap.allocate();
        let b = swap.allocate();
        swap.write(a, 0, &[0xaa; 64])?;
        swap.write(b, 10, &[0xbb; 16])?;

        let mut buf = [0u8; 64];
        swap.read(a, 0, &mut buf)?;
        assert_eq!(buf, [0xaa; 64]);
        swap.read(b, 0, &mut buf)?;
        assert_eq!(&buf[10..26], &[0xbb; 16]);
        assert_eq!(&buf[..10], &[0u8; 10]);
        Ok(())
    }

    #[test]
    fn sweep_relocates_and_truncates() -> Result<()> {
        let mut swap = new_swap()?;
        let pages: Vec<_> = (0..FREE_LIST_CAPACITY as u32 + 2)
            .map(|_| swap.allocate())
            .collect();
        for &p in &pages {
            swap.write(p, 0, &[p.0 as u8; 64])?;
        }

        // Free every page except the top two; the final release fills the
        // free-list and triggers the sweep.
        let mut moves = Vec::new();
        for &p in &pages[..FREE_LIST_CAPACITY] {
            moves.extend(swap.release(p)?);
        }
        assert_eq!(
            moves,
            vec![
                PageMove {
                    old: PageIndex(21),
                    new: PageIndex(0)
                },
                PageMove {
                    old: PageIndex(20),
                    new: PageIndex(1)
                },
            ]
        );
        assert_eq!(swap.page_count(), 2);
        assert_eq!(swap.free_len(), 0);

        // Relocated pages kept their contents.
        let mut buf = [0u8; 64];
        swap.read(PageIndex(0), 0, &mut buf)?;
        assert_eq!(buf, [21u8; 64]);
        swap.read(PageIndex(1), 0, &mut buf)?;
        assert_eq!(buf, [20u8; 64]);
        Ok(())
    }

    #[test]
    fn sweep_drops_trailing_free_slots_without_copying() -> Result<()> {
        let mut swap = new_swap()?;
        let pages: Vec<_> = (0..FREE_LIST_CAPACITY as u32)
            .map(|_| swap.allocate())
            .collect();
        // Releasing every page top-down leaves nothing to relocate.
        let mut moves = Vec::new();
        for &p in pages.iter().rev() {
            moves.extend(swap.release(p)?);
        }
        assert!(moves.is_empty());
        assert_eq!(swap.page_count(), 0);
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let mut swap = new_swap()?;
        swap.close()?;
        swap.close()?;
        Ok(())
    }
}
