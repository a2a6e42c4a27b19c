//! The document façade: byte-level edits over a segment list.
//!
//! A document is a mutable sequence of segments over one data source plus an
//! edit buffer for written bytes. Edits split the list at the affected
//! boundaries and splice segments in or out, so each operation costs time
//! proportional to the edit, never to the file. Every mutation either fully
//! applies or, on a failed precondition, leaves the document untouched.

use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use tempfile::NamedTempFile;

use crate::{
    error::Result,
    repository::{Shared, SourceBacking},
    segment::{Segment, SegmentList, StoreRef},
    swap::PageMove,
    Error,
};

/// Copy granularity for save streaming.
const SAVE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Removed,
    Replaced,
    ByteSet,
    Cleared,
    Saved,
}

/// Describes a completed mutation: the data-changed notification, returned
/// as a value instead of pushed through listeners. `page_moves` carries any
/// swap-page relocations a sweep performed during the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub position: u64,
    pub length: u64,
    pub page_moves: Vec<PageMove>,
}

impl Change {
    fn new(kind: ChangeKind, position: u64, length: u64) -> Self {
        Change {
            kind,
            position,
            length,
            page_moves: Vec::new(),
        }
    }
}

pub struct Document {
    shared: Rc<RefCell<Shared>>,
    /// Key of the bound source in the repository.
    source: usize,
    /// Key of this document's own edit buffer.
    buffer: usize,
    segments: SegmentList,
    data_size: u64,
    disposed: bool,
}

impl Document {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        source: usize,
        buffer: usize,
        initial: (StoreRef, u64),
    ) -> Self {
        let (store, len) = initial;
        let mut segments = SegmentList::new();
        if len > 0 {
            segments.insert_at(
                0,
                Segment {
                    store,
                    offset: 0,
                    length: len,
                },
            );
        }
        Document {
            shared,
            source,
            buffer,
            segments,
            data_size: len,
            disposed: false,
        }
    }

    /// The document's logical size in bytes.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Snapshot of the current segment structure.
    pub fn segments(&self) -> Vec<Segment> {
        self.segments.iter().copied().collect()
    }

    /// Read the byte at `position`.
    pub fn get_byte(&self, position: u64) -> Result<u8> {
        let mut byte = [0u8];
        self.read(position, &mut byte)?;
        Ok(byte[0])
    }

    /// Read `buf.len()` bytes starting at `position`.
    pub fn read(&self, position: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        self.check_range(position, buf.len() as u64)?;
        let mut shared = self.shared.borrow_mut();
        let mut pos = position;
        let mut filled = 0;
        while filled < buf.len() {
            let (key, inner) = self.segments.locate(pos);
            let segment = self.segments.segment(key);
            let chunk = ((segment.length - inner) as usize).min(buf.len() - filled);
            shared.read_store(
                segment.store,
                segment.offset + inner,
                &mut buf[filled..filled + chunk],
            )?;
            pos += chunk as u64;
            filled += chunk;
        }
        Ok(())
    }

    /// The full content as a byte vector.
    pub fn content_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.data_size as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Overwrite the byte at `position`.
    ///
    /// A byte inside an owned memory segment is mutated in place; a byte
    /// backed by the file (or a shared source) is isolated by splitting and
    /// replaced with a one-byte memory segment.
    pub fn set_byte(&mut self, position: u64, value: u8) -> Result<Change> {
        self.ensure_live()?;
        if position >= self.data_size {
            return Err(Error::out_of_range(position, 1, self.data_size));
        }
        let (key, inner) = self.segments.locate(position);
        let segment = *self.segments.segment(key);
        if let StoreRef::Memory { buffer, owned: true } = segment.store {
            self.shared
                .borrow_mut()
                .buffer_write(buffer, segment.offset + inner, &[value])?;
            return Ok(Change::new(ChangeKind::ByteSet, position, 1));
        }

        let offset = self.shared.borrow_mut().buffer_append(self.buffer, &[value])?;
        self.segments.split_at(position);
        self.segments.split_at(position + 1);
        let removed = self.segments.remove_range(position, 1);
        self.segments.insert_at(
            position,
            Segment {
                store: StoreRef::Memory {
                    buffer: self.buffer,
                    owned: true,
                },
                offset,
                length: 1,
            },
        );
        let mut change = Change::new(ChangeKind::ByteSet, position, 1);
        change.page_moves = self.release_removed(&removed)?;
        Ok(change)
    }

    /// Insert `bytes` at `position`, shifting everything after it.
    pub fn insert(&mut self, position: u64, bytes: &[u8]) -> Result<Change> {
        self.ensure_live()?;
        if position > self.data_size {
            return Err(Error::out_of_range(position, bytes.len() as u64, self.data_size));
        }
        if bytes.is_empty() {
            return Ok(Change::new(ChangeKind::Inserted, position, 0));
        }
        let offset = self.shared.borrow_mut().buffer_append(self.buffer, bytes)?;
        self.splice_in(position, offset, bytes.len() as u64);
        Ok(Change::new(ChangeKind::Inserted, position, bytes.len() as u64))
    }

    /// Insert `length` zero bytes at `position`.
    pub fn insert_zeroed(&mut self, position: u64, length: u64) -> Result<Change> {
        self.ensure_live()?;
        if position > self.data_size {
            return Err(Error::out_of_range(position, length, self.data_size));
        }
        if length == 0 {
            return Ok(Change::new(ChangeKind::Inserted, position, 0));
        }
        let offset = self
            .shared
            .borrow_mut()
            .buffer_append_zeroed(self.buffer, length)?;
        self.splice_in(position, offset, length);
        Ok(Change::new(ChangeKind::Inserted, position, length))
    }

    fn splice_in(&mut self, position: u64, offset: u64, length: u64) {
        self.segments.split_at(position);
        self.segments.insert_at(
            position,
            Segment {
                store: StoreRef::Memory {
                    buffer: self.buffer,
                    owned: true,
                },
                offset,
                length,
            },
        );
        self.data_size += length;
    }

    /// Remove `length` bytes starting at `position`. Pages of the edit buffer
    /// left without a referencing segment return to the allocator; their
    /// content is undefined until reallocated.
    pub fn remove(&mut self, position: u64, length: u64) -> Result<Change> {
        self.ensure_live()?;
        self.check_range(position, length)?;
        if length == 0 {
            return Ok(Change::new(ChangeKind::Removed, position, 0));
        }
        self.segments.split_at(position);
        self.segments.split_at(position + length);
        let removed = self.segments.remove_range(position, length);
        self.data_size -= length;
        debug_assert_eq!(self.segments.total_len(), self.data_size);
        let mut change = Change::new(ChangeKind::Removed, position, length);
        change.page_moves = self.release_removed(&removed)?;
        Ok(change)
    }

    /// Overwrite `bytes.len()` bytes at `position` with `bytes`.
    ///
    /// One split/splice pass, equivalent to remove-then-insert; the document
    /// size never transiently dips mid-operation.
    pub fn replace(&mut self, position: u64, bytes: &[u8]) -> Result<Change> {
        self.ensure_live()?;
        let length = bytes.len() as u64;
        self.check_range(position, length)?;
        if bytes.is_empty() {
            return Ok(Change::new(ChangeKind::Replaced, position, 0));
        }
        let offset = self.shared.borrow_mut().buffer_append(self.buffer, bytes)?;
        self.segments.split_at(position);
        self.segments.split_at(position + length);
        let removed = self.segments.remove_range(position, length);
        self.segments.insert_at(
            position,
            Segment {
                store: StoreRef::Memory {
                    buffer: self.buffer,
                    owned: true,
                },
                offset,
                length,
            },
        );
        let mut change = Change::new(ChangeKind::Replaced, position, length);
        change.page_moves = self.release_removed(&removed)?;
        Ok(change)
    }

    /// Remove the whole content; `segments()` becomes empty.
    pub fn clear(&mut self) -> Result<Change> {
        let size = self.data_size;
        let mut change = self.remove(0, size)?;
        debug_assert!(self.segments.is_empty());
        change.kind = ChangeKind::Cleared;
        Ok(change)
    }

    /// Compaction pass merging adjacent memory segments over contiguous
    /// buffer bytes. Merging also happens eagerly during edits; this is only
    /// useful after a long edit session to squeeze the list once more.
    pub fn compact_segments(&mut self) {
        self.segments.merge_adjacent();
        debug_assert_eq!(self.segments.total_len(), self.data_size);
    }

    /// Release the edit-buffer ranges of removed owned memory segments.
    fn release_removed(&mut self, removed: &[Segment]) -> Result<Vec<PageMove>> {
        let mut moves = Vec::new();
        let mut shared = self.shared.borrow_mut();
        for segment in removed {
            if let StoreRef::Memory { buffer, owned: true } = segment.store {
                moves.extend(shared.buffer_release(buffer, segment.offset, segment.length)?);
            }
        }
        Ok(moves)
    }

    /// Save the document over its originating file.
    ///
    /// The write streams directly only when every file segment lands exactly
    /// at its own source offset; any shifted shape goes through a temporary
    /// file in the same directory and atomically replaces the original, so a
    /// failed or interrupted save never corrupts or truncates the source.
    /// Requires exclusive ownership of the source.
    pub fn save(&mut self) -> Result<Change> {
        self.ensure_live()?;
        let path = {
            let shared = self.shared.borrow();
            match &shared.sources[self.source].backing {
                SourceBacking::File { path, .. } => path.clone(),
                SourceBacking::Memory { .. } => return Err(Error::NotFileBacked),
            }
        };
        self.save_in_place(&path)
    }

    /// Save the document to `target`. Saving onto the originating file takes
    /// the in-place path of [`Self::save`]; any other target is streamed
    /// segment by segment and the document stays bound to its source.
    pub fn save_to(&mut self, target: impl AsRef<Path>) -> Result<Change> {
        self.ensure_live()?;
        let target = target.as_ref();
        if self.is_source_path(target) {
            let path = target.to_path_buf();
            return self.save_in_place(&path);
        }
        let mut file = File::create(target)?;
        self.stream_segments(&mut file)?;
        file.sync_all()?;
        log::debug!("saved {} bytes to {}", self.data_size, target.display());
        Ok(Change::new(ChangeKind::Saved, 0, self.data_size))
    }

    fn is_source_path(&self, target: &Path) -> bool {
        let shared = self.shared.borrow();
        let source_path = match &shared.sources[self.source].backing {
            SourceBacking::File { path, .. } => path.clone(),
            SourceBacking::Memory { .. } => return false,
        };
        drop(shared);
        match (source_path.canonicalize(), target.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => source_path == target,
        }
    }

    fn save_in_place(&mut self, path: &PathBuf) -> Result<Change> {
        {
            let shared = self.shared.borrow();
            if shared.sources[self.source].refs > 1 {
                return Err(Error::SourceShared);
            }
        }

        if self.in_place_hazard() {
            // Some file segment has shifted away from its source offset;
            // write through a temp file and rename over the original.
            log::debug!("in-place save of {} via temp file", path.display());
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let mut temp = NamedTempFile::new_in(dir)?;
            self.stream_segments(temp.as_file_mut())?;
            temp.as_file().sync_all()?;
            temp.persist(path).map_err(|e| Error::Persist {
                path: path.clone(),
                source: e.error,
            })?;
        } else {
            log::debug!("in-place save of {} by direct stream", path.display());
            let mut file = OpenOptions::new().write(true).open(path)?;
            self.stream_segments(&mut file)?;
            file.set_len(self.data_size)?;
            file.sync_all()?;
        }

        self.rebind_to_saved(path)
    }

    /// True if streaming segments front to back over the source file could
    /// clobber source bytes a later chunk still has to read: some file
    /// segment's write position differs from its own source offset. Only
    /// documents whose file segments all land exactly where they came from
    /// (pure overwrites and appended tails) stream directly; any shifted
    /// shape goes through the temp file so a failed write never leaves the
    /// original partially rewritten.
    fn in_place_hazard(&self) -> bool {
        let mut out_pos = 0u64;
        for segment in self.segments.iter() {
            if let StoreRef::File { .. } = segment.store {
                if out_pos != segment.offset {
                    return true;
                }
            }
            out_pos += segment.length;
        }
        false
    }

    fn stream_segments(&self, out: &mut impl Write) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        let mut chunk = vec![0u8; SAVE_CHUNK];
        for segment in self.segments.iter() {
            let mut copied = 0;
            while copied < segment.length {
                let len = (SAVE_CHUNK as u64).min(segment.length - copied) as usize;
                shared.read_store(segment.store, segment.offset + copied, &mut chunk[..len])?;
                out.write_all(&chunk[..len])?;
                copied += len as u64;
            }
        }
        Ok(())
    }

    /// Rebind the document to the freshly written file: the list collapses
    /// into a single file segment spanning the whole file and the edit
    /// buffer is released. This is the only point where edit structure is
    /// intentionally discarded.
    fn rebind_to_saved(&mut self, path: &PathBuf) -> Result<Change> {
        let mut shared = self.shared.borrow_mut();
        let file = File::open(path)?;
        match &mut shared.sources[self.source].backing {
            SourceBacking::File { file: handle, len, .. } => {
                *handle = file;
                *len = self.data_size;
            }
            // UNREACHABLE: in-place saves are rejected for memory sources.
            SourceBacking::Memory { .. } => unreachable!(),
        }
        let moves = shared.buffer_reset(self.buffer)?;
        drop(shared);

        self.segments.clear();
        if self.data_size > 0 {
            self.segments.insert_at(
                0,
                Segment {
                    store: StoreRef::File {
                        source: self.source,
                    },
                    offset: 0,
                    length: self.data_size,
                },
            );
        }
        let mut change = Change::new(ChangeKind::Saved, 0, self.data_size);
        change.page_moves = moves;
        Ok(change)
    }

    /// Release segments and buffer pages and detach from the source, closing
    /// it when this document was the last referrer. I/O errors during
    /// disposal are returned, but the document is disposed regardless.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.segments.clear();
        let mut shared = self.shared.borrow_mut();
        let mut result = shared.buffer_reset(self.buffer).map(|_| ());
        shared.buffers.remove(self.buffer);
        if let Err(e) = shared.unref_source(self.source) {
            if result.is_ok() {
                result = Err(e);
            }
        }
        result
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(Error::SourceUnavailable)
        } else {
            Ok(())
        }
    }

    fn check_range(&self, position: u64, length: u64) -> Result<()> {
        match position.checked_add(length) {
            Some(end) if end <= self.data_size => Ok(()),
            _ => Err(Error::out_of_range(position, length, self.data_size)),
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if !self.disposed {
            if let Err(e) = self.dispose() {
                log::warn!("error disposing document: {}", e);
            }
        }
    }
}
