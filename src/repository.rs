//! The repository: owner of data sources, edit buffers, and the swap file.
//!
//! One repository instance owns one swap allocator; there is no global or
//! ambient swap state. Documents hold a shared handle to the repository's
//! internals, so a swap sweep triggered by any document rebinds the page
//! references of every edit buffer before the relocations become visible.

use std::{
    cell::RefCell,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    rc::Rc,
};

use slab::Slab;

use crate::{
    buffer::EditBuffer,
    document::Document,
    error::Result,
    options::Options,
    segment::StoreRef,
    swap::{PageMove, SwapFile},
    Error,
};

/// Identifies a data source opened in a [`Repository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId(pub(crate) usize);

pub(crate) enum SourceBacking {
    File {
        file: File,
        path: PathBuf,
        len: u64,
    },
    Memory {
        /// Key of the source-owned buffer in [`Shared::buffers`].
        buffer: usize,
        len: u64,
    },
}

pub(crate) struct SourceEntry {
    pub backing: SourceBacking,
    /// The number of live documents bound to this source.
    pub refs: usize,
}

pub(crate) struct Shared {
    pub options: Options,
    pub swap: SwapFile,
    pub sources: Slab<SourceEntry>,
    pub buffers: Slab<EditBuffer>,
}

impl Shared {
    /// Read bytes from whatever store a segment references.
    pub fn read_store(&mut self, store: StoreRef, offset: u64, buf: &mut [u8]) -> Result<()> {
        match store {
            StoreRef::File { source } => {
                let entry = self.sources.get_mut(source).ok_or(Error::SourceUnavailable)?;
                match &mut entry.backing {
                    SourceBacking::File { file, .. } => {
                        file.seek(SeekFrom::Start(offset))?;
                        file.read_exact(buf)?;
                        Ok(())
                    }
                    SourceBacking::Memory { .. } => unreachable!("file segment over memory source"),
                }
            }
            StoreRef::Memory { buffer, .. } => {
                let buf_entry = self.buffers.get(buffer).ok_or(Error::SourceUnavailable)?;
                buf_entry.read(&mut self.swap, offset, buf)
            }
        }
    }

    /// Append to a document's edit buffer, returning the start offset.
    pub fn buffer_append(&mut self, buffer: usize, bytes: &[u8]) -> Result<u64> {
        self.buffers[buffer].append(&mut self.swap, bytes)
    }

    pub fn buffer_append_zeroed(&mut self, buffer: usize, length: u64) -> Result<u64> {
        self.buffers[buffer].append_zeroed(&mut self.swap, length)
    }

    pub fn buffer_write(&mut self, buffer: usize, offset: u64, bytes: &[u8]) -> Result<()> {
        self.buffers[buffer].write(&mut self.swap, offset, bytes)
    }

    /// Release a byte range of an edit buffer and propagate any resulting
    /// page relocations to every buffer in the repository.
    pub fn buffer_release(&mut self, buffer: usize, offset: u64, length: u64) -> Result<Vec<PageMove>> {
        let moves = self.buffers[buffer].release_range(&mut self.swap, offset, length)?;
        self.propagate_moves(&moves);
        Ok(moves)
    }

    /// Release every page of an edit buffer.
    pub fn buffer_reset(&mut self, buffer: usize) -> Result<Vec<PageMove>> {
        let moves = self.buffers[buffer].reset(&mut self.swap)?;
        self.propagate_moves(&moves);
        Ok(moves)
    }

    fn propagate_moves(&mut self, moves: &[PageMove]) {
        if moves.is_empty() {
            return;
        }
        for (_, buffer) in self.buffers.iter_mut() {
            buffer.apply_page_moves(moves);
        }
    }

    /// Drop a document's reference to its source, closing the source when it
    /// was the last referrer.
    pub fn unref_source(&mut self, source: usize) -> Result<()> {
        let entry = match self.sources.get_mut(source) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        debug_assert!(entry.refs > 0);
        entry.refs -= 1;
        if entry.refs == 0 {
            self.close_source_entry(source)?;
        }
        Ok(())
    }

    /// Remove a source entry, dropping its file handle or releasing its
    /// backing buffer's pages.
    fn close_source_entry(&mut self, source: usize) -> Result<()> {
        let entry = self.sources.remove(source);
        log::debug!("closing data source {}", source);
        if let SourceBacking::Memory { buffer, .. } = entry.backing {
            let moves = self.buffers[buffer].reset(&mut self.swap)?;
            self.buffers.remove(buffer);
            self.propagate_moves(&moves);
        }
        Ok(())
    }
}

/// Creates and destroys documents bound to file or in-memory data sources.
///
/// A file source may be shared read-only by any number of documents;
/// operations that write the source file in place (in-place save) demand
/// exclusive ownership and fail with [`Error::SourceShared`] otherwise.
pub struct Repository {
    shared: Rc<RefCell<Shared>>,
}

impl Repository {
    /// Open a repository, creating its swap file.
    pub fn new(options: Options) -> Result<Self> {
        let swap = SwapFile::create(options.swap_dir.as_deref(), options.page_size)?;
        Ok(Repository {
            shared: Rc::new(RefCell::new(Shared {
                options,
                swap,
                sources: Slab::new(),
                buffers: Slab::new(),
            })),
        })
    }

    /// Open a random-access, read-only handle over a file.
    pub fn open_file_source(&self, path: impl AsRef<Path>) -> Result<SourceId> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let mut shared = self.shared.borrow_mut();
        let key = shared.sources.insert(SourceEntry {
            backing: SourceBacking::File { file, path, len },
            refs: 0,
        });
        Ok(SourceId(key))
    }

    /// Create an in-memory source holding a copy of `bytes`. The copy lives
    /// in a paged buffer and spills to the swap file like any other edit data.
    pub fn create_memory_source(&self, bytes: &[u8]) -> Result<SourceId> {
        let mut shared = self.shared.borrow_mut();
        let (page_size, spill) = (shared.options.page_size, shared.options.spill_threshold);
        let buffer = shared.buffers.insert(EditBuffer::new(page_size, spill));
        if !bytes.is_empty() {
            shared.buffer_append(buffer, bytes)?;
        }
        let key = shared.sources.insert(SourceEntry {
            backing: SourceBacking::Memory {
                buffer,
                len: bytes.len() as u64,
            },
            refs: 0,
        });
        Ok(SourceId(key))
    }

    /// Close a source that no document is bound to, dropping its file handle
    /// or releasing its backing pages. A source referenced by live documents
    /// fails with [`Error::SourceShared`] and stays open; it closes on its
    /// own when the last document is disposed.
    pub fn close_source(&self, source: SourceId) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        let entry = shared
            .sources
            .get(source.0)
            .ok_or(Error::SourceUnavailable)?;
        if entry.refs > 0 {
            return Err(Error::SourceShared);
        }
        shared.close_source_entry(source.0)
    }

    /// Create a document over a source. The document starts as one segment
    /// spanning the whole source; an empty source yields an empty list.
    pub fn create_document(&self, source: SourceId) -> Result<Document> {
        let mut shared = self.shared.borrow_mut();
        let (page_size, spill) = (shared.options.page_size, shared.options.spill_threshold);
        let entry = shared
            .sources
            .get_mut(source.0)
            .ok_or(Error::SourceUnavailable)?;
        entry.refs += 1;
        let initial = match &entry.backing {
            SourceBacking::File { len, .. } => (StoreRef::File { source: source.0 }, *len),
            SourceBacking::Memory { buffer, len } => (
                StoreRef::Memory {
                    buffer: *buffer,
                    owned: false,
                },
                *len,
            ),
        };
        let buffer = shared.buffers.insert(EditBuffer::new(page_size, spill));
        drop(shared);
        Ok(Document::new(
            self.shared.clone(),
            source.0,
            buffer,
            initial,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::Repository;
    use crate::{Error, Options};
    use anyhow::Result;

    #[test]
    fn memory_source_round_trip() -> Result<()> {
        let repo = Repository::new(Options::new())?;
        let source = repo.create_memory_source(b"hello world")?;
        let doc = repo.create_document(source)?;
        assert_eq!(doc.data_size(), 11);
        assert_eq!(doc.content_to_vec()?, b"hello world");
        Ok(())
    }

    #[test]
    fn source_shared_across_documents_reads_consistently() -> Result<()> {
        let repo = Repository::new(Options::new())?;
        let source = repo.create_memory_source(&[1, 2, 3, 4])?;
        let a = repo.create_document(source)?;
        let b = repo.create_document(source)?;
        assert_eq!(a.content_to_vec()?, b.content_to_vec()?);
        Ok(())
    }

    #[test]
    fn close_source_releases_unused_sources() -> Result<()> {
        let repo = Repository::new(Options::new())?;
        let unused = repo.create_memory_source(&[7; 16])?;
        repo.close_source(unused)?;
        assert!(matches!(
            repo.create_document(unused),
            Err(Error::SourceUnavailable)
        ));
        assert!(matches!(
            repo.close_source(unused),
            Err(Error::SourceUnavailable)
        ));

        // A source with live documents stays open.
        let bound = repo.create_memory_source(&[8; 16])?;
        let mut doc = repo.create_document(bound)?;
        assert!(matches!(repo.close_source(bound), Err(Error::SourceShared)));
        assert_eq!(doc.content_to_vec()?, [8; 16]);
        doc.dispose()?;
        Ok(())
    }

    #[test]
    fn document_after_source_close_fails() -> Result<()> {
        let repo = Repository::new(Options::new())?;
        let source = repo.create_memory_source(&[1, 2, 3])?;
        let mut doc = repo.create_document(source)?;
        doc.dispose()?;
        // The source had a single referrer and is now closed.
        assert!(repo.create_document(source).is_err());
        Ok(())
    }
}
