//! Delta-document storage engine.
//!
//! A [`Document`] represents a large binary file as a mutable sequence of
//! segments, each a contiguous run sourced from the original file or from
//! freshly written memory. Insert, overwrite, delete, and replace operations
//! split the segment list at the affected boundaries and splice segments in
//! or out, so an edit costs time proportional to its size rather than to the
//! file's. Buffered edit data spills to a swap-file page allocator once it
//! outgrows a configurable threshold, keeping process memory bounded for
//! arbitrarily large edits.
//!
//! A [`Repository`] owns the data sources, the edit buffers, and the swap
//! allocator; documents are created against a source and saved either in
//! place (through a temp file and atomic rename whenever edits have shifted
//! file bytes, so a failed save never corrupts the source) or to any other
//! path.
//!
//! The engine is single-writer and synchronous: all operations run on the
//! calling thread, and mutations report their effects through returned
//! [`Change`] descriptors rather than internal listeners.
//!
//! ```no_run
//! use deltadoc::{Options, Repository};
//!
//! # fn main() -> deltadoc::Result<()> {
//! let repo = Repository::new(Options::new())?;
//! let source = repo.open_file_source("large.bin")?;
//! let mut doc = repo.create_document(source)?;
//! doc.insert(0, b"header")?;
//! doc.save()?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod document;
mod error;
mod options;
mod repository;
mod segment;
mod swap;

pub use document::{Change, ChangeKind, Document};
pub use error::{Error, Result};
pub use options::Options;
pub use repository::{Repository, SourceId};
pub use segment::{Segment, SegmentKind};
pub use swap::{PageIndex, PageMove};
