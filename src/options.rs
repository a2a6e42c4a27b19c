use std::path::PathBuf;

/// Options when opening a [`crate::Repository`].
#[derive(Clone)]
pub struct Options {
    /// The size of a swap page in bytes.
    pub(crate) page_size: usize,
    /// The number of resident heap bytes an edit buffer may hold before new
    /// pages are taken from the swap file instead.
    pub(crate) spill_threshold: usize,
    /// The directory where the swap file is created. `None` means the system
    /// temporary directory.
    pub(crate) swap_dir: Option<PathBuf>,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            page_size: 4096,
            spill_threshold: 1024 * 1024,
            swap_dir: None,
        }
    }

    /// Set the swap page size in bytes.
    ///
    /// Must be non-zero. Default: 4096.
    pub fn page_size(&mut self, page_size: usize) {
        assert!(page_size > 0);
        self.page_size = page_size;
    }

    /// Set the number of resident heap bytes buffered edits may occupy before
    /// spilling to swap pages.
    ///
    /// Lowering this bounds process memory at the cost of more swap I/O.
    ///
    /// Default: 1 MiB.
    pub fn spill_threshold(&mut self, spill_threshold: usize) {
        self.spill_threshold = spill_threshold;
    }

    /// Set the directory in which the swap file is created.
    ///
    /// Default: the system temporary directory.
    pub fn swap_dir(&mut self, swap_dir: impl Into<PathBuf>) {
        self.swap_dir = Some(swap_dir.into());
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
