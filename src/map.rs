//! This module implements the sliding window that gives bounds-checked access
//! to a memory mapped dump (cf [`ByteWindow`]). Dumps can be gigabytes large
//! while parsing only ever touches small structured regions, so the file is
//! never mapped wholesale: a single mapping is kept around and replaced when a
//! request falls outside of it.
use std::{fs, ops, path};

use memmap2::{Mmap, MmapOptions};
use tracing::trace;

use crate::error::{Error, Result};

/// The smallest amount of bytes mapped at once.
pub const DEFAULT_MIN_WINDOW: usize = 64 * 1024;

/// Random access to the bytes of a dump.
///
/// The returned slice borrows the source mutably, so it can't outlive the next
/// call that might replace the underlying mapping.
pub trait ByteSource {
    /// Total size in bytes.
    fn file_size(&self) -> u64;

    /// Get exactly `len` bytes starting at `offset`, or an
    /// [`Error::OutOfRange`] if the range goes past the end.
    fn get(&mut self, offset: u64, len: usize) -> Result<&[u8]>;

    /// Get at most `max_len` bytes starting at `offset`; the slice stops at the
    /// end of the file.
    fn get_clamped(&mut self, offset: u64, max_len: usize) -> Result<&[u8]> {
        let available = self.file_size().saturating_sub(offset);
        let len = usize::try_from(available).map_or(max_len, |available| available.min(max_len));
        self.get(offset, len)
    }
}

/// Make sure `[offset, offset + len)` fits in a file of `file_size` bytes.
fn check_range(offset: u64, len: usize, file_size: u64) -> Result<ops::Range<u64>> {
    let out_of_range = || Error::OutOfRange {
        offset,
        len: len as u64,
        file_size,
    };

    let end = offset.checked_add(len as u64).ok_or_else(out_of_range)?;
    if end > file_size {
        return Err(out_of_range());
    }

    Ok(offset..end)
}

/// A read-only view over a file that maps at most one window of it at a time.
#[derive(Debug)]
pub struct ByteWindow {
    /// The file backing the mappings.
    file: fs::File,
    /// Size of `file`.
    file_size: u64,
    /// Minimum length of a mapping.
    min_window: usize,
    /// File offset of the first byte of `map`.
    start: u64,
    /// The current mapping. `None` when there is nothing to map (empty file).
    map: Option<Mmap>,
}

impl ByteWindow {
    /// Open `path` and map its first [`DEFAULT_MIN_WINDOW`] bytes.
    pub fn new<P: AsRef<path::Path>>(path: P) -> Result<Self> {
        Self::with_min_window(path, DEFAULT_MIN_WINDOW)
    }

    /// Open `path` with a custom minimum window size.
    pub fn with_min_window<P: AsRef<path::Path>>(path: P, min_window: usize) -> Result<Self> {
        let file = fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut window = Self {
            file,
            file_size,
            min_window: min_window.max(1),
            start: 0,
            map: None,
        };

        window.remap(0, 0)?;

        Ok(window)
    }

    /// The range of file offsets currently mapped.
    pub fn window(&self) -> ops::Range<u64> {
        let len = self.map.as_ref().map_or(0, |map| map.len() as u64);
        self.start..self.start + len
    }

    /// Replace the current mapping by one starting at `offset` that is at
    /// least `len` bytes long (clamped to the end of the file).
    fn remap(&mut self, offset: u64, len: usize) -> Result<()> {
        // The old mapping goes away before the new one gets created.
        self.map = None;
        self.start = offset;

        let wanted = len.max(self.min_window) as u64;
        let len = wanted.min(self.file_size.saturating_sub(offset));
        if len == 0 {
            return Ok(());
        }

        trace!(offset, len, "mapping window");

        // SAFETY: The mapping is read-only and `len` bytes from `offset` are
        // within the file. The dump is not expected to change while it is being
        // analyzed.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(&self.file)?
        };

        self.map = Some(map);

        Ok(())
    }
}

impl ByteSource for ByteWindow {
    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn get(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        let range = check_range(offset, len, self.file_size)?;
        if len == 0 {
            return Ok(&[]);
        }

        // Requests that fit in the current window don't touch the file.
        let window = self.window();
        if range.start < window.start || range.end > window.end {
            self.remap(offset, len)?;
        }

        let Some(map) = self.map.as_ref() else {
            return Err(Error::OutOfRange {
                offset,
                len: len as u64,
                file_size: self.file_size,
            });
        };

        let begin = (offset - self.start) as usize;

        Ok(&map[begin..begin + len])
    }
}

/// Parse a dump that is already in memory.
impl ByteSource for &[u8] {
    fn file_size(&self) -> u64 {
        self.len() as u64
    }

    fn get(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        let range = check_range(offset, len, self.file_size())?;

        Ok(&self[range.start as usize..range.end as usize])
    }
}
