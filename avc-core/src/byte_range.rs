//! Seekable virtual file over an ordered list of byte ranges
//!
//! A [`ByteRangeStream`] exposes `(file, offset, length)` ranges as one
//! contiguous logical address space without copying anything to disk. Source
//! files are opened lazily and at most one is held open at a time, so
//! thousands of idle streams can be queued for a worker pool without holding
//! thousands of file descriptors.
//!
//! While `handle` is `Some`, it belongs to `ranges[current]` and its
//! physical position is `ranges[current].offset + (pos - cumulative[current])`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{AvcError, Result};

/// One `(source, offset, length)` piece of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(path: impl AsRef<Path>, offset: u64, len: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset,
            len,
        }
    }
}

/// Passivated stream position: everything needed to resume reading
/// elsewhere, and nothing that pins an OS resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    pub range_index: usize,
    pub offset_in_range: u64,
}

pub struct ByteRangeStream {
    ranges: Vec<ByteRange>,
    /// `cumulative[i]` is the logical start of range `i`; last entry is the total
    cumulative: Vec<u64>,
    current: usize,
    pos: u64,
    handle: Option<File>,
    closed: bool,
}

impl ByteRangeStream {
    /// Build a stream over `ranges`. No file is opened until the first read.
    pub fn new(ranges: Vec<ByteRange>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(AvcError::InvalidState(
                "byte range stream needs at least one range".to_string(),
            ));
        }
        let mut cumulative = Vec::with_capacity(ranges.len() + 1);
        let mut total = 0u64;
        cumulative.push(total);
        for r in &ranges {
            total += r.len;
            cumulative.push(total);
        }
        Ok(Self {
            ranges,
            cumulative,
            current: 0,
            pos: 0,
            handle: None,
            closed: false,
        })
    }

    /// Rebuild a stream from a cursor captured by [`ByteRangeStream::passivate`]
    pub fn resume(ranges: Vec<ByteRange>, cursor: StreamCursor) -> Result<Self> {
        let mut stream = Self::new(ranges)?;
        if cursor.range_index >= stream.ranges.len() {
            return Err(AvcError::InvalidState(format!(
                "cursor range {} out of bounds ({} ranges)",
                cursor.range_index,
                stream.ranges.len()
            )));
        }
        stream.current = cursor.range_index;
        stream.pos = stream.cumulative[cursor.range_index] + cursor.offset_in_range;
        Ok(stream)
    }

    /// Logical size: the sum of all range lengths
    pub fn len(&self) -> u64 {
        self.cumulative[self.ranges.len()]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a source file is currently open
    pub fn has_open_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Current logical position
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Index of the range owning logical position `pos`; positions at or past
    /// the end belong to the last range.
    fn locate(&self, pos: u64) -> usize {
        let i = self.cumulative.partition_point(|&c| c <= pos);
        (i - 1).min(self.ranges.len() - 1)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(AvcError::InvalidState("stream is closed".to_string()));
        }
        Ok(())
    }

    fn physical_offset(&self) -> u64 {
        self.ranges[self.current].offset + (self.pos - self.cumulative[self.current])
    }

    /// Open the current range's source if needed and position it at `pos`
    fn ensure_handle(&mut self) -> Result<&mut File> {
        if self.handle.is_none() {
            let range = &self.ranges[self.current];
            let mut f = File::open(&range.path)?;
            f.seek(SeekFrom::Start(self.physical_offset()))?;
            self.handle = Some(f);
        }
        self.handle
            .as_mut()
            .ok_or_else(|| AvcError::InvalidState("source handle missing".to_string()))
    }

    fn switch_to(&mut self, index: usize) {
        if index != self.current {
            self.handle = None;
            self.current = index;
        }
    }

    /// Move the logical cursor. Seeking past the end is allowed; reads there
    /// return no bytes.
    pub fn seek_to(&mut self, target: SeekFrom) -> Result<u64> {
        self.check_open()?;
        let new_pos = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.len().checked_add_signed(d),
        }
        .ok_or_else(|| AvcError::InvalidState(format!("invalid seek to {:?}", target)))?;

        let index = self.locate(new_pos);
        self.switch_to(index);
        self.pos = new_pos;
        let physical = self.physical_offset();
        if let Some(f) = self.handle.as_mut() {
            f.seek(SeekFrom::Start(physical))?;
        }
        Ok(self.pos)
    }

    /// Fill `out` with up to `out.len()` bytes, clamped to what remains.
    ///
    /// Any short read from a source means the recorded range disagrees with
    /// the file on disk and is reported as a consistency fault.
    fn fill(&mut self, out: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let remaining = self.len().saturating_sub(self.pos);
        let want = (out.len() as u64).min(remaining) as usize;
        let mut done = 0usize;

        while done < want {
            let range_end = self.cumulative[self.current + 1];
            if self.pos >= range_end {
                self.switch_to(self.current + 1);
                continue;
            }
            let chunk = ((want - done) as u64).min(range_end - self.pos) as usize;
            let f = self.ensure_handle()?;
            if let Err(e) = f.read_exact(&mut out[done..done + chunk]) {
                let range = &self.ranges[self.current];
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof => AvcError::consistency(format!(
                        "short read from {} (range offset {}, length {})",
                        range.path.display(),
                        range.offset,
                        range.len
                    )),
                    _ => AvcError::Io(e),
                });
            }
            done += chunk;
            self.pos += chunk as u64;
        }

        if self.current + 1 < self.ranges.len() && self.pos == self.cumulative[self.current + 1] {
            self.switch_to(self.current + 1);
        }
        Ok(done)
    }

    /// Read up to `n` bytes; the result is shorter only at the end of the stream
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        let remaining = self.len().saturating_sub(self.pos);
        let want = (n as u64).min(remaining) as usize;
        let mut buf = vec![0u8; want];
        let got = self.fill(&mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    /// Read everything from the cursor to the end
    pub fn read_to_end_bytes(&mut self) -> Result<Vec<u8>> {
        let remaining = self.len().saturating_sub(self.pos);
        self.read_bytes(remaining as usize)
    }

    /// Drop the open handle and capture the position for later resumption
    pub fn passivate(&mut self) -> StreamCursor {
        self.handle = None;
        StreamCursor {
            range_index: self.current,
            offset_in_range: self.pos - self.cumulative[self.current],
        }
    }

    /// Release the source handle; further reads fail
    pub fn close(&mut self) {
        self.handle = None;
        self.closed = true;
    }
}

fn into_io(e: AvcError) -> io::Error {
    match e {
        AvcError::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Undo [`into_io`] for errors that came back through `std::io` adapters
pub(crate) fn from_io(e: io::Error) -> AvcError {
    if e.get_ref().is_some_and(|inner| inner.is::<AvcError>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(avc) = inner.downcast::<AvcError>() {
                return *avc;
            }
        }
        return AvcError::InvalidState("lost stream error".to_string());
    }
    AvcError::Io(e)
}

impl Read for ByteRangeStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.fill(out).map_err(into_io)
    }
}

impl Seek for ByteRangeStream {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        self.seek_to(target).map_err(into_io)
    }
}

impl std::fmt::Debug for ByteRangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRangeStream")
            .field("ranges", &self.ranges.len())
            .field("len", &self.len())
            .field("pos", &self.pos)
            .field("open", &self.handle.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
