//! Memory-mapped durable store for schedules.
//!
//! The backing file holds one record per line (see
//! [`SchedPoint`](crate::point::SchedPoint)'s `Display`/`FromStr`),
//! optionally terminated by the completion marker line. The file is
//! kept mapped for the store's lifetime and sized in whole 4 KiB pages;
//! when a write would overflow the mapping, the store doubles the file
//! and remaps, transparently to the caller. Unused space is
//! NUL-filled, which is what parsing treats as the clean end of data.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use log::debug;
use thiserror::Error;

use crate::point::{SchedPoint, END_MARKER};

/// Granularity of the backing store, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Errors from the durable store.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("failed to open schedule log {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to size schedule log to {len} bytes: {source}")]
    Resize { len: usize, source: io::Error },

    #[error("failed to map schedule log: {source}")]
    Map { source: io::Error },

    #[error("failed to flush schedule log: {source}")]
    Flush { source: io::Error },

    #[error("unparsable schedule record at line {line}")]
    Corrupt { line: usize },
}

/// What followed the last fully-parsed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTail {
    /// The completion marker: the recorded run finished cleanly.
    Marker,
    /// Only NUL padding or end of data: the run was cut short.
    Clean,
    /// Unparsable content at the given 1-based line.
    Garbage { line: usize },
}

/// Parsed contents of the store.
#[derive(Debug)]
pub struct Loaded {
    pub points: Vec<SchedPoint>,
    pub tail: LogTail,
}

impl Loaded {
    /// Whether the stored run ended with the completion marker.
    pub fn completed(&self) -> bool {
        matches!(self.tail, LogTail::Marker)
    }
}

#[derive(Debug)]
struct Mapping {
    file: File,
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn map(file: File, len: usize) -> Result<Mapping, LogError> {
        file.set_len(len as u64)
            .map_err(|source| LogError::Resize { len, source })?;

        // Safety: len is a non-zero page multiple and the descriptor is
        // open read-write for the lifetime of the mapping.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(LogError::Map {
                source: io::Error::last_os_error(),
            });
        }

        Ok(Mapping {
            file,
            ptr: ptr.cast(),
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        // Safety: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// The durable schedule log.
///
/// A *detached* log (see [`ScheduleLog::detached`]) has no backing
/// store: appends are silently dropped and loads come back empty. The
/// governor falls back to it when the store cannot be opened in a mode
/// that only writes.
#[derive(Debug)]
pub struct ScheduleLog {
    mapping: Option<Mapping>,
    write_pos: usize,
}

// Safety: the mapping pointer is only dereferenced through &self/&mut
// self methods; the governor serialises all access behind its state
// lock.
unsafe impl Send for ScheduleLog {}

impl ScheduleLog {
    /// Open or create the backing file and map it, sized up to whole
    /// pages (at least one).
    pub fn open(path: &Path) -> Result<ScheduleLog, LogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| LogError::Open {
                path: path.to_owned(),
                source,
            })?;

        let file_len = file
            .metadata()
            .map_err(|source| LogError::Open {
                path: path.to_owned(),
                source,
            })?
            .len() as usize;
        let len = page_aligned(file_len).max(PAGE_SIZE);

        Ok(ScheduleLog {
            mapping: Some(Mapping::map(file, len)?),
            write_pos: 0,
        })
    }

    /// A log with no backing store.
    pub fn detached() -> ScheduleLog {
        ScheduleLog {
            mapping: None,
            write_pos: 0,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.mapping.is_none()
    }

    /// Mapped capacity in bytes (zero when detached).
    pub fn capacity(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    /// Parse the store from the beginning.
    ///
    /// Parsing stops at the first unparsable line; the tail reports
    /// whether that line was the completion marker, clean padding, or
    /// garbage. Never fails: corruption is data, and the caller decides
    /// whether it is fatal.
    pub fn load(&self) -> Loaded {
        match &self.mapping {
            Some(mapping) => parse(mapping.bytes()),
            None => Loaded {
                points: Vec::new(),
                tail: LogTail::Clean,
            },
        }
    }

    /// Shrink the store back to one page, zero it, and rewind the write
    /// position.
    pub fn reset_for_write(&mut self) -> Result<(), LogError> {
        if self.mapping.is_some() {
            self.remap(PAGE_SIZE)?;
        }
        if let Some(mapping) = &mut self.mapping {
            mapping.bytes_mut().fill(0);
        }
        self.write_pos = 0;
        Ok(())
    }

    /// Append one record.
    pub fn append(&mut self, point: &SchedPoint) -> Result<(), LogError> {
        self.write_record(&format!("{point}\n"))
    }

    /// Write the completion marker and flush the mapping to disk.
    pub fn finalize(&mut self) -> Result<(), LogError> {
        self.write_record(&format!("{END_MARKER}\n"))?;
        self.flush()
    }

    /// Flush dirty pages to the backing file.
    pub fn flush(&self) -> Result<(), LogError> {
        let Some(mapping) = &self.mapping else {
            return Ok(());
        };
        // Safety: ptr/len describe a live mapping.
        let rc = unsafe { libc::msync(mapping.ptr.cast(), mapping.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(LogError::Flush {
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn write_record(&mut self, record: &str) -> Result<(), LogError> {
        let bytes = record.as_bytes();
        loop {
            let Some(mapping) = &mut self.mapping else {
                return Ok(());
            };
            // Keep at least one NUL after the data so parsing sees a
            // clean end.
            if self.write_pos + bytes.len() < mapping.len {
                mapping.bytes_mut()[self.write_pos..self.write_pos + bytes.len()]
                    .copy_from_slice(bytes);
                self.write_pos += bytes.len();
                return Ok(());
            }

            let doubled = mapping.len * 2;
            debug!("growing schedule log to {doubled} bytes");
            self.remap(doubled)?;
        }
    }

    fn remap(&mut self, new_len: usize) -> Result<(), LogError> {
        let Some(mapping) = self.mapping.take() else {
            return Ok(());
        };
        // Safety: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(mapping.ptr.cast(), mapping.len);
        }
        self.mapping = Some(Mapping::map(mapping.file, new_len)?);
        Ok(())
    }
}

impl Drop for ScheduleLog {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // Safety: ptr/len came from a successful mmap; MAP_SHARED
            // pages reach the file without an explicit sync.
            unsafe {
                libc::munmap(mapping.ptr.cast(), mapping.len);
            }
        }
    }
}

fn page_aligned(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn parse(data: &[u8]) -> Loaded {
    // Content ends at the first NUL: everything beyond is page padding.
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let mut rest = &data[..end];
    let mut points = Vec::new();
    let mut line = 0;

    while !rest.is_empty() {
        line += 1;
        let (chunk, remainder, terminated) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (&rest[..i], &rest[i + 1..], true),
            None => (rest, &rest[rest.len()..], false),
        };

        let Ok(text) = std::str::from_utf8(chunk) else {
            return Loaded {
                points,
                tail: LogTail::Garbage { line },
            };
        };
        if text == END_MARKER {
            return Loaded {
                points,
                tail: LogTail::Marker,
            };
        }
        if !terminated {
            // A record without its newline is a torn write.
            return Loaded {
                points,
                tail: LogTail::Garbage { line },
            };
        }

        match text.parse::<SchedPoint>() {
            Ok(point) => points.push(point),
            Err(_) => {
                return Loaded {
                    points,
                    tail: LogTail::Garbage { line },
                }
            }
        }
        rest = remainder;
    }

    Loaded {
        points,
        tail: LogTail::Clean,
    }
}
