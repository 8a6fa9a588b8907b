//! A single log segment file.
//!
//! Layout:
//! - header: magic u32 | version u8 | first_index u64 | max_entries u32 | max_bytes u64
//! - records: framed entries (see `entry::encode_record`)
//!
//! Entries within a segment are dense: the record at position `p` holds
//! index `first_index + p`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::entry::{decode_record, IndexedEntry, LogIndex};
use crate::error::{Result, StorageError};

pub(crate) const SEGMENT_MAGIC: u32 = 0x4C45_454B; // "KEEL"
pub(crate) const SEGMENT_VERSION: u8 = 1;
pub(crate) const SEGMENT_HEADER_LEN: u64 = 25;

/// Fixed header written at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub first_index: LogIndex,
    pub max_entries: u32,
    pub max_bytes: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_LEN as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4] = SEGMENT_VERSION;
        buf[5..13].copy_from_slice(&self.first_index.as_u64().to_le_bytes());
        buf[13..17].copy_from_slice(&self.max_entries.to_le_bytes());
        buf[17..25].copy_from_slice(&self.max_bytes.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; SEGMENT_HEADER_LEN as usize], path: &Path) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = buf[4];
        if magic != SEGMENT_MAGIC || version != SEGMENT_VERSION {
            return Err(StorageError::CorruptHeader {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            first_index: LogIndex(u64::from_le_bytes(buf[5..13].try_into().unwrap())),
            max_entries: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            max_bytes: u64::from_le_bytes(buf[17..25].try_into().unwrap()),
        })
    }
}

/// Result of scanning a segment on open.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SegmentScan {
    pub entries: u64,
    /// True when a complete-but-invalid record was found and discarded.
    /// A torn tail (partial final record after a crash) does not count.
    pub corruption: bool,
}

/// An open segment with its append handle and record offset table.
pub(crate) struct Segment {
    path: PathBuf,
    header: SegmentHeader,
    file: File,
    offsets: Vec<u64>,
    size: u64,
}

impl Segment {
    /// Creates a fresh segment at `path`.
    pub fn create(path: PathBuf, header: SegmentHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        file.sync_data()?;

        Ok(Self {
            path,
            header,
            file,
            offsets: Vec::new(),
            size: SEGMENT_HEADER_LEN,
        })
    }

    /// Opens an existing segment, validating every record.
    ///
    /// The file is truncated to the last valid record; anything past that
    /// point (a torn tail or a corrupt record) is discarded.
    pub fn open(path: PathBuf) -> Result<(Self, SegmentScan)> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_buf = [0u8; SEGMENT_HEADER_LEN as usize];
        file.read_exact(&mut header_buf)
            .map_err(|_| StorageError::CorruptHeader {
                path: path.clone(),
            })?;
        let header = SegmentHeader::decode(&header_buf, &path)?;

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;

        let mut offsets = Vec::new();
        let mut pos = 0usize;
        let mut scan = SegmentScan::default();

        loop {
            let offset = SEGMENT_HEADER_LEN + pos as u64;
            match decode_record(&body[pos..], offset) {
                Ok(Some((entry, consumed))) => {
                    let expected = LogIndex(header.first_index.as_u64() + offsets.len() as u64);
                    if entry.index != expected {
                        tracing::warn!(
                            path = %path.display(),
                            found = %entry.index,
                            expected = %expected,
                            "segment record out of sequence, truncating"
                        );
                        scan.corruption = true;
                        break;
                    }
                    offsets.push(offset);
                    pos += consumed;
                }
                Ok(None) => {
                    if pos < body.len() {
                        tracing::debug!(
                            path = %path.display(),
                            offset,
                            "discarding torn record tail"
                        );
                    }
                    break;
                }
                Err(StorageError::CrcMismatch { .. }) | Err(StorageError::Serialization(_)) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        "corrupt record, truncating segment"
                    );
                    scan.corruption = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let valid_len = SEGMENT_HEADER_LEN + pos as u64;
        if valid_len < SEGMENT_HEADER_LEN + body.len() as u64 {
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;

        scan.entries = offsets.len() as u64;
        Ok((
            Self {
                path,
                header,
                file,
                offsets,
                size: valid_len,
            },
            scan,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_index(&self) -> LogIndex {
        self.header.first_index
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(LogIndex(
                self.header.first_index.as_u64() + self.offsets.len() as u64 - 1,
            ))
        }
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// True when appending `frame_len` more bytes would exceed the segment's
    /// entry or byte budget. A segment always accepts at least one entry.
    pub fn would_overflow(&self, frame_len: usize) -> bool {
        if self.offsets.is_empty() {
            return false;
        }
        self.offsets.len() as u32 >= self.header.max_entries
            || self.size + frame_len as u64 > self.header.max_bytes
    }

    /// Appends a framed record and makes it durable.
    ///
    /// Returns the file offset of the record. On failure the file is
    /// restored to its previous length so the in-memory state stays
    /// consistent with what is on disk.
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        let offset = self.size;
        if let Err(e) = self.write_durable(frame) {
            let _ = self.file.set_len(self.size);
            let _ = self.file.seek(SeekFrom::End(0));
            return Err(e);
        }
        self.offsets.push(offset);
        self.size += frame.len() as u64;
        Ok(offset)
    }

    fn write_durable(&mut self, frame: &[u8]) -> Result<()> {
        self.file.write_all(frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Discards all but the first `keep` entries.
    pub fn truncate_entries(&mut self, keep: usize) -> Result<()> {
        if keep >= self.offsets.len() {
            return Ok(());
        }
        let boundary = self.offsets[keep];
        self.file.set_len(boundary)?;
        self.file.sync_data()?;
        self.file.seek(SeekFrom::End(0))?;
        self.offsets.truncate(keep);
        self.size = boundary;
        Ok(())
    }

    /// Removes the segment file from disk.
    pub fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Reads and decodes the record at `offset` using a caller-owned handle.
pub(crate) fn read_record_at(file: &mut File, offset: u64) -> Result<IndexedEntry> {
    file.seek(SeekFrom::Start(offset))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut frame = vec![0u8; 4 + len + 4];
    frame[..4].copy_from_slice(&len_buf);
    file.read_exact(&mut frame[4..])?;

    match decode_record(&frame, offset)? {
        Some((entry, _)) => Ok(entry),
        None => Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "incomplete record",
        ))),
    }
}
