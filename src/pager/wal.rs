use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

use super::{PageId, Synchronous};

const WAL_MAGIC: &[u8; 8] = b"XREFWAL\0";
const WAL_VERSION_MAJOR: u16 = 1;
const WAL_VERSION_MINOR: u16 = 0;
pub(crate) const WAL_HEADER_SIZE: usize = 32;
const WAL_FRAME_HEADER_SIZE: usize = 24;

const FRAME_FLAG_COMMIT: u32 = 0x1;

/// What a replay found in the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplayOutcome {
    pub applied_frames: u32,
    pub discarded_frames: u32,
    pub last_commit: Option<u64>,
}

/// Redo log holding full page images between a commit and its checkpoint.
#[derive(Debug)]
pub(crate) struct Wal {
    file: File,
    page_size: usize,
    next_frame_number: u32,
    synchronous: Synchronous,
}

impl Wal {
    pub(crate) fn open(db_path: &Path, page_size: usize, synchronous: Synchronous) -> Result<Self> {
        let path = wal_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut wal = Self {
            file,
            page_size,
            next_frame_number: 1,
            synchronous,
        };

        if wal.file.metadata()?.len() < WAL_HEADER_SIZE as u64 {
            wal.write_header()?;
        } else {
            wal.validate_header()?;
        }
        Ok(wal)
    }

    /// Recreates the log from scratch, discarding whatever it held.
    pub(crate) fn recreate(db_path: &Path, page_size: usize, synchronous: Synchronous) -> Result<Self> {
        let path = wal_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut wal = Self {
            file,
            page_size,
            next_frame_number: 1,
            synchronous,
        };
        wal.write_header()?;
        Ok(wal)
    }

    pub(crate) fn append_page_frame(&mut self, page_id: PageId, tx_id: u64, page: &[u8]) -> Result<()> {
        self.append_frame_inner(page_id, tx_id, 0, page)
    }

    pub(crate) fn append_commit_frame(&mut self, tx_id: u64) -> Result<()> {
        let zeros = vec![0u8; self.page_size];
        self.append_frame_inner(PageId(0), tx_id, FRAME_FLAG_COMMIT, &zeros)
    }

    fn append_frame_inner(&mut self, page_id: PageId, tx_id: u64, flags: u32, page: &[u8]) -> Result<()> {
        if page.len() != self.page_size {
            return Err(StorageError::InvalidArgument(format!(
                "WAL frame of {} bytes does not match page size {}",
                page.len(),
                self.page_size
            )));
        }

        let mut header = [0u8; WAL_FRAME_HEADER_SIZE];
        encode_frame_header(
            &mut header,
            FrameHeader {
                page_id,
                frame_number: self.next_frame_number,
                checksum: checksum_for(page),
                tx_id,
                flags,
            },
        );

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&header)?;
        self.file.write_all(page)?;
        self.next_frame_number = self
            .next_frame_number
            .checked_add(1)
            .ok_or_else(|| StorageError::corruption("WAL frame number overflow"))?;
        Ok(())
    }

    /// Makes appended frames durable according to the sync policy.
    pub(crate) fn sync(&mut self) -> Result<()> {
        match self.synchronous {
            Synchronous::Full | Synchronous::Normal => self.file.sync_data()?,
            Synchronous::Off => {}
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        self.next_frame_number = 1;
        if self.synchronous == Synchronous::Full {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub(crate) fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Feeds every page image of committed transactions to `apply`, in log
    /// order. Frames of transactions without a commit frame are dropped, and
    /// a torn frame at the tail ends the scan.
    pub(crate) fn replay<F>(&mut self, mut apply: F) -> Result<ReplayOutcome>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut outcome = ReplayOutcome::default();
        let mut expected_frame = 1u32;

        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        let mut header_buf = [0u8; WAL_FRAME_HEADER_SIZE];
        let mut page_buf = vec![0u8; self.page_size];
        let mut pending: FxHashMap<u64, Vec<(PageId, Vec<u8>)>> = FxHashMap::default();

        loop {
            if !self.read_frame_part(&mut header_buf)? {
                break;
            }
            let frame = decode_frame_header(&header_buf)?;
            if frame.frame_number != expected_frame {
                warn!(
                    expected = expected_frame,
                    found = frame.frame_number,
                    "pager.wal.sequence_break"
                );
                break;
            }
            if !self.read_frame_part(&mut page_buf)? {
                warn!(frame = frame.frame_number, "pager.wal.torn_frame");
                break;
            }
            if checksum_for(&page_buf) != frame.checksum {
                warn!(frame = frame.frame_number, "pager.wal.checksum_mismatch");
                break;
            }
            expected_frame += 1;

            if frame.flags & FRAME_FLAG_COMMIT != 0 {
                if let Some(frames) = pending.remove(&frame.tx_id) {
                    for (page_id, data) in frames {
                        apply(page_id, &data)?;
                        outcome.applied_frames += 1;
                    }
                }
                outcome.last_commit = Some(frame.tx_id);
                continue;
            }
            pending
                .entry(frame.tx_id)
                .or_default()
                .push((frame.page_id, page_buf.clone()));
        }

        outcome.discarded_frames = pending.values().map(|frames| frames.len() as u32).sum();
        if outcome.discarded_frames > 0 {
            warn!(
                frames = outcome.discarded_frames,
                "pager.wal.discard_uncommitted"
            );
        }
        debug!(
            applied = outcome.applied_frames,
            last_commit = ?outcome.last_commit,
            "pager.wal.replay"
        );
        self.next_frame_number = expected_frame;
        self.file.seek(SeekFrom::End(0))?;
        Ok(outcome)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[..WAL_MAGIC.len()].copy_from_slice(WAL_MAGIC);
        header[8..10].copy_from_slice(&WAL_VERSION_MAJOR.to_le_bytes());
        header[10..12].copy_from_slice(&WAL_VERSION_MINOR.to_le_bytes());
        header[12..16].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;

        if &header[..WAL_MAGIC.len()] != WAL_MAGIC {
            return Err(StorageError::corruption(format!(
                "invalid WAL magic {}",
                hex::encode(&header[..WAL_MAGIC.len()])
            )));
        }
        let major = u16::from_le_bytes([header[8], header[9]]);
        let minor = u16::from_le_bytes([header[10], header[11]]);
        if major != WAL_VERSION_MAJOR || minor != WAL_VERSION_MINOR {
            return Err(StorageError::corruption(format!(
                "unsupported WAL version {major}.{minor}"
            )));
        }
        let stored_page_size = read_u32_le(&header, 12)?;
        if stored_page_size as usize != self.page_size {
            return Err(StorageError::corruption(format!(
                "WAL page size {stored_page_size} differs from configured {}",
                self.page_size
            )));
        }
        Ok(())
    }

    /// Fills `buf` from the log. `Ok(false)` means the log ended first.
    fn read_frame_part(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut read = 0usize;
        while read < buf.len() {
            let bytes = self.file.read(&mut buf[read..])?;
            if bytes == 0 {
                return Ok(false);
            }
            read += bytes;
        }
        Ok(true)
    }
}

struct FrameHeader {
    page_id: PageId,
    frame_number: u32,
    checksum: u32,
    tx_id: u64,
    flags: u32,
}

fn encode_frame_header(buf: &mut [u8; WAL_FRAME_HEADER_SIZE], frame: FrameHeader) {
    buf[0..4].copy_from_slice(&frame.page_id.0.to_le_bytes());
    buf[4..8].copy_from_slice(&frame.frame_number.to_le_bytes());
    buf[8..12].copy_from_slice(&frame.checksum.to_le_bytes());
    buf[12..20].copy_from_slice(&frame.tx_id.to_le_bytes());
    buf[20..24].copy_from_slice(&frame.flags.to_le_bytes());
}

fn decode_frame_header(buf: &[u8; WAL_FRAME_HEADER_SIZE]) -> Result<FrameHeader> {
    Ok(FrameHeader {
        page_id: PageId(read_u32_le(buf, 0)?),
        frame_number: read_u32_le(buf, 4)?,
        checksum: read_u32_le(buf, 8)?,
        tx_id: read_u64_le(buf, 12)?,
        flags: read_u32_le(buf, 20)?,
    })
}

fn read_u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| StorageError::corruption(format!("invalid u32 at WAL offset {offset}")))?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64_le(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes: [u8; 8] = buf
        .get(offset..offset + 8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| StorageError::corruption(format!("invalid u64 at WAL offset {offset}")))?;
    Ok(u64::from_le_bytes(bytes))
}

fn checksum_for(page: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(page);
    hasher.finalize()
}

pub(crate) fn wal_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}
