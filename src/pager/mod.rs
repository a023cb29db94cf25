#![forbid(unsafe_code)]
//! Fixed-size page file with a header page, well-known special pages, a free
//! list and WAL-backed atomic commits.
//!
//! Mutated pages stay in memory until [`Pager::commit`]; a commit writes
//! every dirty page plus the header to the WAL, syncs it, and only then
//! copies the images into the main file. Nothing uncommitted ever reaches
//! the main file, so [`Pager::rollback`] simply forgets the dirty set.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::codec::{get_u32, put_u32};
use crate::error::{Result, StorageError};

mod header;
pub mod overflow;
mod stats;
mod wal;

pub use header::StoreLayout;
pub use stats::{PagerStats, PagerStatsSnapshot};

use header::{FileHeader, HEADER_LEN};
use wal::{Wal, WAL_HEADER_SIZE};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 1024;
/// Default number of pages kept in the read cache.
pub const DEFAULT_CACHE_PAGES: usize = 1024;

const FREE_NEXT_OFFSET: usize = 0;

/// Index of a page within the store file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WAL durability policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the WAL and the main file on every commit.
    #[default]
    Full,
    /// Sync the WAL only.
    Normal,
    /// Never sync explicitly.
    Off,
}

impl Synchronous {
    /// Name used in config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Case-insensitive inverse of [`Synchronous::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Options for opening a [`Pager`].
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Number of clean pages kept in the LRU cache.
    pub cache_pages: usize,
    /// WAL durability policy.
    pub synchronous: Synchronous,
    /// Open without write access; every mutation fails with `ReadOnly`.
    pub read_only: bool,
    /// Pages to preallocate when the file is created.
    pub initial_pages: u32,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE as u32,
            cache_pages: DEFAULT_CACHE_PAGES,
            synchronous: Synchronous::Full,
            read_only: false,
            initial_pages: 0,
        }
    }
}

/// Page file handle. Single writer; callers serialize access.
pub struct Pager {
    path: PathBuf,
    file: File,
    wal: Option<Wal>,
    options: PagerOptions,
    page_size: usize,
    header: FileHeader,
    committed: FileHeader,
    cache: LruCache<PageId, Vec<u8>>,
    dirty: FxHashMap<PageId, Vec<u8>>,
    overlay: FxHashMap<PageId, Vec<u8>>,
    format_pending: bool,
    poisoned: bool,
    stats: Arc<PagerStats>,
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("page_count", &self.header.page_count)
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl Pager {
    /// Opens `path`, creating and formatting it when it does not hold a store yet.
    pub fn open(path: &Path, options: PagerOptions, layout: StoreLayout) -> Result<Self> {
        validate_page_size(options.page_size)?;
        let file = open_file(path, options.read_only)?;
        let page_size = options.page_size as usize;

        let mut overlay = FxHashMap::default();
        let wal = if options.read_only {
            if wal::wal_path(path).exists() {
                let mut wal = Wal::open(path, page_size, options.synchronous)?;
                wal.replay(|page_id, data| {
                    overlay.insert(page_id, data.to_vec());
                    Ok(())
                })?;
            }
            None
        } else {
            let mut wal = Wal::open(path, page_size, options.synchronous)?;
            let mut file_ref = &file;
            let outcome = wal.replay(|page_id, data| {
                write_page_image(&mut file_ref, page_size, page_id, data)
            })?;
            if outcome.applied_frames > 0 {
                file.sync_data()?;
                debug!(frames = outcome.applied_frames, "pager.recover");
            }
            wal.reset()?;
            Some(wal)
        };

        let header = match overlay.get(&PageId(0)) {
            Some(page) => FileHeader::read(page)?,
            None => {
                let mut region = [0u8; HEADER_LEN];
                let len = read_at(&file, 0, &mut region)?;
                if len == 0 {
                    None
                } else {
                    FileHeader::read(&region)?
                }
            }
        };

        match header {
            Some(header) => {
                header.check_compatible(options.page_size, layout)?;
                let pager = Self::assemble(path, file, wal, options, header, overlay);
                debug!(
                    path = %pager.path.display(),
                    pages = pager.header.page_count,
                    "pager.open"
                );
                Ok(pager)
            }
            None if options.read_only => Err(StorageError::NotFound("index file header")),
            None => {
                let initial_pages = options.initial_pages;
                let header = FileHeader::new(options.page_size, layout);
                let mut pager = Self::assemble(path, file, wal, options, header, overlay);
                pager.stage_fresh()?;
                pager.commit()?;
                let reserve = u64::from(initial_pages) * pager.page_size as u64;
                if reserve > pager.file.metadata()?.len() {
                    pager.file.set_len(reserve)?;
                }
                debug!(path = %pager.path.display(), "pager.create");
                Ok(pager)
            }
        }
    }

    /// Like [`Pager::open`], but a file whose structure cannot be trusted is
    /// treated as empty. The old content is replaced by the next commit.
    /// Returns the reason the old content was discarded, if it was.
    pub fn open_or_replace(
        path: &Path,
        options: PagerOptions,
        layout: StoreLayout,
    ) -> Result<(Self, Option<StorageError>)> {
        match Self::open(path, options.clone(), layout) {
            Ok(pager) => Ok((pager, None)),
            Err(err) if err.is_structural() && !options.read_only => {
                warn!(path = %path.display(), error = %err, "pager.replace");
                let file = open_file(path, false)?;
                let wal = Wal::recreate(path, options.page_size as usize, options.synchronous)?;
                let header = FileHeader::new(options.page_size, layout);
                let mut pager =
                    Self::assemble(path, file, Some(wal), options, header, FxHashMap::default());
                pager.stage_fresh()?;
                Ok((pager, Some(err)))
            }
            Err(err) => Err(err),
        }
    }

    fn assemble(
        path: &Path,
        file: File,
        wal: Option<Wal>,
        options: PagerOptions,
        header: FileHeader,
        overlay: FxHashMap<PageId, Vec<u8>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(options.cache_pages.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            path: path.to_path_buf(),
            file,
            wal,
            page_size: options.page_size as usize,
            options,
            committed: header.clone(),
            header,
            cache: LruCache::new(capacity),
            dirty: FxHashMap::default(),
            overlay,
            format_pending: false,
            poisoned: false,
            stats: Arc::new(PagerStats::default()),
        }
    }

    /// Stages an empty store: header plus zeroed special pages.
    fn stage_fresh(&mut self) -> Result<()> {
        self.header = FileHeader::new(self.options.page_size, self.header.layout);
        self.committed = self.header.clone();
        self.cache.clear();
        self.dirty.clear();
        for page in 1..self.header.page_count {
            self.dirty.insert(PageId(page), vec![0u8; self.page_size]);
        }
        self.format_pending = true;
        Ok(())
    }

    /// Path of the page file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes, fixed when the store was created.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages in the store, the header page included.
    pub fn page_count(&self) -> u32 {
        self.header.page_count
    }

    /// Reserved page counts recorded in the header.
    pub fn layout(&self) -> StoreLayout {
        self.header.layout
    }

    /// Whether writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Number of commits applied to this file since it was created.
    pub fn commit_counter(&self) -> u64 {
        self.committed.commit_counter
    }

    /// Shared counters, updated by every page access.
    pub fn stats(&self) -> Arc<PagerStats> {
        Arc::clone(&self.stats)
    }

    /// Whether mutations are staged that a commit would write.
    pub fn has_uncommitted(&self) -> bool {
        !self.dirty.is_empty() || self.header != self.committed
    }

    /// Returns the page id of the well-known page `index`.
    pub fn special_page(&self, index: u32) -> Result<PageId> {
        if index >= self.header.layout.special_pages {
            return Err(StorageError::InvalidArgument(format!(
                "special page {index} not reserved (store has {})",
                self.header.layout.special_pages
            )));
        }
        Ok(PageId(1 + index))
    }

    /// Runs `f` on the current image of page `id`: staged, replayed, cached or on disk.
    pub fn with_page<T>(&mut self, id: PageId, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        self.check_bounds(id)?;
        if let Some(data) = self.dirty.get(&id) {
            return f(data);
        }
        if let Some(data) = self.overlay.get(&id) {
            return f(data);
        }
        if let Some(data) = self.cache.get(&id) {
            self.stats.cache_hit();
            return f(data);
        }
        self.stats.cache_miss();
        let data = self.load_page_bytes(id)?;
        let result = f(&data);
        self.cache.put(id, data);
        result
    }

    /// Runs `f` on a staged copy of page `id`. The change is durable after
    /// [`Pager::commit`].
    pub fn with_page_mut<T>(
        &mut self,
        id: PageId,
        f: impl FnOnce(&mut [u8]) -> Result<T>,
    ) -> Result<T> {
        self.ensure_writable()?;
        self.check_bounds(id)?;
        if id == PageId(0) {
            return Err(StorageError::InvalidArgument(
                "page 0 holds the file header".into(),
            ));
        }
        if !self.dirty.contains_key(&id) {
            let data = match self.cache.pop(&id) {
                Some(data) => data,
                None => self.load_page_bytes(id)?,
            };
            self.dirty.insert(id, data);
        }
        let data = self
            .dirty
            .get_mut(&id)
            .ok_or_else(|| StorageError::corruption(format!("dirty page {id} vanished")))?;
        f(data)
    }

    /// Copy of page `id`.
    pub fn read_page(&mut self, id: PageId) -> Result<Vec<u8>> {
        self.with_page(id, |data| Ok(data.to_vec()))
    }

    /// Replaces the whole image of page `id`.
    pub fn write_page(&mut self, id: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size {
            return Err(StorageError::InvalidArgument(format!(
                "page image of {} bytes, expected {}",
                bytes.len(),
                self.page_size
            )));
        }
        self.with_page_mut(id, |data| {
            data.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Returns a zeroed page, reusing the free list before growing the file.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        self.ensure_writable()?;
        let id = match self.header.free_head {
            Some(head) => {
                let next = self.with_page(head, |data| get_u32(data, FREE_NEXT_OFFSET))?;
                if next != 0 && next >= self.header.page_count {
                    return Err(StorageError::corruption(format!(
                        "free list entry {head} points past end of store at {next}"
                    )));
                }
                self.header.free_head = (next != 0).then_some(PageId(next));
                head
            }
            None => {
                let id = PageId(self.header.page_count);
                self.header.page_count = self.header.page_count.checked_add(1).ok_or_else(|| {
                    StorageError::CapacityExceeded("page count exceeds u32 range".into())
                })?;
                id
            }
        };
        self.cache.pop(&id);
        self.dirty.insert(id, vec![0u8; self.page_size]);
        self.stats.allocation();
        trace!(page = id.0, "pager.allocate");
        Ok(id)
    }

    /// Puts `id` on the free list. Special pages cannot be freed.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        self.ensure_writable()?;
        self.check_bounds(id)?;
        if id.0 <= self.header.layout.special_pages {
            return Err(StorageError::InvalidArgument(format!(
                "page {id} is reserved and cannot be freed"
            )));
        }
        let mut page = vec![0u8; self.page_size];
        put_u32(
            &mut page,
            FREE_NEXT_OFFSET,
            self.header.free_head.map_or(0, |head| head.0),
        )?;
        self.cache.pop(&id);
        self.dirty.insert(id, page);
        self.header.free_head = Some(id);
        self.stats.free();
        trace!(page = id.0, "pager.free");
        Ok(())
    }

    /// Walks the free list.
    pub fn free_pages(&mut self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut cursor = self.header.free_head;
        while let Some(id) = cursor {
            if pages.len() as u32 >= self.header.page_count {
                return Err(StorageError::corruption("free list contains a cycle"));
            }
            pages.push(id);
            let next = self.with_page(id, |data| get_u32(data, FREE_NEXT_OFFSET))?;
            cursor = (next != 0).then_some(PageId(next));
        }
        Ok(pages)
    }

    /// Makes every staged mutation durable. Returns the commit number.
    pub fn commit(&mut self) -> Result<u64> {
        self.ensure_writable()?;
        if !self.has_uncommitted() {
            return Ok(self.committed.commit_counter);
        }

        self.header.commit_counter += 1;
        let tx_id = self.header.commit_counter;
        let mut header_page = vec![0u8; self.page_size];
        self.header.write(&mut header_page)?;
        self.dirty.insert(PageId(0), header_page);

        let mut pages: Vec<PageId> = self.dirty.keys().copied().collect();
        pages.sort_unstable();

        let wal = self.wal.as_mut().ok_or(StorageError::ReadOnly)?;
        for id in &pages {
            let data = self
                .dirty
                .get(id)
                .ok_or_else(|| StorageError::corruption(format!("dirty page {id} vanished")))?;
            wal.append_page_frame(*id, tx_id, data)?;
        }
        wal.append_commit_frame(tx_id)?;
        wal.sync()?;

        // The commit is durable from here on; a failure below leaves the WAL
        // in place for the next open to replay.
        if let Err(err) = self.apply_dirty(&pages) {
            self.poisoned = true;
            warn!(error = %err, tx = tx_id, "pager.checkpoint.failed");
            return Err(err);
        }

        self.stats.commit(pages.len() as u64 + 1);
        self.stats.disk_writes(pages.len() as u64);
        for (id, data) in self.dirty.drain() {
            if id != PageId(0) {
                self.cache.put(id, data);
            }
        }
        self.committed = self.header.clone();
        self.format_pending = false;
        debug!(tx = tx_id, pages = pages.len(), "pager.commit");
        Ok(tx_id)
    }

    fn apply_dirty(&mut self, pages: &[PageId]) -> Result<()> {
        let mut file = &self.file;
        for id in pages {
            let data = self
                .dirty
                .get(id)
                .ok_or_else(|| StorageError::corruption(format!("dirty page {id} vanished")))?;
            write_page_image(&mut file, self.page_size, *id, data)?;
        }
        if self.options.synchronous == Synchronous::Full {
            self.file.sync_data()?;
        }
        if let Some(wal) = self.wal.as_mut() {
            wal.reset()?;
        }
        Ok(())
    }

    /// Discards every staged mutation.
    pub fn rollback(&mut self) -> Result<()> {
        let discarded = self.dirty.len();
        self.dirty.clear();
        self.header = self.committed.clone();
        if !self.poisoned {
            if let Some(wal) = self.wal.as_mut() {
                if wal.size()? > WAL_HEADER_SIZE as u64 {
                    wal.reset()?;
                }
            }
        }
        if self.format_pending {
            self.stage_fresh()?;
        }
        self.stats.rollback();
        if discarded > 0 {
            debug!(pages = discarded, "pager.rollback");
        }
        Ok(())
    }

    /// Stages an empty store in place of the whole content. The next commit
    /// makes the replacement durable; a rollback keeps it staged.
    pub fn discard_all(&mut self) -> Result<()> {
        self.ensure_writable()?;
        warn!(path = %self.path.display(), pages = self.header.page_count, "pager.discard_all");
        self.stage_fresh()
    }

    /// Drops staged mutations and syncs the file.
    pub fn close(mut self) -> Result<()> {
        if self.has_uncommitted() && !self.format_pending {
            warn!(pages = self.dirty.len(), "pager.close.uncommitted");
            self.rollback()?;
        }
        if !self.options.read_only {
            self.file.sync_all()?;
        }
        debug!(path = %self.path.display(), "pager.close");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(StorageError::ReadOnly);
        }
        if self.poisoned {
            return Err(StorageError::corruption(
                "a checkpoint failed after commit; reopen the store to recover",
            ));
        }
        Ok(())
    }

    fn check_bounds(&self, id: PageId) -> Result<()> {
        if id.0 >= self.header.page_count {
            return Err(StorageError::corruption(format!(
                "page {id} beyond end of store ({} pages)",
                self.header.page_count
            )));
        }
        Ok(())
    }

    fn load_page_bytes(&mut self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let offset = page_offset(id, self.page_size)?;
        let read = read_at(&self.file, offset, &mut buf)?;
        buf[read..].fill(0);
        self.stats.disk_read();
        Ok(buf)
    }
}

fn validate_page_size(page_size: u32) -> Result<()> {
    if !page_size.is_power_of_two() || !(512..=32_768).contains(&page_size) {
        return Err(StorageError::InvalidArgument(format!(
            "page size {page_size} must be a power of two between 512 and 32768"
        )));
    }
    Ok(())
}

fn open_file(path: &Path, read_only: bool) -> Result<File> {
    let file = if read_only {
        OpenOptions::new().read(true).open(path)?
    } else {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?
    };
    Ok(file)
}

fn page_offset(id: PageId, page_size: usize) -> Result<u64> {
    u64::from(id.0)
        .checked_mul(page_size as u64)
        .ok_or_else(|| StorageError::InvalidArgument(format!("offset of page {id} overflows")))
}

/// Reads as much of `buf` as the file holds at `offset`.
fn read_at(mut file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

fn write_page_image(file: &mut &File, page_size: usize, id: PageId, data: &[u8]) -> Result<()> {
    if data.len() != page_size {
        return Err(StorageError::InvalidArgument(format!(
            "page image for {id} has {} bytes, expected {page_size}",
            data.len()
        )));
    }
    let offset = page_offset(id, page_size)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}
