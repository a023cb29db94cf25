#![forbid(unsafe_code)]
//! Durable integer ids for tree keys.
//!
//! The tree item of a key carries its id as row id. The reverse direction
//! lives in fixed-size slots on data pages: the slot of id `n` records the
//! item's current position plus one page pointer per info slot. Catalog
//! pages list the data pages; the catalog root lists the catalog pages and
//! holds the id counter.
//!
//! ```text
//! root:     next_id:i32 count:u16 catalog_page:u32 * count
//! catalog:  data_page:u32 * (page_size / 4)
//! data:     (tree_page:u32 record:u16 item:u16 info_page:u32 * slots) * n
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::codec::{get_u16, get_u32, put_u32};
use crate::error::{Result, StorageError};
use crate::pager::{PageId, Pager};
use crate::tree::{TreePos, TreeStore};

mod stats;

pub use stats::{MappingStats, MappingStatsSnapshot};

/// Slot page value marking a deleted id.
pub const TOMBSTONE: u32 = u32::MAX;

const ROOT_NEXT_ID: usize = 0;
const ROOT_COUNT: usize = 4;
const ROOT_PAGES: usize = 6;
const POS_BYTES: usize = 8;
const FIRST_ID: i32 = 1;

/// Stable id of a tree key, handed out by the [`Catalog`]. Ids start at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CatalogId(pub i32);

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Slot {
    Unassigned,
    Deleted,
    Live {
        pos: TreePos,
        pages: SmallVec<[u32; 4]>,
    },
}

#[derive(Clone, Copy, Debug)]
struct SlotAddr {
    page: PageId,
    offset: usize,
}

/// Maps tree positions to stable ids and back, and keeps one info page
/// pointer per slot for every id.
///
/// The slot table lives in dedicated catalog pages; a
/// deleted id stays as a tombstone so it is never handed out again.
pub struct Catalog {
    tree: TreeStore,
    root: PageId,
    slots: usize,
    positions: LruCache<CatalogId, TreePos>,
    ids: LruCache<TreePos, CatalogId>,
    stats: Arc<MappingStats>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("tree", &self.tree)
            .field("root", &self.root)
            .field("slots", &self.slots)
            .field("cached", &self.positions.len())
            .finish()
    }
}

impl Catalog {
    /// Opens the catalog rooted at `root` over an already opened tree.
    pub fn open(pager: &Pager, tree: TreeStore, root: PageId, cache_entries: usize) -> Result<Self> {
        let slots = pager.layout().catalog_slots as usize;
        if slots == 0 {
            return Err(StorageError::InvalidArgument(
                "catalog needs at least one info slot".into(),
            ));
        }
        let catalog = Self {
            tree,
            root,
            slots,
            positions: LruCache::new(cache_capacity(cache_entries)),
            ids: LruCache::new(cache_capacity(cache_entries)),
            stats: Arc::new(MappingStats::default()),
        };
        if catalog.slots_per_data_page(pager) == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "page size {} cannot hold a catalog slot of {} bytes",
                pager.page_size(),
                catalog.slot_size()
            )));
        }
        Ok(catalog)
    }

    /// Tree whose items carry the ids.
    pub fn tree(&self) -> &TreeStore {
        &self.tree
    }

    /// Number of info slots kept per id.
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Shared counters, updated by every lookup.
    pub fn stats(&self) -> Arc<MappingStats> {
        Arc::clone(&self.stats)
    }

    /// Forgets cached mappings, e.g. after the pager rolled back.
    pub fn clear_caches(&mut self) {
        self.positions.clear();
        self.ids.clear();
        self.tree.take_relocations();
    }

    /// Next id that [`Catalog::find_or_create`] would hand out.
    pub fn next_id(&self, pager: &mut Pager) -> Result<CatalogId> {
        let raw = pager.with_page(self.root, |data| get_u32(data, ROOT_NEXT_ID))? as i32;
        Ok(CatalogId(raw.max(FIRST_ID)))
    }

    /// Id of `segments`, inserting the key and allocating an id if needed.
    pub fn find_or_create<S: AsRef<str>>(
        &mut self,
        pager: &mut Pager,
        segments: &[S],
    ) -> Result<CatalogId> {
        let path = self.tree.find_or_create_path(pager, segments)?;
        self.apply_relocations(pager)?;
        let pos = path.target();
        let row_id = self.tree.row_id(pager, pos)?;
        if row_id > 0 {
            return Ok(CatalogId(row_id));
        }

        let id = self.next_id(pager)?;
        let next = id.0.checked_add(1).ok_or_else(|| {
            StorageError::CapacityExceeded("catalog id counter exhausted".into())
        })?;
        let addr = self.address(pager, id, true)?.ok_or_else(|| {
            StorageError::corruption(format!("no slot allocated for catalog id {id}"))
        })?;
        self.write_slot(pager, addr, &Slot::Live {
            pos,
            pages: SmallVec::from_elem(0, self.slots),
        })?;
        pager.with_page_mut(self.root, |data| put_u32(data, ROOT_NEXT_ID, next as u32))?;
        self.tree.set_row_id(pager, pos, id.0)?;
        self.positions.put(id, pos);
        self.ids.put(pos, id);
        self.stats.created();
        debug!(id = id.0, pos = %pos, "catalog.id.alloc");
        Ok(id)
    }

    /// Id of `segments` if the key exists and has one.
    pub fn find<S: AsRef<str>>(&mut self, pager: &mut Pager, segments: &[S]) -> Result<Option<CatalogId>> {
        match self.tree.lookup(pager, segments, false)? {
            Some(pos) => self.id_for(pager, pos),
            None => Ok(None),
        }
    }

    /// Tombstones `id` and clears the row id of its item. The key itself
    /// stays in the tree.
    pub fn delete(&mut self, pager: &mut Pager, id: CatalogId) -> Result<()> {
        let pos = self.position_for(pager, id)?;
        self.tree.set_row_id(pager, pos, 0)?;
        self.tombstone(pager, id, pos)
    }

    /// Tombstones the id of `segments` and deletes the key from the tree.
    pub fn remove_key<S: AsRef<str>>(
        &mut self,
        pager: &mut Pager,
        segments: &[S],
    ) -> Result<Option<CatalogId>> {
        let Some(path) = self.tree.find_path(pager, segments)? else {
            return Ok(None);
        };
        let pos = path.target();
        let row_id = self.tree.row_id(pager, pos)?;
        self.tree.delete(pager, &path)?;
        self.apply_relocations(pager)?;
        self.ids.clear();
        if row_id <= 0 {
            return Ok(None);
        }
        let id = CatalogId(row_id);
        self.tombstone(pager, id, pos)?;
        Ok(Some(id))
    }

    fn tombstone(&mut self, pager: &mut Pager, id: CatalogId, pos: TreePos) -> Result<()> {
        let addr = self.live_address(pager, id)?;
        self.write_slot(pager, addr, &Slot::Deleted)?;
        self.positions.pop(&id);
        self.ids.pop(&pos);
        self.stats.deleted();
        debug!(id = id.0, "catalog.id.delete");
        Ok(())
    }

    /// Id stored on the item at `pos`, if one was assigned.
    pub fn id_for(&mut self, pager: &mut Pager, pos: TreePos) -> Result<Option<CatalogId>> {
        if let Some(id) = self.ids.get(&pos) {
            self.stats.lookup(true);
            return Ok(Some(*id));
        }
        self.stats.lookup(false);
        let row_id = self.tree.row_id(pager, pos)?;
        if row_id <= 0 {
            return Ok(None);
        }
        let id = CatalogId(row_id);
        self.ids.put(pos, id);
        Ok(Some(id))
    }

    /// Current position of `id`. Tombstoned and unknown ids are errors.
    pub fn position_for(&mut self, pager: &mut Pager, id: CatalogId) -> Result<TreePos> {
        if let Some(pos) = self.positions.get(&id) {
            self.stats.lookup(true);
            return Ok(*pos);
        }
        self.stats.lookup(false);
        match self.read_live(pager, id)? {
            Slot::Live { pos, .. } => {
                self.positions.put(id, pos);
                Ok(pos)
            }
            _ => Err(StorageError::UnknownCatalogId(id.0)),
        }
    }

    /// Key of `id`, rebuilt by walking the tree.
    pub fn key_for(&mut self, pager: &mut Pager, id: CatalogId) -> Result<Vec<String>> {
        let pos = self.position_for(pager, id)?;
        self.tree.key_at(pager, pos)?.ok_or_else(|| {
            StorageError::corruption(format!("catalog id {id} points at missing item {pos}"))
        })
    }

    /// Page holding the info of `id` in `slot`, if any.
    pub fn slot_page(&mut self, pager: &mut Pager, id: CatalogId, slot: usize) -> Result<Option<PageId>> {
        self.check_slot(slot)?;
        match self.read_live(pager, id)? {
            Slot::Live { pages, .. } => Ok((pages[slot] != 0).then_some(PageId(pages[slot]))),
            _ => Err(StorageError::UnknownCatalogId(id.0)),
        }
    }

    /// Points `slot` of `id` at `page`, or clears it with `None`.
    pub fn set_slot_page(
        &mut self,
        pager: &mut Pager,
        id: CatalogId,
        slot: usize,
        page: Option<PageId>,
    ) -> Result<()> {
        self.check_slot(slot)?;
        let addr = self.live_address(pager, id)?;
        let offset = addr.offset + POS_BYTES + slot * 4;
        pager.with_page_mut(addr.page, |data| put_u32(data, offset, page.map_or(0, |p| p.0)))
    }

    /// Every id that is assigned and not tombstoned, ascending.
    pub fn live_ids(&self, pager: &mut Pager) -> Result<Vec<CatalogId>> {
        let mut live = Vec::new();
        self.for_each_slot(pager, |id, slot| {
            if matches!(slot, Slot::Live { .. }) {
                live.push(id);
            }
        })?;
        Ok(live)
    }

    pub(crate) fn dump_into(&self, pager: &mut Pager, out: &mut String, level: usize) -> Result<()> {
        let pad = "  ".repeat(level);
        let next = self.next_id(pager)?;
        let _ = writeln!(out, "{pad}Catalog next_id={next}");
        self.for_each_slot(pager, |id, slot| match slot {
            Slot::Unassigned => {}
            Slot::Deleted => {
                let _ = writeln!(out, "{pad}  {id}: --deleted--");
            }
            Slot::Live { pos, pages } => {
                let pages = pages.iter().map(u32::to_string).collect::<Vec<_>>().join(" ");
                let _ = writeln!(out, "{pad}  {id}: {pos} [{pages}]");
            }
        })
    }

    fn apply_relocations(&mut self, pager: &mut Pager) -> Result<()> {
        let moved = self.tree.take_relocations();
        if moved.is_empty() {
            return Ok(());
        }
        self.ids.clear();
        self.stats.relocated(moved.len() as u64);
        for relocation in moved {
            if relocation.row_id <= 0 {
                continue;
            }
            let id = CatalogId(relocation.row_id);
            let addr = match self.address(pager, id, false)? {
                Some(addr) => addr,
                None => {
                    warn!(id = id.0, "catalog.relocate.unknown");
                    continue;
                }
            };
            let pos = relocation.pos;
            pager.with_page_mut(addr.page, |data| {
                put_u32(data, addr.offset, pos.page.0)?;
                data[addr.offset + 4..addr.offset + 6].copy_from_slice(&pos.record.to_be_bytes());
                data[addr.offset + 6..addr.offset + 8].copy_from_slice(&pos.item.to_be_bytes());
                Ok(())
            })?;
            self.positions.put(id, pos);
            trace!(id = id.0, pos = %pos, "catalog.relocate");
        }
        Ok(())
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slots {
            return Err(StorageError::InvalidArgument(format!(
                "info slot {slot} out of range (catalog has {})",
                self.slots
            )));
        }
        Ok(())
    }

    fn slot_size(&self) -> usize {
        POS_BYTES + 4 * self.slots
    }

    fn slots_per_data_page(&self, pager: &Pager) -> usize {
        pager.page_size() / self.slot_size()
    }

    fn read_live(&self, pager: &mut Pager, id: CatalogId) -> Result<Slot> {
        match self.address(pager, id, false)? {
            Some(addr) => self.read_slot(pager, addr),
            None => Err(StorageError::UnknownCatalogId(id.0)),
        }
    }

    fn live_address(&self, pager: &mut Pager, id: CatalogId) -> Result<SlotAddr> {
        let addr = self
            .address(pager, id, false)?
            .ok_or(StorageError::UnknownCatalogId(id.0))?;
        match self.read_slot(pager, addr)? {
            Slot::Live { .. } => Ok(addr),
            _ => Err(StorageError::UnknownCatalogId(id.0)),
        }
    }

    /// Resolves the slot of `id`, allocating catalog and data pages when
    /// `create` is set.
    fn address(&self, pager: &mut Pager, id: CatalogId, create: bool) -> Result<Option<SlotAddr>> {
        if id.0 < FIRST_ID {
            return Err(StorageError::UnknownCatalogId(id.0));
        }
        let per_data = self.slots_per_data_page(pager);
        let per_catalog = pager.page_size() / 4;
        let index = (id.0 - FIRST_ID) as usize;
        let data_no = index / per_data;
        let offset = (index % per_data) * self.slot_size();
        let catalog_no = data_no / per_catalog;
        let within = data_no % per_catalog;

        let count = pager.with_page(self.root, |data| get_u16(data, ROOT_COUNT))? as usize;
        if catalog_no >= count {
            if !create {
                return Ok(None);
            }
            let max = (pager.page_size() - ROOT_PAGES) / 4;
            if catalog_no >= max {
                return Err(StorageError::CapacityExceeded(format!(
                    "catalog id {id} needs catalog page {catalog_no}, limit is {max}"
                )));
            }
            for number in count..=catalog_no {
                let page = pager.allocate_page()?;
                pager.with_page_mut(self.root, |data| {
                    put_u32(data, ROOT_PAGES + number * 4, page.0)?;
                    data[ROOT_COUNT..ROOT_COUNT + 2].copy_from_slice(&((number + 1) as u16).to_be_bytes());
                    Ok(())
                })?;
                trace!(page = page.0, number, "catalog.page.alloc");
            }
        }
        let catalog_page =
            PageId(pager.with_page(self.root, |data| get_u32(data, ROOT_PAGES + catalog_no * 4))?);
        let mut data_page = pager.with_page(catalog_page, |data| get_u32(data, within * 4))?;
        if data_page == 0 {
            if !create {
                return Ok(None);
            }
            let page = pager.allocate_page()?;
            pager.with_page_mut(catalog_page, |data| put_u32(data, within * 4, page.0))?;
            trace!(page = page.0, catalog = catalog_page.0, "catalog.data_page.alloc");
            data_page = page.0;
        }
        Ok(Some(SlotAddr {
            page: PageId(data_page),
            offset,
        }))
    }

    fn read_slot(&self, pager: &mut Pager, addr: SlotAddr) -> Result<Slot> {
        let slots = self.slots;
        pager.with_page(addr.page, |data| decode_slot(data, addr.offset, slots))
    }

    fn write_slot(&self, pager: &mut Pager, addr: SlotAddr, slot: &Slot) -> Result<()> {
        let size = self.slot_size();
        pager.with_page_mut(addr.page, |data| {
            let region = data.get_mut(addr.offset..addr.offset + size).ok_or_else(|| {
                StorageError::corruption(format!("catalog slot at {} overruns page", addr.offset))
            })?;
            region.fill(0);
            match slot {
                Slot::Unassigned => {}
                Slot::Deleted => put_u32(region, 0, TOMBSTONE)?,
                Slot::Live { pos, pages } => {
                    put_u32(region, 0, pos.page.0)?;
                    region[4..6].copy_from_slice(&pos.record.to_be_bytes());
                    region[6..8].copy_from_slice(&pos.item.to_be_bytes());
                    for (index, page) in pages.iter().enumerate() {
                        put_u32(region, POS_BYTES + index * 4, *page)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn for_each_slot(&self, pager: &mut Pager, mut visit: impl FnMut(CatalogId, Slot)) -> Result<()> {
        let next = self.next_id(pager)?;
        let per_data = self.slots_per_data_page(pager);
        let per_catalog = pager.page_size() / 4;
        let size = self.slot_size();
        let catalog_pages: Vec<u32> = pager.with_page(self.root, |data| {
            let count = get_u16(data, ROOT_COUNT)? as usize;
            (0..count).map(|n| get_u32(data, ROOT_PAGES + n * 4)).collect()
        })?;
        for (catalog_no, catalog_page) in catalog_pages.into_iter().enumerate() {
            for within in 0..per_catalog {
                let data_page = pager.with_page(PageId(catalog_page), |data| get_u32(data, within * 4))?;
                if data_page == 0 {
                    continue;
                }
                let first = ((catalog_no * per_catalog + within) * per_data) as i64 + FIRST_ID as i64;
                let slots: Vec<(CatalogId, Slot)> = pager.with_page(PageId(data_page), |data| {
                    (0..per_data)
                        .map(|n| first + n as i64)
                        .take_while(|id| *id < next.0 as i64)
                        .enumerate()
                        .map(|(n, id)| Ok((CatalogId(id as i32), decode_slot(data, n * size, self.slots)?)))
                        .collect()
                })?;
                for (id, slot) in slots {
                    visit(id, slot);
                }
            }
        }
        Ok(())
    }
}

fn cache_capacity(entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
}

fn decode_slot(data: &[u8], offset: usize, slots: usize) -> Result<Slot> {
    let page = get_u32(data, offset)?;
    if page == 0 {
        return Ok(Slot::Unassigned);
    }
    if page == TOMBSTONE {
        return Ok(Slot::Deleted);
    }
    let pos = TreePos {
        page: PageId(page),
        record: get_u16(data, offset + 4)?,
        item: get_u16(data, offset + 6)?,
    };
    let pages = (0..slots)
        .map(|n| get_u32(data, offset + POS_BYTES + n * 4))
        .collect::<Result<SmallVec<[u32; 4]>>>()?;
    Ok(Slot::Live { pos, pages })
}
