//! Variable-length payloads keyed by catalog id, packed onto shared pages.
//!
//! Each info slot of the catalog is one store. A page holds items of
//! neighbouring ids, sorted by id:
//!
//! ```text
//! count:u16 (offset:u16 id:i32)*count total_size:u16 payload...
//! ```
//!
//! Every payload starts with a flag byte: `0` for inline bytes, `1` for a
//! stub `head:u32 len:u32` pointing at an overflow chain.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, trace};

use crate::catalog::{Catalog, CatalogId};
use crate::codec::{get_u16, get_u32, DataWriter};
use crate::error::{Result, StorageError};
use crate::pager::{overflow, PageId, Pager};

const COUNT_SIZE: usize = 2;
const TOTAL_SIZE: usize = 2;
const PER_ITEM_METADATA: usize = 2 + 4;
const PAGE_METADATA: usize = COUNT_SIZE + TOTAL_SIZE;
const INLINE: u8 = 0;
const CHAINED: u8 = 1;
const STUB_LEN: usize = 1 + 4 + 4;
/// Ids below the new one probed for a page to share.
const NEIGHBOUR_PROBES: i32 = 8;

/// Fill report of one [`InfoStore`] slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct InfoStoreStats {
    /// Info pages referenced by live ids.
    pub pages: u64,
    /// Live items across those pages.
    pub items: u64,
    /// Items whose payload spilled into an overflow chain.
    pub chained_items: u64,
    /// Payload bytes, stubs included.
    pub bytes_used: u64,
    /// Most items found on a single page.
    pub max_items_per_page: u64,
    /// Used bytes over capacity, averaged across pages.
    pub average_fill_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InfoPage {
    id: PageId,
    items: Vec<(i32, Vec<u8>)>,
}

impl InfoPage {
    fn empty(id: PageId) -> Self {
        Self {
            id,
            items: Vec::new(),
        }
    }

    fn find(&self, item_id: i32) -> std::result::Result<usize, usize> {
        self.items.binary_search_by_key(&item_id, |(id, _)| *id)
    }

    fn total_size(&self) -> usize {
        PAGE_METADATA
            + self
                .items
                .iter()
                .map(|(_, data)| PER_ITEM_METADATA + data.len())
                .sum::<usize>()
    }

    fn decode(id: PageId, data: &[u8]) -> Result<Self> {
        let count = get_u16(data, 0)? as usize;
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let at = COUNT_SIZE + index * PER_ITEM_METADATA;
            entries.push((get_u16(data, at)? as usize, get_u32(data, at + 2)? as i32));
        }
        let total = get_u16(data, COUNT_SIZE + count * PER_ITEM_METADATA)? as usize;
        if count > 0 && total > data.len() {
            return Err(StorageError::corruption(format!(
                "info page {id} claims {total} bytes"
            )));
        }
        let mut items = Vec::with_capacity(count);
        for (index, (offset, item_id)) in entries.iter().enumerate() {
            let end = entries.get(index + 1).map_or(total, |(next, _)| *next);
            let bytes = data.get(*offset..end).filter(|_| offset < &end).ok_or_else(|| {
                StorageError::corruption(format!(
                    "info page {id} item {item_id} spans {offset}..{end}"
                ))
            })?;
            items.push((*item_id, bytes.to_vec()));
        }
        Ok(Self { id, items })
    }

    fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        let total = self.total_size();
        if total > page_size {
            return Err(StorageError::corruption(format!(
                "info page {} overflows: {total} > {page_size}",
                self.id
            )));
        }
        let mut out = DataWriter::with_capacity(page_size);
        out.write_short(self.items.len())?;
        let mut offset = COUNT_SIZE + self.items.len() * PER_ITEM_METADATA + TOTAL_SIZE;
        for (item_id, data) in &self.items {
            out.write_short(offset)?;
            out.write_i32(*item_id);
            offset += data.len();
        }
        out.write_short(total)?;
        for (_, data) in &self.items {
            out.write_bytes(data);
        }
        let mut image = out.into_inner();
        image.resize(page_size, 0);
        Ok(image)
    }
}

/// Handle on the store kept in one catalog info slot.
#[derive(Debug, Clone, Copy)]
pub struct InfoStore {
    slot: usize,
}

impl InfoStore {
    /// Store for catalog slot `slot`.
    pub fn new(slot: usize) -> Self {
        Self { slot }
    }

    /// Catalog slot this store reads and writes.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Largest payload stored inline; anything longer goes to a chain.
    pub fn max_inline(page_size: usize) -> usize {
        page_size / 4
    }

    /// Payload stored for `id`, if any.
    pub fn get(&self, catalog: &mut Catalog, pager: &mut Pager, id: CatalogId) -> Result<Option<Vec<u8>>> {
        let Some(page_id) = catalog.slot_page(pager, id, self.slot)? else {
            return Ok(None);
        };
        let page = load(pager, page_id)?;
        let index = page
            .find(id.0)
            .map_err(|_| missing_item(page_id, id, self.slot))?;
        let stored = &page.items[index].1;
        match stored.split_first() {
            Some((&INLINE, bytes)) => Ok(Some(bytes.to_vec())),
            Some((&CHAINED, stub)) => {
                let head = get_u32(stub, 0)?;
                let len = get_u32(stub, 4)? as usize;
                let bytes = overflow::read_chain(pager, PageId(head))?;
                if bytes.len() != len {
                    return Err(StorageError::corruption(format!(
                        "info chain at {head} holds {} bytes, stub says {len}",
                        bytes.len()
                    )));
                }
                Ok(Some(bytes))
            }
            _ => Err(StorageError::corruption(format!(
                "info item {id} on page {page_id} has a bad flag"
            ))),
        }
    }

    /// Stores `payload` for `id`, replacing any previous value.
    pub fn put(&self, catalog: &mut Catalog, pager: &mut Pager, id: CatalogId, payload: &[u8]) -> Result<()> {
        let page_size = pager.page_size();
        let stored = if payload.len() + 1 > Self::max_inline(page_size) {
            let head = overflow::write_chain(pager, payload)?;
            let mut stub = Vec::with_capacity(STUB_LEN);
            stub.push(CHAINED);
            stub.extend_from_slice(&head.0.to_be_bytes());
            stub.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            stub
        } else {
            let mut inline = Vec::with_capacity(payload.len() + 1);
            inline.push(INLINE);
            inline.extend_from_slice(payload);
            inline
        };

        let mut page = match catalog.slot_page(pager, id, self.slot)? {
            Some(page_id) => load(pager, page_id)?,
            None => self.choose_page(catalog, pager, id, stored.len())?,
        };
        match page.find(id.0) {
            Ok(index) => {
                let old = std::mem::replace(&mut page.items[index].1, stored);
                free_stub(pager, &old)?;
            }
            Err(index) => page.items.insert(index, (id.0, stored)),
        }
        trace!(id = id.0, slot = self.slot, page = page.id.0, "infostore.put");
        catalog.set_slot_page(pager, id, self.slot, Some(page.id))?;

        if page.total_size() > page_size {
            self.split(catalog, pager, page)
        } else {
            store(pager, &page)
        }
    }

    /// Removes the value of `id`; an emptied page is freed.
    pub fn delete(&self, catalog: &mut Catalog, pager: &mut Pager, id: CatalogId) -> Result<bool> {
        let Some(page_id) = catalog.slot_page(pager, id, self.slot)? else {
            return Ok(false);
        };
        let mut page = load(pager, page_id)?;
        let index = page
            .find(id.0)
            .map_err(|_| missing_item(page_id, id, self.slot))?;
        let (_, old) = page.items.remove(index);
        free_stub(pager, &old)?;
        catalog.set_slot_page(pager, id, self.slot, None)?;
        if page.items.is_empty() {
            pager.free_page(page_id)?;
            trace!(page = page_id.0, slot = self.slot, "infostore.page.free");
        } else {
            store(pager, &page)?;
        }
        Ok(true)
    }

    /// Live ids that hold a value in this store, ascending.
    pub fn ids(&self, catalog: &mut Catalog, pager: &mut Pager) -> Result<Vec<CatalogId>> {
        let mut ids = Vec::new();
        for id in catalog.live_ids(pager)? {
            if catalog.slot_page(pager, id, self.slot)?.is_some() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Walks every page referenced by a live id.
    pub fn stats(&self, catalog: &mut Catalog, pager: &mut Pager) -> Result<InfoStoreStats> {
        let mut pages = BTreeSet::new();
        for id in catalog.live_ids(pager)? {
            if let Some(page) = catalog.slot_page(pager, id, self.slot)? {
                pages.insert(page);
            }
        }
        let mut stats = InfoStoreStats::default();
        let mut fill = 0.0;
        for page_id in pages {
            let page = load(pager, page_id)?;
            let used = page.total_size();
            stats.pages += 1;
            stats.items += page.items.len() as u64;
            stats.chained_items += page
                .items
                .iter()
                .filter(|(_, data)| data.first() == Some(&CHAINED))
                .count() as u64;
            stats.bytes_used += used as u64;
            stats.max_items_per_page = stats.max_items_per_page.max(page.items.len() as u64);
            fill += used as f64 / pager.page_size() as f64;
        }
        if stats.pages > 0 {
            stats.average_fill_factor = fill / stats.pages as f64;
        }
        Ok(stats)
    }

    /// Picks the page of the nearest lower id when the item fits there.
    fn choose_page(&self, catalog: &mut Catalog, pager: &mut Pager, id: CatalogId, len: usize) -> Result<InfoPage> {
        let floor = (id.0 - NEIGHBOUR_PROBES).max(1);
        for neighbour in (floor..id.0).rev() {
            let page_id = match catalog.slot_page(pager, CatalogId(neighbour), self.slot) {
                Ok(Some(page_id)) => page_id,
                Ok(None) | Err(StorageError::UnknownCatalogId(_)) => continue,
                Err(err) => return Err(err),
            };
            let page = load(pager, page_id)?;
            if page.total_size() + PER_ITEM_METADATA + len <= pager.page_size() {
                return Ok(page);
            }
            break;
        }
        let page_id = pager.allocate_page()?;
        trace!(page = page_id.0, slot = self.slot, "infostore.page.alloc");
        Ok(InfoPage::empty(page_id))
    }

    /// Moves the upper part of an overflowing page to a fresh page so both
    /// halves carry about the same number of bytes.
    fn split(&self, catalog: &mut Catalog, pager: &mut Pager, mut page: InfoPage) -> Result<()> {
        let half = page.total_size() / 2;
        let mut used = PAGE_METADATA;
        let mut keep = 0;
        for (_, data) in &page.items {
            if used + PER_ITEM_METADATA + data.len() > half && keep > 0 {
                break;
            }
            used += PER_ITEM_METADATA + data.len();
            keep += 1;
        }
        let keep = keep.min(page.items.len() - 1).max(1);
        let moved = page.items.split_off(keep);
        let upper = InfoPage {
            id: pager.allocate_page()?,
            items: moved,
        };
        for (item_id, _) in &upper.items {
            catalog.set_slot_page(pager, CatalogId(*item_id), self.slot, Some(upper.id))?;
        }
        debug!(
            page = page.id.0,
            new_page = upper.id.0,
            moved = upper.items.len(),
            "infostore.split"
        );
        store(pager, &page)?;
        store(pager, &upper)
    }
}

fn missing_item(page: PageId, id: CatalogId, slot: usize) -> StorageError {
    StorageError::corruption(format!(
        "info page {page} of slot {slot} does not hold catalog id {id}"
    ))
}

fn load(pager: &mut Pager, id: PageId) -> Result<InfoPage> {
    pager.with_page(id, |data| InfoPage::decode(id, data))
}

fn store(pager: &mut Pager, page: &InfoPage) -> Result<()> {
    let image = page.encode(pager.page_size())?;
    pager.write_page(page.id, &image)
}

fn free_stub(pager: &mut Pager, stored: &[u8]) -> Result<()> {
    if let Some((&CHAINED, stub)) = stored.split_first() {
        overflow::free_chain(pager, PageId(get_u32(stub, 0)?))?;
    }
    Ok(())
}
