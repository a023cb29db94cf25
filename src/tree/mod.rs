#![forbid(unsafe_code)]
//! Disk-resident trie mapping sequences of string segments to item positions.
//!
//! Every page holds records, every record a sorted list of items, and every
//! item an optional child: another record on the same page or record 0 of a
//! child page. Pages that run out of room move their largest record to a
//! fresh page; a page left with only record 0 sheds the upper half of that
//! record to a continuation page instead.

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, trace};

use crate::codec::mutf8;
use crate::error::{Result, StorageError};
use crate::pager::{overflow, PageId, Pager};

mod page;
mod walk;

pub(crate) use page::TreePage;
use page::{
    encode_name, Child, Item, Probe, Record, CB_EMPTY_RECORD_METADATA,
    CB_PAGE_METADATA_PER_RECORD, CB_RECORD_METADATA_PER_ITEM, CONTINUATION_ROW_ID, PAGE_MARKER,
};
pub use walk::{TreeEntry, TreeWalk};

/// Item payload without timestamps: the row id.
pub const ITEM_PAYLOAD: usize = 4;
/// Item payload with timestamps: row id plus an 8-byte stamp.
pub const ITEM_PAYLOAD_WITH_STAMP: usize = 12;

const MAX_SPLITS_PER_INSERT: usize = 64;

/// Coordinates of an item. Valid until the next structural change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TreePos {
    /// Page holding the record.
    pub page: PageId,
    /// Record index within the page.
    pub record: u16,
    /// Item index within the record.
    pub item: u16,
}

impl TreePos {
    pub(crate) fn new(page: PageId, record: usize, item: usize) -> Result<Self> {
        let narrow = |value: usize, what: &str| {
            u16::try_from(value).map_err(|_| {
                StorageError::CapacityExceeded(format!("{what} {value} exceeds 16 bits"))
            })
        };
        Ok(Self {
            page,
            record: narrow(record, "record index")?,
            item: narrow(item, "item index")?,
        })
    }
}

impl fmt::Display for TreePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.page, self.record, self.item)
    }
}

/// Items visited while resolving a key, root first. Continuation items
/// crossed on the way are included; the last step is the key's item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreePath {
    steps: Vec<TreePos>,
}

impl TreePath {
    /// Position of the key's own item.
    pub fn target(&self) -> TreePos {
        // Paths are only built by successful lookups, which push at least one step.
        self.steps[self.steps.len() - 1]
    }

    /// Every item crossed, root first.
    pub fn steps(&self) -> &[TreePos] {
        &self.steps
    }
}

/// New position of an item carrying a row id, reported after any change
/// that moved it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Row id carried by the item.
    pub row_id: i32,
    /// Where the item sits now.
    pub pos: TreePos,
}

/// Shape report of a tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TreeStoreStats {
    /// Pages reachable from the root.
    pub pages: u64,
    /// Records across those pages.
    pub records: u64,
    /// Items of every kind, continuations included.
    pub items: u64,
    /// Items that only continue a record on another page.
    pub continuation_items: u64,
    /// Segments stored out of line in overflow chains.
    pub long_segments: u64,
    /// Longest segment, in UTF-16 units.
    pub max_segment_len: u64,
    /// Sum of segment lengths, in UTF-16 units.
    pub total_segment_len: u64,
    /// Bytes used on tree pages.
    pub bytes_used: u64,
}

impl TreeStoreStats {
    /// Mean segment length in UTF-16 units.
    pub fn average_segment_len(&self) -> f64 {
        if self.items == 0 {
            return 0.0;
        }
        self.total_segment_len as f64 / self.items as f64
    }
}

/// Handle on one tree rooted at a fixed page.
#[derive(Debug)]
pub struct TreeStore {
    root: PageId,
    item_payload: usize,
    relocations: Vec<Relocation>,
}

impl TreeStore {
    /// Opens the tree rooted at `root`.
    pub fn open(pager: &mut Pager, root: PageId, item_payload: usize) -> Result<Self> {
        if item_payload != ITEM_PAYLOAD && item_payload != ITEM_PAYLOAD_WITH_STAMP {
            return Err(StorageError::InvalidArgument(format!(
                "tree item payload must be {ITEM_PAYLOAD} or {ITEM_PAYLOAD_WITH_STAMP}, got {item_payload}"
            )));
        }
        let tree = Self {
            root,
            item_payload,
            relocations: Vec::new(),
        };
        tree.load(pager, root)?;
        Ok(tree)
    }

    /// Root page of the tree.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Whether items carry an 8-byte stamp next to the row id.
    pub fn records_timestamps(&self) -> bool {
        self.item_payload == ITEM_PAYLOAD_WITH_STAMP
    }

    /// Resolves `segments` to the position of its last segment. With
    /// `create`, missing segments are inserted.
    pub fn lookup<S: AsRef<str>>(
        &mut self,
        pager: &mut Pager,
        segments: &[S],
        create: bool,
    ) -> Result<Option<TreePos>> {
        Ok(self
            .descend(pager, segments, create)?
            .map(|path| path.target()))
    }

    /// Like [`TreeStore::lookup`] without creation, returning every step.
    pub fn find_path<S: AsRef<str>>(
        &mut self,
        pager: &mut Pager,
        segments: &[S],
    ) -> Result<Option<TreePath>> {
        self.descend(pager, segments, false)
    }

    /// Inserting variant of [`TreeStore::find_path`].
    pub fn find_or_create_path<S: AsRef<str>>(
        &mut self,
        pager: &mut Pager,
        segments: &[S],
    ) -> Result<TreePath> {
        self.descend(pager, segments, true)?
            .ok_or_else(|| StorageError::corruption("tree insert produced no position"))
    }

    fn descend<S: AsRef<str>>(
        &mut self,
        pager: &mut Pager,
        segments: &[S],
        create: bool,
    ) -> Result<Option<TreePath>> {
        if segments.is_empty() {
            return Err(StorageError::InvalidArgument("empty tree key".into()));
        }
        trace!(
            root = self.root.0,
            key = %join(segments),
            create,
            "tree.lookup"
        );
        let mut splits = 0usize;
        'restart: loop {
            let mut steps = Vec::with_capacity(segments.len());
            let mut page_id = self.root;
            let mut record = 0usize;
            for (depth, segment) in segments.iter().enumerate() {
                let segment = segment.as_ref();
                let (mut page, item) = loop {
                    let mut page = self.load(pager, page_id)?;
                    match page.probe(record, segment)? {
                        Probe::Found(item) => break (page, item),
                        Probe::Continue(item) => {
                            steps.push(TreePos::new(page_id, record, item)?);
                            page_id = match page.item(record, item)?.child() {
                                Child::Page(next) => next,
                                other => {
                                    return Err(StorageError::corruption(format!(
                                        "continuation item on page {page_id} points at {other:?}"
                                    )))
                                }
                            };
                            record = 0;
                        }
                        Probe::Missing(at) => {
                            if !create {
                                trace!(depth, segment, "tree.lookup.miss");
                                return Ok(None);
                            }
                            if self.try_insert(pager, &mut page, record, at, segment)? {
                                break (page, at);
                            }
                            splits += 1;
                            if splits > MAX_SPLITS_PER_INSERT {
                                return Err(StorageError::CapacityExceeded(format!(
                                    "segment {segment:?} does not fit after {MAX_SPLITS_PER_INSERT} splits"
                                )));
                            }
                            self.split(pager, page_id)?;
                            continue 'restart;
                        }
                    }
                };
                steps.push(TreePos::new(page_id, record, item)?);
                if depth + 1 == segments.len() {
                    return Ok(Some(TreePath { steps }));
                }
                match page.item(record, item)?.child() {
                    Child::Record(child) => record = child as usize,
                    Child::Page(child) => {
                        page_id = child;
                        record = 0;
                    }
                    Child::None if !create => {
                        trace!(depth, segment, "tree.lookup.no_children");
                        return Ok(None);
                    }
                    Child::None => {
                        let (child_page, child_record) =
                            self.add_child_record(pager, &mut page, record, item)?;
                        page_id = child_page;
                        record = child_record;
                    }
                }
            }
            return Ok(None);
        }
    }

    /// Inserts a fresh item at `at`, or returns false when the page is full.
    fn try_insert(
        &mut self,
        pager: &mut Pager,
        page: &mut TreePage,
        record: usize,
        at: usize,
        name: &str,
    ) -> Result<bool> {
        let name_len = mutf8::encoded_len(name);
        let stored_len = if name_len > pager.page_size() / 4 {
            9
        } else {
            name_len
        };
        let needed = CB_RECORD_METADATA_PER_ITEM + self.item_payload + stored_len;
        if page.total_size(self.item_payload) + needed > pager.page_size() {
            return Ok(false);
        }
        let encoded = encode_name(pager, name)?;
        let items = &mut page
            .records
            .get_mut(record)
            .ok_or_else(|| StorageError::corruption(format!("record {record} vanished")))?
            .items;
        items.insert(
            at,
            Item {
                name: name.to_owned(),
                encoded,
                child: 0,
                row_id: 0,
                stamp: 0,
            },
        );
        self.store(pager, page)?;
        self.note_items(page, record, at + 1)?;
        Ok(true)
    }

    /// Creates the child record of an item that has none: on the same page
    /// when it fits, otherwise as record 0 of a fresh page.
    fn add_child_record(
        &mut self,
        pager: &mut Pager,
        page: &mut TreePage,
        record: usize,
        item: usize,
    ) -> Result<(PageId, usize)> {
        let needed = CB_PAGE_METADATA_PER_RECORD + CB_EMPTY_RECORD_METADATA;
        if page.total_size(self.item_payload) + needed <= pager.page_size()
            && page.records.len() < PAGE_MARKER as usize
        {
            let child = page.push_empty_record();
            page.item_mut(record, item)?.child = child as u16;
            self.store(pager, page)?;
            return Ok((page.id, child));
        }
        let child_id = self.allocate(pager)?;
        let mut child = TreePage::empty(child_id);
        child.push_empty_record();
        self.store(pager, &child)?;
        page.item_mut(record, item)?.child = Child::encode_page(child_id)?;
        self.store(pager, page)?;
        trace!(page = page.id.0, child = child_id.0, "tree.child_page");
        Ok((child_id, 0))
    }

    fn split(&mut self, pager: &mut Pager, page_id: PageId) -> Result<()> {
        let mut page = self.load(pager, page_id)?;
        if let Some(largest) = page.largest_record(self.item_payload) {
            let target_id = self.allocate(pager)?;
            let mut target = TreePage::empty(target_id);
            page.move_record(largest, &mut target)?;
            self.store(pager, &page)?;
            self.store(pager, &target)?;
            self.note_page(&page)?;
            self.note_page(&target)?;
            debug!(
                page = page_id.0,
                record = largest,
                target = target_id.0,
                "tree.split.record"
            );
            return Ok(());
        }

        let count = page.record(0)?.items.len();
        if count < 2 {
            return Err(StorageError::CapacityExceeded(format!(
                "record 0 of tree page {page_id} cannot be split further"
            )));
        }
        let moved = page.records[0].items.split_off(count / 2);
        let target_id = self.allocate(pager)?;
        let target = TreePage {
            id: target_id,
            records: vec![Record { items: moved }],
        };
        let separator = target.item(0, 0)?.name.clone();
        let encoded = encode_name(pager, &separator)?;
        page.records[0].items.push(Item {
            name: separator,
            encoded,
            child: Child::encode_page(target_id)?,
            row_id: CONTINUATION_ROW_ID,
            stamp: 0,
        });
        self.store(pager, &page)?;
        self.store(pager, &target)?;
        self.note_page(&target)?;
        debug!(
            page = page_id.0,
            target = target_id.0,
            moved = count - count / 2,
            "tree.split.continuation"
        );
        Ok(())
    }

    /// Removes the item at the end of `path`. An item that still has
    /// children only loses its row id. Emptied child records and pages are
    /// reclaimed; ancestors are never removed.
    pub fn delete(&mut self, pager: &mut Pager, path: &TreePath) -> Result<()> {
        let target = path.target();
        let mut page = self.load(pager, target.page)?;
        let record = target.record as usize;
        let item = target.item as usize;
        let entry = page.item(record, item)?;
        if entry.child() != Child::None {
            page.item_mut(record, item)?.row_id = 0;
            self.store(pager, &page)?;
            trace!(pos = %target, "tree.delete.keep_prefix");
            return Ok(());
        }
        let removed = page.records[record].items.remove(item);
        if let Some(chain) = removed.overflow_page() {
            overflow::free_chain(pager, chain)?;
        }
        self.store(pager, &page)?;
        self.note_items(&page, record, item)?;
        trace!(pos = %target, name = %removed.name, "tree.delete");

        let mut index = path.steps.len() - 1;
        loop {
            let step = path.steps[index];
            let record = step.record as usize;
            let page = self.load(pager, step.page)?;
            if !page.record(record)?.items.is_empty() || index == 0 {
                return Ok(());
            }
            let parent = path.steps[index - 1];
            if record != 0 {
                let mut holder = page;
                holder
                    .item_mut(parent.record as usize, parent.item as usize)?
                    .child = 0;
                holder.remove_record(record)?;
                self.store(pager, &holder)?;
                self.note_page(&holder)?;
                return Ok(());
            }
            if page.records.len() > 1 || step.page == self.root {
                return Ok(());
            }
            pager.free_page(step.page)?;

            let mut holder = self.load(pager, parent.page)?;
            let link = holder.item(parent.record as usize, parent.item as usize)?;
            if link.is_continuation() {
                let link = holder.records[parent.record as usize]
                    .items
                    .remove(parent.item as usize);
                if let Some(chain) = link.overflow_page() {
                    overflow::free_chain(pager, chain)?;
                }
                self.store(pager, &holder)?;
                index -= 1;
                continue;
            }
            holder
                .item_mut(parent.record as usize, parent.item as usize)?
                .child = 0;
            self.store(pager, &holder)?;
            return Ok(());
        }
    }

    /// Deletes `segments` if present. Returns whether it was found.
    pub fn delete_key<S: AsRef<str>>(&mut self, pager: &mut Pager, segments: &[S]) -> Result<bool> {
        match self.find_path(pager, segments)? {
            Some(path) => {
                self.delete(pager, &path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Row id stored on the item at `pos`; zero or less means none.
    pub fn row_id(&self, pager: &mut Pager, pos: TreePos) -> Result<i32> {
        let page = self.load(pager, pos.page)?;
        Ok(page.item(pos.record as usize, pos.item as usize)?.row_id)
    }

    /// Stores `row_id` on the item at `pos`.
    pub fn set_row_id(&self, pager: &mut Pager, pos: TreePos, row_id: i32) -> Result<()> {
        let mut page = self.load(pager, pos.page)?;
        page.item_mut(pos.record as usize, pos.item as usize)?.row_id = row_id;
        self.store(pager, &page)
    }

    /// Stamp stored with the item, or `None` when stamps are not recorded.
    pub fn timestamp(&self, pager: &mut Pager, pos: TreePos) -> Result<Option<i64>> {
        if !self.records_timestamps() {
            return Ok(None);
        }
        let page = self.load(pager, pos.page)?;
        Ok(Some(page.item(pos.record as usize, pos.item as usize)?.stamp))
    }

    /// Fails unless the tree [records timestamps](Self::records_timestamps).
    pub fn set_timestamp(&self, pager: &mut Pager, pos: TreePos, stamp: i64) -> Result<()> {
        if !self.records_timestamps() {
            return Err(StorageError::InvalidArgument(
                "tree was opened without timestamps".into(),
            ));
        }
        let mut page = self.load(pager, pos.page)?;
        page.item_mut(pos.record as usize, pos.item as usize)?.stamp = stamp;
        self.store(pager, &page)
    }

    /// Drains the positions of items moved since the last call.
    pub fn take_relocations(&mut self) -> Vec<Relocation> {
        std::mem::take(&mut self.relocations)
    }

    /// Every item in depth-first, lexicographic order.
    pub fn walk<'p>(&self, pager: &'p mut Pager) -> TreeWalk<'p> {
        TreeWalk::new(pager, self.root, self.item_payload)
    }

    /// Items without children, in walk order.
    pub fn leaves(&self, pager: &mut Pager) -> Result<Vec<TreeEntry>> {
        self.walk(pager)
            .filter(|entry| entry.as_ref().map_or(true, |entry| !entry.has_children))
            .collect()
    }

    /// Key stored at `pos`, found by walking the tree.
    pub fn key_at(&self, pager: &mut Pager, pos: TreePos) -> Result<Option<Vec<String>>> {
        for entry in self.walk(pager) {
            let entry = entry?;
            if entry.pos == pos {
                return Ok(Some(entry.path));
            }
        }
        Ok(None)
    }

    /// Walks every page of the tree.
    pub fn stats(&self, pager: &mut Pager) -> Result<TreeStoreStats> {
        let mut stats = TreeStoreStats::default();
        let mut queue = VecDeque::from([self.root]);
        while let Some(page_id) = queue.pop_front() {
            let page = self.load(pager, page_id)?;
            stats.pages += 1;
            stats.records += page.records.len() as u64;
            stats.bytes_used += page.total_size(self.item_payload) as u64;
            for item in page.records.iter().flat_map(|rec| rec.items.iter()) {
                if let Child::Page(child) = item.child() {
                    queue.push_back(child);
                }
                if item.is_continuation() {
                    stats.continuation_items += 1;
                    continue;
                }
                let len = item.name.encode_utf16().count() as u64;
                stats.items += 1;
                stats.total_segment_len += len;
                stats.max_segment_len = stats.max_segment_len.max(len);
                if item.overflow_page().is_some() {
                    stats.long_segments += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Textual dump of every page, breadth first.
    pub fn dump(&self, pager: &mut Pager, detailed: bool) -> Result<String> {
        let mut out = String::new();
        self.dump_into(pager, &mut out, 0, detailed)?;
        Ok(out)
    }

    pub(crate) fn dump_into(
        &self,
        pager: &mut Pager,
        out: &mut String,
        level: usize,
        detailed: bool,
    ) -> Result<()> {
        let _ = writeln!(out, "{}TreeStore root={}", indent(level), self.root);
        let mut queue = VecDeque::from([self.root]);
        while let Some(page_id) = queue.pop_front() {
            let page = self.load(pager, page_id)?;
            let _ = write!(
                out,
                "{}PAGE {}: {} records",
                indent(level + 1),
                page.id,
                page.records.len()
            );
            if detailed {
                let _ = write!(
                    out,
                    " ({}/{} bytes)",
                    page.total_size(self.item_payload),
                    pager.page_size()
                );
            }
            out.push('\n');
            for (rec, record) in page.records.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}Rec{}: {} items",
                    indent(level + 2),
                    rec,
                    record.items.len()
                );
                for (index, item) in record.items.iter().enumerate() {
                    let child = match item.child() {
                        Child::None => "NONE".to_string(),
                        Child::Record(rec) => format!("Rec{rec}"),
                        Child::Page(child) => {
                            queue.push_back(child);
                            format!("Page{child}")
                        }
                    };
                    let _ = write!(
                        out,
                        "{}Item{}: child {} \"{}\" 0 0 0 {}",
                        indent(level + 3),
                        index,
                        child,
                        item.name,
                        item.row_id
                    );
                    if detailed && self.records_timestamps() {
                        let _ = write!(out, " stamp={}", item.stamp);
                    }
                    out.push('\n');
                }
            }
        }
        Ok(())
    }

    /// Deterministic dump used as a test oracle.
    pub fn to_testable_string(&self, pager: &mut Pager) -> Result<String> {
        self.dump(pager, false)
    }

    /// Decodes a page. A never-written root reads as one empty record.
    fn load(&self, pager: &mut Pager, id: PageId) -> Result<TreePage> {
        let image = pager.read_page(id)?;
        let mut page = TreePage::decode(pager, id, &image, self.item_payload)?;
        if id == self.root && page.records.is_empty() {
            page.push_empty_record();
        }
        Ok(page)
    }

    fn store(&self, pager: &mut Pager, page: &TreePage) -> Result<()> {
        #[cfg(debug_assertions)]
        page.check_sorted()?;
        let image = page.encode(pager.page_size(), self.item_payload)?;
        pager.write_page(page.id, &image)
    }

    /// Allocates a page that a child pointer can address.
    fn allocate(&self, pager: &mut Pager) -> Result<PageId> {
        let id = pager.allocate_page()?;
        if let Err(err) = Child::encode_page(id) {
            pager.free_page(id)?;
            return Err(err);
        }
        Ok(id)
    }

    fn note_items(&mut self, page: &TreePage, record: usize, from: usize) -> Result<()> {
        let items = &page.record(record)?.items;
        for (index, item) in items.iter().enumerate().skip(from) {
            if item.row_id > 0 {
                self.relocations.push(Relocation {
                    row_id: item.row_id,
                    pos: TreePos::new(page.id, record, index)?,
                });
            }
        }
        Ok(())
    }

    fn note_page(&mut self, page: &TreePage) -> Result<()> {
        for record in 0..page.records.len() {
            self.note_items(page, record, 0)?;
        }
        Ok(())
    }
}

fn indent(level: usize) -> String {
    "  ".repeat(level)
}

fn join<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}
