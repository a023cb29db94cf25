//! In-memory form of a tree page and its bit-exact encoding.
//!
//! ```text
//! page:   N off1 .. offN offL rec1 .. recN
//! record: N (off child) x N offL item1 .. itemN
//! item:   rowId:i32 [stamp:i64] name
//! ```
//!
//! All counts and offsets are unsigned 16-bit big-endian values. Record
//! offsets are relative to the page, item offsets to their record.

use std::cmp::Ordering;

use crate::codec::{mutf8, DataReader, DataWriter};
use crate::error::{Result, StorageError};
use crate::pager::{overflow, PageId, Pager};

pub(crate) const CB_EMPTY_PAGE_METADATA: usize = 4;
pub(crate) const CB_PAGE_METADATA_PER_RECORD: usize = 2;
pub(crate) const CB_EMPTY_RECORD_METADATA: usize = 4;
pub(crate) const CB_RECORD_METADATA_PER_ITEM: usize = 4;

/// Child values at or above this marker point at record 0 of page `child - PAGE_MARKER`.
pub(crate) const PAGE_MARKER: u16 = 10_000;

/// Row id carried by continuation items.
pub(crate) const CONTINUATION_ROW_ID: i32 = -1;

const LONG_NAME_TAG: u8 = 0xFF;
const LONG_NAME_STUB_LEN: usize = 9;

/// Where an item's child pointer leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Child {
    None,
    Record(u16),
    Page(PageId),
}

impl Child {
    pub(crate) fn decode(raw: u16) -> Self {
        match raw {
            0 => Child::None,
            raw if raw < PAGE_MARKER => Child::Record(raw),
            raw => Child::Page(PageId(u32::from(raw - PAGE_MARKER))),
        }
    }

    pub(crate) fn encode_page(page: PageId) -> Result<u16> {
        u16::try_from(page.0)
            .ok()
            .and_then(|id| id.checked_add(PAGE_MARKER))
            .ok_or_else(|| {
                StorageError::CapacityExceeded(format!(
                    "tree page {page} cannot be addressed by a 16-bit child pointer"
                ))
            })
    }
}

/// One key segment stored in a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Item {
    /// Decoded segment.
    pub name: String,
    /// Bytes stored on the page for the name: either the encoded name or a
    /// stub pointing at an overflow chain.
    pub encoded: Vec<u8>,
    /// Encoded [`Child`] pointer.
    pub child: u16,
    /// Catalog id of the key ending here, or a marker for continuation items.
    pub row_id: i32,
    /// Modification stamp, when the tree records them.
    pub stamp: i64,
}

impl Item {
    pub(crate) fn is_continuation(&self) -> bool {
        self.row_id == CONTINUATION_ROW_ID && matches!(self.child(), Child::Page(_))
    }

    pub(crate) fn child(&self) -> Child {
        Child::decode(self.child)
    }

    /// Page holding the overflowed name, when the name is stored out of line.
    pub(crate) fn overflow_page(&self) -> Option<PageId> {
        if self.encoded.len() == LONG_NAME_STUB_LEN && self.encoded[0] == LONG_NAME_TAG {
            let raw = [
                self.encoded[5],
                self.encoded[6],
                self.encoded[7],
                self.encoded[8],
            ];
            return Some(PageId(u32::from_be_bytes(raw)));
        }
        None
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Record {
    /// Items sorted by [`compare_names`].
    pub items: Vec<Item>,
}

/// Result of searching a record for a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Probe {
    Found(usize),
    /// The segment sorts at or after the separator of a continuation item.
    Continue(usize),
    /// Not present; would be inserted at this index.
    Missing(usize),
}

/// Compares names by UTF-16 code units, the order items are kept in.
pub(crate) fn compare_names(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TreePage {
    pub id: PageId,
    pub records: Vec<Record>,
}

impl TreePage {
    pub(crate) fn empty(id: PageId) -> Self {
        Self {
            id,
            records: Vec::new(),
        }
    }

    pub(crate) fn item(&self, record: usize, item: usize) -> Result<&Item> {
        self.records
            .get(record)
            .and_then(|rec| rec.items.get(item))
            .ok_or_else(|| {
                StorageError::corruption(format!(
                    "tree page {} has no item {item} in record {record}",
                    self.id
                ))
            })
    }

    pub(crate) fn item_mut(&mut self, record: usize, item: usize) -> Result<&mut Item> {
        let id = self.id;
        self.records
            .get_mut(record)
            .and_then(|rec| rec.items.get_mut(item))
            .ok_or_else(|| {
                StorageError::corruption(format!(
                    "tree page {id} has no item {item} in record {record}"
                ))
            })
    }

    pub(crate) fn record(&self, record: usize) -> Result<&Record> {
        self.records.get(record).ok_or_else(|| {
            StorageError::corruption(format!("tree page {} has no record {record}", self.id))
        })
    }

    pub(crate) fn record_size(&self, record: usize, item_payload: usize) -> usize {
        self.records.get(record).map_or(0, |rec| {
            CB_EMPTY_RECORD_METADATA
                + rec
                    .items
                    .iter()
                    .map(|item| CB_RECORD_METADATA_PER_ITEM + item_payload + item.encoded.len())
                    .sum::<usize>()
        })
    }

    pub(crate) fn total_size(&self, item_payload: usize) -> usize {
        let records = if self.records.is_empty() {
            0
        } else {
            (0..self.records.len())
                .map(|rec| CB_PAGE_METADATA_PER_RECORD + self.record_size(rec, item_payload))
                .sum()
        };
        CB_EMPTY_PAGE_METADATA + records
    }

    /// Binary search for `name` in `record`.
    pub(crate) fn probe(&self, record: usize, name: &str) -> Result<Probe> {
        let items = &self.record(record)?.items;
        if let Some(last) = items.last() {
            if last.is_continuation() && compare_names(name, &last.name) != Ordering::Less {
                return Ok(Probe::Continue(items.len() - 1));
            }
        }
        let searchable = match items.last() {
            Some(last) if last.is_continuation() => &items[..items.len() - 1],
            _ => &items[..],
        };
        Ok(
            match searchable.binary_search_by(|item| compare_names(&item.name, name)) {
                Ok(index) => Probe::Found(index),
                Err(index) => Probe::Missing(index),
            },
        )
    }

    /// Items of every record must be in strictly ascending order, with a
    /// continuation item only in last place.
    #[cfg(debug_assertions)]
    pub(crate) fn check_sorted(&self) -> Result<()> {
        for (index, rec) in self.records.iter().enumerate() {
            let last = rec.items.len().saturating_sub(1);
            let misplaced = rec
                .items
                .iter()
                .take(last)
                .any(|item| item.is_continuation());
            let unordered = rec
                .items
                .windows(2)
                .any(|pair| compare_names(&pair[0].name, &pair[1].name) != Ordering::Less);
            if misplaced || unordered {
                return Err(StorageError::corruption(format!(
                    "record {index} of tree page {} is out of order",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Index of the largest record other than record 0.
    pub(crate) fn largest_record(&self, item_payload: usize) -> Option<usize> {
        (1..self.records.len()).fold(None, |best: Option<(usize, usize)>, rec| {
            let size = self.record_size(rec, item_payload);
            match best {
                Some((_, best_size)) if best_size >= size => best,
                _ => Some((rec, size)),
            }
        })
        .map(|(rec, _)| rec)
    }

    /// Appends an empty record and returns its index.
    pub(crate) fn push_empty_record(&mut self) -> usize {
        self.records.push(Record::default());
        self.records.len() - 1
    }

    /// Removes a record that nothing references, renumbering later ones.
    pub(crate) fn remove_record(&mut self, record: usize) -> Result<()> {
        if record == 0 || record >= self.records.len() {
            return Err(StorageError::InvalidArgument(format!(
                "cannot delete record {record} of tree page {}",
                self.id
            )));
        }
        let raw = record as u16;
        let referenced = self
            .records
            .iter()
            .flat_map(|rec| rec.items.iter())
            .any(|item| item.child == raw);
        if referenced {
            return Err(StorageError::corruption(format!(
                "record {record} of tree page {} is still referenced",
                self.id
            )));
        }
        self.records.remove(record);
        for item in self.records.iter_mut().flat_map(|rec| rec.items.iter_mut()) {
            if item.child > raw && item.child < PAGE_MARKER {
                item.child -= 1;
            }
        }
        Ok(())
    }

    /// Moves `record` and every record below it on this page to `target`,
    /// which must be empty. The moved record becomes record 0 of `target`
    /// and the item that referenced it now points at the new page.
    pub(crate) fn move_record(&mut self, record: usize, target: &mut TreePage) -> Result<()> {
        if record == 0 || record >= self.records.len() {
            return Err(StorageError::InvalidArgument(format!(
                "cannot move record {record} of tree page {}",
                self.id
            )));
        }
        if !target.records.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "target page {} is not empty",
                target.id
            )));
        }
        let mut marked = vec![false; self.records.len()];
        self.copy_subtree(record, target, &mut marked)?;

        let new_child = Child::encode_page(target.id)?;
        let old_child = record as u16;
        for (rec, contents) in self.records.iter_mut().enumerate() {
            if rec == record {
                continue;
            }
            for item in &mut contents.items {
                if item.child == old_child {
                    item.child = new_child;
                }
            }
        }
        for rec in (1..self.records.len()).rev() {
            if marked[rec] {
                self.remove_record(rec)?;
            }
        }
        Ok(())
    }

    fn copy_subtree(
        &mut self,
        record: usize,
        target: &mut TreePage,
        marked: &mut [bool],
    ) -> Result<u16> {
        marked[record] = true;
        let new_record = target.records.len();
        target.records.push(self.records[record].clone());
        for item in 0..self.records[record].items.len() {
            if let Child::Record(child) = self.records[record].items[item].child() {
                let copied = self.copy_subtree(child as usize, target, marked)?;
                target.records[new_record].items[item].child = copied;
                self.records[record].items[item].child = 0;
            }
        }
        u16::try_from(new_record).map_err(|_| {
            StorageError::CapacityExceeded(format!("tree page {} has too many records", target.id))
        })
    }

    /// Decodes a page image, following overflow stubs for long names.
    pub(crate) fn decode(
        pager: &mut Pager,
        id: PageId,
        data: &[u8],
        item_payload: usize,
    ) -> Result<Self> {
        let mut page = Self::empty(id);
        let mut long_names = Vec::new();
        {
            let mut reader = DataReader::new(data);
            let record_count = reader.read_u16()? as usize;
            if record_count == 0 {
                return Ok(page);
            }
            let mut record_offsets = Vec::with_capacity(record_count + 1);
            for _ in 0..=record_count {
                record_offsets.push(reader.read_u16()? as usize);
            }
            for (rec, &start) in record_offsets.iter().take(record_count).enumerate() {
                reader.set_pos(start)?;
                let count = reader.read_u16()? as usize;
                let mut offsets = Vec::with_capacity(count + 1);
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    offsets.push(reader.read_u16()? as usize);
                    children.push(reader.read_u16()?);
                }
                offsets.push(reader.read_u16()? as usize);

                let mut record = Record {
                    items: Vec::with_capacity(count),
                };
                for item in 0..count {
                    let (begin, end) = (offsets[item], offsets[item + 1]);
                    let name_len = end
                        .checked_sub(begin)
                        .and_then(|len| len.checked_sub(item_payload))
                        .ok_or_else(|| {
                            StorageError::corruption(format!(
                                "tree page {id} record {rec} item {item} has offsets {begin}..{end}"
                            ))
                        })?;
                    reader.set_pos(start + begin)?;
                    let row_id = reader.read_i32()?;
                    let stamp = if item_payload >= 12 {
                        reader.read_i64()?
                    } else {
                        0
                    };
                    let encoded = reader.read_bytes(name_len)?.to_vec();
                    let name = if is_long_stub(&encoded) {
                        long_names.push((rec, item));
                        String::new()
                    } else {
                        mutf8::decode(&encoded)?
                    };
                    record.items.push(Item {
                        name,
                        encoded,
                        child: children[item],
                        row_id,
                        stamp,
                    });
                }
                page.records.push(record);
            }
        }
        for (rec, item) in long_names {
            let entry = &mut page.records[rec].items[item];
            entry.name = read_long_name(pager, &entry.encoded)?;
        }
        Ok(page)
    }

    /// Encodes the page into a full page image.
    pub(crate) fn encode(&self, page_size: usize, item_payload: usize) -> Result<Vec<u8>> {
        let total = self.total_size(item_payload);
        if total > page_size {
            return Err(StorageError::CapacityExceeded(format!(
                "tree page {} needs {total} bytes, page holds {page_size}",
                self.id
            )));
        }
        let mut out = DataWriter::with_capacity(page_size);
        let record_count = self.records.len();
        out.write_short(record_count)?;
        let mut offset = CB_EMPTY_PAGE_METADATA + record_count * CB_PAGE_METADATA_PER_RECORD;
        if record_count == 0 {
            out.write_short(CB_EMPTY_PAGE_METADATA)?;
        } else {
            for rec in 0..record_count {
                out.write_short(offset)?;
                offset += self.record_size(rec, item_payload);
            }
            out.write_short(offset)?;
        }
        for record in &self.records {
            out.write_short(record.items.len())?;
            let mut item_offset =
                CB_EMPTY_RECORD_METADATA + CB_RECORD_METADATA_PER_ITEM * record.items.len();
            for item in &record.items {
                out.write_short(item_offset)?;
                out.write_u16(item.child);
                item_offset += item_payload + item.encoded.len();
            }
            out.write_short(item_offset)?;
            for item in &record.items {
                out.write_i32(item.row_id);
                if item_payload >= 12 {
                    out.write_i64(item.stamp);
                }
                out.write_bytes(&item.encoded);
            }
        }
        let mut image = out.into_inner();
        image.resize(page_size, 0);
        Ok(image)
    }
}

fn is_long_stub(encoded: &[u8]) -> bool {
    encoded.len() == LONG_NAME_STUB_LEN && encoded[0] == LONG_NAME_TAG
}

/// Encodes a name for the page, spilling it to an overflow chain when its
/// encoding is longer than a quarter page.
pub(crate) fn encode_name(pager: &mut Pager, name: &str) -> Result<Vec<u8>> {
    let bytes = mutf8::encode(name);
    if bytes.len() <= pager.page_size() / 4 {
        return Ok(bytes);
    }
    let len = i32::try_from(bytes.len())
        .map_err(|_| StorageError::CapacityExceeded("segment longer than i32::MAX".into()))?;
    let head = overflow::write_chain(pager, &bytes)?;
    let mut stub = DataWriter::with_capacity(LONG_NAME_STUB_LEN);
    stub.write_u8(LONG_NAME_TAG);
    stub.write_i32(len);
    stub.write_u32(head.0);
    Ok(stub.into_inner())
}

fn read_long_name(pager: &mut Pager, stub: &[u8]) -> Result<String> {
    let mut reader = DataReader::new(stub);
    reader.read_u8()?;
    let len = reader.read_i32()?;
    let head = PageId(reader.read_u32()?);
    let bytes = overflow::read_chain(pager, head)?;
    if len < 0 || bytes.len() != len as usize {
        return Err(StorageError::corruption(format!(
            "long segment at page {head} has {} bytes, stub says {len}",
            bytes.len()
        )));
    }
    mutf8::decode(&bytes)
}
