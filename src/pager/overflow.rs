//! Chains of pages holding values too large for their home page.
//!
//! Every chain page is laid out as `[next:u32][len:u16][bytes]`, with a zero
//! `next` ending the chain.

use crate::codec::{get_u16, get_u32, put_u32};
use crate::error::{Result, StorageError};

use super::{PageId, Pager};

const NEXT_OFFSET: usize = 0;
const LEN_OFFSET: usize = 4;
const DATA_OFFSET: usize = 6;

fn chunk_capacity(pager: &Pager) -> usize {
    pager.page_size() - DATA_OFFSET
}

/// Stores `bytes` in freshly allocated pages and returns the first one.
pub fn write_chain(pager: &mut Pager, bytes: &[u8]) -> Result<PageId> {
    let capacity = chunk_capacity(pager);
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![bytes]
    } else {
        bytes.chunks(capacity).collect()
    };
    let mut pages = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        pages.push(pager.allocate_page()?);
    }
    for (index, chunk) in chunks.iter().enumerate() {
        let next = pages.get(index + 1).map_or(0, |page| page.0);
        pager.with_page_mut(pages[index], |data| {
            put_u32(data, NEXT_OFFSET, next)?;
            data[LEN_OFFSET..DATA_OFFSET].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            data[DATA_OFFSET..DATA_OFFSET + chunk.len()].copy_from_slice(chunk);
            Ok(())
        })?;
    }
    Ok(pages[0])
}

/// Reads the whole value stored in the chain starting at `head`.
pub fn read_chain(pager: &mut Pager, head: PageId) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for_each_page(pager, head, |data| {
        let len = get_u16(data, LEN_OFFSET)? as usize;
        let chunk = data.get(DATA_OFFSET..DATA_OFFSET + len).ok_or_else(|| {
            StorageError::corruption(format!("overflow chunk of {len} bytes overruns page"))
        })?;
        out.extend_from_slice(chunk);
        Ok(())
    })?;
    Ok(out)
}

/// Returns every page of the chain to the free list.
pub fn free_chain(pager: &mut Pager, head: PageId) -> Result<()> {
    let mut pages = Vec::new();
    let mut cursor = Some(head);
    while let Some(page) = cursor {
        guard_cycle(pager, pages.len())?;
        pages.push(page);
        let next = pager.with_page(page, |data| get_u32(data, NEXT_OFFSET))?;
        cursor = (next != 0).then_some(PageId(next));
    }
    for page in pages {
        pager.free_page(page)?;
    }
    Ok(())
}

fn for_each_page(
    pager: &mut Pager,
    head: PageId,
    mut visit: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    let mut cursor = Some(head);
    let mut visited = 0usize;
    while let Some(page) = cursor {
        guard_cycle(pager, visited)?;
        visited += 1;
        let next = pager.with_page(page, |data| {
            visit(data)?;
            get_u32(data, NEXT_OFFSET)
        })?;
        cursor = (next != 0).then_some(PageId(next));
    }
    Ok(())
}

fn guard_cycle(pager: &Pager, visited: usize) -> Result<()> {
    if visited as u64 >= u64::from(pager.page_count()) {
        return Err(StorageError::corruption("overflow chain contains a cycle"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{PagerOptions, StoreLayout, Synchronous};
    use tempfile::tempdir;

    fn open(path: &std::path::Path) -> Result<Pager> {
        Pager::open(
            path,
            PagerOptions {
                page_size: 512,
                synchronous: Synchronous::Off,
                ..PagerOptions::default()
            },
            StoreLayout {
                special_pages: 1,
                catalog_slots: 1,
                item_payload: 4,
            },
        )
    }

    #[test]
    fn multi_page_value_roundtrips_and_frees() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&dir.path().join("chain.idx"))?;
        let value: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let head = write_chain(&mut pager, &value)?;
        assert_eq!(pager.page_count(), 2 + 3);
        assert_eq!(read_chain(&mut pager, head)?, value);
        pager.commit()?;

        free_chain(&mut pager, head)?;
        assert_eq!(pager.free_pages()?.len(), 3);
        Ok(())
    }

    #[test]
    fn empty_value_uses_one_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&dir.path().join("empty.idx"))?;
        let head = write_chain(&mut pager, &[])?;
        assert!(read_chain(&mut pager, head)?.is_empty());
        Ok(())
    }

    #[test]
    fn self_referencing_chain_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&dir.path().join("cycle.idx"))?;
        let head = write_chain(&mut pager, b"loop")?;
        pager.with_page_mut(head, |data| put_u32(data, NEXT_OFFSET, head.0))?;
        assert!(matches!(
            read_chain(&mut pager, head),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }
}
