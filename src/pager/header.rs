use crc32fast::Hasher;

use crate::codec::{get_u16, get_u32};
use crate::error::{Result, StorageError};

use super::PageId;

const MAGIC: &[u8; 8] = b"XREFIDX\0";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;
pub(crate) const HEADER_LEN: usize = 48;
const CRC_OFFSET: usize = 44;

/// Shape of the structures stored in a file. Fixed at creation; a mismatch
/// on open means the file was written by an incompatible configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    /// Number of well-known pages following the header page.
    pub special_pages: u32,
    /// Number of per-id info slots kept by the catalog.
    pub catalog_slots: u32,
    /// Bytes of payload stored with every tree item.
    pub item_payload: u32,
}

/// Contents of page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub page_size: u32,
    pub layout: StoreLayout,
    pub page_count: u32,
    pub free_head: Option<PageId>,
    pub commit_counter: u64,
}

impl FileHeader {
    pub(crate) fn new(page_size: u32, layout: StoreLayout) -> Self {
        Self {
            page_size,
            layout,
            page_count: 1 + layout.special_pages,
            free_head: None,
            commit_counter: 0,
        }
    }

    /// Decodes a header region. `Ok(None)` means the region was never written.
    pub(crate) fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < HEADER_LEN {
            return Err(StorageError::corruption(format!(
                "header region of {} bytes is shorter than {HEADER_LEN}",
                data.len()
            )));
        }
        if data[..HEADER_LEN].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(StorageError::corruption(format!(
                "bad index file magic {}",
                hex::encode(&data[..MAGIC.len()])
            )));
        }

        let major = get_u16(data, 8)?;
        let minor = get_u16(data, 10)?;
        if major != VERSION_MAJOR || minor != VERSION_MINOR {
            return Err(StorageError::corruption(format!(
                "unsupported index format {major}.{minor}"
            )));
        }

        let stored_crc = get_u32(data, CRC_OFFSET)?;
        if stored_crc != header_crc(&data[..CRC_OFFSET]) {
            return Err(StorageError::corruption("index header checksum mismatch"));
        }

        let page_size = get_u32(data, 12)?;
        let special_pages = get_u32(data, 16)?;
        let page_count = get_u32(data, 20)?;
        let free_head = get_u32(data, 24)?;
        let catalog_slots = get_u32(data, 28)?;
        let commit_hi = u64::from(get_u32(data, 32)?);
        let commit_lo = u64::from(get_u32(data, 36)?);
        let item_payload = get_u32(data, 40)?;

        if page_count < 1 + special_pages {
            return Err(StorageError::corruption(format!(
                "page count {page_count} smaller than reserved area"
            )));
        }

        Ok(Some(Self {
            page_size,
            layout: StoreLayout {
                special_pages,
                catalog_slots,
                item_payload,
            },
            page_count,
            free_head: (free_head != 0).then_some(PageId(free_head)),
            commit_counter: (commit_hi << 32) | commit_lo,
        }))
    }

    /// Encodes the header into the start of `data`, zeroing the rest.
    pub(crate) fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_LEN {
            return Err(StorageError::corruption("header page shorter than header"));
        }
        data.fill(0);
        data[..MAGIC.len()].copy_from_slice(MAGIC);
        data[8..10].copy_from_slice(&VERSION_MAJOR.to_be_bytes());
        data[10..12].copy_from_slice(&VERSION_MINOR.to_be_bytes());
        data[12..16].copy_from_slice(&self.page_size.to_be_bytes());
        data[16..20].copy_from_slice(&self.layout.special_pages.to_be_bytes());
        data[20..24].copy_from_slice(&self.page_count.to_be_bytes());
        let free = self.free_head.map_or(0, |page| page.0);
        data[24..28].copy_from_slice(&free.to_be_bytes());
        data[28..32].copy_from_slice(&self.layout.catalog_slots.to_be_bytes());
        data[32..36].copy_from_slice(&((self.commit_counter >> 32) as u32).to_be_bytes());
        data[36..40].copy_from_slice(&(self.commit_counter as u32).to_be_bytes());
        data[40..44].copy_from_slice(&self.layout.item_payload.to_be_bytes());
        let crc = header_crc(&data[..CRC_OFFSET]);
        data[CRC_OFFSET..HEADER_LEN].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Checks the header against the configuration the caller opened with.
    pub(crate) fn check_compatible(&self, page_size: u32, layout: StoreLayout) -> Result<()> {
        if self.page_size != page_size {
            return Err(StorageError::corruption(format!(
                "page size mismatch: file uses {}, configured {page_size}",
                self.page_size
            )));
        }
        if self.layout != layout {
            return Err(StorageError::corruption(format!(
                "store layout mismatch: file has {:?}, configured {layout:?}",
                self.layout
            )));
        }
        Ok(())
    }
}

fn header_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
