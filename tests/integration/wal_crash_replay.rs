#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Once;

use tempfile::tempdir;
use tracing_subscriber::EnvFilter;
use xref_index::pager::StoreLayout;
use xref_index::{
    Index, IndexConfig, IndexState, Location, LocationRegistry, PageId, Pager, PagerOptions,
    PathAndModStamp, Result, Synchronous,
};

const PAGE: usize = 512;
const COMMIT: u32 = 0x1;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn options() -> PagerOptions {
    PagerOptions {
        page_size: PAGE as u32,
        cache_pages: 4,
        synchronous: Synchronous::Full,
        ..PagerOptions::default()
    }
}

fn layout() -> StoreLayout {
    StoreLayout {
        special_pages: 2,
        catalog_slots: 1,
        item_payload: 4,
    }
}

fn wal_path(db: &Path) -> PathBuf {
    let mut path = db.as_os_str().to_owned();
    path.push(".wal");
    PathBuf::from(path)
}

struct Frame {
    page: u32,
    tx: u64,
    flags: u32,
    data: Vec<u8>,
}

/// Writes a log in the on-disk WAL format, as a crash between the WAL sync
/// and the checkpoint would leave it.
fn write_wal(db: &Path, frames: &[Frame]) -> Result<()> {
    let mut bytes = vec![0u8; 32];
    bytes[..8].copy_from_slice(b"XREFWAL\0");
    bytes[8..10].copy_from_slice(&1u16.to_le_bytes());
    bytes[10..12].copy_from_slice(&0u16.to_le_bytes());
    bytes[12..16].copy_from_slice(&(PAGE as u32).to_le_bytes());
    for (number, frame) in frames.iter().enumerate() {
        bytes.extend_from_slice(&frame.page.to_le_bytes());
        bytes.extend_from_slice(&(number as u32 + 1).to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&frame.data).to_le_bytes());
        bytes.extend_from_slice(&frame.tx.to_le_bytes());
        bytes.extend_from_slice(&frame.flags.to_le_bytes());
        bytes.extend_from_slice(&frame.data);
    }
    fs::write(wal_path(db), bytes)?;
    Ok(())
}

fn page_frame(page: PageId, tx: u64, fill: u8) -> Frame {
    Frame {
        page: page.0,
        tx,
        flags: 0,
        data: vec![fill; PAGE],
    }
}

fn commit_frame(tx: u64) -> Frame {
    Frame {
        page: 0,
        tx,
        flags: COMMIT,
        data: vec![0; PAGE],
    }
}

/// Creates a store with one committed data page and returns its id.
fn store_with_page(path: &Path) -> Result<PageId> {
    let mut pager = Pager::open(path, options(), layout())?;
    let page = pager.allocate_page()?;
    pager.write_page(page, &vec![0x11; PAGE])?;
    pager.commit()?;
    pager.close()?;
    Ok(page)
}

fn first_byte(pager: &mut Pager, page: PageId) -> Result<u8> {
    pager.with_page(page, |data| Ok(data[0]))
}

#[test]
fn committed_wal_frames_are_replayed_on_open() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("replay.idx");
    let page = store_with_page(&path)?;
    write_wal(&path, &[page_frame(page, 50, 0xAB), commit_frame(50)])?;

    let mut pager = Pager::open(&path, options(), layout())?;
    assert_eq!(first_byte(&mut pager, page)?, 0xAB);
    assert_eq!(fs::metadata(wal_path(&path))?.len(), 32);
    pager.close()?;

    // The checkpoint reached the main file.
    let mut pager = Pager::open(&path, options(), layout())?;
    assert_eq!(first_byte(&mut pager, page)?, 0xAB);
    Ok(())
}

#[test]
fn frames_without_commit_are_discarded() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("partial.idx");
    let page = store_with_page(&path)?;
    write_wal(
        &path,
        &[
            page_frame(page, 60, 0xAA),
            commit_frame(60),
            page_frame(page, 61, 0xCD),
        ],
    )?;

    let mut pager = Pager::open(&path, options(), layout())?;
    assert_eq!(first_byte(&mut pager, page)?, 0xAA);
    Ok(())
}

#[test]
fn torn_tail_is_ignored() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("torn.idx");
    let page = store_with_page(&path)?;
    write_wal(&path, &[page_frame(page, 70, 0x70), commit_frame(70)])?;
    let mut wal = OpenOptions::new().append(true).open(wal_path(&path))?;
    wal.write_all(&[0x5A; 40])?;
    drop(wal);

    let mut pager = Pager::open(&path, options(), layout())?;
    assert_eq!(first_byte(&mut pager, page)?, 0x70);
    Ok(())
}

#[test]
fn crash_before_commit_loses_only_staged_pages() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("crash.idx");
    let page = store_with_page(&path)?;
    let pages_before = {
        let mut pager = Pager::open(&path, options(), layout())?;
        let count = pager.page_count();
        pager.write_page(page, &vec![0x99; PAGE])?;
        pager.allocate_page()?;
        // Dropped without commit or close.
        drop(pager);
        count
    };

    let mut pager = Pager::open(&path, options(), layout())?;
    assert_eq!(pager.page_count(), pages_before);
    assert_eq!(first_byte(&mut pager, page)?, 0x11);
    Ok(())
}

#[test]
fn index_content_survives_an_unclosed_handle() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("xref.idx");
    {
        let index = Index::open(&path, IndexConfig::testing(), LocationRegistry::standard())?;
        let mut tx = index.begin_file("lib/a.dart", 3)?;
        tx.layer("reverse-edges")?
            .start_location(Location::element("lib/a.dart", "main"))
            .has_reference_to(Location::element("lib/b.dart", "helper"));
        tx.commit()?;

        let mut tx = index.begin_file("lib/c.dart", 4)?;
        tx.declare(Location::element("lib/c.dart", "lost"));
        drop(tx);
        // Dropped without close.
    }

    let index = Index::open(&path, IndexConfig::testing(), LocationRegistry::standard())?;
    assert_eq!(index.state(), IndexState::Ready);
    assert_eq!(
        index.load_all_file_headers()?,
        vec![PathAndModStamp::new("lib/a.dart", 3)]
    );
    Ok(())
}
