#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Once;

use proptest::prelude::*;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;
use xref_index::pager::StoreLayout;
use xref_index::tree::{ITEM_PAYLOAD, ITEM_PAYLOAD_WITH_STAMP};
use xref_index::{PageId, Pager, PagerOptions, Result, Synchronous, TreeStore};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn open(path: &Path, page_size: u32, item_payload: usize) -> Result<(Pager, TreeStore)> {
    let mut pager = Pager::open(
        path,
        PagerOptions {
            page_size,
            cache_pages: 8,
            synchronous: Synchronous::Off,
            ..PagerOptions::default()
        },
        StoreLayout {
            special_pages: 1,
            catalog_slots: 1,
            item_payload: item_payload as u32,
        },
    )?;
    let tree = TreeStore::open(&mut pager, PageId(1), item_payload)?;
    Ok((pager, tree))
}

fn walked(tree: &TreeStore, pager: &mut Pager) -> Result<Vec<Vec<String>>> {
    tree.walk(pager)
        .map(|entry| entry.map(|entry| entry.path))
        .collect()
}

#[test]
fn foo_bar_boz_dump_matches_layout() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (mut pager, mut tree) = open(&dir.path().join("fbb.idx"), 1024, ITEM_PAYLOAD)?;
    for key in ["foo", "bar", "boz"] {
        tree.lookup(&mut pager, &[key], true)?;
    }
    let expected = "TreeStore root=1\n\
                    \x20 PAGE 1: 1 records\n\
                    \x20   Rec0: 3 items\n\
                    \x20     Item0: child NONE \"bar\" 0 0 0 0\n\
                    \x20     Item1: child NONE \"boz\" 0 0 0 0\n\
                    \x20     Item2: child NONE \"foo\" 0 0 0 0\n";
    assert_eq!(tree.to_testable_string(&mut pager)?, expected);

    pager.commit()?;
    pager.close()?;
    let (mut pager, tree) = open(&dir.path().join("fbb.idx"), 1024, ITEM_PAYLOAD)?;
    assert_eq!(tree.to_testable_string(&mut pager)?, expected);
    Ok(())
}

#[test]
fn nested_keys_share_prefixes() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (mut pager, mut tree) = open(&dir.path().join("nested.idx"), 1024, ITEM_PAYLOAD)?;
    tree.lookup(&mut pager, &["e", "lib", "a.dart#main"], true)?;
    tree.lookup(&mut pager, &["e", "lib", "b.dart#main"], true)?;
    tree.lookup(&mut pager, &["f", "lib", "a.dart"], true)?;

    let paths: Vec<String> = walked(&tree, &mut pager)?
        .into_iter()
        .map(|path| path.join("/"))
        .collect();
    assert_eq!(
        paths,
        vec![
            "e",
            "e/lib",
            "e/lib/a.dart#main",
            "e/lib/b.dart#main",
            "f",
            "f/lib",
            "f/lib/a.dart",
        ]
    );
    let stats = tree.stats(&mut pager)?;
    assert_eq!(stats.items, 7);
    Ok(())
}

#[test]
fn long_segment_survives_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("long.idx");
    let long = "segment_".repeat(80);
    {
        let (mut pager, mut tree) = open(&path, 512, ITEM_PAYLOAD)?;
        tree.lookup(&mut pager, &["short", long.as_str()], true)?;
        tree.lookup(&mut pager, &["short", "after"], true)?;
        pager.commit()?;
        pager.close()?;
    }
    let (mut pager, mut tree) = open(&path, 512, ITEM_PAYLOAD)?;
    assert!(tree.lookup(&mut pager, &["short", long.as_str()], false)?.is_some());
    assert!(tree.lookup(&mut pager, &["short", "after"], false)?.is_some());
    assert_eq!(tree.stats(&mut pager)?.long_segments, 1);
    Ok(())
}

#[test]
fn timestamps_are_kept_per_item() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (mut pager, mut tree) =
        open(&dir.path().join("stamps.idx"), 1024, ITEM_PAYLOAD_WITH_STAMP)?;
    assert!(tree.records_timestamps());
    let pos = tree
        .lookup(&mut pager, &["f", "a.dart"], true)?
        .ok_or(xref_index::StorageError::NotFound("tree item"))?;
    tree.set_timestamp(&mut pager, pos, 1_700_000_000_000)?;
    assert_eq!(tree.timestamp(&mut pager, pos)?, Some(1_700_000_000_000));
    Ok(())
}

#[test]
fn uncommitted_inserts_are_rolled_back() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (mut pager, mut tree) = open(&dir.path().join("rollback.idx"), 1024, ITEM_PAYLOAD)?;
    tree.lookup(&mut pager, &["kept"], true)?;
    pager.commit()?;
    tree.lookup(&mut pager, &["dropped"], true)?;
    pager.rollback()?;
    assert!(tree.lookup(&mut pager, &["kept"], false)?.is_some());
    assert!(tree.lookup(&mut pager, &["dropped"], false)?.is_none());
    Ok(())
}

fn key_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,6}", 1..4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_inserted_keys_are_found_and_walked_in_order(
        keys in prop::collection::vec(key_strategy(), 1..120)
    ) {
        let dir = tempdir().expect("tempdir");
        let (mut pager, mut tree) =
            open(&dir.path().join("prop.idx"), 512, ITEM_PAYLOAD).expect("open");
        for key in &keys {
            tree.lookup(&mut pager, &key[..], true).expect("insert");
        }
        for key in &keys {
            prop_assert!(tree.lookup(&mut pager, &key[..], false).expect("lookup").is_some());
        }

        let prefixes: BTreeSet<Vec<String>> = keys
            .iter()
            .flat_map(|key| (1..=key.len()).map(move |n| key[..n].to_vec()))
            .collect();
        let walked = walked(&tree, &mut pager).expect("walk");
        prop_assert!(walked.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert_eq!(walked, prefixes.into_iter().collect::<Vec<_>>());
    }
}
