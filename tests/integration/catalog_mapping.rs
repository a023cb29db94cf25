#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Once;

use proptest::prelude::*;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;
use xref_index::pager::StoreLayout;
use xref_index::tree::ITEM_PAYLOAD;
use xref_index::{
    Catalog, CatalogId, PageId, Pager, PagerOptions, Result, StorageError, Synchronous, TreeStore,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn open(path: &Path, cache_entries: usize) -> Result<(Pager, Catalog)> {
    let mut pager = Pager::open(
        path,
        PagerOptions {
            page_size: 512,
            cache_pages: 8,
            synchronous: Synchronous::Off,
            ..PagerOptions::default()
        },
        StoreLayout {
            special_pages: 2,
            catalog_slots: 3,
            item_payload: ITEM_PAYLOAD as u32,
        },
    )?;
    let tree_root = pager.special_page(0)?;
    let catalog_root = pager.special_page(1)?;
    let tree = TreeStore::open(&mut pager, tree_root, ITEM_PAYLOAD)?;
    let catalog = Catalog::open(&pager, tree, catalog_root, cache_entries)?;
    Ok((pager, catalog))
}

fn element_key(file: usize, name: usize) -> Vec<String> {
    vec![
        "e".to_string(),
        "lib".to_string(),
        format!("src{}", file % 5),
        format!("file{file:03}.dart#member{name}"),
    ]
}

#[test]
fn ids_and_slots_survive_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("catalog.idx");
    let keys: Vec<Vec<String>> = (0..150).map(|n| element_key(n, n % 3)).collect();
    let ids = {
        let (mut pager, mut catalog) = open(&path, 16)?;
        let ids = keys
            .iter()
            .map(|key| catalog.find_or_create(&mut pager, &key[..]))
            .collect::<Result<Vec<_>>>()?;
        catalog.set_slot_page(&mut pager, ids[7], 2, Some(PageId(77)))?;
        pager.commit()?;
        pager.close()?;
        ids
    };

    let (mut pager, mut catalog) = open(&path, 16)?;
    for (key, id) in keys.iter().zip(&ids) {
        assert_eq!(catalog.find(&mut pager, &key[..])?, Some(*id));
        assert_eq!(&catalog.key_for(&mut pager, *id)?, key);
    }
    assert_eq!(catalog.slot_page(&mut pager, ids[7], 2)?, Some(PageId(77)));
    assert_eq!(catalog.next_id(&mut pager)?, CatalogId(151));
    Ok(())
}

#[test]
fn removed_ids_are_never_reused() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (mut pager, mut catalog) = open(&dir.path().join("reuse.idx"), 4)?;
    let first = catalog.find_or_create(&mut pager, &element_key(1, 0)[..])?;
    let second = catalog.find_or_create(&mut pager, &element_key(2, 0)[..])?;
    assert_eq!(
        catalog.remove_key(&mut pager, &element_key(1, 0)[..])?,
        Some(first)
    );
    assert_eq!(catalog.remove_key(&mut pager, &element_key(1, 0)[..])?, None);

    let again = catalog.find_or_create(&mut pager, &element_key(1, 0)[..])?;
    assert!(again.0 > second.0);
    assert!(matches!(
        catalog.slot_page(&mut pager, first, 0),
        Err(StorageError::UnknownCatalogId(_))
    ));
    assert_eq!(catalog.live_ids(&mut pager)?, vec![second, again]);
    Ok(())
}

#[test]
fn small_cache_still_resolves_every_position() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (mut pager, mut catalog) = open(&dir.path().join("cache.idx"), 2)?;
    let keys: Vec<Vec<String>> = (0..80).map(|n| element_key(n, 1)).collect();
    let ids = keys
        .iter()
        .map(|key| catalog.find_or_create(&mut pager, &key[..]))
        .collect::<Result<Vec<_>>>()?;
    for (key, id) in keys.iter().zip(&ids).rev() {
        assert_eq!(&catalog.key_for(&mut pager, *id)?, key);
    }
    let snapshot = catalog.stats().snapshot();
    assert_eq!(snapshot.ids_created, 80);
    assert!(snapshot.cache_misses > 0);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, usize),
    Remove(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..40, 0usize..3).prop_map(|(f, n)| Op::Insert(f, n)),
        1 => (0usize..40, 0usize..3).prop_map(|(f, n)| Op::Remove(f, n)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_live_keys_map_to_unique_ids(ops in prop::collection::vec(op_strategy(), 1..150)) {
        let dir = tempdir().expect("tempdir");
        let (mut pager, mut catalog) = open(&dir.path().join("prop.idx"), 8).expect("open");
        let mut model: BTreeMap<Vec<String>, CatalogId> = BTreeMap::new();
        let mut issued: BTreeSet<CatalogId> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Insert(file, name) => {
                    let key = element_key(file, name);
                    let id = catalog.find_or_create(&mut pager, &key[..]).expect("insert");
                    match model.get(&key) {
                        Some(existing) => prop_assert_eq!(*existing, id),
                        None => {
                            prop_assert!(issued.insert(id), "id {} issued twice", id);
                            model.insert(key, id);
                        }
                    }
                }
                Op::Remove(file, name) => {
                    let key = element_key(file, name);
                    let removed = catalog.remove_key(&mut pager, &key[..]).expect("remove");
                    prop_assert_eq!(removed, model.remove(&key));
                }
            }
        }

        for (key, id) in &model {
            prop_assert_eq!(catalog.find(&mut pager, &key[..]).expect("find"), Some(*id));
            prop_assert_eq!(&catalog.key_for(&mut pager, *id).expect("key"), key);
        }
        let live: BTreeSet<CatalogId> = catalog.live_ids(&mut pager).expect("live").into_iter().collect();
        prop_assert_eq!(live, model.values().copied().collect::<BTreeSet<_>>());
    }
}
