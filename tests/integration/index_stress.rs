#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Once;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;
use xref_index::{
    Index, IndexConfig, Location, LocationInfo, LocationRegistry, PathAndModStamp, SourceHandle,
};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const FILES: usize = 8;
const NAMES: usize = 6;
const STEPS: usize = 80;
const SEED: u64 = 0x0ddb_a11e;
const REVERSE: &str = "reverse-edges";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn file(n: usize) -> String {
    format!("lib/unit{n}.dart")
}

fn element(file_no: usize, name: usize) -> Location {
    Location::element(file(file_no), format!("m{name}"))
}

/// What each indexed file last committed.
#[derive(Default)]
struct Content {
    stamp: i64,
    declared: BTreeSet<Location>,
    edges: Vec<(Location, Location)>,
}

fn random_content(rng: &mut ChaCha8Rng, file_no: usize, stamp: i64) -> Content {
    let mut content = Content {
        stamp,
        ..Content::default()
    };
    for name in 0..NAMES {
        if !rng.gen_bool(0.6) {
            continue;
        }
        let source = element(file_no, name);
        content.declared.insert(source.clone());
        for _ in 0..rng.gen_range(0..3) {
            let destination = element(rng.gen_range(0..FILES), rng.gen_range(0..NAMES));
            content.edges.push((source.clone(), destination));
        }
    }
    content
}

fn commit(
    index: &Index,
    file_no: usize,
    content: &Content,
) -> Result<Vec<SourceHandle>, Box<dyn std::error::Error>> {
    let mut tx = index.begin_file(file(file_no), content.stamp)?;
    {
        let mut layer = tx.layer(REVERSE)?;
        for location in &content.declared {
            let mut updater = layer.start_location(location.clone());
            for (source, destination) in &content.edges {
                if source == location {
                    updater.has_reference_to(destination.clone());
                }
            }
        }
    }
    Ok(tx.commit()?)
}

fn check_against_model(index: &Index, model: &BTreeMap<usize, Content>) -> TestResult {
    let mut expected: BTreeMap<Location, BTreeSet<Location>> = BTreeMap::new();
    for content in model.values() {
        for (source, destination) in &content.edges {
            expected
                .entry(destination.clone())
                .or_default()
                .insert(source.clone());
        }
    }
    for file_no in 0..FILES {
        for name in 0..NAMES {
            let location = element(file_no, name);
            let stored = index.get_location_info(&location, REVERSE)?;
            match expected.get(&location) {
                Some(sources) => {
                    let info = stored.ok_or_else(|| format!("{location} lost its sources"))?;
                    assert_eq!(info.sources(), sources, "sources of {location}");
                }
                None => assert!(stored.is_none(), "{location} kept stale sources"),
            }
        }
    }

    let headers: Vec<PathAndModStamp> = model
        .iter()
        .map(|(file_no, content)| PathAndModStamp::new(file(*file_no), content.stamp))
        .collect();
    assert_eq!(index.load_all_file_headers()?, headers);
    Ok(())
}

#[test]
fn randomized_reindexing_matches_model_and_survives_reopen() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("stress.idx");
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut model: BTreeMap<usize, Content> = BTreeMap::new();

    let index = Index::open(&path, IndexConfig::testing(), LocationRegistry::standard())?;
    for step in 0..STEPS {
        let file_no = rng.gen_range(0..FILES);
        let vanished: BTreeSet<Location> = model
            .get(&file_no)
            .map(|content| content.declared.clone())
            .unwrap_or_default();

        let (affected, declared) = if model.contains_key(&file_no) && rng.gen_bool(0.2) {
            let affected = index.remove_file(file(file_no))?;
            model.remove(&file_no);
            (affected, BTreeSet::new())
        } else {
            let content = random_content(&mut rng, file_no, step as i64 + 1);
            let affected = commit(&index, file_no, &content)?;
            let declared = content.declared.clone();
            model.insert(file_no, content);
            (affected, declared)
        };

        // Every other file still pointing at a vanished location is reported.
        for (other, content) in model.iter().filter(|(other, _)| **other != file_no) {
            let points_at_vanished = content.edges.iter().any(|(_, destination)| {
                vanished.contains(destination) && !declared.contains(destination)
            });
            if points_at_vanished {
                assert!(
                    affected.contains(&SourceHandle::new(file(*other))),
                    "step {step}: {} not reported",
                    file(*other)
                );
            }
        }
        check_against_model(&index, &model)?;
    }

    let dump = index.disk_index_as_string()?;
    index.close()?;
    let index = Index::open(&path, IndexConfig::testing(), LocationRegistry::standard())?;
    assert_eq!(index.disk_index_as_string()?, dump);
    check_against_model(&index, &model)?;
    Ok(())
}
