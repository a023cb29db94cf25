#![allow(missing_docs)]

use std::sync::Once;

use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;
use xref_index::{
    DependentEntity, Index, IndexConfig, IndexError, IndexState, LocationInfo, Location,
    LocationRegistry, SourceHandle,
};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const REVERSE: &str = "reverse-edges";
const BIDI: &str = "bidirectional-edges";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn open() -> Result<(TempDir, Index), Box<dyn std::error::Error>> {
    init_tracing();
    let dir = tempdir()?;
    let index = Index::open(
        dir.path().join("xref.idx"),
        IndexConfig::testing(),
        LocationRegistry::standard(),
    )?;
    Ok((dir, index))
}

fn l1() -> Location {
    Location::element("lib/a.dart", "L1")
}

fn l2() -> Location {
    Location::element("lib/b.dart", "L2")
}

/// File A declares L1 and references L2; file B declares L2 and
/// references L1.
fn index_a_and_b(index: &Index) -> TestResult {
    let mut tx = index.begin_file("lib/a.dart", 1)?;
    tx.layer(REVERSE)?
        .start_location(l1())
        .has_reference_to(l2());
    assert!(tx.commit()?.is_empty());

    let mut tx = index.begin_file("lib/b.dart", 1)?;
    tx.layer(REVERSE)?
        .start_location(l2())
        .has_reference_to(l1());
    // A referenced B before B was indexed.
    assert_eq!(tx.commit()?, vec![SourceHandle::new("lib/a.dart")]);
    Ok(())
}

#[test]
fn reindexing_a_without_l1_invalidates_b() -> TestResult {
    let (_dir, index) = open()?;
    index_a_and_b(&index)?;

    let l2_info = index
        .get_location_info(&l2(), REVERSE)?
        .ok_or("L2 has no reverse info")?;
    assert!(l2_info.sources().contains(&l1()));

    let mut tx = index.begin_file("lib/a.dart", 2)?;
    tx.declare(Location::element("lib/a.dart", "L3"));
    let affected = tx.commit()?;
    assert_eq!(affected, vec![SourceHandle::new("lib/b.dart")]);

    // A's reference to L2 is gone with the old content of A.
    assert!(index.get_location_info(&l2(), REVERSE)?.is_none());

    // B's own contribution stays until B is re-indexed.
    let l1_info = index
        .get_location_info(&l1(), REVERSE)?
        .ok_or("L1 lost B's reference")?;
    assert!(l1_info.sources().contains(&l2()));
    let b = index
        .file_info(&SourceHandle::new("lib/b.dart"))?
        .ok_or("B is not indexed")?;
    assert_eq!(b.mod_stamp, 1);
    assert!(b.source_locations.contains(&l2()));
    Ok(())
}

#[test]
fn reindexing_b_cleans_up_its_stale_reference() -> TestResult {
    let (_dir, index) = open()?;
    index_a_and_b(&index)?;
    index.begin_file("lib/a.dart", 2)?.commit()?;

    let affected = index.begin_file("lib/b.dart", 2)?.commit()?;
    assert!(affected.is_empty());
    assert!(index.get_location_info(&l1(), REVERSE)?.is_none());
    assert!(index.get_location_info(&l2(), REVERSE)?.is_none());

    let dump = index.disk_index_as_string()?;
    assert!(dump.contains("lib/a.dart stamp=2"), "{dump}");
    assert!(dump.contains("lib/b.dart stamp=2"), "{dump}");
    Ok(())
}

#[test]
fn unchanged_reindex_reports_registered_dependents() -> TestResult {
    let (_dir, index) = open()?;
    index_a_and_b(&index)?;

    let mut tx = index.begin_file("lib/a.dart", 2)?;
    tx.layer(REVERSE)?
        .start_location(l1())
        .has_reference_to(l2());
    let affected = tx.commit()?;
    assert_eq!(affected, vec![SourceHandle::new("lib/b.dart")]);

    let a = index
        .file_info(&SourceHandle::new("lib/a.dart"))?
        .ok_or("A is not indexed")?;
    assert!(a
        .external_dependencies
        .contains(&DependentEntity::File(SourceHandle::new("lib/b.dart"))));
    assert!(a
        .internal_dependencies
        .contains(&DependentEntity::File(SourceHandle::new("lib/b.dart"))));
    Ok(())
}

#[test]
fn bidirectional_edges_are_symmetric_and_removable() -> TestResult {
    let (_dir, index) = open()?;
    let caller = Location::element("lib/a.dart", "caller");
    let callee = Location::element("lib/c.dart", "callee");

    let mut tx = index.begin_file("lib/a.dart", 1)?;
    tx.layer(BIDI)?
        .start_location(caller.clone())
        .has_reference_to(callee.clone());
    tx.commit()?;

    let from = index
        .get_location_info(&caller, BIDI)?
        .ok_or("caller has no info")?;
    assert!(from
        .destinations()
        .is_some_and(|destinations| destinations.contains(&callee)));
    let to = index
        .get_location_info(&callee, BIDI)?
        .ok_or("callee has no info")?;
    assert!(to.sources().contains(&caller));

    // The callee's file loses the back edge, so it is reported.
    let affected = index.remove_file("lib/a.dart")?;
    assert_eq!(affected, vec![SourceHandle::new("lib/c.dart")]);
    assert!(index.get_location_info(&caller, BIDI)?.is_none());
    assert!(index.get_location_info(&callee, BIDI)?.is_none());
    assert!(index.load_all_file_headers()?.is_empty());
    Ok(())
}

#[test]
fn explicit_dependencies_invalidate_the_dependent() -> TestResult {
    let (_dir, index) = open()?;
    let mut tx = index.begin_file("lib/a.dart", 1)?;
    {
        let mut layer = tx.layer(REVERSE)?;
        let mut location = layer.start_location(l1());
        location.dependencies().depends_on("lib/generated.dart");
    }
    tx.commit()?;

    let affected = index.begin_file("lib/generated.dart", 5)?.commit()?;
    assert_eq!(affected, vec![SourceHandle::new("lib/a.dart")]);

    let affected = index.remove_file("lib/generated.dart")?;
    assert_eq!(affected, vec![SourceHandle::new("lib/a.dart")]);
    let files: Vec<String> = index
        .load_all_file_headers()?
        .into_iter()
        .map(|entry| entry.path.to_string())
        .collect();
    assert_eq!(files, vec!["lib/a.dart"]);
    Ok(())
}

#[test]
fn abandoned_transaction_leaves_no_trace() -> TestResult {
    let (_dir, index) = open()?;
    index_a_and_b(&index)?;
    let before = index.disk_index_as_string()?;
    {
        let mut tx = index.begin_file("lib/a.dart", 9)?;
        tx.layer(BIDI)?
            .start_location(Location::element("lib/a.dart", "other"))
            .has_reference_to(l2());
    }
    assert_eq!(index.disk_index_as_string()?, before);
    index.begin_file("lib/a.dart", 9)?.rollback();
    Ok(())
}

#[test]
fn identical_reindex_keeps_catalog_ids() -> TestResult {
    let (_dir, index) = open()?;
    index_a_and_b(&index)?;
    let before = index.stats()?.storage.mapping;
    let dump = index.disk_index_as_string()?;

    for _ in 0..3 {
        let mut tx = index.begin_file("lib/a.dart", 1)?;
        tx.layer(REVERSE)?
            .start_location(l1())
            .has_reference_to(l2());
        tx.commit()?;
    }

    let after = index.stats()?.storage.mapping;
    assert_eq!(after.ids_created, before.ids_created);
    assert_eq!(after.ids_deleted, before.ids_deleted);
    let again = index.disk_index_as_string()?;
    assert!(!again.contains("--deleted--"), "{again}");
    assert_eq!(again, dump);
    Ok(())
}

#[test]
fn unregistered_marker_fails_only_the_request() -> TestResult {
    let (_dir, index) = open()?;
    index_a_and_b(&index)?;
    let dump = index.disk_index_as_string()?;

    let mut tx = index.begin_file("lib/a.dart", 2)?;
    tx.layer(REVERSE)?
        .start_location(l1())
        .has_reference_to(Location::Custom {
            marker: 'q',
            identifier: "unknown".into(),
        });
    let err = tx.commit().err().ok_or("commit accepted an unregistered marker")?;
    assert!(
        matches!(err, IndexError::IndexRequestFailed { .. }),
        "unexpected error: {err}"
    );
    assert!(!err.requires_rebuild());
    assert_eq!(index.state(), IndexState::Ready);
    assert_eq!(index.files_with_errors(), vec![SourceHandle::new("lib/a.dart")]);
    assert_eq!(index.disk_index_as_string()?, dump);

    let mut tx = index.begin_file("lib/b.dart", 2)?;
    tx.layer(REVERSE)?
        .start_location(l2())
        .has_reference_to(l1());
    tx.commit()?;
    let b = index
        .file_info(&SourceHandle::new("lib/b.dart"))?
        .ok_or("B is not indexed")?;
    assert_eq!(b.mod_stamp, 2);
    Ok(())
}
