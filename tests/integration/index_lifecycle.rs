#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Once;

use tempfile::tempdir;
use tracing_subscriber::EnvFilter;
use xref_index::{
    Index, IndexConfig, IndexError, IndexState, LayerKind, Location, LocationRegistry,
    PathAndModStamp, SourceHandle, Synchronous,
};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn open(path: &Path, config: IndexConfig) -> Result<Index, IndexError> {
    Index::open(path, config, LocationRegistry::standard())
}

fn index_file(index: &Index, file: &str, stamp: i64) -> Result<Vec<SourceHandle>, IndexError> {
    let mut tx = index.begin_file(file, stamp)?;
    tx.layer("reverse-edges")?
        .start_location(Location::element(file, "main"))
        .has_reference_to(Location::element("lib/core.dart", "print"));
    tx.commit()
}

#[test]
fn config_from_toml_drives_layers() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let toml = r#"
        page_size = 1024
        synchronous = "normal"
        record_timestamps = true

        [[layers]]
        id = "calls"
        kind = "bidirectional"

        [[layers]]
        id = "overrides"
        kind = "reverse"
    "#;
    let config = IndexConfig::from_toml_str(toml, &dir.path().join("xref.toml"))?;
    assert_eq!(config.synchronous, Synchronous::Normal);

    let index = open(&dir.path().join("xref.idx"), config)?;
    let kinds: Vec<LayerKind> = index.layers().iter().map(|layer| layer.kind).collect();
    assert_eq!(kinds, vec![LayerKind::Bidirectional, LayerKind::Reverse]);

    let mut tx = index.begin_file("lib/a.dart", 1)?;
    tx.layer("calls")?
        .start_location(Location::element("lib/a.dart", "f"))
        .has_reference_to(Location::element("lib/a.dart", "g"));
    tx.commit()?;
    assert!(index
        .get_location_info(&Location::element("lib/a.dart", "g"), "calls")?
        .is_some());
    index.close()?;
    Ok(())
}

#[test]
fn invalid_config_is_rejected() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let config = IndexConfig {
        page_size: 1000,
        ..IndexConfig::testing()
    };
    let err = open(&dir.path().join("xref.idx"), config).unwrap_err();
    assert!(matches!(err, IndexError::Config(_)));
    Ok(())
}

#[test]
fn content_survives_close_and_reopen() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("xref.idx");
    let index = open(&path, IndexConfig::testing())?;
    for n in 0..40 {
        index_file(&index, &format!("lib/file{n:02}.dart"), n)?;
    }
    let dump = index.disk_index_as_string()?;
    index.close()?;

    let index = open(&path, IndexConfig::testing())?;
    assert_eq!(index.disk_index_as_string()?, dump);
    let headers = index.load_all_file_headers()?;
    assert_eq!(headers.len(), 40);
    assert_eq!(headers[3], PathAndModStamp::new("lib/file03.dart", 3));

    let core = index
        .get_location_info(&Location::element("lib/core.dart", "print"), "reverse-edges")?
        .ok_or("no sources recorded for print")?;
    assert_eq!(xref_index::LocationInfo::sources(&core).len(), 40);
    Ok(())
}

#[test]
fn corrupt_header_requires_rebuild() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("xref.idx");
    {
        let index = open(&path, IndexConfig::testing())?;
        index_file(&index, "lib/a.dart", 1)?;
        index_file(&index, "lib/b.dart", 1)?;
        index.close()?;
    }
    {
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(b"NOTANIDX")?;
        file.sync_all()?;
    }

    let index = open(&path, IndexConfig::testing())?;
    assert_eq!(index.state(), IndexState::RequiresRebuild);
    let err = index.begin_file("lib/a.dart", 2).map(|_| ()).unwrap_err();
    assert!(err.requires_rebuild());
    assert!(matches!(
        index.load_all_file_headers(),
        Err(IndexError::IndexRequiresFullRebuild { .. })
    ));

    index.begin_rebuild()?;
    index_file(&index, "lib/a.dart", 2)?;
    index.finish_rebuild()?;
    assert_eq!(index.state(), IndexState::Ready);
    assert_eq!(
        index.load_all_file_headers()?,
        vec![PathAndModStamp::new("lib/a.dart", 2)]
    );
    index.close()?;

    let index = open(&path, IndexConfig::testing())?;
    assert_eq!(index.state(), IndexState::Ready);
    assert_eq!(index.load_all_file_headers()?.len(), 1);
    Ok(())
}

#[test]
fn changed_layer_list_requires_rebuild() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("xref.idx");
    {
        let index = open(&path, IndexConfig::testing())?;
        index_file(&index, "lib/a.dart", 1)?;
        index.close()?;
    }
    let mut config = IndexConfig::testing();
    config.layers.push(xref_index::LayerConfig {
        id: "overrides".into(),
        kind: LayerKind::Reverse,
    });
    let index = open(&path, config)?;
    assert_eq!(index.state(), IndexState::RequiresRebuild);
    Ok(())
}

#[test]
fn failed_commit_is_recorded_per_file() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("xref.idx");
    open(&path, IndexConfig::testing())?.close()?;

    let read_only = IndexConfig {
        read_only: true,
        ..IndexConfig::testing()
    };
    let index = open(&path, read_only)?;
    let err = index_file(&index, "lib/a.dart", 1).unwrap_err();
    assert!(matches!(err, IndexError::IndexRequestFailed { .. }));
    assert!(index.has_errors());
    assert_eq!(index.files_with_errors(), vec![SourceHandle::new("lib/a.dart")]);
    assert_eq!(index.state(), IndexState::Ready);
    assert!(index.load_all_file_headers()?.is_empty());
    Ok(())
}

#[test]
fn stats_report_is_json() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let index = open(&dir.path().join("xref.idx"), IndexConfig::testing())?;
    for n in 0..10 {
        index_file(&index, &format!("lib/s{n}.dart"), 1)?;
    }
    let stats = index.stats()?;
    assert_eq!(stats.indexed_files, 10);
    assert_eq!(stats.storage.page_size, 512);
    assert!(stats.storage.tree.items > 10);

    let json: serde_json::Value = serde_json::from_str(&stats.to_json()?)?;
    assert_eq!(json["state"], "ready");
    assert_eq!(json["indexed_files"], 10);
    assert!(json["storage"]["layers"].is_array());
    Ok(())
}

#[test]
fn resync_plans_work_for_a_changed_tree() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let index = open(&dir.path().join("xref.idx"), IndexConfig::testing())?;
    index_file(&index, "lib/a.dart", 1)?;
    index_file(&index, "lib/b.dart", 1)?;

    let plan = index.resync(&[
        PathAndModStamp::new("lib/a.dart", 1),
        PathAndModStamp::new("lib/b.dart", 1),
    ])?;
    assert!(plan.is_empty());

    let plan = index.resync(&[PathAndModStamp::new("lib/b.dart", 2)])?;
    assert_eq!(plan.changed, vec![SourceHandle::new("lib/b.dart")]);
    assert_eq!(plan.removed, vec![SourceHandle::new("lib/a.dart")]);
    for removed in &plan.removed {
        index.remove_file(removed.clone())?;
    }
    assert_eq!(index.load_all_file_headers()?.len(), 1);
    Ok(())
}
