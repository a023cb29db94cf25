//! The index facade: lifecycle states, error bookkeeping and the entry
//! points used by a re-indexing pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::error::{IndexError, IndexResult, StorageError};
use crate::file_info::{FileInfo, PathAndModStamp, NOT_INDEXED};
use crate::layers::{Layer, LayerId, LayerInfo};
use crate::location::{Location, LocationRegistry, SourceHandle};
use crate::storage::{IndexStorage, StorageStats};
use crate::transaction::{self, FileTransaction, Staging};

/// Lifecycle state of an open index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Reads and writes are served.
    Ready,
    /// Content is being rebuilt; reads would be incomplete.
    Rebuilding,
    /// The stored content is unusable until a rebuild starts.
    RequiresRebuild,
}

/// Difference between the stored stamps and the caller's view of the files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncPlan {
    /// Indexed with a different stamp.
    pub changed: Vec<SourceHandle>,
    /// Present on the caller's side but not indexed.
    pub added: Vec<SourceHandle>,
    /// Indexed but gone on the caller's side.
    pub removed: Vec<SourceHandle>,
}

impl ResyncPlan {
    /// Whether the stored stamps already match.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Report returned by [`Index::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    /// Lifecycle state when the report was taken.
    pub state: IndexState,
    /// Files with a real mod stamp; placeholders are not counted.
    pub indexed_files: usize,
    /// Files whose last request failed.
    pub files_with_errors: usize,
    /// Pager, catalog and slot reports.
    pub storage: StorageStats,
}

impl IndexStats {
    /// Pretty-printed JSON, for logs and diagnostics.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Diagnostic,
}

#[derive(Debug)]
struct IndexInner {
    storage: IndexStorage,
    state: IndexState,
    rebuild_reason: String,
    rebuild_files: Vec<SourceHandle>,
    files_with_errors: BTreeSet<SourceHandle>,
}

impl IndexInner {
    fn check(&self, access: Access) -> IndexResult<()> {
        match (self.state, access) {
            (IndexState::RequiresRebuild, _) => Err(IndexError::IndexRequiresFullRebuild {
                reason: self.rebuild_reason.clone(),
                files: self.rebuild_files.clone(),
            }),
            (IndexState::Rebuilding, Access::Read) => Err(IndexError::IndexIsStillBuilding),
            _ => Ok(()),
        }
    }

    /// Moves into [`IndexState::RequiresRebuild`], remembering which files
    /// the caller will have to index again.
    fn require_rebuild(&mut self, reason: String) -> IndexError {
        if let Err(err) = self.storage.rollback() {
            warn!(error = %err, "index.rollback.failed");
        }
        let files = match self.storage.read_file_names_and_stamps() {
            Ok(files) => files.into_iter().map(|entry| entry.path).collect(),
            Err(err) => {
                debug!(error = %err, "index.requires_rebuild.file_list_unreadable");
                Vec::new()
            }
        };
        error!(reason = %reason, files = files.len(), "index.requires_rebuild");
        self.state = IndexState::RequiresRebuild;
        self.rebuild_reason = reason.clone();
        self.rebuild_files = files.clone();
        IndexError::IndexRequiresFullRebuild { reason, files }
    }

    /// Converts a failure outside any transaction.
    fn fail(&mut self, err: StorageError) -> IndexError {
        if err.is_structural() {
            return self.require_rebuild(err.to_string());
        }
        IndexError::from(err)
    }

    /// Converts a failure while applying `file`, undoing its staged pages.
    fn fail_file(&mut self, file: &SourceHandle, err: StorageError) -> IndexError {
        if err.is_structural() {
            return self.require_rebuild(err.to_string());
        }
        if let Err(rollback) = self.storage.rollback() {
            warn!(file = %file, error = %rollback, "index.rollback.failed");
        }
        warn!(file = %file, error = %err, "index.file.failed");
        self.files_with_errors.insert(file.clone());
        IndexError::request_failed(file, err)
    }
}

/// An open cross-reference index.
///
/// `Index` is `Send + Sync`. Reads and commits are serialized by an
/// internal lock; a [`FileTransaction`] stages its updates without holding
/// it. At most one transaction is open at a time.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    layers: Vec<Layer>,
    inner: Mutex<IndexInner>,
    transaction_open: AtomicBool,
}

impl Index {
    /// Opens or creates the index at `path`.
    ///
    /// A file whose structure cannot be read is replaced by an empty store
    /// and the index starts in [`IndexState::RequiresRebuild`]. In
    /// read-only mode such a file is an error instead.
    pub fn open(
        path: impl AsRef<Path>,
        config: IndexConfig,
        registry: LocationRegistry,
    ) -> IndexResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let (storage, replaced) = if config.read_only {
            (IndexStorage::open(&path, &config, registry)?, None)
        } else {
            IndexStorage::open_or_replace(&path, &config, registry)?
        };
        let mut inner = IndexInner {
            storage,
            state: IndexState::Ready,
            rebuild_reason: String::new(),
            rebuild_files: Vec::new(),
            files_with_errors: BTreeSet::new(),
        };
        if let Some(err) = replaced {
            warn!(path = %path.display(), error = %err, "index.open.replaced");
            inner.state = IndexState::RequiresRebuild;
            inner.rebuild_reason = err.to_string();
        }
        info!(
            path = %path.display(),
            state = ?inner.state,
            layers = config.layers.len(),
            "index.open"
        );
        Ok(Self {
            path,
            layers: config.layer_list(),
            inner: Mutex::new(inner),
            transaction_open: AtomicBool::new(false),
        })
    }

    /// Path of the page file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured layers, in slot order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Layer named `id`, or [`IndexError::Storage`] if none is configured.
    pub fn layer(&self, id: &LayerId) -> IndexResult<&Layer> {
        self.layers
            .iter()
            .find(|layer| &layer.id == id)
            .ok_or_else(|| IndexError::from(StorageError::UnknownLayer(id.to_string())))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexState {
        self.inner.lock().state
    }

    fn lock(&self, access: Access) -> IndexResult<MutexGuard<'_, IndexInner>> {
        let inner = self.inner.lock();
        inner.check(access)?;
        Ok(inner)
    }

    /// Starts re-indexing `file`, whose source carries `mod_stamp`.
    pub fn begin_file(
        &self,
        file: impl Into<SourceHandle>,
        mod_stamp: i64,
    ) -> IndexResult<FileTransaction<'_>> {
        drop(self.lock(Access::Write)?);
        if self
            .transaction_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IndexError::IndexTemporarilyNonOperational(
                "another file transaction is open".into(),
            ));
        }
        Ok(FileTransaction::new(self, file.into(), mod_stamp))
    }

    pub(crate) fn release_transaction(&self) {
        self.transaction_open.store(false, Ordering::Release);
    }

    pub(crate) fn commit_file(
        &self,
        file: &SourceHandle,
        mod_stamp: i64,
        staging: &Staging,
    ) -> IndexResult<Vec<SourceHandle>> {
        self.apply(file, mod_stamp, Some(staging))
    }

    /// Forgets everything `file` contributed. Returns the files whose data
    /// referenced it.
    pub fn remove_file(&self, file: impl Into<SourceHandle>) -> IndexResult<Vec<SourceHandle>> {
        let file = file.into();
        self.apply(&file, 0, None)
    }

    fn apply(
        &self,
        file: &SourceHandle,
        mod_stamp: i64,
        staging: Option<&Staging>,
    ) -> IndexResult<Vec<SourceHandle>> {
        let mut inner = self.lock(Access::Write)?;
        let applied = transaction::apply_file(&mut inner.storage, file, mod_stamp, staging);
        let committed = applied.and_then(|affected| {
            inner.storage.commit()?;
            Ok(affected)
        });
        match committed {
            Ok(affected) => {
                inner.files_with_errors.remove(file);
                info!(
                    file = %file,
                    removed = staging.is_none(),
                    affected = affected.len(),
                    "index.file.commit"
                );
                Ok(affected)
            }
            Err(err) => Err(inner.fail_file(file, err)),
        }
    }

    /// Info stored for `location` in `layer`.
    pub fn get_location_info(
        &self,
        location: &Location,
        layer: impl Into<LayerId>,
    ) -> IndexResult<Option<LayerInfo>> {
        let layer = layer.into();
        let mut inner = self.lock(Access::Read)?;
        match inner.storage.read_location_info(location, &layer) {
            Ok(info) => Ok(info),
            Err(err) => Err(inner.fail(err)),
        }
    }

    /// Stored info of `file`, if it was indexed.
    pub fn file_info(&self, file: &SourceHandle) -> IndexResult<Option<FileInfo>> {
        let mut inner = self.lock(Access::Read)?;
        match inner.storage.read_file_info(file) {
            Ok(info) => Ok(info.filter(FileInfo::is_indexed)),
            Err(err) => Err(inner.fail(err)),
        }
    }

    /// Every indexed file with the stamp it was indexed at, by path.
    pub fn load_all_file_headers(&self) -> IndexResult<Vec<PathAndModStamp>> {
        let mut inner = self.lock(Access::Read)?;
        match inner.storage.read_file_names_and_stamps() {
            Ok(files) => Ok(files
                .into_iter()
                .filter(|entry| entry.mod_stamp != NOT_INDEXED)
                .collect()),
            Err(err) => Err(inner.fail(err)),
        }
    }

    /// Compares the stored stamps with `current`, the caller's view of the
    /// source files.
    pub fn resync(&self, current: &[PathAndModStamp]) -> IndexResult<ResyncPlan> {
        let stored: BTreeMap<SourceHandle, i64> = self
            .load_all_file_headers()?
            .into_iter()
            .map(|entry| (entry.path, entry.mod_stamp))
            .collect();
        let mut plan = ResyncPlan::default();
        let mut seen = BTreeSet::new();
        for entry in current {
            if !seen.insert(&entry.path) {
                continue;
            }
            match stored.get(&entry.path) {
                Some(stamp) if *stamp != entry.mod_stamp => plan.changed.push(entry.path.clone()),
                Some(_) => {}
                None => plan.added.push(entry.path.clone()),
            }
        }
        plan.removed = stored
            .into_keys()
            .filter(|path| !seen.contains(path))
            .collect();
        plan.changed.sort();
        plan.added.sort();
        debug!(
            changed = plan.changed.len(),
            added = plan.added.len(),
            removed = plan.removed.len(),
            "index.resync"
        );
        Ok(plan)
    }

    /// Files whose last transaction failed.
    pub fn files_with_errors(&self) -> Vec<SourceHandle> {
        self.inner.lock().files_with_errors.iter().cloned().collect()
    }

    /// Whether any file failed since it was last committed.
    pub fn has_errors(&self) -> bool {
        !self.inner.lock().files_with_errors.is_empty()
    }

    /// Discards all content and enters [`IndexState::Rebuilding`].
    pub fn begin_rebuild(&self) -> IndexResult<()> {
        if self.transaction_open.load(Ordering::Acquire) {
            return Err(IndexError::IndexTemporarilyNonOperational(
                "a file transaction is open".into(),
            ));
        }
        let mut inner = self.inner.lock();
        let reset = inner.storage.reset().and_then(|()| inner.storage.commit());
        if let Err(err) = reset {
            if let Err(rollback) = inner.storage.rollback() {
                warn!(error = %rollback, "index.rollback.failed");
            }
            return Err(IndexError::IndexTemporarilyNonOperational(format!(
                "cannot discard index content: {err}"
            )));
        }
        inner.state = IndexState::Rebuilding;
        inner.rebuild_reason.clear();
        inner.rebuild_files.clear();
        inner.files_with_errors.clear();
        info!(path = %self.path.display(), "index.rebuild.begin");
        Ok(())
    }

    /// Leaves [`IndexState::Rebuilding`] and serves reads again.
    pub fn finish_rebuild(&self) -> IndexResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != IndexState::Rebuilding {
            return Err(IndexError::IndexTemporarilyNonOperational(
                "no rebuild in progress".into(),
            ));
        }
        inner.state = IndexState::Ready;
        info!(
            path = %self.path.display(),
            errors = inner.files_with_errors.len(),
            "index.rebuild.finish"
        );
        Ok(())
    }

    /// Dump of the whole store for debugging and golden tests.
    pub fn disk_index_as_string(&self) -> IndexResult<String> {
        let mut inner = self.lock(Access::Diagnostic)?;
        match inner.storage.dump() {
            Ok(dump) => Ok(dump),
            Err(err) => Err(inner.fail(err)),
        }
    }

    /// Counters and shape of the whole store.
    pub fn stats(&self) -> IndexResult<IndexStats> {
        let mut inner = self.lock(Access::Diagnostic)?;
        let report = inner.storage.stats().and_then(|storage| {
            let indexed_files = inner
                .storage
                .read_file_names_and_stamps()?
                .iter()
                .filter(|entry| entry.mod_stamp != NOT_INDEXED)
                .count();
            Ok((storage, indexed_files))
        });
        match report {
            Ok((storage, indexed_files)) => Ok(IndexStats {
                state: inner.state,
                indexed_files,
                files_with_errors: inner.files_with_errors.len(),
                storage,
            }),
            Err(err) => Err(inner.fail(err)),
        }
    }

    /// Flushes and closes the page file.
    pub fn close(self) -> IndexResult<()> {
        if self.transaction_open.load(Ordering::Acquire) {
            return Err(IndexError::IndexTemporarilyNonOperational(
                "a file transaction is open".into(),
            ));
        }
        let inner = self.inner.into_inner();
        if inner.storage.has_uncommitted() {
            warn!(path = %self.path.display(), "index.close.uncommitted");
        }
        inner.storage.close()?;
        info!(path = %self.path.display(), "index.close");
        Ok(())
    }
}
