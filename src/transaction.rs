//! File transactions: staging of one re-index pass and the invalidation
//! algorithm that applies it.
//!
//! A [`FileTransaction`] collects declared locations and edges in memory.
//! Nothing touches the page file until [`FileTransaction::commit`], which
//! hands the staging to [`apply_file`] under the index lock.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace, warn};

use crate::error::{IndexResult, Result};
use crate::file_info::{DependentEntity, DependentLocation, FileInfo};
use crate::index::Index;
use crate::layers::{Layer, LayerId, LayerInfo, LayerKind, LocationInfo};
use crate::location::{Location, SourceHandle};
use crate::storage::IndexStorage;

/// The state of a file transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting staged updates.
    Active,
    /// Applied and durable.
    Committed,
    /// Abandoned with nothing persisted.
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedEdge {
    pub layer: LayerId,
    pub source: Location,
    pub destination: Location,
}

/// Everything a transaction wants written for its file.
#[derive(Debug, Default, Clone)]
pub(crate) struct Staging {
    pub declared: BTreeSet<Location>,
    pub edges: Vec<StagedEdge>,
    pub file_dependencies: BTreeSet<(SourceHandle, DependentLocation)>,
}

/// One re-index pass over a single source file.
///
/// Obtained from [`Index::begin_file`]. Updates are staged in memory and
/// applied atomically by [`commit`](Self::commit). Dropping an active
/// transaction abandons it.
#[derive(Debug)]
pub struct FileTransaction<'i> {
    index: &'i Index,
    file: SourceHandle,
    mod_stamp: i64,
    staging: Staging,
    state: TxState,
}

impl<'i> FileTransaction<'i> {
    pub(crate) fn new(index: &'i Index, file: SourceHandle, mod_stamp: i64) -> Self {
        debug!(file = %file, mod_stamp, "index.file.begin");
        Self {
            index,
            file,
            mod_stamp,
            staging: Staging::default(),
            state: TxState::Active,
        }
    }

    /// File being re-indexed.
    pub fn file(&self) -> &SourceHandle {
        &self.file
    }

    /// Stamp the file is committed with.
    pub fn mod_stamp(&self) -> i64 {
        self.mod_stamp
    }

    /// Where the transaction is in its lifecycle.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Updater writing into the layer named `id`.
    pub fn layer(&mut self, id: impl Into<LayerId>) -> IndexResult<LayerUpdater<'_>> {
        let id = id.into();
        let layer = self.index.layer(&id)?.clone();
        Ok(LayerUpdater {
            staging: &mut self.staging,
            layer,
        })
    }

    /// Declares `location` as belonging to this file without any edge.
    pub fn declare(&mut self, location: Location) {
        self.staging.declared.insert(location);
    }

    /// Applies the staged updates and returns the other files whose index
    /// data may now be stale.
    pub fn commit(mut self) -> IndexResult<Vec<SourceHandle>> {
        let result = self
            .index
            .commit_file(&self.file, self.mod_stamp, &self.staging);
        self.state = if result.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        self.index.release_transaction();
        result
    }

    /// Abandons the transaction.
    pub fn rollback(mut self) {
        self.state = TxState::RolledBack;
        self.index.release_transaction();
        debug!(file = %self.file, "index.file.rollback");
    }
}

impl Drop for FileTransaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(file = %self.file, "index.file.abandoned");
            self.index.release_transaction();
        }
    }
}

/// Stages updates for one layer of a transaction.
#[derive(Debug)]
pub struct LayerUpdater<'t> {
    staging: &'t mut Staging,
    layer: Layer,
}

impl LayerUpdater<'_> {
    /// Layer the updater writes into.
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Declares `location` and returns an updater for its edges.
    pub fn start_location(&mut self, location: Location) -> LocationUpdater<'_> {
        self.staging.declared.insert(location.clone());
        LocationUpdater {
            staging: &mut *self.staging,
            layer: &self.layer,
            location,
        }
    }
}

/// Stages the edges leaving one declared location.
#[derive(Debug)]
pub struct LocationUpdater<'t> {
    staging: &'t mut Staging,
    layer: &'t Layer,
    location: Location,
}

impl LocationUpdater<'_> {
    /// Location whose edges are being staged.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Records an edge from the current location to `destination`.
    pub fn has_reference_to(&mut self, destination: Location) -> &mut Self {
        trace!(
            layer = %self.layer.id,
            source = %self.location,
            destination = %destination,
            "index.edge.stage"
        );
        self.staging.edges.push(StagedEdge {
            layer: self.layer.id.clone(),
            source: self.location.clone(),
            destination,
        });
        self
    }

    /// Records which other files influenced this location's edges.
    pub fn dependencies(&mut self) -> DependenciesBuilder<'_> {
        DependenciesBuilder {
            staging: &mut *self.staging,
            dependent: DependentLocation::new(self.location.clone(), self.layer.id.clone()),
        }
    }
}

/// Collects the files a location's data was derived from.
#[derive(Debug)]
pub struct DependenciesBuilder<'t> {
    staging: &'t mut Staging,
    dependent: DependentLocation,
}

impl DependenciesBuilder<'_> {
    /// Marks the current location's data as derived from `file`.
    pub fn depends_on(&mut self, file: impl Into<SourceHandle>) -> &mut Self {
        self.staging
            .file_dependencies
            .insert((file.into(), self.dependent.clone()));
        self
    }
}

/// Replaces the stored content of `file`. `staging == None` removes the
/// file. Returns the other files whose data referenced something that
/// changed, sorted.
///
/// The old and new content are merged into one [`PendingChanges`] before
/// anything is written, so a location whose info ends up unchanged keeps
/// its record and its catalog id.
pub(crate) fn apply_file(
    storage: &mut IndexStorage,
    file: &SourceHandle,
    mod_stamp: i64,
    staging: Option<&Staging>,
) -> Result<Vec<SourceHandle>> {
    if let Some(staging) = staging {
        check_locations(storage, staging)?;
    }
    let old = storage
        .read_file_info(file)?
        .unwrap_or_else(FileInfo::not_indexed);
    let declared = staging.map(|s| s.declared.clone()).unwrap_or_default();

    let mut affected = affected_by_vanishing(storage, &old.source_locations, &declared)?;
    affected.extend(old.dependent_files().cloned());

    let mut changes = PendingChanges::default();
    changes.undo_previous_content(storage, file, &old)?;

    let info = match staging {
        Some(staging) => {
            let mut info = FileInfo::new(mod_stamp);
            info.source_locations = declared;
            info.external_dependencies = old.external_dependencies.clone();
            changes.stage_edges(storage, file, staging, &mut info)?;
            changes.register_with_depended_on_files(storage, file, &info)?;
            info
        }
        None => {
            let mut placeholder = FileInfo::not_indexed();
            placeholder.external_dependencies = old.external_dependencies.clone();
            placeholder
        }
    };
    *changes.file(storage, file)? = info;
    let (written, deleted) = changes.flush(storage)?;

    affected.remove(file);
    debug!(
        file = %file,
        removed = staging.is_none(),
        written,
        deleted,
        affected = affected.len(),
        "index.file.apply"
    );
    Ok(affected.into_iter().collect())
}

/// Rejects staged locations the registry cannot store before anything is
/// touched.
fn check_locations(storage: &IndexStorage, staging: &Staging) -> Result<()> {
    let registry = storage.registry();
    let edges = staging
        .edges
        .iter()
        .flat_map(|edge| [&edge.source, &edge.destination]);
    let dependents = staging
        .file_dependencies
        .iter()
        .map(|(_, dependent)| &dependent.location);
    for location in staging.declared.iter().chain(edges).chain(dependents) {
        registry.check(location)?;
    }
    Ok(())
}

/// Owners of the locations that lose data when a previously declared
/// location is no longer declared.
fn affected_by_vanishing(
    storage: &mut IndexStorage,
    previous: &BTreeSet<Location>,
    declared: &BTreeSet<Location>,
) -> Result<BTreeSet<SourceHandle>> {
    let mut affected = BTreeSet::new();
    let layers: Vec<LayerId> = storage.layers().iter().map(|l| l.id.clone()).collect();
    for location in previous.difference(declared) {
        for layer in &layers {
            let Some(info) = storage.read_location_info(location, layer)? else {
                continue;
            };
            affected.extend(
                info.locations_affected_by_removal_of_self()
                    .iter()
                    .filter_map(|l| l.source_file().cloned()),
            );
        }
    }
    Ok(affected)
}

/// A record as stored before the commit and as it should be after.
#[derive(Debug)]
struct Pending<T> {
    stored: Option<T>,
    current: T,
}

impl<T: PartialEq> Pending<T> {
    fn changed(&self) -> bool {
        self.stored.as_ref() != Some(&self.current)
    }
}

/// Every location info and file info a commit touches, read once and
/// written once.
#[derive(Debug, Default)]
struct PendingChanges {
    locations: BTreeMap<(LayerId, Location), Pending<LayerInfo>>,
    files: BTreeMap<SourceHandle, Pending<FileInfo>>,
}

impl PendingChanges {
    fn location(
        &mut self,
        storage: &mut IndexStorage,
        layer: &LayerId,
        location: &Location,
    ) -> Result<&mut LayerInfo> {
        let pending = match self.locations.entry((layer.clone(), location.clone())) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stored = storage.read_location_info(location, layer)?;
                let current = match &stored {
                    Some(info) => info.clone(),
                    None => storage.layer(layer)?.empty_info(),
                };
                entry.insert(Pending { stored, current })
            }
        };
        Ok(&mut pending.current)
    }

    fn file(&mut self, storage: &mut IndexStorage, file: &SourceHandle) -> Result<&mut FileInfo> {
        let pending = match self.files.entry(file.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stored = storage.read_file_info(file)?;
                let current = stored.clone().unwrap_or_else(FileInfo::not_indexed);
                entry.insert(Pending { stored, current })
            }
        };
        Ok(&mut pending.current)
    }

    /// Removes the edges and registrations `file` contributed last time.
    fn undo_previous_content(
        &mut self,
        storage: &mut IndexStorage,
        file: &SourceHandle,
        old: &FileInfo,
    ) -> Result<()> {
        for dep in old.dependent_locations() {
            let info = self.location(storage, &dep.layer, &dep.location)?;
            info.adjust_due_to_removal_of(&old.source_locations);
            if old.source_locations.contains(&dep.location) {
                info.drop_outgoing();
            }
        }

        let registration = DependentEntity::File(file.clone());
        for other in old.depended_on_files().filter(|other| *other != file) {
            self.file(storage, other)?
                .external_dependencies
                .remove(&registration);
        }
        Ok(())
    }

    fn stage_edges(
        &mut self,
        storage: &mut IndexStorage,
        file: &SourceHandle,
        staging: &Staging,
        info: &mut FileInfo,
    ) -> Result<()> {
        for edge in &staging.edges {
            let kind = storage.layer(&edge.layer)?.kind;
            if kind == LayerKind::Bidirectional {
                self.location(storage, &edge.layer, &edge.source)?
                    .add_destination(edge.destination.clone());
                info.internal_dependencies.insert(DependentEntity::Location(
                    DependentLocation::new(edge.source.clone(), edge.layer.clone()),
                ));
            }
            self.location(storage, &edge.layer, &edge.destination)?
                .add_source(edge.source.clone());
            info.internal_dependencies.insert(DependentEntity::Location(
                DependentLocation::new(edge.destination.clone(), edge.layer.clone()),
            ));
            if let Some(owner) = edge.destination.source_file() {
                if owner != file {
                    info.internal_dependencies
                        .insert(DependentEntity::File(owner.clone()));
                }
            }
        }
        for (other, dependent) in &staging.file_dependencies {
            info.internal_dependencies
                .insert(DependentEntity::Location(dependent.clone()));
            if other != file {
                info.internal_dependencies
                    .insert(DependentEntity::File(other.clone()));
            }
        }
        Ok(())
    }

    fn register_with_depended_on_files(
        &mut self,
        storage: &mut IndexStorage,
        file: &SourceHandle,
        info: &FileInfo,
    ) -> Result<()> {
        let registration = DependentEntity::File(file.clone());
        for other in info.depended_on_files().filter(|other| *other != file) {
            self.file(storage, other)?
                .external_dependencies
                .insert(registration.clone());
        }
        Ok(())
    }

    /// Writes changed records, then deletes emptied ones. Deleting last
    /// lets a key shared by several slots see every slot that survives
    /// before it is released. Returns the number of writes and deletes.
    fn flush(self, storage: &mut IndexStorage) -> Result<(usize, usize)> {
        let keep_file = |info: &FileInfo| info.is_indexed() || !info.external_dependencies.is_empty();
        let mut written = 0;
        let mut deleted = 0;

        for ((layer, location), pending) in &self.locations {
            if !pending.current.is_empty() && pending.changed() {
                storage.write_location_info(location, layer, &pending.current)?;
                written += 1;
            }
        }
        for (file, pending) in &self.files {
            if keep_file(&pending.current) && pending.changed() {
                storage.write_file_info(file, &pending.current)?;
                written += 1;
            }
        }

        for ((layer, location), pending) in &self.locations {
            if pending.current.is_empty() && pending.stored.is_some() {
                storage.delete_location_info(location, layer)?;
                deleted += 1;
            }
        }
        for (file, pending) in &self.files {
            if !keep_file(&pending.current) && pending.stored.is_some() {
                storage.delete_file_info(file)?;
                deleted += 1;
            }
        }
        trace!(written, deleted, "index.file.flush");
        Ok((written, deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::location::LocationRegistry;

    const REVERSE: &str = "reverse-edges";
    const BIDI: &str = "bidirectional-edges";

    fn storage(dir: &tempfile::TempDir) -> Result<IndexStorage> {
        IndexStorage::open(
            &dir.path().join("index.db"),
            &IndexConfig::testing(),
            LocationRegistry::standard(),
        )
    }

    fn edge(layer: &str, source: Location, destination: Location) -> StagedEdge {
        StagedEdge {
            layer: LayerId::new(layer),
            source,
            destination,
        }
    }

    #[test]
    fn reverse_edge_is_recorded_on_destination() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = storage(&dir)?;
        let a = SourceHandle::new("a.dart");
        let l1 = Location::element("a.dart", "L1");
        let l2 = Location::element("b.dart", "L2");

        let mut staging = Staging::default();
        staging.declared.insert(l1.clone());
        staging.edges.push(edge(REVERSE, l1.clone(), l2.clone()));
        let affected = apply_file(&mut storage, &a, 10, Some(&staging))?;
        assert!(affected.is_empty());

        let info = storage
            .read_location_info(&l2, &LayerId::new(REVERSE))?
            .ok_or(crate::error::StorageError::NotFound("location info"))?;
        assert!(info.sources().contains(&l1));

        let b_info = storage
            .read_file_info(&SourceHandle::new("b.dart"))?
            .ok_or(crate::error::StorageError::NotFound("file info"))?;
        assert!(!b_info.is_indexed());
        assert!(b_info
            .external_dependencies
            .contains(&DependentEntity::File(a.clone())));
        Ok(())
    }

    #[test]
    fn reindex_drops_previous_edges() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = storage(&dir)?;
        let a = SourceHandle::new("a.dart");
        let l1 = Location::element("a.dart", "L1");
        let l2 = Location::element("a.dart", "L2");

        let mut staging = Staging::default();
        staging.declared.insert(l1.clone());
        staging.edges.push(edge(BIDI, l1.clone(), l2.clone()));
        apply_file(&mut storage, &a, 1, Some(&staging))?;
        assert!(storage.read_location_info(&l1, &LayerId::new(BIDI))?.is_some());

        apply_file(&mut storage, &a, 2, Some(&Staging::default()))?;
        assert!(storage.read_location_info(&l1, &LayerId::new(BIDI))?.is_none());
        assert!(storage.read_location_info(&l2, &LayerId::new(BIDI))?.is_none());
        let info = storage
            .read_file_info(&a)?
            .ok_or(crate::error::StorageError::NotFound("file info"))?;
        assert_eq!(info.mod_stamp, 2);
        assert!(info.internal_dependencies.is_empty());
        Ok(())
    }

    #[test]
    fn identical_reapply_stages_no_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = storage(&dir)?;
        let a = SourceHandle::new("a.dart");
        let l1 = Location::element("a.dart", "L1");
        let l2 = Location::element("b.dart", "L2");

        let mut staging = Staging::default();
        staging.declared.insert(l1.clone());
        staging.edges.push(edge(REVERSE, l1.clone(), l2.clone()));
        staging.edges.push(edge(BIDI, l1, l2));
        apply_file(&mut storage, &a, 7, Some(&staging))?;
        storage.commit()?;
        let created = storage.stats()?.mapping.ids_created;

        apply_file(&mut storage, &a, 7, Some(&staging))?;
        assert!(!storage.has_uncommitted());
        let mapping = storage.stats()?.mapping;
        assert_eq!(mapping.ids_created, created);
        assert_eq!(mapping.ids_deleted, 0);
        Ok(())
    }

    #[test]
    fn removing_a_referenced_file_keeps_a_placeholder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = storage(&dir)?;
        let a = SourceHandle::new("a.dart");
        let b = SourceHandle::new("b.dart");
        let la = Location::element("a.dart", "caller");
        let lb = Location::element("b.dart", "callee");

        let mut b_staging = Staging::default();
        b_staging.declared.insert(lb.clone());
        apply_file(&mut storage, &b, 1, Some(&b_staging))?;

        let mut a_staging = Staging::default();
        a_staging.declared.insert(la.clone());
        a_staging.edges.push(edge(REVERSE, la.clone(), lb.clone()));
        apply_file(&mut storage, &a, 1, Some(&a_staging))?;

        let affected = apply_file(&mut storage, &b, 0, None)?;
        assert_eq!(affected, vec![a.clone()]);
        let placeholder = storage
            .read_file_info(&b)?
            .ok_or(crate::error::StorageError::NotFound("file info"))?;
        assert!(!placeholder.is_indexed());

        let affected = apply_file(&mut storage, &a, 0, None)?;
        assert!(affected.is_empty());
        assert!(storage.read_file_info(&b)?.is_none());
        assert!(storage.read_file_info(&a)?.is_none());
        assert!(storage.read_location_info(&lb, &LayerId::new(REVERSE))?.is_none());
        Ok(())
    }

    #[test]
    fn explicit_file_dependencies_are_registered() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = storage(&dir)?;
        let a = SourceHandle::new("a.dart");
        let c = SourceHandle::new("c.dart");
        let la = Location::element("a.dart", "x");

        let mut staging = Staging::default();
        staging.declared.insert(la.clone());
        staging
            .file_dependencies
            .insert((c.clone(), DependentLocation::new(la, LayerId::new(REVERSE))));
        apply_file(&mut storage, &a, 3, Some(&staging))?;

        let info = storage
            .read_file_info(&a)?
            .ok_or(crate::error::StorageError::NotFound("file info"))?;
        assert_eq!(info.depended_on_files().collect::<Vec<_>>(), vec![&c]);

        let affected = apply_file(&mut storage, &c, 4, Some(&Staging::default()))?;
        assert_eq!(affected, vec![a]);
        Ok(())
    }
}
