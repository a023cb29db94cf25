//! Typed persistence of location infos and file infos on top of the
//! catalog and its info stores.
//!
//! A location is stored under its tree key; the catalog id of that key
//! addresses one info slot per layer. File infos live in slot 0 under the
//! key of the file's [`Location::File`].

use std::fmt::Write as _;
use std::path::Path;

use tracing::{debug, info, trace};

use crate::catalog::{Catalog, CatalogId, MappingStatsSnapshot};
use crate::config::IndexConfig;
use crate::error::{Result, StorageError};
use crate::file_info::{FileInfo, PathAndModStamp};
use crate::infostore::{InfoStore, InfoStoreStats};
use crate::layers::{Layer, LayerId, LayerInfo, LocationInfo};
use crate::location::{Location, LocationRegistry, SourceHandle, FILE_MARKER};
use crate::pager::{Pager, PagerStatsSnapshot, StoreLayout};
use crate::tree::{TreeStore, TreeStoreStats, ITEM_PAYLOAD, ITEM_PAYLOAD_WITH_STAMP};

const TREE_ROOT: u32 = 0;
const CATALOG_ROOT: u32 = 1;
const SPECIAL_PAGES: u32 = 2;
const FILE_INFO_SLOT: usize = 0;

/// Shape report of every structure in the file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Page size in bytes.
    pub page_size: usize,
    /// Pages in the file, the header page included.
    pub page_count: u32,
    /// Pages on the free list.
    pub free_pages: usize,
    /// Pager counters.
    pub pager: PagerStatsSnapshot,
    /// Catalog counters.
    pub mapping: MappingStatsSnapshot,
    /// Shape of the key tree.
    pub tree: TreeStoreStats,
    /// Fill of the file info slot.
    pub file_infos: InfoStoreStats,
    /// Per-layer slot reports, keyed by layer id.
    pub layers: Vec<(String, InfoStoreStats)>,
}

/// Owner of the open page file and everything addressed through it.
#[derive(Debug)]
pub struct IndexStorage {
    pager: Pager,
    catalog: Catalog,
    registry: LocationRegistry,
    layers: Vec<Layer>,
}

impl IndexStorage {
    /// Layout of a file written with `config`.
    pub fn layout(config: &IndexConfig) -> StoreLayout {
        let item_payload = if config.record_timestamps {
            ITEM_PAYLOAD_WITH_STAMP
        } else {
            ITEM_PAYLOAD
        };
        StoreLayout {
            special_pages: SPECIAL_PAGES,
            catalog_slots: 1 + config.layers.len() as u32,
            item_payload: item_payload as u32,
        }
    }

    /// Opens or creates the store at `path` with `config`'s layout.
    pub fn open(path: &Path, config: &IndexConfig, registry: LocationRegistry) -> Result<Self> {
        let pager = Pager::open(path, config.pager_options(), Self::layout(config))?;
        Self::assemble(pager, config, registry)
    }

    /// Opens `path`, staging an empty store in place of an unreadable one.
    /// The structural error that caused the replacement is returned.
    pub fn open_or_replace(
        path: &Path,
        config: &IndexConfig,
        registry: LocationRegistry,
    ) -> Result<(Self, Option<StorageError>)> {
        let (pager, replaced) =
            Pager::open_or_replace(path, config.pager_options(), Self::layout(config))?;
        Ok((Self::assemble(pager, config, registry)?, replaced))
    }

    fn assemble(mut pager: Pager, config: &IndexConfig, registry: LocationRegistry) -> Result<Self> {
        let layout = pager.layout();
        let tree_root = pager.special_page(TREE_ROOT)?;
        let catalog_root = pager.special_page(CATALOG_ROOT)?;
        let tree = TreeStore::open(&mut pager, tree_root, layout.item_payload as usize)?;
        let catalog = Catalog::open(&pager, tree, catalog_root, config.mapping_cache_entries)?;
        Ok(Self {
            pager,
            catalog,
            registry,
            layers: config.layer_list(),
        })
    }

    /// Underlying pager.
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Codecs used to read and write locations.
    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    /// Configured layers, in slot order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Configured layer `id`. Unknown ids are [`StorageError::UnknownLayer`].
    pub fn layer(&self, id: &LayerId) -> Result<&Layer> {
        self.layers
            .iter()
            .find(|layer| &layer.id == id)
            .ok_or_else(|| StorageError::UnknownLayer(id.to_string()))
    }

    fn layer_store(&self, id: &LayerId) -> Result<(InfoStore, Layer)> {
        let index = self
            .layers
            .iter()
            .position(|layer| &layer.id == id)
            .ok_or_else(|| StorageError::UnknownLayer(id.to_string()))?;
        Ok((InfoStore::new(1 + index), self.layers[index].clone()))
    }

    /// Info of `location` in `layer`, or `None` if nothing is stored.
    pub fn read_location_info(&mut self, location: &Location, layer: &LayerId) -> Result<Option<LayerInfo>> {
        let (store, layer) = self.layer_store(layer)?;
        let Some(id) = self.catalog.find(&mut self.pager, &location.tree_key())? else {
            return Ok(None);
        };
        match store.get(&mut self.catalog, &mut self.pager, id)? {
            Some(bytes) => Ok(Some(LayerInfo::from_bytes(layer.kind, &self.registry, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores `info`; an empty info deletes the record instead.
    pub fn write_location_info(&mut self, location: &Location, layer: &LayerId, info: &LayerInfo) -> Result<()> {
        if info.is_empty() {
            self.delete_location_info(location, layer)?;
            return Ok(());
        }
        let (store, layer) = self.layer_store(layer)?;
        if info.kind() != layer.kind {
            return Err(StorageError::InvalidArgument(format!(
                "{} info written to {} layer {}",
                info.kind().as_str(),
                layer.kind.as_str(),
                layer.id
            )));
        }
        let bytes = info.to_bytes(&self.registry)?;
        let id = self.catalog.find_or_create(&mut self.pager, &location.tree_key())?;
        store.put(&mut self.catalog, &mut self.pager, id, &bytes)?;
        trace!(location = %location, layer = %layer.id, bytes = bytes.len(), "storage.location_info.write");
        Ok(())
    }

    /// Removes the info and releases the catalog id once no slot uses it.
    /// Returns whether anything was stored.
    pub fn delete_location_info(&mut self, location: &Location, layer: &LayerId) -> Result<bool> {
        let (store, _) = self.layer_store(layer)?;
        let key = location.tree_key();
        let Some(id) = self.catalog.find(&mut self.pager, &key)? else {
            return Ok(false);
        };
        let found = store.delete(&mut self.catalog, &mut self.pager, id)?;
        self.release_if_unused(id, &key)?;
        Ok(found)
    }

    /// Stored info of `file`, placeholders included.
    pub fn read_file_info(&mut self, file: &SourceHandle) -> Result<Option<FileInfo>> {
        let key = Location::File(file.clone()).tree_key();
        let Some(id) = self.catalog.find(&mut self.pager, &key)? else {
            return Ok(None);
        };
        match InfoStore::new(FILE_INFO_SLOT).get(&mut self.catalog, &mut self.pager, id)? {
            Some(bytes) => Ok(Some(FileInfo::from_bytes(&self.registry, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Replaces the stored info of `file`.
    pub fn write_file_info(&mut self, file: &SourceHandle, info: &FileInfo) -> Result<()> {
        let key = Location::File(file.clone()).tree_key();
        let bytes = info.to_bytes(&self.registry)?;
        let id = self.catalog.find_or_create(&mut self.pager, &key)?;
        InfoStore::new(FILE_INFO_SLOT).put(&mut self.catalog, &mut self.pager, id, &bytes)?;
        trace!(file = %file, bytes = bytes.len(), "storage.file_info.write");
        Ok(())
    }

    /// Like [`Self::delete_location_info`] for the file slot.
    pub fn delete_file_info(&mut self, file: &SourceHandle) -> Result<bool> {
        let key = Location::File(file.clone()).tree_key();
        let Some(id) = self.catalog.find(&mut self.pager, &key)? else {
            return Ok(false);
        };
        let found = InfoStore::new(FILE_INFO_SLOT).delete(&mut self.catalog, &mut self.pager, id)?;
        self.release_if_unused(id, &key)?;
        Ok(found)
    }

    /// Every stored file info, ordered by path.
    pub fn read_all_file_infos(&mut self) -> Result<Vec<(SourceHandle, FileInfo)>> {
        let store = InfoStore::new(FILE_INFO_SLOT);
        let mut infos = Vec::new();
        for (key, id) in self.keyed_ids()? {
            if !is_file_key(&key) {
                continue;
            }
            let Some(bytes) = store.get(&mut self.catalog, &mut self.pager, id)? else {
                continue;
            };
            let file = SourceHandle::new(key[1..].join("/"));
            infos.push((file, FileInfo::from_bytes(&self.registry, &bytes)?));
        }
        infos.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(infos)
    }

    /// Every stored file and its stamp, placeholders included.
    pub fn read_file_names_and_stamps(&mut self) -> Result<Vec<PathAndModStamp>> {
        Ok(self
            .read_all_file_infos()?
            .into_iter()
            .map(|(path, info)| PathAndModStamp {
                path,
                mod_stamp: info.mod_stamp,
            })
            .collect())
    }

    /// Every location holding info in `layer`, ordered by location.
    pub fn read_all_layer_locations(&mut self, layer: &LayerId) -> Result<Vec<(Location, LayerInfo)>> {
        let (store, layer) = self.layer_store(layer)?;
        let mut infos = Vec::new();
        for (key, id) in self.keyed_ids()? {
            let Some(bytes) = store.get(&mut self.catalog, &mut self.pager, id)? else {
                continue;
            };
            let location = self.registry.location_from_tree_key(&key)?;
            infos.push((location, LayerInfo::from_bytes(layer.kind, &self.registry, &bytes)?));
        }
        infos.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(infos)
    }

    /// Keys that carry a catalog id, paired with it, in tree order.
    fn keyed_ids(&mut self) -> Result<Vec<(Vec<String>, CatalogId)>> {
        self.catalog
            .tree()
            .walk(&mut self.pager)
            .filter_map(|entry| match entry {
                Ok(entry) if entry.row_id > 0 => Some(Ok((entry.path, CatalogId(entry.row_id)))),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
            .collect()
    }

    /// Drops the key of `id` once no slot holds data for it.
    fn release_if_unused(&mut self, id: CatalogId, key: &[String]) -> Result<()> {
        for slot in 0..self.catalog.slot_count() {
            if self.catalog.slot_page(&mut self.pager, id, slot)?.is_some() {
                return Ok(());
            }
        }
        self.catalog.remove_key(&mut self.pager, key)?;
        trace!(id = id.0, key = %key.join("/"), "storage.key.release");
        Ok(())
    }

    /// Whether pages are staged since the last commit.
    pub fn has_uncommitted(&self) -> bool {
        self.pager.has_uncommitted()
    }

    /// Makes staged pages durable. Returns the commit counter.
    pub fn commit(&mut self) -> Result<u64> {
        self.pager.commit()
    }

    /// Discards staged pages and every cache derived from them.
    pub fn rollback(&mut self) -> Result<()> {
        self.catalog.clear_caches();
        self.pager.rollback()
    }

    /// Stages an empty store in place of the whole content.
    pub fn reset(&mut self) -> Result<()> {
        self.pager.discard_all()?;
        self.catalog.clear_caches();
        info!(path = %self.pager.path().display(), "storage.reset");
        Ok(())
    }

    /// Closes the page file. Staged pages are dropped.
    pub fn close(self) -> Result<()> {
        self.pager.close()
    }

    /// Full textual dump: tree, catalog, every layer and every file info.
    pub fn dump(&mut self) -> Result<String> {
        let mut out = String::new();
        self.catalog.tree().dump_into(&mut self.pager, &mut out, 0, false)?;
        self.catalog.dump_into(&mut self.pager, &mut out, 0)?;
        for layer in self.layers.clone() {
            let _ = writeln!(out, "Layer {} ({})", layer.id, layer.kind.as_str());
            for (location, info) in self.read_all_layer_locations(&layer.id)? {
                let _ = writeln!(out, "  {location}: {info}");
            }
        }
        let _ = writeln!(out, "Files");
        for (file, info) in self.read_all_file_infos()? {
            let _ = writeln!(out, "  {file} stamp={}", info.mod_stamp);
            for location in &info.source_locations {
                let _ = writeln!(out, "    declares {location}");
            }
            for dep in &info.internal_dependencies {
                let _ = writeln!(out, "    affects {dep}");
            }
            for dep in &info.external_dependencies {
                let _ = writeln!(out, "    depended on by {dep}");
            }
        }
        debug!(bytes = out.len(), "storage.dump");
        Ok(out)
    }

    /// Counters and fill reports of every component.
    pub fn stats(&mut self) -> Result<StorageStats> {
        let tree = self.catalog.tree().stats(&mut self.pager)?;
        let file_infos = InfoStore::new(FILE_INFO_SLOT).stats(&mut self.catalog, &mut self.pager)?;
        let mut layers = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate() {
            let stats = InfoStore::new(1 + index).stats(&mut self.catalog, &mut self.pager)?;
            layers.push((layer.id.to_string(), stats));
        }
        Ok(StorageStats {
            page_size: self.pager.page_size(),
            page_count: self.pager.page_count(),
            free_pages: self.pager.free_pages()?.len(),
            pager: self.pager.stats().snapshot(),
            mapping: self.catalog.stats().snapshot(),
            tree,
            file_infos,
            layers,
        })
    }
}

fn is_file_key(key: &[String]) -> bool {
    matches!(key.first(), Some(marker) if marker.chars().eq(std::iter::once(FILE_MARKER)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::{DependentEntity, DependentLocation};
    use crate::layers::LayerKind;

    fn open(dir: &Path) -> Result<IndexStorage> {
        IndexStorage::open(
            &dir.join("index.idx"),
            &IndexConfig::testing(),
            LocationRegistry::standard(),
        )
    }

    #[test]
    fn location_info_roundtrip_and_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = open(dir.path())?;
        let layer = LayerId::new("reverse-edges");
        let target = Location::element("lib/a.dart", "main");
        let mut info = LayerInfo::empty(LayerKind::Reverse);
        info.add_source(Location::reference("lib/b.dart", 4, 4));
        storage.write_location_info(&target, &layer, &info)?;
        assert_eq!(storage.read_location_info(&target, &layer)?, Some(info));
        assert_eq!(
            storage.read_location_info(&target, &LayerId::new("bidirectional-edges"))?,
            None
        );

        assert!(storage.delete_location_info(&target, &layer)?);
        assert_eq!(storage.read_location_info(&target, &layer)?, None);
        assert!(storage.read_all_layer_locations(&layer)?.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_layer_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = open(dir.path())?;
        let err = storage
            .read_location_info(&Location::file("a"), &LayerId::new("nope"))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownLayer(_)));
        Ok(())
    }

    #[test]
    fn wrong_info_kind_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = open(dir.path())?;
        let mut info = LayerInfo::empty(LayerKind::Bidirectional);
        info.add_source(Location::file("b"));
        let result = storage.write_location_info(&Location::file("a"), &LayerId::new("reverse-edges"), &info);
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn file_infos_listed_by_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = open(dir.path())?;
        for (path, stamp) in [("lib/z.dart", 3), ("lib/a.dart", 1), ("web/main.dart", 2)] {
            let mut info = FileInfo::new(stamp);
            info.source_locations.insert(Location::element(path, "x"));
            storage.write_file_info(&SourceHandle::new(path), &info)?;
        }
        let stamps = storage.read_file_names_and_stamps()?;
        assert_eq!(
            stamps,
            vec![
                PathAndModStamp::new("lib/a.dart", 1),
                PathAndModStamp::new("lib/z.dart", 3),
                PathAndModStamp::new("web/main.dart", 2),
            ]
        );

        assert!(storage.delete_file_info(&SourceHandle::new("lib/z.dart"))?);
        assert_eq!(storage.read_all_file_infos()?.len(), 2);
        assert_eq!(storage.read_file_info(&SourceHandle::new("lib/z.dart"))?, None);
        Ok(())
    }

    #[test]
    fn infos_survive_commit_and_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = SourceHandle::new("lib/a.dart");
        let mut info = FileInfo::new(9);
        info.internal_dependencies.insert(DependentEntity::Location(DependentLocation::new(
            Location::element("lib/b.dart", "y"),
            LayerId::new("reverse-edges"),
        )));
        {
            let mut storage = open(dir.path())?;
            storage.write_file_info(&file, &info)?;
            storage.commit()?;
            storage.close()?;
        }
        let mut storage = open(dir.path())?;
        assert_eq!(storage.read_file_info(&file)?, Some(info));
        Ok(())
    }

    #[test]
    fn rollback_discards_staged_infos() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = open(dir.path())?;
        let file = SourceHandle::new("lib/a.dart");
        storage.write_file_info(&file, &FileInfo::new(1))?;
        storage.commit()?;
        storage.write_file_info(&file, &FileInfo::new(2))?;
        storage.write_file_info(&SourceHandle::new("lib/b.dart"), &FileInfo::new(3))?;
        storage.rollback()?;
        assert_eq!(storage.read_file_info(&file)?.map(|info| info.mod_stamp), Some(1));
        assert_eq!(storage.read_file_names_and_stamps()?.len(), 1);
        Ok(())
    }

    #[test]
    fn dump_lists_every_section() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = open(dir.path())?;
        let mut info = FileInfo::new(5);
        info.source_locations.insert(Location::element("a.dart", "f"));
        storage.write_file_info(&SourceHandle::new("a.dart"), &info)?;
        let dump = storage.dump()?;
        assert!(dump.starts_with("TreeStore root=1\n"), "{dump}");
        assert!(dump.contains("Catalog next_id=2"), "{dump}");
        assert!(dump.contains("Layer reverse-edges (reverse)"), "{dump}");
        assert!(dump.contains("  a.dart stamp=5\n    declares ea.dart#f\n"), "{dump}");
        Ok(())
    }
}
