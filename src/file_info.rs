//! Per-file bookkeeping: what a file declared and whose data it touched.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{DataReader, DataWriter};
use crate::error::{Result, StorageError};
use crate::layers::LayerId;
use crate::location::{Location, LocationRegistry, SourceHandle};

const FORMAT_VERSION: u8 = 1;

/// Stamp of a file known only because other files depend on it.
pub const NOT_INDEXED: i64 = i64::MIN;

const TAG_LOCATION: u8 = 0;
const TAG_FILE: u8 = 1;

/// The info of `location` in `layer`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependentLocation {
    /// Location whose info is meant.
    pub location: Location,
    /// Layer holding the info.
    pub layer: LayerId,
}

impl DependentLocation {
    /// Pairs `location` with `layer`.
    pub fn new(location: Location, layer: LayerId) -> Self {
        Self { location, layer }
    }
}

/// Something that has to be revisited when a file changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependentEntity {
    /// A location's info in one layer.
    Location(DependentLocation),
    /// Another source file, which needs re-indexing.
    File(SourceHandle),
}

impl fmt::Display for DependentEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependentEntity::Location(dep) => write!(f, "{} in {}", dep.location, dep.layer),
            DependentEntity::File(file) => write!(f, "file {file}"),
        }
    }
}

/// A file path with the modification stamp it was indexed at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathAndModStamp {
    /// Handle of the file.
    pub path: SourceHandle,
    pub mod_stamp: i64,
}

impl PathAndModStamp {
    /// Pairs a path with its stamp.
    pub fn new(path: impl Into<SourceHandle>, mod_stamp: i64) -> Self {
        Self {
            path: path.into(),
            mod_stamp,
        }
    }
}

/// Stored state of one indexed file.
///
/// `internal_dependencies` lists what the file's own content wrote: every
/// location info it added edges to, and every other file whose locations
/// it referenced. `external_dependencies` is maintained by other files and
/// lists the files that referenced locations declared here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub mod_stamp: i64,
    /// Locations the file declared in its last pass.
    pub source_locations: BTreeSet<Location>,
    /// What this file's data was written into or derived from.
    pub internal_dependencies: BTreeSet<DependentEntity>,
    /// Other files that registered a dependency on this one.
    pub external_dependencies: BTreeSet<DependentEntity>,
}

impl FileInfo {
    /// Info of a file indexed with `mod_stamp` and no content yet.
    pub fn new(mod_stamp: i64) -> Self {
        Self {
            mod_stamp,
            ..Self::default()
        }
    }

    /// Info of a file that has not been indexed itself.
    pub fn not_indexed() -> Self {
        Self::new(NOT_INDEXED)
    }

    /// `false` for placeholders kept only for their dependents.
    pub fn is_indexed(&self) -> bool {
        self.mod_stamp != NOT_INDEXED
    }

    /// Locations whose info this file contributed to.
    pub fn dependent_locations(&self) -> impl Iterator<Item = &DependentLocation> + '_ {
        self.internal_dependencies.iter().filter_map(|dep| match dep {
            DependentEntity::Location(dep) => Some(dep),
            DependentEntity::File(_) => None,
        })
    }

    /// Files this file's content depends on.
    pub fn depended_on_files(&self) -> impl Iterator<Item = &SourceHandle> + '_ {
        files(&self.internal_dependencies)
    }

    /// Files registered as depending on this one.
    pub fn dependent_files(&self) -> impl Iterator<Item = &SourceHandle> + '_ {
        files(&self.external_dependencies)
    }

    /// Writes the stamp and the three sets.
    pub fn save(&self, registry: &LocationRegistry, out: &mut DataWriter) -> Result<()> {
        out.write_u8(FORMAT_VERSION);
        out.write_i64(self.mod_stamp);
        registry.save_locations(&self.source_locations, out)?;
        save_entities(registry, &self.internal_dependencies, out)?;
        save_entities(registry, &self.external_dependencies, out)
    }

    /// Reads what [`FileInfo::save`] wrote.
    pub fn load(registry: &LocationRegistry, input: &mut DataReader<'_>) -> Result<Self> {
        let version = input.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(StorageError::corruption(format!(
                "file info format {version}, expected {FORMAT_VERSION}"
            )));
        }
        Ok(Self {
            mod_stamp: input.read_i64()?,
            source_locations: registry.load_locations(input)?.into_iter().collect(),
            internal_dependencies: load_entities(registry, input)?,
            external_dependencies: load_entities(registry, input)?,
        })
    }

    /// Serialized form as stored in the file info slot.
    pub fn to_bytes(&self, registry: &LocationRegistry) -> Result<Vec<u8>> {
        let mut out = DataWriter::new();
        self.save(registry, &mut out)?;
        Ok(out.into_inner())
    }

    /// Inverse of [`FileInfo::to_bytes`].
    pub fn from_bytes(registry: &LocationRegistry, bytes: &[u8]) -> Result<Self> {
        Self::load(registry, &mut DataReader::new(bytes))
    }
}

fn files(set: &BTreeSet<DependentEntity>) -> impl Iterator<Item = &SourceHandle> + '_ {
    set.iter().filter_map(|dep| match dep {
        DependentEntity::File(file) => Some(file),
        DependentEntity::Location(_) => None,
    })
}

fn save_entities(
    registry: &LocationRegistry,
    entities: &BTreeSet<DependentEntity>,
    out: &mut DataWriter,
) -> Result<()> {
    let count = i32::try_from(entities.len())
        .map_err(|_| StorageError::CapacityExceeded("dependency list too long".into()))?;
    out.write_i32(count);
    for entity in entities {
        match entity {
            DependentEntity::Location(dep) => {
                out.write_u8(TAG_LOCATION);
                registry.write_location(&dep.location, out)?;
                out.write_string(dep.layer.as_str())?;
            }
            DependentEntity::File(file) => {
                out.write_u8(TAG_FILE);
                out.write_string(file.as_str())?;
            }
        }
    }
    Ok(())
}

fn load_entities(
    registry: &LocationRegistry,
    input: &mut DataReader<'_>,
) -> Result<BTreeSet<DependentEntity>> {
    let count = input.read_i32()?;
    if count < 0 {
        return Err(StorageError::corruption(format!(
            "negative dependency count {count}"
        )));
    }
    let mut entities = BTreeSet::new();
    for _ in 0..count {
        let entity = match input.read_u8()? {
            TAG_LOCATION => {
                let location = registry.read_location(input)?;
                let layer = LayerId::new(input.read_string()?);
                DependentEntity::Location(DependentLocation::new(location, layer))
            }
            TAG_FILE => DependentEntity::File(SourceHandle::new(input.read_string()?)),
            tag => {
                return Err(StorageError::corruption(format!(
                    "unknown dependency tag {tag}"
                )))
            }
        };
        entities.insert(entity);
    }
    Ok(entities)
}
