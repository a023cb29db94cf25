//! Layers: named partitions of the index, each attaching one kind of edge
//! information to a location.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{DataReader, DataWriter};
use crate::error::Result;
use crate::location::{Location, LocationRegistry};

mod bidirectional;
mod reverse;

pub use bidirectional::BidirectionalEdges;
pub use reverse::ReverseEdges;

/// Shape of the info a layer stores per location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Sources and destinations.
    Bidirectional,
    /// Sources only.
    Reverse,
}

impl LayerKind {
    /// Name used in config files and dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Bidirectional => "bidirectional",
            LayerKind::Reverse => "reverse",
        }
    }
}

/// Name of a layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Wraps a layer name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The name as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A configured layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layer {
    /// Name callers address the layer by.
    pub id: LayerId,
    /// Edge shape of this layer.
    pub kind: LayerKind,
}

impl Layer {
    /// Layer named `id` storing `kind` edges.
    pub fn new(id: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            id: LayerId::new(id),
            kind,
        }
    }

    /// Empty info of this layer's shape.
    pub fn empty_info(&self) -> LayerInfo {
        LayerInfo::empty(self.kind)
    }
}

/// Edge payload attached to one location within one layer.
pub trait LocationInfo {
    /// An empty info is treated as absent and its record is deleted.
    fn is_empty(&self) -> bool;

    /// Drops every endpoint found in `removed`; returns whether anything changed.
    fn adjust_due_to_removal_of(&mut self, removed: &BTreeSet<Location>) -> bool;

    /// Locations whose info refers back to this one and must be adjusted if
    /// this location disappears.
    fn locations_affected_by_removal_of_self(&self) -> BTreeSet<Location>;

    /// Locations that point at this one.
    fn sources(&self) -> &BTreeSet<Location>;

    fn add_source(&mut self, source: Location) -> bool;

    /// Clears the edges this location declares, returning their targets.
    fn drop_outgoing(&mut self) -> BTreeSet<Location>;

    fn save(&self, registry: &LocationRegistry, out: &mut DataWriter) -> Result<()>;
}

/// Info of any layer kind, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerInfo {
    /// Info of a [`LayerKind::Bidirectional`] layer.
    Bidirectional(BidirectionalEdges),
    /// Info of a [`LayerKind::Reverse`] layer.
    Reverse(ReverseEdges),
}

impl LayerInfo {
    /// Info with no edges for a layer of `kind`.
    pub fn empty(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Bidirectional => LayerInfo::Bidirectional(BidirectionalEdges::default()),
            LayerKind::Reverse => LayerInfo::Reverse(ReverseEdges::default()),
        }
    }

    /// Kind of layer the info belongs to.
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerInfo::Bidirectional(_) => LayerKind::Bidirectional,
            LayerInfo::Reverse(_) => LayerKind::Reverse,
        }
    }

    /// Reads an info written by [`LayerInfo::to_bytes`] for a layer of `kind`.
    pub fn load(kind: LayerKind, registry: &LocationRegistry, input: &mut DataReader<'_>) -> Result<Self> {
        Ok(match kind {
            LayerKind::Bidirectional => {
                LayerInfo::Bidirectional(BidirectionalEdges::load(registry, input)?)
            }
            LayerKind::Reverse => LayerInfo::Reverse(ReverseEdges::load(registry, input)?),
        })
    }

    /// Like [`LayerInfo::load`] over a whole buffer.
    pub fn from_bytes(kind: LayerKind, registry: &LocationRegistry, bytes: &[u8]) -> Result<Self> {
        Self::load(kind, registry, &mut DataReader::new(bytes))
    }

    /// Serialized form; the kind is not stored.
    pub fn to_bytes(&self, registry: &LocationRegistry) -> Result<Vec<u8>> {
        let mut out = DataWriter::new();
        self.save(registry, &mut out)?;
        Ok(out.into_inner())
    }

    /// Destinations for bidirectional info, `None` for reverse info.
    pub fn destinations(&self) -> Option<&BTreeSet<Location>> {
        match self {
            LayerInfo::Bidirectional(info) => Some(info.destinations()),
            LayerInfo::Reverse(_) => None,
        }
    }

    /// Adds an outgoing edge. Reverse info keeps no destinations.
    pub fn add_destination(&mut self, destination: Location) -> bool {
        match self {
            LayerInfo::Bidirectional(info) => info.add_destination(destination),
            LayerInfo::Reverse(_) => false,
        }
    }

    fn inner(&self) -> &dyn LocationInfo {
        match self {
            LayerInfo::Bidirectional(info) => info,
            LayerInfo::Reverse(info) => info,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LocationInfo {
        match self {
            LayerInfo::Bidirectional(info) => info,
            LayerInfo::Reverse(info) => info,
        }
    }
}

impl LocationInfo for LayerInfo {
    fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }

    fn adjust_due_to_removal_of(&mut self, removed: &BTreeSet<Location>) -> bool {
        self.inner_mut().adjust_due_to_removal_of(removed)
    }

    fn locations_affected_by_removal_of_self(&self) -> BTreeSet<Location> {
        self.inner().locations_affected_by_removal_of_self()
    }

    fn sources(&self) -> &BTreeSet<Location> {
        self.inner().sources()
    }

    fn add_source(&mut self, source: Location) -> bool {
        self.inner_mut().add_source(source)
    }

    fn drop_outgoing(&mut self) -> BTreeSet<Location> {
        self.inner_mut().drop_outgoing()
    }

    fn save(&self, registry: &LocationRegistry, out: &mut DataWriter) -> Result<()> {
        self.inner().save(registry, out)
    }
}

impl fmt::Display for LayerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, label: &str, set: &BTreeSet<Location>) -> fmt::Result {
            write!(f, "{label}=[")?;
            for (i, location) in set.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{location}")?;
            }
            f.write_str("]")
        }
        list(f, "sources", self.sources())?;
        if let Some(destinations) = self.destinations() {
            f.write_str(" ")?;
            list(f, "destinations", destinations)?;
        }
        Ok(())
    }
}

/// Reads a location list written by [`LocationRegistry::save_locations`] into a set.
pub(crate) fn load_set(
    registry: &LocationRegistry,
    input: &mut DataReader<'_>,
) -> Result<BTreeSet<Location>> {
    Ok(registry.load_locations(input)?.into_iter().collect())
}
