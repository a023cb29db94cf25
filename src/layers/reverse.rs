use std::collections::BTreeSet;

use crate::codec::{DataReader, DataWriter};
use crate::error::Result;
use crate::location::{Location, LocationRegistry};

use super::{load_set, LocationInfo};

/// Locations that reference this one. Nothing else refers back to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseEdges {
    sources: BTreeSet<Location>,
}

impl ReverseEdges {
    /// Reads a sources set written by `save`.
    pub fn load(registry: &LocationRegistry, input: &mut DataReader<'_>) -> Result<Self> {
        Ok(Self {
            sources: load_set(registry, input)?,
        })
    }
}

impl LocationInfo for ReverseEdges {
    fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn adjust_due_to_removal_of(&mut self, removed: &BTreeSet<Location>) -> bool {
        let before = self.sources.len();
        self.sources.retain(|location| !removed.contains(location));
        before != self.sources.len()
    }

    fn locations_affected_by_removal_of_self(&self) -> BTreeSet<Location> {
        BTreeSet::new()
    }

    fn sources(&self) -> &BTreeSet<Location> {
        &self.sources
    }

    fn add_source(&mut self, source: Location) -> bool {
        self.sources.insert(source)
    }

    fn drop_outgoing(&mut self) -> BTreeSet<Location> {
        BTreeSet::new()
    }

    fn save(&self, registry: &LocationRegistry, out: &mut DataWriter) -> Result<()> {
        registry.save_locations(&self.sources, out)
    }
}
