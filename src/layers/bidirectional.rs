use std::collections::BTreeSet;

use crate::codec::{DataReader, DataWriter};
use crate::error::Result;
use crate::location::{Location, LocationRegistry};

use super::{load_set, LocationInfo};

/// Sources pointing at a location and destinations it points at.
///
/// Stored as two location lists, sources first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidirectionalEdges {
    sources: BTreeSet<Location>,
    destinations: BTreeSet<Location>,
}

impl BidirectionalEdges {
    /// Locations this one points at.
    pub fn destinations(&self) -> &BTreeSet<Location> {
        &self.destinations
    }

    /// Returns `false` if the edge was already present.
    pub fn add_destination(&mut self, destination: Location) -> bool {
        self.destinations.insert(destination)
    }

    /// Reads the sources, then the destinations.
    pub fn load(registry: &LocationRegistry, input: &mut DataReader<'_>) -> Result<Self> {
        let sources = load_set(registry, input)?;
        let destinations = load_set(registry, input)?;
        Ok(Self {
            sources,
            destinations,
        })
    }
}

impl LocationInfo for BidirectionalEdges {
    fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.destinations.is_empty()
    }

    fn adjust_due_to_removal_of(&mut self, removed: &BTreeSet<Location>) -> bool {
        let before = self.sources.len() + self.destinations.len();
        self.sources.retain(|location| !removed.contains(location));
        self.destinations.retain(|location| !removed.contains(location));
        before != self.sources.len() + self.destinations.len()
    }

    fn locations_affected_by_removal_of_self(&self) -> BTreeSet<Location> {
        self.sources.union(&self.destinations).cloned().collect()
    }

    fn sources(&self) -> &BTreeSet<Location> {
        &self.sources
    }

    fn add_source(&mut self, source: Location) -> bool {
        self.sources.insert(source)
    }

    fn drop_outgoing(&mut self) -> BTreeSet<Location> {
        std::mem::take(&mut self.destinations)
    }

    fn save(&self, registry: &LocationRegistry, out: &mut DataWriter) -> Result<()> {
        registry.save_locations(&self.sources, out)?;
        registry.save_locations(&self.destinations, out)
    }
}
