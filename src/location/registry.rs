use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::{DataReader, DataWriter};
use crate::error::{Result, StorageError};

use super::{CustomCodec, ElementCodec, FileCodec, Location, LocationCodec, ReferenceCodec};

/// Marker to codec table, built once and passed to the index explicitly.
#[derive(Clone)]
pub struct LocationRegistry {
    codecs: BTreeMap<u8, Arc<dyn LocationCodec>>,
}

impl fmt::Debug for LocationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationRegistry")
            .field("markers", &self.markers().collect::<String>())
            .finish()
    }
}

impl Default for LocationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Collects codecs; the first conflict is reported by [`LocationRegistryBuilder::build`].
#[derive(Default)]
pub struct LocationRegistryBuilder {
    codecs: BTreeMap<u8, Arc<dyn LocationCodec>>,
    error: Option<StorageError>,
}

impl LocationRegistryBuilder {
    /// Adds `codec`. Duplicates are reported by [`Self::build`].
    pub fn register(mut self, codec: impl LocationCodec + 'static) -> Self {
        if self.error.is_some() {
            return self;
        }
        let marker = codec.marker();
        if !marker.is_ascii() {
            self.error = Some(StorageError::InvalidArgument(format!(
                "location marker {marker:?} is not ASCII"
            )));
            return self;
        }
        let byte = marker as u8;
        if self.codecs.contains_key(&byte) {
            self.error = Some(StorageError::DuplicateLocationMarker(marker));
            return self;
        }
        self.codecs.insert(byte, Arc::new(codec));
        self
    }

    /// Registers the file, element and reference codecs.
    pub fn with_standard(self) -> Self {
        self.register(FileCodec)
            .register(ElementCodec)
            .register(ReferenceCodec)
    }

    /// Registers an identifier-only codec for a collaborator variant.
    pub fn custom(self, marker: char) -> Self {
        self.register(CustomCodec::new(marker))
    }

    /// Fails if two codecs claim the same marker.
    pub fn build(self) -> Result<LocationRegistry> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(LocationRegistry {
                codecs: self.codecs,
            }),
        }
    }
}

impl LocationRegistry {
    /// Empty builder; see also [`LocationRegistry::standard`].
    pub fn builder() -> LocationRegistryBuilder {
        LocationRegistryBuilder::default()
    }

    /// Registry holding only the built-in variants.
    pub fn standard() -> Self {
        let mut codecs: BTreeMap<u8, Arc<dyn LocationCodec>> = BTreeMap::new();
        codecs.insert(FileCodec.marker() as u8, Arc::new(FileCodec));
        codecs.insert(ElementCodec.marker() as u8, Arc::new(ElementCodec));
        codecs.insert(ReferenceCodec.marker() as u8, Arc::new(ReferenceCodec));
        Self { codecs }
    }

    /// Registered markers, in order.
    pub fn markers(&self) -> impl Iterator<Item = char> + '_ {
        self.codecs.keys().map(|byte| *byte as char)
    }

    /// Codec for `marker`. Unregistered markers are structural errors.
    pub fn codec(&self, marker: char) -> Result<&dyn LocationCodec> {
        let byte = u8::try_from(marker).map_err(|_| StorageError::UnknownLocationMarker(marker))?;
        self.codecs
            .get(&byte)
            .map(|codec| codec.as_ref())
            .ok_or(StorageError::UnknownLocationMarker(marker))
    }

    /// Checks that a caller-supplied location can be stored. An unknown
    /// marker here is a bad argument, not a damaged file.
    pub fn check(&self, location: &Location) -> Result<&dyn LocationCodec> {
        self.codec(location.marker()).map_err(|_| {
            StorageError::InvalidArgument(format!(
                "location {location} uses unregistered marker '{}'",
                location.marker()
            ))
        })
    }

    /// Writes `[marker:u8][fields]`.
    pub fn write_location(&self, location: &Location, out: &mut DataWriter) -> Result<()> {
        let codec = self.check(location)?;
        out.write_u8(location.marker() as u8);
        codec.write(location, out)
    }

    /// Reads a marker byte and the location that follows.
    pub fn read_location(&self, input: &mut DataReader<'_>) -> Result<Location> {
        let marker = input.read_u8()? as char;
        self.codec(marker)?.read(input)
    }

    /// Writes `[count:i32][location...]`, preserving order.
    pub fn save_locations<'a, I>(&self, locations: I, out: &mut DataWriter) -> Result<()>
    where
        I: IntoIterator<Item = &'a Location>,
        I::IntoIter: ExactSizeIterator,
    {
        let locations = locations.into_iter();
        let count = i32::try_from(locations.len())
            .map_err(|_| StorageError::CapacityExceeded("location list too long".into()))?;
        out.write_i32(count);
        for location in locations {
            self.write_location(location, out)?;
        }
        Ok(())
    }

    /// Reads a count-prefixed list written by `save_locations`.
    pub fn load_locations(&self, input: &mut DataReader<'_>) -> Result<Vec<Location>> {
        let count = input.read_i32()?;
        if count < 0 {
            return Err(StorageError::corruption(format!(
                "negative location count {count}"
            )));
        }
        let mut locations = Vec::with_capacity((count as usize).min(input.remaining()));
        for _ in 0..count {
            locations.push(self.read_location(input)?);
        }
        Ok(locations)
    }

    /// Parses the form produced by [`Location::unique_identifier`].
    pub fn parse_unique_identifier(&self, unique: &str) -> Result<Location> {
        let mut chars = unique.chars();
        let marker = chars
            .next()
            .ok_or_else(|| StorageError::InvalidArgument("empty location identifier".into()))?;
        self.codec(marker)?.parse_identifier(chars.as_str())
    }

    /// Inverse of [`Location::tree_key`].
    pub fn location_from_tree_key<S: AsRef<str>>(&self, key: &[S]) -> Result<Location> {
        let (marker, rest) = key
            .split_first()
            .ok_or_else(|| StorageError::InvalidArgument("empty location key".into()))?;
        let mut chars = marker.as_ref().chars();
        let marker = match (chars.next(), chars.next()) {
            (Some(marker), None) => marker,
            _ => {
                return Err(StorageError::corruption(format!(
                    "location key starts with {:?}, not a marker",
                    marker.as_ref()
                )))
            }
        };
        let identifier = rest
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("/");
        self.codec(marker)?.parse_identifier(&identifier)
    }
}
