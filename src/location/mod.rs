#![forbid(unsafe_code)]
//! Locations: identifiers for places in analyzed source, tagged by a
//! one-character type marker that selects their codec.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{DataReader, DataWriter};
use crate::error::{Result, StorageError};

mod registry;

pub use registry::{LocationRegistry, LocationRegistryBuilder};

/// Marker of [`Location::File`].
pub const FILE_MARKER: char = 'f';
/// Marker of [`Location::Element`].
pub const ELEMENT_MARKER: char = 'e';
/// Marker of [`Location::Reference`].
pub const REFERENCE_MARKER: char = 'r';

/// Reference to a source file, as supplied by the analysis collaborator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceHandle(String);

impl SourceHandle {
    /// Handle for the file at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Path as given when the handle was created.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceHandle {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for SourceHandle {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// A place in source. Variants are dispatched by [`Location::marker`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    /// A whole source file.
    File(SourceHandle),
    /// A named declaration inside a file.
    Element { file: SourceHandle, name: String },
    /// A source range inside a file.
    Reference {
        file: SourceHandle,
        offset: u32,
        length: u32,
    },
    /// A collaborator-defined variant identified only by its string form.
    Custom { marker: char, identifier: String },
}

impl Location {
    /// The file itself.
    pub fn file(path: impl Into<SourceHandle>) -> Self {
        Location::File(path.into())
    }

    /// A named element declared in `path`.
    pub fn element(path: impl Into<SourceHandle>, name: impl Into<String>) -> Self {
        Location::Element {
            file: path.into(),
            name: name.into(),
        }
    }

    /// A source range of `length` characters at `offset` in `path`.
    pub fn reference(path: impl Into<SourceHandle>, offset: u32, length: u32) -> Self {
        Location::Reference {
            file: path.into(),
            offset,
            length,
        }
    }

    /// Marker byte of the variant.
    pub fn marker(&self) -> char {
        match self {
            Location::File(_) => FILE_MARKER,
            Location::Element { .. } => ELEMENT_MARKER,
            Location::Reference { .. } => REFERENCE_MARKER,
            Location::Custom { marker, .. } => *marker,
        }
    }

    /// Stable string form, unique among locations of the same marker.
    pub fn semi_unique_identifier(&self) -> String {
        match self {
            Location::File(file) => file.to_string(),
            Location::Element { file, name } => {
                let mut id = String::with_capacity(file.as_str().len() + name.len() + 1);
                escape_element_part(file.as_str(), &mut id);
                id.push('#');
                escape_element_part(name, &mut id);
                id
            }
            Location::Reference {
                file,
                offset,
                length,
            } => format!("{file}@{offset}:{length}"),
            Location::Custom { identifier, .. } => identifier.clone(),
        }
    }

    /// Marker followed by the semi-unique identifier.
    pub fn unique_identifier(&self) -> String {
        let mut id = String::new();
        id.push(self.marker());
        id.push_str(&self.semi_unique_identifier());
        id
    }

    /// File the location was found in, if the variant knows it.
    pub fn source_file(&self) -> Option<&SourceHandle> {
        match self {
            Location::File(file)
            | Location::Element { file, .. }
            | Location::Reference { file, .. } => Some(file),
            Location::Custom { .. } => None,
        }
    }

    /// Key under which the location is stored in the tree: the marker,
    /// then the identifier split on `/`.
    pub fn tree_key(&self) -> Vec<String> {
        let mut key = vec![self.marker().to_string()];
        key.extend(self.semi_unique_identifier().split('/').map(str::to_owned));
        key
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unique_identifier())
    }
}

/// Serializer for one location variant.
pub trait LocationCodec: Send + Sync {
    /// Marker byte identifying the variant on disk.
    fn marker(&self) -> char;

    /// Writes the variant fields, without the marker.
    fn write(&self, location: &Location, out: &mut DataWriter) -> Result<()>;

    /// Reads the variant fields written by [`LocationCodec::write`].
    fn read(&self, input: &mut DataReader<'_>) -> Result<Location>;

    /// Rebuilds a location from its semi-unique identifier.
    fn parse_identifier(&self, identifier: &str) -> Result<Location>;
}

fn mismatch(codec: char, location: &Location) -> StorageError {
    StorageError::InvalidArgument(format!(
        "codec '{codec}' cannot write location {location}"
    ))
}

/// Codec for [`Location::File`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FileCodec;

impl LocationCodec for FileCodec {
    fn marker(&self) -> char {
        FILE_MARKER
    }

    fn write(&self, location: &Location, out: &mut DataWriter) -> Result<()> {
        match location {
            Location::File(file) => out.write_string(file.as_str()),
            other => Err(mismatch(FILE_MARKER, other)),
        }
    }

    fn read(&self, input: &mut DataReader<'_>) -> Result<Location> {
        Ok(Location::File(SourceHandle::new(input.read_string()?)))
    }

    fn parse_identifier(&self, identifier: &str) -> Result<Location> {
        Ok(Location::file(identifier))
    }
}

/// Codec for [`Location::Element`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ElementCodec;

impl LocationCodec for ElementCodec {
    fn marker(&self) -> char {
        ELEMENT_MARKER
    }

    fn write(&self, location: &Location, out: &mut DataWriter) -> Result<()> {
        match location {
            Location::Element { file, name } => {
                out.write_string(file.as_str())?;
                out.write_string(name)
            }
            other => Err(mismatch(ELEMENT_MARKER, other)),
        }
    }

    fn read(&self, input: &mut DataReader<'_>) -> Result<Location> {
        let file = input.read_string()?;
        let name = input.read_string()?;
        Ok(Location::element(file, name))
    }

    fn parse_identifier(&self, identifier: &str) -> Result<Location> {
        let (file, name) = split_element_identifier(identifier).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "element identifier {identifier:?} is not `file#name`"
            ))
        })?;
        Ok(Location::element(file, name))
    }
}

/// `#` separates file from name, so both are written with `#` and `\`
/// backslash-escaped.
fn escape_element_part(part: &str, out: &mut String) {
    for c in part.chars() {
        if c == '\\' || c == '#' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn split_element_identifier(identifier: &str) -> Option<(String, String)> {
    let mut parts = [String::new(), String::new()];
    let mut current = 0;
    let mut chars = identifier.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => parts[current].push(chars.next()?),
            '#' if current == 0 => current = 1,
            '#' => return None,
            c => parts[current].push(c),
        }
    }
    let [file, name] = parts;
    (current == 1).then_some((file, name))
}

/// Codec for [`Location::Reference`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCodec;

impl LocationCodec for ReferenceCodec {
    fn marker(&self) -> char {
        REFERENCE_MARKER
    }

    fn write(&self, location: &Location, out: &mut DataWriter) -> Result<()> {
        match location {
            Location::Reference {
                file,
                offset,
                length,
            } => {
                out.write_string(file.as_str())?;
                out.write_u32(*offset);
                out.write_u32(*length);
                Ok(())
            }
            other => Err(mismatch(REFERENCE_MARKER, other)),
        }
    }

    fn read(&self, input: &mut DataReader<'_>) -> Result<Location> {
        let file = input.read_string()?;
        let offset = input.read_u32()?;
        let length = input.read_u32()?;
        Ok(Location::reference(file, offset, length))
    }

    fn parse_identifier(&self, identifier: &str) -> Result<Location> {
        let bad = || {
            StorageError::InvalidArgument(format!(
                "reference identifier {identifier:?} is not path@offset:length"
            ))
        };
        let (file, range) = identifier.rsplit_once('@').ok_or_else(bad)?;
        let (offset, length) = range.split_once(':').ok_or_else(bad)?;
        let offset = offset.parse().map_err(|_| bad())?;
        let length = length.parse().map_err(|_| bad())?;
        Ok(Location::reference(file, offset, length))
    }
}

/// Codec for collaborator variants that only carry their identifier.
#[derive(Debug, Clone, Copy)]
pub struct CustomCodec {
    marker: char,
}

impl CustomCodec {
    /// Codec for custom locations tagged with `marker`.
    pub fn new(marker: char) -> Self {
        Self { marker }
    }
}

impl LocationCodec for CustomCodec {
    fn marker(&self) -> char {
        self.marker
    }

    fn write(&self, location: &Location, out: &mut DataWriter) -> Result<()> {
        match location {
            Location::Custom { marker, identifier } if *marker == self.marker => {
                out.write_string(identifier)
            }
            other => Err(mismatch(self.marker, other)),
        }
    }

    fn read(&self, input: &mut DataReader<'_>) -> Result<Location> {
        Ok(Location::Custom {
            marker: self.marker,
            identifier: input.read_string()?,
        })
    }

    fn parse_identifier(&self, identifier: &str) -> Result<Location> {
        Ok(Location::Custom {
            marker: self.marker,
            identifier: identifier.to_owned(),
        })
    }
}
