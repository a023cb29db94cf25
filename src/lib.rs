//! Paged on-disk storage for a source-code cross-reference index.
//!
//! The store is one page file plus its write-ahead log. A disk-resident
//! trie storing one key segment per item ([`tree`]) maps location keys to
//! stable catalog ids ([`catalog`]); each id addresses one info slot per
//! layer ([`infostore`]). The [`Index`] facade applies one file's re-index
//! pass at a time and tracks which other files it invalidates.
//!
//! ```no_run
//! use xref_index::{Index, IndexConfig, Location, LocationRegistry};
//!
//! let index = Index::open("xref.idx", IndexConfig::default(), LocationRegistry::standard())?;
//! let mut tx = index.begin_file("lib/a.dart", 1_700_000_000)?;
//! tx.layer("reverse-edges")?
//!     .start_location(Location::element("lib/a.dart", "main"))
//!     .has_reference_to(Location::element("lib/b.dart", "helper"));
//! let stale = tx.commit()?;
//! assert!(stale.is_empty());
//! # Ok::<(), xref_index::IndexError>(())
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod file_info;
pub mod index;
pub mod infostore;
pub mod layers;
pub mod location;
pub mod pager;
pub mod storage;
pub mod transaction;
pub mod tree;

pub use catalog::{Catalog, CatalogId, MappingStatsSnapshot};
pub use config::{ConfigError, IndexConfig, LayerConfig};
pub use error::{IndexError, IndexResult, Result, StorageError};
pub use file_info::{DependentEntity, DependentLocation, FileInfo, PathAndModStamp, NOT_INDEXED};
pub use index::{Index, IndexState, IndexStats, ResyncPlan};
pub use infostore::{InfoStore, InfoStoreStats};
pub use layers::{Layer, LayerId, LayerInfo, LayerKind, LocationInfo};
pub use location::{Location, LocationCodec, LocationRegistry, SourceHandle};
pub use pager::{PageId, Pager, PagerOptions, PagerStatsSnapshot, Synchronous};
pub use storage::{IndexStorage, StorageStats};
pub use transaction::{
    DependenciesBuilder, FileTransaction, LayerUpdater, LocationUpdater, TxState,
};
pub use tree::{TreePath, TreePos, TreeStore, TreeStoreStats};
