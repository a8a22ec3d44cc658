//! Space and index metadata.
//!
//! [`MetadataCache`] resolves space and index names to ids. It is filled from
//! a [`MetadataProvider`] on first use and refreshed on demand.

pub mod cache;
pub mod provider;
pub mod single_flight;
pub mod snapshot;
pub mod types;

pub use cache::MetadataCache;
pub use provider::{
    DdlMetadataProvider, MetadataProvider, SystemSpacesMetadataProvider, DEFAULT_DDL_FUNCTION,
};
pub use single_flight::SingleFlight;
pub use snapshot::MetadataSnapshot;
pub use types::{FieldMetadata, IndexMetadata, IndexPart, SpaceMetadata};
