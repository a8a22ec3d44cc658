use std::collections::HashMap;

use tupledb_common::protocol::error::{ClientError, Result};

use super::types::{IndexMetadata, SpaceMetadata};

/// A complete, consistent set of space and index descriptors.
///
/// Built in one go and never modified afterwards; the cache replaces the
/// whole snapshot on refresh.
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    spaces: Vec<SpaceMetadata>,
    /// Indexes per space position in `spaces`, ordered by index id
    indexes: Vec<Vec<IndexMetadata>>,
    space_by_name: HashMap<String, usize>,
    space_by_id: HashMap<u32, usize>,
}

impl MetadataSnapshot {
    /// Builds a snapshot, checking that every index belongs to a known space
    /// and that names and ids are unique.
    pub fn new(spaces: Vec<SpaceMetadata>, indexes: Vec<IndexMetadata>) -> Result<Self> {
        let mut space_by_name = HashMap::with_capacity(spaces.len());
        let mut space_by_id = HashMap::with_capacity(spaces.len());

        for (position, space) in spaces.iter().enumerate() {
            if space_by_name.insert(space.name.clone(), position).is_some() {
                return Err(ClientError::Protocol(format!(
                    "Duplicate space name '{}' in metadata",
                    space.name
                )));
            }
            if space_by_id.insert(space.id, position).is_some() {
                return Err(ClientError::Protocol(format!(
                    "Duplicate space id {} in metadata",
                    space.id
                )));
            }
        }

        let mut by_space: Vec<Vec<IndexMetadata>> = vec![Vec::new(); spaces.len()];
        for index in indexes {
            let position = *space_by_id.get(&index.space_id).ok_or_else(|| {
                ClientError::Protocol(format!(
                    "Index '{}' refers to unknown space id {}",
                    index.name, index.space_id
                ))
            })?;

            let siblings = &by_space[position];
            if siblings.iter().any(|i| i.id == index.id || i.name == index.name) {
                return Err(ClientError::Protocol(format!(
                    "Duplicate index '{}' ({}) in space '{}'",
                    index.name, index.id, spaces[position].name
                )));
            }
            by_space[position].push(index);
        }
        for indexes in &mut by_space {
            indexes.sort_by_key(|i| i.id);
        }

        Ok(Self {
            spaces,
            indexes: by_space,
            space_by_name,
            space_by_id,
        })
    }

    pub fn space_by_name(&self, name: &str) -> Option<&SpaceMetadata> {
        self.space_by_name.get(name).map(|&p| &self.spaces[p])
    }

    pub fn space_by_id(&self, id: u32) -> Option<&SpaceMetadata> {
        self.space_by_id.get(&id).map(|&p| &self.spaces[p])
    }

    /// Indexes of the named space, ordered by id.
    pub fn indexes(&self, space_name: &str) -> Option<&[IndexMetadata]> {
        self.space_by_name
            .get(space_name)
            .map(|&p| self.indexes[p].as_slice())
    }

    pub fn index_by_name(&self, space_name: &str, index_name: &str) -> Option<&IndexMetadata> {
        self.indexes(space_name)?
            .iter()
            .find(|i| i.name == index_name)
    }

    pub fn index_by_id(&self, space_id: u32, index_id: u32) -> Option<&IndexMetadata> {
        let position = *self.space_by_id.get(&space_id)?;
        self.indexes[position].iter().find(|i| i.id == index_id)
    }

    pub fn spaces(&self) -> &[SpaceMetadata] {
        &self.spaces
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}
