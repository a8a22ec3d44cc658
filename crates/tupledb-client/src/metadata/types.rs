use serde::{Deserialize, Serialize};

/// One field of a space format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    pub field_type: String,
    /// Zero-based position in the tuple
    pub position: usize,
    pub is_nullable: bool,
}

/// A space (table) and its format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMetadata {
    pub id: u32,
    pub name: String,
    pub owner: u32,
    pub engine: String,
    /// Fields in tuple order
    pub fields: Vec<FieldMetadata>,
}

impl SpaceMetadata {
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.field(name).map(|f| f.position)
    }
}

/// One key part of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPart {
    pub field_position: usize,
    pub field_type: String,
    /// JSON path into the field, for indexes over nested data
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub space_id: u32,
    pub id: u32,
    pub name: String,
    pub index_type: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

impl IndexMetadata {
    /// The primary index always has id 0.
    pub fn is_primary(&self) -> bool {
        self.id == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup() {
        let space = SpaceMetadata {
            id: 512,
            name: "users".into(),
            owner: 1,
            engine: "memtx".into(),
            fields: vec![
                FieldMetadata {
                    name: "id".into(),
                    field_type: "unsigned".into(),
                    position: 0,
                    is_nullable: false,
                },
                FieldMetadata {
                    name: "email".into(),
                    field_type: "string".into(),
                    position: 1,
                    is_nullable: true,
                },
            ],
        };

        assert_eq!(space.field_position("email"), Some(1));
        assert!(space.field("email").unwrap().is_nullable);
        assert!(space.field("missing").is_none());
    }
}
