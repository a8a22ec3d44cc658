//! Sources of schema metadata.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;
use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::protocol::{IteratorType, Request};

use super::snapshot::MetadataSnapshot;
use super::types::{FieldMetadata, IndexMetadata, IndexPart, SpaceMetadata};
use crate::pipeline::RequestExecutor;

/// System space listing every space visible to the user.
pub const VSPACE_ID: u32 = 281;
/// System space listing every index visible to the user.
pub const VINDEX_ID: u32 = 289;
/// First id handed out to user spaces.
pub const USER_SPACE_MIN_ID: u32 = 512;
/// Schema-description function used by [`DdlMetadataProvider`] by default.
pub const DEFAULT_DDL_FUNCTION: &str = "ddl.get_schema";

/// Fetches a complete metadata snapshot from the server.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch(&self) -> Result<MetadataSnapshot>;
}

/// Reads the `_vspace` and `_vindex` system spaces.
pub struct SystemSpacesMetadataProvider {
    executor: Arc<dyn RequestExecutor>,
}

impl SystemSpacesMetadataProvider {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self { executor }
    }

    async fn select_all(&self, space_id: u32) -> Result<Vec<Value>> {
        let request = Request::select(space_id, 0, Value::Null, IteratorType::All, u32::MAX, 0);
        match self.executor.execute(request).await? {
            Value::Array(tuples) => Ok(tuples),
            other => Err(malformed("select result", &other)),
        }
    }
}

#[async_trait]
impl MetadataProvider for SystemSpacesMetadataProvider {
    async fn fetch(&self) -> Result<MetadataSnapshot> {
        let (spaces, indexes) =
            futures::try_join!(self.select_all(VSPACE_ID), self.select_all(VINDEX_ID))?;

        let spaces = spaces
            .iter()
            .map(parse_vspace_tuple)
            .collect::<Result<Vec<_>>>()?;
        let indexes = indexes
            .iter()
            .map(parse_vindex_tuple)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Fetched {} spaces and {} indexes from system spaces",
            spaces.len(),
            indexes.len()
        );
        MetadataSnapshot::new(spaces, indexes)
    }
}

/// Calls a schema-description function and parses its result.
///
/// The function returns `{spaces: {<name>: {id, engine, format, indexes}}}`,
/// where `format` lists `{name, type, is_nullable}` and every index lists
/// `{name, type, unique, parts: [{path, type}]}`. A part's `path` names the
/// field, optionally followed by a nested path (`"meta.tags"`).
pub struct DdlMetadataProvider {
    executor: Arc<dyn RequestExecutor>,
    function: String,
}

impl DdlMetadataProvider {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self::with_function(executor, DEFAULT_DDL_FUNCTION)
    }

    pub fn with_function(executor: Arc<dyn RequestExecutor>, function: impl Into<String>) -> Self {
        Self {
            executor,
            function: function.into(),
        }
    }
}

#[async_trait]
impl MetadataProvider for DdlMetadataProvider {
    async fn fetch(&self) -> Result<MetadataSnapshot> {
        let result = self
            .executor
            .execute(Request::call(&self.function, json!([])))
            .await?;
        let (spaces, indexes) = parse_ddl_schema(&result)?;
        debug!(
            "Fetched {} spaces and {} indexes via {}",
            spaces.len(),
            indexes.len(),
            self.function
        );
        MetadataSnapshot::new(spaces, indexes)
    }
}

fn malformed(what: &str, value: &Value) -> ClientError {
    ClientError::Protocol(format!("Malformed {}: {}", what, value))
}

fn field<'a>(tuple: &'a [Value], position: usize, what: &str) -> Result<&'a Value> {
    tuple
        .get(position)
        .ok_or_else(|| ClientError::Protocol(format!("{} tuple has no field {}", what, position)))
}

fn as_u32(value: &Value, what: &str) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| malformed(what, value))
}

fn as_str<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| malformed(what, value))
}

/// `[id, owner, name, engine, field_count, flags, format]`
fn parse_vspace_tuple(tuple: &Value) -> Result<SpaceMetadata> {
    let tuple = tuple.as_array().ok_or_else(|| malformed("_vspace tuple", tuple))?;

    let format = match tuple.get(6) {
        Some(Value::Array(format)) => format.as_slice(),
        Some(Value::Null) | None => &[],
        Some(other) => return Err(malformed("space format", other)),
    };

    Ok(SpaceMetadata {
        id: as_u32(field(tuple, 0, "_vspace")?, "space id")?,
        owner: as_u32(field(tuple, 1, "_vspace")?, "space owner")?,
        name: as_str(field(tuple, 2, "_vspace")?, "space name")?.to_string(),
        engine: as_str(field(tuple, 3, "_vspace")?, "space engine")?.to_string(),
        fields: parse_format(format)?,
    })
}

fn parse_format(format: &[Value]) -> Result<Vec<FieldMetadata>> {
    format
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            let entry = entry.as_object().ok_or_else(|| malformed("format entry", entry))?;
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Protocol("Format entry without a name".to_string()))?;
            Ok(FieldMetadata {
                name: name.to_string(),
                field_type: entry
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any")
                    .to_string(),
                position,
                is_nullable: entry
                    .get("is_nullable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

/// `[space_id, index_id, name, type, opts, parts]`
fn parse_vindex_tuple(tuple: &Value) -> Result<IndexMetadata> {
    let tuple = tuple.as_array().ok_or_else(|| malformed("_vindex tuple", tuple))?;

    let unique = field(tuple, 4, "_vindex")?
        .get("unique")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let parts = match field(tuple, 5, "_vindex")? {
        Value::Array(parts) => parts.iter().map(parse_vindex_part).collect::<Result<_>>()?,
        other => return Err(malformed("index parts", other)),
    };

    Ok(IndexMetadata {
        space_id: as_u32(field(tuple, 0, "_vindex")?, "index space id")?,
        id: as_u32(field(tuple, 1, "_vindex")?, "index id")?,
        name: as_str(field(tuple, 2, "_vindex")?, "index name")?.to_string(),
        index_type: as_str(field(tuple, 3, "_vindex")?, "index type")?.to_string(),
        unique,
        parts,
    })
}

/// Parts come either as `{field, type, path}` maps or as legacy
/// `[field, type]` pairs.
fn parse_vindex_part(part: &Value) -> Result<IndexPart> {
    match part {
        Value::Object(map) => Ok(IndexPart {
            field_position: map
                .get("field")
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed("index part", part))? as usize,
            field_type: map
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("any")
                .to_string(),
            path: map.get("path").and_then(Value::as_str).map(str::to_string),
        }),
        Value::Array(pair) => Ok(IndexPart {
            field_position: pair
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed("index part", part))? as usize,
            field_type: pair
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("any")
                .to_string(),
            path: None,
        }),
        other => Err(malformed("index part", other)),
    }
}

fn parse_ddl_schema(result: &Value) -> Result<(Vec<SpaceMetadata>, Vec<IndexMetadata>)> {
    // Functions return a list of values; the schema is the first one.
    let schema = match result {
        Value::Array(values) => values.first().unwrap_or(&Value::Null),
        other => other,
    };
    let spaces = schema
        .get("spaces")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("schema", schema))?;

    // Spaces without an explicit id get stable ids in name order, skipping
    // ids that other spaces declare.
    let mut names: Vec<&String> = spaces.keys().collect();
    names.sort();
    let declared: HashSet<u64> = spaces
        .values()
        .filter_map(|definition| definition.get("id").and_then(Value::as_u64))
        .collect();
    let mut next_id = USER_SPACE_MIN_ID;

    let mut out_spaces = Vec::with_capacity(spaces.len());
    let mut out_indexes = Vec::new();
    for name in names {
        let definition = spaces[name.as_str()]
            .as_object()
            .ok_or_else(|| malformed("space definition", &spaces[name.as_str()]))?;
        let id = match definition.get("id") {
            Some(id) => as_u32(id, "space id")?,
            None => {
                while declared.contains(&u64::from(next_id)) {
                    next_id += 1;
                }
                let id = next_id;
                next_id += 1;
                id
            }
        };

        let format = match definition.get("format") {
            Some(Value::Array(format)) => format.as_slice(),
            _ => &[],
        };
        let space = SpaceMetadata {
            id,
            name: name.clone(),
            owner: definition.get("owner").map(|o| as_u32(o, "space owner")).transpose()?.unwrap_or(1),
            engine: definition
                .get("engine")
                .and_then(Value::as_str)
                .unwrap_or("memtx")
                .to_string(),
            fields: parse_format(format)?,
        };

        if let Some(Value::Array(indexes)) = definition.get("indexes") {
            for (position, index) in indexes.iter().enumerate() {
                let index = index.as_object().ok_or_else(|| malformed("index definition", index))?;
                out_indexes.push(parse_ddl_index(&space, position as u32, index)?);
            }
        }
        out_spaces.push(space);
    }

    Ok((out_spaces, out_indexes))
}

fn parse_ddl_index(space: &SpaceMetadata, position: u32, index: &Map<String, Value>) -> Result<IndexMetadata> {
    let name = index
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Protocol(format!("Index without a name in space '{}'", space.name)))?;

    let parts = match index.get("parts") {
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| parse_ddl_part(space, part))
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    Ok(IndexMetadata {
        space_id: space.id,
        id: index
            .get("id")
            .map(|id| as_u32(id, "index id"))
            .transpose()?
            .unwrap_or(position),
        name: name.to_string(),
        index_type: index
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("TREE")
            .to_string(),
        unique: index.get("unique").and_then(Value::as_bool).unwrap_or(false),
        parts,
    })
}

fn parse_ddl_part(space: &SpaceMetadata, part: &Value) -> Result<IndexPart> {
    let path = part
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("index part", part))?;
    let (field_name, nested) = match path.split_once('.') {
        Some((field, rest)) => (field, Some(rest.to_string())),
        None => (path, None),
    };
    let field = space.field(field_name).ok_or_else(|| {
        ClientError::Protocol(format!(
            "Index part refers to unknown field '{}' in space '{}'",
            field_name, space.name
        ))
    })?;

    Ok(IndexPart {
        field_position: field.position,
        field_type: part
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(field.field_type.as_str())
            .to_string(),
        path: nested,
    })
}
