use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::category_match;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed schema xml: {0}")]
    Xml(String),
    #[error("schema declares no entity types or operations")]
    Empty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Action,
    Function,
}

#[derive(Clone, Debug)]
pub struct OperationDef {
    pub name: String,
    pub namespace: String,
    pub kind: OperationKind,
    pub bound: bool,
}

impl OperationDef {
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

#[derive(Clone, Debug)]
pub struct NavigationDef {
    pub name: String,
    pub target_type: String,
    pub collection: bool,
}

#[derive(Clone, Debug, Default)]
pub struct EntityTypeDef {
    pub name: String,
    properties: HashSet<String>,
    navigation: HashMap<String, NavigationDef>,
}

impl EntityTypeDef {
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains(&name.to_ascii_lowercase())
    }

    pub fn navigation(&self, name: &str) -> Option<&NavigationDef> {
        self.navigation.get(&name.to_ascii_lowercase())
    }
}

#[derive(Clone, Debug)]
pub struct EntitySetDef {
    pub name: String,
    pub entity_type: String,
}

/// The slice of the platform's CSDL document the parser needs: entity
/// types, entity sets and the action/function catalog.
#[derive(Clone, Debug, Default)]
pub struct OperationSchema {
    namespace: String,
    entity_types: HashMap<String, EntityTypeDef>,
    entity_sets: HashMap<String, EntitySetDef>,
    sets_by_type: HashMap<String, String>,
    operations: HashMap<String, OperationDef>,
}

impl OperationSchema {
    pub fn parse(xml: &str) -> Result<Self, SchemaError> {
        let mut reader = Reader::from_str(xml);
        let mut schema = OperationSchema::default();
        let mut namespace = String::new();
        let mut current_type: Option<EntityTypeDef> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|err| SchemaError::Xml(err.to_string()))?;
            match event {
                Event::Start(element) => {
                    handle_element(&element, &mut schema, &mut namespace, &mut current_type, true)?;
                }
                Event::Empty(element) => {
                    handle_element(&element, &mut schema, &mut namespace, &mut current_type, false)?;
                }
                Event::End(element) => {
                    if element.local_name().as_ref() == b"EntityType"
                        && let Some(entity) = current_type.take()
                    {
                        schema.insert_entity_type(entity);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if schema.entity_types.is_empty() && schema.operations.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (set_key, set) in &schema.entity_sets {
            schema
                .sets_by_type
                .entry(set.entity_type.to_ascii_lowercase())
                .or_insert_with(|| set_key.clone());
        }
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let xml = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&xml)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn entity_set(&self, name: &str) -> Option<&EntitySetDef> {
        self.entity_sets.get(&name.to_ascii_lowercase())
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityTypeDef> {
        self.entity_types.get(&name.to_ascii_lowercase())
    }

    /// Entity set exposing `entity_type`, if the container declares one.
    pub fn entity_set_for_type(&self, entity_type: &str) -> Option<&str> {
        let key = self.sets_by_type.get(&entity_type.to_ascii_lowercase())?;
        self.entity_sets.get(key).map(|set| set.name.as_str())
    }

    /// Looks up an action or function by qualified (`ns.name`, any alias) or
    /// short name.
    pub fn operation(&self, segment: &str) -> Option<&OperationDef> {
        self.operations
            .get(&short_name(segment).to_ascii_lowercase())
    }

    /// Lookup fields surface in the service document only in their
    /// `_name_value` form.
    pub fn is_lookup(&self, entity: &str, field: &str) -> bool {
        self.entity_type(entity)
            .map(|entity| entity.has_property(&format!("_{field}_value")))
            .unwrap_or(false)
    }

    fn insert_entity_type(&mut self, entity: EntityTypeDef) {
        self.entity_types
            .insert(entity.name.to_ascii_lowercase(), entity);
    }
}

fn handle_element(
    element: &BytesStart<'_>,
    schema: &mut OperationSchema,
    namespace: &mut String,
    current_type: &mut Option<EntityTypeDef>,
    has_children: bool,
) -> Result<(), SchemaError> {
    match element.local_name().as_ref() {
        b"Schema" => {
            *namespace = attribute(element, b"Namespace")?.unwrap_or_default();
            if schema.namespace.is_empty() {
                schema.namespace = namespace.clone();
            }
        }
        b"EntityType" => {
            let Some(name) = attribute(element, b"Name")? else {
                return Ok(());
            };
            let entity = EntityTypeDef {
                name,
                ..EntityTypeDef::default()
            };
            if has_children {
                *current_type = Some(entity);
            } else {
                schema.insert_entity_type(entity);
            }
        }
        b"Property" => {
            if let (Some(entity), Some(name)) = (current_type.as_mut(), attribute(element, b"Name")?)
            {
                entity.properties.insert(name.to_ascii_lowercase());
            }
        }
        b"NavigationProperty" => {
            if let (Some(entity), Some(name), Some(raw_type)) = (
                current_type.as_mut(),
                attribute(element, b"Name")?,
                attribute(element, b"Type")?,
            ) {
                let (collection, inner) = match raw_type
                    .strip_prefix("Collection(")
                    .and_then(|value| value.strip_suffix(')'))
                {
                    Some(inner) => (true, inner),
                    None => (false, raw_type.as_str()),
                };
                entity.navigation.insert(
                    name.to_ascii_lowercase(),
                    NavigationDef {
                        name,
                        target_type: short_name(inner).to_string(),
                        collection,
                    },
                );
            }
        }
        kind @ (b"Action" | b"Function") => {
            if let Some(name) = attribute(element, b"Name")? {
                let bound = attribute(element, b"IsBound")?
                    .map(|value| value.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                let kind = if kind == b"Action" {
                    OperationKind::Action
                } else {
                    OperationKind::Function
                };
                schema.operations.insert(
                    name.to_ascii_lowercase(),
                    OperationDef {
                        name,
                        namespace: namespace.clone(),
                        kind,
                        bound,
                    },
                );
            }
        }
        kind @ (b"ActionImport" | b"FunctionImport") => {
            if let Some(name) = attribute(element, b"Name")? {
                let kind = if kind == b"ActionImport" {
                    OperationKind::Action
                } else {
                    OperationKind::Function
                };
                schema
                    .operations
                    .entry(name.to_ascii_lowercase())
                    .or_insert_with(|| OperationDef {
                        name,
                        namespace: namespace.clone(),
                        kind,
                        bound: false,
                    });
            }
        }
        b"EntitySet" => {
            if let (Some(name), Some(entity_type)) =
                (attribute(element, b"Name")?, attribute(element, b"EntityType")?)
            {
                schema.entity_sets.insert(
                    name.to_ascii_lowercase(),
                    EntitySetDef {
                        name,
                        entity_type: short_name(&entity_type).to_string(),
                    },
                );
            }
        }
        _ => {}
    }
    Ok(())
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, SchemaError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|err| SchemaError::Xml(err.to_string()))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| SchemaError::Xml(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// `Microsoft.Dynamics.CRM.account` -> `account`.
pub fn short_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

/// How long a schema lookup trusts the last file check.
const SCHEMA_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

struct CachedSchema {
    /// `None` when the file was missing at the last check.
    modified: Option<SystemTime>,
    schema: Option<Arc<OperationSchema>>,
    checked_at: Instant,
}

/// Lazily parses the schema file and re-parses only when its modification
/// time changes. The file is stat'ed at most once per recheck interval.
pub struct SchemaCache {
    path: Option<PathBuf>,
    recheck_interval: Duration,
    cached: Mutex<Option<CachedSchema>>,
}

impl SchemaCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            recheck_interval: SCHEMA_RECHECK_INTERVAL,
            cached: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Wraps an already-parsed schema; never touches the filesystem.
    pub fn preloaded(schema: OperationSchema) -> Self {
        Self {
            path: None,
            recheck_interval: SCHEMA_RECHECK_INTERVAL,
            cached: Mutex::new(Some(CachedSchema {
                modified: None,
                schema: Some(Arc::new(schema)),
                checked_at: Instant::now(),
            })),
        }
    }

    /// Zero checks the file on every lookup.
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Option<Arc<OperationSchema>> {
        let mut cached = self.cached.lock().expect("schema cache lock poisoned");
        let Some(path) = self.path.as_deref() else {
            return cached.as_ref().and_then(|entry| entry.schema.clone());
        };
        if let Some(entry) = cached.as_ref()
            && entry.checked_at.elapsed() < self.recheck_interval
        {
            return entry.schema.clone();
        }

        let modified = match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                debug!(
                    "{} schema file unavailable path={} err={err}",
                    category_match(),
                    path.display()
                );
                *cached = Some(CachedSchema {
                    modified: None,
                    schema: None,
                    checked_at: Instant::now(),
                });
                return None;
            }
        };

        if let Some(entry) = cached.as_mut()
            && entry.modified == Some(modified)
        {
            entry.checked_at = Instant::now();
            return entry.schema.clone();
        }

        let schema = match OperationSchema::load(path) {
            Ok(schema) => {
                debug!(
                    "{} loaded operation schema path={} entity_sets={} operations={}",
                    category_match(),
                    path.display(),
                    schema.entity_sets.len(),
                    schema.operations.len()
                );
                Some(Arc::new(schema))
            }
            Err(err) => {
                warn!(
                    "{} schema parse failed, using heuristic parsing: {err}",
                    category_match()
                );
                None
            }
        };
        *cached = Some(CachedSchema {
            modified: Some(modified),
            schema: schema.clone(),
            checked_at: Instant::now(),
        });
        schema
    }
}
