use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    logging::category_match,
    schema::{OperationSchema, SchemaCache, short_name},
};

pub const EXECUTE_MULTIPLE: &str = "ExecuteMultiple";
/// Operation reported for api calls that map to no platform message, such as
/// `OPTIONS` requests or `$metadata` reads.
pub const UNKNOWN_OPERATION: &str = "Unknown";

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("url has no web api path segment")]
    NotAnApiPath,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Schema,
    Heuristic,
}

/// Canonical form of the server-side operation an intercepted call asks for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationDescriptor {
    pub operation: String,
    /// Never empty. Holds the operation name plus its namespaced/short forms.
    pub synonyms: Vec<String>,
    pub entity: String,
    pub collection: String,
    /// Raw text between the key parentheses: a GUID or an alternate key.
    pub record_key: Option<String>,
    pub source: ParseSource,
}

impl OperationDescriptor {
    fn new(
        operation: impl Into<String>,
        synonyms: Vec<String>,
        entity: impl Into<String>,
        collection: impl Into<String>,
        record_key: Option<String>,
        source: ParseSource,
    ) -> Self {
        let operation = operation.into();
        let mut unique: Vec<String> = Vec::with_capacity(synonyms.len() + 1);
        for name in std::iter::once(operation.clone()).chain(synonyms) {
            if !name.is_empty()
                && !unique
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(&name))
            {
                unique.push(name);
            }
        }
        Self {
            operation,
            synonyms: unique,
            entity: entity.into(),
            collection: collection.into(),
            record_key,
            source,
        }
    }

    fn crud(
        operation: &str,
        entity: impl Into<String>,
        collection: impl Into<String>,
        record_key: Option<String>,
        source: ParseSource,
    ) -> Self {
        Self::new(operation, Vec::new(), entity, collection, record_key, source)
    }

    fn batch(source: ParseSource) -> Self {
        Self::crud(EXECUTE_MULTIPLE, "", "", None, source)
    }

    fn unknown(
        entity: impl Into<String>,
        collection: impl Into<String>,
        record_key: Option<String>,
    ) -> Self {
        Self::crud(
            UNKNOWN_OPERATION,
            entity,
            collection,
            record_key,
            ParseSource::Heuristic,
        )
    }

    pub fn is_unknown(&self) -> bool {
        self.operation == UNKNOWN_OPERATION
    }

    /// Lowercased entity names a step's target entity may equal.
    pub fn entity_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::with_capacity(3);
        for name in [
            self.entity.to_ascii_lowercase(),
            self.collection.to_ascii_lowercase(),
            singularize(&self.collection).to_ascii_lowercase(),
        ] {
            if !name.is_empty() && !candidates.contains(&name) {
                candidates.push(name);
            }
        }
        candidates
    }

    pub fn is_read(&self) -> bool {
        self.operation.eq_ignore_ascii_case("Retrieve")
            || self.operation.eq_ignore_ascii_case("RetrieveMultiple")
    }

    pub fn is_delete(&self) -> bool {
        self.operation.eq_ignore_ascii_case("Delete")
    }

    pub fn matches_operation(&self, name: &str) -> bool {
        self.synonyms
            .iter()
            .any(|synonym| synonym.eq_ignore_ascii_case(name))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    pub key: Option<String>,
}

impl PathSegment {
    fn parse(raw: &str) -> Self {
        if let Some(open) = raw.find('(')
            && raw.ends_with(')')
        {
            let key = raw[open + 1..raw.len() - 1].trim();
            return Self {
                name: raw[..open].to_string(),
                key: (!key.is_empty()).then(|| key.to_string()),
            };
        }
        Self {
            name: raw.to_string(),
            key: None,
        }
    }

    fn is_system(&self) -> bool {
        self.name.starts_with('$')
    }

    fn is_qualified(&self) -> bool {
        !self.is_system() && self.name.contains('.')
    }
}

/// The part of a web api url after the `api/data/v<version>` marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiPath {
    pub version: String,
    pub segments: Vec<PathSegment>,
}

pub fn extract_api_path(url: &str) -> Option<ApiPath> {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let raw: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    let marker = raw.windows(3).position(|window| {
        window[0].eq_ignore_ascii_case("api")
            && window[1].eq_ignore_ascii_case("data")
            && is_version_segment(window[2])
    })?;

    let segments: Vec<PathSegment> = raw[marker + 3..]
        .iter()
        .map(|part| PathSegment::parse(&percent_decode_str(part).decode_utf8_lossy()))
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(ApiPath {
        version: raw[marker + 2][1..].to_string(),
        segments,
    })
}

fn is_version_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some('v' | 'V')) && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Platform-style singularization of a collection name.
pub fn singularize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.len() > 3 && lower.ends_with("ies") {
        format!("{}y", &name[..name.len() - 3])
    } else if lower.ends_with("ss") {
        name.to_string()
    } else if lower.ends_with('s') {
        name[..name.len() - 1].to_string()
    } else {
        name.to_string()
    }
}

fn crud_operation(method: &str, has_key: bool) -> Option<&'static str> {
    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" if has_key => Some("Retrieve"),
        "GET" | "HEAD" => Some("RetrieveMultiple"),
        "POST" => Some("Create"),
        "PATCH" | "PUT" => Some("Update"),
        "DELETE" => Some("Delete"),
        _ => None,
    }
}

fn operation_synonyms(segment: &str, qualified: Option<String>) -> Vec<String> {
    let mut synonyms = vec![segment.to_string()];
    synonyms.extend(qualified);
    synonyms.push(short_name(segment).to_string());
    synonyms
}

/// One way of turning an api path into a descriptor. Strategies are tried in
/// priority order; `None` hands over to the next one.
pub trait OperationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, method: &str, path: &ApiPath) -> Option<OperationDescriptor>;
}

pub struct SchemaStrategy {
    schema: Arc<OperationSchema>,
}

impl SchemaStrategy {
    pub fn new(schema: Arc<OperationSchema>) -> Self {
        Self { schema }
    }

    fn operation_descriptor(
        &self,
        segment: &PathSegment,
        entity: &str,
        collection: &str,
        record_key: Option<String>,
    ) -> OperationDescriptor {
        let qualified = self
            .schema
            .operation(&segment.name)
            .map(|operation| operation.qualified_name());
        OperationDescriptor::new(
            segment.name.clone(),
            operation_synonyms(&segment.name, qualified),
            entity,
            collection,
            record_key,
            ParseSource::Schema,
        )
    }
}

impl OperationStrategy for SchemaStrategy {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn parse(&self, method: &str, path: &ApiPath) -> Option<OperationDescriptor> {
        let first = path.segments.first()?;
        if first.name.eq_ignore_ascii_case("$batch") {
            return Some(OperationDescriptor::batch(ParseSource::Schema));
        }

        let Some(set) = self.schema.entity_set(&first.name) else {
            let operation = self.schema.operation(&first.name)?;
            if operation.bound {
                return None;
            }
            return Some(self.operation_descriptor(first, "", "", None));
        };

        let root_entity = set.entity_type.clone();
        let mut entity = set.entity_type.clone();
        let mut collection = set.name.clone();
        let mut record_key = first.key.clone();
        let mut has_key = first.key.is_some();

        for segment in &path.segments[1..] {
            match segment.name.as_str() {
                "$ref" => {
                    let operation = if method.eq_ignore_ascii_case("DELETE") {
                        "Disassociate"
                    } else {
                        "Associate"
                    };
                    return Some(OperationDescriptor::crud(
                        operation,
                        root_entity,
                        set.name.clone(),
                        first.key.clone(),
                        ParseSource::Schema,
                    ));
                }
                "$count" => {
                    return Some(OperationDescriptor::crud(
                        "RetrieveMultiple",
                        entity,
                        collection,
                        None,
                        ParseSource::Schema,
                    ));
                }
                "$value" => continue,
                _ => {}
            }

            let known_operation = self
                .schema
                .operation(&segment.name)
                .is_some_and(|operation| operation.bound);
            if segment.is_qualified() || known_operation {
                return Some(self.operation_descriptor(segment, &entity, &collection, record_key));
            }

            let entity_type = self.schema.entity_type(&entity)?;
            if let Some(navigation) = entity_type.navigation(&segment.name) {
                entity = navigation.target_type.clone();
                collection = self
                    .schema
                    .entity_set_for_type(&entity)
                    .unwrap_or_default()
                    .to_string();
                record_key = segment.key.clone();
                has_key = segment.key.is_some() || !navigation.collection;
                continue;
            }
            if entity_type.has_property(&segment.name) {
                let operation = if method.eq_ignore_ascii_case("GET") {
                    "Retrieve"
                } else {
                    "Update"
                };
                return Some(OperationDescriptor::crud(
                    operation,
                    entity,
                    collection,
                    record_key,
                    ParseSource::Schema,
                ));
            }
            return None;
        }

        let operation = crud_operation(method, has_key)?;
        Some(OperationDescriptor::crud(
            operation,
            entity,
            collection,
            record_key,
            ParseSource::Schema,
        ))
    }
}

/// Infers the operation from the http method and url shape alone.
pub struct HeuristicStrategy;

impl OperationStrategy for HeuristicStrategy {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn parse(&self, method: &str, path: &ApiPath) -> Option<OperationDescriptor> {
        let first = path.segments.first()?;
        if first.name.eq_ignore_ascii_case("$batch") {
            return Some(OperationDescriptor::batch(ParseSource::Heuristic));
        }

        if let Some((position, segment)) = path
            .segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.is_qualified())
        {
            let bound = position > 0;
            let (entity, collection, record_key) = if bound {
                (singularize(&first.name), first.name.clone(), first.key.clone())
            } else {
                (String::new(), String::new(), None)
            };
            return Some(OperationDescriptor::new(
                segment.name.clone(),
                operation_synonyms(&segment.name, None),
                entity,
                collection,
                record_key,
                ParseSource::Heuristic,
            ));
        }

        if first.is_system() {
            return Some(OperationDescriptor::unknown("", "", None));
        }

        let has_key = path.segments.iter().any(|segment| segment.key.is_some());
        let Some(operation) = crud_operation(method, has_key) else {
            return Some(OperationDescriptor::unknown(
                singularize(&first.name),
                first.name.clone(),
                first.key.clone(),
            ));
        };
        Some(OperationDescriptor::crud(
            operation,
            singularize(&first.name),
            first.name.clone(),
            first.key.clone(),
            ParseSource::Heuristic,
        ))
    }
}

/// Schema-driven parsing first, heuristic parsing second.
pub struct OperationParser {
    schema: Arc<SchemaCache>,
}

impl OperationParser {
    pub fn new(schema: Arc<SchemaCache>) -> Self {
        Self { schema }
    }

    pub fn parse(&self, method: &str, url: &str) -> Result<OperationDescriptor, ParseError> {
        let path = extract_api_path(url).ok_or(ParseError::NotAnApiPath)?;

        let mut strategies: Vec<Box<dyn OperationStrategy>> = Vec::with_capacity(2);
        if let Some(schema) = self.schema.current() {
            strategies.push(Box::new(SchemaStrategy::new(schema)));
        }
        strategies.push(Box::new(HeuristicStrategy));

        for strategy in &strategies {
            if let Some(descriptor) = strategy.parse(method, &path) {
                return Ok(descriptor);
            }
            debug!(
                "{} {} strategy could not parse {method} {url}",
                category_match(),
                strategy.name()
            );
        }

        Err(ParseError::NotAnApiPath)
    }
}
