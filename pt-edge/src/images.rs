use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared, join_all},
};
use reqwest::{StatusCode, header};
use runner_abi::ImageKind;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    catalog::{ImageRecord, StepInfo},
    logging::category_image,
    model::{CapturedRequest, CredentialStore, DEFAULT_API_VERSION, ImagePayload, ResponseFields},
    parser::{OperationDescriptor, extract_api_path},
    schema::SchemaCache,
};

const ODATA_ENTITY_ID: &str = "OData-EntityId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePhase {
    BeforeCall,
    AfterResponse,
}

impl ImagePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ImagePhase::BeforeCall => "before-call",
            ImagePhase::AfterResponse => "after-response",
        }
    }

    fn payload_kind(self) -> ImageKind {
        match self {
            ImagePhase::BeforeCall => ImageKind::Pre,
            ImagePhase::AfterResponse => ImageKind::Post,
        }
    }

    fn wants(self, image: &ImageRecord) -> bool {
        match self {
            ImagePhase::BeforeCall => image.kind.includes_pre(),
            ImagePhase::AfterResponse => image.kind.includes_post(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("no org credentials configured")]
    NoCredentials,
    #[error("invalid entity url: {0}")]
    InvalidUrl(String),
    #[error("entity request failed: {0}")]
    Transport(String),
    #[error("entity request returned status {0}")]
    Status(u16),
    #[error("entity response is not json: {0}")]
    Decode(String),
}

/// Reads one record from the platform. `Ok(None)` means the record does not
/// exist.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    async fn fetch_entity(
        &self,
        entity_set: &str,
        key: &str,
        select: &[String],
    ) -> Result<Option<Value>, FetchError>;
}

pub struct WebApiFetcher {
    client: reqwest::Client,
    credentials: Arc<CredentialStore>,
    api_version: String,
}

impl WebApiFetcher {
    pub fn new(credentials: Arc<CredentialStore>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
            api_version: DEFAULT_API_VERSION.to_string(),
        })
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }
}

#[async_trait]
impl EntityFetcher for WebApiFetcher {
    async fn fetch_entity(
        &self,
        entity_set: &str,
        key: &str,
        select: &[String],
    ) -> Result<Option<Value>, FetchError> {
        let credentials = self.credentials.get().ok_or(FetchError::NoCredentials)?;
        let mut url = url::Url::parse(&credentials.org_url)
            .map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(credentials.org_url.clone()))?
            .pop_if_empty()
            .extend([
                "api",
                "data",
                format!("v{}", self.api_version).as_str(),
                format!("{entity_set}({key})").as_str(),
            ]);
        if !select.is_empty() {
            url.query_pairs_mut().append_pair("$select", &select.join(","));
        }

        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, credentials.bearer())
            .header(header::ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Prefer", "odata.include-annotations=\"*\"")
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        let mut entity: Value = response
            .json()
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))?;
        if let Value::Object(map) = &mut entity {
            map.remove("@odata.context");
        }
        Ok(Some(entity))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FetchKey {
    entity_set: String,
    key: String,
    fields: Vec<String>,
}

type SharedFetch = Shared<BoxFuture<'static, Option<Value>>>;

/// Prepares the pre/post entity snapshots the matched steps declare.
pub struct ImageResolver {
    fetcher: Arc<dyn EntityFetcher>,
    schema: Arc<SchemaCache>,
}

impl ImageResolver {
    pub fn new(fetcher: Arc<dyn EntityFetcher>, schema: Arc<SchemaCache>) -> Self {
        Self { fetcher, schema }
    }

    /// Resolves every image of `steps` relevant to `phase`. Equal fetches are
    /// issued once; distinct fetches run concurrently. Failed fetches are
    /// logged and left out of the result.
    pub async fn resolve(
        &self,
        request: &CapturedRequest,
        descriptor: &OperationDescriptor,
        steps: &[StepInfo],
        phase: ImagePhase,
        response: Option<&ResponseFields>,
    ) -> Vec<ImagePayload> {
        let wanted: Vec<(&StepInfo, &ImageRecord)> = steps
            .iter()
            .flat_map(|step| step.images.iter().map(move |image| (step, image)))
            .filter(|(_, image)| phase.wants(image))
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }

        if phase == ImagePhase::AfterResponse && descriptor.is_delete() {
            debug!(
                "{} skipping post images for delete of {}",
                category_image(),
                descriptor.entity
            );
            return Vec::new();
        }

        let key = match phase {
            ImagePhase::BeforeCall => descriptor.record_key.clone(),
            ImagePhase::AfterResponse => response_record_key(descriptor, response),
        };
        let Some(key) = key else {
            debug!(
                "{} no record key for {} {}, skipping {} images",
                category_image(),
                descriptor.operation,
                request.sanitized_url,
                phase.as_str()
            );
            return Vec::new();
        };
        let Some(entity_set) = self.entity_set(descriptor) else {
            debug!(
                "{} no entity set for {}, skipping {} images",
                category_image(),
                descriptor.operation,
                phase.as_str()
            );
            return Vec::new();
        };

        let mut fetches: HashMap<FetchKey, SharedFetch> = HashMap::new();
        let mut pending = Vec::with_capacity(wanted.len());
        for (step, image) in wanted {
            let fetch_key = FetchKey {
                entity_set: entity_set.clone(),
                key: key.clone(),
                fields: self.image_fields(&descriptor.entity, &image.fields),
            };
            let fetch = fetches
                .entry(fetch_key.clone())
                .or_insert_with(|| self.spawn_fetch(fetch_key))
                .clone();
            pending.push(async move {
                fetch.await.map(|entity| ImagePayload {
                    step_id: step.step_id,
                    kind: phase.payload_kind(),
                    alias: image.alias.clone(),
                    entity,
                })
            });
        }
        debug!(
            "{} resolving {} {} images with {} fetches",
            category_image(),
            pending.len(),
            phase.as_str(),
            fetches.len()
        );

        join_all(pending).await.into_iter().flatten().collect()
    }

    fn spawn_fetch(&self, fetch_key: FetchKey) -> SharedFetch {
        let fetcher = Arc::clone(&self.fetcher);
        async move {
            match fetcher
                .fetch_entity(&fetch_key.entity_set, &fetch_key.key, &fetch_key.fields)
                .await
            {
                Ok(Some(entity)) => Some(entity),
                Ok(None) => {
                    warn!(
                        "{} {}({}) not found",
                        category_image(),
                        fetch_key.entity_set,
                        fetch_key.key
                    );
                    None
                }
                Err(err) => {
                    warn!(
                        "{} fetch of {}({}) failed: {err}",
                        category_image(),
                        fetch_key.entity_set,
                        fetch_key.key
                    );
                    None
                }
            }
        }
        .boxed()
        .shared()
    }

    fn entity_set(&self, descriptor: &OperationDescriptor) -> Option<String> {
        if !descriptor.collection.is_empty() {
            return Some(descriptor.collection.clone());
        }
        if descriptor.entity.is_empty() {
            return None;
        }
        if let Some(schema) = self.schema.current()
            && let Some(set) = schema.entity_set_for_type(&descriptor.entity)
        {
            return Some(set.to_string());
        }
        Some(pluralize(&descriptor.entity))
    }

    /// Declared image fields in the form the web api accepts for `$select`.
    fn image_fields(&self, entity: &str, declared: &[String]) -> Vec<String> {
        let schema = self.schema.current();
        let mut fields: Vec<String> = declared
            .iter()
            .map(|field| field.trim().to_ascii_lowercase())
            .filter(|field| !field.is_empty())
            .map(|field| {
                if field.contains('@') || (field.starts_with('_') && field.ends_with("_value")) {
                    return field;
                }
                match &schema {
                    Some(schema) if schema.is_lookup(entity, &field) => format!("_{field}_value"),
                    _ => field,
                }
            })
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// Record key of the entity a completed call touched.
pub fn response_record_key(
    descriptor: &OperationDescriptor,
    response: Option<&ResponseFields>,
) -> Option<String> {
    if let Some(response) = response {
        if let Some(key) = response
            .headers
            .get_first(ODATA_ENTITY_ID)
            .and_then(key_from_entity_url)
        {
            return Some(key);
        }
        if let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(&response.body) {
            let id_field = format!("{}id", descriptor.entity.to_ascii_lowercase());
            if !descriptor.entity.is_empty()
                && let Some(Value::String(id)) = body.get(&id_field)
                && !id.is_empty()
            {
                return Some(id.clone());
            }
            if let Some(key) = body
                .get("@odata.id")
                .and_then(Value::as_str)
                .and_then(key_from_entity_url)
            {
                return Some(key);
            }
        }
    }
    descriptor.record_key.clone()
}

/// `https://org/api/data/v9.2/accounts(<key>)` -> `<key>`
fn key_from_entity_url(url: &str) -> Option<String> {
    let path = extract_api_path(url)?;
    path.segments.last()?.key.clone()
}

fn pluralize(entity: &str) -> String {
    let lower = entity.to_ascii_lowercase();
    if lower.ends_with('y') && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else if lower.ends_with('s') || lower.ends_with('x') {
        format!("{lower}es")
    } else {
        format!("{lower}s")
    }
}
