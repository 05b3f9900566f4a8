use std::{collections::VecDeque, sync::RwLock};

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use runner_abi::ImageKind;
use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_REQUEST_LOG_CAPACITY: usize = 500;
pub const DEFAULT_API_VERSION: &str = "9.2";

const CORRELATION_HEADERS: [&str; 2] = ["x-ms-client-request-id", "x-client-request-id"];

/// Org base url plus the bearer token used for every platform call.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OrgCredentials {
    pub org_url: String,
    pub access_token: String,
}

impl OrgCredentials {
    pub fn new(org_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            org_url: org_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    /// `<org>/api/data/v<version>/<path>`
    pub fn api_url(&self, version: &str, path: &str) -> String {
        format!(
            "{}/api/data/v{}/{}",
            self.org_url.trim_end_matches('/'),
            version,
            path.trim_start_matches('/')
        )
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Credentials can be replaced at runtime; readers clone the current pair.
#[derive(Default)]
pub struct CredentialStore {
    current: RwLock<Option<OrgCredentials>>,
}

impl CredentialStore {
    pub fn new(initial: Option<OrgCredentials>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Option<OrgCredentials> {
        self.current
            .read()
            .expect("credential lock poisoned")
            .clone()
    }

    pub fn set(&self, credentials: OrgCredentials) {
        *self.current.write().expect("credential lock poisoned") = Some(credentials);
    }

    pub fn is_configured(&self) -> bool {
        self.current
            .read()
            .expect("credential lock poisoned")
            .is_some()
    }
}

/// Ordered multimap with case-insensitive keys. The first spelling of a key
/// is the one kept for display.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Multimap {
    entries: Vec<(String, Vec<String>)>,
}

impl Multimap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut map = Self::new();
        for (name, value) in headers {
            map.append(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        map
    }

    /// Parses a raw query string (without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        let mut map = Self::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            map.append(&key, value.into_owned());
        }
        map
    }

    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some((_, values)) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
        {
            values.push(value);
        } else {
            self.entries.push((key.to_string(), vec![value]));
        }
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Multimap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}

/// A resolved entity snapshot handed to one step.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ImagePayload {
    pub step_id: Uuid,
    pub kind: ImageKind,
    pub alias: String,
    pub entity: Value,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ResponseFields {
    pub status: Option<u16>,
    #[serde(serialize_with = "serialize_lossy")]
    pub body: Vec<u8>,
    pub headers: Multimap,
    pub trace: Vec<String>,
}

/// One intercepted call. Built at interception time and enriched in place as
/// matching and execution proceed.
#[derive(Clone, Debug, Serialize)]
pub struct CapturedRequest {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub sanitized_url: String,
    pub query: Multimap,
    pub headers: Multimap,
    #[serde(serialize_with = "serialize_lossy")]
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub captured_at: DateTime<Utc>,
    pub response: ResponseFields,
    pub images: Vec<ImagePayload>,
}

impl CapturedRequest {
    pub fn new(method: &str, url: &str, headers: Multimap, body: Vec<u8>) -> Self {
        let (sanitized_url, query) = split_query(url);
        let correlation_id = CORRELATION_HEADERS
            .iter()
            .find_map(|name| headers.get_first(name))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            id: Uuid::new_v4(),
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            sanitized_url: sanitized_url.to_string(),
            query: Multimap::from_query(query),
            headers,
            body,
            correlation_id,
            captured_at: Utc::now(),
            response: ResponseFields::default(),
            images: Vec::new(),
        }
    }

    /// Top-level JSON object of the request body, if it is one.
    pub fn body_object(&self) -> Option<serde_json::Map<String, Value>> {
        if self.body.is_empty() {
            return None;
        }
        match serde_json::from_slice::<Value>(&self.body) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Attaches an image, replacing any earlier payload for the same step,
    /// kind and alias.
    pub fn attach_image(&mut self, payload: ImagePayload) {
        if let Some(existing) = self.images.iter_mut().find(|existing| {
            existing.step_id == payload.step_id
                && existing.kind == payload.kind
                && existing.alias.eq_ignore_ascii_case(&payload.alias)
        }) {
            *existing = payload;
        } else {
            self.images.push(payload);
        }
    }

    pub fn images_for(&self, step_id: Uuid, kind: ImageKind) -> impl Iterator<Item = &ImagePayload> {
        self.images
            .iter()
            .filter(move |image| image.step_id == step_id && image.kind == kind)
    }

    pub fn append_trace<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.response.trace.extend(lines.into_iter().map(Into::into));
    }
}

fn split_query(url: &str) -> (&str, &str) {
    let without_fragment = url.split('#').next().unwrap_or(url);
    match without_fragment.split_once('?') {
        Some((base, query)) => (base, query),
        None => (without_fragment, ""),
    }
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestSummary {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub correlation_id: String,
    pub captured_at: DateTime<Utc>,
    pub status: Option<u16>,
    pub trace_lines: usize,
    pub images: usize,
}

/// Bounded ring buffer of captured requests. Writers go through the write
/// lock one at a time; readers take snapshots.
pub struct RequestLog {
    capacity: usize,
    entries: RwLock<VecDeque<CapturedRequest>>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, request: CapturedRequest) {
        let mut entries = self.entries.write().expect("request log lock poisoned");
        if let Some(existing) = entries.iter_mut().find(|entry| entry.id == request.id) {
            *existing = request;
            return;
        }
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(request);
    }

    pub fn update<F>(&self, id: Uuid, apply: F) -> bool
    where
        F: FnOnce(&mut CapturedRequest),
    {
        let mut entries = self.entries.write().expect("request log lock poisoned");
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                apply(entry);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<CapturedRequest> {
        let entries = self.entries.read().expect("request log lock poisoned");
        entries.iter().find(|entry| entry.id == id).cloned()
    }

    /// Newest first.
    pub fn summaries(&self) -> Vec<RequestSummary> {
        let entries = self.entries.read().expect("request log lock poisoned");
        entries
            .iter()
            .rev()
            .map(|entry| RequestSummary {
                id: entry.id,
                method: entry.method.clone(),
                url: entry.url.clone(),
                correlation_id: entry.correlation_id.clone(),
                captured_at: entry.captured_at,
                status: entry.response.status,
                trace_lines: entry.response.trace.len(),
                images: entry.images.len(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("request log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_LOG_CAPACITY)
    }
}
