use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
};

use axum::http::{HeaderName, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{images::ImagePhase, logging::category_debug, model::Multimap};

pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

pub struct AutoDebugStore {
    session: RwLock<Option<Arc<AutoDebugSession>>>,
}

pub type SharedAutoDebug = Arc<AutoDebugStore>;

#[derive(Clone, Debug, Deserialize)]
pub struct StartAutoDebugRequest {
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub header_value: Option<String>,
    #[serde(default = "default_forward_upstream")]
    pub forward_upstream: bool,
}

impl Default for StartAutoDebugRequest {
    fn default() -> Self {
        Self {
            header_name: None,
            header_value: None,
            forward_upstream: default_forward_upstream(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutoDebugStatus {
    pub active: bool,
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    pub forward_upstream: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum AutoDebugError {
    #[error("auto-debug session already active")]
    AlreadyActive,
    #[error("invalid filter header name")]
    InvalidHeaderName,
    #[error("filter header value cannot be empty")]
    EmptyHeaderValue,
    #[error("header_value requires header_name")]
    ValueWithoutName,
}

impl AutoDebugError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AutoDebugError::AlreadyActive => StatusCode::CONFLICT,
            AutoDebugError::InvalidHeaderName
            | AutoDebugError::EmptyHeaderValue
            | AutoDebugError::ValueWithoutName => StatusCode::BAD_REQUEST,
        }
    }
}

pub struct AutoDebugSession {
    filter: Option<(HeaderName, String)>,
    forward_upstream: bool,
    started_at: DateTime<Utc>,
}

impl AutoDebugSession {
    pub fn forward_upstream(&self) -> bool {
        self.forward_upstream
    }

    fn matches(&self, headers: &Multimap) -> bool {
        match &self.filter {
            Some((name, value)) => headers
                .get_all(name.as_str())
                .iter()
                .any(|candidate| candidate == value),
            None => true,
        }
    }
}

pub fn new_auto_debug_store() -> SharedAutoDebug {
    Arc::new(AutoDebugStore {
        session: RwLock::new(None),
    })
}

pub fn start_auto_debug(
    store: &SharedAutoDebug,
    request: StartAutoDebugRequest,
) -> Result<AutoDebugStatus, AutoDebugError> {
    let filter = match (request.header_name, request.header_value) {
        (None, None) => None,
        (None, Some(_)) => {
            warn!(
                "{} rejected start request: header value without name",
                category_debug()
            );
            return Err(AutoDebugError::ValueWithoutName);
        }
        (Some(name), value) => {
            let value = value.unwrap_or_default();
            if value.trim().is_empty() {
                warn!(
                    "{} rejected start request: empty header value",
                    category_debug()
                );
                return Err(AutoDebugError::EmptyHeaderValue);
            }
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                warn!(
                    "{} rejected start request: invalid header name",
                    category_debug()
                );
                AutoDebugError::InvalidHeaderName
            })?;
            Some((name, value))
        }
    };

    let mut guard = store.session.write().expect("auto-debug lock poisoned");
    if guard.is_some() {
        warn!(
            "{} start requested while session already active",
            category_debug()
        );
        return Err(AutoDebugError::AlreadyActive);
    }

    let session = Arc::new(AutoDebugSession {
        filter,
        forward_upstream: request.forward_upstream,
        started_at: Utc::now(),
    });
    let status = AutoDebugStatus::from_session(&session);
    *guard = Some(session);
    info!(
        "{} started auto-debug header={} value={} forward_upstream={}",
        category_debug(),
        status.header_name.as_deref().unwrap_or("*"),
        status.header_value.as_deref().unwrap_or("*"),
        request.forward_upstream
    );
    Ok(status)
}

pub fn stop_auto_debug(store: &SharedAutoDebug) -> bool {
    let mut guard = store.session.write().expect("auto-debug lock poisoned");
    let stopped = guard.take().is_some();
    if stopped {
        info!("{} auto-debug stopped", category_debug());
    } else {
        info!("{} stop requested with no active session", category_debug());
    }
    stopped
}

pub fn auto_debug_status(store: &SharedAutoDebug) -> AutoDebugStatus {
    let guard = store.session.read().expect("auto-debug lock poisoned");
    if let Some(session) = guard.as_ref() {
        AutoDebugStatus::from_session(session)
    } else {
        AutoDebugStatus::inactive()
    }
}

/// The active session, if there is one and `headers` pass its filter.
pub fn session_for_request(
    store: &SharedAutoDebug,
    headers: &Multimap,
) -> Option<Arc<AutoDebugSession>> {
    let session = {
        let guard = store.session.read().expect("auto-debug lock poisoned");
        guard.clone()
    }?;
    session.matches(headers).then_some(session)
}

fn default_forward_upstream() -> bool {
    true
}

impl AutoDebugStatus {
    fn inactive() -> Self {
        Self {
            active: false,
            header_name: None,
            header_value: None,
            forward_upstream: None,
            started_at: None,
        }
    }

    fn from_session(session: &AutoDebugSession) -> Self {
        Self {
            active: true,
            header_name: session
                .filter
                .as_ref()
                .map(|(name, _)| name.as_str().to_string()),
            header_value: session.filter.as_ref().map(|(_, value)| value.clone()),
            forward_upstream: Some(session.forward_upstream),
            started_at: Some(session.started_at),
        }
    }
}

#[derive(Default)]
struct PhaseSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

/// Remembers which requests already went through each hook. Oldest entries
/// are forgotten past `capacity`.
pub struct HookLedger {
    capacity: usize,
    before_call: Mutex<PhaseSet>,
    after_response: Mutex<PhaseSet>,
}

impl HookLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            before_call: Mutex::new(PhaseSet::default()),
            after_response: Mutex::new(PhaseSet::default()),
        }
    }

    /// True exactly once per (phase, correlation id).
    pub fn try_claim(&self, phase: ImagePhase, correlation_id: &str) -> bool {
        let set = match phase {
            ImagePhase::BeforeCall => &self.before_call,
            ImagePhase::AfterResponse => &self.after_response,
        };
        let mut set = set.lock().expect("hook ledger lock poisoned");
        if !set.seen.insert(correlation_id.to_string()) {
            return false;
        }
        set.order.push_back(correlation_id.to_string());
        while set.order.len() > self.capacity {
            if let Some(oldest) = set.order.pop_front() {
                set.seen.remove(&oldest);
            }
        }
        true
    }
}

impl Default for HookLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}
