use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::{Path, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, HOST},
    },
    middleware::{self, Next},
    response::IntoResponse,
    routing::{any, get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auto_debug::{
        AutoDebugStatus, SharedAutoDebug, StartAutoDebugRequest, auto_debug_status,
        new_auto_debug_store, start_auto_debug, stop_auto_debug,
    },
    catalog::{AssemblySelection, CatalogSnapshot, CatalogStore, CatalogSummary, StepInfo},
    catalog_client::{CatalogClient, CatalogFetchError},
    config::EdgeConfig,
    dedup::{DedupStats, InFlightDedup, request_identity_key},
    images::{EntityFetcher, ImageResolver, WebApiFetcher},
    logging::{
        category_access, category_catalog, category_debug, category_proxy, method_label,
        status_label,
    },
    model::{CapturedRequest, CredentialStore, Multimap, OrgCredentials, RequestLog},
    orchestrator::{
        AssemblyLocator, DirectoryLocator, HandlerRunner, HttpRunner, Orchestrator, TraceSink,
        TracingSink,
    },
    parser::OperationParser,
    pipeline::Interceptor,
    schema::SchemaCache,
};

pub const REQUEST_ID_HEADER: &str = "x-pt-request-id";

/// Final answer of one intercepted request, shared by every caller that sent
/// the same request while it ran or within the recent window.
#[derive(Clone, Debug)]
pub struct ExchangeOutcome {
    /// Captured request that produced this answer.
    pub request_id: Uuid,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ExchangeOutcome {
    fn local(request_id: Uuid, status: StatusCode, text: &str) -> Self {
        let mut headers = HeaderMap::new();
        if !text.is_empty() {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
        }
        Self {
            request_id,
            status,
            headers,
            body: Bytes::from(text.to_string()),
        }
    }
}

/// Pluggable collaborators of the interceptor.
pub struct EdgeComponents {
    pub runner: Arc<dyn HandlerRunner>,
    pub fetcher: Arc<dyn EntityFetcher>,
    pub locator: Arc<dyn AssemblyLocator>,
    pub sink: Arc<dyn TraceSink>,
}

impl EdgeComponents {
    pub fn from_config(
        config: &EdgeConfig,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            runner: Arc::new(HttpRunner::new(&config.runner_url, config.upstream_timeout())?),
            fetcher: Arc::new(WebApiFetcher::new(credentials, config.upstream_timeout())?),
            locator: Arc::new(DirectoryLocator::new(config.assembly_dirs.clone())),
            sink: Arc::new(TracingSink),
        })
    }
}

#[derive(Clone)]
pub struct SharedState {
    pub client: reqwest::Client,
    pub credentials: Arc<CredentialStore>,
    pub catalog: Arc<CatalogStore>,
    pub catalog_client: Arc<CatalogClient>,
    pub requests: Arc<RequestLog>,
    pub auto_debug: SharedAutoDebug,
    pub interceptor: Arc<Interceptor>,
    dedup: Arc<InFlightDedup<Arc<ExchangeOutcome>>>,
    runtime_metrics: Arc<RuntimeMetrics>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub credentials_configured: bool,
    pub catalog_steps: usize,
    pub auto_debug_active: bool,
    pub uptime_seconds: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TelemetrySnapshot {
    pub uptime_seconds: u64,
    pub credentials_configured: bool,
    pub auto_debug_active: bool,
    pub catalog_steps: usize,
    pub captured_requests: usize,
    pub data_requests_total: u64,
    pub upstream_failures_total: u64,
    pub local_responses_total: u64,
    pub steps_invoked_total: u64,
    pub catalog_refresh_success_total: u64,
    pub catalog_refresh_failure_total: u64,
    pub dedup: DedupStats,
}

#[derive(Clone, Debug, Serialize)]
pub struct CatalogView {
    pub summary: CatalogSummary,
    pub steps: Vec<StepInfo>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SelectionRequest {
    /// `None` selects every assembly.
    #[serde(default)]
    pub assemblies: Option<Vec<String>>,
}

impl SharedState {
    pub fn new(config: &EdgeConfig) -> Result<Self, reqwest::Error> {
        let credentials = Arc::new(CredentialStore::new(config.credentials()));
        let components = EdgeComponents::from_config(config, Arc::clone(&credentials))?;
        Self::with_components(config, credentials, components)
    }

    pub fn with_components(
        config: &EdgeConfig,
        credentials: Arc<CredentialStore>,
        components: EdgeComponents,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout())
            .build()?;
        let schema = Arc::new(SchemaCache::new(config.schema_path.clone()));
        let catalog = Arc::new(CatalogStore::new());
        let auto_debug = new_auto_debug_store();
        let interceptor = Interceptor::new(
            OperationParser::new(Arc::clone(&schema)),
            Arc::clone(&catalog),
            ImageResolver::new(components.fetcher, schema),
            Orchestrator::new(
                components.runner,
                components.locator,
                Arc::clone(&credentials),
                components.sink,
            ),
            Arc::clone(&auto_debug),
        );
        Ok(Self {
            client,
            catalog_client: Arc::new(CatalogClient::new(
                Arc::clone(&credentials),
                config.upstream_timeout(),
            )?),
            credentials,
            catalog,
            requests: Arc::new(RequestLog::new(config.request_log_capacity)),
            auto_debug,
            interceptor: Arc::new(interceptor),
            dedup: Arc::new(InFlightDedup::new(config.dedup_window())),
            runtime_metrics: Arc::new(RuntimeMetrics::default()),
        })
    }

    pub fn record_data_plane_request(&self) {
        self.runtime_metrics
            .data_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_plane_status(&self, status: u16) {
        let metrics = &self.runtime_metrics;
        match status {
            200..=299 => {
                metrics.status_2xx_total.fetch_add(1, Ordering::Relaxed);
            }
            300..=399 => {
                metrics.status_3xx_total.fetch_add(1, Ordering::Relaxed);
            }
            400..=499 => {
                metrics.status_4xx_total.fetch_add(1, Ordering::Relaxed);
            }
            500..=599 => {
                metrics.status_5xx_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_upstream_failure(&self) {
        self.runtime_metrics
            .upstream_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_response(&self) {
        self.runtime_metrics
            .local_responses_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steps_invoked(&self, count: usize) {
        self.runtime_metrics
            .steps_invoked_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_catalog_refresh(&self, success: bool) {
        let counter = if success {
            &self.runtime_metrics.catalog_refresh_success_total
        } else {
            &self.runtime_metrics.catalog_refresh_failure_total
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops answers held for replay. Called on every admin change that
    /// alters how a request is answered.
    pub fn forget_recent_exchanges(&self) {
        self.dedup.forget_recent();
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            credentials_configured: self.credentials.is_configured(),
            catalog_steps: self.catalog.current().steps().len(),
            auto_debug_active: auto_debug_status(&self.auto_debug).active,
            uptime_seconds: self.runtime_metrics.started_at.elapsed().as_secs(),
        }
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let metrics = &self.runtime_metrics;
        TelemetrySnapshot {
            uptime_seconds: metrics.started_at.elapsed().as_secs(),
            credentials_configured: self.credentials.is_configured(),
            auto_debug_active: auto_debug_status(&self.auto_debug).active,
            catalog_steps: self.catalog.current().steps().len(),
            captured_requests: self.requests.len(),
            data_requests_total: metrics.data_requests_total.load(Ordering::Relaxed),
            upstream_failures_total: metrics.upstream_failures_total.load(Ordering::Relaxed),
            local_responses_total: metrics.local_responses_total.load(Ordering::Relaxed),
            steps_invoked_total: metrics.steps_invoked_total.load(Ordering::Relaxed),
            catalog_refresh_success_total: metrics
                .catalog_refresh_success_total
                .load(Ordering::Relaxed),
            catalog_refresh_failure_total: metrics
                .catalog_refresh_failure_total
                .load(Ordering::Relaxed),
            dedup: self.dedup.stats(),
        }
    }

    pub fn metrics_text(&self) -> String {
        let telemetry = self.telemetry_snapshot();
        let metrics = &self.runtime_metrics;
        format!(
            concat!(
                "pt_edge_uptime_seconds {}\n",
                "pt_edge_auto_debug_active {}\n",
                "pt_edge_catalog_steps {}\n",
                "pt_edge_captured_requests {}\n",
                "pt_edge_data_requests_total {}\n",
                "pt_edge_data_status_total{{class=\"2xx\"}} {}\n",
                "pt_edge_data_status_total{{class=\"3xx\"}} {}\n",
                "pt_edge_data_status_total{{class=\"4xx\"}} {}\n",
                "pt_edge_data_status_total{{class=\"5xx\"}} {}\n",
                "pt_edge_upstream_failures_total {}\n",
                "pt_edge_local_responses_total {}\n",
                "pt_edge_steps_invoked_total {}\n",
                "pt_edge_catalog_refresh_success_total {}\n",
                "pt_edge_catalog_refresh_failure_total {}\n",
                "pt_edge_dedup_produced_total {}\n",
                "pt_edge_dedup_joined_total {}\n",
                "pt_edge_dedup_recent_hits_total {}\n"
            ),
            telemetry.uptime_seconds,
            u8::from(telemetry.auto_debug_active),
            telemetry.catalog_steps,
            telemetry.captured_requests,
            telemetry.data_requests_total,
            metrics.status_2xx_total.load(Ordering::Relaxed),
            metrics.status_3xx_total.load(Ordering::Relaxed),
            metrics.status_4xx_total.load(Ordering::Relaxed),
            metrics.status_5xx_total.load(Ordering::Relaxed),
            telemetry.upstream_failures_total,
            telemetry.local_responses_total,
            telemetry.steps_invoked_total,
            telemetry.catalog_refresh_success_total,
            telemetry.catalog_refresh_failure_total,
            telemetry.dedup.produced_total,
            telemetry.dedup.joined_total,
            telemetry.dedup.recent_hits_total,
        )
    }
}

struct RuntimeMetrics {
    started_at: Instant,
    data_requests_total: AtomicU64,
    status_2xx_total: AtomicU64,
    status_3xx_total: AtomicU64,
    status_4xx_total: AtomicU64,
    status_5xx_total: AtomicU64,
    upstream_failures_total: AtomicU64,
    local_responses_total: AtomicU64,
    steps_invoked_total: AtomicU64,
    catalog_refresh_success_total: AtomicU64,
    catalog_refresh_failure_total: AtomicU64,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            data_requests_total: AtomicU64::new(0),
            status_2xx_total: AtomicU64::new(0),
            status_3xx_total: AtomicU64::new(0),
            status_4xx_total: AtomicU64::new(0),
            status_5xx_total: AtomicU64::new(0),
            upstream_failures_total: AtomicU64::new(0),
            local_responses_total: AtomicU64::new(0),
            steps_invoked_total: AtomicU64::new(0),
            catalog_refresh_success_total: AtomicU64::new(0),
            catalog_refresh_failure_total: AtomicU64::new(0),
        }
    }
}

pub fn build_data_app(state: SharedState) -> Router {
    Router::new()
        .fallback(any(data_plane_handler))
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

pub fn build_admin_app(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/telemetry", get(telemetry_handler))
        .route("/catalog", get(catalog_handler).put(install_catalog_handler))
        .route("/catalog/refresh", post(refresh_catalog_handler))
        .route("/catalog/selection", put(selection_handler))
        .route(
            "/auto-debug",
            put(start_auto_debug_handler)
                .delete(stop_auto_debug_handler)
                .get(auto_debug_status_handler),
        )
        .route("/credentials", put(credentials_handler))
        .route("/requests", get(list_requests_handler))
        .route("/requests/{id}", get(request_handler))
        .route("/requests/{id}/matches", get(request_matches_handler))
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

async fn data_plane_handler(State(state): State<SharedState>, request: Request) -> Response<Body> {
    state.record_data_plane_request();
    let response = handle_data_plane(&state, request).await;
    state.record_data_plane_status(response.status().as_u16());
    response
}

async fn handle_data_plane(state: &SharedState, request: Request) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("{} failed to read request body: {err}", category_proxy());
            return text_response(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/")
        .to_string();

    let captured = CapturedRequest::new(
        parts.method.as_str(),
        &path_and_query,
        Multimap::from_header_map(&parts.headers),
        body_bytes.to_vec(),
    );
    let request_id = captured.id;
    state.requests.record(captured.clone());

    // Identical requests share one pass through hooks and upstream.
    let key = request_identity_key(parts.method.as_str(), &path_and_query, &body_bytes);
    let exchange = Exchange {
        state: state.clone(),
        captured,
        method: parts.method,
        headers: parts.headers,
        body: body_bytes,
    };
    let outcome = state
        .dedup
        .execute_once(&key, move || exchange.run())
        .await;

    let mut response = match outcome {
        Ok(outcome) => {
            if outcome.request_id != request_id {
                state.requests.update(request_id, |entry| {
                    entry.response.status = Some(outcome.status.as_u16());
                    entry.response.headers = Multimap::from_header_map(&outcome.headers);
                    entry.response.body = outcome.body.to_vec();
                    entry.append_trace([format!(
                        "shared result of request {}",
                        outcome.request_id
                    )]);
                });
            }
            exchange_response(&outcome)
        }
        Err(err) => {
            warn!("{} {err}", category_proxy());
            state.requests.update(request_id, |entry| {
                entry.response.status = Some(StatusCode::BAD_GATEWAY.as_u16());
                entry.response.body = err.to_string().into_bytes();
            });
            text_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// One request on its way through pre-call hooks, the upstream call (or the
/// local answer) and post-operation hooks.
struct Exchange {
    state: SharedState,
    captured: CapturedRequest,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
}

impl Exchange {
    async fn run(self) -> Arc<ExchangeOutcome> {
        let Self {
            state,
            mut captured,
            method,
            headers,
            body,
        } = self;

        let decision = state.interceptor.before_proxy(&mut captured).await;
        state.record_steps_invoked(decision.steps_run);

        let mut failure = None;
        let outcome = if !decision.forward_upstream {
            info!(
                "{} {} {} handled locally, upstream skipped",
                category_proxy(),
                captured.method,
                captured.sanitized_url
            );
            state.record_local_response();
            ExchangeOutcome::local(captured.id, StatusCode::NO_CONTENT, "")
        } else if let Some(credentials) = state.credentials.get() {
            match proxy_to_upstream(
                &state.client,
                &credentials,
                captured.id,
                method,
                &captured.url,
                &headers,
                body,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(message) => {
                    state.record_upstream_failure();
                    warn!(
                        "{} {} {} upstream request failed: {message}",
                        category_proxy(),
                        captured.method,
                        captured.sanitized_url
                    );
                    failure = Some(message);
                    ExchangeOutcome::local(captured.id, StatusCode::BAD_GATEWAY, "bad gateway")
                }
            }
        } else {
            warn!("{} no org credentials configured; returning 503", category_proxy());
            ExchangeOutcome::local(
                captured.id,
                StatusCode::SERVICE_UNAVAILABLE,
                "org credentials not configured",
            )
        };

        captured.response.status = Some(outcome.status.as_u16());
        captured.response.headers = Multimap::from_header_map(&outcome.headers);
        captured.response.body = match failure {
            Some(message) => message.into_bytes(),
            None => outcome.body.to_vec(),
        };

        let post_steps = state
            .interceptor
            .after_response(&mut captured, &decision)
            .await;
        state.record_steps_invoked(post_steps);

        state.requests.record(captured);
        Arc::new(outcome)
    }
}

async fn proxy_to_upstream(
    client: &reqwest::Client,
    credentials: &OrgCredentials,
    request_id: Uuid,
    method: Method,
    path_and_query: &str,
    request_headers: &HeaderMap,
    request_body: Bytes,
) -> Result<ExchangeOutcome, String> {
    let upstream_url = format!("{}{}", credentials.org_url, path_and_query);
    let mut outbound = client.request(method, upstream_url).body(request_body);
    for (name, value) in request_headers {
        if name != HOST && name != AUTHORIZATION && !is_hop_by_hop(name) {
            outbound = outbound.header(name, value);
        }
    }
    outbound = outbound.header(AUTHORIZATION, credentials.bearer());

    let upstream_response = outbound.send().await.map_err(|err| err.to_string())?;
    let status = upstream_response.status();
    let headers = upstream_response.headers().clone();
    let body = upstream_response
        .bytes()
        .await
        .map_err(|err| format!("failed reading upstream response body: {err}"))?;
    Ok(ExchangeOutcome {
        request_id,
        status,
        headers,
        body,
    })
}

fn exchange_response(outcome: &ExchangeOutcome) -> Response<Body> {
    let mut response = Response::new(Body::from(outcome.body.clone()));
    *response.status_mut() = outcome.status;
    for (name, value) in &outcome.headers {
        if !is_hop_by_hop(name) {
            response.headers_mut().append(name, value.clone());
        }
    }
    response
}

async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health_status()))
}

async fn telemetry_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.telemetry_snapshot()))
}

async fn metrics_handler(State(state): State<SharedState>) -> Response<Body> {
    let metrics = state.metrics_text();
    let mut response = text_response(StatusCode::OK, &metrics);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn catalog_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let index = state.catalog.current();
    let view = CatalogView {
        summary: index.summary(),
        steps: index.steps().to_vec(),
    };
    (StatusCode::OK, Json(view))
}

async fn install_catalog_handler(
    State(state): State<SharedState>,
    Json(snapshot): Json<CatalogSnapshot>,
) -> Response<Body> {
    match state.catalog.install(snapshot) {
        Ok(summary) => {
            state.forget_recent_exchanges();
            (StatusCode::OK, Json(summary)).into_response()
        }
        Err(err) => {
            warn!("{} rejected catalog: {err}", category_catalog());
            text_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
    }
}

async fn refresh_catalog_handler(State(state): State<SharedState>) -> Response<Body> {
    match refresh_catalog(&state).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => {
            let status = match err {
                CatalogFetchError::NoCredentials => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            text_response(status, &err.to_string())
        }
    }
}

/// Fetches the catalog from the org and installs it.
pub async fn refresh_catalog(state: &SharedState) -> Result<CatalogSummary, CatalogFetchError> {
    let snapshot = match state.catalog_client.fetch_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            state.record_catalog_refresh(false);
            warn!("{} catalog refresh failed: {err}", category_catalog());
            return Err(err);
        }
    };
    match state.catalog.install(snapshot) {
        Ok(summary) => {
            state.record_catalog_refresh(true);
            state.forget_recent_exchanges();
            Ok(summary)
        }
        Err(err) => {
            state.record_catalog_refresh(false);
            warn!("{} fetched catalog is invalid: {err}", category_catalog());
            Err(CatalogFetchError::Decode(err.to_string()))
        }
    }
}

async fn selection_handler(
    State(state): State<SharedState>,
    Json(request): Json<SelectionRequest>,
) -> impl IntoResponse {
    let selection = match request.assemblies {
        Some(names) => AssemblySelection::only(names),
        None => AssemblySelection::All,
    };
    let summary = state.catalog.select(selection);
    state.forget_recent_exchanges();
    (StatusCode::OK, Json(summary))
}

async fn start_auto_debug_handler(
    State(state): State<SharedState>,
    Json(request): Json<StartAutoDebugRequest>,
) -> impl IntoResponse {
    match start_auto_debug(&state.auto_debug, request) {
        Ok(status) => {
            state.forget_recent_exchanges();
            info!("{} auto-debug started via admin endpoint", category_debug());
            (StatusCode::CREATED, Json(status)).into_response()
        }
        Err(err) => {
            warn!("{} failed to start auto-debug: {err}", category_debug());
            (err.status_code(), err.to_string()).into_response()
        }
    }
}

async fn stop_auto_debug_handler(State(state): State<SharedState>) -> impl IntoResponse {
    stop_auto_debug(&state.auto_debug);
    state.forget_recent_exchanges();
    StatusCode::NO_CONTENT
}

async fn auto_debug_status_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let status: AutoDebugStatus = auto_debug_status(&state.auto_debug);
    (StatusCode::OK, Json(status))
}

async fn credentials_handler(
    State(state): State<SharedState>,
    Json(credentials): Json<OrgCredentials>,
) -> Response<Body> {
    if url::Url::parse(&credentials.org_url).is_err() {
        return text_response(StatusCode::BAD_REQUEST, "invalid org_url");
    }
    if credentials.access_token.trim().is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "access_token cannot be empty");
    }
    let credentials = OrgCredentials::new(credentials.org_url, credentials.access_token);
    info!("{} credentials updated org={}", category_proxy(), credentials.org_url);
    state.credentials.set(credentials);
    state.forget_recent_exchanges();
    no_content_response()
}

async fn list_requests_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.requests.summaries()))
}

async fn request_handler(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Response<Body> {
    match state.requests.get(id) {
        Some(request) => (StatusCode::OK, Json(request)).into_response(),
        None => text_response(StatusCode::NOT_FOUND, "request not found"),
    }
}

async fn request_matches_handler(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Response<Body> {
    let Some(request) = state.requests.get(id) else {
        return text_response(StatusCode::NOT_FOUND, "request not found");
    };
    match state.interceptor.explain(&request) {
        Ok(matches) => (StatusCode::OK, Json(matches)).into_response(),
        Err(err) => text_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()),
    }
}

fn no_content_response() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

fn text_response(status: StatusCode, text: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(text.to_string()));
    *response.status_mut() = status;
    response
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str().to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

async fn access_log_middleware(request: Request, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis();
    let status = response.status();

    info!(
        "{} {} {} {} {}ms",
        category_access(),
        method_label(method.as_str()),
        status_label(status.as_u16()),
        uri,
        elapsed_ms
    );

    response
}
