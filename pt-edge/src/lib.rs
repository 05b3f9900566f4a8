mod auto_debug;
mod catalog;
mod catalog_client;
mod config;
mod dedup;
mod images;
mod logging;
mod matcher;
mod model;
mod orchestrator;
mod parser;
mod pipeline;
mod runtime;
mod schema;

pub use runner_abi::{
    ABI_VERSION, ExecutionMode, ExecutionStage, HttpRequestSnapshot, ImageKind,
    InvocationRequest, InvocationResponse,
};

pub use auto_debug::{
    AutoDebugError, AutoDebugSession, AutoDebugStatus, HookLedger, SharedAutoDebug,
    StartAutoDebugRequest, auto_debug_status, new_auto_debug_store, session_for_request,
    start_auto_debug, stop_auto_debug,
};
pub use catalog::{
    AssemblyRecord, AssemblySelection, CatalogError, CatalogIndex, CatalogSnapshot, CatalogStore,
    CatalogSummary, ImageRecord, StepInfo, StepRecord, TypeRecord, parse_field_list,
};
pub use catalog_client::{CatalogClient, CatalogFetchError};
pub use config::{ConfigError, EdgeConfig};
pub use dedup::{DedupError, DedupStats, InFlightDedup, request_identity_key};
pub use images::{
    EntityFetcher, FetchError, ImagePhase, ImageResolver, WebApiFetcher, response_record_key,
};
pub use logging::init as init_logging;
pub use matcher::{MatchResult, match_steps, sort_steps};
pub use model::{
    CapturedRequest, CredentialStore, ImagePayload, Multimap, OrgCredentials, RequestLog,
    RequestSummary, ResponseFields,
};
pub use orchestrator::{
    AssemblyLocator, BufferSink, DirectoryLocator, HandlerRunner, HttpRunner, Orchestrator,
    RunnerError, StepOutcome, StepRun, StepRunReport, TraceSink, TracingSink,
};
pub use parser::{OperationDescriptor, OperationParser, ParseError, ParseSource, singularize};
pub use pipeline::{InterceptDecision, Interceptor, RequestMatches};
pub use runtime::{
    CatalogView, EdgeComponents, ExchangeOutcome, HealthStatus, REQUEST_ID_HEADER,
    SelectionRequest, SharedState, TelemetrySnapshot, build_admin_app, build_data_app,
    refresh_catalog,
};
pub use schema::{SchemaCache, SchemaError};
