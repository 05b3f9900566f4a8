use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use runner_abi::{
    ABI_VERSION, ExecutionStage, HttpRequestSnapshot, ImageKind, InvocationRequest,
    InvocationResponse,
};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::StepInfo,
    logging::category_step,
    matcher::sort_steps,
    model::{CapturedRequest, CredentialStore},
    parser::OperationDescriptor,
};

/// Receives trace lines as steps run.
pub trait TraceSink: Send + Sync {
    fn emit(&self, correlation_id: &str, line: &str);
}

/// Forwards trace lines to the process log.
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, correlation_id: &str, line: &str) {
        info!("{} [{correlation_id}] {line}", category_step());
    }
}

/// Collects trace lines in memory.
#[derive(Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("trace buffer lock poisoned").clone()
    }
}

impl TraceSink for BufferSink {
    fn emit(&self, _correlation_id: &str, line: &str) {
        self.lines
            .lock()
            .expect("trace buffer lock poisoned")
            .push(line.to_string());
    }
}

/// Maps an assembly name to a locally built binary.
pub trait AssemblyLocator: Send + Sync {
    fn locate(&self, assembly_name: &str) -> Option<PathBuf>;
}

/// Searches a list of build output directories, in order.
#[derive(Clone, Debug, Default)]
pub struct DirectoryLocator {
    directories: Vec<PathBuf>,
}

impl DirectoryLocator {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

impl AssemblyLocator for DirectoryLocator {
    fn locate(&self, assembly_name: &str) -> Option<PathBuf> {
        let name = assembly_name.trim();
        if name.is_empty() {
            return None;
        }
        self.directories.iter().find_map(|directory| {
            [format!("{name}.dll"), name.to_string()]
                .into_iter()
                .map(|file| directory.join(file))
                .find(|candidate| candidate.is_file())
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner request failed: {0}")]
    Transport(String),
    #[error("runner returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("runner response could not be decoded: {0}")]
    Decode(String),
}

/// Executes one handler out of process.
#[async_trait]
pub trait HandlerRunner: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse, RunnerError>;
}

/// Posts invocations as JSON to `<runner_url>/invoke`.
pub struct HttpRunner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRunner {
    pub fn new(runner_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/invoke", runner_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl HandlerRunner for HttpRunner {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse, RunnerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| RunnerError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<InvocationResponse>()
            .await
            .map_err(|err| RunnerError::Decode(err.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed { trace_lines: usize },
    HandlerUnavailable { assembly: String },
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct StepRun {
    pub step_id: Uuid,
    pub label: String,
    pub stage: ExecutionStage,
    pub outcome: StepOutcome,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StepRunReport {
    pub trace: Vec<String>,
    pub steps: Vec<StepRun>,
}

impl StepRunReport {
    pub fn completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|run| matches!(run.outcome, StepOutcome::Completed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|run| matches!(run.outcome, StepOutcome::Failed { .. }))
            .count()
    }
}

/// Drives matched steps one after another through a [`HandlerRunner`].
pub struct Orchestrator {
    runner: Arc<dyn HandlerRunner>,
    locator: Arc<dyn AssemblyLocator>,
    credentials: Arc<CredentialStore>,
    sink: Arc<dyn TraceSink>,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn HandlerRunner>,
        locator: Arc<dyn AssemblyLocator>,
        credentials: Arc<CredentialStore>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            runner,
            locator,
            credentials,
            sink,
        }
    }

    pub async fn run_matched_steps(
        &self,
        request: &CapturedRequest,
        descriptor: &OperationDescriptor,
        steps: &[StepInfo],
    ) -> StepRunReport {
        let mut ordered = steps.to_vec();
        sort_steps(&mut ordered, descriptor.is_read());

        let mut report = StepRunReport::default();
        let target = target_payload(request, descriptor);
        let http_request = http_snapshot(request);
        let credentials = self.credentials.get();

        for step in &ordered {
            let label = step.label();
            let Some(assembly_path) = self.locator.locate(&step.assembly_name) else {
                self.trace(
                    request,
                    &mut report,
                    format!(
                        "skipped {label}: assembly {} not found locally",
                        step.assembly_name
                    ),
                );
                report.steps.push(StepRun {
                    step_id: step.step_id,
                    label,
                    stage: step.stage,
                    outcome: StepOutcome::HandlerUnavailable {
                        assembly: step.assembly_name.clone(),
                    },
                });
                continue;
            };

            let invocation = InvocationRequest {
                abi_version: ABI_VERSION,
                correlation_id: request.correlation_id.clone(),
                assembly_path: assembly_path.display().to_string(),
                type_name: step.type_name.clone(),
                operation: descriptor.operation.clone(),
                entity_name: descriptor.entity.clone(),
                entity_id: descriptor.record_key.clone(),
                stage: step.stage,
                mode: step.mode,
                rank: step.rank,
                target: target.clone(),
                pre_images: images_by_alias(request, step.step_id, ImageKind::Pre),
                post_images: images_by_alias(request, step.step_id, ImageKind::Post),
                secure_config: step.secure_config.clone(),
                unsecure_config: step.unsecure_config.clone(),
                org_url: credentials
                    .as_ref()
                    .map(|credentials| credentials.org_url.clone())
                    .unwrap_or_default(),
                access_token: credentials
                    .as_ref()
                    .map(|credentials| credentials.access_token.clone())
                    .unwrap_or_default(),
                http_request: http_request.clone(),
            };

            self.trace(request, &mut report, format!("invoking {label}"));
            let outcome = match self.runner.invoke(invocation).await {
                Ok(response) => {
                    let trace_lines = response.trace.len();
                    for line in response.trace {
                        self.trace(request, &mut report, line);
                    }
                    self.trace(request, &mut report, format!("completed {label}"));
                    StepOutcome::Completed { trace_lines }
                }
                Err(err) => {
                    warn!("{} {label} failed: {err}", category_step());
                    self.trace(request, &mut report, format!("failed {label}: {err}"));
                    StepOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            report.steps.push(StepRun {
                step_id: step.step_id,
                label,
                stage: step.stage,
                outcome,
            });
        }
        report
    }

    fn trace(&self, request: &CapturedRequest, report: &mut StepRunReport, line: String) {
        self.sink.emit(&request.correlation_id, &line);
        report.trace.push(line);
    }
}

/// Stub `{"<entity>id": key}` overlaid with the request body fields.
pub fn target_payload(request: &CapturedRequest, descriptor: &OperationDescriptor) -> Value {
    let mut target = Map::new();
    if !descriptor.entity.is_empty()
        && let Some(key) = &descriptor.record_key
    {
        if key.contains('=') {
            // alternate key: accountnumber='A1',name='x'
            for pair in key.split(',') {
                if let Some((field, value)) = pair.split_once('=') {
                    target.insert(
                        field.trim().to_string(),
                        Value::String(value.trim().trim_matches('\'').to_string()),
                    );
                }
            }
        } else {
            target.insert(
                format!("{}id", descriptor.entity.to_ascii_lowercase()),
                Value::String(key.clone()),
            );
        }
    }
    if let Some(body) = request.body_object() {
        target.extend(body);
    }
    Value::Object(target)
}

fn images_by_alias(
    request: &CapturedRequest,
    step_id: Uuid,
    kind: ImageKind,
) -> BTreeMap<String, Value> {
    request
        .images_for(step_id, kind)
        .map(|image| (image.alias.clone(), image.entity.clone()))
        .collect()
}

fn http_snapshot(request: &CapturedRequest) -> HttpRequestSnapshot {
    HttpRequestSnapshot {
        method: request.method.clone(),
        url: request.url.clone(),
        headers: request
            .headers
            .iter()
            .map(|(name, values)| (name.to_string(), values.to_vec()))
            .collect(),
        body: String::from_utf8_lossy(&request.body).into_owned(),
    }
}
