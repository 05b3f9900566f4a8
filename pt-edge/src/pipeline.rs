use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    auto_debug::{HookLedger, SharedAutoDebug, session_for_request},
    catalog::{CatalogStore, StepInfo},
    images::{ImagePhase, ImageResolver},
    logging::{category_debug, category_match},
    matcher::{MatchResult, match_steps},
    model::CapturedRequest,
    orchestrator::{Orchestrator, StepRunReport},
    parser::{OperationDescriptor, OperationParser, ParseError},
};

/// What the pre-call hook decided for one request.
#[derive(Clone, Debug, Default)]
pub struct InterceptDecision {
    pub descriptor: Option<OperationDescriptor>,
    pub matches: Option<MatchResult>,
    pub forward_upstream: bool,
    pub steps_run: usize,
}

impl InterceptDecision {
    fn passthrough() -> Self {
        Self {
            forward_upstream: true,
            ..Self::default()
        }
    }
}

/// Parsed operation and match result for a captured request, computed
/// against the current catalog.
#[derive(Clone, Debug, Serialize)]
pub struct RequestMatches {
    pub descriptor: OperationDescriptor,
    pub result: MatchResult,
}

/// Runs matched steps around a proxied call: pre-call stages before the
/// upstream request, post-operation steps after the response.
pub struct Interceptor {
    parser: OperationParser,
    catalog: Arc<CatalogStore>,
    resolver: ImageResolver,
    orchestrator: Orchestrator,
    auto_debug: SharedAutoDebug,
    ledger: HookLedger,
}

impl Interceptor {
    pub fn new(
        parser: OperationParser,
        catalog: Arc<CatalogStore>,
        resolver: ImageResolver,
        orchestrator: Orchestrator,
        auto_debug: SharedAutoDebug,
    ) -> Self {
        Self {
            parser,
            catalog,
            resolver,
            orchestrator,
            auto_debug,
            ledger: HookLedger::default(),
        }
    }

    pub fn explain(&self, request: &CapturedRequest) -> Result<RequestMatches, ParseError> {
        let descriptor = self.parser.parse(&request.method, &request.url)?;
        let index = self.catalog.current();
        let result = match_steps(request, &descriptor, &index);
        Ok(RequestMatches { descriptor, result })
    }

    pub async fn before_proxy(&self, request: &mut CapturedRequest) -> InterceptDecision {
        let Some(session) = session_for_request(&self.auto_debug, &request.headers) else {
            return InterceptDecision::passthrough();
        };
        if !self
            .ledger
            .try_claim(ImagePhase::BeforeCall, &request.correlation_id)
        {
            debug!(
                "{} {} already went through the pre-call hook",
                category_debug(),
                request.correlation_id
            );
            return InterceptDecision::passthrough();
        }

        let RequestMatches { descriptor, result } = match self.explain(request) {
            Ok(matches) => matches,
            Err(err) => {
                debug!(
                    "{} {} {} not intercepted: {err}",
                    category_match(),
                    request.method,
                    request.sanitized_url
                );
                return InterceptDecision::passthrough();
            }
        };
        if result.is_empty() {
            debug!(
                "{} no local handler for {} {}",
                category_match(),
                descriptor.operation,
                descriptor.entity
            );
        } else {
            info!(
                "{} {} {} matched {} of {} candidate steps{}",
                category_match(),
                descriptor.operation,
                descriptor.entity,
                result.matches.len(),
                result.candidates.len(),
                if result.message_only {
                    " (message only)"
                } else {
                    ""
                }
            );
        }

        let steps = result.before_call();
        let mut decision = InterceptDecision {
            forward_upstream: true,
            ..InterceptDecision::default()
        };
        if !steps.is_empty() {
            let report = self
                .run_phase(request, &descriptor, &steps, ImagePhase::BeforeCall)
                .await;
            decision.steps_run = report.steps.len();
            decision.forward_upstream = session.forward_upstream();
        }
        decision.descriptor = Some(descriptor);
        decision.matches = Some(result);
        decision
    }

    /// Post-operation steps. Expects the response fields of `request` to be
    /// filled in already; they only run after a successful (2xx) response.
    pub async fn after_response(
        &self,
        request: &mut CapturedRequest,
        decision: &InterceptDecision,
    ) -> usize {
        let (Some(descriptor), Some(result)) = (&decision.descriptor, &decision.matches) else {
            return 0;
        };
        let steps = result.after_call();
        if steps.is_empty() {
            return 0;
        }
        if !request
            .response
            .status
            .is_some_and(|status| (200..300).contains(&status))
        {
            let reason = match request.response.status {
                Some(status) => format!("upstream returned {status}"),
                None => "no response".to_string(),
            };
            info!(
                "{} {} {} skipped {} post-operation steps: {reason}",
                category_debug(),
                request.method,
                request.sanitized_url,
                steps.len()
            );
            request.append_trace([format!("skipped post-operation steps: {reason}")]);
            return 0;
        }
        if !self
            .ledger
            .try_claim(ImagePhase::AfterResponse, &request.correlation_id)
        {
            return 0;
        }
        self.run_phase(request, descriptor, &steps, ImagePhase::AfterResponse)
            .await
            .steps
            .len()
    }

    async fn run_phase(
        &self,
        request: &mut CapturedRequest,
        descriptor: &OperationDescriptor,
        steps: &[StepInfo],
        phase: ImagePhase,
    ) -> StepRunReport {
        let response = match phase {
            ImagePhase::BeforeCall => None,
            ImagePhase::AfterResponse => Some(request.response.clone()),
        };
        let images = self
            .resolver
            .resolve(request, descriptor, steps, phase, response.as_ref())
            .await;
        for image in images {
            request.attach_image(image);
        }

        let report = self
            .orchestrator
            .run_matched_steps(request, descriptor, steps)
            .await;
        request.append_trace(report.trace.iter().cloned());
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use runner_abi::{ExecutionStage, ImageKind, InvocationRequest, InvocationResponse};
    use serde_json::Value;

    use super::*;
    use crate::{
        auto_debug::{StartAutoDebugRequest, new_auto_debug_store, start_auto_debug},
        catalog::tests::CatalogBuilder,
        images::{EntityFetcher, FetchError},
        model::{CredentialStore, Multimap},
        orchestrator::{BufferSink, HandlerRunner, RunnerError},
        schema::SchemaCache,
    };

    const URL: &str = "/api/data/v9.2/accounts(11111111-1111-1111-1111-111111111111)";

    #[derive(Default)]
    struct Recorder {
        stages: Mutex<Vec<ExecutionStage>>,
        pre_images: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl HandlerRunner for Recorder {
        async fn invoke(
            &self,
            request: InvocationRequest,
        ) -> Result<InvocationResponse, RunnerError> {
            self.stages
                .lock()
                .expect("stages lock poisoned")
                .push(request.stage);
            self.pre_images
                .lock()
                .expect("images lock poisoned")
                .push(request.pre_images.len());
            Ok(InvocationResponse {
                trace: vec![format!("ran {}", request.stage.as_str())],
                ..InvocationResponse::default()
            })
        }
    }

    struct StaticFetcher;

    #[async_trait]
    impl EntityFetcher for StaticFetcher {
        async fn fetch_entity(
            &self,
            _entity_set: &str,
            _key: &str,
            _select: &[String],
        ) -> Result<Option<Value>, FetchError> {
            Ok(Some(serde_json::json!({ "name": "Old" })))
        }
    }

    struct AllLocator;

    impl crate::orchestrator::AssemblyLocator for AllLocator {
        fn locate(&self, assembly_name: &str) -> Option<std::path::PathBuf> {
            Some(std::path::PathBuf::from(format!("{assembly_name}.dll")))
        }
    }

    fn interceptor(runner: Arc<Recorder>, auto_debug: SharedAutoDebug) -> Interceptor {
        let catalog = Arc::new(CatalogStore::new());
        let snapshot = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.Account")
            .step("Update", "account", ExecutionStage::PreOperation, "name")
            .image(ImageKind::Pre, "PreImage", "name")
            .step("Update", "account", ExecutionStage::PostOperation, "")
            .snapshot();
        catalog.install(snapshot).expect("catalog should install");
        let schema = Arc::new(SchemaCache::disabled());
        Interceptor::new(
            OperationParser::new(Arc::clone(&schema)),
            catalog,
            ImageResolver::new(Arc::new(StaticFetcher), schema),
            Orchestrator::new(
                runner,
                Arc::new(AllLocator),
                Arc::new(CredentialStore::default()),
                Arc::new(BufferSink::new()),
            ),
            auto_debug,
        )
    }

    fn captured(correlation: &str) -> CapturedRequest {
        let mut headers = Multimap::new();
        headers.append("x-ms-client-request-id", correlation);
        CapturedRequest::new("PATCH", URL, headers, br#"{"name":"New"}"#.to_vec())
    }

    #[tokio::test]
    async fn hooks_run_pre_and_post_stages_once_per_request() {
        let runner = Arc::new(Recorder::default());
        let auto_debug = new_auto_debug_store();
        start_auto_debug(&auto_debug, StartAutoDebugRequest::default())
            .expect("session should start");
        let interceptor = interceptor(Arc::clone(&runner), auto_debug);

        let mut request = captured("corr-1");
        let decision = interceptor.before_proxy(&mut request).await;
        assert!(decision.forward_upstream);
        assert_eq!(decision.steps_run, 1);
        request.response.status = Some(204);
        assert_eq!(interceptor.after_response(&mut request, &decision).await, 1);

        assert_eq!(
            *runner.stages.lock().expect("stages lock poisoned"),
            vec![ExecutionStage::PreOperation, ExecutionStage::PostOperation]
        );
        assert_eq!(*runner.pre_images.lock().expect("images lock poisoned"), vec![1, 0]);
        assert_eq!(request.images.len(), 1);
        assert_eq!(request.response.trace.len(), 6);

        let mut retry = captured("corr-1");
        let repeated = interceptor.before_proxy(&mut retry).await;
        assert!(repeated.matches.is_none());
        assert_eq!(interceptor.after_response(&mut request, &decision).await, 0);
        assert_eq!(runner.stages.lock().expect("stages lock poisoned").len(), 2);
    }

    #[tokio::test]
    async fn failed_calls_skip_post_operation_steps() {
        let runner = Arc::new(Recorder::default());
        let auto_debug = new_auto_debug_store();
        start_auto_debug(&auto_debug, StartAutoDebugRequest::default())
            .expect("session should start");
        let interceptor = interceptor(Arc::clone(&runner), auto_debug);

        let mut request = captured("corr-4");
        let decision = interceptor.before_proxy(&mut request).await;
        assert_eq!(decision.steps_run, 1);
        request.response.status = Some(502);
        assert_eq!(interceptor.after_response(&mut request, &decision).await, 0);

        assert_eq!(
            *runner.stages.lock().expect("stages lock poisoned"),
            vec![ExecutionStage::PreOperation]
        );
        assert_eq!(
            request.response.trace.last().map(String::as_str),
            Some("skipped post-operation steps: upstream returned 502")
        );

        let mut unanswered = captured("corr-5");
        let decision = interceptor.before_proxy(&mut unanswered).await;
        assert_eq!(interceptor.after_response(&mut unanswered, &decision).await, 0);
        assert_eq!(
            unanswered.response.trace.last().map(String::as_str),
            Some("skipped post-operation steps: no response")
        );
        assert_eq!(runner.stages.lock().expect("stages lock poisoned").len(), 2);
    }

    #[tokio::test]
    async fn no_session_means_passthrough() {
        let runner = Arc::new(Recorder::default());
        let interceptor = interceptor(Arc::clone(&runner), new_auto_debug_store());
        let mut request = captured("corr-2");

        let decision = interceptor.before_proxy(&mut request).await;
        assert!(decision.forward_upstream);
        assert!(decision.descriptor.is_none());
        assert!(runner.stages.lock().expect("stages lock poisoned").is_empty());

        let explained = interceptor.explain(&request).expect("url should parse");
        assert_eq!(explained.result.matches.len(), 2);
    }

    #[tokio::test]
    async fn session_can_keep_matched_calls_local() {
        let runner = Arc::new(Recorder::default());
        let auto_debug = new_auto_debug_store();
        start_auto_debug(
            &auto_debug,
            StartAutoDebugRequest {
                forward_upstream: false,
                ..StartAutoDebugRequest::default()
            },
        )
        .expect("session should start");
        let interceptor = interceptor(Arc::clone(&runner), auto_debug);

        let mut request = captured("corr-3");
        let decision = interceptor.before_proxy(&mut request).await;
        assert!(!decision.forward_upstream);

        let mut unmatched = CapturedRequest::new(
            "GET",
            "/api/data/v9.2/contacts",
            Multimap::new(),
            Vec::new(),
        );
        let decision = interceptor.before_proxy(&mut unmatched).await;
        assert!(decision.forward_upstream);
    }
}
