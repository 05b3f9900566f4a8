use std::{cmp::Ordering, collections::BTreeSet};

use runner_abi::{ExecutionMode, ExecutionStage};
use serde::Serialize;
use tracing::debug;

use crate::{
    catalog::{CatalogIndex, StepInfo},
    logging::category_match,
    model::CapturedRequest,
    parser::OperationDescriptor,
};

/// Steps that would fire for one request.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MatchResult {
    /// Operation and entity match, before the field filter.
    pub candidates: Vec<StepInfo>,
    /// Candidates that also pass the field filter, in execution order.
    pub matches: Vec<StepInfo>,
    /// Set when only the operation name could be matched.
    pub message_only: bool,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn before_call(&self) -> Vec<StepInfo> {
        self.matches
            .iter()
            .filter(|step| step.stage.runs_before_call())
            .cloned()
            .collect()
    }

    pub fn after_call(&self) -> Vec<StepInfo> {
        self.matches
            .iter()
            .filter(|step| !step.stage.runs_before_call())
            .cloned()
            .collect()
    }
}

/// Top-level field names present in the request body. Annotation suffixes
/// such as `@odata.bind` are dropped.
pub fn modified_fields(request: &CapturedRequest) -> BTreeSet<String> {
    request
        .body_object()
        .map(|body| {
            body.keys()
                .map(|key| key.split('@').next().unwrap_or(key).to_ascii_lowercase())
                .filter(|key| !key.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// A step without filtering fields always passes. A filtering step needs at
/// least one of its fields among `fields`; no fields means no evidence.
pub fn passes_field_filter(step: &StepInfo, fields: &BTreeSet<String>) -> bool {
    step.filtering_fields.is_empty()
        || step
            .filtering_fields
            .iter()
            .any(|field| fields.contains(field))
}

/// Higher runs first. Read operations prefer the main operation stage.
pub fn stage_score(stage: ExecutionStage, read_operation: bool) -> u8 {
    match (read_operation, stage) {
        (true, ExecutionStage::MainOperation) => 4,
        (true, ExecutionStage::PreOperation) => 3,
        (true, ExecutionStage::PreValidation) => 2,
        (true, ExecutionStage::PostOperation) => 1,
        (false, ExecutionStage::PreOperation) => 4,
        (false, ExecutionStage::PreValidation) => 3,
        (false, ExecutionStage::PostOperation) => 2,
        (false, ExecutionStage::MainOperation) => 1,
    }
}

fn mode_score(mode: ExecutionMode) -> u8 {
    match mode {
        ExecutionMode::Synchronous => 1,
        ExecutionMode::Asynchronous => 0,
    }
}

pub fn compare_steps(left: &StepInfo, right: &StepInfo, read_operation: bool) -> Ordering {
    stage_score(right.stage, read_operation)
        .cmp(&stage_score(left.stage, read_operation))
        .then_with(|| mode_score(right.mode).cmp(&mode_score(left.mode)))
        .then_with(|| left.rank.cmp(&right.rank))
        .then_with(|| left.step_id.cmp(&right.step_id))
}

pub fn sort_steps(steps: &mut [StepInfo], read_operation: bool) {
    steps.sort_by(|left, right| compare_steps(left, right, read_operation));
}

pub fn match_steps(
    request: &CapturedRequest,
    descriptor: &OperationDescriptor,
    index: &CatalogIndex,
) -> MatchResult {
    let by_operation = index.steps_for_operation(&descriptor.synonyms);
    if by_operation.is_empty() {
        debug!(
            "{} no steps registered for {}",
            category_match(),
            descriptor.operation
        );
        return MatchResult::default();
    }

    let entities = descriptor.entity_candidates();
    let fields = modified_fields(request);
    let read = descriptor.is_read();

    let candidates: Vec<StepInfo> = by_operation
        .iter()
        .filter(|step| {
            let target = step.target_entity();
            if target.is_empty() {
                entities.is_empty()
            } else {
                entities.iter().any(|entity| entity == target)
            }
        })
        .map(|step| (*step).clone())
        .collect();
    let mut matches: Vec<StepInfo> = candidates
        .iter()
        .filter(|step| passes_field_filter(step, &fields))
        .cloned()
        .collect();

    if !matches.is_empty() {
        sort_steps(&mut matches, read);
        return MatchResult {
            candidates,
            matches,
            message_only: false,
        };
    }

    let mut message_only: Vec<StepInfo> = by_operation
        .iter()
        .filter(|step| passes_field_filter(step, &fields))
        .map(|step| (*step).clone())
        .collect();
    if !message_only.is_empty() {
        debug!(
            "{} entity {:?} matched no step for {}, falling back to message-only match",
            category_match(),
            entities,
            descriptor.operation
        );
        sort_steps(&mut message_only, read);
        return MatchResult {
            candidates: by_operation.into_iter().cloned().collect(),
            matches: message_only,
            message_only: true,
        };
    }

    MatchResult {
        candidates,
        matches: Vec::new(),
        message_only: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use runner_abi::ImageKind;

    use super::*;
    use crate::{
        catalog::tests::CatalogBuilder,
        model::Multimap,
        parser::OperationParser,
        schema::SchemaCache,
    };

    const ACCOUNT_URL: &str =
        "/api/data/v9.0/accounts(11111111-1111-1111-1111-111111111111)";

    fn request(method: &str, url: &str, body: &str) -> (CapturedRequest, OperationDescriptor) {
        let request = CapturedRequest::new(method, url, Multimap::new(), body.as_bytes().to_vec());
        let descriptor = OperationParser::new(Arc::new(SchemaCache::disabled()))
            .parse(method, url)
            .expect("url should parse");
        (request, descriptor)
    }

    fn ids(steps: &[StepInfo]) -> Vec<uuid::Uuid> {
        steps.iter().map(|step| step.step_id).collect()
    }

    #[test]
    fn filtered_update_matches_when_field_intersects() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.AccountUpdate")
            .step("Update", "account", ExecutionStage::PreOperation, "name,telephone1")
            .index();
        let (request, descriptor) = request("PATCH", ACCOUNT_URL, r#"{"name":"Acme"}"#);

        let result = match_steps(&request, &descriptor, &index);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(ids(&result.matches), ids(&result.candidates));
        assert!(!result.message_only);
    }

    #[test]
    fn filtered_update_is_excluded_without_intersection() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.AccountUpdate")
            .step("Update", "account", ExecutionStage::PreOperation, "telephone1")
            .index();
        let (request, descriptor) = request("PATCH", ACCOUNT_URL, r#"{"name":"Acme"}"#);

        let result = match_steps(&request, &descriptor, &index);
        assert_eq!(result.candidates.len(), 1);
        assert!(result.matches.is_empty());
        assert!(result.is_empty());
    }

    #[test]
    fn filtering_steps_never_match_an_empty_body() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.AccountUpdate")
            .step("Update", "account", ExecutionStage::PreOperation, "name")
            .step("Update", "account", ExecutionStage::PostOperation, "")
            .index();
        for body in ["", "{}", "[]", "not json"] {
            let (request, descriptor) = request("PATCH", ACCOUNT_URL, body);
            let result = match_steps(&request, &descriptor, &index);
            assert_eq!(result.matches.len(), 1, "body {body:?}");
            assert!(result.matches[0].filtering_fields.is_empty());
        }
    }

    #[test]
    fn narrowed_matches_are_a_subset_of_candidates() {
        let mut builder = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A");
        for (entity, filter) in [
            ("account", "name"),
            ("account", "telephone1"),
            ("contact", ""),
            ("", ""),
            ("none", "name"),
        ] {
            builder.push_step(
                "Update",
                entity,
                ExecutionStage::PreOperation,
                ExecutionMode::Synchronous,
                1,
                filter,
            );
        }
        let index = builder.index();

        for (url, body) in [
            (ACCOUNT_URL, r#"{"name":"x"}"#),
            (ACCOUNT_URL, r#"{"fax":"x"}"#),
            ("/api/data/v9.0/leads(1)", r#"{"name":"x"}"#),
            ("/api/data/v9.0/leads(1)", ""),
        ] {
            let (request, descriptor) = request("PATCH", url, body);
            let result = match_steps(&request, &descriptor, &index);
            let candidates = ids(&result.candidates);
            for step in &result.matches {
                assert!(candidates.contains(&step.step_id), "{url} {body}");
            }
        }
    }

    #[test]
    fn entity_mismatch_falls_back_to_message_only() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
            .step("Update", "new_customaccount", ExecutionStage::PreOperation, "")
            .index();
        let (request, descriptor) = request("PATCH", ACCOUNT_URL, r#"{"name":"Acme"}"#);

        let result = match_steps(&request, &descriptor, &index);
        assert!(result.message_only);
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.candidates.len(), 1);
    }

    #[test]
    fn unknown_operation_yields_empty_result() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
            .step("Create", "account", ExecutionStage::PreOperation, "")
            .index();
        let (request, descriptor) = request("DELETE", ACCOUNT_URL, "");
        let result = match_steps(&request, &descriptor, &index);
        assert!(result.candidates.is_empty());
        assert!(result.matches.is_empty());
    }

    #[test]
    fn custom_action_short_name_matches() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.MyAction")
            .step("myaction", "account", ExecutionStage::MainOperation, "")
            .index();
        let (request, descriptor) = request(
            "POST",
            &format!("{ACCOUNT_URL}/Microsoft.Dynamics.CRM.myaction"),
            "{}",
        );
        let result = match_steps(&request, &descriptor, &index);
        assert_eq!(result.matches.len(), 1);
        assert!(!result.message_only);
    }

    #[test]
    fn unbound_operation_matches_entityless_step() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.Calc")
            .step("new_Calculate", "", ExecutionStage::PostOperation, "")
            .step("new_Calculate", "account", ExecutionStage::PostOperation, "")
            .index();
        let (request, descriptor) = request(
            "POST",
            "/api/data/v9.2/Microsoft.Dynamics.CRM.new_Calculate",
            "{}",
        );
        let result = match_steps(&request, &descriptor, &index);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].target_entity(), "");
    }

    #[test]
    fn ordering_prefers_stage_then_mode_then_rank() {
        let mut builder = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A");
        let post = builder.push_step(
            "Update",
            "account",
            ExecutionStage::PostOperation,
            ExecutionMode::Synchronous,
            1,
            "",
        );
        let pre_async = builder.push_step(
            "Update",
            "account",
            ExecutionStage::PreOperation,
            ExecutionMode::Asynchronous,
            1,
            "",
        );
        let pre_rank_two = builder.push_step(
            "Update",
            "account",
            ExecutionStage::PreOperation,
            ExecutionMode::Synchronous,
            2,
            "",
        );
        let pre_rank_one = builder.push_step(
            "Update",
            "account",
            ExecutionStage::PreOperation,
            ExecutionMode::Synchronous,
            1,
            "",
        );
        let validation = builder.push_step(
            "Update",
            "account",
            ExecutionStage::PreValidation,
            ExecutionMode::Synchronous,
            1,
            "",
        );
        let index = builder.index();
        let (request, descriptor) = request("PATCH", ACCOUNT_URL, r#"{"name":"x"}"#);

        let result = match_steps(&request, &descriptor, &index);
        assert_eq!(
            ids(&result.matches),
            vec![pre_rank_one, pre_rank_two, pre_async, validation, post]
        );
        assert_eq!(ids(&result.after_call()), vec![post]);
        assert_eq!(result.before_call().len(), 4);
    }

    #[test]
    fn read_operations_prefer_main_operation_stage() {
        assert!(
            stage_score(ExecutionStage::MainOperation, true)
                > stage_score(ExecutionStage::PreOperation, true)
        );
        assert!(
            stage_score(ExecutionStage::PreOperation, false)
                > stage_score(ExecutionStage::PostOperation, false)
        );
        assert!(
            stage_score(ExecutionStage::PreOperation, false)
                > stage_score(ExecutionStage::MainOperation, false)
        );
    }

    #[test]
    fn annotated_body_fields_count_as_modified() {
        let index = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
            .step("Update", "contact", ExecutionStage::PreOperation, "parentcustomerid")
            .image(ImageKind::Pre, "pre", "")
            .index();
        let (request, descriptor) = request(
            "PATCH",
            "/api/data/v9.0/contacts(1)",
            r#"{"parentcustomerid@odata.bind":"/accounts(1)"}"#,
        );
        let result = match_steps(&request, &descriptor, &index);
        assert_eq!(result.matches.len(), 1);
    }
}
