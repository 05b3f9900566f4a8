//! Wire contract between the edge and the out-of-process plugin runner.
//!
//! The edge never loads handler code itself. It serializes an
//! [`InvocationRequest`] and receives an [`InvocationResponse`] back over
//! whatever transport the runner exposes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ABI_VERSION: u16 = 1;

/// Pipeline stage a step is registered on. Discriminants are the platform's
/// numeric stage codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    PreValidation = 10,
    PreOperation = 20,
    MainOperation = 30,
    PostOperation = 40,
}

impl ExecutionStage {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(ExecutionStage::PreValidation),
            20 => Some(ExecutionStage::PreOperation),
            30 => Some(ExecutionStage::MainOperation),
            40 => Some(ExecutionStage::PostOperation),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStage::PreValidation => "pre-validation",
            ExecutionStage::PreOperation => "pre-operation",
            ExecutionStage::MainOperation => "main-operation",
            ExecutionStage::PostOperation => "post-operation",
        }
    }

    /// Stages that run before the platform commits the operation.
    pub fn runs_before_call(self) -> bool {
        !matches!(self, ExecutionStage::PostOperation)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Synchronous,
    Asynchronous,
}

impl ExecutionMode {
    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            ExecutionMode::Asynchronous
        } else {
            ExecutionMode::Synchronous
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Synchronous => "sync",
            ExecutionMode::Asynchronous => "async",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Pre,
    Post,
    Both,
}

impl ImageKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ImageKind::Pre),
            1 => Some(ImageKind::Post),
            2 => Some(ImageKind::Both),
            _ => None,
        }
    }

    pub fn includes_pre(self) -> bool {
        matches!(self, ImageKind::Pre | ImageKind::Both)
    }

    pub fn includes_post(self) -> bool {
        matches!(self, ImageKind::Post | ImageKind::Both)
    }
}

/// The intercepted HTTP call, forwarded to the handler for context.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpRequestSnapshot {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InvocationRequest {
    pub abi_version: u16,
    pub correlation_id: String,
    pub assembly_path: String,
    pub type_name: String,
    pub operation: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub stage: ExecutionStage,
    pub mode: ExecutionMode,
    pub rank: i32,
    /// Serialized target entity (JSON object).
    pub target: Value,
    /// Pre images by alias.
    #[serde(default)]
    pub pre_images: BTreeMap<String, Value>,
    /// Post images by alias.
    #[serde(default)]
    pub post_images: BTreeMap<String, Value>,
    #[serde(default)]
    pub secure_config: Option<String>,
    #[serde(default)]
    pub unsecure_config: Option<String>,
    pub org_url: String,
    pub access_token: String,
    pub http_request: HttpRequestSnapshot,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InvocationResponse {
    #[serde(default)]
    pub trace: Vec<String>,
    /// Anything else the runner reports. Opaque to the edge.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_codes_round_trip_through_platform_numbers() {
        for stage in [
            ExecutionStage::PreValidation,
            ExecutionStage::PreOperation,
            ExecutionStage::MainOperation,
            ExecutionStage::PostOperation,
        ] {
            assert_eq!(ExecutionStage::from_code(stage.code()), Some(stage));
        }
        assert_eq!(ExecutionStage::from_code(0), None);
    }

    #[test]
    fn only_post_operation_runs_after_the_call() {
        assert!(ExecutionStage::PreValidation.runs_before_call());
        assert!(ExecutionStage::MainOperation.runs_before_call());
        assert!(!ExecutionStage::PostOperation.runs_before_call());
    }

    #[test]
    fn both_image_kind_covers_pre_and_post() {
        assert!(ImageKind::Both.includes_pre());
        assert!(ImageKind::Both.includes_post());
        assert!(!ImageKind::Pre.includes_post());
        assert!(!ImageKind::Post.includes_pre());
    }

    #[test]
    fn response_keeps_unknown_fields() {
        let response: InvocationResponse =
            serde_json::from_str(r#"{"trace":["a","b"],"elapsed_ms":12}"#)
                .expect("response should decode");
        assert_eq!(response.trace, vec!["a", "b"]);
        assert_eq!(response.extra.get("elapsed_ms"), Some(&Value::from(12)));
    }
}
