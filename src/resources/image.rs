use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Annotation naming the ImageFlowTemplate used when `spec.templateName` is empty.
pub const ANNOTATION_DEFAULT_TEMPLATE_ALL: &str = "build.takutakahashi.dev/default-template-all";

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "build.takutakahashi.dev",
    version = "v1beta1",
    kind = "Image",
    plural = "images",
    namespaced,
    status = "ImageStatus",
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository.url"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targets[0].name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Name of the ImageFlowTemplate in the same namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_name: String,
    pub repository: ImageRepository,
    /// Push destinations. Only a single target is currently supported.
    pub targets: Vec<ImageTarget>,
    /// Extra environment passed to every actor container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRepository {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ImageAuth>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_policies: Vec<ImageTagPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageTagPolicy {
    #[serde(default)]
    pub policy: TagPolicyType,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TagPolicyType {
    BranchHash,
    BranchName,
    TagHash,
    TagName,
    #[default]
    Unused,
}

impl TagPolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagPolicyType::BranchHash => "branchHash",
            TagPolicyType::BranchName => "branchName",
            TagPolicyType::TagHash => "tagHash",
            TagPolicyType::TagName => "tagName",
            TagPolicyType::Unused => "unused",
        }
    }
}

impl fmt::Display for TagPolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageTarget {
    /// Image reference without tag, e.g. ghcr.io/org/app
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ImageAuth>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAuth {
    #[serde(default, rename = "type")]
    pub type_: ImageAuthType,
    pub secret_name: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ImageAuthType {
    #[default]
    Basic,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ImageStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ImageCondition>,
}

/// One fact about one pipeline phase of one revision.
///
/// Detected conditions are identified by `(type, revision, tagPolicy)`.
/// Checked and Uploaded conditions are identified by `(type, resolvedRevision)`;
/// their `revision` and `tagPolicy` record which declared policy queued them.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub tag_policy: TagPolicyType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_revision: String,
    /// Last time the status or resolved revision changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    Detected,
    Checked,
    Uploaded,
}

impl ConditionType {
    /// Short verb used in child resource names.
    pub fn phase(&self) -> &'static str {
        match self {
            ConditionType::Detected => "detect",
            ConditionType::Checked => "check",
            ConditionType::Uploaded => "upload",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Detected => f.write_str("detected"),
            ConditionType::Checked => f.write_str("checked"),
            ConditionType::Uploaded => f.write_str("uploaded"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
    Canceled,
    #[serde(rename = "failed", alias = "Failed")]
    Failed,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
            ConditionStatus::Canceled => "Canceled",
            ConditionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl Image {
    pub fn conditions(&self) -> &[ImageCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn conditions_mut(&mut self) -> &mut Vec<ImageCondition> {
        &mut self.status.get_or_insert_with(ImageStatus::default).conditions
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
