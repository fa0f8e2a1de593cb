//! Documents exchanged with actor containers through the shared work
//! directory, and how their results land in Image conditions.
//!
//! The operator writes nothing here itself; actor processes use these types
//! to read `WORK_DIR/input`, write `WORK_DIR/output` and fold reports back
//! into the Image status.

use crate::condition::{
    get_condition_by, get_condition_by_resolved_revision, get_condition_by_status,
    mark_upload_condition_as_canceled, observe_revision, queue_check, status_changed,
    update_checked_condition, update_uploaded_condition,
};
use crate::resources::image::{
    ConditionStatus, ConditionType, ImageCondition, ImageTagPolicy, TagPolicyType,
};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const TAG_LATEST_HASH: &str = "latest/hash";
pub const TAG_LATEST_NAME: &str = "latest/name";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectOutput {
    /// Branch name to commit hash
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl DetectOutput {
    /// Revision a tag policy currently points at, if the actor reported one.
    pub fn resolve<'a>(&'a self, policy: &'a ImageTagPolicy) -> Option<&'a str> {
        let resolved = match policy.policy {
            TagPolicyType::TagHash => self.tags.get(TAG_LATEST_HASH)?.as_str(),
            TagPolicyType::TagName => self.tags.get(TAG_LATEST_NAME)?.as_str(),
            TagPolicyType::BranchHash => self.branches.get(&policy.revision)?.as_str(),
            TagPolicyType::BranchName => policy.revision.as_str(),
            TagPolicyType::Unused => return None,
        };
        (!resolved.is_empty()).then_some(resolved)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckDocument {
    pub revisions: Vec<CheckRevision>,
}

pub type CheckInput = CheckDocument;
pub type CheckOutput = CheckDocument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRevision {
    pub registry: String,
    pub resolved_revision: String,
    /// Whether the image already exists in the registry. Set by the actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exist: Option<ConditionStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadDocument {
    pub builds: Vec<ImageBuild>,
}

pub type UploadInput = UploadDocument;
pub type UploadOutput = UploadDocument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBuild {
    pub target: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<ConditionStatus>,
}

/// The directory shared between an actor and the operator's sidecar logic.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkDir { root: root.into() }
    }

    pub fn input_path(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_path(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn has_output(&self) -> bool {
        self.output_path().exists()
    }

    pub fn write_input<T: Serialize>(&self, input: &T) -> anyhow::Result<()> {
        write_json(&self.input_path(), input)
    }

    pub fn read_input<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        read_json(&self.input_path())
    }

    pub fn write_output<T: Serialize>(&self, output: &T) -> anyhow::Result<()> {
        write_json(&self.output_path(), output)
    }

    pub fn read_output<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        read_json(&self.output_path())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value).context("Failed to serialize actor document")?;
    fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let body = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&body)
        .with_context(|| format!("Failed to parse actor document {}", path.display()))
}

/// Folds a detect report into the conditions. A policy whose revision moved
/// cancels the work queued for its previous revision and queues a check for
/// the new one. Returns whether the conditions changed.
pub fn apply_detect_output(
    conditions: &mut Vec<ImageCondition>,
    tag_policies: &[ImageTagPolicy],
    output: &DetectOutput,
) -> bool {
    let before = conditions.clone();
    for policy in tag_policies {
        let Some(resolved) = output.resolve(policy) else {
            debug!(tag_policy = %policy.policy, revision = %policy.revision, "nothing resolved");
            continue;
        };
        if get_condition_by(conditions, ConditionType::Detected, policy.policy, &policy.revision)
            .is_none()
        {
            observe_revision(
                conditions,
                ConditionType::Detected,
                policy.policy,
                &policy.revision,
                "",
            );
        }
        observe_revision(
            conditions,
            ConditionType::Detected,
            policy.policy,
            &policy.revision,
            resolved,
        );
        let detected =
            get_condition_by(conditions, ConditionType::Detected, policy.policy, &policy.revision)
                .is_some_and(|c| c.status == ConditionStatus::True);
        if detected {
            info!(
                tag_policy = %policy.policy,
                revision = %policy.revision,
                resolved,
                "new revision detected"
            );
            mark_upload_condition_as_canceled(conditions, policy.policy, &policy.revision);
            queue_check(conditions, policy.policy, &policy.revision, resolved);
        }
    }
    status_changed(&before, conditions)
}

/// Every revision waiting for a registry check.
pub fn check_input(target: &str, conditions: &[ImageCondition]) -> CheckInput {
    CheckDocument {
        revisions: get_condition_by_status(
            conditions,
            ConditionType::Checked,
            ConditionStatus::False,
        )
        .into_iter()
        .map(|c| CheckRevision {
            registry: target.to_string(),
            resolved_revision: c.resolved_revision.clone(),
            exist: None,
        })
        .collect(),
    }
}

/// Records check results. A revision missing from the registry gets an
/// upload queued, one that exists is uploaded already.
pub fn apply_check_output(conditions: &mut Vec<ImageCondition>, output: &CheckOutput) -> bool {
    let mut changed = false;
    for rev in &output.revisions {
        let Some(exist) = rev.exist else {
            continue;
        };
        let revision = get_condition_by_resolved_revision(
            conditions,
            ConditionType::Checked,
            &rev.resolved_revision,
        )
        .map(|c| c.revision.clone())
        .unwrap_or_default();
        let uploaded = match exist {
            ConditionStatus::False => Some(ConditionStatus::False),
            ConditionStatus::True => Some(ConditionStatus::True),
            _ => None,
        };
        let checked = if uploaded.is_some() {
            ConditionStatus::True
        } else {
            exist
        };
        changed |= update_checked_condition(conditions, checked, &revision, &rev.resolved_revision);
        if let Some(uploaded) = uploaded {
            changed |=
                update_uploaded_condition(conditions, uploaded, &revision, &rev.resolved_revision);
        }
    }
    changed
}

/// Every revision still waiting to be built and pushed.
pub fn upload_input(target: &str, conditions: &[ImageCondition]) -> UploadInput {
    UploadDocument {
        builds: conditions
            .iter()
            .filter(|c| {
                c.type_ == ConditionType::Uploaded
                    && !matches!(c.status, ConditionStatus::True | ConditionStatus::Canceled)
            })
            .map(|c| ImageBuild {
                target: target.to_string(),
                tag: c.resolved_revision.clone(),
                succeeded: None,
            })
            .collect(),
    }
}

pub fn apply_upload_output(conditions: &mut Vec<ImageCondition>, output: &UploadOutput) -> bool {
    let mut changed = false;
    for build in &output.builds {
        if let Some(succeeded) = build.succeeded {
            changed |= update_uploaded_condition(conditions, succeeded, "", &build.tag);
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::get_condition;
    use serde_json::json;

    fn policies() -> Vec<ImageTagPolicy> {
        vec![
            ImageTagPolicy {
                policy: TagPolicyType::BranchHash,
                revision: "master".into(),
            },
            ImageTagPolicy {
                policy: TagPolicyType::TagHash,
                revision: String::new(),
            },
        ]
    }

    fn detect_output(master: &str) -> DetectOutput {
        serde_json::from_value(json!({
            "branches": {"master": master, "develop": "dev1"},
            "tags": {"latest/hash": "tag1", "latest/name": "v1.0.0"}
        }))
        .unwrap()
    }

    fn find<'a>(
        conditions: &'a [ImageCondition],
        type_: ConditionType,
        resolved: &str,
    ) -> &'a ImageCondition {
        get_condition_by_resolved_revision(conditions, type_, resolved).unwrap()
    }

    #[test]
    fn test_resolve() {
        let output = detect_output("abc");
        let resolve = |policy, revision: &str| {
            output
                .resolve(&ImageTagPolicy {
                    policy,
                    revision: revision.into(),
                })
                .map(str::to_string)
        };
        assert_eq!(resolve(TagPolicyType::BranchHash, "master"), Some("abc".into()));
        assert_eq!(resolve(TagPolicyType::BranchHash, "missing"), None);
        assert_eq!(resolve(TagPolicyType::BranchName, "develop"), Some("develop".into()));
        assert_eq!(resolve(TagPolicyType::TagHash, ""), Some("tag1".into()));
        assert_eq!(resolve(TagPolicyType::TagName, ""), Some("v1.0.0".into()));
        assert_eq!(resolve(TagPolicyType::Unused, "master"), None);
    }

    #[test]
    fn test_detect_queues_checks() {
        let mut conditions = Vec::new();
        assert!(apply_detect_output(&mut conditions, &policies(), &detect_output("abc")));

        let detected = get_condition_by(
            &conditions,
            ConditionType::Detected,
            TagPolicyType::BranchHash,
            "master",
        )
        .unwrap();
        assert_eq!(detected.status, ConditionStatus::True);
        assert_eq!(detected.resolved_revision, "abc");

        let checked = find(&conditions, ConditionType::Checked, "abc");
        assert_eq!(checked.status, ConditionStatus::False);
        assert_eq!(checked.tag_policy, TagPolicyType::BranchHash);
        assert_eq!(checked.revision, "master");
        assert_eq!(
            find(&conditions, ConditionType::Checked, "tag1").tag_policy,
            TagPolicyType::TagHash
        );

        // same report again: already seen, nothing new is queued
        apply_detect_output(&mut conditions, &policies(), &detect_output("abc"));
        assert_eq!(
            get_condition_by_status(&conditions, ConditionType::Checked, ConditionStatus::False)
                .len(),
            2
        );
        assert!(
            get_condition(&conditions, ConditionType::Detected)
                .iter()
                .all(|c| c.status == ConditionStatus::False)
        );
    }

    #[test]
    fn test_detect_new_revision_cancels_previous() {
        let mut conditions = Vec::new();
        apply_detect_output(&mut conditions, &policies(), &detect_output("abc"));
        apply_check_output(
            &mut conditions,
            &CheckDocument {
                revisions: vec![CheckRevision {
                    registry: "ghcr.io/org/app".into(),
                    resolved_revision: "abc".into(),
                    exist: Some(ConditionStatus::False),
                }],
            },
        );
        assert_eq!(
            find(&conditions, ConditionType::Uploaded, "abc").status,
            ConditionStatus::False
        );

        apply_detect_output(&mut conditions, &policies(), &detect_output("def"));
        assert_eq!(
            find(&conditions, ConditionType::Checked, "abc").status,
            ConditionStatus::Canceled
        );
        assert_eq!(
            find(&conditions, ConditionType::Uploaded, "abc").status,
            ConditionStatus::Canceled
        );
        assert_eq!(
            find(&conditions, ConditionType::Checked, "def").status,
            ConditionStatus::False
        );
        assert_eq!(
            find(&conditions, ConditionType::Checked, "tag1").status,
            ConditionStatus::False
        );
    }

    #[test]
    fn test_revision_shared_with_tag_survives_branch_move() {
        let shared = |master: &str| -> DetectOutput {
            serde_json::from_value(json!({
                "branches": {"master": master},
                "tags": {"latest/hash": "abc"}
            }))
            .unwrap()
        };
        let mut conditions = Vec::new();
        apply_detect_output(&mut conditions, &policies(), &shared("abc"));
        apply_check_output(
            &mut conditions,
            &CheckDocument {
                revisions: vec![CheckRevision {
                    registry: "ghcr.io/org/app".into(),
                    resolved_revision: "abc".into(),
                    exist: Some(ConditionStatus::False),
                }],
            },
        );

        apply_detect_output(&mut conditions, &policies(), &shared("def"));
        apply_detect_output(&mut conditions, &policies(), &shared("def"));

        let checked = find(&conditions, ConditionType::Checked, "abc");
        assert_eq!(checked.status, ConditionStatus::True);
        assert_eq!(checked.tag_policy, TagPolicyType::TagHash);
        assert_eq!(
            find(&conditions, ConditionType::Uploaded, "abc").status,
            ConditionStatus::False
        );
        let tags: Vec<_> = upload_input("ghcr.io/org/app", &conditions)
            .builds
            .into_iter()
            .map(|b| b.tag)
            .collect();
        assert_eq!(tags, vec!["abc".to_string()]);
        assert_eq!(
            find(&conditions, ConditionType::Checked, "def").status,
            ConditionStatus::False
        );
    }

    #[test]
    fn test_check_round_trip_through_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::new(dir.path());
        let mut conditions = Vec::new();
        apply_detect_output(&mut conditions, &policies()[..1], &detect_output("abc"));

        work_dir
            .write_input(&check_input("ghcr.io/org/app", &conditions))
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(work_dir.input_path()).unwrap()).unwrap();
        assert_eq!(
            raw,
            json!({"revisions": [{"registry": "ghcr.io/org/app", "resolved_revision": "abc"}]})
        );
        assert!(!work_dir.has_output());

        fs::write(
            work_dir.output_path(),
            json!({"revisions": [{
                "registry": "ghcr.io/org/app",
                "resolved_revision": "abc",
                "exist": "True"
            }]})
            .to_string(),
        )
        .unwrap();
        let output: CheckOutput = work_dir.read_output().unwrap();
        assert!(apply_check_output(&mut conditions, &output));
        assert_eq!(
            find(&conditions, ConditionType::Checked, "abc").status,
            ConditionStatus::True
        );
        let uploaded = find(&conditions, ConditionType::Uploaded, "abc");
        assert_eq!(uploaded.status, ConditionStatus::True);
        assert_eq!(uploaded.revision, "master");
        assert!(upload_input("ghcr.io/org/app", &conditions).builds.is_empty());
    }

    #[test]
    fn test_check_unknown_keeps_upload_unqueued() {
        let mut conditions = Vec::new();
        apply_detect_output(&mut conditions, &policies()[..1], &detect_output("abc"));
        let output = CheckDocument {
            revisions: vec![CheckRevision {
                registry: "ghcr.io/org/app".into(),
                resolved_revision: "abc".into(),
                exist: Some(ConditionStatus::Unknown),
            }],
        };
        assert!(apply_check_output(&mut conditions, &output));
        assert_eq!(
            find(&conditions, ConditionType::Checked, "abc").status,
            ConditionStatus::Unknown
        );
        assert!(get_condition(&conditions, ConditionType::Uploaded).is_empty());
        assert!(!apply_check_output(&mut conditions, &output));
    }

    #[test]
    fn test_upload_output() {
        let mut conditions = vec![
            ImageCondition {
                type_: ConditionType::Uploaded,
                status: ConditionStatus::False,
                tag_policy: TagPolicyType::Unused,
                revision: "master".into(),
                resolved_revision: "abc".into(),
                last_transition_time: None,
            },
            ImageCondition {
                type_: ConditionType::Uploaded,
                status: ConditionStatus::Canceled,
                tag_policy: TagPolicyType::Unused,
                revision: "master".into(),
                resolved_revision: "old".into(),
                last_transition_time: None,
            },
        ];
        let input = upload_input("ghcr.io/org/app", &conditions);
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({"builds": [{"target": "ghcr.io/org/app", "tag": "abc"}]})
        );

        let output: UploadOutput = serde_json::from_str(
            r#"{"builds":[{"target":"ghcr.io/org/app","tag":"abc","succeeded":"failed"}]}"#,
        )
        .unwrap();
        assert!(apply_upload_output(&mut conditions, &output));
        assert_eq!(conditions[0].status, ConditionStatus::Failed);
        assert_eq!(conditions[0].revision, "master");
    }
}
