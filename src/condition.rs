use crate::resources::image::{ConditionStatus, ConditionType, ImageCondition, TagPolicyType};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// How a declared-identity condition should move when a new report arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No explicit status: a changed resolved revision means something new was
    /// detected (`True`), an unchanged one means it was already seen (`False`).
    ObserveRevision,
    /// Explicit status; fields only move when they actually differ.
    SetStatus(ConditionStatus),
}

pub fn get_condition(
    conditions: &[ImageCondition],
    type_: ConditionType,
) -> Vec<&ImageCondition> {
    conditions.iter().filter(|c| c.type_ == type_).collect()
}

pub fn get_condition_by_status(
    conditions: &[ImageCondition],
    type_: ConditionType,
    status: ConditionStatus,
) -> Vec<&ImageCondition> {
    get_condition(conditions, type_)
        .into_iter()
        .filter(|c| c.status == status)
        .collect()
}

/// Looks up a condition by its declared identity `(type, revision, tagPolicy)`.
pub fn get_condition_by<'a>(
    conditions: &'a [ImageCondition],
    type_: ConditionType,
    tag_policy: TagPolicyType,
    revision: &str,
) -> Option<&'a ImageCondition> {
    conditions
        .iter()
        .find(|c| c.type_ == type_ && c.revision == revision && c.tag_policy == tag_policy)
}

/// Looks up a condition by its resolved identity `(type, resolvedRevision)`.
pub fn get_condition_by_resolved_revision<'a>(
    conditions: &'a [ImageCondition],
    type_: ConditionType,
    resolved_revision: &str,
) -> Option<&'a ImageCondition> {
    conditions
        .iter()
        .find(|c| c.type_ == type_ && c.resolved_revision == resolved_revision)
}

/// Overwrites the condition with the same `(type, revision, tagPolicy)` or appends it.
pub fn set_condition(conditions: &mut Vec<ImageCondition>, condition: ImageCondition) {
    match conditions.iter_mut().find(|c| {
        c.type_ == condition.type_
            && c.revision == condition.revision
            && c.tag_policy == condition.tag_policy
    }) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Overwrites the condition with the same `(type, resolvedRevision)` or appends it.
pub fn set_resolved_condition(conditions: &mut Vec<ImageCondition>, condition: ImageCondition) {
    match conditions.iter_mut().find(|c| {
        c.type_ == condition.type_ && c.resolved_revision == condition.resolved_revision
    }) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Records a revision signal for a declared `(tagPolicy, revision)`.
pub fn observe_revision(
    conditions: &mut Vec<ImageCondition>,
    type_: ConditionType,
    tag_policy: TagPolicyType,
    revision: &str,
    resolved_revision: &str,
) {
    update_condition(
        conditions,
        type_,
        Transition::ObserveRevision,
        tag_policy,
        revision,
        resolved_revision,
    )
}

/// Records an explicit phase status for a declared `(tagPolicy, revision)`.
pub fn set_phase_status(
    conditions: &mut Vec<ImageCondition>,
    type_: ConditionType,
    status: ConditionStatus,
    tag_policy: TagPolicyType,
    revision: &str,
    resolved_revision: &str,
) {
    update_condition(
        conditions,
        type_,
        Transition::SetStatus(status),
        tag_policy,
        revision,
        resolved_revision,
    )
}

pub fn update_condition(
    conditions: &mut Vec<ImageCondition>,
    type_: ConditionType,
    transition: Transition,
    tag_policy: TagPolicyType,
    revision: &str,
    resolved_revision: &str,
) {
    let now = Utc::now();
    let Some(mut cond) = get_condition_by(conditions, type_, tag_policy, revision).cloned() else {
        let status = match transition {
            Transition::ObserveRevision => ConditionStatus::Unknown,
            Transition::SetStatus(status) => status,
        };
        debug!(%type_, %tag_policy, revision, resolved_revision, %status, "adding condition");
        set_condition(
            conditions,
            ImageCondition {
                type_,
                status,
                tag_policy,
                revision: revision.to_string(),
                resolved_revision: resolved_revision.to_string(),
                last_transition_time: Some(now),
            },
        );
        return;
    };

    match transition {
        Transition::ObserveRevision => {
            if cond.resolved_revision != resolved_revision {
                cond.status = ConditionStatus::True;
                cond.resolved_revision = resolved_revision.to_string();
            } else {
                cond.status = ConditionStatus::False;
            }
            cond.last_transition_time = Some(now);
        }
        Transition::SetStatus(status) => {
            if cond.resolved_revision != resolved_revision {
                cond.resolved_revision = resolved_revision.to_string();
                cond.last_transition_time = Some(now);
            }
            if cond.status != status {
                cond.status = status;
                cond.last_transition_time = Some(now);
            }
        }
    }
    set_condition(conditions, cond);
}

/// Records a check result against a concrete revision.
///
/// An existing Checked condition keeps its provenance; a new one is appended
/// with `tagPolicy: unused`. Returns whether anything changed.
pub fn update_checked_condition(
    conditions: &mut Vec<ImageCondition>,
    status: ConditionStatus,
    revision: &str,
    resolved_revision: &str,
) -> bool {
    update_resolved(
        conditions,
        ConditionType::Checked,
        status,
        revision,
        resolved_revision,
    )
}

/// Records an upload result against a concrete revision. Same rules as
/// [`update_checked_condition`].
pub fn update_uploaded_condition(
    conditions: &mut Vec<ImageCondition>,
    status: ConditionStatus,
    revision: &str,
    resolved_revision: &str,
) -> bool {
    update_resolved(
        conditions,
        ConditionType::Uploaded,
        status,
        revision,
        resolved_revision,
    )
}

fn update_resolved(
    conditions: &mut Vec<ImageCondition>,
    type_: ConditionType,
    status: ConditionStatus,
    revision: &str,
    resolved_revision: &str,
) -> bool {
    if resolved_revision.is_empty() {
        debug!(%type_, "ignoring report without resolved revision");
        return false;
    }
    let now = Utc::now();
    let cond = match get_condition_by_resolved_revision(conditions, type_, resolved_revision) {
        Some(existing) => {
            let mut cond = existing.clone();
            if cond.revision.is_empty() && !revision.is_empty() {
                cond.revision = revision.to_string();
            }
            if cond.status != status {
                cond.status = status;
                cond.last_transition_time = Some(now);
            }
            if &cond == existing {
                return false;
            }
            cond
        }
        None => ImageCondition {
            type_,
            status,
            tag_policy: TagPolicyType::Unused,
            revision: revision.to_string(),
            resolved_revision: resolved_revision.to_string(),
            last_transition_time: Some(now),
        },
    };
    set_resolved_condition(conditions, cond);
    true
}

/// Queues a check for a freshly detected revision, carrying the declared
/// policy that produced it. A revision that is already tracked is only
/// re-queued when its previous check was canceled.
pub fn queue_check(
    conditions: &mut Vec<ImageCondition>,
    tag_policy: TagPolicyType,
    revision: &str,
    resolved_revision: &str,
) {
    if resolved_revision.is_empty() {
        return;
    }
    let cond = match get_condition_by_resolved_revision(
        conditions,
        ConditionType::Checked,
        resolved_revision,
    ) {
        Some(existing) if existing.status != ConditionStatus::Canceled => return,
        Some(existing) => ImageCondition {
            status: ConditionStatus::False,
            last_transition_time: Some(Utc::now()),
            ..existing.clone()
        },
        None => ImageCondition {
            type_: ConditionType::Checked,
            status: ConditionStatus::False,
            tag_policy,
            revision: revision.to_string(),
            resolved_revision: resolved_revision.to_string(),
            last_transition_time: Some(Utc::now()),
        },
    };
    set_resolved_condition(conditions, cond);
}

/// Cancels superseded work for a declared `(tagPolicy, revision)`.
///
/// 1. every Checked condition with that tag policy and revision becomes Canceled
/// 2. every Uploaded condition with that revision becomes Canceled when a Checked
///    condition from the same policy resolved to the same revision and its
///    status was known
///
/// A resolved revision that another policy's Detected condition still points
/// at is not canceled. Its Checked and Uploaded conditions move over to that
/// policy instead.
pub fn mark_upload_condition_as_canceled(
    conditions: &mut [ImageCondition],
    tag_policy: TagPolicyType,
    revision: &str,
) {
    let superseded = |c: &ImageCondition| {
        c.type_ == ConditionType::Checked && c.tag_policy == tag_policy && c.revision == revision
    };
    let checked: HashSet<String> = conditions
        .iter()
        .filter(|c| superseded(*c) && c.status != ConditionStatus::Unknown)
        .map(|c| c.resolved_revision.clone())
        .collect();
    let owners: HashMap<String, (TagPolicyType, String)> = conditions
        .iter()
        .filter(|c| superseded(*c))
        .filter_map(|c| {
            let owner = conditions.iter().find(|d| {
                d.type_ == ConditionType::Detected
                    && d.resolved_revision == c.resolved_revision
                    && !(d.tag_policy == tag_policy && d.revision == revision)
            })?;
            Some((
                c.resolved_revision.clone(),
                (owner.tag_policy, owner.revision.clone()),
            ))
        })
        .collect();

    for cond in conditions.iter_mut() {
        let cancel = match cond.type_ {
            ConditionType::Checked => superseded(&*cond),
            ConditionType::Uploaded => {
                cond.revision == revision && checked.contains(&cond.resolved_revision)
            }
            ConditionType::Detected => false,
        };
        if !cancel {
            continue;
        }
        if let Some((owner_policy, owner_revision)) = owners.get(&cond.resolved_revision) {
            debug!(
                type_ = %cond.type_,
                resolved_revision = %cond.resolved_revision,
                tag_policy = %owner_policy,
                "revision still detected, keeping condition"
            );
            if cond.type_ == ConditionType::Checked {
                cond.tag_policy = *owner_policy;
            }
            cond.revision = owner_revision.clone();
        } else if cond.status != ConditionStatus::Canceled {
            debug!(
                type_ = %cond.type_,
                resolved_revision = %cond.resolved_revision,
                "canceling condition"
            );
            cond.status = ConditionStatus::Canceled;
            cond.last_transition_time = Some(Utc::now());
        }
    }
}

/// Whether two condition sets differ, ignoring transition timestamps.
pub fn status_changed(before: &[ImageCondition], after: &[ImageCondition]) -> bool {
    before.len() != after.len()
        || before.iter().zip(after).any(|(b, a)| {
            b.type_ != a.type_
                || b.status != a.status
                || b.tag_policy != a.tag_policy
                || b.revision != a.revision
                || b.resolved_revision != a.resolved_revision
        })
}
