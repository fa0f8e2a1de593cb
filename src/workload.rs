use crate::config::Settings;
use crate::error::{Error, Result};
use crate::image_reference::TargetReference;
use crate::resources::image::{ConditionType, Image, ImageCondition, ImageTarget, TagPolicyType};
use crate::resources::imageflowtemplate::{ImageFlowTemplate, PhaseTemplate};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Secret,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const LABEL_IMAGE: &str = "build.takutakahashi.dev/image";
pub const LABEL_IMAGE_NAMESPACE: &str = "build.takutakahashi.dev/image-namespace";

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
const WORK_DIR_VOLUME: &str = "tmpdir";
const ACTOR_CONTAINER: &str = "main";
// Job names end up in the job-name label, which is limited to 63 characters.
const MAX_NAME_LEN: usize = 63;
const HASH_LEN: usize = 7;

/// Gathered secrets keyed `repository/<name>` or `targets/<name>`.
pub type Secrets = BTreeMap<String, Secret>;

pub fn repository_secret_key(secret_name: &str) -> String {
    format!("repository/{secret_name}")
}

pub fn target_secret_key(secret_name: &str) -> String {
    format!("targets/{secret_name}")
}

pub fn detect_deployment_name(image_name: &str) -> String {
    format!("{image_name}-detect")
}

/// Name of the Job working on a condition.
///
/// The suffix is the first 7 hex characters of
/// `sha256("{tagPolicy}-{revision}-{resolvedRevision}")`, so the same work
/// item always maps to the same Job. Uniqueness is probabilistic: two work
/// items colliding on the suffix share one Job name and the older Job is
/// replaced.
pub fn gen_name(image_name: &str, cond: &ImageCondition) -> String {
    let digest = Sha256::digest(
        format!(
            "{}-{}-{}",
            cond.tag_policy, cond.revision, cond.resolved_revision
        )
        .as_bytes(),
    );
    let hash = hex::encode(digest);
    let phase = cond.type_.phase();
    let max_prefix = MAX_NAME_LEN - phase.len() - HASH_LEN - 2;
    let prefix = if image_name.len() > max_prefix {
        image_name[..max_prefix].trim_end_matches(['-', '.'])
    } else {
        image_name
    };
    format!("{}-{}-{}", prefix, phase, &hash[..HASH_LEN])
}

/// Labels used to select children and to map them back to their Image.
pub fn controller_labels(image: &Image) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_IMAGE.to_string(), image.name_any()),
        (
            LABEL_IMAGE_NAMESPACE.to_string(),
            image.namespace().unwrap_or_default(),
        ),
    ])
}

fn labels(image: &Image) -> BTreeMap<String, String> {
    let mut labels = image.labels().clone();
    labels.extend(controller_labels(image));
    labels
}

fn annotations(image: &Image) -> Option<BTreeMap<String, String>> {
    let annotations: BTreeMap<String, String> = image
        .annotations()
        .iter()
        .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!annotations.is_empty()).then_some(annotations)
}

fn metadata(image: &Image, name: String, settings: &Settings) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(settings.workload_namespace.clone()),
        labels: Some(labels(image)),
        annotations: annotations(image),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Actor container for one phase: the template's base container plus the
/// operator's env, role argument and the shared work directory.
fn actor_container(
    image: &Image,
    phase: &PhaseTemplate,
    role: &str,
    phase_env: Vec<EnvVar>,
    settings: &Settings,
) -> Container {
    let actor = &phase.actor;
    let mut env_vars = actor.env.clone();
    env_vars.push(env("IMAGE_NAME", image.name_any()));
    env_vars.push(env("IMAGE_NAMESPACE", image.namespace().unwrap_or_default()));
    env_vars.push(env("WORK_DIR", settings.actor_work_dir.clone()));
    env_vars.extend(phase_env);
    env_vars.extend(image.spec.env.iter().cloned());

    let mut volume_mounts = actor.volume_mounts.clone();
    volume_mounts.push(VolumeMount {
        name: WORK_DIR_VOLUME.to_string(),
        mount_path: settings.actor_work_dir.clone(),
        ..Default::default()
    });

    Container {
        name: ACTOR_CONTAINER.to_string(),
        image: actor.image.clone(),
        image_pull_policy: actor.image_pull_policy.clone(),
        command: actor.command.clone(),
        args: Some(vec![role.to_string()]),
        env: Some(env_vars),
        volume_mounts: Some(volume_mounts),
        resources: actor.resources.clone(),
        ..Default::default()
    }
}

fn validate_required_env(role: &str, phase: &PhaseTemplate, container: &Container) -> Result<()> {
    let present = container.env.as_deref().unwrap_or_default();
    for required in &phase.required_env {
        if !present.iter().any(|e| &e.name == required) {
            return Err(Error::configuration(format!(
                "{role} actor requires env {required}, which is not set"
            )));
        }
    }
    Ok(())
}

fn pod_spec(
    phase: &PhaseTemplate,
    container: Container,
    restart_policy: Option<&str>,
    settings: &Settings,
) -> PodSpec {
    let mut volumes = vec![Volume {
        name: WORK_DIR_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    volumes.extend(phase.volumes.iter().cloned());
    PodSpec {
        service_account_name: Some(settings.service_account_name.clone()),
        restart_policy: restart_policy.map(str::to_string),
        volumes: Some(volumes),
        containers: vec![container],
        ..Default::default()
    }
}

/// The single push target; more than one is rejected.
pub fn single_target(image: &Image) -> Result<&ImageTarget> {
    match image.spec.targets.as_slice() {
        [target] => Ok(target),
        [] => Err(Error::configuration("no target is configured")),
        _ => Err(Error::configuration("multiple targets is not supported now")),
    }
}

fn registry_env(target: &ImageTarget, secrets: &Secrets) -> Result<Vec<EnvVar>> {
    let reference = TargetReference::parse(&target.name).map_err(|e| {
        Error::configuration(format!("invalid target {}: {}", target.name, e))
    })?;
    let mut env_vars = vec![env("REGISTRY_IMAGE_NAME", reference.to_string())];
    if let Some(auth) = target.auth.as_ref().filter(|a| !a.secret_name.is_empty()) {
        let secret = secrets
            .get(&target_secret_key(&auth.secret_name))
            .ok_or_else(|| Error::MissingDependency {
                kind: "Secret",
                namespace: String::new(),
                name: auth.secret_name.clone(),
            })?;
        for key in ["username", "password"] {
            if !secret_has_key(secret, key) {
                return Err(Error::configuration(format!(
                    "secret {} has no {key} key",
                    auth.secret_name
                )));
            }
        }
        env_vars.push(secret_env("REGISTRY_AUTH_USERNAME", &auth.secret_name, "username"));
        env_vars.push(secret_env("REGISTRY_AUTH_PASSWORD", &auth.secret_name, "password"));
    }
    Ok(env_vars)
}

fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
        || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
}

pub fn detect_deployment(
    image: &Image,
    template: &ImageFlowTemplate,
    secrets: &Secrets,
    settings: &Settings,
) -> Result<Deployment> {
    let policies = &image.spec.repository.tag_policies;
    let revisions_of = |policy: TagPolicyType| {
        policies
            .iter()
            .filter(|p| p.policy == policy)
            .map(|p| p.revision.as_str())
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut phase_env = vec![
        env("TARGET_BRANCHES", revisions_of(TagPolicyType::BranchHash)),
        env("TARGET_TAGS", revisions_of(TagPolicyType::TagHash)),
        env("REPOSITORY_URL", image.spec.repository.url.clone()),
    ];
    if let Some(auth) = &image.spec.repository.auth
        && secrets.contains_key(&repository_secret_key(&auth.secret_name))
    {
        phase_env.push(secret_env("REPOSITORY_AUTH_USERNAME", &auth.secret_name, "username"));
        phase_env.push(secret_env("REPOSITORY_AUTH_PASSWORD", &auth.secret_name, "password"));
    }

    let phase = &template.spec.detect;
    let container = actor_container(image, phase, "detect", phase_env, settings);
    validate_required_env("detect", phase, &container)?;

    Ok(Deployment {
        metadata: metadata(image, detect_deployment_name(&image.name_any()), settings),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(controller_labels(image)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(image)),
                    ..Default::default()
                }),
                spec: Some(pod_spec(phase, container, None, settings)),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn check_job(
    image: &Image,
    template: &ImageFlowTemplate,
    secrets: &Secrets,
    cond: &ImageCondition,
    settings: &Settings,
) -> Result<Job> {
    phase_job(image, &template.spec.check, secrets, cond, settings)
}

pub fn upload_job(
    image: &Image,
    template: &ImageFlowTemplate,
    secrets: &Secrets,
    cond: &ImageCondition,
    settings: &Settings,
) -> Result<Job> {
    phase_job(image, &template.spec.upload, secrets, cond, settings)
}

fn phase_job(
    image: &Image,
    phase: &PhaseTemplate,
    secrets: &Secrets,
    cond: &ImageCondition,
    settings: &Settings,
) -> Result<Job> {
    let role = match cond.type_ {
        ConditionType::Checked => "check",
        ConditionType::Uploaded => "upload",
        ConditionType::Detected => {
            return Err(Error::configuration("detect runs as a Deployment, not a Job"));
        }
    };
    let target = single_target(image)?;
    let mut phase_env = vec![env("RESOLVED_REVISION", cond.resolved_revision.clone())];
    phase_env.extend(registry_env(target, secrets)?);

    let container = actor_container(image, phase, role, phase_env, settings);
    validate_required_env(role, phase, &container)?;

    Ok(Job {
        metadata: metadata(image, gen_name(&image.name_any(), cond), settings),
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(settings.job_ttl_seconds_after_finished),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(image)),
                    ..Default::default()
                }),
                spec: Some(pod_spec(phase, container, Some("OnFailure"), settings)),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
