use crate::cluster::{Cluster, FINALIZER};
use crate::condition::status_changed;
use crate::config::Settings;
use crate::engine::{self, Ensure};
use crate::error::{Error, Result, ResultExt};
use crate::resources::image::{ANNOTATION_DEFAULT_TEMPLATE_ALL, Image};
use crate::resources::imageflowtemplate::ImageFlowTemplate;
use crate::state::{ControllerContext, Readiness};
use crate::workload::{
    LABEL_IMAGE, LABEL_IMAGE_NAMESPACE, Secrets, repository_secret_key, target_secret_key,
};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

pub async fn run(ctx: Arc<ControllerContext>, readiness: Readiness) -> anyhow::Result<()> {
    let client = ctx.kube_client.clone();
    let images = Api::<Image>::all(client.clone());
    if let Err(e) = images.list(&ListParams::default().limit(1)).await {
        anyhow::bail!("Image CRD is not queryable: {e}. Is the CRD installed?");
    }

    let namespace = &ctx.config.settings.workload_namespace;
    let jobs = Api::<Job>::namespaced(client.clone(), namespace);
    let deployments = Api::<Deployment>::namespaced(client, namespace);
    let children = watcher::Config::default().labels(LABEL_IMAGE);

    info!("Watching images, workloads in namespace {}", namespace);
    readiness.set_ready();
    Controller::new(images, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .watches(jobs, children.clone(), image_for_child::<Job>)
        .watches(deployments, children, image_for_child::<Deployment>)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((image, _)) => debug!(image = %image.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!("Controller stopped");
    Ok(())
}

/// Maps a detect Deployment or phase Job back to the Image that spawned it.
fn image_for_child<K: Resource>(child: K) -> Option<ObjectRef<Image>> {
    let labels = child.labels();
    let name = labels.get(LABEL_IMAGE)?;
    let namespace = labels.get(LABEL_IMAGE_NAMESPACE)?;
    Some(ObjectRef::new(name).within(namespace))
}

fn error_policy(image: Arc<Image>, error: &Error, ctx: Arc<ControllerContext>) -> Action {
    warn!(image = %image.name_any(), %error, "reconcile failed");
    requeue_action(error, ctx.config.requeue_after())
}

fn requeue_action(error: &Error, requeue_after: Duration) -> Action {
    if error.is_configuration() {
        Action::await_change()
    } else {
        Action::requeue(requeue_after)
    }
}

pub async fn reconcile(image: Arc<Image>, ctx: Arc<ControllerContext>) -> Result<Action> {
    reconcile_image(&ctx.cluster, &ctx.config.settings, &image).await
}

async fn reconcile_image<C: Cluster>(
    cluster: &C,
    settings: &Settings,
    image: &Image,
) -> Result<Action> {
    let name = image.name_any();
    let has_finalizer = image.finalizers().iter().any(|f| f == FINALIZER);

    if image.is_deleting() {
        if has_finalizer {
            engine::release(cluster, image).await?;
        }
        return Ok(Action::await_change());
    }
    if !has_finalizer {
        info!(image = %name, "adding finalizer");
        cluster
            .add_finalizer(image)
            .await
            .context("failed to add finalizer")?;
        // the finalizer patch bumps the resource version and triggers a new pass
        return Ok(Action::await_change());
    }

    let template = get_template(cluster, image).await?;
    let secrets = gather_secrets(cluster, image).await?;

    let mut updated = image.clone();
    Ensure {
        cluster,
        template: &template,
        secrets: &secrets,
        settings,
    }
    .ensure(&mut updated)
    .await?;

    if status_changed(image.conditions(), updated.conditions()) {
        cluster
            .patch_status(&updated)
            .await
            .context("failed to update image status")?;
    }
    Ok(Action::await_change())
}

fn template_name(image: &Image) -> Result<String> {
    if !image.spec.template_name.is_empty() {
        return Ok(image.spec.template_name.clone());
    }
    image
        .annotations()
        .get(ANNOTATION_DEFAULT_TEMPLATE_ALL)
        .filter(|name| !name.is_empty())
        .cloned()
        .ok_or_else(|| {
            Error::configuration(format!(
                "spec.templateName is empty and annotation \
                 {ANNOTATION_DEFAULT_TEMPLATE_ALL} is not set"
            ))
        })
}

async fn get_template<C: Cluster>(cluster: &C, image: &Image) -> Result<ImageFlowTemplate> {
    let namespace = image.namespace().unwrap_or_default();
    let name = template_name(image)?;
    cluster
        .get_template(&namespace, &name)
        .await?
        .ok_or(Error::MissingDependency {
            kind: "ImageFlowTemplate",
            namespace,
            name,
        })
}

/// Fetches the repository secret if it exists and every target secret.
async fn gather_secrets<C: Cluster>(cluster: &C, image: &Image) -> Result<Secrets> {
    let namespace = image.namespace().unwrap_or_default();
    let mut secrets = Secrets::new();

    if let Some(auth) = image
        .spec
        .repository
        .auth
        .as_ref()
        .filter(|a| !a.secret_name.is_empty())
    {
        match cluster.get_secret(&namespace, &auth.secret_name).await? {
            Some(secret) => {
                secrets.insert(repository_secret_key(&auth.secret_name), secret);
            }
            None => debug!(
                image = %image.name_any(),
                secret = %auth.secret_name,
                "repository secret not found"
            ),
        }
    }

    for auth in image
        .spec
        .targets
        .iter()
        .filter_map(|t| t.auth.as_ref())
        .filter(|a| !a.secret_name.is_empty())
    {
        let secret = cluster
            .get_secret(&namespace, &auth.secret_name)
            .await?
            .ok_or_else(|| Error::MissingDependency {
                kind: "Secret",
                namespace: namespace.clone(),
                name: auth.secret_name.clone(),
            })?;
        secrets.insert(target_secret_key(&auth.secret_name), secret);
    }
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeCluster, Op};
    use crate::resources::image::{
        ConditionStatus, ConditionType, ImageAuth, ImageCondition, TagPolicyType,
    };
    use crate::workload::tests::{new_image, new_template};
    use k8s_openapi::api::core::v1::Secret;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn finalized_image() -> Image {
        let mut image = new_image();
        image.metadata.finalizers = Some(vec![FINALIZER.into()]);
        image
    }

    fn cluster_with_template() -> FakeCluster {
        let cluster = FakeCluster::default();
        cluster.insert_template("default", new_template());
        cluster
    }

    fn secret(name: &str) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.into());
        secret
    }

    fn auth(secret_name: &str) -> Option<ImageAuth> {
        Some(ImageAuth {
            secret_name: secret_name.into(),
            ..Default::default()
        })
    }

    async fn reconcile_with(cluster: &FakeCluster, image: &Image) -> Result<Action> {
        reconcile_image(cluster, &Settings::default(), image).await
    }

    #[tokio::test]
    async fn test_adding_finalizer_ends_the_pass() {
        let cluster = cluster_with_template();
        let action = reconcile_with(&cluster, &new_image()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.ops(), vec![Op::AddFinalizer("test".into())]);
    }

    #[tokio::test]
    async fn test_deleting_image() {
        let cluster = FakeCluster::default();
        let mut image = new_image();
        image.metadata.deletion_timestamp =
            serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();

        reconcile_with(&cluster, &image).await.unwrap();
        assert!(cluster.ops().is_empty());

        image.metadata.finalizers = Some(vec![FINALIZER.into()]);
        reconcile_with(&cluster, &image).await.unwrap();
        assert_eq!(
            cluster.ops(),
            vec![
                Op::Delete("Deployment".into(), "test-detect".into()),
                Op::ClearFinalizers("test".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_status_patched_only_on_change() {
        let cluster = cluster_with_template();
        reconcile_with(&cluster, &finalized_image()).await.unwrap();
        assert_eq!(
            cluster.ops(),
            vec![
                Op::Apply("Deployment".into(), "test-detect".into()),
                Op::PatchStatus("test".into()),
            ]
        );

        let detected = |status, tag_policy, revision: &str, resolved: &str| ImageCondition {
            type_: ConditionType::Detected,
            status,
            tag_policy,
            revision: revision.into(),
            resolved_revision: resolved.into(),
            last_transition_time: None,
        };
        let mut image = finalized_image();
        *image.conditions_mut() = vec![
            detected(ConditionStatus::True, TagPolicyType::BranchHash, "master", "abc"),
            detected(ConditionStatus::False, TagPolicyType::TagHash, "v1", "tag1"),
        ];
        cluster.clear_ops();
        reconcile_with(&cluster, &image).await.unwrap();
        assert_eq!(
            cluster.ops(),
            vec![Op::Apply("Deployment".into(), "test-detect".into())]
        );
    }

    #[tokio::test]
    async fn test_missing_template() {
        let cluster = FakeCluster::default();
        let err = reconcile_with(&cluster, &finalized_image()).await.unwrap_err();
        assert!(matches!(
            &err,
            Error::MissingDependency { kind, name, .. }
                if *kind == "ImageFlowTemplate" && name == "test"
        ));
        assert!(cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn test_gather_secrets() {
        let cluster = FakeCluster::default();
        let mut image = new_image();
        image.spec.repository.auth = auth("repo-cred");
        image.spec.targets[0].auth = auth("regcred");

        // a missing repository secret is tolerated, a missing target secret is not
        let err = gather_secrets(&cluster, &image).await.unwrap_err();
        assert!(err.is_not_found());

        cluster.insert_secret("default", secret("regcred"));
        let secrets = gather_secrets(&cluster, &image).await.unwrap();
        assert_eq!(
            secrets.keys().collect::<Vec<_>>(),
            vec![&target_secret_key("regcred")]
        );

        cluster.insert_secret("default", secret("repo-cred"));
        cluster.insert_secret("other", secret("regcred"));
        let secrets = gather_secrets(&cluster, &image).await.unwrap();
        assert_eq!(secrets.len(), 2);
        assert!(secrets.contains_key(&repository_secret_key("repo-cred")));
    }

    #[test]
    fn test_template_name() {
        let mut image = new_image();
        assert_eq!(template_name(&image).unwrap(), "test");

        image.spec.template_name = String::new();
        assert!(template_name(&image).unwrap_err().is_configuration());

        image.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_DEFAULT_TEMPLATE_ALL.to_string(),
            "github".to_string(),
        )]));
        assert_eq!(template_name(&image).unwrap(), "github");
    }

    #[test]
    fn test_image_for_child() {
        let mut job = Job::default();
        assert!(image_for_child(job.clone()).is_none());

        job.metadata.labels = Some(BTreeMap::from([
            (LABEL_IMAGE.to_string(), "test".to_string()),
            (LABEL_IMAGE_NAMESPACE.to_string(), "default".to_string()),
        ]));
        let image_ref = image_for_child(job).unwrap();
        assert_eq!(image_ref.name, "test");
        assert_eq!(image_ref.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_requeue_action() {
        let requeue_after = Duration::from_secs(30);
        assert_eq!(
            requeue_action(
                &Error::configuration("multiple targets is not supported now"),
                requeue_after
            ),
            Action::await_change()
        );
        assert_eq!(
            requeue_action(&Error::JobStillRunning("test-check-1234567".into()), requeue_after),
            Action::requeue(requeue_after)
        );
    }
}
