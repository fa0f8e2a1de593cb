use crate::apply::{apply_deployment, apply_job};
use crate::cluster::Cluster;
use crate::condition::{get_condition_by, get_condition_by_status, observe_revision, status_changed};
use crate::config::Settings;
use crate::error::{Result, ResultExt};
use crate::resources::image::{ConditionStatus, ConditionType, Image, ImageCondition, TagPolicyType};
use crate::resources::imageflowtemplate::ImageFlowTemplate;
use crate::workload::{self, Secrets, gen_name};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{debug, info};

/// Everything a single `ensure` pass works with.
pub struct Ensure<'a, C> {
    pub cluster: &'a C,
    pub template: &'a ImageFlowTemplate,
    pub secrets: &'a Secrets,
    pub settings: &'a Settings,
}

impl<C: Cluster> Ensure<'_, C> {
    /// Drives the Image one step through detect, check and upload.
    ///
    /// Stops after the first phase that changes the status; the status
    /// update triggers the next reconcile. Status changes are made on
    /// `image` and persisted by the caller.
    pub async fn ensure(&self, image: &mut Image) -> Result<()> {
        self.cancel_jobs(image).await?;

        let before = image.conditions().to_vec();
        self.ensure_detect(image).await?;
        if image.is_deleting() || status_changed(&before, image.conditions()) {
            return Ok(());
        }

        self.ensure_check(image).await?;
        if status_changed(&before, image.conditions()) {
            return Ok(());
        }

        self.ensure_upload(image).await
    }

    /// Deletes the Jobs of every canceled condition, then drops those
    /// conditions so the next pass does not delete them again.
    async fn cancel_jobs(&self, image: &mut Image) -> Result<()> {
        let name = image.name_any();
        let reapable = |c: &ImageCondition| {
            c.status == ConditionStatus::Canceled && c.type_ != ConditionType::Detected
        };
        for cond in image.conditions().iter().filter(|c| reapable(c)) {
            let job_name = gen_name(&name, cond);
            if self
                .cluster
                .delete::<Job>(&job_name)
                .await
                .context("failed to delete canceled job")?
            {
                info!(
                    image = %name,
                    job = %job_name,
                    resolved_revision = %cond.resolved_revision,
                    "deleted canceled job"
                );
            }
        }
        image.conditions_mut().retain(|c| !reapable(c));
        Ok(())
    }

    pub async fn ensure_detect(&self, image: &mut Image) -> Result<()> {
        let name = image.name_any();
        if image.is_deleting() {
            return release(self.cluster, image).await;
        }

        let policies = image.spec.repository.tag_policies.clone();
        for policy in policies.iter().filter(|p| p.policy != TagPolicyType::Unused) {
            if get_condition_by(
                image.conditions(),
                ConditionType::Detected,
                policy.policy,
                &policy.revision,
            )
            .is_none()
            {
                debug!(
                    image = %name,
                    tag_policy = %policy.policy,
                    revision = %policy.revision,
                    "seeding detected condition"
                );
                observe_revision(
                    image.conditions_mut(),
                    ConditionType::Detected,
                    policy.policy,
                    &policy.revision,
                    "",
                );
            }
        }

        let deployment =
            workload::detect_deployment(image, self.template, self.secrets, self.settings)
                .context("failed to build deployment")?;
        apply_deployment(self.cluster, &deployment)
            .await
            .context("failed to apply deployment")?;
        Ok(())
    }

    pub async fn ensure_check(&self, image: &Image) -> Result<()> {
        for cond in pending(image, ConditionType::Checked) {
            let job = workload::check_job(image, self.template, self.secrets, &cond, self.settings)
                .context("failed to build job")?;
            if apply_job(self.cluster, &job)
                .await
                .context("failed to apply job")?
            {
                info!(
                    image = %image.name_any(),
                    job = %job.name_any(),
                    resolved_revision = %cond.resolved_revision,
                    "check job applied"
                );
            }
        }
        Ok(())
    }

    pub async fn ensure_upload(&self, image: &Image) -> Result<()> {
        for cond in pending(image, ConditionType::Uploaded) {
            let job = workload::upload_job(image, self.template, self.secrets, &cond, self.settings)
                .context("failed to build job")?;
            if apply_job(self.cluster, &job)
                .await
                .context("failed to apply job")?
            {
                info!(
                    image = %image.name_any(),
                    job = %job.name_any(),
                    tag = %cond.resolved_revision,
                    "upload job applied"
                );
            }
        }
        Ok(())
    }
}

/// Tears down the detect Deployment of a deleted Image and drops its finalizers.
pub async fn release<C: Cluster>(cluster: &C, image: &Image) -> Result<()> {
    let name = image.name_any();
    cluster
        .delete::<Deployment>(&workload::detect_deployment_name(&name))
        .await
        .context("failed to delete detect deployment")?;
    cluster.clear_finalizers(image).await?;
    info!(image = %name, "released image");
    Ok(())
}

/// Conditions of a phase whose work has not been confirmed yet.
fn pending(image: &Image, type_: ConditionType) -> Vec<ImageCondition> {
    get_condition_by_status(image.conditions(), type_, ConditionStatus::False)
        .into_iter()
        .cloned()
        .collect()
}
