use crate::apply::ChildWorkload;
use crate::config::Settings;
use crate::error::Result;
use crate::resources::image::Image;
use crate::resources::imageflowtemplate::ImageFlowTemplate;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::future::Future;
use tracing::debug;

pub const FINALIZER: &str = "build.takutakahashi.dev/image";

/// Operations the reconcile engine performs against the cluster.
///
/// Child workloads are addressed by name inside the workload namespace.
pub trait Cluster: Send + Sync {
    fn get<K: ChildWorkload>(&self, name: &str) -> impl Future<Output = Result<Option<K>>> + Send;

    /// Server-side apply with forced ownership.
    fn apply<K: ChildWorkload>(&self, obj: &K) -> impl Future<Output = Result<()>> + Send;

    /// Returns false when the object did not exist.
    fn delete<K: ChildWorkload>(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    fn add_finalizer(&self, image: &Image) -> impl Future<Output = Result<()>> + Send;

    fn clear_finalizers(&self, image: &Image) -> impl Future<Output = Result<()>> + Send;

    fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<ImageFlowTemplate>>> + Send;

    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Secret>>> + Send;

    /// Writes the conditions back, guarded by the Image's resource version.
    fn patch_status(&self, image: &Image) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    settings: Settings,
}

impl KubeCluster {
    pub fn new(client: Client, settings: Settings) -> Self {
        KubeCluster { client, settings }
    }

    fn api<K: ChildWorkload>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.settings.workload_namespace)
    }

    fn images(&self, image: &Image) -> Api<Image> {
        Api::namespaced(
            self.client.clone(),
            &image.namespace().unwrap_or_default(),
        )
    }
}

impl Cluster for KubeCluster {
    async fn get<K: ChildWorkload>(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>().get_opt(name).await?)
    }

    async fn apply<K: ChildWorkload>(&self, obj: &K) -> Result<()> {
        let name = obj.name_any();
        debug!("Applying {} {}", K::kind_name(), name);
        self.api::<K>()
            .patch(
                &name,
                &PatchParams::apply(&self.settings.field_manager).force(),
                &Patch::Apply(obj),
            )
            .await?;
        Ok(())
    }

    async fn delete<K: ChildWorkload>(&self, name: &str) -> Result<bool> {
        debug!("Deleting {} {}", K::kind_name(), name);
        match self
            .api::<K>()
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(&self, image: &Image) -> Result<()> {
        let mut finalizers = image.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.images(image)
            .patch(&image.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn clear_finalizers(&self, image: &Image) -> Result<()> {
        let patch = json!({ "metadata": { "finalizers": null } });
        match self
            .images(image)
            .patch(&image.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ImageFlowTemplate>> {
        let templates: Api<ImageFlowTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(templates.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    async fn patch_status(&self, image: &Image) -> Result<()> {
        let patch = json!({
            "metadata": { "resourceVersion": image.resource_version() },
            "status": image.status,
        });
        debug!("Patching status of image {}", image.name_any());
        self.images(image)
            .patch_status(&image.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use fake::{FakeCluster, Op};
