use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Volume, VolumeMount};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// An ImageFlowTemplate supplies the actor containers for each phase of an Image.
// Example:
// apiVersion: build.takutakahashi.dev/v1beta1
// kind: ImageFlowTemplate
// metadata:
//   name: github
// spec:
//   detect:
//     actor:
//       image: ghcr.io/takutakahashi/oci-image-operator/actor-github:latest
//     requiredEnv: [GITHUB_ORG, GITHUB_REPO]
//   check:
//     actor:
//       image: ghcr.io/takutakahashi/oci-image-operator/actor-registryv2:latest
//   upload:
//     actor:
//       image: ghcr.io/takutakahashi/oci-image-operator/actor-github:latest

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "build.takutakahashi.dev",
    version = "v1beta1",
    kind = "ImageFlowTemplate",
    plural = "imageflowtemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImageFlowTemplateSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_image: String,
    #[serde(default)]
    pub detect: PhaseTemplate,
    #[serde(default)]
    pub check: PhaseTemplate,
    #[serde(default)]
    pub upload: PhaseTemplate,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTemplate {
    #[serde(default)]
    pub actor: ActorContainer,
    /// Volumes added to the actor pod next to the shared work directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Environment variable names the actor container must receive
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_env: Vec<String>,
}

/// Base container for an actor. Name, args and the work directory mount are
/// filled in by the operator.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActorContainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_from_yaml() {
        let yaml = r#"
        apiVersion: build.takutakahashi.dev/v1beta1
        kind: ImageFlowTemplate
        metadata:
          name: test
          namespace: default
        spec:
          detect:
            actor:
              image: ghcr.io/takutakahashi/actor-noop:latest
              env:
                - name: GITHUB_ORG
                  value: takutakahashi
            requiredEnv: [GITHUB_ORG]
          check:
            actor:
              image: ghcr.io/takutakahashi/actor-noop:latest
            volumes:
              - name: cache
                emptyDir: {}
        "#;
        let template: ImageFlowTemplate = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(template.spec.detect.required_env, vec!["GITHUB_ORG"]);
        assert_eq!(template.spec.detect.actor.env.len(), 1);
        assert_eq!(template.spec.check.volumes[0].name, "cache");
        assert_eq!(template.spec.upload, PhaseTemplate::default());
    }
}
