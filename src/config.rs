use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/oci-image-operator/config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default = "default_requeue_after_seconds")]
    pub requeue_after_seconds: u64,
    #[serde(flatten)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Webserver { port: 8081 }
    }
}

/// Everything the reconcile engine needs to render and apply child workloads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Namespace holding detect Deployments and check/upload Jobs
    #[serde(default = "default_workload_namespace")]
    pub workload_namespace: String,
    #[serde(default = "default_service_account_name")]
    pub service_account_name: String,
    /// Mount path of the directory shared between an actor and its sidecar
    #[serde(default = "default_actor_work_dir")]
    pub actor_work_dir: String,
    #[serde(default = "default_job_ttl_seconds_after_finished")]
    pub job_ttl_seconds_after_finished: i32,
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

fn default_requeue_after_seconds() -> u64 {
    30
}

fn default_workload_namespace() -> String {
    "oci-image-operator-system".to_string()
}

fn default_service_account_name() -> String {
    "oci-image-operator-controller-manager".to_string()
}

fn default_actor_work_dir() -> String {
    "/tmp/actor-base".to_string()
}

fn default_job_ttl_seconds_after_finished() -> i32 {
    86400
}

fn default_field_manager() -> String {
    "image-controller".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            workload_namespace: default_workload_namespace(),
            service_account_name: default_service_account_name(),
            actor_work_dir: default_actor_work_dir(),
            job_ttl_seconds_after_finished: default_job_ttl_seconds_after_finished(),
            field_manager: default_field_manager(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            webserver: Webserver::default(),
            requeue_after_seconds: default_requeue_after_seconds(),
            settings: Settings::default(),
        }
    }
}

impl Config {
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_seconds)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    if !path.as_ref().exists() {
        info!(
            "Config file {} not found, using defaults",
            path.as_ref().display()
        );
        return Ok(Config::default());
    }
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Fails on the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        anyhow::bail!("Missing environment variable: {}", var_name);
    }

    Ok(result.into_owned())
}
