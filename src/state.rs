use crate::cluster::KubeCluster;
use crate::config::Config;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Config,
    pub(crate) cluster: KubeCluster,
}

impl ControllerContext {
    pub fn new(kube_client: kube::Client, config: Config) -> Self {
        let cluster = KubeCluster::new(kube_client.clone(), config.settings.clone());
        ControllerContext {
            kube_client,
            config,
            cluster,
        }
    }
}

/// Flipped once the controller is running; read by the readiness probe.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
