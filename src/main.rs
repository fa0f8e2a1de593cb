use oci_image_operator::config::{DEFAULT_CONFIG_PATH, load_config};
use oci_image_operator::controller;
use oci_image_operator::state::{ControllerContext, Readiness};
use oci_image_operator::webserver;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting oci-image-operator {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path)?;

    info!("Initializing K8s controller");
    let client = controller::create_client().await?;
    let port = config.webserver.port;
    let ctx = Arc::new(ControllerContext::new(client, config));
    let readiness = Readiness::default();
    let shutdown = CancellationToken::new();

    let app = webserver::create_app(readiness.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    let result = controller::run(ctx, readiness).await;
    if let Err(e) = &result {
        error!("Controller exited with error: {:?}", e);
    }
    shutdown.cancel();
    server.await??;

    result
}
