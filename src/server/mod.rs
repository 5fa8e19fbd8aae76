//! The cloud-side management server: watch scheduler, event fan-out, the
//! HTTP surface, and dataset compaction under one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use kube::Client;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::info;

use outpost_sync::storage::SledStorage;
use outpost_sync::Instance;

use crate::config::ServerConfig;
use crate::kubernetes::WatchScheduler;
use crate::nodeset::NodeSet;

mod authorize;
mod event;
mod gc;
mod handler;

pub use authorize::{AuthorizeError, ANNOTATION_CLUSTERROLE, ANNOTATION_ROLE};
pub use event::EventFanout;
pub use handler::{INSTANCE_HEADER, MANIFEST_HEADER, NODE_HEADER, STATE_HEADER};

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("failed to open storage: {source}"))]
    OpenStorage { source: outpost_sync::storage::Error },

    #[snafu(display("failed to build cluster client: {source}"))]
    ClusterClient { source: kube::Error },

    #[snafu(display("http server failed: {source}"))]
    Serve { source: hyper::Error },
}

/// Everything the HTTP handlers need.
pub struct ServerContext {
    pub instance: Arc<Instance>,
    pub node_set: Arc<NodeSet>,
    /// Absent in tests; authorisation resolution then fails cleanly.
    pub kube: Option<Client>,
    pub config: ServerConfig,
    pub instance_name: String,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("instance_name", &self.instance_name)
            .finish()
    }
}

/// Builds the `/api/v1` router over a prepared context.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/v1/manifest", get(handler::manifest))
        .route("/api/v1/data", get(handler::data))
        .with_state(ctx)
}

/// Runs the server until the token cancels.
pub async fn run(config: ServerConfig, token: CancellationToken) -> Result<(), ServerError> {
    let storage = SledStorage::open(&config.storage).context(OpenStorageSnafu)?;
    let instance_name = config.instance_name();
    let instance = Arc::new(Instance::new(instance_name.clone(), Arc::new(storage)));
    let node_set = Arc::new(NodeSet::new());

    let kube = Client::try_default().await.context(ClusterClientSnafu)?;
    let fanout = Arc::new(EventFanout::new(
        Arc::clone(&instance),
        Arc::clone(&node_set),
    ));
    let scheduler = WatchScheduler::new(kube.clone(), fanout, config.sched_interval());

    let gc_task = tokio::spawn(gc::run(
        instance.data_set(),
        config.gc_interval(),
        token.clone(),
    ));
    let sched_token = token.clone();
    let sched_task = tokio::spawn(async move { scheduler.run(sched_token).await });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let ctx = Arc::new(ServerContext {
        instance,
        node_set,
        kube: Some(kube),
        config: config.clone(),
        instance_name,
    });
    info!(message = "Server listening.", %addr, instance = %ctx.instance_name);

    // Streaming responses must never be cut by a write deadline, so the
    // server keeps hyper's defaults (no timeouts) everywhere.
    let serve = axum::Server::bind(&addr)
        .serve(router(ctx).into_make_service())
        .with_graceful_shutdown(token.clone().cancelled_owned());
    let result = serve.await.context(ServeSnafu);

    // Tear the background tasks down with the server itself.
    token.cancel();
    let _ = tokio::join!(gc_task, sched_task);
    result
}
