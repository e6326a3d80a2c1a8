//! Wires a node together and serves it: storage, cluster, router, HTTP.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request};
use snafu::{ResultExt, Snafu};

use crate::auth::TokenAuth;
use crate::cluster::Cluster;
use crate::config::Config;
use crate::node::Node;
use crate::router::Router;

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("could not open node storage: {source}"))]
    Storage { source: std::io::Error },

    #[snafu(display("could not open the token secret: {source}"))]
    AuthSecret { source: std::io::Error },

    #[snafu(display("server error: {source}"))]
    Serve { source: hyper::Error },
}

/// Runs the node until ctrl-c.
pub async fn run(config: Config) -> Result<(), AppError> {
    let node = Node::new(&config.node_name, &config.data_dir).context(StorageSnafu)?;
    let cluster = Cluster::new(config.backups);
    cluster.host(Arc::clone(&node));
    cluster.set_nodes(config.nodes.clone());

    let auth = if config.auth {
        Some(Arc::new(
            TokenAuth::open(&config.data_dir, Duration::from_secs(config.token_ttl_secs))
                .context(AuthSecretSnafu)?,
        ))
    } else {
        None
    };
    let router = Router::new(cluster, &config.node_name, auth);

    let make_service = make_service_fn(move |_| {
        let router = Arc::clone(&router);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let router = Arc::clone(&router);
                async move {
                    let (parts, body) = req.into_parts();
                    let bytes = hyper::body::to_bytes(body).await?;
                    let response = router.route(Request::from_parts(parts, bytes)).await;
                    Ok::<_, hyper::Error>(response.map(Body::from))
                }
            }))
        }
    });

    let server = hyper::Server::try_bind(&config.listen)
        .context(ServeSnafu)?
        .serve(make_service);
    info!(
        message = "Node is serving.",
        node = %config.node_name,
        listen = %config.listen,
        members = config.nodes.len(),
        backups = config.backups,
    );

    server
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(message = "Shutting down.");
        })
        .await
        .context(ServeSnafu)
}
