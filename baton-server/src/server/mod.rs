mod types;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use baton_core::{BatonError, Cluster, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use types::{DatumItem, DatumsResponse, HealthResponse, NodeItem, NodesResponse};

pub(crate) fn status_router(cluster: Arc<Cluster>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/nodes", get(v1_nodes))
        .route("/api/v1/datums", get(v1_datums))
        .with_state(cluster)
}

pub async fn run_status_server(addr: String, cluster: Arc<Cluster>) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Status server listening on {}", addr);

    axum::serve(listener, status_router(cluster))
        .await
        .map_err(|error| BatonError::Transport(error.to_string()))
}

async fn health(State(cluster): State<Arc<Cluster>>) -> impl IntoResponse {
    let local = cluster.local_node().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        node: local.name().to_string(),
        ready: local.is_ready(),
    })
}

async fn v1_nodes(State(cluster): State<Arc<Cluster>>) -> impl IntoResponse {
    let nodes = cluster
        .members()
        .await
        .into_iter()
        .map(|node| NodeItem {
            name: node.name().to_string(),
            address: node.addr().to_string(),
            ready: node.is_ready(),
            sort_by: node.meta().ok().map(|meta| meta.sort_by),
        })
        .collect();

    Json(NodesResponse { nodes })
}

async fn v1_datums(State(cluster): State<Arc<Cluster>>) -> impl IntoResponse {
    let datums = cluster
        .assignments()
        .await
        .into_iter()
        .map(|assignment| DatumItem {
            primary: assignment.primary().map(|node| node.name().to_string()),
            nodes: assignment
                .nodes
                .iter()
                .map(|node| node.name().to_string())
                .collect(),
            key: assignment.key,
            name: assignment.name,
        })
        .collect();

    Json(DatumsResponse { datums })
}
