//! Direct message delivery over HTTP on the internal RPC port.

use super::{Connection, MessageTransport, Messenger};
use crate::error::{BatonError, Result};
use crate::node::NodeHandle;
use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes as BodyBytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const DELIVER_PATH: &str = "/internal/v1/cluster/message";

/// Dials the RPC port of a member at the member's gossip IP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    rpc_port: u16,
    http_client: Client,
}

impl HttpTransport {
    pub fn new(rpc_port: u16, dial_timeout: Duration, call_timeout: Duration) -> Result<Self> {
        Ok(Self {
            rpc_port,
            http_client: Client::builder()
                .connect_timeout(dial_timeout)
                .timeout(call_timeout)
                .build()?,
        })
    }

    fn build_url(addr: &SocketAddr, path: &str) -> String {
        format!("http://{}{}", addr, path)
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn connect(&self, node: &NodeHandle) -> Result<Arc<dyn Connection>> {
        let target = SocketAddr::new(node.addr.ip(), self.rpc_port);
        Ok(Arc::new(HttpConnection {
            http_client: self.http_client.clone(),
            url: Self::build_url(&target, DELIVER_PATH),
        }))
    }
}

struct HttpConnection {
    http_client: Client,
    url: String,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn deliver(&self, frame: Bytes) -> Result<()> {
        let response = self.http_client.post(&self.url).body(frame).send().await?;

        if !response.status().is_success() {
            return Err(BatonError::Transport(format!(
                "message endpoint {} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Routes serving inbound messages for `messenger`.
pub fn rpc_router(messenger: Arc<Messenger>) -> Router {
    Router::new()
        .route(DELIVER_PATH, post(deliver_message))
        .with_state(messenger)
}

/// Serves [`rpc_router`] on `listener` until the task is aborted.
pub async fn serve_rpc(listener: TcpListener, messenger: Arc<Messenger>) -> Result<()> {
    axum::serve(listener, rpc_router(messenger))
        .await
        .map_err(|error| BatonError::Transport(error.to_string()))
}

async fn deliver_message(State(messenger): State<Arc<Messenger>>, body: BodyBytes) -> Response {
    match messenger.deliver(&body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    }
}
