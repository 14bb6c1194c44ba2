use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub status: String,
    pub node: String,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct NodesResponse {
    pub nodes: Vec<NodeItem>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NodeItem {
    pub name: String,
    pub address: String,
    pub ready: bool,
    pub sort_by: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DatumsResponse {
    pub datums: Vec<DatumItem>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DatumItem {
    pub key: String,
    pub name: String,
    pub primary: Option<String>,
    pub nodes: Vec<String>,
}
