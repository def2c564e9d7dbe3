use thiserror::Error;

/// Why a reconcile did not finish; the controller retries with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("failed to encode patch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("resources failed transiently: {}", .0.join("; "))]
    Transient(Vec<String>),

    #[error("{} resources could not be released", .0)]
    Cleanup(usize),

    #[error("failed to move {} nodes to generation {generation}", .nodes.len())]
    Push { generation: i64, nodes: Vec<String> },
}
