use thiserror::Error;

/// Error kinds surfaced across the engine's processor chain.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("source error: {0}")]
    Source(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("bucket range error: table_size={table_size}, offending key={key}")]
    BucketRange { table_size: usize, key: String },

    #[error("splitter error: {0}")]
    Splitter(String),

    #[error("validation stage error: {0}")]
    Validation(String),

    #[error("worker failed: {source}")]
    Worker {
        #[source]
        source: anyhow::Error,
    },

    #[error("task failed: {0}")]
    Task(String),
}

impl EtlError {
    pub fn worker(source: impl Into<anyhow::Error>) -> Self {
        EtlError::Worker { source: source.into() }
    }
}
