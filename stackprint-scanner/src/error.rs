use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("TLS configuration failed: {0}")]
    TlsError(#[from] rustls::Error),

    #[error("{url} responded with {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Failures while loading the technology signature database.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Failed to read signature file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed signature data: {0}")]
    Json(#[from] serde_json::Error),
}
