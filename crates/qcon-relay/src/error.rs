use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream {url} unreachable: {source}")]
    UpstreamUnreachable {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("upstream {url} did not answer within {timeout:?}")]
    UpstreamTimeout { url: String, timeout: Duration },

    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    #[error("CA bundle {0} contains no certificates")]
    EmptyCaBundle(PathBuf),

    #[error("tls configuration: {0}")]
    Tls(#[from] rustls::Error),
}
