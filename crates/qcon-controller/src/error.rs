use std::{io, path::PathBuf, time::Duration};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::testrun::TestRunError;

/// Failures while starting or stopping one emulator instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("failed to allocate a local port: {0}")]
    PortAllocation(#[source] io::Error),

    #[error("allocated port {0} is below the VNC display base")]
    DisplayOutOfRange(u16),

    #[error("failed to snapshot storage image {path}: {source}")]
    StorageImage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create companion scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("failed to spawn {process}: {source}")]
    Spawn {
        process: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to the emulator monitor: {0}")]
    Monitor(#[source] io::Error),

    #[error("emulator launch timed out: {0}")]
    LaunchTimeout(&'static str),

    #[error("failed to signal {process}: {source}")]
    Signal {
        process: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{process} did not exit within {budget:?}")]
    KillDeadline {
        process: &'static str,
        budget: Duration,
    },
}

/// Failures bringing the controller up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to configure upstream tunnels: {0}")]
    Relay(#[from] qcon_relay::RelayError),

    #[error("failed to build the callback HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Failures surfaced to callers of the control API.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid launch credential")]
    Unauthorized,

    #[error("emulator limit of {limit} reached")]
    AtCapacity { limit: usize },

    #[error("invalid {field}: {value:?}")]
    Validation { field: &'static str, value: String },

    #[error("unknown instance")]
    UnknownInstance,

    #[error("launch failed: {0}")]
    Launch(#[from] InstanceError),

    #[error(transparent)]
    TestRun(#[from] TestRunError),
}

impl ControllerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::AtCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::UnknownInstance => StatusCode::NOT_FOUND,
            Self::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TestRun(err) if err.is_bad_archive() => StatusCode::BAD_REQUEST,
            Self::TestRun(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
