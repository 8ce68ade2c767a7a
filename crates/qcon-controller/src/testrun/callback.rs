use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use reqwest::multipart::{Form, Part};
use thiserror::Error;

use super::TestOutcome;
use crate::platform::Platform;

/// Where a finished run reports its result.
#[derive(Debug, Clone)]
pub struct Callback {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to read screenshot {path}: {source}")]
    Screenshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("callback request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result of one run as posted to the callback.
#[derive(Debug)]
pub struct Report<'a> {
    pub outcome: TestOutcome,
    pub log: &'a str,
    pub uploads: Option<(Platform, BTreeSet<PathBuf>)>,
}

/// Posts `report` as a multipart form. Upload parts are named after their path below `scratch`.
pub async fn post(
    client: &reqwest::Client,
    callback: &Callback,
    report: Report<'_>,
    scratch: &Path,
) -> Result<(), CallbackError> {
    let mut form = Form::new()
        .text("log", report.log.to_string())
        .text("status", report.outcome.status())
        .text("token", callback.token.clone());

    if let Some((platform, files)) = report.uploads {
        form = form.text("uploads_platform", platform.as_str());
        for path in files {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|source| CallbackError::Screenshot {
                    path: path.clone(),
                    source,
                })?;
            let name = path
                .strip_prefix(scratch)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            form = form.part("uploads", Part::bytes(data).file_name(name));
        }
    }

    client
        .post(&callback.url)
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
