//! Adapter over the container daemon's HTTP API.
//!
//! [`ContainerDaemon`] is the capability surface the rest of the cache
//! programs against: a liveness wait, image inspection, tar export/import
//! streams, and a subscription to image-pull events. [`DockerDaemon`] is
//! the production implementation speaking the Docker Engine API
//! (`/_ping`, `/images/{name}/json`, `/images/{name}/get`, `/images/load`,
//! `/events`); tests substitute their own implementation.
//!
//! Transport failures surface as [`CacheError::DaemonUnavailable`] or
//! [`CacheError::DaemonCallFailed`]; a not-found on inspect is a value
//! (`Ok(None)`), not an error.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::{CacheError, Result};
use crate::scratch::ScratchFile;

/// Byte stream of an image export tar, as produced by the daemon.
pub type DumpStream = Box<dyn AsyncRead + Send + Unpin>;

/// One observed image pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullEvent {
    pub image_id: String,
    pub image_name: String,
}

/// Capability surface over the container daemon.
#[async_trait]
pub trait ContainerDaemon: Send + Sync {
    /// Poll the daemon's liveness probe at 1 Hz until it answers, the
    /// timeout elapses ([`CacheError::DaemonNotReady`]) or the token is
    /// cancelled ([`CacheError::Cancelled`]).
    async fn wait_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Current image id for a name, or `None` when the daemon does not
    /// know the image.
    async fn inspect(&self, image_name: &str) -> Result<Option<String>>;

    /// Whether the daemon currently holds `image_name` at exactly
    /// `expected_id`.
    async fn contains_same_version(&self, image_name: &str, expected_id: &str) -> Result<bool> {
        Ok(matches!(self.inspect(image_name).await?, Some(id) if id == expected_id))
    }

    /// Open a streaming tar export of the image.
    async fn save_dump(&self, image_name: &str) -> Result<DumpStream>;

    /// Feed a recomposed image tar into the daemon.
    async fn load_dump(&self, dump: ScratchFile) -> Result<()>;

    /// Subscribe to image-pull events. The channel yields one event per
    /// pull and closes when the subscription ends; dropping the receiver
    /// cancels it.
    async fn subscribe_pulls(&self) -> Result<mpsc::Receiver<PullEvent>>;
}

/// Server-side filter selecting image-pull events only.
const PULL_FILTERS: &str = r#"{"type":["image"],"event":["pull"]}"#;

#[derive(Debug, Deserialize)]
struct ImageInspect {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(rename = "Type")]
    event_type: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: EventActor,
}

#[derive(Debug, Deserialize)]
struct EventActor {
    /// For image events this is the image reference itself.
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct LoadStatus {
    error: Option<String>,
}

/// First error message in a load-endpoint response body (a stream of JSON
/// status lines).
fn find_load_error(body: &str) -> Option<String> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| {
            serde_json::from_str::<LoadStatus>(line)
                .ok()
                .and_then(|status| status.error)
        })
}

/// Docker Engine API implementation of [`ContainerDaemon`].
#[derive(Debug, Clone)]
pub struct DockerDaemon {
    http: reqwest::Client,
    endpoint: String,
}

impl DockerDaemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint,
        }
    }

    /// Connect using the environment's daemon endpoint convention.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(DaemonConfig::from_env()?))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}

async fn inspect_image(
    http: &reqwest::Client,
    endpoint: &str,
    image_name: &str,
) -> Result<Option<String>> {
    let url = format!("{endpoint}/images/{image_name}/json");
    let resp = http.get(url).send().await?;
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        Ok(None)
    } else if status.is_success() {
        let inspect: ImageInspect = resp.json().await?;
        Ok(Some(inspect.id))
    } else {
        Err(CacheError::DaemonCallFailed(format!(
            "inspecting '{image_name}': status {status}"
        )))
    }
}

#[async_trait]
impl ContainerDaemon for DockerDaemon {
    async fn wait_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        info!("waiting for the daemon at {}", self.endpoint);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.http.get(self.url("/_ping")).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("daemon has been found");
                    return Ok(());
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CacheError::DaemonNotReady(timeout));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    async fn inspect(&self, image_name: &str) -> Result<Option<String>> {
        inspect_image(&self.http, &self.endpoint, image_name).await
    }

    async fn save_dump(&self, image_name: &str) -> Result<DumpStream> {
        let resp = self
            .http
            .get(self.url(&format!("/images/{image_name}/get")))
            .send()
            .await?
            .error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn load_dump(&self, dump: ScratchFile) -> Result<()> {
        // The deletion guard rides inside the stream so the temp file
        // outlives the upload and is unlinked afterwards.
        let (file, guard) = dump.into_parts();
        let file = tokio::fs::File::from_std(file);
        let stream = ReaderStream::new(file).map(move |chunk| {
            let _ = &guard;
            chunk
        });

        let resp = self
            .http
            .post(self.url("/images/load"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?;

        let body = resp.text().await?;
        if let Some(message) = find_load_error(&body) {
            return Err(CacheError::DaemonCallFailed(message));
        }
        Ok(())
    }

    async fn subscribe_pulls(&self) -> Result<mpsc::Receiver<PullEvent>> {
        let resp = self
            .http
            .get(self.url("/events"))
            .query(&[("filters", PULL_FILTERS)])
            .send()
            .await?
            .error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        let mut lines = StreamReader::new(stream).lines();

        let (tx, rx) = mpsc::channel(16);
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("event stream error: {err}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event: EventMessage = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("skipping malformed event: {err}");
                        continue;
                    }
                };
                if event.event_type != "image" || event.action != "pull" {
                    continue;
                }

                let image_name = event.actor.id;
                info!("image '{image_name}' has been used");
                // A failed inspect skips the event, it does not end the
                // subscription.
                let image_id = match inspect_image(&http, &endpoint, &image_name).await {
                    Ok(Some(id)) => id,
                    Ok(None) => {
                        warn!("inspecting '{image_name}': image not found");
                        continue;
                    }
                    Err(err) => {
                        warn!("inspecting '{image_name}': {err}");
                        continue;
                    }
                };
                if tx.send(PullEvent { image_id, image_name }).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
