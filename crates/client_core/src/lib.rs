use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use reqwest::{Client, Response};
use shared::{
    domain::JobId,
    error::ApiException,
    protocol::{CancelResponse, JobRequest, StatusReport},
};
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

pub mod form;
pub mod job;
pub mod reducer;
pub mod request;
pub mod status;
pub mod stream;

pub use form::{FieldStore, Form, FormController, FormError, MemoryFieldStore};
pub use job::{drive, run_job, JobObserver, JobOutcome, JobTracker};
pub use reducer::{reduce, FailureAlert, JobView, Thumbnail};
pub use stream::{decode_events, EventStream, StreamError};

const CANCEL_JOB_PATH: &str = "job/cancel";
const CANCEL_PATH: &str = "cancel";
const STATUS_PATH: &str = "status";

/// HTTP client for the generation server.
#[derive(Clone, Debug)]
pub struct DreamClient {
    http: Client,
    base_url: Url,
}

impl DreamClient {
    pub fn new(server_url: &str) -> Result<Self> {
        Self::with_http(Client::new(), server_url)
    }

    pub fn with_http(http: Client, server_url: &str) -> Result<Self> {
        let mut base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves a server-relative path such as `job/image?uuid=...`.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to resolve '{path}' against {}", self.base_url))
    }

    /// Posts the job and returns its event stream. Every event carrying a job
    /// id is recorded in `tracker` as it is read.
    pub async fn submit(
        &self,
        action: &str,
        request: &JobRequest,
        tracker: &JobTracker,
    ) -> Result<EventStream> {
        let url = self.endpoint(action)?;
        let response = self
            .http
            .post(url.clone())
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to submit job to {url}"))?;
        let response = ensure_success(response).await?;
        info!(%url, "job: stream opened");

        let tracker = tracker.clone();
        let events = decode_events(response.bytes_stream()).inspect(move |item| {
            if let Ok(event) = item {
                if let Some(job_id) = &event.uuid {
                    tracker.record(job_id);
                }
            }
        });
        Ok(events.boxed())
    }

    /// Fire-and-forget cancel. Failures are logged, never surfaced.
    pub fn cancel(&self, job_id: Option<JobId>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            match client.request_cancel(job_id.as_ref()).await {
                Ok(response) => info!(job_id = ?job_id, status = %response.status, "job: cancel sent"),
                Err(err) => error!(job_id = ?job_id, error = %err, "job: cancel request failed"),
            }
        })
    }

    pub async fn request_cancel(&self, job_id: Option<&JobId>) -> Result<CancelResponse> {
        let request = match job_id {
            Some(job_id) => self
                .http
                .get(self.endpoint(CANCEL_JOB_PATH)?)
                .query(&[("uuid", job_id.as_str())]),
            None => self.http.get(self.endpoint(CANCEL_PATH)?),
        };
        let response = ensure_success(request.send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let response = self.http.get(self.endpoint(STATUS_PATH)?).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiException::from_body(status.as_u16(), &body).into())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
