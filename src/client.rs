//! Job orchestration: submission, polling, and whole-task retry.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;
use crate::error::{ApiError, is_retryable};
use crate::http::{HttpClient, PredictionApi, backoff, pause};
use crate::prediction::{Input, Job, Prediction, RunOutput, Status};

/// Per-call overrides for [`Client::run`]. Unset fields fall back to the
/// client's [`ApiConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Wall-clock budget for one attempt, measured from its submission.
    /// `None` polls until the job finishes.
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
    /// Let the server block until the job is done instead of polling.
    pub sync_mode: bool,
    /// Whole-task restarts after a retryable failure.
    pub max_retries: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

/// Client for the prediction service.
///
/// Construct one per application and share it; concurrent calls only share
/// the underlying connection pool.
#[derive(Clone)]
pub struct Client<A = HttpClient> {
    api: A,
    config: ApiConfig,
}

impl Client<HttpClient> {
    /// Creates a client talking HTTP to `config.base_url`.
    /// Fails with [`ApiError::Configuration`] when no API key is set.
    pub fn new(config: ApiConfig) -> Result<Self> {
        let api = HttpClient::from_config(&config)?;
        Ok(Self { api, config })
    }

    /// Creates a client from the `WAVESPEED_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ApiConfig::from_env())
    }
}

impl<A: PredictionApi> Client<A> {
    /// Creates a client on top of any [`PredictionApi`] implementation.
    pub fn with_api(api: A, config: ApiConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Runs `model` on `input` and waits for its outputs.
    ///
    /// Each attempt submits a fresh job. Attempts failing for a retryable
    /// reason (connection loss, poll timeout, HTTP 5xx or 429) are restarted
    /// from scratch up to `max_retries` times, waiting
    /// `retry_interval * attempt` in between. Any other failure, including a
    /// prediction the service reports as failed, is returned at once.
    #[tracing::instrument(skip(self, input, options))]
    pub async fn run(&self, model: &str, input: &Input, options: &RunOptions) -> Result<RunOutput> {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let attempts = max_retries.saturating_add(1);
        let cancel = options.cancel.clone().unwrap_or_else(CancellationToken::new);
        let mut attempt: u32 = 0;

        loop {
            let e = match self.run_once(model, input, options, &cancel).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            if !is_retryable(&e) {
                debug!("{}: non-retryable error: {}", model, e);
                return Err(e);
            }
            if attempt + 1 >= attempts {
                return Err(e);
            }

            let delay = backoff(self.config.retry_interval, attempt);
            warn!(
                "Task attempt {}/{} failed: {}. Retrying in {:.2}s...",
                attempt + 1,
                attempts,
                e,
                delay.as_secs_f64()
            );
            pause(delay, &cancel).await?;
            attempt += 1;
        }
    }

    /// One submit-and-wait attempt.
    async fn run_once(
        &self,
        model: &str,
        input: &Input,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let started = Instant::now();
        let poll_interval = options.poll_interval.unwrap_or(self.config.poll_interval);
        let mut job = Job::new(model, input, options.sync_mode);

        let submitted = within_budget(
            started,
            options.timeout,
            None,
            self.api.submit(job.model(), job.input(), options.timeout, cancel),
        )
        .await?;
        job.record(submitted)?;

        if options.sync_mode {
            return match job.status() {
                Status::Completed => Ok(job.into_output()),
                _ => Err(job.failure().into()),
            };
        }

        let id = job
            .id()
            .map(str::to_string)
            .ok_or_else(|| ApiError::InvalidResponse("No request ID in submit response".to_string()))?;
        info!("Submitted prediction {} for {}", id, model);

        loop {
            if let Some(limit) = options.timeout {
                if started.elapsed() >= limit {
                    return Err(ApiError::PredictionTimeout { id, timeout: limit }.into());
                }
            }

            let prediction = within_budget(
                started,
                options.timeout,
                Some(id.as_str()),
                self.api.fetch_result(&id, cancel),
            )
            .await?;
            job.record(prediction)?;

            match job.status() {
                Status::Completed => {
                    info!("Prediction {} completed", id);
                    return Ok(job.into_output());
                }
                Status::Failed => return Err(job.failure().into()),
                status => debug!("Prediction {} is {:?}", id, status),
            }

            pause(poll_interval, cancel).await?;
        }
    }

    /// Submits a job without waiting for it. Connection failures are retried;
    /// nothing else is.
    #[tracing::instrument(skip(self, input))]
    pub async fn submit(&self, model: &str, input: &Input, sync_mode: bool) -> Result<Prediction> {
        let job = Job::new(model, input, sync_mode);
        self.api
            .submit(job.model(), job.input(), None, &CancellationToken::new())
            .await
    }

    /// Fetches the current state of a submitted job once.
    #[tracing::instrument(skip(self))]
    pub async fn get_result(&self, id: &str) -> Result<Prediction> {
        self.api.fetch_result(id, &CancellationToken::new()).await
    }

    /// Uploads a local file and returns its download URL.
    pub async fn upload(&self, path: impl AsRef<Path>, timeout: Option<Duration>) -> Result<String> {
        self.upload_with_cancel(path.as_ref(), timeout, &CancellationToken::new())
            .await
    }

    /// [`Client::upload`] with a caller-supplied cancellation token.
    ///
    /// The file is checked before anything is sent. Uploads are retried on
    /// connection failures only; there is no task-level retry.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn upload_with_cancel(
        &self,
        path: &Path,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(ApiError::FileNotFound(path.to_path_buf()).into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiError::FileNotFound(path.to_path_buf()).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect {}", path.display()));
            }
        }

        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let url = self
            .api
            .upload_binary(&file_name, contents, timeout, cancel)
            .await?;
        info!("Uploaded {} to {}", path.display(), url);
        Ok(url)
    }
}

/// Awaits `call` for whatever is left of an attempt's budget. Running out
/// abandons the call, connection retries included, as a poll timeout.
async fn within_budget<T, F>(
    started: Instant,
    timeout: Option<Duration>,
    id: Option<&str>,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(limit) = timeout else {
        return call.await;
    };
    match tokio::time::timeout(limit.saturating_sub(started.elapsed()), call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::PredictionTimeout {
            id: id.unwrap_or("unknown").to_string(),
            timeout: limit,
        }
        .into()),
    }
}
