//! Transport boundary to the external analysis service.
//!
//! One [`AnalysisClient::submit`] call is one outbound request. The client
//! classifies the outcome into a [`StageError`] and never retries; retry is
//! left to whoever triggered the stage.

mod wire;

use std::future::Future;
use std::time::Duration;

use casebrief_shared::{CaseBriefError, Result, StageError};
use reqwest::Client;
use tracing::{debug, instrument, warn};
use url::Url;

pub use wire::FINAL_STAGE_WIRE_INDEX;

/// Default timeout in seconds for a single analysis call.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// User-Agent string for analysis requests.
const USER_AGENT: &str = concat!("CaseBrief/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Everything needed for one analysis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Case text entered by the user.
    pub input_text: String,
    /// Catalog index of the stage being run.
    pub stage_index: usize,
    pub api_key: String,
    /// Prior stage outputs, oldest first.
    pub previous_summaries: Vec<String>,
    /// The side of the dispute the user represents, if given.
    pub party_role: Option<String>,
    /// True only for the terminal synthesis stage.
    pub is_final: bool,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// A service that turns an [`AnalysisRequest`] into analysis text.
pub trait AnalysisClient: Send + Sync {
    /// Perform a single call. `Ok` carries the analysis text.
    fn submit(
        &self,
        request: &AnalysisRequest,
    ) -> impl Future<Output = std::result::Result<String, StageError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Configuration for [`HttpAnalysisClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// [`AnalysisClient`] that POSTs JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpAnalysisClient {
    client: Client,
    endpoint: Url,
}

impl HttpAnalysisClient {
    /// Build a client for `endpoint`.
    pub fn new(endpoint: Url, opts: &ClientOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(opts.timeout_secs))
            .build()
            .map_err(|e| CaseBriefError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }

    /// The endpoint requests are sent to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl AnalysisClient for HttpAnalysisClient {
    #[instrument(skip_all, fields(stage = request.stage_index, is_final = request.is_final))]
    async fn submit(&self, request: &AnalysisRequest) -> std::result::Result<String, StageError> {
        let body = wire::WireRequest::from(request);
        debug!(
            summaries = request.previous_summaries.len(),
            input_chars = request.input_text.chars().count(),
            "sending analysis request"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;

        let result = wire::classify(status, &text);
        if let Err(e) = &result {
            warn!(status, error = %e, "analysis request failed");
        }
        result
    }
}

/// Map a reqwest error raised before a full response was read.
fn transport_error(e: reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::Timeout
    } else {
        StageError::ConnectionFailure(e.to_string())
    }
}
