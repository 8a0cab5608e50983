//! JSON wire format of the analysis endpoint and response classification.

use casebrief_shared::StageError;
use serde::{Deserialize, Serialize};

use crate::AnalysisRequest;

/// `stageIndex` value that marks the terminal synthesis on the wire.
pub const FINAL_STAGE_WIRE_INDEX: i64 = -1;

/// Substring of a service error message that signals throttling.
const RATE_LIMIT_MARKER: &str = "429";

/// Request body sent to the analysis endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRequest<'a> {
    pub text: &'a str,
    pub stage_index: i64,
    pub api_key: &'a str,
    pub previous_summaries: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_petition: Option<bool>,
}

impl<'a> From<&'a AnalysisRequest> for WireRequest<'a> {
    fn from(request: &'a AnalysisRequest) -> Self {
        let stage_index = if request.is_final {
            FINAL_STAGE_WIRE_INDEX
        } else {
            // Catalogs are tiny; an index never approaches i64::MAX.
            request.stage_index as i64
        };

        Self {
            text: &request.input_text,
            stage_index,
            api_key: &request.api_key,
            previous_summaries: &request.previous_summaries,
            party_role: request.party_role.as_deref(),
            final_petition: request.is_final.then_some(true),
        }
    }
}

/// Response body; success carries `analysis`, failure carries `error`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Classify an HTTP status and body into an analysis result.
pub(crate) fn classify(status: u16, body: &str) -> Result<String, StageError> {
    // Unparseable bodies (HTML error pages, empty bodies) fall through as "no message".
    let parsed: WireResponse = serde_json::from_str(body).unwrap_or_default();
    let success = (200..300).contains(&status);

    if success && parsed.error.is_none() {
        return match parsed.analysis {
            Some(text) => Ok(text),
            None => Err(StageError::service(Some(
                "the analysis service returned no analysis",
            ))),
        };
    }

    classify_failure(status, parsed.error.as_deref())
}

/// Map a failed response to the rate-limit or service error variant.
pub(crate) fn classify_failure(status: u16, message: Option<&str>) -> Result<String, StageError> {
    let throttled = status == 429 || message.is_some_and(|m| m.contains(RATE_LIMIT_MARKER));
    if throttled {
        Err(StageError::RateLimited)
    } else {
        Err(StageError::service(message))
    }
}
