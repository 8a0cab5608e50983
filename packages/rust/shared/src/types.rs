//! Core domain types for CaseBrief case analyses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CaseId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for case identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub Uuid);

impl CaseId {
    /// Generate a new time-sortable case identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CaseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// StageDescriptor
// ---------------------------------------------------------------------------

/// One entry of the stage catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Position in the catalog; the last index is the terminal synthesis.
    pub index: usize,
    /// Display title, also stored on every record produced by this stage.
    pub title: String,
}

// ---------------------------------------------------------------------------
// AnalysisStageRecord
// ---------------------------------------------------------------------------

/// A durable record of one successful stage run. Never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStageRecord {
    /// Unique record identifier (UUID v7).
    pub id: String,
    pub stage_index: usize,
    pub stage_title: String,
    /// The case text the stage was run against.
    pub input: String,
    /// The analysis text returned by the service.
    pub output: String,
    pub created_at: DateTime<Utc>,
}

impl AnalysisStageRecord {
    /// Create a record stamped with a fresh id and the current time.
    pub fn new(
        stage: &StageDescriptor,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            stage_index: stage.index,
            stage_title: stage.title.clone(),
            input: input.into(),
            output: output.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// CaseAggregate
// ---------------------------------------------------------------------------

/// All persisted stage records of one case.
///
/// `stages` only ever grows by append, in completion order (not stage order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseAggregate {
    pub id: CaseId,
    /// Human-entered case name; also the legacy merge key.
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: Vec<AnalysisStageRecord>,
}

impl CaseAggregate {
    /// Create an empty aggregate.
    pub fn new(id: CaseId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            created_at: Utc::now(),
            stages: Vec::new(),
        }
    }

    /// The most recently completed record for each stage index, in index order.
    pub fn latest_by_stage(&self) -> Vec<&AnalysisStageRecord> {
        let mut latest: std::collections::BTreeMap<usize, &AnalysisStageRecord> =
            std::collections::BTreeMap::new();
        for record in &self.stages {
            latest.insert(record.stage_index, record);
        }
        latest.into_values().collect()
    }
}
