//! The fixed, ordered list of analysis stages.
//!
//! Indices `0..count()-1` are regular stages; the last index is the terminal
//! synthesis that drafts the final petition from everything before it.

use casebrief_shared::StageDescriptor;

/// Titles of the built-in pipeline, in run order. The last is terminal.
const DEFAULT_STAGE_TITLES: [&str; 13] = [
    "Case Summary",
    "Parties and Roles",
    "Chronology of Events",
    "Legal Issues",
    "Applicable Legislation",
    "Relevant Precedents",
    "Evidence Assessment",
    "Procedural Requirements",
    "Jurisdiction and Limitation Periods",
    "Strengths and Weaknesses",
    "Opposing Arguments",
    "Strategy Recommendations",
    "Final Petition",
];

/// Read-only ordered stage list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCatalog {
    stages: Vec<StageDescriptor>,
}

impl StageCatalog {
    /// Build a catalog from titles in run order; the last title is terminal.
    ///
    /// Returns `None` for an empty list, since a catalog needs a terminal stage.
    pub fn new<I, S>(titles: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stages: Vec<StageDescriptor> = titles
            .into_iter()
            .enumerate()
            .map(|(index, title)| StageDescriptor {
                index,
                title: title.into(),
            })
            .collect();

        (!stages.is_empty()).then_some(Self { stages })
    }

    /// Number of stages, terminal included.
    pub fn count(&self) -> usize {
        self.stages.len()
    }

    pub fn get(&self, index: usize) -> Option<&StageDescriptor> {
        self.stages.get(index)
    }

    /// True iff `index` is the terminal synthesis stage.
    pub fn is_terminal(&self, index: usize) -> bool {
        index + 1 == self.count()
    }

    pub fn terminal_index(&self) -> usize {
        self.count() - 1
    }

    /// The regular (non-terminal) stages in order.
    pub fn regular(&self) -> &[StageDescriptor] {
        &self.stages[..self.terminal_index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter()
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGE_TITLES
                .iter()
                .enumerate()
                .map(|(index, title)| StageDescriptor {
                    index,
                    title: (*title).to_string(),
                })
                .collect(),
        }
    }
}
