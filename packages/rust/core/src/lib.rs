//! Stage orchestration and case persistence for CaseBrief.
//!
//! This crate ties together the stage catalog, prior-context assembly, the
//! analysis client, and the case repository into single stage runs
//! (see [`StageOrchestrator::run_stage`]).

pub mod catalog;
pub mod context;
pub mod orchestrator;
pub mod repository;

pub use catalog::StageCatalog;
pub use orchestrator::{
    SilentStageProgress, StageOrchestrator, StagePhase, StageProgress, StageRequest, StageState,
};
pub use repository::{CaseKey, CaseRepository, DEFAULT_COLLECTION_KEY};
