//! Stage orchestration for one case-analysis session.
//!
//! A [`StageOrchestrator`] owns the observable per-stage state of a session
//! and drives single stage runs: precondition checks, context assembly, the
//! analysis call (bounded by a deadline and cancellable), the reveal delay,
//! and persistence of regular-stage results into the case repository.
//!
//! Different stages may run concurrently; the same stage may not.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use casebrief_client::{AnalysisClient, AnalysisRequest};
use casebrief_shared::{
    AnalysisStageRecord, CaseAggregate, CaseId, OrchestratorConfig, StageDescriptor, StageError,
};
use casebrief_storage::KeyValueStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::StageCatalog;
use crate::context;
use crate::repository::{CaseKey, CaseRepository};

// ---------------------------------------------------------------------------
// Observable state
// ---------------------------------------------------------------------------

/// Observable state of one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageState {
    /// A run of this stage is in flight.
    pub loading: bool,
    /// Outcome of the last failed run (or the persistence failure of a successful one).
    pub error: Option<StageError>,
    /// Analysis text of the last successful run.
    pub result: Option<String>,
    /// The result has passed its reveal delay.
    pub revealed: bool,
}

/// Lifecycle position derived from a [`StageState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Idle,
    Loading,
    /// Result received, reveal delay pending.
    Revealing,
    /// Result shown. `error` may still be set by a failed save or by a later
    /// re-run that failed its preconditions.
    Revealed,
    Failed,
}

impl StageState {
    pub fn phase(&self) -> StagePhase {
        // A result outranks `loading`, which stays set through the reveal
        // delay and the persistence write.
        match (&self.result, self.revealed, self.loading, &self.error) {
            (Some(_), true, _, _) => StagePhase::Revealed,
            (Some(_), false, _, _) => StagePhase::Revealing,
            (None, _, true, _) => StagePhase::Loading,
            (None, _, false, Some(_)) => StagePhase::Failed,
            (None, _, false, None) => StagePhase::Idle,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters of one stage run.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Human-entered case name; legacy merge key for persistence.
    pub case_name: String,
    /// Stable case identifier, preferred over the name when present.
    pub case_id: Option<CaseId>,
    pub stage_index: usize,
    /// Case text. Ignored by the precondition check of the terminal stage.
    pub input: String,
    pub api_key: String,
    pub party_role: Option<String>,
}

impl StageRequest {
    pub fn new(
        case_name: impl Into<String>,
        stage_index: usize,
        input: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            case_name: case_name.into(),
            case_id: None,
            stage_index,
            input: input.into(),
            api_key: api_key.into(),
            party_role: None,
        }
    }

    pub fn with_case_id(mut self, case_id: CaseId) -> Self {
        self.case_id = Some(case_id);
        self
    }

    pub fn with_party_role(mut self, party_role: impl Into<String>) -> Self {
        self.party_role = Some(party_role.into());
        self
    }

    fn case_key(&self) -> CaseKey {
        match self.case_id {
            Some(id) => CaseKey::Id {
                id,
                name: self.case_name.clone(),
            },
            None => CaseKey::Name(self.case_name.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Callbacks for stage lifecycle events.
pub trait StageProgress: Send + Sync {
    /// Preconditions passed and the analysis call is about to be made.
    fn stage_started(&self, stage: &StageDescriptor);
    /// The result passed its reveal delay.
    fn stage_revealed(&self, stage: &StageDescriptor, result: &str);
    /// The result was recorded under `case_id`.
    fn stage_persisted(&self, stage: &StageDescriptor, case_id: CaseId);
    /// The run ended with `error`.
    fn stage_failed(&self, stage: &StageDescriptor, error: &StageError);
}

/// No-op stage progress.
pub struct SilentStageProgress;

impl StageProgress for SilentStageProgress {
    fn stage_started(&self, _stage: &StageDescriptor) {}
    fn stage_revealed(&self, _stage: &StageDescriptor, _result: &str) {}
    fn stage_persisted(&self, _stage: &StageDescriptor, _case_id: CaseId) {}
    fn stage_failed(&self, _stage: &StageDescriptor, _error: &StageError) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct SessionState {
    stages: Vec<StageState>,
    /// Bumped by `reset`; runs started under an older generation stop writing state.
    generation: u64,
    /// Cancelled by `reset`.
    cancel: CancellationToken,
}

impl SessionState {
    fn new(count: usize) -> Self {
        Self {
            stages: vec![StageState::default(); count],
            generation: 0,
            cancel: CancellationToken::new(),
        }
    }
}

/// Drives stage runs for one case-analysis session.
pub struct StageOrchestrator<C, S> {
    catalog: StageCatalog,
    client: Arc<C>,
    repository: Arc<CaseRepository<S>>,
    config: OrchestratorConfig,
    progress: Arc<dyn StageProgress>,
    state: Mutex<SessionState>,
}

impl<C: AnalysisClient, S: KeyValueStore> StageOrchestrator<C, S> {
    pub fn new(
        catalog: StageCatalog,
        client: Arc<C>,
        repository: Arc<CaseRepository<S>>,
        config: OrchestratorConfig,
    ) -> Self {
        let state = Mutex::new(SessionState::new(catalog.count()));
        Self {
            catalog,
            client,
            repository,
            config,
            progress: Arc::new(SilentStageProgress),
            state,
        }
    }

    /// Report lifecycle events to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn StageProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn repository(&self) -> &Arc<CaseRepository<S>> {
        &self.repository
    }

    /// Snapshot of every stage's state, in index order.
    pub fn states(&self) -> Vec<StageState> {
        self.lock().stages.clone()
    }

    pub fn state(&self, index: usize) -> Option<StageState> {
        self.lock().stages.get(index).cloned()
    }

    /// Current result slots, in index order.
    pub fn results(&self) -> Vec<Option<String>> {
        self.lock().stages.iter().map(|s| s.result.clone()).collect()
    }

    /// All persisted cases.
    pub async fn cases(&self) -> casebrief_shared::Result<Vec<CaseAggregate>> {
        self.repository.list_cases().await
    }

    /// Start over for a new case: cancel in-flight runs and clear all state.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.cancel.cancel();
        state.cancel = CancellationToken::new();
        state.generation += 1;
        state.stages = vec![StageState::default(); self.catalog.count()];
        info!(generation = state.generation, "session reset");
    }

    /// Seed result slots from a persisted case so later stages see its outputs.
    ///
    /// The most recently completed record wins for each stage. Stages that are
    /// currently running are left untouched.
    pub fn restore_from(&self, case: &CaseAggregate) {
        let mut state = self.lock();
        let mut restored = 0;
        for record in case.latest_by_stage() {
            if let Some(slot) = state.stages.get_mut(record.stage_index) {
                if slot.loading {
                    continue;
                }
                *slot = StageState {
                    loading: false,
                    error: None,
                    result: Some(record.output.clone()),
                    revealed: true,
                };
                restored += 1;
            }
        }
        debug!(case_id = %case.id, restored, "restored stage results");
    }

    /// Run one stage, writing its progress into the session state.
    ///
    /// The returned error is the one written into the stage's `error` slot,
    /// except for `UnknownStage` and `AlreadyRunning`, which leave state alone.
    #[instrument(skip_all, fields(case = %request.case_name, stage = request.stage_index))]
    pub async fn run_stage(
        &self,
        request: StageRequest,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let index = request.stage_index;
        let stage = self
            .catalog
            .get(index)
            .cloned()
            .ok_or(StageError::UnknownStage(index))?;
        let is_final = self.catalog.is_terminal(index);

        let (generation, session_cancel, previous_summaries) =
            self.begin(&request, is_final)?;
        let _loading = LoadingGuard {
            state: &self.state,
            generation,
            index,
        };

        self.progress.stage_started(&stage);
        info!(
            title = %stage.title,
            is_final,
            context_items = previous_summaries.len(),
            context_chars = context::total_chars(&previous_summaries),
            "stage started"
        );

        let analysis_request = AnalysisRequest {
            input_text: request.input.clone(),
            stage_index: index,
            api_key: request.api_key.clone(),
            previous_summaries,
            party_role: request.party_role.clone(),
            is_final,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            _ = session_cancel.cancelled() => Err(StageError::Cancelled),
            reply = tokio::time::timeout(
                self.config.request_timeout,
                self.client.submit(&analysis_request),
            ) => reply.unwrap_or(Err(StageError::Timeout)),
        };

        let text = match outcome {
            Ok(text) => text,
            Err(e) => {
                self.update(generation, index, |s| s.error = Some(e.clone()));
                warn!(error = %e, "stage failed");
                self.progress.stage_failed(&stage, &e);
                return Err(e);
            }
        };

        self.update(generation, index, |s| s.result = Some(text.clone()));
        tokio::time::sleep(self.config.reveal_delay).await;
        self.update(generation, index, |s| s.revealed = true);
        self.progress.stage_revealed(&stage, &text);

        if is_final {
            info!(chars = text.chars().count(), "final synthesis completed");
            return Ok(());
        }

        let record = AnalysisStageRecord::new(&stage, request.input.clone(), text);
        match self.repository.append_stage(&request.case_key(), record).await {
            Ok(case_id) => {
                info!(%case_id, "stage completed and persisted");
                self.progress.stage_persisted(&stage, case_id);
                Ok(())
            }
            Err(e) => {
                let err = StageError::PersistenceFailure(e.to_string());
                self.update(generation, index, |s| s.error = Some(err.clone()));
                warn!(error = %e, "stage result not persisted");
                self.progress.stage_failed(&stage, &err);
                Err(err)
            }
        }
    }

    /// Check preconditions and move the stage into `Loading`.
    ///
    /// Returns the session generation, the session cancel token, and the
    /// context for the analysis request.
    fn begin(
        &self,
        request: &StageRequest,
        is_final: bool,
    ) -> Result<(u64, CancellationToken, Vec<String>), StageError> {
        let index = request.stage_index;
        let mut state = self.lock();

        if state.stages[index].loading {
            return Err(StageError::AlreadyRunning(index));
        }

        let priors: Vec<Option<String>> =
            state.stages.iter().map(|s| s.result.clone()).collect();

        // An earlier result stays visible; later stages may depend on it.
        if let Err(e) = check_preconditions(request, is_final, &priors) {
            debug!(error = %e, "stage precondition failed");
            state.stages[index].error = Some(e.clone());
            return Err(e);
        }

        let previous_summaries = if is_final {
            context::collect_prior(&priors, index)
        } else {
            context::accumulate(&priors, index, self.config.max_context_chars)
        };

        state.stages[index] = StageState {
            loading: true,
            error: None,
            result: None,
            revealed: false,
        };

        Ok((state.generation, state.cancel.clone(), previous_summaries))
    }

    /// Apply `f` to a stage's state unless the session was reset since `generation`.
    fn update(&self, generation: u64, index: usize, f: impl FnOnce(&mut StageState)) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(index, "session reset during run, state update dropped");
            return false;
        }
        f(&mut state.stages[index]);
        true
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Validate a request in the fixed order: API key, prior output, input text.
fn check_preconditions(
    request: &StageRequest,
    is_final: bool,
    priors: &[Option<String>],
) -> Result<(), StageError> {
    if request.api_key.trim().is_empty() {
        return Err(StageError::MissingApiKey);
    }
    if is_final {
        if context::collect_prior(priors, request.stage_index).is_empty() {
            return Err(StageError::NoPriorStagesCompleted);
        }
    } else if request.input.trim().is_empty() {
        return Err(StageError::EmptyInput);
    }
    Ok(())
}

/// Clears a stage's `loading` flag when the run ends, including when the
/// run's future is dropped mid-flight.
struct LoadingGuard<'a> {
    state: &'a Mutex<SessionState>,
    generation: u64,
    index: usize,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock_state(self.state);
        if state.generation == self.generation {
            state.stages[self.index].loading = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
