//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use casebrief_client::{ClientOptions, HttpAnalysisClient};
use casebrief_core::{
    CaseRepository, StageCatalog, StageOrchestrator, StageProgress, StageRequest,
};
use casebrief_shared::{
    AppConfig, CaseAggregate, CaseBriefError, CaseId, OrchestratorConfig, StageDescriptor,
    StageError, expand_home, init_config, load_config, resolve_api_key,
};
use casebrief_storage::{KeyValueStore, LibsqlStore, MemoryStore};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CaseBrief: staged legal case analysis.
#[derive(Parser)]
#[command(
    name = "casebrief",
    version,
    about = "Run a legal case through a sequence of analysis stages and draft a final petition.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Case database path (overrides storage.db_path).
    #[arg(long, global = true, env = "CASEBRIEF_DB")]
    pub db: Option<PathBuf>,

    /// Keep cases in memory only; nothing is written to disk.
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// List the analysis stages.
    Stages,

    /// Run a single stage for a case.
    Run {
        /// Case name.
        #[arg(long)]
        case: String,

        /// Case identifier; takes precedence over the name when resuming.
        #[arg(long)]
        case_id: Option<CaseId>,

        /// Stage index (see `casebrief stages`).
        #[arg(long)]
        stage: usize,

        #[command(flatten)]
        input: InputArgs,

        /// The side of the dispute you represent.
        #[arg(long)]
        party_role: Option<String>,

        /// API key (defaults to the env var named in analysis.api_key_env).
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Run every stage in order, finishing with the final petition.
    RunAll {
        /// Case name.
        #[arg(long)]
        case: String,

        #[command(flatten)]
        input: InputArgs,

        /// The side of the dispute you represent.
        #[arg(long)]
        party_role: Option<String>,

        /// API key (defaults to the env var named in analysis.api_key_env).
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Inspect persisted cases.
    Cases {
        #[command(subcommand)]
        action: CasesAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Case text source.
#[derive(clap::Args)]
pub(crate) struct InputArgs {
    /// Read the case text from a file.
    #[arg(long, conflicts_with = "text")]
    pub input: Option<PathBuf>,

    /// Case text given inline.
    #[arg(long)]
    pub text: Option<String>,
}

/// Case subcommands.
#[derive(Subcommand)]
pub(crate) enum CasesAction {
    /// List all cases.
    List,
    /// Show the stage records of a case.
    Show {
        /// Case name or identifier.
        case: String,
    },
    /// Delete a case.
    Delete {
        /// Case identifier.
        id: CaseId,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "casebrief=info",
        1 => "casebrief=debug",
        _ => "casebrief=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Stages => return cmd_stages(),
        Command::Config { action } => {
            return match action {
                ConfigAction::Init => cmd_config_init(),
                ConfigAction::Show => cmd_config_show(),
            };
        }
        _ => {}
    }

    let config = load_config()?;

    if cli.ephemeral {
        info!("using in-memory case store");
        return dispatch(cli.command, &config, Arc::new(MemoryStore::new())).await;
    }

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => expand_home(&config.storage.db_path)?,
    };

    if matches!(cli.command, Command::Cases { action: CasesAction::List | CasesAction::Show { .. } }) {
        match LibsqlStore::open_readonly(&db_path).await {
            Ok(store) => dispatch(cli.command, &config, Arc::new(store)).await,
            Err(CaseBriefError::NotFound(_)) => {
                println!("No cases yet.");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    } else {
        let store = LibsqlStore::open(&db_path).await?;
        dispatch(cli.command, &config, Arc::new(store)).await
    }
}

async fn dispatch<S: KeyValueStore + 'static>(
    command: Command,
    config: &AppConfig,
    store: Arc<S>,
) -> Result<()> {
    let repository = Arc::new(CaseRepository::with_collection_key(
        store,
        config.storage.collection_key.clone(),
    ));

    match command {
        Command::Run {
            case,
            case_id,
            stage,
            input,
            party_role,
            api_key,
        } => {
            let session = Session::new(config, repository, api_key, party_role)?;
            session
                .run_one(&case, case_id, stage, &input.read(true)?)
                .await
        }
        Command::RunAll {
            case,
            input,
            party_role,
            api_key,
        } => {
            let session = Session::new(config, repository, api_key, party_role)?;
            session.run_all(&case, &input.read(false)?).await
        }
        Command::Cases { action } => match action {
            CasesAction::List => cmd_cases_list(&repository).await,
            CasesAction::Show { case } => cmd_cases_show(&repository, &case).await,
            CasesAction::Delete { id } => cmd_cases_delete(&repository, id).await,
        },
        Command::Stages | Command::Config { .. } => Ok(()),
    }
}

impl InputArgs {
    /// Case text from `--input` or `--text`. Blank text is allowed only when
    /// `optional`, leaving the emptiness check to the stage run.
    fn read(&self, optional: bool) -> Result<String> {
        match (&self.input, &self.text) {
            (Some(path), _) => std::fs::read_to_string(path)
                .map_err(|e| eyre!("cannot read input file '{}': {e}", path.display())),
            (None, Some(text)) => Ok(text.clone()),
            (None, None) if optional => Ok(String::new()),
            (None, None) => Err(eyre!("case text required: pass --input FILE or --text TEXT")),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage runs
// ---------------------------------------------------------------------------

/// One orchestrator session wired to the configured service and store.
struct Session<S> {
    orchestrator: StageOrchestrator<HttpAnalysisClient, S>,
    progress: Arc<CliProgress>,
    api_key: String,
    party_role: Option<String>,
    cancel: CancellationToken,
}

impl<S: KeyValueStore + 'static> Session<S> {
    fn new(
        config: &AppConfig,
        repository: Arc<CaseRepository<S>>,
        api_key: Option<String>,
        party_role: Option<String>,
    ) -> Result<Self> {
        let client = HttpAnalysisClient::new(
            config.analysis.endpoint.clone(),
            &ClientOptions {
                timeout_secs: config.analysis.request_timeout_secs,
            },
        )?;
        info!(endpoint = %client.endpoint(), "using analysis service");

        let progress = Arc::new(CliProgress::new());
        let orchestrator = StageOrchestrator::new(
            StageCatalog::default(),
            Arc::new(client),
            repository,
            OrchestratorConfig::from(config),
        )
        .with_progress(progress.clone());

        // Missing keys are reported by the stage run itself.
        let api_key = api_key
            .or_else(|| resolve_api_key(config))
            .unwrap_or_default();

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling stage");
                on_interrupt.cancel();
            }
        });

        Ok(Self {
            orchestrator,
            progress,
            api_key,
            party_role,
            cancel,
        })
    }

    /// Load the case's earlier results so later stages see them.
    async fn resume(&self, name: &str, case_id: Option<CaseId>) -> Result<Option<CaseId>> {
        let repository = self.orchestrator.repository();
        let existing = match case_id {
            Some(id) => match repository.get_case(id).await? {
                Some(case) => Some(case),
                None => repository.find_by_name(name).await?,
            },
            None => repository.find_by_name(name).await?,
        };

        match existing {
            Some(case) => {
                info!(case_id = %case.id, records = case.stages.len(), "resuming case");
                self.orchestrator.restore_from(&case);
                Ok(Some(case.id))
            }
            None => Ok(case_id),
        }
    }

    fn request(&self, name: &str, case_id: Option<CaseId>, stage: usize, input: &str) -> StageRequest {
        let mut request = StageRequest::new(name, stage, input, self.api_key.clone());
        request.case_id = case_id;
        request.party_role = self.party_role.clone();
        request
    }

    async fn run_one(
        &self,
        name: &str,
        case_id: Option<CaseId>,
        stage: usize,
        input: &str,
    ) -> Result<()> {
        let case_id = self.resume(name, case_id).await?;
        let outcome = self
            .orchestrator
            .run_stage(self.request(name, case_id, stage, input), &self.cancel)
            .await;
        self.progress.finish();

        let descriptor = self.orchestrator.catalog().get(stage).cloned();
        if let (Some(descriptor), Some(state)) = (descriptor, self.orchestrator.state(stage)) {
            if let Some(result) = state.result {
                print_result(&descriptor, &result);
            }
        }

        outcome.map_err(stage_failure)
    }

    async fn run_all(&self, name: &str, input: &str) -> Result<()> {
        let mut case_id = self.resume(name, None).await?;
        let catalog = self.orchestrator.catalog().clone();
        let mut unsaved = 0usize;

        for descriptor in catalog.regular() {
            let outcome = self
                .orchestrator
                .run_stage(
                    self.request(name, case_id, descriptor.index, input),
                    &self.cancel,
                )
                .await;

            match outcome {
                Ok(()) => {}
                Err(StageError::PersistenceFailure(msg)) => {
                    warn!(stage = descriptor.index, error = %msg, "stage result not saved");
                    unsaved += 1;
                }
                Err(e) => {
                    self.progress.finish();
                    return Err(stage_failure(e));
                }
            }

            if case_id.is_none() {
                case_id = self.orchestrator.repository().find_by_name(name).await?.map(|c| c.id);
            }
        }

        let terminal = catalog.terminal_index();
        let outcome = self
            .orchestrator
            .run_stage(self.request(name, case_id, terminal, input), &self.cancel)
            .await;
        self.progress.finish();
        outcome.map_err(stage_failure)?;

        for (descriptor, state) in catalog.iter().zip(self.orchestrator.states()) {
            if let Some(result) = state.result {
                print_result(descriptor, &result);
            }
        }

        if unsaved > 0 {
            println!("  Warning: {unsaved} stage result(s) could not be saved.");
        }
        if let Some(id) = case_id {
            println!("  Case ID: {id}");
        }
        Ok(())
    }
}

fn stage_failure(e: StageError) -> color_eyre::Report {
    match e {
        StageError::MissingApiKey => {
            eyre!("{e}: pass --api-key or set the variable named in analysis.api_key_env")
        }
        e if e.is_validation() => eyre!("{e}"),
        e => eyre!("analysis failed: {e}"),
    }
}

fn print_result(stage: &StageDescriptor, result: &str) {
    println!();
    println!("== {}. {} ==", stage.index, stage.title);
    println!();
    println!("{result}");
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Stage progress shown as an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl StageProgress for CliProgress {
    fn stage_started(&self, stage: &StageDescriptor) {
        self.spinner
            .set_message(format!("[{}] {}: analyzing", stage.index, stage.title));
    }

    fn stage_revealed(&self, stage: &StageDescriptor, _result: &str) {
        self.spinner
            .set_message(format!("[{}] {}: done", stage.index, stage.title));
    }

    fn stage_persisted(&self, stage: &StageDescriptor, case_id: CaseId) {
        self.spinner
            .println(format!("  ✓ {} saved to case {case_id}", stage.title));
    }

    fn stage_failed(&self, stage: &StageDescriptor, error: &StageError) {
        self.spinner
            .println(format!("  ✗ {}: {error}", stage.title));
    }
}

// ---------------------------------------------------------------------------
// Other commands
// ---------------------------------------------------------------------------

fn cmd_stages() -> Result<()> {
    let catalog = StageCatalog::default();
    for stage in catalog.iter() {
        let marker = if catalog.is_terminal(stage.index) {
            " (final)"
        } else {
            ""
        };
        println!("  {:>2}  {}{marker}", stage.index, stage.title);
    }
    Ok(())
}

async fn cmd_cases_list<S: KeyValueStore>(repository: &CaseRepository<S>) -> Result<()> {
    let cases = repository.list_cases().await?;
    if cases.is_empty() {
        println!("No cases yet.");
        return Ok(());
    }

    for case in &cases {
        println!(
            "  {}  {:<30}  {:>2} records  {}",
            case.id,
            case.name,
            case.stages.len(),
            case.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_cases_show<S: KeyValueStore>(repository: &CaseRepository<S>, case: &str) -> Result<()> {
    let found = match case.parse::<CaseId>() {
        Ok(id) => repository.get_case(id).await?,
        Err(_) => repository.find_by_name(case).await?,
    };
    let case: CaseAggregate = found.ok_or_else(|| eyre!("no case named or identified by '{case}'"))?;

    println!("  ID:      {}", case.id);
    println!("  Name:    {}", case.name);
    println!("  Created: {}", case.created_at.to_rfc3339());
    println!("  Records: {}", case.stages.len());

    for record in &case.stages {
        println!();
        println!(
            "== {}. {} ({}) ==",
            record.stage_index,
            record.stage_title,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
        println!("{}", record.output);
    }
    Ok(())
}

async fn cmd_cases_delete<S: KeyValueStore>(repository: &CaseRepository<S>, id: CaseId) -> Result<()> {
    if repository.delete_case(id).await? {
        println!("Deleted case {id}");
        Ok(())
    } else {
        Err(eyre!("no case with id {id}"))
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
