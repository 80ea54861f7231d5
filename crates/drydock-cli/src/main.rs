//! drydock - build, gate, publish and roll out multi-service deployments
//!
//! ## Commands
//!
//! - `build`: start a run and build every selected service
//! - `scan`, `gate`, `push`: advance the current run by one stage
//! - `deploy`, `rollout`: apply the run to a deployment target
//! - `run`: every stage in one go
//! - `report`: print a run as Markdown or JSON
//! - `validate`: check the config file and every target's resource set
//!
//! Stage commands load the current run from the state directory, execute
//! exactly one stage and save the run again. The exit code reflects that
//! stage: 0 when every artifact succeeded, otherwise the code of the most
//! severe failure class.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Instrument, Level};

use drydock_core::config::ENV_KUBECONFIG;
use drydock_core::obs::run_span;
use drydock_core::process::{DockerBuilder, DockerRegistry, KubectlCluster, TrivyScanner};
use drydock_core::{
    capture_head_sha, exit_code, stage_exit_code, ApplyChange, ClusterControlPlane,
    ClusterCredentials, ConfigOverrides, DeploymentTarget, DrydockError, ExposureRule, ImageRef,
    JsonLinesOutcomeSink, NetworkPolicySet, OutcomeStatus, PipelineConfig, PipelineRun,
    RegistryCredentials, RunReport, RunSpan, StageKind, Trigger, WorkloadHealth,
    WorkloadManifest, DEFAULT_CONFIG_FILE,
};
use drydock_pipeline::{AbortHandle, Collaborators, PipelineController, RunStateStore, Runner};

#[derive(Parser)]
#[command(name = "drydock")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, gate, publish and roll out multi-service container deployments", long_about = None)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, env = "DRYDOCK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding persisted runs (overrides [pipeline].state_dir)
    #[arg(long, global = true, env = "DRYDOCK_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Append every stage outcome to this file as JSON lines
    #[arg(long, global = true)]
    outcomes: Option<PathBuf>,

    /// Run to operate on (default: the most recently saved run)
    #[arg(long, global = true)]
    run_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and build the selected services
    Build {
        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Scan the run's built images
    Scan,

    /// Apply the security gate to the run's scan reports
    Gate {
        #[command(flatten)]
        gate: GateArgs,
    },

    /// Push images that passed the gate
    Push,

    /// Apply the run's published images to a deployment target
    Deploy {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Restart workloads whose image changed and wait for them to be healthy
    Rollout {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Execute every stage for one revision
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        gate: GateArgs,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print a run report
    Report {
        /// Output format
        #[arg(long, value_enum, default_value_t = ReportFormat::Md)]
        format: ReportFormat,
    },

    /// Check the config file and every target's resource set
    Validate,
}

#[derive(Args, Debug, Default)]
struct TriggerArgs {
    /// Source revision (default: git HEAD next to the config file)
    #[arg(long, env = "DRYDOCK_REVISION")]
    revision: Option<String>,

    /// Comma-separated services to build (default: all configured)
    #[arg(long, value_delimiter = ',')]
    services: Vec<String>,
}

#[derive(Args, Debug, Default)]
struct GateArgs {
    /// Minimum severity that blocks an artifact (low, medium, high, critical)
    #[arg(long, env = "DRYDOCK_GATE_THRESHOLD")]
    threshold: Option<String>,

    /// Gate mode (strict or warn)
    #[arg(long, env = "DRYDOCK_GATE_MODE")]
    mode: Option<String>,
}

#[derive(Args, Debug, Default)]
struct TargetArgs {
    /// Deployment target, by name or namespace (default: the only one configured)
    #[arg(long, env = "DRYDOCK_TARGET")]
    target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    #[value(alias = "markdown")]
    Md,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    drydock_core::init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            failure_code(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Report { format } => {
            let session = Session::open(&cli)?;
            cmd_report(&session, *format)
        }
        Commands::Build { trigger } => {
            let session = Session::open(&cli)?;
            cmd_build(&session, trigger).await
        }
        Commands::Scan => {
            let session = Session::open(&cli)?;
            cmd_stage(&session, StageKind::Scan, None).await
        }
        Commands::Gate { gate } => {
            let session = Session::open(&cli)?;
            cmd_gate(session, gate).await
        }
        Commands::Push => {
            let session = Session::open(&cli)?;
            cmd_stage(&session, StageKind::Push, None).await
        }
        Commands::Deploy { target } => {
            let session = Session::open(&cli)?;
            cmd_stage(&session, StageKind::Deploy, target.target.as_deref()).await
        }
        Commands::Rollout { target } => {
            let session = Session::open(&cli)?;
            cmd_stage(&session, StageKind::Rollout, target.target.as_deref()).await
        }
        Commands::Run {
            trigger,
            gate,
            target,
        } => {
            let mut session = Session::open(&cli)?;
            session.apply_gate(gate)?;
            cmd_run(&session, trigger, target.target.as_deref()).await
        }
    }
}

/// Exit code for an error that escaped a command.
fn failure_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<DrydockError>()
        .map_or(1, |e| e.class().exit_code())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Which external systems a command reaches.
#[derive(Debug, Clone, Copy, Default)]
struct Access {
    registry: bool,
    cluster: bool,
}

impl Access {
    fn for_stage(stage: StageKind) -> Self {
        Self {
            registry: stage == StageKind::Push,
            cluster: matches!(stage, StageKind::Deploy | StageKind::Rollout),
        }
    }

    fn everything() -> Self {
        Self {
            registry: true,
            cluster: true,
        }
    }
}

/// Configuration, state store and abort switch for one invocation.
struct Session {
    config: PipelineConfig,
    store: RunStateStore,
    outcomes: Option<PathBuf>,
    run_id: Option<String>,
    abort: AbortHandle,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let mut config = PipelineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?;
        config.apply_overrides(&ConfigOverrides {
            state_dir: cli.state_dir.clone(),
            ..ConfigOverrides::default()
        })?;

        Ok(Self {
            store: RunStateStore::new(config.state_dir()),
            config,
            outcomes: cli.outcomes.clone(),
            run_id: cli.run_id.clone(),
            abort: AbortHandle::new(),
        })
    }

    /// Wire the process-backed collaborators. Credentials are read only for
    /// the systems `access` names; a missing one is a configuration error.
    fn controller(&self, access: Access) -> drydock_core::Result<PipelineController> {
        let registry_credentials = if access.registry {
            Some(RegistryCredentials::from_env()?)
        } else {
            None
        };
        let cluster: Arc<dyn ClusterControlPlane> = if access.cluster {
            Arc::new(KubectlCluster::new(ClusterCredentials::from_env()?))
        } else {
            Arc::new(NoCluster)
        };

        let collaborators = Collaborators {
            builder: Arc::new(DockerBuilder::new()),
            scanner: Arc::new(TrivyScanner::new()),
            registry: Arc::new(DockerRegistry::new(registry_credentials)),
        };
        let runner = Runner::new(cluster).with_lock_dir(self.lock_dir());
        let mut controller =
            PipelineController::new(self.config.clone(), collaborators, Arc::new(runner))
                .with_abort(self.abort.signal());
        if let Some(path) = &self.outcomes {
            controller = controller.with_sink(Arc::new(JsonLinesOutcomeSink::new(path)));
        }
        Ok(controller)
    }

    /// Per-run gate policy from `--threshold`/`--mode`.
    fn apply_gate(&mut self, gate: &GateArgs) -> drydock_core::Result<()> {
        self.config.apply_overrides(&ConfigOverrides {
            threshold: gate.threshold.clone(),
            mode: gate.mode.clone(),
            ..ConfigOverrides::default()
        })
    }

    /// Per-target lock files shared by every process using this state dir.
    fn lock_dir(&self) -> PathBuf {
        self.store.root().join("locks")
    }

    fn load_run(&self) -> drydock_core::Result<PipelineRun> {
        match &self.run_id {
            Some(id) => self.store.load(id),
            None => self.store.load_current(),
        }
    }

    fn save(&self, run: &PipelineRun) -> Result<()> {
        let path = self
            .store
            .save(run)
            .with_context(|| format!("Failed to save run {}", run.id()))?;
        info!(event = "run.saved", run_id = %run.id(), path = %path.display());
        Ok(())
    }

    fn load_target(&self, selector: Option<&str>) -> drydock_core::Result<DeploymentTarget> {
        let target = self.config.select_target(selector)?;
        self.config.load_target(target)
    }

    /// Abort the run on Ctrl-C.
    fn abort_on_interrupt(&self) {
        let handle = self.abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(event = "run.abort_requested", "interrupt received, aborting run");
                handle.abort();
            }
        });
    }

    /// End `run` on a configuration error found before its stage could start.
    fn fail_run(&self, run: &mut PipelineRun, err: &DrydockError) -> Result<i32> {
        eprintln!("error: {err}");
        if !run.status().is_terminal() {
            run.fail(err)?;
        }
        self.save(run)?;
        Ok(err.class().exit_code())
    }
}

// ---------------------------------------------------------------------------
// Cluster stand-in
// ---------------------------------------------------------------------------

/// Control plane for commands that never touch the cluster.
struct NoCluster;

impl NoCluster {
    fn unavailable<T>() -> drydock_core::Result<T> {
        Err(DrydockError::config(format!(
            "cluster access is not configured for this command (set {ENV_KUBECONFIG})"
        )))
    }
}

#[async_trait]
impl ClusterControlPlane for NoCluster {
    async fn deployed_image(&self, _: &str, _: &str) -> drydock_core::Result<Option<ImageRef>> {
        Self::unavailable()
    }

    async fn apply_workload(
        &self,
        _: &str,
        _: &WorkloadManifest,
    ) -> drydock_core::Result<ApplyChange> {
        Self::unavailable()
    }

    async fn apply_exposure(&self, _: &str, _: &ExposureRule) -> drydock_core::Result<ApplyChange> {
        Self::unavailable()
    }

    async fn network_policy(&self, _: &str) -> drydock_core::Result<NetworkPolicySet> {
        Self::unavailable()
    }

    async fn replace_network_policy(&self, _: &NetworkPolicySet) -> drydock_core::Result<()> {
        Self::unavailable()
    }

    async fn restart_workload(&self, _: &str, _: &str) -> drydock_core::Result<()> {
        Self::unavailable()
    }

    async fn workload_health(&self, _: &str, _: &str) -> drydock_core::Result<WorkloadHealth> {
        Self::unavailable()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn resolve_trigger(config: &PipelineConfig, args: &TriggerArgs) -> Result<Trigger> {
    let revision = match &args.revision {
        Some(r) => r.clone(),
        None => {
            let base = config.base_dir();
            let dir = if base.as_os_str().is_empty() {
                Path::new(".")
            } else {
                base
            };
            capture_head_sha(dir)?
        }
    };
    Ok(Trigger::new(revision, args.services.clone()).with_source("cli"))
}

/// Start a new run and execute its build stage.
async fn cmd_build(session: &Session, args: &TriggerArgs) -> Result<i32> {
    let controller = session.controller(Access::default())?;
    let trigger = resolve_trigger(&session.config, args)?;
    let mut run = controller.start(trigger)?;
    if !run.status().is_terminal() {
        session.abort_on_interrupt();
        let span = run_span(run.id());
        controller.build(&mut run).instrument(span).await?;
    }
    session.save(&run)?;
    print_stage(&run, StageKind::Build);
    Ok(stage_exit_code(&run, StageKind::Build))
}

/// Gate the current run. An invalid threshold or mode fails the run.
async fn cmd_gate(mut session: Session, gate: &GateArgs) -> Result<i32> {
    if let Err(e) = session.apply_gate(gate) {
        let mut run = session.load_run()?;
        return session.fail_run(&mut run, &e);
    }
    cmd_stage(&session, StageKind::Gate, None).await
}

/// Load the run, execute one stage, save it.
async fn cmd_stage(session: &Session, stage: StageKind, target: Option<&str>) -> Result<i32> {
    let mut run = session.load_run()?;
    let controller = match session.controller(Access::for_stage(stage)) {
        Ok(c) => c,
        Err(e) if e.class() == drydock_core::ErrorClass::Configuration => {
            return session.fail_run(&mut run, &e);
        }
        Err(e) => return Err(e.into()),
    };
    session.abort_on_interrupt();
    let span = run_span(run.id());

    match stage {
        StageKind::Scan => controller.scan(&mut run).instrument(span).await?,
        StageKind::Gate => controller.gate(&mut run).instrument(span).await?,
        StageKind::Push => controller.push(&mut run).instrument(span).await?,
        StageKind::Deploy | StageKind::Rollout => {
            let target = match session.load_target(target) {
                Ok(t) => t,
                Err(e) => return session.fail_run(&mut run, &e),
            };
            if stage == StageKind::Deploy {
                controller
                    .deploy(&mut run, &target)
                    .instrument(span)
                    .await?;
            } else {
                controller
                    .rollout(&mut run, &target)
                    .instrument(span)
                    .await?;
                controller.finish(&mut run)?;
            }
        }
        StageKind::Build => anyhow::bail!("build starts a new run; use `drydock build`"),
    }

    session.save(&run)?;
    print_stage(&run, stage);
    Ok(stage_exit_code(&run, stage))
}

/// Every stage for one revision.
async fn cmd_run(session: &Session, args: &TriggerArgs, target: Option<&str>) -> Result<i32> {
    let trigger = resolve_trigger(&session.config, args)?;
    let controller = session.controller(Access::everything())?;

    let target = match session.load_target(target) {
        Ok(t) => t,
        Err(e) => {
            let mut run = controller.start(trigger)?;
            return session.fail_run(&mut run, &e);
        }
    };

    session.abort_on_interrupt();
    let run = controller.run(trigger, &target).await?;
    session.save(&run)?;
    for exec in run.stages() {
        print_stage(&run, exec.stage);
    }
    println!("Status: {}", run.status());
    Ok(exit_code(&run))
}

fn cmd_report(session: &Session, format: ReportFormat) -> Result<i32> {
    let run = session.load_run()?;
    let _span = RunSpan::enter(run.id());
    let report = RunReport::from_run(&run);
    match format {
        ReportFormat::Md => print!("{}", report.to_markdown()),
        ReportFormat::Json => println!("{}", report.to_json()?),
    }
    Ok(0)
}

fn cmd_validate(config_path: &Path) -> Result<i32> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    println!(
        "✓ {} ({} services, {} targets)",
        config_path.display(),
        config.services.len(),
        config.targets.len()
    );
    for t in &config.targets {
        let target = config
            .load_target(t)
            .with_context(|| format!("Invalid resource set for target '{}'", t.name))?;
        println!(
            "✓ target {} ({}): {} workloads, {} exposures, {} policy rules",
            target.name,
            target.key(),
            target.resources.workloads.len(),
            target.resources.exposures.len(),
            target.resources.network_policy.len()
        );
    }
    Ok(0)
}

fn print_stage(run: &PipelineRun, stage: StageKind) {
    println!("Run: {} ({})", run.id(), run.trigger().revision);
    let Some(exec) = run.stage(stage) else {
        println!("Stage {stage}: not run ({})", run.status());
        return;
    };
    println!("Stage {stage}:");
    for o in &exec.outcomes {
        let mark = match o.status {
            OutcomeStatus::Succeeded => "✓",
            OutcomeStatus::Failed => "✗",
            OutcomeStatus::Skipped => "-",
            OutcomeStatus::Aborted => "!",
        };
        let note = o
            .failure
            .as_ref()
            .map(|f| format!(" [{}] {}", f.class, f.message))
            .or_else(|| o.detail.as_ref().map(|d| format!(" {d}")))
            .unwrap_or_default();
        println!("  {mark} {} ({} attempt(s)){note}", o.artifact, o.attempts);
    }
}
