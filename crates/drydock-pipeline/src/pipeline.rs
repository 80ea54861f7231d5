//! Pipeline orchestration: one [`PipelineRun`] per trigger.
//!
//! The controller sequences Build -> Scan -> Gate -> Push -> Deploy ->
//! Rollout. Build, scan and push fan out across artifacts; every stage
//! waits for all of its artifacts before the next one opens. An artifact
//! that fails a stage is excluded from the rest of the run while the others
//! carry on. Only a configuration error or an operator abort ends the whole
//! run early.
//!
//! Each stage is also callable on its own, so the CLI can execute one stage
//! per invocation against a persisted run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use drydock_core::obs::{
    emit_run_error, emit_run_finished, emit_run_started, emit_stage_finished, emit_stage_started,
    run_span, OutcomeSink, TracingOutcomeSink,
};
use drydock_core::{
    Attempted, DeploymentTarget, DrydockError, ErrorClass, ImageBuilder, ImageRef, ImageRegistry,
    PipelineConfig, PipelineRun, Result, RunStatus, ServiceImage, ServiceImageSpec, SkipReason,
    StageExecution, StageKind, StageOutcome, Trigger, VulnerabilityScanner, WorkloadApply,
};
use tracing::{warn, Instrument};

use crate::parallel::{fan_out, ArtifactResult};
use crate::runner::{AbortSignal, Runner, RunnerLease};
use crate::spec::resolve_services;
use crate::stages::{
    BuildStage, DeployStage, GateStage, GatedArtifact, PushStage, RolloutStage, ScanStage,
};

/// The external systems the run drives, other than the cluster (which is
/// only reachable through the [`Runner`]).
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn ImageBuilder>,
    pub scanner: Arc<dyn VulnerabilityScanner>,
    pub registry: Arc<dyn ImageRegistry>,
}

pub struct PipelineController {
    config: PipelineConfig,
    build: BuildStage,
    scan: ScanStage,
    gate: GateStage,
    push: PushStage,
    deploy: DeployStage,
    rollout: RolloutStage,
    runner: Arc<Runner>,
    sink: Arc<dyn OutcomeSink>,
    abort: AbortSignal,
}

impl PipelineController {
    pub fn new(config: PipelineConfig, collaborators: Collaborators, runner: Arc<Runner>) -> Self {
        let retry = config.retry;
        Self {
            build: BuildStage::new(collaborators.builder),
            scan: ScanStage::new(collaborators.scanner, retry),
            gate: GateStage::new(config.gate_policy()),
            push: PushStage::new(collaborators.registry, retry),
            deploy: DeployStage::new(retry),
            rollout: RolloutStage::new(
                retry,
                Duration::from_secs(config.rollout.timeout_secs),
                Duration::from_millis(config.rollout.poll_interval_ms),
            ),
            config,
            runner,
            sink: Arc::new(TracingOutcomeSink),
            abort: AbortSignal::never(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Whole run
    // -----------------------------------------------------------------------

    /// Execute every stage for `trigger` against `target` and return the
    /// terminal run. Deploy and rollout share one runner lease.
    pub async fn run(&self, trigger: Trigger, target: &DeploymentTarget) -> Result<PipelineRun> {
        let mut run = self.start(trigger)?;
        let span = run_span(run.id());

        let stages: Result<()> = async {
            if run.status().is_terminal() {
                return Ok(());
            }
            self.build(&mut run).await?;
            if run.status().is_terminal() {
                return Ok(());
            }
            self.scan(&mut run).await?;
            if run.status().is_terminal() {
                return Ok(());
            }
            self.gate(&mut run).await?;
            if run.status().is_terminal() {
                return Ok(());
            }
            self.push(&mut run).await?;

            if run.status().is_terminal() || !self.open_stage(&mut run, StageKind::Deploy)? {
                return Ok(());
            }
            let Some(lease) = self.lease(&mut run, target).await? else {
                return Ok(());
            };
            self.deploy_under(&mut run, target, &lease).await?;

            if run.status().is_terminal() || !self.open_stage(&mut run, StageKind::Rollout)? {
                return Ok(());
            }
            self.rollout_under(&mut run, target, &lease).await
        }
        .instrument(span)
        .await;
        stages?;

        self.finish(&mut run)?;
        Ok(run)
    }

    /// Create and start a run, resolving its build units. A resolution
    /// failure ends the run immediately as Failed.
    pub fn start(&self, trigger: Trigger) -> Result<PipelineRun> {
        let mut run = PipelineRun::new(trigger);
        run.start()?;

        let specs = match resolve_services(&self.config, run.trigger()) {
            Ok(specs) => specs,
            Err(e) => {
                emit_run_error(run.id(), &e);
                run.fail(&e)?;
                return Ok(run);
            }
        };
        emit_run_started(run.id(), &run.trigger().revision, specs.len());
        for spec in specs {
            run.add_artifact(spec)?;
        }
        Ok(run)
    }

    /// Close the run as Succeeded or Failed unless it already ended.
    pub fn finish(&self, run: &mut PipelineRun) -> Result<RunStatus> {
        let status = if run.status().is_terminal() {
            run.status()
        } else {
            run.finalize()?
        };
        let duration_ms = run
            .finished_at()
            .map(|end| (end - run.created_at()).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        emit_run_finished(run.id(), status, duration_ms);
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    pub async fn build(&self, run: &mut PipelineRun) -> Result<()> {
        if !self.open_stage(run, StageKind::Build)? {
            return Ok(());
        }
        let revision = run.trigger().revision.clone();
        let items: Vec<(String, ServiceImageSpec)> = run
            .artifacts()
            .filter(|a| a.is_active())
            .map(|a| (a.name().to_string(), a.spec.clone()))
            .collect();

        let stage = self.build.clone();
        let results = fan_out(items, self.max_parallel(), &self.abort, move |spec| {
            let stage = stage.clone();
            let revision = revision.clone();
            async move {
                Attempted {
                    result: stage.build(&spec, &revision).await,
                    attempts: 1,
                }
            }
        })
        .await;

        let config_error = self
            .settle(run, StageKind::Build, results, |run, name, image: ServiceImage| {
                run.artifact_mut(name)?.image = Some(image);
                Ok(())
            })
            .await?;
        self.close_stage(run, StageKind::Build, config_error)
    }

    pub async fn scan(&self, run: &mut PipelineRun) -> Result<()> {
        if !self.open_stage(run, StageKind::Scan)? {
            return Ok(());
        }
        let items: Vec<(String, ServiceImage)> = run
            .artifacts()
            .filter(|a| a.is_active())
            .filter_map(|a| a.image.clone().map(|i| (a.name().to_string(), i)))
            .collect();

        let stage = self.scan.clone();
        let results = fan_out(items, self.max_parallel(), &self.abort, move |image| {
            let stage = stage.clone();
            async move { stage.scan(&image).await }
        })
        .await;

        let config_error = self
            .settle(run, StageKind::Scan, results, |run, name, report| {
                run.artifact_mut(name)?.scan = Some(report);
                Ok(())
            })
            .await?;
        self.close_stage(run, StageKind::Scan, config_error)
    }

    pub async fn gate(&self, run: &mut PipelineRun) -> Result<()> {
        if !self.open_stage(run, StageKind::Gate)? {
            return Ok(());
        }
        let run_id = run.id().to_string();
        let reports: Vec<(String, drydock_core::ScanReport)> = run
            .artifacts()
            .filter(|a| a.is_active())
            .filter_map(|a| a.scan.clone().map(|r| (a.name().to_string(), r)))
            .collect();

        for (name, report) in reports {
            let decision = self.gate.evaluate(&run_id, &report);
            run.artifact_mut(&name)?.gate = Some(decision.clone());
            match decision.to_error() {
                None => {
                    let mut outcome = StageOutcome::succeeded(&run_id, StageKind::Gate, &name, 1);
                    if decision.blocking > 0 {
                        outcome = outcome.with_detail(format!(
                            "{} finding(s) at or above {} reported ({} mode)",
                            decision.blocking, decision.threshold, decision.mode
                        ));
                    }
                    self.record(run, outcome).await?;
                }
                Some(err) => {
                    let outcome = StageOutcome::failed(&run_id, StageKind::Gate, &name, &err, 1)
                        .with_detail(decision.render_findings().join("; "));
                    self.record(run, outcome).await?;
                    run.exclude_artifact(&name, StageKind::Gate, &err)?;
                }
            }
        }
        self.close_stage(run, StageKind::Gate, None)
    }

    pub async fn push(&self, run: &mut PipelineRun) -> Result<()> {
        if !self.open_stage(run, StageKind::Push)? {
            return Ok(());
        }
        let run_id = run.id().to_string();
        let threshold = self.config.gate_policy().threshold;
        let mut items = Vec::new();
        let mut ungated = Vec::new();
        for a in run.artifacts().filter(|a| a.is_active()) {
            let gated = match (&a.image, &a.gate) {
                (Some(image), Some(decision)) => GatedArtifact::new(image, decision),
                _ => None,
            };
            match gated {
                Some(g) => items.push((a.name().to_string(), g)),
                None => {
                    let image = a
                        .image
                        .as_ref()
                        .map_or_else(|| a.name().to_string(), |i| i.artifact.to_string());
                    let err = DrydockError::SecurityGate {
                        image,
                        threshold: a.gate.as_ref().map_or(threshold, |d| d.threshold),
                        blocking: a.gate.as_ref().map_or(0, |d| d.blocking),
                    };
                    ungated.push((a.name().to_string(), err));
                }
            }
        }
        // No passing decision for this exact image: never published.
        for (name, err) in ungated {
            let outcome = StageOutcome::failed(&run_id, StageKind::Push, &name, &err, 0)
                .with_detail("no passing gate decision for this image");
            self.record(run, outcome).await?;
            run.exclude_artifact(&name, StageKind::Push, &err)?;
        }

        let stage = self.push.clone();
        let results = fan_out(items, self.max_parallel(), &self.abort, move |artifact| {
            let stage = stage.clone();
            async move { stage.push(&artifact).await }
        })
        .await;

        let config_error = self
            .settle(run, StageKind::Push, results, |run, name, published: ImageRef| {
                run.artifact_mut(name)?.published = Some(published);
                Ok(())
            })
            .await?;
        self.close_stage(run, StageKind::Push, config_error)
    }

    /// Deploy under a freshly acquired lease for `target`.
    pub async fn deploy(&self, run: &mut PipelineRun, target: &DeploymentTarget) -> Result<()> {
        if !self.open_stage(run, StageKind::Deploy)? {
            return Ok(());
        }
        match self.lease(run, target).await? {
            Some(lease) => self.deploy_under(run, target, &lease).await,
            None => Ok(()),
        }
    }

    /// Roll out under a freshly acquired lease for `target`.
    pub async fn rollout(&self, run: &mut PipelineRun, target: &DeploymentTarget) -> Result<()> {
        if !self.open_stage(run, StageKind::Rollout)? {
            return Ok(());
        }
        match self.lease(run, target).await? {
            Some(lease) => self.rollout_under(run, target, &lease).await,
            None => Ok(()),
        }
    }

    async fn deploy_under(
        &self,
        run: &mut PipelineRun,
        target: &DeploymentTarget,
        lease: &RunnerLease,
    ) -> Result<()> {
        let run_id = run.id().to_string();
        let published: BTreeMap<String, ImageRef> = run
            .artifacts()
            .filter(|a| a.is_active())
            .filter_map(|a| a.published.clone().map(|p| (a.name().to_string(), p)))
            .collect();
        let excluded: BTreeSet<String> = run
            .artifacts()
            .filter(|a| !a.is_active())
            .map(|a| a.name().to_string())
            .collect();

        let deployed = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            result = self.deploy.deploy(lease, target, &published, &excluded) => Some(result),
        };
        let result = match deployed {
            None => return self.abort_run(run),
            Some(Ok(result)) => result,
            // Nothing was applied. Any error here ends the run.
            Some(Err(e)) => return self.close_stage(run, StageKind::Deploy, Some(e)),
        };

        for w in &result.workloads {
            let outcome = match &w.failure {
                None => StageOutcome::succeeded(&run_id, StageKind::Deploy, &w.name, w.attempts)
                    .with_detail(format!("{} ({:?})", w.desired, w.change)),
                Some(f) => StageOutcome::failed_with(
                    &run_id,
                    StageKind::Deploy,
                    &w.name,
                    f.clone(),
                    w.attempts,
                ),
            };
            self.record(run, outcome).await?;
        }
        for s in &result.skipped {
            let reason = match s.reason {
                SkipReason::ArtifactExcluded => "artifact excluded earlier in the run",
                SkipReason::NotInRun => "service not part of this run",
            };
            let outcome = StageOutcome::skipped(&run_id, StageKind::Deploy, &s.name, reason);
            self.record(run, outcome).await?;
        }
        for e in &result.exposures {
            let artifact = format!("exposure/{}", e.workload);
            let outcome = match &e.failure {
                None => StageOutcome::succeeded(&run_id, StageKind::Deploy, &artifact, 1),
                Some(f) => {
                    StageOutcome::failed_with(&run_id, StageKind::Deploy, &artifact, f.clone(), 1)
                }
            };
            self.record(run, outcome).await?;
        }
        let artifact = format!("network-policy/{}", target.namespace);
        let outcome = match &result.policy {
            drydock_core::PolicyApplyOutcome::Failed { message, restored } => {
                let err = DrydockError::PartialDeployment {
                    failed: 1,
                    total: 1,
                };
                StageOutcome::failed(&run_id, StageKind::Deploy, &artifact, &err, 1)
                    .with_detail(format!("{message} (previous rules restored: {restored})"))
            }
            other => StageOutcome::succeeded(&run_id, StageKind::Deploy, &artifact, 1)
                .with_detail(format!("{other:?}")),
        };
        self.record(run, outcome).await?;

        run.set_deployment(result)?;
        self.close_stage(run, StageKind::Deploy, None)
    }

    async fn rollout_under(
        &self,
        run: &mut PipelineRun,
        target: &DeploymentTarget,
        lease: &RunnerLease,
    ) -> Result<()> {
        let run_id = run.id().to_string();
        let workloads: Vec<WorkloadApply> = match run.deployment() {
            Some(d) if d.target != target.key() => {
                let err = DrydockError::config(format!(
                    "run deployed to {}, cannot roll out on {}",
                    d.target,
                    target.key()
                ));
                return self.close_stage(run, StageKind::Rollout, Some(err));
            }
            Some(d) => d.workloads.clone(),
            None => Vec::new(),
        };
        let (changed, unchanged): (Vec<_>, Vec<_>) =
            workloads.into_iter().partition(RolloutStage::needs_rollout);

        for w in unchanged.iter().filter(|w| w.succeeded()) {
            let reason = if w.previous.is_none() {
                "newly created"
            } else {
                "image unchanged"
            };
            let outcome = StageOutcome::skipped(&run_id, StageKind::Rollout, &w.name, reason);
            self.record(run, outcome).await?;
        }

        let rollouts = futures::future::join_all(
            changed
                .iter()
                .map(|w| self.rollout.rollout(lease, &target.namespace, w)),
        );
        let records = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            records = rollouts => Some(records),
        };
        let Some(records) = records else {
            return self.abort_run(run);
        };

        for record in records {
            let outcome = match &record.reason {
                None => StageOutcome::succeeded(&run_id, StageKind::Rollout, &record.workload, 1)
                    .with_detail(format!("{} -> {}", record.previous, record.new)),
                Some(reason) => {
                    let err = DrydockError::Rollout {
                        workload: record.workload.clone(),
                        reason: reason.clone(),
                    };
                    StageOutcome::failed(&run_id, StageKind::Rollout, &record.workload, &err, 1)
                }
            };
            self.record(run, outcome).await?;
            run.push_rollout(record)?;
        }
        self.close_stage(run, StageKind::Rollout, None)
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn max_parallel(&self) -> usize {
        self.config.pipeline.max_parallel
    }

    /// Open `stage`. Returns false (after aborting the run) if the abort
    /// signal has already fired.
    fn open_stage(&self, run: &mut PipelineRun, stage: StageKind) -> Result<bool> {
        run.begin_stage(stage)?;
        if self.abort.is_aborted() {
            self.abort_run(run)?;
            return Ok(false);
        }
        emit_stage_started(run.id(), stage, run.active_artifacts().len());
        Ok(true)
    }

    /// Close `stage`, failing the run if `run_error` is set.
    fn close_stage(
        &self,
        run: &mut PipelineRun,
        stage: StageKind,
        run_error: Option<DrydockError>,
    ) -> Result<()> {
        if self.abort.is_aborted() {
            return self.abort_run(run);
        }
        run.end_stage(stage)?;
        let failed = run.stage(stage).map_or(0, StageExecution::failed_count);
        emit_stage_finished(run.id(), stage, failed);

        if let Some(err) = run_error {
            emit_run_error(run.id(), &err);
            run.fail(&err)?;
        }
        Ok(())
    }

    fn abort_run(&self, run: &mut PipelineRun) -> Result<()> {
        warn!(event = "run.aborted", run_id = %run.id(), stage = ?run.current_stage());
        run.abort()
    }

    async fn lease(
        &self,
        run: &mut PipelineRun,
        target: &DeploymentTarget,
    ) -> Result<Option<RunnerLease>> {
        match self.runner.acquire(&target.key(), run.id(), &self.abort).await {
            Ok(lease) => Ok(Some(lease)),
            Err(DrydockError::Aborted) => {
                self.abort_run(run)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Emit the outcome to the sink and attach it to the run. A sink failure
    /// is logged and does not affect the run.
    async fn record(&self, run: &mut PipelineRun, outcome: StageOutcome) -> Result<()> {
        if let Err(e) = self.sink.record(&outcome).await {
            emit_run_error(run.id(), &e);
        }
        run.record_outcome(outcome)
    }

    /// Record fan-out results: apply successes to the run, exclude failures.
    /// Returns the first configuration error seen.
    async fn settle<T>(
        &self,
        run: &mut PipelineRun,
        stage: StageKind,
        results: Vec<ArtifactResult<T>>,
        apply: impl Fn(&mut PipelineRun, &str, T) -> Result<()>,
    ) -> Result<Option<DrydockError>> {
        let run_id = run.id().to_string();
        let mut config_error = None;

        for ArtifactResult { artifact, outcome } in results {
            let Attempted { result, attempts } = outcome;
            match result {
                Ok(value) => {
                    apply(run, &artifact, value)?;
                    let outcome = StageOutcome::succeeded(&run_id, stage, &artifact, attempts);
                    self.record(run, outcome).await?;
                }
                Err(err) => {
                    let outcome = StageOutcome::failed(&run_id, stage, &artifact, &err, attempts);
                    self.record(run, outcome).await?;
                    run.exclude_artifact(&artifact, stage, &err)?;
                    if err.class() == ErrorClass::Configuration && config_error.is_none() {
                        config_error = Some(err);
                    }
                }
            }
        }
        Ok(config_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::AbortHandle;
    use drydock_core::fakes::{FakeBuilder, FakeCluster, FakeRegistry, FakeScanner, MemoryOutcomeSink};
    use drydock_core::{GateMode, OutcomeStatus, ResourceSet, ScanFinding, Severity, WorkloadImage};

    const CONFIG: &str = r#"
[pipeline]
max_parallel = 2

[registry]
repository_prefix = "registry.local/voting"
tag = "{short_revision}"

[retry]
max_attempts = 3
backoff_base_ms = 100

[[services]]
name = "vote"
context = "vote"

[[services]]
name = "result"
context = "result"
"#;

    const RESOURCES: &str = r#"
namespace = "vote"

[[workloads]]
name = "vote"
ports = [80]
image = { service = "vote" }

[[workloads]]
name = "result"
ports = [80]
image = { service = "result" }
"#;

    const REV: &str = "3f2a9c0d1e4b5a6978c0d1e2f3a4b5c6d7e8f901";

    struct Harness {
        scanner: Arc<FakeScanner>,
        registry: Arc<FakeRegistry>,
        cluster: Arc<FakeCluster>,
        sink: Arc<MemoryOutcomeSink>,
        controller: PipelineController,
    }

    fn harness(mode: GateMode) -> Harness {
        let mut config = PipelineConfig::from_toml_str(CONFIG).unwrap();
        config.gate.mode = mode;
        let scanner = Arc::new(FakeScanner::new());
        let registry = Arc::new(FakeRegistry::new());
        let cluster = Arc::new(FakeCluster::new());
        let sink = Arc::new(MemoryOutcomeSink::new());
        let collaborators = Collaborators {
            builder: Arc::new(FakeBuilder::new()),
            scanner: scanner.clone(),
            registry: registry.clone(),
        };
        let controller =
            PipelineController::new(config, collaborators, Arc::new(Runner::new(cluster.clone())))
                .with_sink(sink.clone());
        Harness {
            scanner,
            registry,
            cluster,
            sink,
            controller,
        }
    }

    fn target() -> DeploymentTarget {
        DeploymentTarget {
            name: "production".to_string(),
            endpoint: "https://k8s.local".to_string(),
            namespace: "vote".to_string(),
            resources: ResourceSet::from_toml_str(RESOURCES).unwrap(),
        }
    }

    fn critical() -> Vec<ScanFinding> {
        vec![ScanFinding {
            severity: Severity::Critical,
            identifier: "CVE-2024-3094".to_string(),
            component: "xz-utils".to_string(),
            fixed_version: Some("5.6.2".to_string()),
        }]
    }

    #[test]
    fn test_start_with_unknown_service_fails_run() {
        let h = harness(GateMode::Strict);
        let run = h
            .controller
            .start(Trigger::new(REV, vec!["nope".to_string()]))
            .unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error().unwrap().class, ErrorClass::Configuration);
        assert_eq!(run.artifacts().count(), 0);
    }

    #[tokio::test]
    async fn test_stage_out_of_order_is_rejected() {
        let h = harness(GateMode::Strict);
        let mut run = h.controller.start(Trigger::new(REV, vec![])).unwrap();
        let err = h.controller.scan(&mut run).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert_eq!(run.status(), RunStatus::Running);
    }

    #[tokio::test]
    async fn test_strict_gate_excludes_only_the_failing_artifact() {
        let h = harness(GateMode::Strict);
        h.scanner.set_findings("registry.local/voting/result", critical());
        let mut run = h.controller.start(Trigger::new(REV, vec![])).unwrap();

        h.controller.build(&mut run).await.unwrap();
        h.controller.scan(&mut run).await.unwrap();
        h.controller.gate(&mut run).await.unwrap();
        h.controller.push(&mut run).await.unwrap();

        assert_eq!(run.active_artifacts(), vec!["vote".to_string()]);
        assert!(h.registry.was_pushed("registry.local/voting/vote"));
        assert!(!h.registry.was_pushed("registry.local/voting/result"));

        let gate = run.stage(StageKind::Gate).unwrap();
        assert_eq!(gate.failed_count(), 1);
        assert_eq!(gate.worst_class(), Some(ErrorClass::SecurityGate));
        // excluded artifacts produce no push outcome
        assert_eq!(run.stage(StageKind::Push).unwrap().outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_warn_only_gate_passes_with_detail() {
        let h = harness(GateMode::WarnOnly);
        h.scanner.set_findings("registry.local/voting/result", critical());
        let mut run = h.controller.start(Trigger::new(REV, vec![])).unwrap();

        h.controller.build(&mut run).await.unwrap();
        h.controller.scan(&mut run).await.unwrap();
        h.controller.gate(&mut run).await.unwrap();

        let outcome = run
            .stage(StageKind::Gate)
            .unwrap()
            .outcomes
            .iter()
            .find(|o| o.artifact == "result")
            .cloned()
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert!(outcome.detail.unwrap().starts_with("1 finding(s) at or above high"));
        assert_eq!(run.active_artifacts().len(), 2);
    }

    #[tokio::test]
    async fn test_every_outcome_reaches_the_sink() {
        let h = harness(GateMode::Strict);
        let run = h
            .controller
            .run(Trigger::new(REV, vec![]), &target())
            .await
            .unwrap();
        assert_eq!(run.status(), RunStatus::Succeeded);

        let recorded: usize = run.stages().iter().map(|s| s.outcomes.len()).sum();
        assert_eq!(h.sink.outcomes().len(), recorded);
        assert_eq!(run.stages().len(), 6);
    }

    #[tokio::test]
    async fn test_deploy_error_ends_the_run() {
        let h = harness(GateMode::Strict);
        let mut target = target();
        target.resources.workloads[1].image = WorkloadImage::Reference(String::new());
        let mut run = h.controller.start(Trigger::new(REV, vec![])).unwrap();

        h.controller.build(&mut run).await.unwrap();
        h.controller.scan(&mut run).await.unwrap();
        h.controller.gate(&mut run).await.unwrap();
        h.controller.push(&mut run).await.unwrap();
        h.controller.deploy(&mut run, &target).await.unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error().unwrap().class, ErrorClass::Configuration);
        assert!(run.stage(StageKind::Deploy).unwrap().finished_at.is_some());
        assert!(run.deployment().is_none());
        assert!(h.cluster.ops().is_empty());

        // the run is closed for further stages
        let err = h.controller.rollout(&mut run, &target).await.unwrap_err();
        assert!(matches!(err, DrydockError::RunFinalized(_)));
    }

    #[tokio::test]
    async fn test_abort_before_deploy_leaves_cluster_untouched() {
        let h = harness(GateMode::Strict);
        let abort = AbortHandle::new();
        let controller = h.controller.with_abort(abort.signal());
        let mut run = controller.start(Trigger::new(REV, vec![])).unwrap();

        controller.build(&mut run).await.unwrap();
        controller.scan(&mut run).await.unwrap();
        controller.gate(&mut run).await.unwrap();
        controller.push(&mut run).await.unwrap();
        abort.abort();
        controller.deploy(&mut run, &target()).await.unwrap();

        assert_eq!(run.status(), RunStatus::Aborted);
        assert!(h.cluster.ops().is_empty());
        // published images stay published
        assert!(run.artifacts().all(|a| a.published.is_some()));
    }
}
