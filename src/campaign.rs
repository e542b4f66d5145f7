//! Feature lifecycle: setup, assess and teardown chains over a shared context.
//!
//! A [`Campaign`] runs its prerequisites, then every selected [`Feature`] in
//! declared order, then the prerequisites' finish steps. Teardown of a feature
//! runs exactly once whenever the feature started, whatever happened in setup
//! or assess, and uses its own cancellation token so that one interrupt still
//! lets the cluster be cleaned up.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::{Context, TeardownRegistry};
use crate::error::{Error, Result};
use crate::selection::Selector;

/// Exit code when every selected feature passed
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when a feature or a prerequisite failed
pub const EXIT_FAILURE: i32 = 1;
/// Exit code after an interrupt (128 + SIGINT)
pub const EXIT_INTERRUPTED: i32 = 130;

type StepFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, Result<Context>> + Send>;

/// The unit of work that may change cluster state
pub struct Step {
    name: String,
    run: StepFn,
    deadline: Option<Duration>,
    abort_on_failure: bool,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Context>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |ctx| run(ctx).boxed()),
            deadline: None,
            abort_on_failure: false,
        }
    }

    /// Bound the whole step, including every wait it performs
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop the remaining assess steps when this one fails
    pub fn abort_on_failure(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn execute(self, ctx: Context) -> Result<Context> {
        let cancel = ctx.cancel_token().clone();
        let name = self.name;
        let (ctx, limit) = match self.deadline {
            Some(limit) => (ctx.with_deadline(Instant::now() + limit), Some(limit)),
            None => (ctx, None),
        };
        let started = Instant::now();
        let run = (self.run)(ctx);

        let bounded = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                    Err(Error::Timeout {
                        what: format!("step '{name}'"),
                        elapsed: started.elapsed(),
                        last_observation: "step deadline exceeded".to_string(),
                    })
                }),
                None => run.await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled(format!("step '{name}' interrupted"))),
            result = bounded => result,
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("deadline", &self.deadline)
            .field("abort_on_failure", &self.abort_on_failure)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prerequisite,
    Setup,
    Assess,
    Teardown,
    Finish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prerequisite => write!(f, "prerequisite"),
            Phase::Setup => write!(f, "setup"),
            Phase::Assess => write!(f, "assess"),
            Phase::Teardown => write!(f, "teardown"),
            Phase::Finish => write!(f, "finish"),
        }
    }
}

/// Named group of steps selectable by labels
#[derive(Debug)]
pub struct Feature {
    name: String,
    labels: BTreeMap<String, String>,
    setup: Vec<Step>,
    assess: Vec<Step>,
    teardown: Vec<Step>,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            setup: Vec::new(),
            assess: Vec::new(),
            teardown: Vec::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn setup(mut self, step: Step) -> Self {
        self.setup.push(step);
        self
    }

    pub fn assess(mut self, step: Step) -> Self {
        self.assess.push(step);
        self
    }

    pub fn teardown(mut self, step: Step) -> Self {
        self.teardown.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Step names per phase, for listings
    pub fn outline(&self) -> Vec<(Phase, &str)> {
        let mut outline = Vec::new();
        for (phase, steps) in [
            (Phase::Setup, &self.setup),
            (Phase::Assess, &self.assess),
            (Phase::Teardown, &self.teardown),
        ] {
            outline.extend(steps.iter().map(|s| (phase, s.name())));
        }
        outline
    }
}

/// Campaign-wide setup shared by the features of a suite
#[derive(Debug)]
pub struct Prerequisite {
    name: String,
    setup: Vec<Step>,
    finish: Vec<Step>,
}

impl Prerequisite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: Vec::new(),
            finish: Vec::new(),
        }
    }

    pub fn setup(mut self, step: Step) -> Self {
        self.setup.push(step);
        self
    }

    pub fn finish(mut self, step: Step) -> Self {
        self.finish.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of one feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    /// Never started: interrupted or prerequisites failed first
    Skipped,
    Interrupted,
}

impl Outcome {
    pub fn tag(&self) -> &'static str {
        match self {
            Outcome::Passed => "PASS",
            Outcome::Failed => "FAIL",
            Outcome::Skipped => "SKIP",
            Outcome::Interrupted => "INTR",
        }
    }
}

/// A step that returned an error
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub phase: Phase,
    pub step: String,
    pub kind: String,
    pub message: String,
}

impl StepFailure {
    fn new(phase: Phase, step: &str, error: &Error) -> Self {
        Self {
            phase,
            step: step.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureReport {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub outcome: Outcome,
    #[serde(serialize_with = "serialize_seconds")]
    pub duration: Duration,
    pub failures: Vec<StepFailure>,
    pub warnings: Vec<String>,
}

impl FeatureReport {
    fn skipped(feature: &Feature) -> Self {
        Self {
            name: feature.name.clone(),
            labels: feature.labels.clone(),
            outcome: Outcome::Skipped,
            duration: Duration::ZERO,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// `PASS  job-pi  [suite=jobs]  12.4s`
    pub fn summary_line(&self) -> String {
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!(
            "{}  {}  [{}]  {:.1}s",
            self.outcome.tag(),
            self.name,
            labels.join(","),
            self.duration.as_secs_f64()
        )
    }
}

fn serialize_seconds<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64((d.as_secs_f64() * 10.0).round() / 10.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub name: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub prerequisite_failures: Vec<StepFailure>,
    pub features: Vec<FeatureReport>,
    pub warnings: Vec<String>,
    pub interrupted: bool,
}

impl CampaignReport {
    pub fn passed(&self) -> bool {
        self.prerequisite_failures.is_empty()
            && self.features.iter().all(|f| f.outcome == Outcome::Passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.passed() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.features.iter().filter(|f| f.outcome == outcome).count()
    }
}

/// Prerequisites plus features, run in declared order
#[derive(Debug)]
pub struct Campaign {
    name: String,
    prerequisites: Vec<Prerequisite>,
    features: Vec<Feature>,
}

impl Campaign {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prerequisites: Vec::new(),
            features: Vec::new(),
        }
    }

    /// Add a prerequisite unless one with the same name is already present
    pub fn prerequisite(mut self, prerequisite: Prerequisite) -> Self {
        if self
            .prerequisites
            .iter()
            .all(|p| p.name != prerequisite.name)
        {
            self.prerequisites.push(prerequisite);
        }
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn prerequisites(&self) -> &[Prerequisite] {
        &self.prerequisites
    }

    /// Keep only the features the selector accepts
    pub fn select(mut self, selector: &Selector) -> Result<Self> {
        let mut selected = Vec::with_capacity(self.features.len());
        for feature in self.features {
            if selector.matches(&feature.name, &feature.labels)? {
                selected.push(feature);
            }
        }
        self.features = selected;
        Ok(self)
    }

    /// Run everything.
    ///
    /// `ctx` carries the root cancellation token; `teardown_cancel` only stops
    /// teardown and finish steps.
    pub async fn run(self, ctx: Context, teardown_cancel: CancellationToken) -> CampaignReport {
        let started_at = chrono::Utc::now();
        let mut report = CampaignReport {
            name: self.name.clone(),
            started_at,
            prerequisite_failures: Vec::new(),
            features: Vec::with_capacity(self.features.len()),
            warnings: Vec::new(),
            interrupted: false,
        };

        info!(
            "Starting campaign {} ({} feature(s), {} prerequisite(s))",
            self.name,
            self.features.len(),
            self.prerequisites.len()
        );

        // prerequisites: first failure stops the chain, entered ones get finished
        let mut ctx = ctx;
        let mut finishes: Vec<(String, Vec<Step>)> = Vec::new();
        let mut prerequisites_ok = true;
        'prerequisites: for prerequisite in self.prerequisites {
            finishes.push((prerequisite.name.clone(), prerequisite.finish));
            for step in prerequisite.setup {
                let name = format!("{}: {}", prerequisite.name, step.name);
                info!("Prerequisite {}", name);
                match step.execute(ctx.clone()).await {
                    Ok(next) => ctx = next,
                    Err(e) => {
                        error!("Prerequisite {} failed: {}", name, e);
                        report
                            .prerequisite_failures
                            .push(StepFailure::new(Phase::Prerequisite, &name, &e));
                        prerequisites_ok = false;
                        break 'prerequisites;
                    }
                }
            }
        }

        for feature in self.features {
            if !prerequisites_ok || ctx.is_cancelled() {
                report.features.push(FeatureReport::skipped(&feature));
                continue;
            }
            let feature_report = run_feature(feature, &ctx, &teardown_cancel).await;
            info!("{}", feature_report.summary_line());
            report.features.push(feature_report);
        }

        let finish_ctx = ctx.with_cancel(teardown_cancel.clone());
        for (prerequisite, steps) in finishes.into_iter().rev() {
            for step in steps {
                let name = format!("{}: {}", prerequisite, step.name);
                if let Err(e) = step.execute(finish_ctx.clone()).await {
                    warn!("Finish step {} failed: {}", name, e);
                    report.warnings.push(format!("{name}: {e}"));
                }
            }
        }

        report.interrupted = ctx.is_cancelled();
        report
    }
}

async fn run_feature(
    feature: Feature,
    base: &Context,
    teardown_cancel: &CancellationToken,
) -> FeatureReport {
    let registry = TeardownRegistry::default();
    let mut ctx = base.with_teardown(registry.clone());
    let started = Instant::now();
    let mut failures = Vec::new();
    let mut warnings = Vec::new();
    let mut interrupted = false;

    info!("=== {} ===", feature.name);

    let mut setup_ok = true;
    for step in feature.setup {
        let name = step.name.clone();
        match step.execute(ctx.clone()).await {
            Ok(next) => ctx = next,
            Err(e) => {
                error!("{}: setup '{}' failed: {}", feature.name, name, e);
                interrupted |= e.is_cancelled();
                failures.push(StepFailure::new(Phase::Setup, &name, &e));
                setup_ok = false;
                break;
            }
        }
    }

    if setup_ok {
        for step in feature.assess {
            if ctx.is_cancelled() {
                interrupted = true;
                break;
            }
            let name = step.name.clone();
            let abort = step.abort_on_failure;
            match step.execute(ctx.clone()).await {
                Ok(next) => ctx = next,
                Err(e) => {
                    error!("{}: assess '{}' failed: {}", feature.name, name, e);
                    failures.push(StepFailure::new(Phase::Assess, &name, &e));
                    if e.is_cancelled() {
                        interrupted = true;
                        break;
                    }
                    if abort {
                        warn!("{}: '{}' aborts the remaining assessments", feature.name, name);
                        break;
                    }
                }
            }
        }
    }

    let teardown_ctx = ctx.with_cancel(teardown_cancel.clone());
    for step in feature.teardown {
        let name = step.name.clone();
        if let Err(e) = step.execute(teardown_ctx.clone()).await {
            warn!("{}: teardown '{}' failed: {}", feature.name, name, e);
            warnings.push(format!("{name}: {e}"));
        }
    }

    if base.config().cleanup.should_cleanup() {
        let client = teardown_ctx.client().ok();
        for warning in registry.drain(client, teardown_cancel).await {
            warnings.push(warning.to_string());
        }
    } else {
        for resource in registry.resources().await {
            warn!("{}: leaving {} in the cluster (--no-cleanup)", feature.name, resource);
            warnings.push(format!("kept {resource} (--no-cleanup)"));
        }
    }

    let outcome = if interrupted || base.is_cancelled() {
        Outcome::Interrupted
    } else if failures.is_empty() {
        Outcome::Passed
    } else {
        Outcome::Failed
    };

    FeatureReport {
        name: feature.name,
        labels: feature.labels,
        outcome,
        duration: started.elapsed(),
        failures,
        warnings,
    }
}

/// Tokens controlling a run: the root token stops setup and assess work, the
/// teardown token stops cleanup.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    pub root: CancellationToken,
    pub teardown: CancellationToken,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// First CTRL-C cancels the root token, the second abandons teardown, the
    /// third exits immediately.
    pub fn install(&self) -> tokio::task::JoinHandle<()> {
        let interrupts = self.clone();
        tokio::spawn(async move {
            let mut count = 0;
            loop {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("Error setting up signal handler: {}", err);
                    return;
                }
                count += 1;
                match count {
                    1 => {
                        warn!("Received interrupt signal (CTRL-C), tearing down started features");
                        interrupts.root.cancel();
                    }
                    2 => {
                        warn!("Second interrupt, skipping remaining teardown");
                        interrupts.teardown.cancel();
                    }
                    _ => std::process::exit(EXIT_INTERRUPTED),
                }
            }
        })
    }
}
